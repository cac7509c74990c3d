use crate::protocol::{
    DeviceDescriptor, LinearCmd, Message, MessageId, RotateCmd, RotationSubcommand, ScalarCmd,
    ScalarSubcommand, VectorSubcommand,
};
use crate::registry::MessageKind;
use crate::session::{Session, SessionError};
use crate::transport::Transport;
use crate::waveform::{self, Waveform};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use uuid::Uuid;

const STOPPED_CHANNEL_CAPACITY: usize = 64;

/// Outbound path the scheduler drives. Commands are fire-and-forget.
pub trait CommandSink {
    fn send_command(&mut self, message: Message) -> Result<MessageId, SessionError>;
}

impl<T: Transport> CommandSink for Session<T> {
    fn send_command(&mut self, message: Message) -> Result<MessageId, SessionError> {
        self.send_request(message, None)
    }
}

/// Device command with one varying field that a pattern overwrites.
#[derive(Debug, Clone, PartialEq)]
pub enum CommandTemplate {
    /// `Scalar` on every subcommand.
    Scalar(Vec<ScalarSubcommand>),
    /// `Position` on every subcommand.
    Linear(Vec<VectorSubcommand>),
    /// `Speed` on every subcommand.
    Rotate(Vec<RotationSubcommand>),
}

impl CommandTemplate {
    pub fn vibrate(motors: u32) -> Self {
        Self::Scalar(
            (0..motors.max(1))
                .map(|index| ScalarSubcommand {
                    index,
                    scalar: 0.0,
                    actuator_type: "Vibrate".to_string(),
                })
                .collect(),
        )
    }

    /// Template driving every actuator of the first command family the
    /// device advertises, preferring scalar over rotate over linear.
    /// Linear moves are timed to land on the next update.
    pub fn for_device(device: &DeviceDescriptor, update_period: Duration) -> Option<Self> {
        let messages = &device.device_messages;
        let scalars = messages.actuators(MessageKind::ScalarCmd);
        if !scalars.is_empty() {
            return Some(Self::Scalar(
                scalars
                    .iter()
                    .zip(0u32..)
                    .map(|(attrs, index)| ScalarSubcommand {
                        index,
                        scalar: 0.0,
                        actuator_type: attrs.actuator_type.clone(),
                    })
                    .collect(),
            ));
        }
        let rotators = messages.actuators(MessageKind::RotateCmd);
        if !rotators.is_empty() {
            return Some(Self::Rotate(
                (0u32..)
                    .take(rotators.len())
                    .map(|index| RotationSubcommand {
                        index,
                        speed: 0.0,
                        clockwise: true,
                    })
                    .collect(),
            ));
        }
        let linears = messages.actuators(MessageKind::LinearCmd);
        if !linears.is_empty() {
            let duration = u32::try_from(update_period.as_millis()).unwrap_or(u32::MAX);
            return Some(Self::Linear(
                (0u32..)
                    .take(linears.len())
                    .map(|index| VectorSubcommand {
                        index,
                        duration,
                        position: 0.0,
                    })
                    .collect(),
            ));
        }
        None
    }

    pub fn render(&self, device_index: u32, value: f64) -> Message {
        match self {
            Self::Scalar(scalars) => Message::ScalarCmd(ScalarCmd {
                id: 0,
                device_index,
                scalars: scalars
                    .iter()
                    .map(|sub| ScalarSubcommand {
                        scalar: value,
                        ..sub.clone()
                    })
                    .collect(),
            }),
            Self::Linear(vectors) => Message::LinearCmd(LinearCmd {
                id: 0,
                device_index,
                vectors: vectors
                    .iter()
                    .map(|sub| VectorSubcommand {
                        position: value,
                        ..sub.clone()
                    })
                    .collect(),
            }),
            Self::Rotate(rotations) => Message::RotateCmd(RotateCmd {
                id: 0,
                device_index,
                rotations: rotations
                    .iter()
                    .map(|sub| RotationSubcommand {
                        speed: value,
                        ..sub.clone()
                    })
                    .collect(),
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandStopped {
    pub id: Uuid,
    pub device_index: u32,
}

/// Time-bounded device command fed by a waveform. Times are seconds.
struct ManagedCommand {
    id: Uuid,
    device_index: u32,
    template: CommandTemplate,
    waveform: Arc<dyn Waveform>,
    duration: f64,
    update_period: f64,
    elapsed: f64,
    since_last_update: f64,
    active: bool,
}

impl ManagedCommand {
    fn advance(&mut self, delta: f64, sink: &mut dyn CommandSink) -> bool {
        if !self.active {
            return false;
        }
        self.elapsed += delta;
        self.since_last_update += delta;

        if self.elapsed >= self.duration {
            self.active = false;
            send_stop(sink, self.device_index);
            return true;
        }

        if self.since_last_update >= self.update_period {
            let value = waveform::sample_looped(self.waveform.as_ref(), self.elapsed);
            let message = self.template.render(self.device_index, value);
            if let Err(err) = sink.send_command(message) {
                tracing::debug!(command = %self.id, device_index = self.device_index, error = %err, "pattern update not sent");
            }
            self.since_last_update = 0.0;
        }
        false
    }
}

fn send_stop(sink: &mut dyn CommandSink, device_index: u32) {
    if let Err(err) = sink.send_command(Message::stop_device(device_index)) {
        tracing::debug!(device_index, error = %err, "device stop not sent");
    }
}

/// Owns every live managed command and advances them on a shared tick.
pub struct PatternScheduler {
    commands: Vec<ManagedCommand>,
    stopped_tx: broadcast::Sender<CommandStopped>,
}

impl Default for PatternScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl PatternScheduler {
    pub fn new() -> Self {
        let (stopped_tx, _stopped_rx) = broadcast::channel(STOPPED_CHANNEL_CAPACITY);
        Self {
            commands: Vec::new(),
            stopped_tx,
        }
    }

    pub fn subscribe_stopped(&self) -> broadcast::Receiver<CommandStopped> {
        self.stopped_tx.subscribe()
    }

    /// Registers a pattern; the first update goes out once a full update
    /// period has elapsed.
    pub fn start_pattern(
        &mut self,
        device_index: u32,
        template: CommandTemplate,
        waveform: Arc<dyn Waveform>,
        duration: Duration,
        update_period: Duration,
    ) -> Uuid {
        let id = Uuid::new_v4();
        tracing::info!(
            command = %id,
            device_index,
            duration_ms = duration.as_millis() as u64,
            update_period_ms = update_period.as_millis() as u64,
            "pattern started"
        );
        self.commands.push(ManagedCommand {
            id,
            device_index,
            template,
            waveform,
            duration: duration.as_secs_f64(),
            update_period: update_period.as_secs_f64(),
            elapsed: 0.0,
            since_last_update: 0.0,
            active: true,
        });
        id
    }

    pub fn tick(&mut self, delta: Duration, sink: &mut dyn CommandSink) {
        let delta = delta.as_secs_f64();
        let mut finished = Vec::new();
        for command in self.commands.iter_mut() {
            if command.advance(delta, sink) {
                finished.push(CommandStopped {
                    id: command.id,
                    device_index: command.device_index,
                });
            }
        }
        self.commands.retain(|command| command.active);
        for stopped in finished {
            tracing::info!(command = %stopped.id, device_index = stopped.device_index, "pattern finished");
            self.notify(stopped);
        }
    }

    /// Stops one command and its device. Returns false for unknown ids.
    pub fn stop_command(&mut self, id: Uuid, notify: bool, sink: &mut dyn CommandSink) -> bool {
        let Some(pos) = self.commands.iter().position(|command| command.id == id) else {
            return false;
        };
        let command = self.commands.remove(pos);
        send_stop(sink, command.device_index);
        tracing::info!(command = %id, device_index = command.device_index, "pattern stopped");
        if notify {
            self.notify(CommandStopped {
                id,
                device_index: command.device_index,
            });
        }
        true
    }

    pub fn stop_device(&mut self, device_index: u32, sink: &mut dyn CommandSink) -> usize {
        let ids: Vec<Uuid> = self
            .commands
            .iter()
            .filter(|command| command.device_index == device_index)
            .map(|command| command.id)
            .collect();
        for id in &ids {
            self.stop_command(*id, true, sink);
        }
        ids.len()
    }

    /// Stops everything without notifications, one stop per device.
    pub fn stop_all(&mut self, sink: &mut dyn CommandSink) -> usize {
        let count = self.commands.len();
        let devices: BTreeSet<u32> = self
            .commands
            .drain(..)
            .map(|command| command.device_index)
            .collect();
        for device_index in devices {
            send_stop(sink, device_index);
        }
        if count > 0 {
            tracing::info!(count, "all patterns stopped");
        }
        count
    }

    /// Forgets every command without touching devices, for a session that
    /// is already gone.
    pub fn clear(&mut self) -> usize {
        let count = self.commands.len();
        self.commands.clear();
        count
    }

    pub fn active_count(&self) -> usize {
        self.commands.len()
    }

    pub fn is_active(&self, id: Uuid) -> bool {
        self.commands.iter().any(|command| command.id == id)
    }

    fn notify(&self, stopped: CommandStopped) {
        // No receivers is fine.
        let _ = self.stopped_tx.send(stopped);
    }
}
