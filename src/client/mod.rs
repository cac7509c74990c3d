use crate::config::Config;
use crate::protocol::{DeviceDescriptor, Message, MessageId, ServerInfo};
use crate::scheduler::{CommandStopped, CommandTemplate, PatternScheduler};
use crate::session::{
    DisconnectReason, EventKind, Session, SessionConfig, SessionError, SessionEvent,
    SessionState, SubscriptionId,
};
use crate::transport::{TransportEventReceiver, WsTransport};
use crate::waveform::Waveform;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use uuid::Uuid;

type SharedSession = Arc<Mutex<Session<WsTransport>>>;
type SharedScheduler = Arc<Mutex<PatternScheduler>>;

/// Coarse connection progress, as seen by `wait_ready`.
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionStatus {
    Idle,
    Connecting,
    Ready(ServerInfo),
    Failed(String),
    Closed(DisconnectReason),
}

/// Events for a set of kinds, merged into one stream. Dropping the stream
/// removes its subscriptions from the session.
pub struct EventStream {
    ids: Vec<SubscriptionId>,
    rx: mpsc::UnboundedReceiver<SessionEvent>,
    session: Weak<Mutex<Session<WsTransport>>>,
}

impl EventStream {
    pub async fn recv(&mut self) -> Option<SessionEvent> {
        self.rx.recv().await
    }

    pub fn ids(&self) -> &[SubscriptionId] {
        &self.ids
    }
}

impl Drop for EventStream {
    fn drop(&mut self) {
        let Some(session) = self.session.upgrade() else {
            return;
        };
        let mut session = lock(&session);
        for id in self.ids.drain(..) {
            session.unsubscribe(id);
        }
    }
}

/// Async handle over a [`Session`] and a [`PatternScheduler`], driven by a
/// background task that feeds transport events in and ticks both.
///
/// Locks are always taken scheduler first, then session. Subscribers and
/// response handlers run with the session locked and must not call back
/// into the client.
pub struct ButtplugClient {
    session: SharedSession,
    scheduler: SharedScheduler,
    status_tx: Arc<watch::Sender<ConnectionStatus>>,
    status_rx: watch::Receiver<ConnectionStatus>,
    shutdown_tx: watch::Sender<bool>,
    driver: Option<JoinHandle<()>>,
}

impl ButtplugClient {
    /// Must be called from within a tokio runtime.
    pub fn spawn(config: SessionConfig, tick_interval: Duration) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let mut session = Session::new(config, WsTransport::new(events_tx));

        let (status_tx, status_rx) = watch::channel(ConnectionStatus::Idle);
        let status_tx = Arc::new(status_tx);
        track_status(&mut session, &status_tx);

        let session = Arc::new(Mutex::new(session));
        let scheduler = Arc::new(Mutex::new(PatternScheduler::new()));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let driver = tokio::spawn(drive(
            session.clone(),
            scheduler.clone(),
            events_rx,
            tick_interval.max(Duration::from_millis(1)),
            shutdown_rx,
        ));

        Self {
            session,
            scheduler,
            status_tx,
            status_rx,
            shutdown_tx,
            driver: Some(driver),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::spawn(
            SessionConfig {
                address: config.server.url(),
                client_name: config.client.name.clone(),
                message_version: config.client.message_version,
            },
            config.scheduler.tick_interval(),
        )
    }

    /// Starts a connection attempt. Reconnecting a live client first stops
    /// its patterns, since device indices do not survive the old session.
    pub fn connect(&self) -> Result<(), SessionError> {
        let mut scheduler = lock(&self.scheduler);
        let mut session = lock(&self.session);
        if session.state() == SessionState::Ready {
            scheduler.stop_all(&mut *session);
        } else {
            scheduler.clear();
        }
        // An implicit teardown inside `connect` publishes `Closed`; the
        // lock keeps the new attempt's events behind this update.
        session.connect()?;
        self.status_tx.send_replace(ConnectionStatus::Connecting);
        Ok(())
    }

    /// Resolves once the handshake completes, or fails as soon as the
    /// attempt does.
    pub async fn wait_ready(&self, timeout: Duration) -> Result<ServerInfo, SessionError> {
        let mut rx = self.status_rx.clone();
        let wait = async move {
            loop {
                let status = rx.borrow_and_update().clone();
                match status {
                    ConnectionStatus::Ready(info) => return Ok(info),
                    ConnectionStatus::Failed(reason) => {
                        return Err(SessionError::ConnectionFailed(reason))
                    }
                    ConnectionStatus::Closed(reason) => {
                        return Err(SessionError::ConnectionFailed(reason.to_string()))
                    }
                    ConnectionStatus::Idle => return Err(SessionError::NotConnected),
                    ConnectionStatus::Connecting => {}
                }
                if rx.changed().await.is_err() {
                    return Err(SessionError::Cancelled);
                }
            }
        };
        tokio::time::timeout(timeout, wait)
            .await
            .map_err(|_| SessionError::Timeout)?
    }

    pub async fn connect_and_wait(&self, timeout: Duration) -> Result<ServerInfo, SessionError> {
        self.connect()?;
        self.wait_ready(timeout).await
    }

    /// Stops running patterns, then tears the session down.
    pub fn disconnect(&self) {
        let mut scheduler = lock(&self.scheduler);
        let mut session = lock(&self.session);
        if session.state() == SessionState::Ready {
            scheduler.stop_all(&mut *session);
        } else {
            scheduler.clear();
        }
        session.disconnect();
    }

    pub fn state(&self) -> SessionState {
        lock(&self.session).state()
    }

    pub fn status(&self) -> ConnectionStatus {
        self.status_rx.borrow().clone()
    }

    /// Fire-and-forget send.
    pub fn send(&self, message: Message) -> Result<MessageId, SessionError> {
        lock(&self.session).send_request(message, None)
    }

    /// Sends `message` and awaits whatever terminal response echoes its id.
    /// An `Error` reply is a normal result here.
    pub async fn request(&self, message: Message) -> Result<Message, SessionError> {
        let (tx, rx) = oneshot::channel();
        lock(&self.session).send_request(
            message,
            Some(Box::new(move |reply: Message| {
                let _ = tx.send(reply);
            })),
        )?;
        // Dropped senders mean the pending table was cleared.
        rx.await.map_err(|_| SessionError::Cancelled)
    }

    pub fn subscribe(&self, kinds: &[EventKind]) -> EventStream {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut session = lock(&self.session);
        let ids = kinds
            .iter()
            .map(|kind| {
                let tx = tx.clone();
                session.subscribe(*kind, move |event| {
                    let _ = tx.send(event.clone());
                })
            })
            .collect();
        EventStream {
            ids,
            rx,
            session: Arc::downgrade(&self.session),
        }
    }

    pub fn start_pattern(
        &self,
        device_index: u32,
        template: CommandTemplate,
        waveform: Arc<dyn Waveform>,
        duration: Duration,
        update_period: Duration,
    ) -> Result<Uuid, SessionError> {
        if self.state() != SessionState::Ready {
            return Err(SessionError::NotConnected);
        }
        Ok(lock(&self.scheduler).start_pattern(
            device_index,
            template,
            waveform,
            duration,
            update_period,
        ))
    }

    pub fn stop_pattern(&self, id: Uuid) -> bool {
        let mut scheduler = lock(&self.scheduler);
        let mut session = lock(&self.session);
        scheduler.stop_command(id, true, &mut *session)
    }

    pub fn stop_all_patterns(&self) -> usize {
        let mut scheduler = lock(&self.scheduler);
        let mut session = lock(&self.session);
        scheduler.stop_all(&mut *session)
    }

    pub fn active_patterns(&self) -> usize {
        lock(&self.scheduler).active_count()
    }

    pub fn pattern_stopped(&self) -> broadcast::Receiver<CommandStopped> {
        lock(&self.scheduler).subscribe_stopped()
    }

    pub fn devices(&self) -> Vec<DeviceDescriptor> {
        lock(&self.session).devices().cloned().collect()
    }

    pub fn device(&self, index: u32) -> Option<DeviceDescriptor> {
        lock(&self.session).device(index).cloned()
    }

    pub async fn shutdown(mut self) {
        if self.state() != SessionState::Disconnected {
            self.disconnect();
        }
        let _ = self.shutdown_tx.send(true);
        if let Some(driver) = self.driver.take() {
            if let Err(err) = driver.await {
                tracing::warn!(error = %err, "client driver ended abnormally");
            }
        }
    }
}

impl Drop for ButtplugClient {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(true);
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn track_status(session: &mut Session<WsTransport>, status_tx: &Arc<watch::Sender<ConnectionStatus>>) {
    let tx = status_tx.clone();
    session.subscribe(EventKind::Ready, move |event| {
        if let SessionEvent::Ready(info) = event {
            tx.send_replace(ConnectionStatus::Ready(info.clone()));
        }
    });
    let tx = status_tx.clone();
    session.subscribe(EventKind::ConnectionError, move |event| {
        if let SessionEvent::ConnectionError(reason) = event {
            tx.send_replace(ConnectionStatus::Failed(reason.clone()));
        }
    });
    let tx = status_tx.clone();
    session.subscribe(EventKind::Disconnected, move |event| {
        if let SessionEvent::Disconnected(reason) = event {
            tx.send_replace(ConnectionStatus::Closed(reason.clone()));
        }
    });
}

async fn drive(
    session: SharedSession,
    scheduler: SharedScheduler,
    mut events: TransportEventReceiver,
    tick_interval: Duration,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(tick_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut last_tick = Instant::now();

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(event) => lock(&session).handle_transport_event(event),
                None => break,
            },
            _ = ticker.tick() => {
                let now = Instant::now();
                let delta = now.saturating_duration_since(last_tick);
                last_tick = now;

                let mut scheduler = lock(&scheduler);
                let mut session = lock(&session);
                session.tick(now);
                if session.state() == SessionState::Ready {
                    scheduler.tick(delta, &mut *session);
                } else if scheduler.active_count() > 0 {
                    let dropped = scheduler.clear();
                    tracing::warn!(dropped, "session lost, dropping running patterns");
                }
            }
            _ = shutdown_rx.changed() => break,
        }
    }
    tracing::debug!("client driver stopped");
}
