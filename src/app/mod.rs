use crate::client::ButtplugClient;
use crate::config::Config;
use crate::protocol::{DeviceDescriptor, Message};
use crate::registry::MessageKind;
use crate::scheduler::CommandTemplate;
use crate::session::{EventKind, SessionEvent};
use crate::waveform::Curve;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio::time::Duration;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_SCAN_SECONDS: u64 = 5;

pub async fn run(config: Config) -> Result<(), Box<dyn std::error::Error>> {
    let args: Vec<String> = std::env::args().skip(2).collect();

    if let Some(ref command) = std::env::args().nth(1) {
        if command == "config-init" {
            return handle_config_init();
        }
        if command == "devices" {
            return handle_devices(&config).await;
        }
        if command == "scan" {
            return handle_scan(&config, &args).await;
        }
        if command == "pattern" {
            return handle_pattern(&config, &args).await;
        }
        if command == "stop-all" {
            return handle_stop_all(&config).await;
        }
    }

    run_bridge(config).await
}

/// Connects when configured to and logs every session event until ctrl-c.
async fn run_bridge(config: Config) -> Result<(), Box<dyn std::error::Error>> {
    let client = ButtplugClient::from_config(&config);
    let kinds: Vec<EventKind> = EventKind::all().collect();
    let mut events = client.subscribe(&kinds);

    if config.client.auto_connect {
        tracing::info!(url = %config.server.url(), client_name = %config.client.name, "auto-connecting");
        client.connect()?;
    } else {
        tracing::info!("auto_connect disabled, idling until ctrl-c");
    }

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(event) => log_event(&event),
                None => break,
            },
            _ = tokio::signal::ctrl_c() => {
                eprintln!("shutdown: ctrl-c");
                break;
            }
        }
    }

    client.shutdown().await;
    Ok(())
}

fn log_event(event: &SessionEvent) {
    match event {
        SessionEvent::Ready(info) => tracing::info!(
            server_name = %info.server_name,
            message_version = info.message_version,
            "session ready"
        ),
        SessionEvent::Disconnected(reason) => tracing::warn!(reason = %reason, "session closed"),
        SessionEvent::ConnectionError(reason) => {
            tracing::error!(reason = %reason, "connection error")
        }
        SessionEvent::Message(Message::SensorReading(reading)) => tracing::info!(
            device_index = reading.device_index,
            sensor_type = %reading.sensor_type,
            data = ?reading.data,
            "sensor reading"
        ),
        SessionEvent::Message(Message::ScanningFinished(_)) => tracing::info!("scanning finished"),
        SessionEvent::Message(Message::Error(err)) => tracing::warn!(
            id = err.id,
            code = %err.error_code,
            message = %err.error_message,
            "server error"
        ),
        SessionEvent::Message(message) => {
            tracing::debug!(id = message.id(), kind = %message.kind(), "message")
        }
    }
}

fn handle_config_init() -> Result<(), Box<dyn std::error::Error>> {
    let path = Config::default_path();
    Config::write_default(&path)?;
    println!("Wrote default config to {}", path.display());
    Ok(())
}

async fn connect(config: &Config) -> Result<ButtplugClient, Box<dyn std::error::Error>> {
    let client = ButtplugClient::from_config(config);
    let info = client.connect_and_wait(CONNECT_TIMEOUT).await?;
    tracing::info!(server_name = %info.server_name, url = %config.server.url(), "connected");
    Ok(client)
}

fn expect_ok(reply: Message) -> Result<Message, Box<dyn std::error::Error>> {
    match reply {
        Message::Error(err) => Err(format!(
            "server error ({}): {}",
            err.error_code, err.error_message
        )
        .into()),
        other => Ok(other),
    }
}

async fn handle_devices(config: &Config) -> Result<(), Box<dyn std::error::Error>> {
    let client = connect(config).await?;
    expect_ok(
        client
            .request(Message::RequestDeviceList(Default::default()))
            .await?,
    )?;
    print_devices(&client.devices());
    client.shutdown().await;
    Ok(())
}

async fn handle_scan(config: &Config, args: &[String]) -> Result<(), Box<dyn std::error::Error>> {
    let seconds = match args.first() {
        Some(raw) => raw
            .parse::<u64>()
            .map_err(|_| format!("invalid scan duration: {raw}"))?,
        None => DEFAULT_SCAN_SECONDS,
    };

    let client = connect(config).await?;
    let mut events = client.subscribe(&[
        EventKind::Message(MessageKind::DeviceAdded),
        EventKind::Message(MessageKind::ScanningFinished),
    ]);
    expect_ok(
        client
            .request(Message::StartScanning(Default::default()))
            .await?,
    )?;
    println!("Scanning for {seconds}s...");

    let deadline = tokio::time::sleep(Duration::from_secs(seconds));
    tokio::pin!(deadline);
    loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(SessionEvent::Message(Message::DeviceAdded(added))) => {
                    println!("found: {}", describe_device(&added.device));
                }
                Some(SessionEvent::Message(Message::ScanningFinished(_))) | None => break,
                Some(_) => {}
            },
            _ = &mut deadline => {
                if let Err(err) = client.send(Message::StopScanning(Default::default())) {
                    tracing::warn!(error = %err, "stop scanning failed");
                }
                break;
            }
        }
    }
    drop(events);

    print_devices(&client.devices());
    client.shutdown().await;
    Ok(())
}

#[derive(Debug, PartialEq)]
struct PatternArgs {
    device_index: u32,
    duration: Duration,
    updates_per_second: u32,
}

fn parse_pattern_args(args: &[String], default_updates_per_second: u32) -> Result<PatternArgs, String> {
    const USAGE: &str = "usage: pattern <device_index> <seconds> [updates_per_second]";
    let device_index = args
        .first()
        .ok_or(USAGE)?
        .parse::<u32>()
        .map_err(|_| format!("invalid device index ({USAGE})"))?;
    let seconds = args
        .get(1)
        .ok_or(USAGE)?
        .parse::<f64>()
        .ok()
        .filter(|s| s.is_finite() && *s > 0.0)
        .ok_or_else(|| format!("invalid duration ({USAGE})"))?;
    let updates_per_second = match args.get(2) {
        Some(raw) => raw
            .parse::<u32>()
            .ok()
            .filter(|ups| *ups > 0)
            .ok_or_else(|| format!("invalid updates_per_second ({USAGE})"))?,
        None => default_updates_per_second.max(1),
    };
    Ok(PatternArgs {
        device_index,
        duration: Duration::from_secs_f64(seconds),
        updates_per_second,
    })
}

/// One-second rise and fall, looped for the pattern's duration.
fn pulse() -> Curve {
    Curve::from_points(&[(0.0, 0.0), (0.5, 1.0), (1.0, 0.0)])
}

async fn handle_pattern(config: &Config, args: &[String]) -> Result<(), Box<dyn std::error::Error>> {
    let pattern = parse_pattern_args(args, config.scheduler.default_updates_per_second)?;
    let update_period = Duration::from_secs_f64(1.0 / f64::from(pattern.updates_per_second));

    let client = connect(config).await?;
    expect_ok(
        client
            .request(Message::RequestDeviceList(Default::default()))
            .await?,
    )?;
    let device = client
        .device(pattern.device_index)
        .ok_or_else(|| format!("device {} not found", pattern.device_index))?;
    let template = CommandTemplate::for_device(&device, update_period)
        .ok_or_else(|| format!("{} has no drivable actuators", device.display_name()))?;

    let mut stopped = client.pattern_stopped();
    let id = client.start_pattern(
        pattern.device_index,
        template,
        Arc::new(pulse()),
        pattern.duration,
        update_period,
    )?;
    println!(
        "Running pattern on {} for {:.1}s",
        device.display_name(),
        pattern.duration.as_secs_f64()
    );

    loop {
        tokio::select! {
            done = stopped.recv() => match done {
                Ok(done) if done.id == id => break,
                Ok(_) | Err(RecvError::Lagged(_)) => {}
                Err(RecvError::Closed) => break,
            },
            _ = tokio::signal::ctrl_c() => {
                eprintln!("shutdown: ctrl-c");
                client.stop_pattern(id);
                break;
            }
        }
    }

    client.shutdown().await;
    Ok(())
}

async fn handle_stop_all(config: &Config) -> Result<(), Box<dyn std::error::Error>> {
    let client = connect(config).await?;
    expect_ok(
        client
            .request(Message::StopAllDevices(Default::default()))
            .await?,
    )?;
    println!("Stopped all devices");
    client.shutdown().await;
    Ok(())
}

fn print_devices(devices: &[DeviceDescriptor]) {
    if devices.is_empty() {
        println!("No devices connected");
        return;
    }
    for device in devices {
        println!("{}", describe_device(device));
    }
}

fn describe_device(device: &DeviceDescriptor) -> String {
    let commands: Vec<String> = [
        MessageKind::ScalarCmd,
        MessageKind::LinearCmd,
        MessageKind::RotateCmd,
        MessageKind::SensorReadCmd,
        MessageKind::SensorSubscribeCmd,
    ]
    .into_iter()
    .filter(|kind| device.device_messages.accepts(*kind))
    .map(|kind| {
        let actuators = device.device_messages.actuators(kind);
        if actuators.is_empty() {
            kind.to_string()
        } else {
            format!("{kind}x{}", actuators.len())
        }
    })
    .collect();
    format!(
        "[{:>3}] {} ({})",
        device.device_index,
        device.display_name(),
        commands.join(", ")
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::simulated_vibrator;

    fn args(raw: &[&str]) -> Vec<String> {
        raw.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn pattern_args_use_configured_default_rate() {
        assert_eq!(
            parse_pattern_args(&args(&["2", "1.5"]), 10).unwrap(),
            PatternArgs {
                device_index: 2,
                duration: Duration::from_millis(1500),
                updates_per_second: 10,
            }
        );
        assert_eq!(
            parse_pattern_args(&args(&["0", "3", "25"]), 10)
                .unwrap()
                .updates_per_second,
            25
        );
    }

    #[test]
    fn pattern_args_reject_bad_input() {
        assert!(parse_pattern_args(&args(&[]), 10).is_err());
        assert!(parse_pattern_args(&args(&["x", "1"]), 10).is_err());
        assert!(parse_pattern_args(&args(&["1", "-2"]), 10).is_err());
        assert!(parse_pattern_args(&args(&["1", "2", "0"]), 10).is_err());
    }

    #[test]
    fn expect_ok_surfaces_server_errors() {
        let err = expect_ok(Message::Error(crate::protocol::StatusError {
            id: 3,
            error_message: "Device not found".to_string(),
            error_code: crate::protocol::ErrorCode::Device,
        }))
        .unwrap_err();
        assert!(err.to_string().contains("Device not found"));
        assert!(expect_ok(Message::Ok(Default::default())).is_ok());
    }

    #[test]
    fn device_summary_lists_commands() {
        let line = describe_device(&simulated_vibrator(4));
        assert_eq!(line, "[  4] Simulated Vibrator (ScalarCmdx1, SensorReadCmd)");
    }
}
