use buttplug_bridge::mock::{simulated_vibrator, MockOptions, MockServer};
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tokio::sync::watch;

const DEFAULT_PORT: u16 = 12345;

fn flag_value<T: std::str::FromStr>(name: &str) -> Result<Option<T>, Box<dyn std::error::Error>> {
    let mut args = std::env::args().skip_while(|a| a != name);
    if args.next().is_none() {
        return Ok(None);
    }
    let raw = args.next().ok_or(format!("{name} needs a value"))?;
    let value = raw
        .parse()
        .map_err(|_| format!("invalid value for {name}: {raw}"))?;
    Ok(Some(value))
}

async fn run() -> Result<(), Box<dyn std::error::Error>> {
    let port = flag_value::<u16>("--port")?.unwrap_or(DEFAULT_PORT);
    let max_ping_time = flag_value::<u32>("--ping-ms")?.unwrap_or(0);
    let device_count = flag_value::<u32>("--devices")?.unwrap_or(1);

    let options = MockOptions {
        max_ping_time,
        devices: (0..device_count).map(simulated_vibrator).collect(),
        ..Default::default()
    };

    let addr: SocketAddr = format!("127.0.0.1:{port}").parse()?;
    let listener = TcpListener::bind(addr).await?;
    println!("mock-server: listening on ws://{addr} ({device_count} devices, MaxPingTime {max_ping_time}ms)");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::select! {
        res = MockServer::new(options).serve(listener, shutdown_rx) => res.map_err(|err| err as Box<dyn std::error::Error>),
        _ = tokio::signal::ctrl_c() => {
            eprintln!("shutdown: ctrl-c");
            let _ = shutdown_tx.send(true);
            Ok(())
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();
    run().await
}
