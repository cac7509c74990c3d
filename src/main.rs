use buttplug_bridge::app;
use buttplug_bridge::config::{Config, LoggingConfig};

#[tokio::main]
async fn main() {
    let config = match Config::load() {
        Ok(config) => config,
        Err(err) => {
            eprintln!("config error: {err}");
            std::process::exit(1);
        }
    };
    init_logging(&config.logging);
    if let Err(err) = app::run(config).await {
        tracing::error!(error = %err, "fatal");
        std::process::exit(1);
    }
}

fn init_logging(logging: &LoggingConfig) {
    use tracing_subscriber::{fmt, EnvFilter};
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(logging.verbosity.filter_directive()));
    fmt().with_env_filter(filter).with_target(false).init();
}
