use crate::registry::REGISTRY_VERSION;
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

const CONFIG_FILE: &str = "config.toml";
const CONFIG_DIR: &str = "ButtplugBridge";
const ENV_PREFIX: &str = "BUTTPLUG_";

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub client: ClientConfig,
    pub scheduler: SchedulerConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct ServerConfig {
    pub address: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            address: "ws://127.0.0.1".to_string(),
            port: 12345,
        }
    }
}

impl ServerConfig {
    /// `address:port`, with `ws://` assumed when the address has no scheme.
    pub fn url(&self) -> String {
        let address = self.address.trim().trim_end_matches('/');
        if address.contains("://") {
            format!("{address}:{}", self.port)
        } else {
            format!("ws://{address}:{}", self.port)
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct ClientConfig {
    pub name: String,
    pub message_version: u32,
    pub auto_connect: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            name: "ButtplugBridge".to_string(),
            message_version: crate::protocol::DEFAULT_MESSAGE_VERSION,
            auto_connect: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct SchedulerConfig {
    pub tick_interval_ms: u64,
    pub default_updates_per_second: u32,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: 20,
            default_updates_per_second: 10,
        }
    }
}

impl SchedulerConfig {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms.max(1))
    }
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum Verbosity {
    None,
    Errors,
    Warnings,
    #[default]
    All,
}

impl Verbosity {
    /// Directive for `tracing_subscriber::EnvFilter`.
    pub fn filter_directive(self) -> &'static str {
        match self {
            Self::None => "off",
            Self::Errors => "error",
            Self::Warnings => "warn",
            Self::All => "info",
        }
    }
}

impl std::str::FromStr for Verbosity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "none" => Ok(Self::None),
            "errors" => Ok(Self::Errors),
            "warnings" => Ok(Self::Warnings),
            "all" => Ok(Self::All),
            other => Err(format!("unknown verbosity: {other}")),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq)]
#[serde(default)]
pub struct LoggingConfig {
    pub verbosity: Verbosity,
}

impl Config {
    pub fn load() -> Result<Self, Box<dyn std::error::Error>> {
        let config_path = active_config_path();
        let mut config = match fs::read_to_string(&config_path) {
            Ok(raw) => toml::from_str::<Config>(&raw)
                .map_err(|err| format!("{}: {err}", config_path.display()))?,
            Err(_) => Self::default(),
        };

        config.apply_env_overrides()?;

        config.validate()?;
        Ok(config)
    }

    fn apply_env_overrides(&mut self) -> Result<(), Box<dyn std::error::Error>> {
        // Server settings
        if let Ok(val) = env::var(format!("{}SERVER_ADDRESS", ENV_PREFIX)) {
            self.server.address = val;
        }
        if let Ok(val) = env::var(format!("{}SERVER_PORT", ENV_PREFIX)) {
            if let Ok(port) = val.parse() {
                self.server.port = port;
            }
        }

        // Client settings
        if let Ok(val) = env::var(format!("{}CLIENT_NAME", ENV_PREFIX)) {
            self.client.name = val;
        }
        if let Ok(val) = env::var(format!("{}MESSAGE_VERSION", ENV_PREFIX)) {
            if let Ok(version) = val.parse() {
                self.client.message_version = version;
            }
        }
        if let Ok(val) = env::var(format!("{}AUTO_CONNECT", ENV_PREFIX)) {
            self.client.auto_connect = val.parse().unwrap_or(true);
        }

        // Scheduler settings
        if let Ok(val) = env::var(format!("{}TICK_INTERVAL_MS", ENV_PREFIX)) {
            if let Ok(interval) = val.parse() {
                self.scheduler.tick_interval_ms = interval;
            }
        }
        if let Ok(val) = env::var(format!("{}UPDATES_PER_SECOND", ENV_PREFIX)) {
            if let Ok(rate) = val.parse() {
                self.scheduler.default_updates_per_second = rate;
            }
        }

        if let Ok(val) = env::var(format!("{}LOG_VERBOSITY", ENV_PREFIX)) {
            self.logging.verbosity = val.parse()?;
        }

        Ok(())
    }

    pub fn validate(&self) -> Result<(), Box<dyn std::error::Error>> {
        if self.server.address.trim().is_empty() {
            return Err("server.address must be set".into());
        }
        if self.server.port == 0 {
            return Err("server.port must be non-zero".into());
        }
        if self.client.name.trim().is_empty() {
            return Err("client.name must be set".into());
        }
        if self.client.message_version == 0 {
            return Err("client.message_version must be >= 1".into());
        }
        if self.client.message_version > REGISTRY_VERSION {
            return Err(format!(
                "client.message_version {} is newer than the supported {}",
                self.client.message_version, REGISTRY_VERSION
            )
            .into());
        }
        if self.scheduler.tick_interval_ms == 0 {
            return Err("scheduler.tick_interval_ms must be >= 1".into());
        }
        if self.scheduler.default_updates_per_second == 0 {
            return Err("scheduler.default_updates_per_second must be >= 1".into());
        }
        Ok(())
    }

    pub fn write_default<P: AsRef<Path>>(path: P) -> Result<(), Box<dyn std::error::Error>> {
        if path.as_ref().exists() {
            return Err(format!("{} already exists", path.as_ref().display()).into());
        }
        if let Some(parent) = path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let data = toml::to_string_pretty(&Config::default())?;
        fs::write(path, data)?;
        Ok(())
    }

    pub fn save(&self) -> Result<(), Box<dyn std::error::Error>> {
        self.save_to(active_config_path())
    }

    pub fn save_to<P: AsRef<Path>>(&self, path: P) -> Result<(), Box<dyn std::error::Error>> {
        self.validate()?;
        let data = toml::to_string_pretty(self)?;
        if let Some(parent) = path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        fs::write(path, data)?;
        Ok(())
    }

    pub fn default_path() -> PathBuf {
        managed_config_path()
    }
}

fn managed_config_path() -> PathBuf {
    if let Ok(path) = env::var(format!("{}CONFIG_PATH", ENV_PREFIX)) {
        return PathBuf::from(path);
    }
    let base = env::var("APPDATA")
        .or_else(|_| env::var("HOME"))
        .unwrap_or_else(|_| ".".to_string());
    Path::new(&base).join(CONFIG_DIR).join(CONFIG_FILE)
}

fn active_config_path() -> PathBuf {
    if env::var_os(format!("{}CONFIG_PATH", ENV_PREFIX)).is_some() {
        return managed_config_path();
    }
    let local = PathBuf::from(CONFIG_FILE);
    if local.exists() {
        local
    } else {
        managed_config_path()
    }
}
