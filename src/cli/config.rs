//! Courier configuration file handling
//!
//! Operator configuration in TOML, stored under the data directory:
//! `~/.local/share/courier/config.toml`. The older `config.json` layout
//! (rooms nested under `bot`) is still read so existing deployments keep
//! working; saving always writes TOML.

use courier::news::NewsSource;
use courier::verification::VerificationConfig;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing_subscriber::EnvFilter;

/// Default log level
const DEFAULT_LOG_LEVEL: &str = "info";

/// Courier bot configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CourierConfig {
    /// Bot identity on the homeserver
    pub bot: BotConfig,

    /// Room aliases -> room ids
    #[serde(default)]
    pub rooms: BTreeMap<String, String>,

    /// News sources by name
    #[serde(default)]
    pub news: BTreeMap<String, NewsSource>,

    /// Verification timing
    #[serde(default)]
    pub verification: VerificationSettings,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Bot account settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BotConfig {
    /// Fully qualified user id, e.g. `@courier:example.org`
    pub user_id: String,

    /// Device name shown in the session list
    #[serde(default = "default_device_name")]
    pub device_name: String,

    /// Device id, set after first login
    #[serde(default)]
    pub device_id: Option<String>,

    /// Homeserver base URL
    pub home_server: String,

    /// Access token, set after first login
    #[serde(default)]
    pub access_token: Option<String>,

    /// Crypto store directory
    #[serde(default = "default_store_path")]
    pub store_path: PathBuf,
}

/// Verification timing, as human-readable durations ("5m", "90s")
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerificationSettings {
    #[serde(default = "defaults::decision_timeout", with = "humantime_str")]
    pub decision_timeout: Duration,

    #[serde(default = "defaults::session_timeout", with = "humantime_str")]
    pub session_timeout: Duration,

    #[serde(default = "defaults::terminal_retention", with = "humantime_str")]
    pub terminal_retention: Duration,

    #[serde(default = "defaults::poll_interval", with = "humantime_str")]
    pub poll_interval: Duration,

    #[serde(default = "defaults::sweep_interval", with = "humantime_str")]
    pub sweep_interval: Duration,
}

mod defaults {
    use courier::verification::VerificationConfig;
    use std::time::Duration;

    pub fn decision_timeout() -> Duration {
        VerificationConfig::default().decision_timeout
    }

    pub fn session_timeout() -> Duration {
        VerificationConfig::default().session_timeout
    }

    pub fn terminal_retention() -> Duration {
        VerificationConfig::default().terminal_retention
    }

    pub fn poll_interval() -> Duration {
        VerificationConfig::default().poll_interval
    }

    pub fn sweep_interval() -> Duration {
        VerificationConfig::default().sweep_interval
    }
}

mod humantime_str {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&humantime::format_duration(*value).to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let raw = String::deserialize(deserializer)?;
        humantime::parse_duration(&raw).map_err(serde::de::Error::custom)
    }
}

impl Default for VerificationSettings {
    fn default() -> Self {
        VerificationConfig::default().into()
    }
}

impl From<VerificationConfig> for VerificationSettings {
    fn from(config: VerificationConfig) -> Self {
        Self {
            decision_timeout: config.decision_timeout,
            session_timeout: config.session_timeout,
            terminal_retention: config.terminal_retention,
            poll_interval: config.poll_interval,
            sweep_interval: config.sweep_interval,
        }
    }
}

impl From<&VerificationSettings> for VerificationConfig {
    fn from(settings: &VerificationSettings) -> Self {
        Self {
            decision_timeout: settings.decision_timeout,
            session_timeout: settings.session_timeout,
            terminal_retention: settings.terminal_retention,
            poll_interval: settings.poll_interval,
            sweep_interval: settings.sweep_interval,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level or filter directive (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log file path (optional, logs to stderr if not specified)
    pub file: Option<PathBuf>,
}

fn default_device_name() -> String {
    "courier".to_string()
}

fn default_log_level() -> String {
    DEFAULT_LOG_LEVEL.to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: DEFAULT_LOG_LEVEL.to_string(),
            file: None,
        }
    }
}

impl LoggingConfig {
    /// Install the global tracing subscriber. `RUST_LOG` wins over `level`.
    pub fn init(&self) -> Result<(), Box<dyn std::error::Error>> {
        let filter = EnvFilter::try_from_default_env()
            .or_else(|_| EnvFilter::try_new(&self.level))
            .map_err(|e| format!("Invalid log level '{}': {}", self.level, e))?;

        let builder = tracing_subscriber::fmt().with_env_filter(filter);

        let result = match &self.file {
            Some(path) => {
                if let Some(parent) = path.parent() {
                    fs::create_dir_all(parent)
                        .map_err(|e| format!("Failed to create log directory: {}", e))?;
                }
                let file = fs::OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(path)
                    .map_err(|e| {
                        format!("Failed to open log file '{}': {}", path.display(), e)
                    })?;
                builder
                    .with_ansi(false)
                    .with_writer(std::sync::Mutex::new(file))
                    .try_init()
            }
            None => builder.with_writer(std::io::stderr).try_init(),
        };

        result.map_err(|e| format!("Failed to initialise logging: {}", e).into())
    }
}

/// Pre-TOML layout: rooms live under `bot`
#[derive(Debug, Deserialize)]
struct LegacyConfig {
    bot: LegacyBotConfig,
    #[serde(default)]
    news: BTreeMap<String, NewsSource>,
}

#[derive(Debug, Deserialize)]
struct LegacyBotConfig {
    user_id: String,
    #[serde(default = "default_device_name")]
    device_name: String,
    #[serde(default)]
    device_id: Option<String>,
    home_server: String,
    #[serde(default)]
    access_token: Option<String>,
    #[serde(default = "default_store_path")]
    store_path: PathBuf,
    #[serde(default)]
    rooms: BTreeMap<String, String>,
}

impl From<LegacyConfig> for CourierConfig {
    fn from(legacy: LegacyConfig) -> Self {
        // Older tools wrote empty strings for "not yet logged in".
        let non_empty = |value: Option<String>| value.filter(|v| !v.is_empty());

        Self {
            bot: BotConfig {
                user_id: legacy.bot.user_id,
                device_name: legacy.bot.device_name,
                device_id: non_empty(legacy.bot.device_id),
                home_server: legacy.bot.home_server,
                access_token: non_empty(legacy.bot.access_token),
                store_path: legacy.bot.store_path,
            },
            rooms: legacy.bot.rooms,
            news: legacy.news,
            verification: VerificationSettings::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Default for CourierConfig {
    fn default() -> Self {
        Self::new(
            "@courier:localhost".to_string(),
            "https://localhost:8448".to_string(),
        )
    }
}

impl CourierConfig {
    /// Create a new configuration for the given account
    pub fn new(user_id: String, home_server: String) -> Self {
        Self {
            bot: BotConfig {
                user_id,
                device_name: default_device_name(),
                device_id: None,
                home_server,
                access_token: None,
                store_path: default_store_path(),
            },
            rooms: BTreeMap::new(),
            news: BTreeMap::new(),
            verification: VerificationSettings::default(),
            logging: LoggingConfig::default(),
        }
    }

    /// Load configuration; `.json` files are read in the legacy layout
    pub fn load(path: &Path) -> Result<Self, Box<dyn std::error::Error>> {
        let contents = fs::read_to_string(path)
            .map_err(|e| format!("Failed to read config file '{}': {}", path.display(), e))?;

        let is_json = path
            .extension()
            .map(|ext| ext.eq_ignore_ascii_case("json"))
            .unwrap_or(false);

        let config: CourierConfig = if is_json {
            let legacy: LegacyConfig = serde_json::from_str(&contents).map_err(|e| {
                format!("Failed to parse legacy config '{}': {}", path.display(), e)
            })?;
            legacy.into()
        } else {
            toml::from_str(&contents)
                .map_err(|e| format!("Failed to parse config file '{}': {}", path.display(), e))?
        };

        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn save(&self, path: &Path) -> Result<(), Box<dyn std::error::Error>> {
        let contents = toml::to_string_pretty(self)
            .map_err(|e| format!("Failed to serialize config: {}", e))?;

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| format!("Failed to create config directory: {}", e))?;
        }

        fs::write(path, contents)
            .map_err(|e| format!("Failed to write config file '{}': {}", path.display(), e))?;

        Ok(())
    }

    /// Room id for a configured alias
    pub fn room_id(&self, alias: &str) -> Option<&str> {
        self.rooms.get(alias).map(String::as_str)
    }

    /// Verification timing for the state machine
    pub fn verification_config(&self) -> VerificationConfig {
        (&self.verification).into()
    }

    /// Generate default configuration content as a string with comments
    pub fn generate_default_toml(store_path: &Path) -> String {
        format!(
            r#"# Courier Bot Configuration

[bot]
# Bot account and homeserver
user_id = "@courier:localhost"
device_name = "courier"
home_server = "https://localhost:8448"

# Crypto store directory
store_path = "{store_path}"

# Set after first login; do not edit by hand
# device_id = "..."
# access_token = "..."

[rooms]
# alias = "!roomid:server"
# tech_news = "!abc:example.org"

# One table per news source
# [news.science]
# url = "https://feeds.arstechnica.com/arstechnica/science"
# room = "!abc:example.org"

[verification]
# How long to wait for a yes/no at the emoji prompt
decision_timeout = "5m"

# Cancel handshakes with no activity for this long
session_timeout = "10m"

# Keep finished handshakes this long to absorb late events
terminal_retention = "1m"

poll_interval = "100ms"
sweep_interval = "1s"

[logging]
# Log level: trace, debug, info, warn, error (RUST_LOG overrides)
level = "info"

# Log file path (optional, logs to stderr if not specified)
# file = "/var/log/courier/courier.log"
"#,
            store_path = store_path.display()
        )
    }

    /// Create and save a default configuration file
    pub fn create_default(
        config_path: &Path,
        store_path: &Path,
    ) -> Result<(), Box<dyn std::error::Error>> {
        let contents = Self::generate_default_toml(store_path);

        if let Some(parent) = config_path.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| format!("Failed to create config directory: {}", e))?;
        }

        fs::write(config_path, contents).map_err(|e| {
            format!(
                "Failed to write config file '{}': {}",
                config_path.display(),
                e
            )
        })?;

        Ok(())
    }
}

/// Data directory: ~/.local/share/courier
pub fn default_data_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("courier")
}

/// Get the default config file path
pub fn default_config_path() -> PathBuf {
    default_data_dir().join("config.toml")
}

/// Get the default crypto store path
pub fn default_store_path() -> PathBuf {
    default_data_dir().join("store")
}
