//! Application configuration loading, validation, and management.
//!
//! The top-level [`Config`] aggregates logging, client and reading settings.
//! It is loaded once from a TOML file at startup, validated, and treated as
//! immutable afterwards.

use std::{
    fs,
    path::{Path, PathBuf},
};

use pulsebee_client::ClientConfig;
use serde::{Deserialize, Serialize};
use validator::Validate;

use self::{logger::LoggerConfig, reading::ReadingConfig};

pub mod logger;
pub mod reading;

/// Environment variable naming the configuration file.
pub const CONFIG_ENV: &str = "PULSEBEE_CONFIG";

/// Used when [`CONFIG_ENV`] is not set.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/pulsebee/config.toml";

/// Timestamp prefix of the `print_*` macros.
#[doc(hidden)]
pub fn console_timestamp() -> String {
    time::OffsetDateTime::now_utc()
        .format(time::macros::format_description!(
            "[year]-[month]-[day]T[hour]:[minute]:[second].[subsecond digits:6]Z"
        ))
        .unwrap_or_default()
}

/// Timestamped console output for use before the tracing subscriber exists.
#[macro_export]
macro_rules! print_info {
    ($($arg:tt)*) => {
        println!("{}  {} {}",
            console::style($crate::config::console_timestamp()).dim(),
            console::style("INFO").green(),
            format_args!($($arg)*)
        );
    };
}

#[macro_export]
macro_rules! print_warn {
    ($($arg:tt)*) => {
        println!("{}  {} {}",
            console::style($crate::config::console_timestamp()).dim(),
            console::style("WARN").yellow(),
            format_args!($($arg)*)
        );
    };
}

#[macro_export]
macro_rules! print_error {
    ($($arg:tt)*) => {
        eprintln!("{}  {} {}",
            console::style($crate::config::console_timestamp()).dim(),
            console::style("ERROR").red(),
            format_args!($($arg)*)
        );
    };
}

/// Errors that can occur while locating, reading or validating the configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error while reading configuration: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Parse error while reading configuration: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Validation error: {0}")]
    ValidationError(#[from] validator::ValidationErrors),
}

/// Top-level application configuration.
///
/// ```toml
/// [logger]
/// level = "info"
///
/// [client]
/// service_url = "pulsar://localhost:6650"
/// retry_interval_ms = 3000
///
/// [reader]
/// topic = "persistent://public/default/mytopic"
/// start_position = "earliest"
/// ```
#[derive(Serialize, Deserialize, Debug, Validate, Clone, Default)]
#[serde(default)]
pub struct Config {
    #[validate(nested)]
    pub logger: LoggerConfig,

    #[validate(nested)]
    pub client: ClientConfig,

    #[validate(nested)]
    pub reader: ReadingConfig,
}

impl Config {
    /// Locates the configuration file and loads it.
    ///
    /// # Errors
    ///
    /// Returns a `ConfigError` if no file is found or it cannot be read,
    /// parsed, or validated.
    pub fn new() -> Result<Self, ConfigError> {
        let config_path = Self::get_config_path()?;
        Self::load(&config_path)
    }

    /// Priority: `PULSEBEE_CONFIG`, then `/etc/pulsebee/config.toml`.
    fn get_config_path() -> Result<PathBuf, ConfigError> {
        if let Ok(config_path) = std::env::var(CONFIG_ENV) {
            let path = PathBuf::from(config_path);
            print_info!("Using config from {}: {}", CONFIG_ENV, path.display());
            return Ok(path);
        }

        let fallback = Path::new(DEFAULT_CONFIG_PATH);
        if fallback.exists() {
            print_info!("Using default config path: {}", fallback.display());
            return Ok(fallback.to_path_buf());
        }

        Err(ConfigError::Config(format!(
            "No configuration file found. Set {CONFIG_ENV} or create {DEFAULT_CONFIG_PATH}"
        )))
    }

    /// Loads and validates configuration from `path`.
    pub fn load(path: &Path) -> Result<Config, ConfigError> {
        print_info!("Loading configuration from: {}", path.display());

        if !path.exists() {
            return Err(ConfigError::Config(format!(
                "Configuration file does not exist: {}",
                path.display()
            )));
        }

        let config_str = fs::read_to_string(path)?;
        let config = Self::parse(&config_str)?;

        print_info!("Successfully loaded config from: {}", path.display());
        Ok(config)
    }

    /// Parses and validates a TOML document.
    pub fn parse(document: &str) -> Result<Config, ConfigError> {
        let config: Config = toml::from_str(document)?;
        config.validate()?;
        Ok(config)
    }
}
