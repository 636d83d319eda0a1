//! Centralized logging configuration and initialization manager.
//!
//! [`LoggerManager`] validates a [`LoggerConfig`] and installs the global
//! `tracing` subscriber with a console layer, a systemd journald layer, or
//! both. `RUST_LOG` takes precedence over the configured level.

use std::io;

use thiserror::Error;
use tracing::instrument;
use tracing_subscriber::{fmt, fmt::format::FmtSpan, prelude::*, EnvFilter, Layer, Registry};
use validator::{Validate, ValidationErrors};

use crate::{
    config::logger::{ConsoleConfig, LogFormat, LoggerConfig},
    print_info, print_warn,
};

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

/// Errors that can occur during logger configuration or initialization.
#[derive(Error, Debug)]
pub enum LoggerError {
    #[error("Logger initialization error: {0}")]
    InitializationError(String),

    #[error("Logger configuration validation error: {0}")]
    ValidationError(#[from] ValidationErrors),

    /// Typically the journald socket is missing.
    #[error("IO error: {0}")]
    IoError(#[from] io::Error),

    #[error("No logging layers were configured or successfully initialized")]
    NoLayersConfigured,

    #[error(
        "Failed to initialize journald logger while console output is enabled. Please check your configuration."
    )]
    JournaldFailedWithConsoleEnabled,
}

/// Manages logging configuration and global subscriber initialization.
pub struct LoggerManager {
    config: LoggerConfig,
}

impl LoggerManager {
    /// Validates `config` and wraps it.
    ///
    /// # Errors
    ///
    /// Returns `LoggerError::ValidationError` if validation fails.
    pub fn new(config: LoggerConfig) -> Result<Self, LoggerError> {
        config.validate()?;

        Ok(LoggerManager { config })
    }

    pub fn config(&self) -> &LoggerConfig {
        &self.config
    }

    /// Installs the global subscriber. Call once, early in `main`.
    ///
    /// # Errors
    ///
    /// Fails when no layer could be built, when journald fails while the
    /// console is also requested, or when a global subscriber already exists.
    #[instrument(skip(self))]
    pub fn init(&mut self) -> Result<(), LoggerError> {
        let layers = self.build_layers()?;
        tracing_subscriber::registry()
            .with(layers)
            .try_init()
            .map_err(|e| LoggerError::InitializationError(e.to_string()))
    }

    fn build_layers(&self) -> Result<Vec<BoxedLayer>, LoggerError> {
        let mut layers = Vec::new();

        if let Some(console) = self.config.console.as_ref().filter(|c| c.enabled) {
            layers.push(Self::console_layer(console, self.filter()));
        }

        if let Some(journald) = self.config.journald.as_ref().filter(|j| j.enabled) {
            match Self::journald_layer(&journald.identifier, self.filter()) {
                Ok(layer) => {
                    layers.push(layer);
                    print_info!(
                        "Systemd journald logger initialized with identifier: {}",
                        journald.identifier
                    );
                }
                Err(e) => {
                    print_warn!("Failed to initialize systemd journald logger: {}", e);
                    if self.config.console_enabled() {
                        return Err(LoggerError::JournaldFailedWithConsoleEnabled);
                    }
                }
            }
        }

        if layers.is_empty() {
            print_warn!("No logging layers were initialized. Please check your configuration.");
            return Err(LoggerError::NoLayersConfigured);
        }

        Ok(layers)
    }

    fn filter(&self) -> EnvFilter {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&self.config.level))
    }

    fn console_layer(config: &ConsoleConfig, filter: EnvFilter) -> BoxedLayer {
        let base = fmt::layer()
            .with_target(config.show_target)
            .with_thread_ids(config.show_thread_ids)
            .with_span_events(if config.show_spans {
                FmtSpan::CLOSE
            } else {
                FmtSpan::NONE
            })
            .with_ansi(config.ansi_colors)
            .with_writer(io::stdout);

        match config.format {
            LogFormat::Json => base.json().with_filter(filter).boxed(),
            LogFormat::Pretty => base.pretty().with_filter(filter).boxed(),
            LogFormat::Compact => base.compact().with_filter(filter).boxed(),
        }
    }

    fn journald_layer(identifier: &str, filter: EnvFilter) -> Result<BoxedLayer, LoggerError> {
        let layer = tracing_journald::layer()?.with_syslog_identifier(identifier.to_string());
        Ok(layer.with_filter(filter).boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::logger::JournaldConfig;

    #[test]
    fn test_rejects_invalid_config() {
        let config = LoggerConfig {
            level: "chatty".into(),
            ..LoggerConfig::default()
        };
        assert!(matches!(
            LoggerManager::new(config),
            Err(LoggerError::ValidationError(_))
        ));
    }

    #[test]
    fn test_no_outputs_is_an_error() {
        let config = LoggerConfig {
            console: None,
            journald: Some(JournaldConfig::default()),
            ..LoggerConfig::default()
        };
        let manager = LoggerManager::new(config).unwrap();
        assert!(matches!(
            manager.build_layers(),
            Err(LoggerError::NoLayersConfigured)
        ));
    }

    #[test]
    fn test_console_layer_for_every_format() {
        for format in [LogFormat::Compact, LogFormat::Pretty, LogFormat::Json] {
            let config = LoggerConfig {
                console: Some(ConsoleConfig {
                    format,
                    ..ConsoleConfig::default()
                }),
                journald: None,
                ..LoggerConfig::default()
            };
            let manager = LoggerManager::new(config).unwrap();
            assert_eq!(manager.build_layers().unwrap().len(), 1);
        }
    }
}
