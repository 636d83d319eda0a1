//! Settings for the reading loop and its demo heartbeat producer.

use std::time::Duration;

use pulsebee_client::{ProducerOptions, ReaderOptions, StartPosition};
use serde::{Deserialize, Serialize};
use validator::Validate;

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct ReadingConfig {
    /// Topic the reader follows and the heartbeat publishes to.
    #[validate(length(min = 1, max = 1024, message = "Topic must be between 1 and 1024 characters"))]
    pub topic: String,

    /// Where the reader starts: `earliest`, `latest` or `{ message_id = {...} }`.
    pub start_position: StartPosition,

    #[validate(nested)]
    pub heartbeat: HeartbeatConfig,
}

impl Default for ReadingConfig {
    fn default() -> Self {
        Self {
            topic: "persistent://public/default/mytopic".into(),
            start_position: StartPosition::Earliest,
            heartbeat: HeartbeatConfig::default(),
        }
    }
}

impl ReadingConfig {
    pub fn reader_options(&self) -> ReaderOptions {
        ReaderOptions::new(self.topic.clone()).with_start_position(self.start_position)
    }

    pub fn heartbeat_options(&self) -> ProducerOptions {
        ProducerOptions::new(self.topic.clone()).with_producer_name(self.heartbeat.producer_name.clone())
    }
}

/// Demo producer feeding the topic so the reader has something to print.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct HeartbeatConfig {
    pub enabled: bool,

    #[validate(range(min = 10, max = 3_600_000, message = "Heartbeat interval must be between 10 ms and 1 hour"))]
    pub interval_ms: u64,

    #[validate(length(min = 1, max = 255))]
    pub producer_name: String,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_ms: 1000,
            producer_name: "pulsebee-heartbeat".into(),
        }
    }
}

impl HeartbeatConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}
