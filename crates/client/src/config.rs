//! Client configuration and per-entity options.
//!
//! All structs deserialize with serde (every field has a default) and are
//! checked with `validator` when an entity or client is created, so invalid
//! settings fail early rather than at connect time.
//!
//! ```toml
//! service_url = "pulsar://localhost:6650"
//! retry_interval_ms = 3000
//! retry_backoff_multiplier = 1.0
//! max_retry_interval_ms = 60000
//! max_reconnect_attempts = 0   # unlimited
//! ```

use std::time::Duration;

use serde::{Deserialize, Serialize};
use validator::{Validate, ValidationError};

use super::{backoff::RetryPolicy, message::MessageId};

/// Connection-wide settings shared by every entity of a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct ClientConfig {
    /// Broker address, `pulsar://` or `pulsar+ssl://`.
    #[validate(custom(function = "validate_service_url"))]
    pub service_url: String,

    /// Wait between attempts of a failed operation or reconnect.
    #[validate(range(
        min = 1,
        max = 300_000,
        message = "Retry interval must be between 1 ms and 300000 ms"
    ))]
    pub retry_interval_ms: u64,

    /// Growth factor for consecutive retry waits; `1.0` keeps the interval fixed.
    #[validate(range(
        min = 1.0,
        max = 10.0,
        message = "Retry backoff multiplier must be between 1.0 and 10.0"
    ))]
    pub retry_backoff_multiplier: f64,

    /// Cap for the retry wait when the multiplier is above `1.0`.
    #[validate(range(
        min = 1,
        max = 3_600_000,
        message = "Max retry interval must be between 1 ms and 3600000 ms"
    ))]
    pub max_retry_interval_ms: u64,

    /// Consecutive failed reconnects before an entity faults; `0` means never.
    #[validate(range(max = 100_000, message = "Max reconnect attempts must not exceed 100000"))]
    pub max_reconnect_attempts: u32,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            service_url: "pulsar://localhost:6650".into(),
            retry_interval_ms: 3000,
            retry_backoff_multiplier: 1.0,
            max_retry_interval_ms: 60_000,
            max_reconnect_attempts: 0,
        }
    }
}

impl ClientConfig {
    pub fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.retry_interval_ms)
    }

    /// Policy for re-issuing caller operations. Never gives up on its own.
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::exponential(
            self.retry_interval(),
            Duration::from_millis(self.max_retry_interval_ms),
            self.retry_backoff_multiplier,
        )
    }

    /// Policy for re-establishing channels.
    pub fn reconnect_policy(&self) -> RetryPolicy {
        self.retry_policy()
            .with_max_attempts(self.max_reconnect_attempts)
    }
}

fn validate_service_url(url: &str) -> Result<(), ValidationError> {
    let rest = url
        .strip_prefix("pulsar://")
        .or_else(|| url.strip_prefix("pulsar+ssl://"))
        .ok_or_else(|| {
            ValidationError::new("invalid_scheme").with_message(
                format!("Service URL must start with pulsar:// or pulsar+ssl://: {url}").into(),
            )
        })?;

    if rest.is_empty() {
        return Err(ValidationError::new("missing_host")
            .with_message(format!("Service URL has no host: {url}").into()));
    }

    Ok(())
}

/// How a producer shares its topic with other producers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProducerAccessMode {
    /// Any number of producers.
    #[default]
    Shared,
    /// Fails (retryably) while another producer is attached.
    Exclusive,
    /// Takes over the topic, fencing the previous exclusive producer.
    ExclusiveWithFencing,
    /// Queues behind the current exclusive producer.
    WaitForExclusive,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct ProducerOptions {
    #[validate(length(min = 1, max = 1024, message = "Topic must be between 1 and 1024 characters"))]
    pub topic: String,

    #[validate(length(min = 1, max = 255, message = "Producer name must be between 1 and 255 characters"))]
    pub producer_name: Option<String>,

    pub access_mode: ProducerAccessMode,
}

impl ProducerOptions {
    pub fn new(topic: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            ..Self::default()
        }
    }

    pub fn with_producer_name(mut self, name: impl Into<String>) -> Self {
        self.producer_name = Some(name.into());
        self
    }

    pub fn with_access_mode(mut self, access_mode: ProducerAccessMode) -> Self {
        self.access_mode = access_mode;
        self
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionType {
    #[default]
    Exclusive,
    Shared,
    Failover,
    KeyShared,
}

/// Where a new subscription starts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionInitialPosition {
    #[default]
    Latest,
    Earliest,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct ConsumerOptions {
    #[validate(length(min = 1, max = 1024, message = "Topic must be between 1 and 1024 characters"))]
    pub topic: String,

    #[validate(length(min = 1, max = 255, message = "Subscription name must be between 1 and 255 characters"))]
    pub subscription_name: String,

    pub subscription_type: SubscriptionType,

    pub initial_position: SubscriptionInitialPosition,
}

impl ConsumerOptions {
    pub fn new(topic: impl Into<String>, subscription_name: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            subscription_name: subscription_name.into(),
            ..Self::default()
        }
    }

    pub fn with_subscription_type(mut self, subscription_type: SubscriptionType) -> Self {
        self.subscription_type = subscription_type;
        self
    }

    pub fn with_initial_position(mut self, initial_position: SubscriptionInitialPosition) -> Self {
        self.initial_position = initial_position;
        self
    }
}

/// Where a reader starts reading.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StartPosition {
    #[default]
    Earliest,
    Latest,
    MessageId(MessageId),
}

impl StartPosition {
    pub fn message_id(&self) -> MessageId {
        match self {
            StartPosition::Earliest => MessageId::EARLIEST,
            StartPosition::Latest => MessageId::LATEST,
            StartPosition::MessageId(id) => *id,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct ReaderOptions {
    #[validate(length(min = 1, max = 1024, message = "Topic must be between 1 and 1024 characters"))]
    pub topic: String,

    pub start_position: StartPosition,
}

impl ReaderOptions {
    pub fn new(topic: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            ..Self::default()
        }
    }

    pub fn with_start_position(mut self, start_position: StartPosition) -> Self {
        self.start_position = start_position;
        self
    }
}
