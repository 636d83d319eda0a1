//! Error type shared by every layer of the client.
//!
//! `ClientError` covers transport faults reported by channels, broker
//! responses, lifecycle guards (disposed or terminal entities) and local
//! configuration problems. Each variant carries a [`Disposition`] that the
//! executor and the reconnect loop use to decide between retrying and giving
//! up.
//!
//! # Categories
//!
//! **Transient** (retried after the configured interval):
//! - `ChannelNotReady`, `ConnectionClosed`, `Timeout`
//! - `ServiceNotReady`, `TooManyRequests`
//! - `ProducerBusy`, `ConsumerBusy`
//! - `Io` for network-flavoured error kinds
//!
//! **Fatal** (the entity moves to a terminal state):
//! - `ProducerFenced` (terminal `Fenced` for producers)
//! - `AuthenticationFailed`, `AuthorizationFailed`, `ProtocolViolation`
//! - `TopicNotFound`, `SubscriptionNotFound`, `RetriesExhausted`
//!
//! **Signals** (never retried, never change state):
//! - `Cancelled`
//! - the `*Disposed` and `*Closed` guards returned once an entity is gone

use std::{io, sync::Arc};

use thiserror::Error;

use super::{backoff::BackoffError, state::EntityKind};

/// How a fault should be handled by retrying code paths.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// The fault is temporary; waiting and trying again is reasonable.
    Retry,
    /// Retrying makes no sense; surface the fault.
    Fatal,
}

/// The unified error type for client operations.
#[derive(Debug, Clone, Error)]
pub enum ClientError {
    /// The entity has no usable channel yet (initial connect or reconnect in progress).
    #[error("Channel is not ready")]
    ChannelNotReady,

    /// The channel was closed underneath an in-flight operation.
    #[error("Connection closed: {0}")]
    ConnectionClosed(String),

    /// The broker did not answer in time.
    #[error("Operation timed out")]
    Timeout,

    /// The broker asked the client to try again later.
    #[error("Service not ready: {0}")]
    ServiceNotReady(String),

    /// The broker is throttling this client.
    #[error("Too many requests")]
    TooManyRequests,

    /// Another producer currently holds exclusive access to the topic.
    #[error("Producer busy: {0}")]
    ProducerBusy(String),

    /// Another consumer currently holds the exclusive subscription.
    #[error("Consumer busy: {0}")]
    ConsumerBusy(String),

    /// A newer exclusive producer took over the topic.
    #[error("Producer fenced: {0}")]
    ProducerFenced(String),

    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("Authorization failed: {0}")]
    AuthorizationFailed(String),

    /// The broker or the channel violated the protocol contract.
    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("Topic not found: {0}")]
    TopicNotFound(String),

    #[error("Subscription not found: {0}")]
    SubscriptionNotFound(String),

    /// The retry policy gave up.
    #[error("Retry policy error: {0}")]
    RetriesExhausted(#[from] BackoffError),

    /// Options or client configuration failed validation.
    #[error("Configuration error: {0}")]
    Config(#[from] validator::ValidationErrors),

    /// Transport-level I/O error.
    #[error("IO error: {0}")]
    Io(Arc<io::Error>),

    /// The calling operation was cancelled through its token.
    #[error("Operation was cancelled")]
    Cancelled,

    #[error("Producer has been disposed")]
    ProducerDisposed,

    #[error("Consumer has been disposed")]
    ConsumerDisposed,

    #[error("Reader has been disposed")]
    ReaderDisposed,

    #[error("Client has been disposed")]
    ClientDisposed,

    #[error("Producer is closed")]
    ProducerClosed,

    #[error("Consumer is closed")]
    ConsumerClosed,

    #[error("Reader is closed")]
    ReaderClosed,

    /// The entity moved to its generic `Faulted` terminal state.
    #[error("{0} is faulted")]
    EntityFaulted(EntityKind),

    /// A terminated topic has no more messages for this consumer or reader.
    #[error("{0} has reached the end of the topic")]
    ReachedEndOfTopic(EntityKind),

    #[error("Consumer has been unsubscribed")]
    ConsumerUnsubscribed,

    /// The channel answered a command with the wrong kind of response.
    #[error("Unexpected response: expected {expected}, got {actual}")]
    UnexpectedResponse {
        expected: &'static str,
        actual: &'static str,
    },

    /// A bug inside the client (e.g. a panicking recovery action).
    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<io::Error> for ClientError {
    fn from(err: io::Error) -> Self {
        ClientError::Io(Arc::new(err))
    }
}

impl ClientError {
    /// Classifies the fault as retryable or fatal.
    pub fn disposition(&self) -> Disposition {
        use Disposition::*;

        match self {
            ClientError::ChannelNotReady
            | ClientError::ConnectionClosed(_)
            | ClientError::Timeout
            | ClientError::ServiceNotReady(_)
            | ClientError::TooManyRequests
            | ClientError::ProducerBusy(_)
            | ClientError::ConsumerBusy(_) => Retry,

            ClientError::Io(e) => match e.kind() {
                // local misconfiguration, not a network hiccup
                io::ErrorKind::AddrInUse
                | io::ErrorKind::PermissionDenied
                | io::ErrorKind::InvalidInput
                | io::ErrorKind::InvalidData => Fatal,
                _ => Retry,
            },

            _ => Fatal,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.disposition() == Disposition::Retry
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, ClientError::Cancelled)
    }

    /// True for the fault that fences a producer off its topic.
    pub fn is_fencing(&self) -> bool {
        matches!(self, ClientError::ProducerFenced(_))
    }

    /// Short variant name, used in logs and in `UnexpectedResponse`.
    pub fn as_str(&self) -> &'static str {
        match self {
            ClientError::ChannelNotReady => "ChannelNotReady",
            ClientError::ConnectionClosed(_) => "ConnectionClosed",
            ClientError::Timeout => "Timeout",
            ClientError::ServiceNotReady(_) => "ServiceNotReady",
            ClientError::TooManyRequests => "TooManyRequests",
            ClientError::ProducerBusy(_) => "ProducerBusy",
            ClientError::ConsumerBusy(_) => "ConsumerBusy",
            ClientError::ProducerFenced(_) => "ProducerFenced",
            ClientError::AuthenticationFailed(_) => "AuthenticationFailed",
            ClientError::AuthorizationFailed(_) => "AuthorizationFailed",
            ClientError::ProtocolViolation(_) => "ProtocolViolation",
            ClientError::TopicNotFound(_) => "TopicNotFound",
            ClientError::SubscriptionNotFound(_) => "SubscriptionNotFound",
            ClientError::RetriesExhausted(_) => "RetriesExhausted",
            ClientError::Config(_) => "Config",
            ClientError::Io(_) => "Io",
            ClientError::Cancelled => "Cancelled",
            ClientError::ProducerDisposed => "ProducerDisposed",
            ClientError::ConsumerDisposed => "ConsumerDisposed",
            ClientError::ReaderDisposed => "ReaderDisposed",
            ClientError::ClientDisposed => "ClientDisposed",
            ClientError::ProducerClosed => "ProducerClosed",
            ClientError::ConsumerClosed => "ConsumerClosed",
            ClientError::ReaderClosed => "ReaderClosed",
            ClientError::EntityFaulted(_) => "EntityFaulted",
            ClientError::ReachedEndOfTopic(_) => "ReachedEndOfTopic",
            ClientError::ConsumerUnsubscribed => "ConsumerUnsubscribed",
            ClientError::UnexpectedResponse { .. } => "UnexpectedResponse",
            ClientError::Internal(_) => "Internal",
        }
    }
}

/// Result type for client operations.
pub type Result<T> = std::result::Result<T, ClientError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_faults_are_retryable() {
        assert!(ClientError::ChannelNotReady.is_retryable());
        assert!(ClientError::ConnectionClosed("reset".into()).is_retryable());
        assert!(ClientError::Timeout.is_retryable());
        assert!(ClientError::ServiceNotReady("bundle unloading".into()).is_retryable());
        assert!(ClientError::TooManyRequests.is_retryable());
        assert!(ClientError::ProducerBusy("exclusive".into()).is_retryable());
    }

    #[test]
    fn fencing_and_protocol_faults_are_fatal() {
        assert_eq!(
            ClientError::ProducerFenced("epoch 3".into()).disposition(),
            Disposition::Fatal
        );
        assert_eq!(
            ClientError::ProtocolViolation("bad frame".into()).disposition(),
            Disposition::Fatal
        );
        assert_eq!(
            ClientError::AuthorizationFailed("role".into()).disposition(),
            Disposition::Fatal
        );
    }

    #[test]
    fn cancellation_is_not_retryable() {
        assert!(!ClientError::Cancelled.is_retryable());
        assert!(ClientError::Cancelled.is_cancelled());
    }

    #[test]
    fn io_errors_are_classified_by_kind() {
        let reset: ClientError =
            io::Error::new(io::ErrorKind::ConnectionReset, "connection reset").into();
        assert!(reset.is_retryable());

        let denied: ClientError =
            io::Error::new(io::ErrorKind::PermissionDenied, "permission denied").into();
        assert!(!denied.is_retryable());
    }

    #[test]
    fn display_messages() {
        assert_eq!(
            ClientError::EntityFaulted(EntityKind::Producer).to_string(),
            "Producer is faulted"
        );
        assert_eq!(
            ClientError::ReachedEndOfTopic(EntityKind::Reader).to_string(),
            "Reader has reached the end of the topic"
        );
        assert!(ClientError::ProducerFenced("taken over".into())
            .to_string()
            .contains("taken over"));
    }

    #[test]
    fn errors_clone_with_shared_io_source() {
        let err: ClientError = io::Error::new(io::ErrorKind::BrokenPipe, "pipe").into();
        let cloned = err.clone();
        assert_eq!(err.to_string(), cloned.to_string());
        assert_eq!(cloned.as_str(), "Io");
    }
}
