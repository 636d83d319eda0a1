//! The seam between the lifecycle engine and a concrete transport.
//!
//! A [`Channel`] is one entity's logical stream over a broker connection.
//! Channels are produced by a [`ConnectChannel`] factory and report their
//! transport state upward through [`ChannelEvents`]. The engine never looks
//! at transport state directly; it only reacts to those reports.
//!
//! Each entity keeps its current channel in a [`ChannelSlot`]. The slot is
//! only replaced from inside the entity's action queue, and starts out (and
//! falls back to) a [`NotReadyChannel`] whose operations fail with the
//! retryable [`ClientError::ChannelNotReady`].

use std::{
    fmt,
    sync::{Arc, RwLock},
};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::{
    config::{ProducerAccessMode, SubscriptionInitialPosition, SubscriptionType},
    correlation::CorrelationId,
    error::{ClientError, Result},
    events::{Event, RegisterEvent},
    message::{Message, MessageId, OutgoingMessage, SeekPosition},
    state::EntityKind,
};

/// Raw state of the transport underneath one entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportState {
    Connected,
    Disconnected,
    ClosedByServer,
    WaitingForExclusive,
    /// The consumer became the active one of a failover subscription.
    Active,
    /// The consumer is standing by in a failover subscription.
    Inactive,
    ReachedEndOfTopic,
    Unsubscribed,
}

impl TransportState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransportState::Connected => "Connected",
            TransportState::Disconnected => "Disconnected",
            TransportState::ClosedByServer => "ClosedByServer",
            TransportState::WaitingForExclusive => "WaitingForExclusive",
            TransportState::Active => "Active",
            TransportState::Inactive => "Inactive",
            TransportState::ReachedEndOfTopic => "ReachedEndOfTopic",
            TransportState::Unsubscribed => "Unsubscribed",
        }
    }
}

impl fmt::Display for TransportState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Request/response commands an entity sends over its channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Send(OutgoingMessage),
    Acknowledge {
        message_id: MessageId,
        cumulative: bool,
    },
    Seek(SeekPosition),
    GetLastMessageId,
    Unsubscribe,
}

impl Command {
    pub fn as_str(&self) -> &'static str {
        match self {
            Command::Send(_) => "Send",
            Command::Acknowledge { .. } => "Acknowledge",
            Command::Seek(_) => "Seek",
            Command::GetLastMessageId => "GetLastMessageId",
            Command::Unsubscribe => "Unsubscribe",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    /// Broker receipt for a sent message.
    Receipt(MessageId),
    LastMessageId(MessageId),
    Success,
}

impl Response {
    pub fn as_str(&self) -> &'static str {
        match self {
            Response::Receipt(_) => "Receipt",
            Response::LastMessageId(_) => "LastMessageId",
            Response::Success => "Success",
        }
    }

    pub fn into_receipt(self) -> Result<MessageId> {
        match self {
            Response::Receipt(id) => Ok(id),
            other => Err(other.unexpected("Receipt")),
        }
    }

    pub fn into_last_message_id(self) -> Result<MessageId> {
        match self {
            Response::LastMessageId(id) => Ok(id),
            other => Err(other.unexpected("LastMessageId")),
        }
    }

    pub fn into_success(self) -> Result<()> {
        match self {
            Response::Success => Ok(()),
            other => Err(other.unexpected("Success")),
        }
    }

    fn unexpected(&self, expected: &'static str) -> ClientError {
        ClientError::UnexpectedResponse {
            expected,
            actual: self.as_str(),
        }
    }
}

/// One entity's logical stream over a broker connection.
#[async_trait]
pub trait Channel: Send + Sync + 'static {
    async fn send(&self, command: Command, cancel: &CancellationToken) -> Result<Response>;

    async fn receive(&self, cancel: &CancellationToken) -> Result<Message>;

    /// Tells the broker the client is closing this channel. Idempotent.
    async fn closed_by_client(&self) -> Result<()>;

    /// Releases local resources. Idempotent.
    async fn dispose(&self);
}

/// Placeholder used while an entity has no live channel.
#[derive(Debug, Default)]
pub struct NotReadyChannel;

#[async_trait]
impl Channel for NotReadyChannel {
    async fn send(&self, _command: Command, _cancel: &CancellationToken) -> Result<Response> {
        Err(ClientError::ChannelNotReady)
    }

    async fn receive(&self, _cancel: &CancellationToken) -> Result<Message> {
        Err(ClientError::ChannelNotReady)
    }

    async fn closed_by_client(&self) -> Result<()> {
        Ok(())
    }

    async fn dispose(&self) {}
}

/// Holder of an entity's current channel.
pub struct ChannelSlot {
    current: RwLock<Arc<dyn Channel>>,
}

impl Default for ChannelSlot {
    fn default() -> Self {
        Self {
            current: RwLock::new(Arc::new(NotReadyChannel)),
        }
    }
}

impl ChannelSlot {
    /// The channel to use for the next attempt.
    pub fn current(&self) -> Arc<dyn Channel> {
        Arc::clone(&self.current.read().unwrap_or_else(|p| p.into_inner()))
    }

    /// Installs `channel` and returns the one it replaced.
    pub fn replace(&self, channel: Arc<dyn Channel>) -> Arc<dyn Channel> {
        let mut current = self.current.write().unwrap_or_else(|p| p.into_inner());
        std::mem::replace(&mut *current, channel)
    }

    /// Puts the not-ready placeholder back and returns the live channel.
    pub fn take(&self) -> Arc<dyn Channel> {
        self.replace(Arc::new(NotReadyChannel))
    }
}

/// Entity-specific part of a connect request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelTarget {
    Producer {
        producer_name: Option<String>,
        access_mode: ProducerAccessMode,
    },
    Consumer {
        subscription: String,
        subscription_type: SubscriptionType,
        initial_position: SubscriptionInitialPosition,
    },
    Reader {
        start_message_id: MessageId,
    },
}

/// Everything a channel factory needs to open a channel for one entity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelRequest {
    pub correlation_id: CorrelationId,
    pub topic: String,
    pub target: ChannelTarget,
}

impl ChannelRequest {
    pub fn kind(&self) -> EntityKind {
        match self.target {
            ChannelTarget::Producer { .. } => EntityKind::Producer,
            ChannelTarget::Consumer { .. } => EntityKind::Consumer,
            ChannelTarget::Reader { .. } => EntityKind::Reader,
        }
    }
}

/// Handle a channel uses to report its transport state to the owning process.
#[derive(Clone)]
pub struct ChannelEvents {
    correlation_id: CorrelationId,
    register: Arc<dyn RegisterEvent>,
}

impl fmt::Debug for ChannelEvents {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelEvents")
            .field("correlation_id", &self.correlation_id)
            .finish_non_exhaustive()
    }
}

impl ChannelEvents {
    pub fn new(correlation_id: CorrelationId, register: Arc<dyn RegisterEvent>) -> Self {
        Self {
            correlation_id,
            register,
        }
    }

    pub fn correlation_id(&self) -> CorrelationId {
        self.correlation_id
    }

    pub fn report(&self, state: TransportState) {
        debug!("Channel for {} reported {}", self.correlation_id, state);
        self.register.register(Event::ChannelStateChanged {
            correlation_id: self.correlation_id,
            state,
        });
    }

    pub fn connected(&self) {
        self.report(TransportState::Connected);
    }

    pub fn disconnected(&self) {
        self.report(TransportState::Disconnected);
    }

    pub fn closed_by_server(&self) {
        self.report(TransportState::ClosedByServer);
    }

    pub fn waiting_for_exclusive(&self) {
        self.report(TransportState::WaitingForExclusive);
    }

    pub fn activated(&self) {
        self.report(TransportState::Active);
    }

    pub fn deactivated(&self) {
        self.report(TransportState::Inactive);
    }

    pub fn reached_end_of_topic(&self) {
        self.report(TransportState::ReachedEndOfTopic);
    }

    pub fn unsubscribed(&self) {
        self.report(TransportState::Unsubscribed);
    }
}

/// Channel factory.
#[async_trait]
pub trait ConnectChannel: Send + Sync + 'static {
    async fn connect(
        &self,
        request: &ChannelRequest,
        events: ChannelEvents,
        cancel: &CancellationToken,
    ) -> Result<Arc<dyn Channel>>;
}
