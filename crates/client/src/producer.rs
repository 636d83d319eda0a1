//! Producers publish payloads to one topic.
//!
//! Sends go through the executor, so they wait out reconnects and retry
//! transient broker errors. A fenced producer stays fenced.

use std::sync::Arc;

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use super::{
    channel::Command,
    correlation::CorrelationId,
    entity::EntityCore,
    error::Result,
    message::{MessageId, OutgoingMessage},
    sequence::Sequence,
    state::{EntityState, ProducerState},
};

/// Publishes messages to one topic, reconnecting as needed.
///
/// Cloning yields another handle to the same producer.
#[derive(Clone)]
pub struct Producer {
    core: Arc<EntityCore<ProducerState>>,
}

impl std::fmt::Debug for Producer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Producer")
            .field("correlation_id", &self.core.correlation_id())
            .field("topic", &self.core.topic())
            .field("state", &self.state())
            .finish()
    }
}

impl Producer {
    pub(crate) fn new(core: Arc<EntityCore<ProducerState>>) -> Self {
        Self { core }
    }

    pub fn correlation_id(&self) -> CorrelationId {
        self.core.correlation_id()
    }

    pub fn topic(&self) -> &str {
        self.core.topic()
    }

    pub fn state(&self) -> ProducerState {
        self.core.state().current()
    }

    pub fn is_final_state(&self) -> bool {
        self.core.state().is_final_state()
    }

    pub fn is_final(&self, state: ProducerState) -> bool {
        state.is_final()
    }

    pub async fn state_changed_to(
        &self,
        state: ProducerState,
        cancel: &CancellationToken,
    ) -> Result<ProducerState> {
        self.core.state_changed_to(state, cancel).await
    }

    pub async fn state_changed_from(
        &self,
        state: ProducerState,
        cancel: &CancellationToken,
    ) -> Result<ProducerState> {
        self.core.state_changed_from(state, cancel).await
    }

    /// Watch channel following every state transition.
    pub fn subscribe_state(&self) -> watch::Receiver<ProducerState> {
        self.core.state().subscribe()
    }

    pub async fn send(
        &self,
        payload: impl Into<Sequence>,
        cancel: &CancellationToken,
    ) -> Result<MessageId> {
        self.send_message(OutgoingMessage::new(payload), cancel)
            .await
    }

    /// Sends `message`, retrying across reconnects until the broker acknowledges it.
    pub async fn send_message(
        &self,
        message: OutgoingMessage,
        cancel: &CancellationToken,
    ) -> Result<MessageId> {
        self.core
            .execute(
                || {
                    let channel = self.core.channel();
                    let command = Command::Send(message.clone());
                    async move { channel.send(command, cancel).await?.into_receipt() }
                },
                cancel,
            )
            .await
    }

    pub fn is_disposed(&self) -> bool {
        self.core.is_disposed()
    }

    /// Closes the producer. Safe to call more than once or concurrently.
    pub async fn dispose(&self) {
        self.core.dispose().await;
    }
}
