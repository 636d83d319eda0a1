//! Consumers receive and acknowledge messages on one subscription.

use std::sync::Arc;

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use super::{
    channel::{Command, Response},
    correlation::CorrelationId,
    entity::EntityCore,
    error::Result,
    message::{Message, MessageId, SeekPosition},
    state::{ConsumerState, EntityState},
};

/// Receives messages through a named subscription.
#[derive(Clone)]
pub struct Consumer {
    core: Arc<EntityCore<ConsumerState>>,
    subscription: Arc<str>,
}

impl std::fmt::Debug for Consumer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Consumer")
            .field("correlation_id", &self.core.correlation_id())
            .field("topic", &self.core.topic())
            .field("subscription", &self.subscription)
            .field("state", &self.state())
            .finish()
    }
}

impl Consumer {
    pub(crate) fn new(core: Arc<EntityCore<ConsumerState>>, subscription: String) -> Self {
        Self {
            core,
            subscription: subscription.into(),
        }
    }

    pub fn correlation_id(&self) -> CorrelationId {
        self.core.correlation_id()
    }

    pub fn topic(&self) -> &str {
        self.core.topic()
    }

    pub fn subscription_name(&self) -> &str {
        &self.subscription
    }

    pub fn state(&self) -> ConsumerState {
        self.core.state().current()
    }

    pub fn is_final_state(&self) -> bool {
        self.core.state().is_final_state()
    }

    pub fn is_final(&self, state: ConsumerState) -> bool {
        state.is_final()
    }

    pub async fn state_changed_to(
        &self,
        state: ConsumerState,
        cancel: &CancellationToken,
    ) -> Result<ConsumerState> {
        self.core.state_changed_to(state, cancel).await
    }

    pub async fn state_changed_from(
        &self,
        state: ConsumerState,
        cancel: &CancellationToken,
    ) -> Result<ConsumerState> {
        self.core.state_changed_from(state, cancel).await
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConsumerState> {
        self.core.state().subscribe()
    }

    pub async fn receive(&self, cancel: &CancellationToken) -> Result<Message> {
        self.core
            .execute(
                || {
                    let channel = self.core.channel();
                    async move { channel.receive(cancel).await }
                },
                cancel,
            )
            .await
    }

    /// Acknowledges a single message.
    pub async fn acknowledge(&self, message_id: MessageId, cancel: &CancellationToken) -> Result<()> {
        self.command(
            Command::Acknowledge {
                message_id,
                cumulative: false,
            },
            cancel,
        )
        .await?
        .into_success()
    }

    /// Acknowledges `message_id` and everything before it.
    pub async fn acknowledge_cumulative(
        &self,
        message_id: MessageId,
        cancel: &CancellationToken,
    ) -> Result<()> {
        self.command(
            Command::Acknowledge {
                message_id,
                cumulative: true,
            },
            cancel,
        )
        .await?
        .into_success()
    }

    pub async fn get_last_message_id(&self, cancel: &CancellationToken) -> Result<MessageId> {
        self.command(Command::GetLastMessageId, cancel)
            .await?
            .into_last_message_id()
    }

    /// Moves the subscription cursor to a message id or publish time.
    pub async fn seek(
        &self,
        position: impl Into<SeekPosition>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        self.command(Command::Seek(position.into()), cancel)
            .await?
            .into_success()
    }

    /// Removes the subscription; the consumer ends in `Unsubscribed`.
    pub async fn unsubscribe(&self, cancel: &CancellationToken) -> Result<()> {
        self.command(Command::Unsubscribe, cancel)
            .await?
            .into_success()
    }

    async fn command(
        &self,
        command: Command,
        cancel: &CancellationToken,
    ) -> Result<Response> {
        self.core
            .execute(
                || {
                    let channel = self.core.channel();
                    let command = command.clone();
                    async move { channel.send(command, cancel).await }
                },
                cancel,
            )
            .await
    }

    pub fn is_disposed(&self) -> bool {
        self.core.is_disposed()
    }

    pub async fn dispose(&self) {
        self.core.dispose().await;
    }
}
