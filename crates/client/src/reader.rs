//! Readers follow a topic from a start position without a durable
//! subscription. [`Reader::messages`] exposes them as a stream.

use std::{sync::Arc, time::SystemTime};

use async_stream::stream;
use futures_core::Stream;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use super::{
    channel::{Command, Response},
    correlation::CorrelationId,
    entity::EntityCore,
    error::{ClientError, Result},
    message::{Message, MessageId, SeekPosition},
    state::{EntityState, ReaderState},
};

/// Reads a topic from a chosen position without a durable subscription.
#[derive(Clone)]
pub struct Reader {
    core: Arc<EntityCore<ReaderState>>,
}

impl std::fmt::Debug for Reader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reader")
            .field("correlation_id", &self.core.correlation_id())
            .field("topic", &self.core.topic())
            .field("state", &self.state())
            .finish()
    }
}

impl Reader {
    pub(crate) fn new(core: Arc<EntityCore<ReaderState>>) -> Self {
        Self { core }
    }

    pub fn correlation_id(&self) -> CorrelationId {
        self.core.correlation_id()
    }

    pub fn topic(&self) -> &str {
        self.core.topic()
    }

    pub fn state(&self) -> ReaderState {
        self.core.state().current()
    }

    pub fn is_final_state(&self) -> bool {
        self.core.state().is_final_state()
    }

    pub fn is_final(&self, state: ReaderState) -> bool {
        state.is_final()
    }

    pub async fn state_changed_to(
        &self,
        state: ReaderState,
        cancel: &CancellationToken,
    ) -> Result<ReaderState> {
        self.core.state_changed_to(state, cancel).await
    }

    pub async fn state_changed_from(
        &self,
        state: ReaderState,
        cancel: &CancellationToken,
    ) -> Result<ReaderState> {
        self.core.state_changed_from(state, cancel).await
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ReaderState> {
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

    /// Endless stream of messages.
    ///
    /// Ends quietly when `cancel` fires. Any other error is yielded once and
    /// ends the stream.
    pub fn messages<'a>(
        &'a self,
        cancel: &'a CancellationToken,
    ) -> impl Stream<Item = Result<Message>> + Send + 'a {
        stream! {
            loop {
                match self.receive(cancel).await {
                    Ok(message) => yield Ok(message),
                    Err(ClientError::Cancelled) => break,
                    Err(e) => {
                        yield Err(e);
                        break;
                    }
                }
            }
        }
    }

    pub async fn get_last_message_id(&self, cancel: &CancellationToken) -> Result<MessageId> {
        self.command(Command::GetLastMessageId, cancel)
            .await?
            .into_last_message_id()
    }

    /// Repositions the reader at a message id or publish time.
    pub async fn seek(
        &self,
        position: impl Into<SeekPosition>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        self.command(Command::Seek(position.into()), cancel)
            .await?
            .into_success()
    }

    /// Repositions the reader at the first message published at or after `time`.
    pub async fn seek_to_time(&self, time: SystemTime, cancel: &CancellationToken) -> Result<()> {
        self.seek(time, cancel).await
    }

    async fn command(&self, command: Command, cancel: &CancellationToken) -> Result<Response> {
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
