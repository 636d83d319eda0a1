//! Machinery shared by producers, consumers and readers.
//!
//! [`EntityCore`] is what a process supervises: it owns the channel slot, the
//! connect request, the executor and the reconnect loop. The public entity
//! types are thin wrappers adding their kind-specific operations.

use std::{
    future::Future,
    sync::{Arc, OnceLock, Weak},
};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{
    backoff::RetryPolicy,
    channel::{Channel, ChannelEvents, ChannelRequest, ChannelSlot, ChannelTarget, ConnectChannel},
    correlation::CorrelationId,
    error::{ClientError, Disposition, Result},
    events::{ProcessManager, RegisterEvent},
    executor::{report_fault, Executor, FaultHandler},
    process::{ContainsChannel, Process},
    state::EntityState,
    state_manager::StateManager,
};

/// What a client hands to every entity it creates.
#[derive(Clone)]
pub(crate) struct ClientContext {
    pub manager: Arc<ProcessManager>,
    pub connector: Arc<dyn ConnectChannel>,
    pub retry: RetryPolicy,
    pub reconnect: RetryPolicy,
    pub fault_handler: Option<FaultHandler>,
}

pub(crate) struct EntityCore<S: EntityState> {
    correlation_id: CorrelationId,
    request: ChannelRequest,
    slot: ChannelSlot,
    connector: Arc<dyn ConnectChannel>,
    events: ChannelEvents,
    state: StateManager<S>,
    executor: Executor<S>,
    reconnect: RetryPolicy,
    fault_handler: Option<FaultHandler>,
    process: OnceLock<Arc<Process<S>>>,
}

impl<S: EntityState> EntityCore<S> {
    /// Creates the entity and its process, registers the process for event
    /// routing and starts it.
    pub fn spawn(ctx: &ClientContext, topic: String, target: ChannelTarget) -> Arc<Self> {
        let correlation_id = CorrelationId::new();
        let register: Arc<dyn RegisterEvent> = ctx.manager.clone();
        let state = StateManager::new(S::INITIAL);

        let core = Arc::new(Self {
            correlation_id,
            request: ChannelRequest {
                correlation_id,
                topic,
                target,
            },
            slot: ChannelSlot::default(),
            connector: Arc::clone(&ctx.connector),
            events: ChannelEvents::new(correlation_id, Arc::clone(&register)),
            state: state.clone(),
            executor: Executor::new(
                correlation_id,
                state.clone(),
                Arc::clone(&register),
                ctx.retry,
                ctx.fault_handler.clone(),
            ),
            reconnect: ctx.reconnect,
            fault_handler: ctx.fault_handler.clone(),
            process: OnceLock::new(),
        });

        let weak: Weak<Self> = Arc::downgrade(&core);
        let weak: Weak<dyn ContainsChannel> = weak;
        let process = Process::new(
            correlation_id,
            state,
            weak,
            register,
            ctx.fault_handler.clone(),
        );
        ctx.manager.add(process.clone());
        // only ever set here, right after construction
        let _ = core.process.set(Arc::clone(&process));

        info!(
            "{} {} created for topic {}",
            S::KIND,
            correlation_id,
            core.request.topic
        );
        process.start();

        core
    }

    pub fn correlation_id(&self) -> CorrelationId {
        self.correlation_id
    }

    pub fn topic(&self) -> &str {
        &self.request.topic
    }

    pub fn state(&self) -> &StateManager<S> {
        &self.state
    }

    pub fn is_disposed(&self) -> bool {
        self.process.get().is_some_and(|p| p.is_disposed())
    }

    fn guard(&self) -> Result<()> {
        if self.is_disposed() {
            return Err(S::KIND.disposed_error());
        }
        Ok(())
    }

    /// Current channel; re-read on every executor attempt.
    pub fn channel(&self) -> Arc<dyn Channel> {
        self.slot.current()
    }

    /// Runs `operation` through the executor after the disposal guard.
    pub async fn execute<T, F, Fut>(&self, operation: F, cancel: &CancellationToken) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.guard()?;
        self.executor.execute(operation, cancel).await
    }

    pub async fn state_changed_to(&self, state: S, cancel: &CancellationToken) -> Result<S> {
        self.guard()?;
        self.state.state_changed_to(state, cancel).await
    }

    pub async fn state_changed_from(&self, state: S, cancel: &CancellationToken) -> Result<S> {
        self.guard()?;
        self.state.state_changed_from(state, cancel).await
    }

    pub async fn dispose(&self) {
        if let Some(process) = self.process.get() {
            process.dispose().await;
        }
    }

    async fn install(&self, channel: Arc<dyn Channel>) {
        if self.is_disposed() {
            debug!(
                "{} {} disposed while connecting, releasing new channel",
                S::KIND,
                self.correlation_id
            );
            channel.dispose().await;
            return;
        }
        let previous = self.slot.replace(channel);
        previous.dispose().await;
    }
}

#[async_trait]
impl<S: EntityState> ContainsChannel for EntityCore<S> {
    async fn establish_new_channel(&self, cancel: CancellationToken) -> Result<()> {
        let mut backoff = self.reconnect.backoff();

        loop {
            if self.state.is_final_state() {
                debug!(
                    "{} {} is {}, not reconnecting",
                    S::KIND,
                    self.correlation_id,
                    self.state.current()
                );
                return Ok(());
            }

            let attempt = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(ClientError::Cancelled),
                attempt = self.connector.connect(&self.request, self.events.clone(), &cancel) => attempt,
            };

            let fault = match attempt {
                Ok(channel) => {
                    self.install(channel).await;
                    debug!(
                        "{} {} installed a new channel for topic {}",
                        S::KIND,
                        self.correlation_id,
                        self.request.topic
                    );
                    return Ok(());
                }
                Err(fault) if fault.is_cancelled() => return Err(fault),
                Err(fault) => fault,
            };

            report_fault(self.fault_handler.as_ref(), self.correlation_id, S::KIND, &fault);

            if fault.disposition() == Disposition::Fatal {
                return Err(fault);
            }

            let delay = backoff.next_sleep()?;
            warn!(
                "{} {} failed to connect to topic {}, retrying in {:.2} seconds: {}",
                S::KIND,
                self.correlation_id,
                self.request.topic,
                delay.as_secs_f64(),
                fault
            );

            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(ClientError::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    async fn close_channel(&self, _cancel: CancellationToken) -> Result<()> {
        let channel = self.slot.take();
        if let Err(e) = channel.closed_by_client().await {
            debug!(
                "{} {} close notification failed: {}",
                S::KIND,
                self.correlation_id,
                e
            );
        }
        channel.dispose().await;
        Ok(())
    }

    async fn channel_faulted(&self, fault: ClientError) -> Result<()> {
        warn!(
            "{} {} is terminal after fault: {}",
            S::KIND,
            self.correlation_id,
            fault
        );
        self.close_channel(CancellationToken::new()).await
    }
}
