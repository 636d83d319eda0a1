//! Retry engine for caller operations.
//!
//! [`Executor::execute`] runs an operation against whatever channel the entity
//! currently holds and keeps re-running it across reconnects until it
//! succeeds, the caller cancels, the entity goes terminal, or a fatal fault
//! occurs. Fatal faults are registered as [`Event::ExecutorFaulted`] so the
//! owning process can move the entity to its terminal state.

use std::{fmt, future::Future, sync::Arc};

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use super::{
    backoff::RetryPolicy,
    correlation::CorrelationId,
    error::{ClientError, Disposition, Result},
    events::{Event, RegisterEvent},
    state::{EntityKind, EntityState},
    state_manager::StateManager,
};

/// What an application fault handler sees.
#[derive(Debug)]
pub struct FaultContext<'a> {
    pub correlation_id: CorrelationId,
    pub kind: EntityKind,
    pub error: &'a ClientError,
    pub disposition: Disposition,
}

/// Observes faults; it cannot change how they are handled.
pub type FaultHandler = Arc<dyn Fn(&FaultContext<'_>) + Send + Sync>;

pub(crate) fn report_fault(
    handler: Option<&FaultHandler>,
    correlation_id: CorrelationId,
    kind: EntityKind,
    error: &ClientError,
) {
    if let Some(handler) = handler {
        handler(&FaultContext {
            correlation_id,
            kind,
            error,
            disposition: error.disposition(),
        });
    }
}

pub struct Executor<S: EntityState> {
    correlation_id: CorrelationId,
    state: StateManager<S>,
    register: Arc<dyn RegisterEvent>,
    retry: RetryPolicy,
    fault_handler: Option<FaultHandler>,
}

impl<S: EntityState> fmt::Debug for Executor<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Executor")
            .field("correlation_id", &self.correlation_id)
            .field("state", &self.state)
            .field("retry", &self.retry)
            .finish_non_exhaustive()
    }
}

impl<S: EntityState> Executor<S> {
    pub fn new(
        correlation_id: CorrelationId,
        state: StateManager<S>,
        register: Arc<dyn RegisterEvent>,
        retry: RetryPolicy,
        fault_handler: Option<FaultHandler>,
    ) -> Self {
        Self {
            correlation_id,
            state,
            register,
            retry,
            fault_handler,
        }
    }

    /// Runs `operation` until it succeeds or a stop condition is reached.
    ///
    /// `operation` is invoked once per attempt and should look up the current
    /// channel each time.
    pub async fn execute<T, F, Fut>(&self, mut operation: F, cancel: &CancellationToken) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut backoff = self.retry.backoff();

        loop {
            if cancel.is_cancelled() {
                return Err(ClientError::Cancelled);
            }
            if let Some(terminal) = self.state.current().terminal_error() {
                return Err(terminal);
            }

            let outcome = tokio::select! {
                biased;
                _ = cancel.cancelled() => Err(ClientError::Cancelled),
                outcome = operation() => outcome,
            };

            let fault = match outcome {
                Ok(value) => return Ok(value),
                Err(fault) if fault.is_cancelled() => return Err(fault),
                Err(fault) => fault,
            };

            report_fault(self.fault_handler.as_ref(), self.correlation_id, S::KIND, &fault);

            if fault.disposition() == Disposition::Fatal {
                return Err(self.fail(fault));
            }

            let delay = match backoff.next_sleep() {
                Ok(delay) => delay,
                Err(exhausted) => return Err(self.fail(exhausted.into())),
            };

            warn!(
                "{} {} operation failed, retrying in {:.2} seconds: {}",
                S::KIND,
                self.correlation_id,
                delay.as_secs_f64(),
                fault
            );

            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(ClientError::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
            debug!(
                "{} {} retrying operation (attempt {})",
                S::KIND,
                self.correlation_id,
                backoff.attempt() + 1
            );
        }
    }

    fn fail(&self, fault: ClientError) -> ClientError {
        // errors produced by a state that is already terminal need no escalation
        if !self.state.is_final_state() {
            error!(
                "{} {} operation failed fatally: {}",
                S::KIND,
                self.correlation_id,
                fault
            );
            self.register.register(Event::ExecutorFaulted {
                correlation_id: self.correlation_id,
                fault: fault.clone(),
            });
        }
        fault
    }
}
