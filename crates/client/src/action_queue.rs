//! Ordered, single-worker queue of recovery actions.
//!
//! Every state-driven side effect of a [`Process`](crate::Process) (closing a
//! channel, reconnecting, recording a deferred transition, notifying the
//! entity of a fault) runs through one `ActionQueue`. A single spawned worker
//! awaits each action to completion before starting the next, which keeps
//! recovery strictly ordered and means at most one reconnect sequence is in
//! flight per entity.
//!
//! Action failures never stop the worker: they are handed to the fault
//! callback supplied at construction.

use std::{
    future::Future,
    panic::AssertUnwindSafe,
    sync::{Arc, Mutex},
};

use futures_util::{future::BoxFuture, FutureExt};
use tokio::{sync::mpsc, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::error::{ClientError, Result};

/// A queued unit of work. Receives the queue's cancellation token.
pub type Action = Box<dyn FnOnce(CancellationToken) -> BoxFuture<'static, Result<()>> + Send>;

/// Receives errors returned by actions.
pub type ActionFaultHandler = Arc<dyn Fn(ClientError) + Send + Sync>;

pub struct ActionQueue {
    name: String,
    tx: Mutex<Option<mpsc::UnboundedSender<Action>>>,
    cancel: CancellationToken,
    worker: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

impl ActionQueue {
    /// Spawns the worker; must be called from within a Tokio runtime.
    pub fn new(name: impl Into<String>, on_fault: ActionFaultHandler) -> Self {
        let name = name.into();
        let (tx, rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();

        let worker = tokio::spawn(run_worker(name.clone(), rx, cancel.clone(), on_fault));

        Self {
            name,
            tx: Mutex::new(Some(tx)),
            cancel,
            worker: tokio::sync::Mutex::new(Some(worker)),
        }
    }

    /// Queues `action` behind everything already queued.
    ///
    /// Never blocks, so it is safe to call from inside a running action.
    /// Returns `false` once the queue has been shut down.
    pub fn enqueue<F, Fut>(&self, action: F) -> bool
    where
        F: FnOnce(CancellationToken) -> Fut + Send + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let action: Action = Box::new(move |token| action(token).boxed());

        let guard = self.tx.lock().unwrap_or_else(|p| p.into_inner());
        match guard.as_ref() {
            Some(tx) => tx.send(action).is_ok(),
            None => {
                debug!("Action queue {} is shut down, rejecting action", self.name);
                false
            }
        }
    }

    pub fn is_accepting(&self) -> bool {
        self.tx
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .is_some()
    }

    /// Stops accepting work, cancels the queue token, lets the worker run the
    /// actions already queued, and waits for it to finish.
    ///
    /// Idempotent. Concurrent callers all return after the worker is gone.
    /// Must not be awaited from inside an action of the same queue.
    pub async fn shutdown(&self) {
        let sender = self.tx.lock().unwrap_or_else(|p| p.into_inner()).take();
        if sender.is_some() {
            debug!("Shutting down action queue {}", self.name);
        }
        drop(sender);
        self.cancel.cancel();

        let mut worker = self.worker.lock().await;
        if let Some(handle) = worker.take() {
            if let Err(e) = handle.await {
                warn!("Action queue {} worker ended abnormally: {}", self.name, e);
            }
        }
    }
}

impl Drop for ActionQueue {
    fn drop(&mut self) {
        // worker exits once the channel closes
        self.cancel.cancel();
    }
}

async fn run_worker(
    name: String,
    mut rx: mpsc::UnboundedReceiver<Action>,
    cancel: CancellationToken,
    on_fault: ActionFaultHandler,
) {
    debug!("Action queue {} worker started", name);

    while let Some(action) = rx.recv().await {
        let outcome = AssertUnwindSafe(action(cancel.clone()))
            .catch_unwind()
            .await
            .unwrap_or_else(|_| Err(ClientError::Internal("recovery action panicked".into())));

        if let Err(e) = outcome {
            if e.is_cancelled() {
                debug!("Action on queue {} observed cancellation", name);
            } else {
                warn!("Action on queue {} failed: {}", name, e);
            }
            on_fault(e);
        }
    }

    debug!("Action queue {} worker stopped", name);
}
