//! Observable logical state with async waiters.
//!
//! A [`StateManager`] holds the current state of one entity. Callers can
//! suspend until the state becomes (or stops being) a given value; the
//! [`Process`](crate::Process) drives transitions through
//! [`set_state`](StateManager::set_state).
//!
//! The state and the waiter list sit behind one mutex, so a waiter registered
//! concurrently with a transition is either satisfied on registration or
//! released by the transition. Nothing is lost in between.
//!
//! Final states are sticky: once the state is final, `set_state` records
//! nothing and returns the final value. Reaching a final state releases every
//! pending waiter with that state, since no other value can follow.

use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc, Mutex, MutexGuard,
};

use tokio::sync::{oneshot, watch};
use tokio_util::sync::CancellationToken;
use tracing::trace;

use super::{
    error::{ClientError, Result},
    state::EntityState,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WaitMode {
    UntilEqual,
    UntilNotEqual,
}

impl WaitMode {
    fn holds<S: PartialEq>(self, target: S, current: S) -> bool {
        match self {
            WaitMode::UntilEqual => current == target,
            WaitMode::UntilNotEqual => current != target,
        }
    }
}

struct Waiter<S> {
    id: u64,
    target: S,
    mode: WaitMode,
    tx: oneshot::Sender<S>,
}

struct Guarded<S> {
    current: S,
    waiters: Vec<Waiter<S>>,
}

struct Shared<S> {
    guarded: Mutex<Guarded<S>>,
    watch_tx: watch::Sender<S>,
    next_waiter: AtomicU64,
}

/// Cheaply cloneable handle; clones share one state.
pub struct StateManager<S: EntityState> {
    shared: Arc<Shared<S>>,
}

impl<S: EntityState> Clone for StateManager<S> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<S: EntityState> std::fmt::Debug for StateManager<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateManager")
            .field("current", &self.current())
            .finish()
    }
}

impl<S: EntityState> StateManager<S> {
    pub fn new(initial: S) -> Self {
        let (watch_tx, _) = watch::channel(initial);
        Self {
            shared: Arc::new(Shared {
                guarded: Mutex::new(Guarded {
                    current: initial,
                    waiters: Vec::new(),
                }),
                watch_tx,
                next_waiter: AtomicU64::new(0),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Guarded<S>> {
        lock_guarded(&self.shared)
    }

    pub fn current(&self) -> S {
        self.lock().current
    }

    pub fn is_final_state(&self) -> bool {
        self.current().is_final()
    }

    pub fn is_final(&self, state: S) -> bool {
        state.is_final()
    }

    /// Records `new` and returns the state it replaced.
    ///
    /// Writing the current value, or writing anything once the current state
    /// is final, changes nothing and wakes nobody; the return value then
    /// equals the current state.
    pub fn set_state(&self, new: S) -> S {
        let mut guarded = self.lock();
        let former = guarded.current;

        if former == new || former.is_final() {
            return former;
        }

        guarded.current = new;

        let waiters = std::mem::take(&mut guarded.waiters);
        let mut pending = Vec::with_capacity(waiters.len());
        for waiter in waiters {
            if new.is_final() || waiter.mode.holds(waiter.target, new) {
                // receiver may already be gone if the waiting future was dropped
                let _ = waiter.tx.send(new);
            } else {
                pending.push(waiter);
            }
        }
        guarded.waiters = pending;

        self.shared.watch_tx.send_replace(new);
        trace!("State moved from {} to {}", former, new);

        former
    }

    /// Resolves once the state equals `state`; immediately if it already does.
    /// Resolves with the final state instead if the entity ends elsewhere.
    pub async fn state_changed_to(&self, state: S, cancel: &CancellationToken) -> Result<S> {
        self.wait(state, WaitMode::UntilEqual, cancel).await
    }

    /// Resolves once the state differs from `state`; immediately if it already does.
    pub async fn state_changed_from(&self, state: S, cancel: &CancellationToken) -> Result<S> {
        self.wait(state, WaitMode::UntilNotEqual, cancel).await
    }

    /// Watch channel mirroring every recorded transition.
    pub fn subscribe(&self) -> watch::Receiver<S> {
        self.shared.watch_tx.subscribe()
    }

    /// Number of callers currently suspended.
    pub fn waiter_count(&self) -> usize {
        self.lock().waiters.len()
    }

    async fn wait(&self, target: S, mode: WaitMode, cancel: &CancellationToken) -> Result<S> {
        let (id, rx) = {
            let mut guarded = self.lock();
            if guarded.current.is_final() || mode.holds(target, guarded.current) {
                return Ok(guarded.current);
            }

            let id = self.shared.next_waiter.fetch_add(1, Ordering::Relaxed);
            let (tx, rx) = oneshot::channel();
            guarded.waiters.push(Waiter {
                id,
                target,
                mode,
                tx,
            });
            (id, rx)
        };

        // removes the waiter if this future is cancelled or dropped early
        let _registration = Registration {
            shared: &self.shared,
            id,
        };

        tokio::select! {
            biased;
            released = rx => released.map_err(|_| ClientError::Cancelled),
            _ = cancel.cancelled() => Err(ClientError::Cancelled),
        }
    }
}

fn lock_guarded<S>(shared: &Shared<S>) -> MutexGuard<'_, Guarded<S>> {
    shared
        .guarded
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}

struct Registration<'a, S> {
    shared: &'a Shared<S>,
    id: u64,
}

impl<S> Drop for Registration<'_, S> {
    fn drop(&mut self) {
        let id = self.id;
        lock_guarded(self.shared)
            .waiters
            .retain(|waiter| waiter.id != id);
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::state::ProducerState;

    #[test]
    fn test_set_state_returns_former() {
        let manager = StateManager::new(ProducerState::Disconnected);

        assert_eq!(
            manager.set_state(ProducerState::Connected),
            ProducerState::Disconnected
        );
        assert_eq!(manager.current(), ProducerState::Connected);

        // same value is a no-op and reports the unchanged state
        assert_eq!(
            manager.set_state(ProducerState::Connected),
            ProducerState::Connected
        );
    }

    #[test]
    fn test_final_states_are_sticky() {
        let manager = StateManager::new(ProducerState::Connected);

        assert_eq!(
            manager.set_state(ProducerState::Fenced),
            ProducerState::Connected
        );
        assert!(manager.is_final_state());

        assert_eq!(
            manager.set_state(ProducerState::Connected),
            ProducerState::Fenced
        );
        assert_eq!(manager.set_state(ProducerState::Closed), ProducerState::Fenced);
        assert_eq!(manager.current(), ProducerState::Fenced);
    }

    #[tokio::test]
    async fn test_wait_returns_immediately_when_state_holds() {
        let manager = StateManager::new(ProducerState::Connected);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let state = manager
            .state_changed_to(ProducerState::Connected, &cancel)
            .await
            .unwrap();
        assert_eq!(state, ProducerState::Connected);

        let state = manager
            .state_changed_from(ProducerState::Disconnected, &cancel)
            .await
            .unwrap();
        assert_eq!(state, ProducerState::Connected);
        assert_eq!(manager.waiter_count(), 0);
    }

    #[tokio::test]
    async fn test_all_matching_waiters_are_released() {
        let manager = StateManager::new(ProducerState::Disconnected);
        let cancel = CancellationToken::new();

        let mut tasks = Vec::new();
        for _ in 0..3 {
            let manager = manager.clone();
            let cancel = cancel.clone();
            tasks.push(tokio::spawn(async move {
                manager
                    .state_changed_to(ProducerState::Connected, &cancel)
                    .await
            }));
        }
        let from = {
            let manager = manager.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                manager
                    .state_changed_from(ProducerState::Disconnected, &cancel)
                    .await
            })
        };

        while manager.waiter_count() < 4 {
            tokio::task::yield_now().await;
        }

        manager.set_state(ProducerState::Connected);

        for task in tasks {
            assert_eq!(task.await.unwrap().unwrap(), ProducerState::Connected);
        }
        assert_eq!(from.await.unwrap().unwrap(), ProducerState::Connected);
        assert_eq!(manager.waiter_count(), 0);
    }

    #[tokio::test]
    async fn test_non_matching_waiters_keep_waiting() {
        let manager = StateManager::new(ProducerState::Disconnected);
        let cancel = CancellationToken::new();

        let waiter = {
            let manager = manager.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                manager
                    .state_changed_to(ProducerState::Connected, &cancel)
                    .await
            })
        };
        while manager.waiter_count() < 1 {
            tokio::task::yield_now().await;
        }

        manager.set_state(ProducerState::WaitingForExclusive);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        manager.set_state(ProducerState::Connected);
        assert_eq!(waiter.await.unwrap().unwrap(), ProducerState::Connected);
    }

    #[tokio::test]
    async fn test_final_state_releases_every_waiter() {
        let manager = StateManager::new(ProducerState::Disconnected);
        let cancel = CancellationToken::new();

        let waiter = {
            let manager = manager.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                manager
                    .state_changed_to(ProducerState::Connected, &cancel)
                    .await
            })
        };
        while manager.waiter_count() < 1 {
            tokio::task::yield_now().await;
        }

        manager.set_state(ProducerState::Fenced);
        assert_eq!(waiter.await.unwrap().unwrap(), ProducerState::Fenced);
        assert_eq!(manager.waiter_count(), 0);

        // later waits see the final state straight away
        assert_eq!(
            manager
                .state_changed_to(ProducerState::Connected, &cancel)
                .await
                .unwrap(),
            ProducerState::Fenced
        );
    }

    #[tokio::test]
    async fn test_cancellation_only_affects_one_waiter() {
        let manager = StateManager::new(ProducerState::Disconnected);
        let cancel_a = CancellationToken::new();
        let cancel_b = CancellationToken::new();

        let a = {
            let manager = manager.clone();
            let cancel = cancel_a.clone();
            tokio::spawn(async move {
                manager
                    .state_changed_to(ProducerState::Connected, &cancel)
                    .await
            })
        };
        let b = {
            let manager = manager.clone();
            let cancel = cancel_b.clone();
            tokio::spawn(async move {
                manager
                    .state_changed_to(ProducerState::Connected, &cancel)
                    .await
            })
        };
        while manager.waiter_count() < 2 {
            tokio::task::yield_now().await;
        }

        cancel_a.cancel();
        assert!(matches!(a.await.unwrap(), Err(ClientError::Cancelled)));
        assert_eq!(manager.waiter_count(), 1);

        manager.set_state(ProducerState::Connected);
        assert_eq!(b.await.unwrap().unwrap(), ProducerState::Connected);
    }

    #[tokio::test]
    async fn test_dropped_wait_removes_waiter() {
        let manager = StateManager::new(ProducerState::Disconnected);
        let cancel = CancellationToken::new();

        let result = tokio::time::timeout(
            Duration::from_millis(10),
            manager.state_changed_to(ProducerState::Connected, &cancel),
        )
        .await;

        assert!(result.is_err());
        assert_eq!(manager.waiter_count(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_set_state_reports_each_transition_once() {
        let manager = StateManager::new(ProducerState::Disconnected);

        let mut tasks = Vec::new();
        for i in 0..64 {
            let manager = manager.clone();
            tasks.push(tokio::spawn(async move {
                let target = if i % 2 == 0 {
                    ProducerState::Connected
                } else {
                    ProducerState::WaitingForExclusive
                };
                (manager.set_state(target), target)
            }));
        }

        let mut transitions = Vec::new();
        for task in tasks {
            let (former, new) = task.await.unwrap();
            if former != new {
                transitions.push((former, new));
            }
        }

        // the recorded pairs must form one unbroken path from the initial
        // state to the current one: every state is left exactly as often as
        // it is entered, except at the two ends of the path
        let last = manager.current();
        assert_ne!(last, ProducerState::Disconnected);
        assert_eq!(
            transitions
                .iter()
                .filter(|(former, _)| *former == ProducerState::Disconnected)
                .count(),
            1
        );
        for state in [
            ProducerState::Disconnected,
            ProducerState::Connected,
            ProducerState::WaitingForExclusive,
        ] {
            let left = transitions.iter().filter(|(f, _)| *f == state).count() as i64;
            let entered = transitions.iter().filter(|(_, n)| *n == state).count() as i64;
            let start = i64::from(state == ProducerState::Disconnected);
            let end = i64::from(state == last);
            assert_eq!(left - entered, start - end, "unbalanced path at {}", state);
        }
    }

    #[tokio::test]
    async fn test_waiters_are_released_in_registration_order() {
        let manager = StateManager::new(ProducerState::Disconnected);
        let released = Arc::new(Mutex::new(Vec::new()));

        let mut tasks = Vec::new();
        for i in 0..5 {
            let manager_for_task = manager.clone();
            let released = released.clone();
            tasks.push(tokio::spawn(async move {
                let cancel = CancellationToken::new();
                manager_for_task
                    .state_changed_to(ProducerState::Connected, &cancel)
                    .await
                    .unwrap();
                released.lock().unwrap().push(i);
            }));
            while manager.waiter_count() < i + 1 {
                tokio::task::yield_now().await;
            }
        }

        manager.set_state(ProducerState::Connected);
        for task in tasks {
            task.await.unwrap();
        }

        assert_eq!(*released.lock().unwrap(), vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn test_subscribe_mirrors_transitions() {
        let manager = StateManager::new(ProducerState::Disconnected);
        let mut rx = manager.subscribe();

        manager.set_state(ProducerState::Connected);
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow(), ProducerState::Connected);
    }
}
