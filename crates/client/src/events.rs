//! Lifecycle events and their routing.
//!
//! Channels, executors and processes emit [`Event`]s into a
//! [`RegisterEvent`] sink. The client's sink is the [`ProcessManager`], which
//! forwards each event to the process owning the event's correlation id.

use std::{
    collections::HashMap,
    sync::{Arc, RwLock},
};

use async_trait::async_trait;
use futures_util::future::join_all;
use tracing::{debug, info};

use super::{
    channel::TransportState, correlation::CorrelationId, error::ClientError, state::EntityKind,
};

#[derive(Debug, Clone)]
pub enum Event {
    Created {
        correlation_id: CorrelationId,
        kind: EntityKind,
    },
    Disposed {
        correlation_id: CorrelationId,
        kind: EntityKind,
    },
    ChannelStateChanged {
        correlation_id: CorrelationId,
        state: TransportState,
    },
    /// An operation failed fatally; the owning entity must go terminal.
    ExecutorFaulted {
        correlation_id: CorrelationId,
        fault: ClientError,
    },
}

impl Event {
    pub fn correlation_id(&self) -> CorrelationId {
        match self {
            Event::Created { correlation_id, .. }
            | Event::Disposed { correlation_id, .. }
            | Event::ChannelStateChanged { correlation_id, .. }
            | Event::ExecutorFaulted { correlation_id, .. } => *correlation_id,
        }
    }
}

/// Fire-and-forget event sink.
pub trait RegisterEvent: Send + Sync {
    fn register(&self, event: Event);
}

/// What the [`ProcessManager`] needs from a process.
#[async_trait]
pub trait ProcessHandle: Send + Sync {
    fn correlation_id(&self) -> CorrelationId;

    fn kind(&self) -> EntityKind;

    /// Applies a routed event. Must not block.
    fn handle(&self, event: &Event);

    async fn dispose(&self);
}

/// Routes events to live processes by correlation id.
#[derive(Default)]
pub struct ProcessManager {
    processes: RwLock<HashMap<CorrelationId, Arc<dyn ProcessHandle>>>,
}

impl ProcessManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, process: Arc<dyn ProcessHandle>) {
        let id = process.correlation_id();
        self.processes
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .insert(id, process);
    }

    pub fn contains(&self, correlation_id: &CorrelationId) -> bool {
        self.processes
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .contains_key(correlation_id)
    }

    pub fn len(&self) -> usize {
        self.processes
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Disposes every live process concurrently and waits for all of them.
    pub async fn dispose_all(&self) {
        let processes: Vec<_> = self
            .processes
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .values()
            .cloned()
            .collect();

        if processes.is_empty() {
            return;
        }

        info!("Disposing {} live process(es)", processes.len());
        join_all(processes.iter().map(|process| process.dispose())).await;
    }

    fn lookup(&self, correlation_id: &CorrelationId) -> Option<Arc<dyn ProcessHandle>> {
        self.processes
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .get(correlation_id)
            .cloned()
    }
}

impl RegisterEvent for ProcessManager {
    fn register(&self, event: Event) {
        match &event {
            Event::Created {
                correlation_id,
                kind,
            } => {
                debug!("{} {} created", kind, correlation_id);
            }
            Event::Disposed {
                correlation_id,
                kind,
            } => {
                self.processes
                    .write()
                    .unwrap_or_else(|p| p.into_inner())
                    .remove(correlation_id);
                debug!("{} {} disposed", kind, correlation_id);
            }
            Event::ChannelStateChanged { correlation_id, .. }
            | Event::ExecutorFaulted { correlation_id, .. } => {
                // handle outside the map lock
                match self.lookup(correlation_id) {
                    Some(process) => process.handle(&event),
                    None => debug!(
                        "No live process for {}, dropping {:?}",
                        correlation_id, event
                    ),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Mutex,
    };

    use super::*;

    struct FakeProcess {
        id: CorrelationId,
        handled: Mutex<Vec<TransportState>>,
        disposed: AtomicUsize,
    }

    impl FakeProcess {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                id: CorrelationId::new(),
                handled: Mutex::new(Vec::new()),
                disposed: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl ProcessHandle for FakeProcess {
        fn correlation_id(&self) -> CorrelationId {
            self.id
        }

        fn kind(&self) -> EntityKind {
            EntityKind::Reader
        }

        fn handle(&self, event: &Event) {
            if let Event::ChannelStateChanged { state, .. } = event {
                self.handled.lock().unwrap().push(*state);
            }
        }

        async fn dispose(&self) {
            self.disposed.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_routes_by_correlation_id() {
        let manager = ProcessManager::new();
        let a = FakeProcess::new();
        let b = FakeProcess::new();
        manager.add(a.clone());
        manager.add(b.clone());

        manager.register(Event::ChannelStateChanged {
            correlation_id: a.id,
            state: TransportState::Connected,
        });

        assert_eq!(*a.handled.lock().unwrap(), vec![TransportState::Connected]);
        assert!(b.handled.lock().unwrap().is_empty());
    }

    #[test]
    fn test_disposed_event_unregisters_process() {
        let manager = ProcessManager::new();
        let process = FakeProcess::new();
        manager.add(process.clone());
        assert!(manager.contains(&process.id));

        manager.register(Event::Disposed {
            correlation_id: process.id,
            kind: EntityKind::Reader,
        });
        assert!(manager.is_empty());

        // late events for a gone process are dropped
        manager.register(Event::ChannelStateChanged {
            correlation_id: process.id,
            state: TransportState::Disconnected,
        });
        assert!(process.handled.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_dispose_all_reaches_every_process() {
        let manager = ProcessManager::new();
        let processes: Vec<_> = (0..4).map(|_| FakeProcess::new()).collect();
        for process in &processes {
            manager.add(process.clone());
        }

        manager.dispose_all().await;

        for process in &processes {
            assert_eq!(process.disposed.load(Ordering::SeqCst), 1);
        }
    }
}
