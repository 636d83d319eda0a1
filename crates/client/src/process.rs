//! Per-entity lifecycle state machine.
//!
//! A [`Process`] owns the logical state of one producer, consumer or reader.
//! It receives routed [`Event`]s, records them as inputs and recalculates the
//! logical state. Side effects (closing and re-establishing channels,
//! notifying the entity of a fault, deferred transitions) are never run
//! inline: they go through the process's [`ActionQueue`], so recovery is
//! strictly ordered and at most one reconnect runs at a time.
//!
//! Locking order is inputs, then state. Event handling only takes these
//! locks and enqueues; it never awaits.

use std::{
    fmt,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, MutexGuard, Weak,
    },
};

use async_trait::async_trait;
use tokio::sync::OnceCell;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{
    action_queue::{ActionFaultHandler, ActionQueue},
    channel::TransportState,
    correlation::CorrelationId,
    error::{ClientError, Disposition, Result},
    events::{Event, ProcessHandle, RegisterEvent},
    executor::{report_fault, FaultHandler},
    state::{EntityKind, EntityState, Reaction},
    state_manager::StateManager,
};

/// Recovery hooks the supervised entity exposes to its process.
#[async_trait]
pub trait ContainsChannel: Send + Sync {
    /// Opens a new channel and installs it. Retries transient failures.
    async fn establish_new_channel(&self, cancel: CancellationToken) -> Result<()>;

    /// Best-effort release of the current channel.
    async fn close_channel(&self, cancel: CancellationToken) -> Result<()>;

    /// Informs the entity that it went terminal because of `fault`.
    async fn channel_faulted(&self, fault: ClientError) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutorState {
    Ok,
    Faulted,
}

#[derive(Debug)]
struct Inputs {
    executor: ExecutorState,
    channel: TransportState,
    /// Bumped on every channel report; deferred transitions carry the value
    /// they were queued under and are dropped if it moved on.
    channel_epoch: u64,
    fault: Option<ClientError>,
}

pub struct Process<S: EntityState> {
    this: Weak<Self>,
    correlation_id: CorrelationId,
    state: StateManager<S>,
    actions: ActionQueue,
    inputs: Mutex<Inputs>,
    entity: Weak<dyn ContainsChannel>,
    register: Arc<dyn RegisterEvent>,
    fault_handler: Option<FaultHandler>,
    disposing: AtomicBool,
    teardown: OnceCell<()>,
}

impl<S: EntityState> fmt::Debug for Process<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Process")
            .field("correlation_id", &self.correlation_id)
            .field("state", &self.state.current())
            .field("disposing", &self.is_disposed())
            .finish_non_exhaustive()
    }
}

impl<S: EntityState> Process<S> {
    /// Creates the process and registers [`Event::Created`].
    ///
    /// Spawns the action queue worker, so a Tokio runtime must be running.
    pub fn new(
        correlation_id: CorrelationId,
        state: StateManager<S>,
        entity: Weak<dyn ContainsChannel>,
        register: Arc<dyn RegisterEvent>,
        fault_handler: Option<FaultHandler>,
    ) -> Arc<Self> {
        let process = Arc::new_cyclic(|weak: &Weak<Self>| {
            let owner = weak.clone();
            let on_fault: ActionFaultHandler = Arc::new(move |fault| {
                if let Some(process) = owner.upgrade() {
                    process.on_action_fault(fault);
                }
            });

            Self {
                this: weak.clone(),
                correlation_id,
                actions: ActionQueue::new(format!("{} {}", S::KIND, correlation_id), on_fault),
                state,
                inputs: Mutex::new(Inputs {
                    executor: ExecutorState::Ok,
                    channel: TransportState::Disconnected,
                    channel_epoch: 0,
                    fault: None,
                }),
                entity,
                register,
                fault_handler,
                disposing: AtomicBool::new(false),
                teardown: OnceCell::new(),
            }
        });

        process.register.register(Event::Created {
            correlation_id,
            kind: S::KIND,
        });

        process
    }

    pub fn correlation_id(&self) -> CorrelationId {
        self.correlation_id
    }

    pub fn state(&self) -> &StateManager<S> {
        &self.state
    }

    /// True once disposal has started.
    pub fn is_disposed(&self) -> bool {
        self.disposing.load(Ordering::Acquire)
    }

    /// Initial calculation; the entity starts disconnected, so this queues the
    /// first channel establishment.
    pub fn start(&self) {
        let inputs = self.lock_inputs();
        self.calculate_state(&inputs);
    }

    fn lock_inputs(&self) -> MutexGuard<'_, Inputs> {
        self.inputs.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn apply(&self, event: &Event) {
        let mut inputs = self.lock_inputs();
        match event {
            Event::ChannelStateChanged { state, .. } => {
                // ignored reports leave the inputs untouched so a pending
                // deferred transition stays current
                if matches!(S::react(*state), Reaction::Ignore) {
                    debug!(
                        "{} {} ignores transport state {}",
                        S::KIND,
                        self.correlation_id,
                        state
                    );
                    return;
                }
                inputs.channel = *state;
                inputs.channel_epoch = inputs.channel_epoch.wrapping_add(1);
            }
            Event::ExecutorFaulted { fault, .. } => {
                inputs.executor = ExecutorState::Faulted;
                inputs.fault = Some(fault.clone());
            }
            Event::Created { .. } | Event::Disposed { .. } => return,
        }
        self.calculate_state(&inputs);
    }

    /// The single place where logical-state decisions are made.
    fn calculate_state(&self, inputs: &Inputs) {
        if self.state.is_final_state() {
            return;
        }

        if inputs.executor == ExecutorState::Faulted {
            let fault = inputs
                .fault
                .clone()
                .unwrap_or_else(|| ClientError::Internal("executor faulted without a fault".into()));
            let terminal = S::terminal(S::KIND.terminal_for(&fault));
            let former = self.transition(terminal);

            if !former.is_fault() {
                let entity = self.entity.clone();
                self.actions.enqueue(move |_| async move {
                    match entity.upgrade() {
                        Some(entity) => entity.channel_faulted(fault).await,
                        None => Ok(()),
                    }
                });
            }
            return;
        }

        match S::react(inputs.channel) {
            Reaction::Reconnect(state) => {
                self.transition(state);
                let entity = self.entity.clone();
                self.actions.enqueue(move |cancel| async move {
                    let Some(entity) = entity.upgrade() else {
                        return Ok(());
                    };
                    entity.close_channel(cancel.clone()).await?;
                    entity.establish_new_channel(cancel).await
                });
            }
            Reaction::Deferred(state) => {
                let process = self.this.clone();
                let epoch = inputs.channel_epoch;
                self.actions.enqueue(move |_| async move {
                    if let Some(process) = process.upgrade() {
                        process.apply_deferred(state, epoch);
                    }
                    Ok(())
                });
            }
            Reaction::Immediate(state) => {
                self.transition(state);
            }
            Reaction::Ignore => {}
        }
    }

    fn apply_deferred(&self, state: S, epoch: u64) {
        let inputs = self.lock_inputs();
        if inputs.channel_epoch != epoch || inputs.executor == ExecutorState::Faulted {
            debug!(
                "{} {} dropping stale transition to {}",
                S::KIND,
                self.correlation_id,
                state
            );
            return;
        }
        self.transition(state);
    }

    fn transition(&self, new: S) -> S {
        let former = self.state.set_state(new);
        if former != new && !former.is_final() {
            info!(
                "{} {} state changed: {} -> {}",
                S::KIND,
                self.correlation_id,
                former,
                new
            );
        }
        former
    }

    fn on_action_fault(&self, fault: ClientError) {
        if fault.is_cancelled() || self.is_disposed() {
            debug!(
                "{} {} ignoring action failure during shutdown: {}",
                S::KIND,
                self.correlation_id,
                fault
            );
            return;
        }

        report_fault(self.fault_handler.as_ref(), self.correlation_id, S::KIND, &fault);

        match fault.disposition() {
            Disposition::Fatal => self.apply(&Event::ExecutorFaulted {
                correlation_id: self.correlation_id,
                fault,
            }),
            Disposition::Retry => {
                warn!(
                    "{} {} recovery action failed, scheduling another reconnect: {}",
                    S::KIND,
                    self.correlation_id,
                    fault
                );
                self.apply(&Event::ChannelStateChanged {
                    correlation_id: self.correlation_id,
                    state: TransportState::Disconnected,
                });
            }
        }
    }

    /// Tears the process down once; concurrent callers await the same teardown.
    pub async fn dispose(&self) {
        self.disposing.store(true, Ordering::Release);
        self.teardown.get_or_init(|| self.run_teardown()).await;
    }

    async fn run_teardown(&self) {
        self.register.register(Event::Disposed {
            correlation_id: self.correlation_id,
            kind: S::KIND,
        });

        self.transition(S::CLOSED);
        self.actions.shutdown().await;

        if let Some(entity) = self.entity.upgrade() {
            if let Err(e) = entity.close_channel(CancellationToken::new()).await {
                warn!(
                    "{} {} failed to release its channel: {}",
                    S::KIND,
                    self.correlation_id,
                    e
                );
            }
        }

        info!("{} {} disposed", S::KIND, self.correlation_id);
    }
}

#[async_trait]
impl<S: EntityState> ProcessHandle for Process<S> {
    fn correlation_id(&self) -> CorrelationId {
        self.correlation_id
    }

    fn kind(&self) -> EntityKind {
        S::KIND
    }

    fn handle(&self, event: &Event) {
        if self.is_disposed() {
            return;
        }
        self.apply(event);
    }

    async fn dispose(&self) {
        Process::dispose(self).await;
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::atomic::{AtomicUsize, Ordering},
        time::Duration,
    };

    use tracing_test::traced_test;

    use super::*;
    use crate::state::{ProducerState, ReaderState};

    #[derive(Default)]
    struct RecordingRegister {
        events: Mutex<Vec<Event>>,
    }

    impl RecordingRegister {
        fn disposed_count(&self) -> usize {
            self.events
                .lock()
                .unwrap()
                .iter()
                .filter(|e| matches!(e, Event::Disposed { .. }))
                .count()
        }
    }

    impl RegisterEvent for RecordingRegister {
        fn register(&self, event: Event) {
            self.events.lock().unwrap().push(event);
        }
    }

    #[derive(Default)]
    struct ScriptedEntity {
        establish_delay: Duration,
        establishes: AtomicUsize,
        closes: AtomicUsize,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
        faults: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl ContainsChannel for ScriptedEntity {
        async fn establish_new_channel(&self, _cancel: CancellationToken) -> Result<()> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(self.establish_delay).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            self.establishes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn close_channel(&self, _cancel: CancellationToken) -> Result<()> {
            self.closes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn channel_faulted(&self, fault: ClientError) -> Result<()> {
            self.faults.lock().unwrap().push(fault.as_str().to_string());
            Ok(())
        }
    }

    fn spawn_process<S: EntityState>(
        entity: &Arc<ScriptedEntity>,
        register: &Arc<RecordingRegister>,
    ) -> Arc<Process<S>> {
        let weak: Weak<ScriptedEntity> = Arc::downgrade(entity);
        let weak: Weak<dyn ContainsChannel> = weak;
        Process::new(
            CorrelationId::new(),
            StateManager::new(S::INITIAL),
            weak,
            register.clone(),
            None,
        )
    }

    fn channel_event<S: EntityState>(process: &Process<S>, state: TransportState) {
        ProcessHandle::handle(
            process,
            &Event::ChannelStateChanged {
                correlation_id: process.correlation_id(),
                state,
            },
        );
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(30)).await;
    }

    #[tokio::test]
    async fn test_start_establishes_first_channel() {
        let entity = Arc::new(ScriptedEntity::default());
        let register = Arc::new(RecordingRegister::default());
        let process = spawn_process::<ProducerState>(&entity, &register);

        process.start();
        settle().await;

        assert_eq!(entity.establishes.load(Ordering::SeqCst), 1);
        assert_eq!(process.state().current(), ProducerState::Disconnected);
        assert!(matches!(
            register.events.lock().unwrap()[0],
            Event::Created {
                kind: EntityKind::Producer,
                ..
            }
        ));
    }

    #[tokio::test]
    #[traced_test]
    async fn test_disconnect_then_connect_cycle() {
        let entity = Arc::new(ScriptedEntity::default());
        let register = Arc::new(RecordingRegister::default());
        let process = spawn_process::<ReaderState>(&entity, &register);
        let cancel = CancellationToken::new();

        channel_event(&process, TransportState::Connected);
        assert_eq!(
            process
                .state()
                .state_changed_to(ReaderState::Connected, &cancel)
                .await
                .unwrap(),
            ReaderState::Connected
        );

        channel_event(&process, TransportState::Disconnected);
        assert_eq!(process.state().current(), ReaderState::Disconnected);
        settle().await;
        assert_eq!(entity.closes.load(Ordering::SeqCst), 1);
        assert_eq!(entity.establishes.load(Ordering::SeqCst), 1);

        channel_event(&process, TransportState::Connected);
        process
            .state()
            .state_changed_to(ReaderState::Connected, &cancel)
            .await
            .unwrap();
        assert!(logs_contain("state changed: Disconnected -> Connected"));
    }

    #[tokio::test]
    async fn test_stale_connected_transition_is_dropped() {
        let entity = Arc::new(ScriptedEntity::default());
        let register = Arc::new(RecordingRegister::default());
        let process = spawn_process::<ProducerState>(&entity, &register);

        // both reports land before the worker runs the deferred transition
        channel_event(&process, TransportState::Connected);
        channel_event(&process, TransportState::ClosedByServer);
        settle().await;

        assert_eq!(process.state().current(), ProducerState::Disconnected);
        assert_eq!(entity.establishes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    #[traced_test]
    async fn test_ignored_report_keeps_pending_connected_transition() {
        let entity = Arc::new(ScriptedEntity::default());
        let register = Arc::new(RecordingRegister::default());
        let process = spawn_process::<ProducerState>(&entity, &register);

        // producers have no use for Active; the queued Connected must survive it
        channel_event(&process, TransportState::Connected);
        channel_event(&process, TransportState::Active);
        settle().await;

        assert_eq!(process.state().current(), ProducerState::Connected);
        assert_eq!(entity.establishes.load(Ordering::SeqCst), 0);
        assert!(logs_contain("ignores transport state"));
    }

    #[tokio::test]
    async fn test_reconnects_never_overlap() {
        let entity = Arc::new(ScriptedEntity {
            establish_delay: Duration::from_millis(5),
            ..ScriptedEntity::default()
        });
        let register = Arc::new(RecordingRegister::default());
        let process = spawn_process::<ProducerState>(&entity, &register);

        for _ in 0..10 {
            channel_event(&process, TransportState::Disconnected);
            channel_event(&process, TransportState::ClosedByServer);
        }
        tokio::time::sleep(Duration::from_millis(200)).await;

        assert_eq!(entity.max_in_flight.load(Ordering::SeqCst), 1);
        assert_eq!(entity.establishes.load(Ordering::SeqCst), 20);
    }

    #[tokio::test]
    async fn test_fencing_fault_is_terminal_and_notified_once() {
        let entity = Arc::new(ScriptedEntity::default());
        let register = Arc::new(RecordingRegister::default());
        let process = spawn_process::<ProducerState>(&entity, &register);

        for _ in 0..2 {
            ProcessHandle::handle(
                &*process,
                &Event::ExecutorFaulted {
                    correlation_id: process.correlation_id(),
                    fault: ClientError::ProducerFenced("newer producer".into()),
                },
            );
        }
        channel_event(&process, TransportState::Connected);
        settle().await;

        assert_eq!(process.state().current(), ProducerState::Fenced);
        assert_eq!(*entity.faults.lock().unwrap(), vec!["ProducerFenced"]);
    }

    #[tokio::test]
    async fn test_generic_fault_on_reader() {
        let entity = Arc::new(ScriptedEntity::default());
        let register = Arc::new(RecordingRegister::default());
        let process = spawn_process::<ReaderState>(&entity, &register);

        ProcessHandle::handle(
            &*process,
            &Event::ExecutorFaulted {
                correlation_id: process.correlation_id(),
                fault: ClientError::ProducerFenced("irrelevant for readers".into()),
            },
        );

        assert_eq!(process.state().current(), ReaderState::Faulted);
    }

    #[tokio::test]
    async fn test_concurrent_dispose_runs_once() {
        let entity = Arc::new(ScriptedEntity::default());
        let register = Arc::new(RecordingRegister::default());
        let process = spawn_process::<ProducerState>(&entity, &register);
        process.start();

        tokio::join!(process.dispose(), process.dispose());

        assert!(process.is_disposed());
        assert_eq!(process.state().current(), ProducerState::Closed);
        assert_eq!(register.disposed_count(), 1);

        let closes = entity.closes.load(Ordering::SeqCst);
        process.dispose().await;
        assert_eq!(entity.closes.load(Ordering::SeqCst), closes);
        assert_eq!(register.disposed_count(), 1);
    }

    #[tokio::test]
    async fn test_dispose_keeps_fault_state() {
        let entity = Arc::new(ScriptedEntity::default());
        let register = Arc::new(RecordingRegister::default());
        let process = spawn_process::<ProducerState>(&entity, &register);

        ProcessHandle::handle(
            &*process,
            &Event::ExecutorFaulted {
                correlation_id: process.correlation_id(),
                fault: ClientError::TopicNotFound("gone".into()),
            },
        );
        process.dispose().await;

        assert_eq!(process.state().current(), ProducerState::Faulted);
    }

    #[tokio::test]
    async fn test_events_after_dispose_are_ignored() {
        let entity = Arc::new(ScriptedEntity::default());
        let register = Arc::new(RecordingRegister::default());
        let process = spawn_process::<ProducerState>(&entity, &register);

        process.dispose().await;
        let establishes = entity.establishes.load(Ordering::SeqCst);
        channel_event(&process, TransportState::Disconnected);
        settle().await;

        assert_eq!(process.state().current(), ProducerState::Closed);
        assert_eq!(entity.establishes.load(Ordering::SeqCst), establishes);
    }
}
