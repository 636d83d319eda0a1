//! In-process broker implementing the channel seam.
//!
//! [`LoopbackBroker`] keeps topics, subscriptions and producer sessions in
//! memory and hands out channels through [`ConnectChannel`]. It behaves like
//! a small single-node broker (exclusive producers, fencing, failover
//! activation, topic termination) and exposes fault injection hooks so the
//! lifecycle engine can be exercised without a network:
//!
//! - [`disconnect`](LoopbackBroker::disconnect) and
//!   [`close_by_server`](LoopbackBroker::close_by_server) drop a live session,
//! - [`fail_next_connects`](LoopbackBroker::fail_next_connects) and
//!   [`fail_next_sends`](LoopbackBroker::fail_next_sends) script errors,
//! - [`set_available`](LoopbackBroker::set_available) takes the broker offline,
//! - [`fence_producer`](LoopbackBroker::fence_producer) fences a producer.
//!
//! Cursor rules: seeking to a message id positions the cursor *at* that
//! message; a reader started from a concrete message id starts *after* it.

use std::{
    collections::{HashMap, VecDeque},
    sync::{
        atomic::{AtomicU64, AtomicUsize, Ordering},
        Arc, Mutex, MutexGuard,
    },
    time::Duration,
};

use async_trait::async_trait;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::{
    channel::{
        Channel, ChannelEvents, ChannelRequest, ChannelTarget, Command, ConnectChannel, Response,
        TransportState,
    },
    config::{ProducerAccessMode, SubscriptionInitialPosition},
    correlation::CorrelationId,
    error::{ClientError, Result},
    message::{now_millis, Message, MessageId, OutgoingMessage, SeekPosition},
    sequence::Sequence,
    state::EntityKind,
};

/// Counters for assertions in tests and for the sample's diagnostics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoopbackStats {
    pub connect_attempts: u64,
    pub connects: u64,
    pub max_concurrent_connects: usize,
    pub closed_by_client: u64,
}

#[derive(Default)]
struct Counters {
    connect_attempts: AtomicU64,
    connects: AtomicU64,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    closed_by_client: AtomicU64,
}

struct InFlight<'a>(&'a Counters);

impl<'a> InFlight<'a> {
    fn enter(counters: &'a Counters) -> Self {
        let now = counters.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        counters.max_in_flight.fetch_max(now, Ordering::SeqCst);
        Self(counters)
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

#[derive(Debug, Default)]
struct Subscription {
    cursor: usize,
    acknowledged: Vec<MessageId>,
    cumulative: Option<MessageId>,
}

struct Topic {
    ledger_id: u64,
    log: Vec<Message>,
    notify: Arc<Notify>,
    terminated: bool,
    exclusive_owner: Option<CorrelationId>,
    exclusive_waiters: VecDeque<CorrelationId>,
    subscriptions: HashMap<String, Subscription>,
    reader_cursors: HashMap<CorrelationId, usize>,
}

impl Topic {
    fn new(ledger_id: u64) -> Self {
        Self {
            ledger_id,
            log: Vec::new(),
            notify: Arc::new(Notify::new()),
            terminated: false,
            exclusive_owner: None,
            exclusive_waiters: VecDeque::new(),
            subscriptions: HashMap::new(),
            reader_cursors: HashMap::new(),
        }
    }

    fn append(&mut self, message: OutgoingMessage, producer_name: &str) -> MessageId {
        let message_id = MessageId::new(self.ledger_id, self.log.len() as u64, -1, -1);
        self.log.push(Message {
            message_id,
            payload: message.payload,
            properties: message.properties,
            key: message.key,
            publish_time: now_millis(),
            producer_name: producer_name.to_string(),
        });
        self.notify.notify_waiters();
        message_id
    }

    fn index_of(&self, position: SeekPosition) -> usize {
        match position {
            SeekPosition::MessageId(id) if id.is_earliest() => 0,
            SeekPosition::MessageId(id) if id.is_latest() => self.log.len(),
            SeekPosition::MessageId(id) => usize::try_from(id.entry_id)
                .unwrap_or(usize::MAX)
                .min(self.log.len()),
            SeekPosition::PublishTime(millis) => self
                .log
                .iter()
                .position(|m| m.publish_time >= millis)
                .unwrap_or(self.log.len()),
        }
    }

    fn reader_start(&self, start: MessageId) -> usize {
        if start.is_earliest() || start.is_latest() {
            self.index_of(SeekPosition::MessageId(start))
        } else {
            self.index_of(SeekPosition::MessageId(start))
                .saturating_add(1)
                .min(self.log.len())
        }
    }

    fn last_message_id(&self) -> MessageId {
        self.log
            .last()
            .map(|m| m.message_id)
            .unwrap_or(MessageId::EARLIEST)
    }
}

struct Session {
    epoch: u64,
    topic: String,
    target: ChannelTarget,
    events: ChannelEvents,
    closed: CancellationToken,
    fenced: bool,
    waiting: bool,
}

impl Session {
    fn producer_name(&self, id: CorrelationId) -> String {
        match &self.target {
            ChannelTarget::Producer {
                producer_name: Some(name),
                ..
            } => name.clone(),
            _ => format!("producer-{id}"),
        }
    }
}

type Notifications = Vec<(ChannelEvents, TransportState)>;

#[derive(Default)]
struct BrokerInner {
    topics: HashMap<String, Topic>,
    sessions: HashMap<CorrelationId, Session>,
    connect_failures: VecDeque<ClientError>,
    send_failures: VecDeque<ClientError>,
    connect_delay: Duration,
    unavailable: bool,
    next_epoch: u64,
    next_ledger: u64,
}

impl BrokerInner {
    fn topic_mut(&mut self, name: &str) -> &mut Topic {
        let next_ledger = &mut self.next_ledger;
        self.topics.entry(name.to_string()).or_insert_with(|| {
            *next_ledger += 1;
            Topic::new(*next_ledger)
        })
    }

    fn live_session(&self, id: CorrelationId, epoch: u64) -> Result<&Session> {
        match self.sessions.get(&id) {
            Some(session) if session.epoch == epoch && !session.closed.is_cancelled() => Ok(session),
            _ => Err(ClientError::ConnectionClosed("channel is closed".into())),
        }
    }

    /// Drops the session, releasing exclusive ownership and promoting the
    /// next waiting producer.
    fn release(&mut self, id: CorrelationId, notifications: &mut Notifications) -> Option<Session> {
        let session = self.sessions.remove(&id)?;
        session.closed.cancel();

        let BrokerInner {
            topics, sessions, ..
        } = self;
        if let Some(topic) = topics.get_mut(&session.topic) {
            topic.exclusive_waiters.retain(|waiter| *waiter != id);
            if topic.exclusive_owner == Some(id) {
                topic.exclusive_owner = None;
                while let Some(next) = topic.exclusive_waiters.pop_front() {
                    if let Some(waiting) = sessions.get_mut(&next) {
                        waiting.waiting = false;
                        topic.exclusive_owner = Some(next);
                        notifications.push((waiting.events.clone(), TransportState::Connected));
                        break;
                    }
                }
            }
            // wake receivers so they observe the closed session
            topic.notify.notify_waiters();
        }

        Some(session)
    }
}

struct Broker {
    inner: Mutex<BrokerInner>,
    counters: Counters,
}

impl Broker {
    fn lock(&self) -> MutexGuard<'_, BrokerInner> {
        self.inner.lock().unwrap_or_else(|p| p.into_inner())
    }
}

fn notify_all(notifications: Notifications) {
    for (events, state) in notifications {
        events.report(state);
    }
}

/// Shared handle to an in-memory broker. Clones refer to the same broker.
#[derive(Clone)]
pub struct LoopbackBroker {
    broker: Arc<Broker>,
}

impl Default for LoopbackBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for LoopbackBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoopbackBroker")
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

impl LoopbackBroker {
    pub fn new() -> Self {
        Self {
            broker: Arc::new(Broker {
                inner: Mutex::new(BrokerInner::default()),
                counters: Counters::default(),
            }),
        }
    }

    pub fn stats(&self) -> LoopbackStats {
        let counters = &self.broker.counters;
        LoopbackStats {
            connect_attempts: counters.connect_attempts.load(Ordering::SeqCst),
            connects: counters.connects.load(Ordering::SeqCst),
            max_concurrent_connects: counters.max_in_flight.load(Ordering::SeqCst),
            closed_by_client: counters.closed_by_client.load(Ordering::SeqCst),
        }
    }

    /// Whether the entity currently holds a live session.
    pub fn is_connected(&self, id: CorrelationId) -> bool {
        self.broker
            .lock()
            .sessions
            .get(&id)
            .is_some_and(|s| !s.closed.is_cancelled())
    }

    pub fn session_count(&self) -> usize {
        self.broker.lock().sessions.len()
    }

    /// Scripts errors returned by the next connect attempts, in order.
    pub fn fail_next_connects(&self, errors: impl IntoIterator<Item = ClientError>) {
        self.broker.lock().connect_failures.extend(errors);
    }

    /// Scripts errors returned by the next message sends, in order.
    pub fn fail_next_sends(&self, errors: impl IntoIterator<Item = ClientError>) {
        self.broker.lock().send_failures.extend(errors);
    }

    pub fn set_connect_delay(&self, delay: Duration) {
        self.broker.lock().connect_delay = delay;
    }

    /// While unavailable, every connect fails with a retryable error.
    pub fn set_available(&self, available: bool) {
        self.broker.lock().unavailable = !available;
    }

    /// Drops the entity's session as if the network failed.
    pub fn disconnect(&self, id: CorrelationId) -> bool {
        self.drop_session(id, TransportState::Disconnected)
    }

    /// Drops the entity's session as if the broker closed it.
    pub fn close_by_server(&self, id: CorrelationId) -> bool {
        self.drop_session(id, TransportState::ClosedByServer)
    }

    fn drop_session(&self, id: CorrelationId, state: TransportState) -> bool {
        let mut notifications = Vec::new();
        let released = {
            let mut inner = self.broker.lock();
            inner.release(id, &mut notifications)
        };
        let Some(session) = released else {
            return false;
        };
        info!("Loopback broker dropped session of {} ({})", id, state);
        session.events.report(state);
        notify_all(notifications);
        true
    }

    /// Makes every further send of the producer fail with `ProducerFenced`.
    pub fn fence_producer(&self, id: CorrelationId) -> bool {
        match self.broker.lock().sessions.get_mut(&id) {
            Some(session) => {
                session.fenced = true;
                true
            }
            None => false,
        }
    }

    /// Reports failover activation or deactivation to a consumer.
    pub fn set_consumer_active(&self, id: CorrelationId, active: bool) -> bool {
        let events = self.broker.lock().sessions.get(&id).map(|s| s.events.clone());
        match events {
            Some(events) if active => events.activated(),
            Some(events) => events.deactivated(),
            None => return false,
        }
        true
    }

    /// No more messages may be published; readers and consumers reaching the
    /// end are told so.
    pub fn terminate_topic(&self, topic: &str) {
        let mut inner = self.broker.lock();
        let topic = inner.topic_mut(topic);
        topic.terminated = true;
        topic.notify.notify_waiters();
    }

    /// Publishes directly on the broker side.
    pub fn publish(&self, topic: &str, payload: impl Into<Sequence>) -> MessageId {
        self.broker
            .lock()
            .topic_mut(topic)
            .append(OutgoingMessage::new(payload), "loopback")
    }

    pub fn messages(&self, topic: &str) -> Vec<Message> {
        self.broker
            .lock()
            .topics
            .get(topic)
            .map(|t| t.log.clone())
            .unwrap_or_default()
    }

    pub fn has_subscription(&self, topic: &str, subscription: &str) -> bool {
        self.broker
            .lock()
            .topics
            .get(topic)
            .is_some_and(|t| t.subscriptions.contains_key(subscription))
    }

    /// Individually acknowledged ids, in acknowledgement order.
    pub fn acknowledged(&self, topic: &str, subscription: &str) -> Vec<MessageId> {
        self.broker
            .lock()
            .topics
            .get(topic)
            .and_then(|t| t.subscriptions.get(subscription))
            .map(|s| s.acknowledged.clone())
            .unwrap_or_default()
    }

    pub fn cumulative_ack(&self, topic: &str, subscription: &str) -> Option<MessageId> {
        self.broker
            .lock()
            .topics
            .get(topic)
            .and_then(|t| t.subscriptions.get(subscription))
            .and_then(|s| s.cumulative)
    }
}

#[async_trait]
impl ConnectChannel for LoopbackBroker {
    async fn connect(
        &self,
        request: &ChannelRequest,
        events: ChannelEvents,
        cancel: &CancellationToken,
    ) -> Result<Arc<dyn Channel>> {
        let counters = &self.broker.counters;
        counters.connect_attempts.fetch_add(1, Ordering::SeqCst);
        let _in_flight = InFlight::enter(counters);

        let delay = self.broker.lock().connect_delay;
        if !delay.is_zero() {
            tokio::select! {
                _ = cancel.cancelled() => return Err(ClientError::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
        }

        let id = request.correlation_id;
        let mut notifications = Vec::new();

        let channel = {
            let mut inner = self.broker.lock();

            if let Some(err) = inner.connect_failures.pop_front() {
                return Err(err);
            }
            if inner.unavailable {
                return Err(ClientError::ConnectionClosed("broker unavailable".into()));
            }

            // a reconnect replaces whatever session the entity still had
            inner.release(id, &mut notifications);

            inner.next_epoch += 1;
            let epoch = inner.next_epoch;

            let BrokerInner {
                topics,
                sessions,
                next_ledger,
                ..
            } = &mut *inner;
            let topic = topics.entry(request.topic.clone()).or_insert_with(|| {
                *next_ledger += 1;
                Topic::new(*next_ledger)
            });

            let mut waiting = false;
            match &request.target {
                ChannelTarget::Producer { access_mode, .. } => {
                    let owner = topic.exclusive_owner.filter(|owner| *owner != id);
                    match (access_mode, owner) {
                        (ProducerAccessMode::Shared, _) => {}
                        (ProducerAccessMode::Exclusive, Some(owner)) => {
                            return Err(ClientError::ProducerBusy(format!(
                                "topic {} is owned by {}",
                                request.topic, owner
                            )));
                        }
                        (ProducerAccessMode::ExclusiveWithFencing, Some(owner)) => {
                            if let Some(previous) = sessions.get_mut(&owner) {
                                previous.fenced = true;
                            }
                            topic.exclusive_owner = Some(id);
                        }
                        (ProducerAccessMode::WaitForExclusive, Some(_)) => {
                            waiting = true;
                            topic.exclusive_waiters.push_back(id);
                        }
                        (_, None) => topic.exclusive_owner = Some(id),
                    }
                }
                ChannelTarget::Consumer {
                    subscription,
                    initial_position,
                    ..
                } => {
                    let start = match initial_position {
                        SubscriptionInitialPosition::Earliest => 0,
                        SubscriptionInitialPosition::Latest => topic.log.len(),
                    };
                    topic
                        .subscriptions
                        .entry(subscription.clone())
                        .or_insert_with(|| Subscription {
                            cursor: start,
                            ..Subscription::default()
                        });
                }
                ChannelTarget::Reader { start_message_id } => {
                    let start = topic.reader_start(*start_message_id);
                    topic.reader_cursors.entry(id).or_insert(start);
                }
            }

            let closed = CancellationToken::new();
            sessions.insert(
                id,
                Session {
                    epoch,
                    topic: request.topic.clone(),
                    target: request.target.clone(),
                    events: events.clone(),
                    closed: closed.clone(),
                    fenced: false,
                    waiting,
                },
            );

            notifications.push((
                events,
                if waiting {
                    TransportState::WaitingForExclusive
                } else {
                    TransportState::Connected
                },
            ));

            LoopbackChannel {
                broker: Arc::clone(&self.broker),
                correlation_id: id,
                epoch,
                closed,
                notify: Arc::clone(&topic.notify),
            }
        };

        counters.connects.fetch_add(1, Ordering::SeqCst);
        debug!(
            "Loopback broker accepted {} {} on topic {}",
            request.kind(),
            id,
            request.topic
        );
        notify_all(notifications);

        Ok(Arc::new(channel))
    }
}

/// Channel handed out by [`LoopbackBroker`].
pub struct LoopbackChannel {
    broker: Arc<Broker>,
    correlation_id: CorrelationId,
    epoch: u64,
    closed: CancellationToken,
    notify: Arc<Notify>,
}

enum Poll {
    Ready(Message),
    EndOfTopic(ChannelEvents, ClientError),
    Empty,
}

impl LoopbackChannel {
    fn poll_next(&self) -> Result<Poll> {
        let mut inner = self.broker.lock();
        let session = inner.live_session(self.correlation_id, self.epoch)?;
        let topic_name = session.topic.clone();
        let target = session.target.clone();
        let events = session.events.clone();

        let topic = inner.topic_mut(&topic_name);
        let cursor = match &target {
            ChannelTarget::Consumer { subscription, .. } => topic
                .subscriptions
                .get_mut(subscription)
                .map(|s| &mut s.cursor)
                .ok_or_else(|| ClientError::SubscriptionNotFound(subscription.clone()))?,
            ChannelTarget::Reader { .. } => topic
                .reader_cursors
                .entry(self.correlation_id)
                .or_insert(0),
            ChannelTarget::Producer { .. } => {
                return Err(ClientError::ProtocolViolation(
                    "producers cannot receive".into(),
                ))
            }
        };

        if let Some(message) = topic.log.get(*cursor) {
            *cursor += 1;
            return Ok(Poll::Ready(message.clone()));
        }

        if topic.terminated {
            let kind = match target {
                ChannelTarget::Consumer { .. } => EntityKind::Consumer,
                _ => EntityKind::Reader,
            };
            return Ok(Poll::EndOfTopic(events, ClientError::ReachedEndOfTopic(kind)));
        }

        Ok(Poll::Empty)
    }

    fn detach(&self) -> bool {
        let mut notifications = Vec::new();
        let released = {
            let mut inner = self.broker.lock();
            if inner.live_session(self.correlation_id, self.epoch).is_err() {
                return false;
            }
            inner.release(self.correlation_id, &mut notifications)
        };
        notify_all(notifications);
        released.is_some()
    }
}

#[async_trait]
impl Channel for LoopbackChannel {
    async fn send(&self, command: Command, _cancel: &CancellationToken) -> Result<Response> {
        let mut notifications = Vec::new();

        let response = {
            let mut inner = self.broker.lock();
            let session = inner.live_session(self.correlation_id, self.epoch)?;
            let topic_name = session.topic.clone();
            let target = session.target.clone();
            let fenced = session.fenced;
            let waiting = session.waiting;
            let producer_name = session.producer_name(self.correlation_id);
            let events = session.events.clone();

            match command {
                Command::Send(message) => {
                    if !matches!(target, ChannelTarget::Producer { .. }) {
                        return Err(ClientError::ProtocolViolation(
                            "only producers can send messages".into(),
                        ));
                    }
                    if fenced {
                        return Err(ClientError::ProducerFenced(format!(
                            "topic {topic_name} was taken over by a newer exclusive producer"
                        )));
                    }
                    if waiting {
                        return Err(ClientError::ProducerBusy(format!(
                            "waiting for exclusive access to {topic_name}"
                        )));
                    }
                    if let Some(err) = inner.send_failures.pop_front() {
                        return Err(err);
                    }
                    let topic = inner.topic_mut(&topic_name);
                    if topic.terminated {
                        return Err(ClientError::ProtocolViolation(format!(
                            "topic {topic_name} is terminated"
                        )));
                    }
                    Response::Receipt(topic.append(message, &producer_name))
                }
                Command::Acknowledge {
                    message_id,
                    cumulative,
                } => {
                    let ChannelTarget::Consumer { subscription, .. } = &target else {
                        return Err(ClientError::ProtocolViolation(
                            "only consumers can acknowledge".into(),
                        ));
                    };
                    let entry = inner
                        .topic_mut(&topic_name)
                        .subscriptions
                        .get_mut(subscription)
                        .ok_or_else(|| ClientError::SubscriptionNotFound(subscription.clone()))?;
                    if cumulative {
                        entry.cumulative = Some(message_id);
                    } else {
                        entry.acknowledged.push(message_id);
                    }
                    Response::Success
                }
                Command::Seek(position) => {
                    let topic = inner.topic_mut(&topic_name);
                    let index = topic.index_of(position);
                    match &target {
                        ChannelTarget::Consumer { subscription, .. } => {
                            topic
                                .subscriptions
                                .get_mut(subscription)
                                .ok_or_else(|| {
                                    ClientError::SubscriptionNotFound(subscription.clone())
                                })?
                                .cursor = index;
                        }
                        ChannelTarget::Reader { .. } => {
                            topic.reader_cursors.insert(self.correlation_id, index);
                        }
                        ChannelTarget::Producer { .. } => {
                            return Err(ClientError::ProtocolViolation(
                                "producers cannot seek".into(),
                            ))
                        }
                    }
                    Response::Success
                }
                Command::GetLastMessageId => {
                    Response::LastMessageId(inner.topic_mut(&topic_name).last_message_id())
                }
                Command::Unsubscribe => {
                    let ChannelTarget::Consumer { subscription, .. } = &target else {
                        return Err(ClientError::ProtocolViolation(
                            "only consumers can unsubscribe".into(),
                        ));
                    };
                    inner
                        .topic_mut(&topic_name)
                        .subscriptions
                        .remove(subscription)
                        .ok_or_else(|| ClientError::SubscriptionNotFound(subscription.clone()))?;
                    notifications.push((events, TransportState::Unsubscribed));
                    Response::Success
                }
            }
        };

        notify_all(notifications);
        Ok(response)
    }

    async fn receive(&self, cancel: &CancellationToken) -> Result<Message> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            // registered before polling so a concurrent publish is not missed
            notified.as_mut().enable();

            match self.poll_next()? {
                Poll::Ready(message) => return Ok(message),
                Poll::EndOfTopic(events, err) => {
                    events.reached_end_of_topic();
                    return Err(err);
                }
                Poll::Empty => {}
            }

            tokio::select! {
                _ = cancel.cancelled() => return Err(ClientError::Cancelled),
                _ = self.closed.cancelled() => {
                    return Err(ClientError::ConnectionClosed("channel closed while receiving".into()));
                }
                _ = &mut notified => {}
            }
        }
    }

    async fn closed_by_client(&self) -> Result<()> {
        if self.detach() {
            self.broker
                .counters
                .closed_by_client
                .fetch_add(1, Ordering::SeqCst);
            debug!("Loopback channel of {} closed by client", self.correlation_id);
        }
        Ok(())
    }

    async fn dispose(&self) {
        self.detach();
    }
}
