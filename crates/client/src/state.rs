//! Logical lifecycle states of producers, consumers and readers.
//!
//! Each entity kind has its own state enum. The states a caller observes are
//! decided exclusively by the owning [`Process`](crate::Process): transport
//! notifications are translated through [`EntityState::react`], faults through
//! [`EntityKind::terminal_for`]. Both tables are static per kind.
//!
//! Some states are *final*. Once an entity enters one of
//! [`EntityState::FINAL_STATES`] it never leaves it, and every operation on the
//! entity fails with the state's [`terminal_error`](EntityState::terminal_error).
//!
//! ```ignore
//! use pulsebee_client::{EntityState, ProducerState};
//!
//! assert!(ProducerState::Fenced.is_final());
//! assert!(!ProducerState::Disconnected.is_final());
//! println!("{}", ProducerState::WaitingForExclusive); // "WaitingForExclusive"
//! ```

use std::fmt;

use super::{channel::TransportState, error::ClientError};

/// The three kinds of supervised entities.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntityKind {
    Producer,
    Consumer,
    Reader,
}

impl EntityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Producer => "Producer",
            EntityKind::Consumer => "Consumer",
            EntityKind::Reader => "Reader",
        }
    }

    /// Which terminal state a fatal fault leads to for this kind.
    ///
    /// Only producers distinguish fencing; everything else is a generic fault.
    pub fn terminal_for(self, fault: &ClientError) -> Terminal {
        match (self, fault) {
            (EntityKind::Producer, ClientError::ProducerFenced(_)) => Terminal::Fenced,
            _ => Terminal::Faulted,
        }
    }

    /// The error every operation returns once disposal has started.
    pub fn disposed_error(self) -> ClientError {
        match self {
            EntityKind::Producer => ClientError::ProducerDisposed,
            EntityKind::Consumer => ClientError::ConsumerDisposed,
            EntityKind::Reader => ClientError::ReaderDisposed,
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Terminal outcome of a fatal fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Terminal {
    Faulted,
    Fenced,
}

/// What a Process does with a transport state for a given entity kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reaction<S> {
    /// Record the state now and queue a close-then-reconnect action.
    Reconnect(S),
    /// Queue the transition so it lands after pending recovery actions.
    Deferred(S),
    /// Record the state now.
    Immediate(S),
    /// Not meaningful for this kind.
    Ignore,
}

/// Behaviour shared by the per-kind state enums.
pub trait EntityState:
    Copy + Eq + fmt::Debug + fmt::Display + Send + Sync + 'static
{
    const KIND: EntityKind;

    /// States that are never left once entered.
    const FINAL_STATES: &'static [Self];

    /// Where every entity starts; the first channel is established from here.
    const INITIAL: Self;

    const CLOSED: Self;

    fn as_str(&self) -> &'static str;

    /// Maps a terminal outcome onto this kind's state.
    fn terminal(terminal: Terminal) -> Self;

    /// Per-kind reaction to a transport notification.
    fn react(transport: TransportState) -> Reaction<Self>;

    /// Error returned by operations attempted in this state. `Some` exactly
    /// for the final states.
    fn terminal_error(self) -> Option<ClientError>;

    fn is_final(self) -> bool {
        Self::FINAL_STATES.contains(&self)
    }

    /// True for the terminal states produced by faults.
    fn is_fault(self) -> bool {
        self == Self::terminal(Terminal::Faulted) || self == Self::terminal(Terminal::Fenced)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProducerState {
    Connected,
    Disconnected,
    /// Another exclusive producer owns the topic; this one is queued behind it.
    WaitingForExclusive,
    Closed,
    Faulted,
    /// Taken over by a newer exclusive producer.
    Fenced,
}

impl EntityState for ProducerState {
    const KIND: EntityKind = EntityKind::Producer;
    const FINAL_STATES: &'static [Self] = &[
        ProducerState::Closed,
        ProducerState::Faulted,
        ProducerState::Fenced,
    ];
    const INITIAL: Self = ProducerState::Disconnected;
    const CLOSED: Self = ProducerState::Closed;

    fn as_str(&self) -> &'static str {
        match self {
            ProducerState::Connected => "Connected",
            ProducerState::Disconnected => "Disconnected",
            ProducerState::WaitingForExclusive => "WaitingForExclusive",
            ProducerState::Closed => "Closed",
            ProducerState::Faulted => "Faulted",
            ProducerState::Fenced => "Fenced",
        }
    }

    fn terminal(terminal: Terminal) -> Self {
        match terminal {
            Terminal::Faulted => ProducerState::Faulted,
            Terminal::Fenced => ProducerState::Fenced,
        }
    }

    fn react(transport: TransportState) -> Reaction<Self> {
        match transport {
            TransportState::Disconnected | TransportState::ClosedByServer => {
                Reaction::Reconnect(ProducerState::Disconnected)
            }
            TransportState::Connected => Reaction::Deferred(ProducerState::Connected),
            TransportState::WaitingForExclusive => {
                Reaction::Immediate(ProducerState::WaitingForExclusive)
            }
            _ => Reaction::Ignore,
        }
    }

    fn terminal_error(self) -> Option<ClientError> {
        match self {
            ProducerState::Closed => Some(ClientError::ProducerClosed),
            ProducerState::Faulted => Some(ClientError::EntityFaulted(Self::KIND)),
            ProducerState::Fenced => Some(ClientError::ProducerFenced(
                "producer was fenced by a newer exclusive producer".into(),
            )),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConsumerState {
    /// Connected and receiving (the active consumer of a failover subscription).
    Active,
    /// Connected but standing by in a failover subscription.
    Inactive,
    Disconnected,
    Closed,
    Faulted,
    ReachedEndOfTopic,
    Unsubscribed,
}

impl EntityState for ConsumerState {
    const KIND: EntityKind = EntityKind::Consumer;
    const FINAL_STATES: &'static [Self] = &[
        ConsumerState::Closed,
        ConsumerState::Faulted,
        ConsumerState::ReachedEndOfTopic,
        ConsumerState::Unsubscribed,
    ];
    const INITIAL: Self = ConsumerState::Disconnected;
    const CLOSED: Self = ConsumerState::Closed;

    fn as_str(&self) -> &'static str {
        match self {
            ConsumerState::Active => "Active",
            ConsumerState::Inactive => "Inactive",
            ConsumerState::Disconnected => "Disconnected",
            ConsumerState::Closed => "Closed",
            ConsumerState::Faulted => "Faulted",
            ConsumerState::ReachedEndOfTopic => "ReachedEndOfTopic",
            ConsumerState::Unsubscribed => "Unsubscribed",
        }
    }

    fn terminal(_terminal: Terminal) -> Self {
        ConsumerState::Faulted
    }

    fn react(transport: TransportState) -> Reaction<Self> {
        match transport {
            TransportState::Disconnected | TransportState::ClosedByServer => {
                Reaction::Reconnect(ConsumerState::Disconnected)
            }
            TransportState::Connected | TransportState::Active => {
                Reaction::Deferred(ConsumerState::Active)
            }
            TransportState::Inactive => Reaction::Immediate(ConsumerState::Inactive),
            TransportState::ReachedEndOfTopic => {
                Reaction::Immediate(ConsumerState::ReachedEndOfTopic)
            }
            TransportState::Unsubscribed => Reaction::Immediate(ConsumerState::Unsubscribed),
            TransportState::WaitingForExclusive => Reaction::Ignore,
        }
    }

    fn terminal_error(self) -> Option<ClientError> {
        match self {
            ConsumerState::Closed => Some(ClientError::ConsumerClosed),
            ConsumerState::Faulted => Some(ClientError::EntityFaulted(Self::KIND)),
            ConsumerState::ReachedEndOfTopic => Some(ClientError::ReachedEndOfTopic(Self::KIND)),
            ConsumerState::Unsubscribed => Some(ClientError::ConsumerUnsubscribed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReaderState {
    Connected,
    Disconnected,
    Closed,
    Faulted,
    ReachedEndOfTopic,
}

impl EntityState for ReaderState {
    const KIND: EntityKind = EntityKind::Reader;
    const FINAL_STATES: &'static [Self] = &[
        ReaderState::Closed,
        ReaderState::Faulted,
        ReaderState::ReachedEndOfTopic,
    ];
    const INITIAL: Self = ReaderState::Disconnected;
    const CLOSED: Self = ReaderState::Closed;

    fn as_str(&self) -> &'static str {
        match self {
            ReaderState::Connected => "Connected",
            ReaderState::Disconnected => "Disconnected",
            ReaderState::Closed => "Closed",
            ReaderState::Faulted => "Faulted",
            ReaderState::ReachedEndOfTopic => "ReachedEndOfTopic",
        }
    }

    fn terminal(_terminal: Terminal) -> Self {
        ReaderState::Faulted
    }

    fn react(transport: TransportState) -> Reaction<Self> {
        match transport {
            TransportState::Disconnected | TransportState::ClosedByServer => {
                Reaction::Reconnect(ReaderState::Disconnected)
            }
            TransportState::Connected => Reaction::Deferred(ReaderState::Connected),
            TransportState::ReachedEndOfTopic => {
                Reaction::Immediate(ReaderState::ReachedEndOfTopic)
            }
            _ => Reaction::Ignore,
        }
    }

    fn terminal_error(self) -> Option<ClientError> {
        match self {
            ReaderState::Closed => Some(ClientError::ReaderClosed),
            ReaderState::Faulted => Some(ClientError::EntityFaulted(Self::KIND)),
            ReaderState::ReachedEndOfTopic => Some(ClientError::ReachedEndOfTopic(Self::KIND)),
            _ => None,
        }
    }
}

macro_rules! display_via_as_str {
    ($($state:ty),+) => {
        $(
            impl fmt::Display for $state {
                fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                    f.write_str(EntityState::as_str(self))
                }
            }
        )+
    };
}

display_via_as_str!(ProducerState, ConsumerState, ReaderState);

#[cfg(test)]
mod tests {
    use super::*;

    const ALL_PRODUCER: [ProducerState; 6] = [
        ProducerState::Connected,
        ProducerState::Disconnected,
        ProducerState::WaitingForExclusive,
        ProducerState::Closed,
        ProducerState::Faulted,
        ProducerState::Fenced,
    ];

    const ALL_CONSUMER: [ConsumerState; 7] = [
        ConsumerState::Active,
        ConsumerState::Inactive,
        ConsumerState::Disconnected,
        ConsumerState::Closed,
        ConsumerState::Faulted,
        ConsumerState::ReachedEndOfTopic,
        ConsumerState::Unsubscribed,
    ];

    const ALL_READER: [ReaderState; 5] = [
        ReaderState::Connected,
        ReaderState::Disconnected,
        ReaderState::Closed,
        ReaderState::Faulted,
        ReaderState::ReachedEndOfTopic,
    ];

    fn assert_terminal_errors_match_final_states<S: EntityState>(all: &[S]) {
        for state in all {
            assert_eq!(
                state.terminal_error().is_some(),
                state.is_final(),
                "terminal error and final-ness disagree for {state}"
            );
        }
    }

    #[test]
    fn test_final_states_have_terminal_errors() {
        assert_terminal_errors_match_final_states(&ALL_PRODUCER);
        assert_terminal_errors_match_final_states(&ALL_CONSUMER);
        assert_terminal_errors_match_final_states(&ALL_READER);
    }

    #[test]
    fn test_initial_state_is_not_final() {
        assert!(!ProducerState::INITIAL.is_final());
        assert!(!ConsumerState::INITIAL.is_final());
        assert!(!ReaderState::INITIAL.is_final());
    }

    #[test]
    fn test_fencing_only_applies_to_producers() {
        let fenced = ClientError::ProducerFenced("newer producer".into());
        assert_eq!(EntityKind::Producer.terminal_for(&fenced), Terminal::Fenced);
        assert_eq!(EntityKind::Reader.terminal_for(&fenced), Terminal::Faulted);

        let other = ClientError::TopicNotFound("t".into());
        assert_eq!(EntityKind::Producer.terminal_for(&other), Terminal::Faulted);
    }

    #[test]
    fn test_terminal_mapping() {
        assert_eq!(ProducerState::terminal(Terminal::Fenced), ProducerState::Fenced);
        assert_eq!(ProducerState::terminal(Terminal::Faulted), ProducerState::Faulted);
        assert_eq!(ConsumerState::terminal(Terminal::Fenced), ConsumerState::Faulted);
        assert!(ProducerState::Fenced.is_fault());
        assert!(!ProducerState::Closed.is_fault());
    }

    #[test]
    fn test_disconnects_trigger_reconnect() {
        for transport in [TransportState::Disconnected, TransportState::ClosedByServer] {
            assert_eq!(
                ProducerState::react(transport),
                Reaction::Reconnect(ProducerState::Disconnected)
            );
            assert_eq!(
                ConsumerState::react(transport),
                Reaction::Reconnect(ConsumerState::Disconnected)
            );
            assert_eq!(
                ReaderState::react(transport),
                Reaction::Reconnect(ReaderState::Disconnected)
            );
        }
    }

    #[test]
    fn test_connected_is_deferred() {
        assert_eq!(
            ProducerState::react(TransportState::Connected),
            Reaction::Deferred(ProducerState::Connected)
        );
        assert_eq!(
            ConsumerState::react(TransportState::Connected),
            Reaction::Deferred(ConsumerState::Active)
        );
        assert_eq!(
            ReaderState::react(TransportState::Connected),
            Reaction::Deferred(ReaderState::Connected)
        );
    }

    #[test]
    fn test_kind_specific_reactions() {
        assert_eq!(
            ProducerState::react(TransportState::WaitingForExclusive),
            Reaction::Immediate(ProducerState::WaitingForExclusive)
        );
        assert_eq!(
            ReaderState::react(TransportState::WaitingForExclusive),
            Reaction::Ignore
        );
        assert_eq!(
            ConsumerState::react(TransportState::Unsubscribed),
            Reaction::Immediate(ConsumerState::Unsubscribed)
        );
        assert_eq!(
            ProducerState::react(TransportState::ReachedEndOfTopic),
            Reaction::Ignore
        );
    }

    #[test]
    fn test_state_display() {
        assert_eq!(ProducerState::WaitingForExclusive.to_string(), "WaitingForExclusive");
        assert_eq!(ConsumerState::ReachedEndOfTopic.to_string(), "ReachedEndOfTopic");
        assert_eq!(ReaderState::Connected.to_string(), "Connected");
        assert_eq!(EntityKind::Consumer.to_string(), "Consumer");
    }
}
