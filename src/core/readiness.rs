//! Readiness of the reading application.
//!
//! The reader's lifecycle state is translated into a coarse [`ReadinessState`]
//! that other components (health checks, the heartbeat) can watch without
//! knowing about entity states.

use std::fmt;

use pulsebee_client::ReaderState;
use tokio::sync::watch;
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadinessState {
    Ready,
    /// Temporarily unavailable; the reason is meant for humans.
    NotReadyYet(String),
    /// Will never become ready again.
    Stopped(String),
    Unknown,
}

impl ReadinessState {
    pub fn is_ready(&self) -> bool {
        matches!(self, ReadinessState::Ready)
    }

    pub fn is_stopped(&self) -> bool {
        matches!(self, ReadinessState::Stopped(_))
    }

    pub fn as_str(&self) -> &str {
        match self {
            ReadinessState::Ready => "Ready",
            ReadinessState::NotReadyYet(_) => "NotReadyYet",
            ReadinessState::Stopped(_) => "Stopped",
            ReadinessState::Unknown => "Unknown",
        }
    }

    pub fn reason(&self) -> &str {
        match self {
            ReadinessState::NotReadyYet(reason) | ReadinessState::Stopped(reason) => reason,
            _ => "",
        }
    }
}

impl fmt::Display for ReadinessState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReadinessState::NotReadyYet(reason) | ReadinessState::Stopped(reason) => {
                write!(f, "{}: {}", self.as_str(), reason)
            }
            _ => f.write_str(self.as_str()),
        }
    }
}

impl From<ReaderState> for ReadinessState {
    fn from(state: ReaderState) -> Self {
        match state {
            ReaderState::Connected => ReadinessState::Ready,
            ReaderState::Disconnected => ReadinessState::NotReadyYet("reader reconnecting".into()),
            ReaderState::ReachedEndOfTopic => {
                ReadinessState::Stopped("topic terminated, nothing left to read".into())
            }
            ReaderState::Closed => ReadinessState::Stopped("reader closed".into()),
            ReaderState::Faulted => ReadinessState::Stopped("reader faulted".into()),
        }
    }
}

/// Shared readiness tracker observed through a watch channel.
#[derive(Debug, Clone)]
pub struct Readiness {
    state_tx: watch::Sender<ReadinessState>,
}

impl Readiness {
    pub fn new() -> Self {
        let (state_tx, _) = watch::channel(ReadinessState::Unknown);
        Self { state_tx }
    }

    pub fn subscribe(&self) -> watch::Receiver<ReadinessState> {
        self.state_tx.subscribe()
    }

    pub fn current_state(&self) -> ReadinessState {
        self.state_tx.borrow().clone()
    }

    pub fn set_state(&self, state: ReadinessState) {
        let old_state = self.state_tx.send_replace(state.clone());
        if old_state != state {
            debug!("The readiness status has changed: {} -> {}", old_state, state);
        }
    }

    /// Follows `reader_states` until the reader stops or the sender is gone.
    pub fn follow(&self, reader_states: watch::Receiver<ReaderState>) -> tokio::task::JoinHandle<()> {
        let readiness = self.clone();
        tokio::spawn(async move { readiness.listen(reader_states).await })
    }

    async fn listen(&self, mut reader_states: watch::Receiver<ReaderState>) {
        loop {
            let state = ReadinessState::from(*reader_states.borrow_and_update());
            let stopped = state.is_stopped();
            self.set_state(state);
            if stopped {
                debug!("Reader stopped, readiness listening finished");
                return;
            }
            if reader_states.changed().await.is_err() {
                warn!("Reader state channel closed, readiness listening stopped");
                return;
            }
        }
    }
}

impl Default for Readiness {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_readiness_state_helpers() {
        assert!(ReadinessState::Ready.is_ready());
        assert!(!ReadinessState::Unknown.is_ready());
        assert!(ReadinessState::Stopped("done".into()).is_stopped());
        assert_eq!(ReadinessState::NotReadyYet("why".into()).reason(), "why");
        assert_eq!(ReadinessState::Ready.reason(), "");
        assert_eq!(
            ReadinessState::NotReadyYet("reconnecting".into()).to_string(),
            "NotReadyYet: reconnecting"
        );
    }

    #[test]
    fn test_reader_state_mapping() {
        assert!(ReadinessState::from(ReaderState::Connected).is_ready());
        assert_eq!(
            ReadinessState::from(ReaderState::Disconnected).as_str(),
            "NotReadyYet"
        );
        for state in [
            ReaderState::Closed,
            ReaderState::Faulted,
            ReaderState::ReachedEndOfTopic,
        ] {
            assert!(ReadinessState::from(state).is_stopped());
        }
    }

    #[tokio::test]
    async fn test_follow_tracks_reader_until_stopped() {
        let readiness = Readiness::new();
        let (tx, rx) = watch::channel(ReaderState::Disconnected);
        let mut observed = readiness.subscribe();

        let listener = readiness.follow(rx);
        observed.changed().await.unwrap();
        assert_eq!(observed.borrow_and_update().as_str(), "NotReadyYet");

        tx.send(ReaderState::Connected).unwrap();
        observed.changed().await.unwrap();
        assert!(observed.borrow_and_update().is_ready());

        tx.send(ReaderState::Closed).unwrap();
        listener.await.unwrap();
        assert!(readiness.current_state().is_stopped());
    }

    #[tokio::test]
    async fn test_listener_stops_when_sender_drops() {
        let readiness = Readiness::new();
        let (tx, rx) = watch::channel(ReaderState::Connected);
        let listener = readiness.follow(rx);
        drop(tx);
        listener.await.unwrap();
        assert!(readiness.current_state().is_ready());
    }
}
