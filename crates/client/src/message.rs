use std::{
    collections::BTreeMap,
    fmt,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use serde::{Deserialize, Serialize};

use super::sequence::Sequence;

/// Position of a message within a topic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MessageId {
    pub ledger_id: u64,
    pub entry_id: u64,
    pub partition: i32,
    pub batch_index: i32,
}

impl MessageId {
    /// The oldest message available on the topic.
    pub const EARLIEST: MessageId = MessageId {
        ledger_id: u64::MAX,
        entry_id: u64::MAX,
        partition: -1,
        batch_index: -1,
    };

    /// The next message published after positioning.
    pub const LATEST: MessageId = MessageId {
        ledger_id: i64::MAX as u64,
        entry_id: i64::MAX as u64,
        partition: -1,
        batch_index: -1,
    };

    pub fn new(ledger_id: u64, entry_id: u64, partition: i32, batch_index: i32) -> Self {
        Self {
            ledger_id,
            entry_id,
            partition,
            batch_index,
        }
    }

    pub fn is_earliest(&self) -> bool {
        *self == Self::EARLIEST
    }

    pub fn is_latest(&self) -> bool {
        *self == Self::LATEST
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_earliest() {
            return f.write_str("Earliest");
        }
        if self.is_latest() {
            return f.write_str("Latest");
        }
        write!(
            f,
            "{}:{}:{}:{}",
            self.ledger_id, self.entry_id, self.partition, self.batch_index
        )
    }
}

/// A message delivered to a consumer or reader.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub message_id: MessageId,
    pub payload: Sequence,
    pub properties: BTreeMap<String, String>,
    pub key: Option<String>,
    /// Milliseconds since the Unix epoch.
    pub publish_time: u64,
    pub producer_name: String,
}

impl Message {
    pub fn publish_system_time(&self) -> SystemTime {
        UNIX_EPOCH + Duration::from_millis(self.publish_time)
    }
}

/// A message handed to a producer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OutgoingMessage {
    pub payload: Sequence,
    pub properties: BTreeMap<String, String>,
    pub key: Option<String>,
    /// Application event time in milliseconds since the Unix epoch.
    pub event_time: Option<u64>,
}

impl OutgoingMessage {
    pub fn new(payload: impl Into<Sequence>) -> Self {
        Self {
            payload: payload.into(),
            ..Self::default()
        }
    }

    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    pub fn with_event_time(mut self, event_time: u64) -> Self {
        self.event_time = Some(event_time);
        self
    }
}

/// Where to move a consumer or reader cursor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeekPosition {
    MessageId(MessageId),
    /// Milliseconds since the Unix epoch.
    PublishTime(u64),
}

impl From<MessageId> for SeekPosition {
    fn from(id: MessageId) -> Self {
        SeekPosition::MessageId(id)
    }
}

impl From<SystemTime> for SeekPosition {
    /// Times before the epoch seek to the start of the topic.
    fn from(time: SystemTime) -> Self {
        let millis = time
            .duration_since(UNIX_EPOCH)
            .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
            .unwrap_or(0);
        SeekPosition::PublishTime(millis)
    }
}

impl fmt::Display for SeekPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SeekPosition::MessageId(id) => write!(f, "message {id}"),
            SeekPosition::PublishTime(ms) => write!(f, "publish time {ms}"),
        }
    }
}

/// Milliseconds since the Unix epoch for `SystemTime::now()`.
pub(crate) fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}
