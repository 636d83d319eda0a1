//! # pulsebee-client: connection-lifecycle engine for a pub/sub broker client
//!
//! This crate keeps producers, consumers and readers usable while the
//! transport underneath them comes and goes. Each entity owns a small
//! state machine that reacts to channel events, reconnects in the
//! background and exposes its state to callers:
//!
//! - **Observable state** per entity, with awaitable transitions
//! - **Serialized reconnects**: at most one channel operation in flight
//! - **Retrying executor** that waits out transient faults
//! - **Sticky final states** (`Closed`, `Faulted`, `Fenced`, ...)
//! - **Idempotent dispose** that is safe to call concurrently
//! - **Zero-copy payloads** built from chunk sequences
//!
//! # Quick Start
//!
//! ```ignore
//! use std::sync::Arc;
//!
//! use pulsebee_client::{
//!     loopback::LoopbackBroker, ClientConfig, ProducerOptions, ProducerState, PulsarClient,
//! };
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> pulsebee_client::Result<()> {
//!     let broker = LoopbackBroker::new();
//!     let client = PulsarClient::new(ClientConfig::default(), Arc::new(broker))?;
//!
//!     let producer = client.new_producer(ProducerOptions::new("persistent://public/default/demo"))?;
//!     let cancel = CancellationToken::new();
//!
//!     producer.state_changed_to(ProducerState::Connected, &cancel).await?;
//!     let id = producer.send("hello", &cancel).await?;
//!     println!("published {id}");
//!
//!     client.dispose().await;
//!     Ok(())
//! }
//! ```
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐  new_*   ┌─────────────────────────────────────────┐
//! │ PulsarClient │────────▶ │ Producer / Consumer / Reader            │
//! └──────┬───────┘          │   EntityCore ── Executor ── StateManager│
//!        │ owns             │        │                         ▲      │
//!        ▼                  │        ▼ ContainsChannel         │      │
//! ┌──────────────┐  events  │   Process ── ActionQueue ────────┘      │
//! │ProcessManager│────────▶ │        ▲                                │
//! └──────▲───────┘          └────────┼────────────────────────────────┘
//!        │ Event                     │ establish / close
//!  ┌─────┴──────┐                    │
//!  │  Channel   │◀───────────────────┘ ConnectChannel
//!  └────────────┘
//! ```
//!
//! - [`channel`]: the transport seam. A [`ConnectChannel`] opens channels and
//!   a [`Channel`] carries commands; transport state flows back as events.
//! - [`process`]: computes the entity state from channel and executor input
//!   and schedules channel work on the [`ActionQueue`].
//! - [`executor`]: runs caller operations, retrying transient faults with the
//!   configured [`RetryPolicy`].
//! - [`state_manager`]: current state plus awaitable transitions.
//! - [`loopback`]: an in-memory broker with fault injection.
//!
//! # Connection Lifecycle
//!
//! ```text
//! Disconnected ──Connected──▶ Connected ──Disconnected──▶ Disconnected
//!      ▲                                                      │
//!      └────────────── close channel, establish new ──────────┘
//!
//! any state ──fatal fault──▶ Faulted / Fenced   (final)
//! any state ──dispose─────▶ Closed              (final)
//! ```
//!
//! A `Connected` report is applied through the action queue, so it lands
//! after any reconnect work queued before it. Reports from a channel that
//! has since been replaced are dropped.
//!
//! # Error Handling
//!
//! Every operation returns [`ClientError`]. Errors are split by
//! [`Disposition`]:
//!
//! - `Retry`: connection loss, timeouts, busy producers or consumers
//! - `Fatal`: fencing, authorization, protocol violations, exhausted retries
//!
//! ```ignore
//! match producer.send("payload", &cancel).await {
//!     Ok(id) => println!("stored as {id}"),
//!     Err(e) if e.is_cancelled() => {}
//!     Err(e) if e.is_fencing() => eprintln!("another producer took the topic"),
//!     Err(e) => eprintln!("send failed: {e}"),
//! }
//! ```
//!
//! # Thread Safety
//!
//! Entities are `Clone + Send + Sync`; every clone refers to the same
//! entity. Cancelling one caller's token never affects another caller.

pub mod action_queue;
pub mod backoff;
pub mod channel;
pub mod client;
pub mod config;
pub mod consumer;
pub mod correlation;
mod entity;
pub mod error;
pub mod events;
pub mod executor;
pub mod loopback;
pub mod message;
pub mod process;
pub mod producer;
pub mod reader;
pub mod sequence;
pub mod state;
pub mod state_manager;

// Re-exports: Entry point and entities
pub use client::PulsarClient;
pub use consumer::Consumer;
pub use producer::Producer;
pub use reader::Reader;
// Re-exports: Configuration
pub use config::{
    ClientConfig, ConsumerOptions, ProducerAccessMode, ProducerOptions, ReaderOptions,
    StartPosition, SubscriptionInitialPosition, SubscriptionType,
};
// Re-exports: Lifecycle engine
pub use action_queue::ActionQueue;
pub use backoff::{Backoff, BackoffError, RetryPolicy};
pub use channel::{Channel, ChannelEvents, ChannelRequest, ChannelTarget, ConnectChannel, TransportState};
pub use correlation::CorrelationId;
pub use events::{Event, ProcessManager, RegisterEvent};
pub use executor::{Executor, FaultContext, FaultHandler};
pub use process::Process;
pub use state::{ConsumerState, EntityKind, EntityState, ProducerState, ReaderState};
pub use state_manager::StateManager;
// Re-exports: Errors
pub use error::{ClientError, Disposition, Result};
// Re-exports: Payloads
pub use message::{Message, MessageId, OutgoingMessage, SeekPosition};
pub use sequence::{Sequence, SequenceBuilder};
