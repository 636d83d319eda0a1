//! The reading loop and its helpers.
//!
//! [`read_messages`] drains a reader until cancelled, [`log_state_changes`]
//! plays the part of a state-changed handler, and [`run_heartbeat`] keeps a
//! demo producer publishing so there is always something to read.

use std::time::Duration;

use bytes::Bytes;
use futures_util::StreamExt;
use pulsebee_client::{ClientError, EntityState, Producer, Reader};
use thiserror::Error;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Error, Debug)]
pub enum ReadingError {
    #[error("Reader for topic '{topic}' stopped: {source}")]
    Reader {
        topic: String,
        #[source]
        source: ClientError,
    },

    #[error("Heartbeat producer stopped: {0}")]
    Heartbeat(#[source] ClientError),

    #[error("Client error: {0}")]
    Client(#[from] ClientError),
}

/// Logs every message until `cancel` fires. Returns how many were read.
///
/// # Errors
///
/// Returns `ReadingError::Reader` when the reader ends for any other reason
/// (topic terminated, reader faulted or disposed).
pub async fn read_messages(reader: &Reader, cancel: &CancellationToken) -> Result<u64, ReadingError> {
    let mut count = 0u64;
    let messages = reader.messages(cancel);
    tokio::pin!(messages);

    while let Some(item) = messages.next().await {
        match item {
            Ok(message) => {
                count += 1;
                let payload = message.payload.to_vec();
                info!(
                    "Received {} from '{}': {}",
                    message.message_id,
                    message.producer_name,
                    String::from_utf8_lossy(&payload)
                );
            }
            Err(source) => {
                return Err(ReadingError::Reader {
                    topic: reader.topic().to_string(),
                    source,
                })
            }
        }
    }

    debug!("Reading of '{}' cancelled after {} messages", reader.topic(), count);
    Ok(count)
}

/// Logs each state change seen on `states` until a final state is reached or
/// the sender goes away.
pub async fn log_state_changes<S: EntityState>(topic: String, mut states: watch::Receiver<S>) {
    let mut last = *states.borrow_and_update();
    info!("The {} for topic '{}' starts in state '{}'", S::KIND, topic, last);

    while states.changed().await.is_ok() {
        let state = *states.borrow_and_update();
        if state == last {
            continue;
        }
        last = state;

        if state.is_fault() {
            error!("The {} for topic '{}' changed state to '{}'", S::KIND, topic, state);
        } else {
            info!("The {} for topic '{}' changed state to '{}'", S::KIND, topic, state);
        }

        if state.is_final() {
            break;
        }
    }
}

/// Publishes a numbered heartbeat every `interval` until cancelled.
///
/// Returns the number of heartbeats sent. Sends wait out reconnects; only a
/// fatal failure stops the loop early.
pub async fn run_heartbeat(
    producer: &Producer,
    interval: Duration,
    cancel: &CancellationToken,
) -> Result<u64, ReadingError> {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut sent = 0u64;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let payload = Bytes::from(format!("heartbeat #{}", sent + 1));
        match producer.send(payload, cancel).await {
            Ok(id) => {
                sent += 1;
                debug!("Heartbeat #{} stored as {}", sent, id);
            }
            Err(e) if e.is_cancelled() => break,
            Err(e) => {
                warn!(
                    "Heartbeat producer is {} after {} heartbeats",
                    producer.state(),
                    sent
                );
                return Err(ReadingError::Heartbeat(e));
            }
        }
    }

    debug!("Heartbeat stopped after {} messages", sent);
    Ok(sent)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use pulsebee_client::{
        loopback::LoopbackBroker, ClientConfig, ProducerOptions, PulsarClient, ReaderOptions,
        ReaderState,
    };
    use tracing_test::traced_test;

    use super::*;

    const TOPIC: &str = "persistent://public/default/reading";

    fn client(broker: &LoopbackBroker) -> PulsarClient {
        let config = ClientConfig {
            retry_interval_ms: 10,
            ..ClientConfig::default()
        };
        PulsarClient::new(config, Arc::new(broker.clone())).unwrap()
    }

    #[tokio::test]
    #[traced_test]
    async fn test_reads_until_cancelled() {
        let broker = LoopbackBroker::new();
        broker.publish(TOPIC, "first");
        broker.publish(TOPIC, "second");
        let client = client(&broker);
        let reader = client.new_reader(ReaderOptions::new(TOPIC)).unwrap();
        let cancel = CancellationToken::new();

        let stopper = {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(50)).await;
                cancel.cancel();
            })
        };

        let count = read_messages(&reader, &cancel).await.unwrap();
        stopper.await.unwrap();

        assert_eq!(count, 2);
        assert!(logs_contain("first"));
        assert!(logs_contain("second"));
        client.dispose().await;
    }

    #[tokio::test]
    async fn test_terminated_topic_is_an_error() {
        let broker = LoopbackBroker::new();
        broker.terminate_topic(TOPIC);
        let client = client(&broker);
        let reader = client.new_reader(ReaderOptions::new(TOPIC)).unwrap();

        let err = read_messages(&reader, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ReadingError::Reader { .. }));
        assert_eq!(reader.state(), ReaderState::ReachedEndOfTopic);
        client.dispose().await;
    }

    #[tokio::test]
    #[traced_test]
    async fn test_state_changes_are_logged_until_final() {
        let broker = LoopbackBroker::new();
        let client = client(&broker);
        let reader = client.new_reader(ReaderOptions::new(TOPIC)).unwrap();
        let logger = tokio::spawn(log_state_changes(
            reader.topic().to_string(),
            reader.subscribe_state(),
        ));

        reader
            .state_changed_to(ReaderState::Connected, &CancellationToken::new())
            .await
            .unwrap();
        // let the logger observe Connected before it is superseded
        tokio::time::sleep(Duration::from_millis(20)).await;
        reader.dispose().await;
        logger.await.unwrap();

        assert!(logs_contain("changed state to 'Connected'"));
        assert!(logs_contain("changed state to 'Closed'"));
        client.dispose().await;
    }

    #[tokio::test]
    async fn test_heartbeat_publishes_until_cancelled() {
        let broker = LoopbackBroker::new();
        let client = client(&broker);
        let producer = client.new_producer(ProducerOptions::new(TOPIC)).unwrap();
        let cancel = CancellationToken::new();

        let heartbeat = {
            let producer = producer.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                run_heartbeat(&producer, Duration::from_millis(10), &cancel).await
            })
        };

        while broker.messages(TOPIC).len() < 3 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        cancel.cancel();

        let sent = heartbeat.await.unwrap().unwrap();
        assert!(sent >= 3);
        assert_eq!(broker.messages(TOPIC)[0].payload.to_vec(), b"heartbeat #1");
        client.dispose().await;
    }
}
