use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use tokio::sync::OnceCell;
use tracing::info;
use validator::Validate;

use super::{
    channel::{ChannelTarget, ConnectChannel},
    config::{ClientConfig, ConsumerOptions, ProducerOptions, ReaderOptions},
    consumer::Consumer,
    entity::{ClientContext, EntityCore},
    error::{ClientError, Result},
    events::ProcessManager,
    executor::{FaultContext, FaultHandler},
    producer::Producer,
    reader::Reader,
};

/// Entry point: creates producers, consumers and readers over one transport
/// and owns the routing of their lifecycle events.
///
/// Entities must be created from within a Tokio runtime.
pub struct PulsarClient {
    config: ClientConfig,
    manager: Arc<ProcessManager>,
    connector: Arc<dyn ConnectChannel>,
    fault_handler: Option<FaultHandler>,
    disposed: AtomicBool,
    shutdown: OnceCell<()>,
}

impl std::fmt::Debug for PulsarClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PulsarClient")
            .field("service_url", &self.config.service_url)
            .field("live_entities", &self.manager.len())
            .field("disposed", &self.is_disposed())
            .finish()
    }
}

impl PulsarClient {
    /// Validates `config` and builds a client on top of `connector`.
    pub fn new(config: ClientConfig, connector: Arc<dyn ConnectChannel>) -> Result<Self> {
        config.validate()?;
        info!("Client created for {}", config.service_url);

        Ok(Self {
            config,
            manager: Arc::new(ProcessManager::new()),
            connector,
            fault_handler: None,
            disposed: AtomicBool::new(false),
            shutdown: OnceCell::new(),
        })
    }

    /// Observes every fault seen by executors and reconnect loops.
    pub fn with_fault_handler<F>(mut self, handler: F) -> Self
    where
        F: Fn(&FaultContext<'_>) + Send + Sync + 'static,
    {
        self.fault_handler = Some(Arc::new(handler));
        self
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Number of entities not yet disposed.
    pub fn live_entities(&self) -> usize {
        self.manager.len()
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    fn context(&self) -> Result<ClientContext> {
        if self.is_disposed() {
            return Err(ClientError::ClientDisposed);
        }
        Ok(ClientContext {
            manager: Arc::clone(&self.manager),
            connector: Arc::clone(&self.connector),
            retry: self.config.retry_policy(),
            reconnect: self.config.reconnect_policy(),
            fault_handler: self.fault_handler.clone(),
        })
    }

    pub fn new_producer(&self, options: ProducerOptions) -> Result<Producer> {
        options.validate()?;
        let ctx = self.context()?;
        let core = EntityCore::spawn(
            &ctx,
            options.topic,
            ChannelTarget::Producer {
                producer_name: options.producer_name,
                access_mode: options.access_mode,
            },
        );
        Ok(Producer::new(core))
    }

    pub fn new_consumer(&self, options: ConsumerOptions) -> Result<Consumer> {
        options.validate()?;
        let ctx = self.context()?;
        let subscription = options.subscription_name.clone();
        let core = EntityCore::spawn(
            &ctx,
            options.topic,
            ChannelTarget::Consumer {
                subscription: options.subscription_name,
                subscription_type: options.subscription_type,
                initial_position: options.initial_position,
            },
        );
        Ok(Consumer::new(core, subscription))
    }

    pub fn new_reader(&self, options: ReaderOptions) -> Result<Reader> {
        options.validate()?;
        let ctx = self.context()?;
        let core = EntityCore::spawn(
            &ctx,
            options.topic,
            ChannelTarget::Reader {
                start_message_id: options.start_position.message_id(),
            },
        );
        Ok(Reader::new(core))
    }

    /// Disposes every live entity and refuses new ones. Idempotent; concurrent
    /// callers all return once the shutdown has finished.
    pub async fn dispose(&self) {
        self.disposed.store(true, Ordering::Release);
        self.shutdown
            .get_or_init(|| async {
                info!("Disposing client for {}", self.config.service_url);
                self.manager.dispose_all().await;
            })
            .await;
    }
}
