use std::{
    process,
    sync::{Arc, OnceLock},
};

use pulsebee::{
    config::Config,
    core::{
        readiness::Readiness,
        reading::{log_state_changes, read_messages, run_heartbeat, ReadingError},
    },
    logger::LoggerManager,
    print_error,
};
use pulsebee_client::{loopback::LoopbackBroker, FaultContext, PulsarClient};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

static CONFIG: OnceLock<Config> = OnceLock::new();

pub fn config() -> &'static Config {
    CONFIG.get_or_init(|| {
        Config::new().unwrap_or_else(|e| {
            print_error!("{}", e);
            process::exit(1);
        })
    })
}

fn log_fault(context: &FaultContext<'_>) {
    warn!(
        "The client got an exception from {} {}: {} ({:?})",
        context.kind, context.correlation_id, context.error, context.disposition
    );
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cfg = config();
    let mut logger_manager = LoggerManager::new(cfg.logger.clone()).unwrap_or_else(|e| {
        print_error!("Failed to setup Log Manager: {}", e);
        process::exit(1);
    });
    logger_manager.init().unwrap_or_else(|e| {
        print_error!("Failed to init Log Manager: {}", e);
        process::exit(1);
    });
    info!("Starting pulsebee version {}...", env!("CARGO_PKG_VERSION"));
    info!("Log level: {}", cfg.logger.level);
    debug!("{:#?}", cfg.client);

    let broker = LoopbackBroker::new();
    let client = PulsarClient::new(cfg.client.clone(), Arc::new(broker.clone()))
        .map_err(ReadingError::from)?
        .with_fault_handler(log_fault);
    info!(
        "Client ready for {} (loopback transport)",
        client.config().service_url
    );

    let cancel = CancellationToken::new();
    let readiness = Readiness::new();

    let reader = client
        .new_reader(cfg.reader.reader_options())
        .map_err(ReadingError::from)?;
    tokio::spawn(log_state_changes(
        reader.topic().to_string(),
        reader.subscribe_state(),
    ));
    readiness.follow(reader.subscribe_state());

    let heartbeat = if cfg.reader.heartbeat.enabled {
        let producer = client
            .new_producer(cfg.reader.heartbeat_options())
            .map_err(ReadingError::from)?;
        tokio::spawn(log_state_changes(
            producer.topic().to_string(),
            producer.subscribe_state(),
        ));

        let interval = cfg.reader.heartbeat.interval();
        let cancel = cancel.clone();
        info!(
            "Heartbeat producer publishing every {} ms",
            cfg.reader.heartbeat.interval_ms
        );
        Some(tokio::spawn(async move {
            run_heartbeat(&producer, interval, &cancel).await
        }))
    } else {
        None
    };

    info!("Reading topic '{}'. Press Ctrl+C to exit", reader.topic());

    tokio::select! {
        result = read_messages(&reader, &cancel) => match result {
            Ok(count) => info!("Reader stopped after {} messages", count),
            Err(e) => error!("{}", e),
        },
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, initiating graceful shutdown...");
        }
    }

    cancel.cancel();
    if let Some(heartbeat) = heartbeat {
        match heartbeat.await {
            Ok(Ok(sent)) => debug!("Heartbeat sent {} messages", sent),
            Ok(Err(e)) => warn!("{}", e),
            Err(e) => warn!("Heartbeat task failed: {}", e),
        }
    }

    client.dispose().await;
    debug!("Final readiness: {}", readiness.current_state());
    info!("Shutdown complete");
    Ok(())
}
