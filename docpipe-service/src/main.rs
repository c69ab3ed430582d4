use std::sync::Arc;
use std::time::Instant;

use metrics_exporter_prometheus::PrometheusBuilder;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

mod api;
mod config;
mod db;
mod error;
mod events;
mod ingestion;
mod queue;
mod service;
mod storage;

use crate::api::AppState;
use crate::config::load_config;
use crate::db::Database;
use crate::queue::{ProcessingQueue, QueueOptions, Task, TaskType};
use crate::service::DocpipeService;

const EVENT_CHANNEL_CAPACITY: usize = 1024;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    init_logging();

    info!("Starting docpipe service v{}", env!("CARGO_PKG_VERSION"));

    let config = load_config()?;
    info!(
        host = %config.server.host,
        port = config.server.port,
        backend = ?config.storage.backend,
        "Configuration loaded"
    );

    // Ensure data directory exists
    std::fs::create_dir_all(&config.storage.data_dir)?;

    let db_path = config.storage.database_path();
    let db = Arc::new(Database::open(&db_path)?);
    info!(path = %db_path.display(), "Database initialized");

    let store = storage::build_store(&config)?;

    let prometheus = match PrometheusBuilder::new().install_recorder() {
        Ok(handle) => Some(handle),
        Err(e) => {
            warn!(error = %e, "Prometheus recorder unavailable, /metrics will be empty");
            None
        }
    };

    let background = CancellationToken::new();

    // Pipeline event consumer
    let (events, events_rx) = events::channel(EVENT_CHANNEL_CAPACITY);
    let consumer = tokio::spawn(events::run_consumer(events_rx, background.clone()));

    let queue = ProcessingQueue::new(QueueOptions::from_config(&config.queue));
    let service = Arc::new(DocpipeService::new(config, db, store, events));
    queue.start(service.clone());

    // Resume documents whose preprocessing was interrupted by the last shutdown
    match service.reconcile_interrupted() {
        Ok(ids) => {
            for id in ids {
                if let Err(e) = queue.add_task(Task::new(TaskType::Process, id.clone())) {
                    warn!(doc_id = %id, error = %e, "Could not re-enqueue interrupted document");
                }
            }
        }
        Err(e) => warn!(error = %e, "Failed to reconcile interrupted preprocessing"),
    }

    // Expired upload session sweeper
    let sweeper = {
        let service = service.clone();
        let cancel = background.clone();
        let period = service.config.upload.cleanup_interval();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => {}
                }
                match service.cleanup_expired_sessions().await {
                    Ok(count) if count > 0 => {
                        info!(removed = count, "Cleaned up expired upload sessions");
                    }
                    Err(e) => warn!(error = %e, "Upload session cleanup failed"),
                    _ => {}
                }
            }
        })
    };

    let addr = format!("{}:{}", service.config.server.host, service.config.server.port);
    let state = Arc::new(AppState {
        service,
        queue: queue.clone(),
        prometheus,
        start_time: Instant::now(),
    });
    let app = api::router(state);

    let listener = TcpListener::bind(&addr).await?;
    info!("Listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // In-flight tasks finish before background consumers stop
    queue.stop().await;
    background.cancel();
    let _ = sweeper.await;
    let _ = consumer.await;

    info!("Shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}

fn init_logging() {
    use tracing_subscriber::{EnvFilter, fmt, prelude::*};

    let format = fmt::format()
        .with_target(true)
        .with_thread_ids(true)
        .compact();

    // Use RUST_LOG if set, otherwise default to info level for our crate
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("docpipe_service=info"));

    tracing_subscriber::registry()
        .with(fmt::layer().event_format(format))
        .with(filter)
        .init();
}
