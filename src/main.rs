// ============================================================================
// Zaply Server - dispatcher process
// ============================================================================
//
// Wires the campaign dispatcher, the scheduled-campaign sweep and the
// health endpoints. Message consumption runs in the separate
// dispatch-worker binary.
//
// ============================================================================

use anyhow::{Context, Result};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use zaply_server::config::{mask_url_credentials, Config};
use zaply_server::dispatcher::CampaignDispatcher;
use zaply_server::health::{health_router, HealthMonitor, TracingAlertSink};
use zaply_server::metrics::WorkerMetrics;
use zaply_server::queue::{JobQueue, RedisJobQueue};
use zaply_server::store::{postgres, PgStatusStore, StatusStore};

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    let config = Arc::new(Config::from_env()?);

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(config.rust_log.clone()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("=== Zaply dispatcher starting ===");
    info!("Database: {}", mask_url_credentials(&config.database_url));
    info!("Broker: {}", mask_url_credentials(&config.redis_url));

    let pool = postgres::create_pool(&config.database_url, &config.db)
        .await
        .context("Failed to connect to Postgres")?;
    info!("Connected to Postgres");

    let store: Arc<dyn StatusStore> = Arc::new(PgStatusStore::new(pool));
    let queue: Arc<dyn JobQueue> = Arc::new(
        RedisJobQueue::connect(&config.redis_url, config.queue.clone())
            .await
            .context("Failed to connect to Redis")?,
    );
    info!("Connected to Redis");

    let metrics = Arc::new(WorkerMetrics::new());
    let dispatcher = Arc::new(CampaignDispatcher::new(
        store.clone(),
        queue.clone(),
        config.dispatcher.clone(),
        config.worker.inter_job_delay_ms,
    ));
    let monitor = Arc::new(HealthMonitor::new(
        store,
        queue,
        metrics,
        config.health,
        vec![Box::new(TracingAlertSink)],
    ));

    let shutdown = Arc::new(AtomicBool::new(false));

    let scheduler_handle = {
        let dispatcher = dispatcher.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move { dispatcher.run_scheduler(shutdown).await })
    };
    let monitor_handle = {
        let monitor = monitor.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move { monitor.run(shutdown).await })
    };

    let addr = SocketAddr::from(([0, 0, 0, 0], config.health_port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind health port {}", config.health_port))?;
    info!("Health endpoints on {}", addr);

    axum::serve(listener, health_router(monitor))
        .with_graceful_shutdown(shutdown_signal(shutdown.clone()))
        .await?;

    shutdown.store(true, Ordering::SeqCst);
    let _ = scheduler_handle.await;
    let _ = monitor_handle.await;

    info!("Zaply dispatcher stopped gracefully");
    Ok(())
}

async fn shutdown_signal(shutdown: Arc<AtomicBool>) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate()).expect("Failed to register SIGTERM handler");
        tokio::select! {
            _ = sigterm.recv() => info!("SIGTERM received, initiating graceful shutdown..."),
            _ = tokio::signal::ctrl_c() => info!("SIGINT received, initiating graceful shutdown..."),
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await.ok();
        info!("Ctrl-C received, initiating graceful shutdown...");
    }
    shutdown.store(true, Ordering::SeqCst);
}
