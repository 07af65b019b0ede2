// ============================================================================
// Dispatch Worker - queue consumer process
// ============================================================================
//
// Consumes dispatch jobs from the durable queue and runs them through
// validate -> resolve-integration -> send -> record. The WhatsApp client
// sits behind a circuit breaker; queue-level retry and dead-lettering
// live in the worker loop. Independent worker processes scale out by
// joining the same consumer group.
//
// ============================================================================

use anyhow::{Context, Result};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use zaply_server::config::{mask_url_credentials, Config};
use zaply_server::health::{health_router, HealthMonitor, TracingAlertSink};
use zaply_server::metrics::WorkerMetrics;
use zaply_server::queue::{JobQueue, RedisJobQueue};
use zaply_server::retry::RetryPolicy;
use zaply_server::sender::{ChannelSender, CircuitBreaker, WhatsAppSender};
use zaply_server::store::{postgres, PgStatusStore, StatusStore};
use zaply_server::worker::{JobProcessor, Worker};

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    let config = Arc::new(Config::from_env()?);

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(config.rust_log.clone()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("=== Dispatch worker starting ===");
    info!("Database: {}", mask_url_credentials(&config.database_url));
    info!("Broker: {}", mask_url_credentials(&config.redis_url));
    info!(
        "Retry policy: max_retries={} base_delay_ms={}",
        config.retry.max_retries, config.retry.base_delay_ms
    );

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

    let whatsapp = Arc::new(
        WhatsAppSender::new(config.channel.clone()).context("Failed to build channel client")?,
    );
    let sender: Arc<dyn ChannelSender> = Arc::new(CircuitBreaker::new(whatsapp, config.circuit));

    let metrics = Arc::new(WorkerMetrics::new());
    let processor = JobProcessor::new(
        store.clone(),
        sender,
        config.channel.default_country_code.clone(),
        config.log_hash_salt.clone(),
    );
    let worker = Worker::new(
        queue.clone(),
        processor,
        metrics.clone(),
        RetryPolicy::from(config.retry),
        config.worker.clone(),
    );

    let monitor = Arc::new(HealthMonitor::new(
        store,
        queue,
        metrics,
        config.health,
        vec![Box::new(TracingAlertSink)],
    ));

    let shutdown = Arc::new(AtomicBool::new(false));

    // Signal handler flips the shutdown flag; the consumer loop drains
    // in-flight jobs before exiting.
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            #[cfg(unix)]
            {
                use tokio::signal::unix::{signal, SignalKind};
                let mut sigterm =
                    signal(SignalKind::terminate()).expect("Failed to register SIGTERM handler");
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
        });
    }

    let monitor_handle = {
        let monitor = monitor.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move { monitor.run(shutdown).await })
    };

    let health_handle = {
        let addr = SocketAddr::from(([0, 0, 0, 0], config.health_port));
        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .with_context(|| format!("Failed to bind health port {}", config.health_port))?;
        info!("Health endpoints on {}", addr);
        tokio::spawn(async move {
            let _ = axum::serve(listener, health_router(monitor)).await;
        })
    };

    worker.run(shutdown).await;

    monitor_handle.abort();
    health_handle.abort();

    info!("Dispatch worker stopped gracefully");
    Ok(())
}
