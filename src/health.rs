// ============================================================================
// Health & Backpressure Monitor
// ============================================================================
//
// Probes the shared dependencies on a fixed interval and keeps the latest
// snapshot for the HTTP endpoints:
// - /health/live  - process alive
// - /health/ready - dependencies healthy AND the primary queue has at
//                   least one active consumer (a reachable broker with
//                   zero consumers fails readiness)
// - /health       - full snapshot including worker metrics
//
// Status-change notifications go through the AlertSink seam passed at
// construction.
//
// ============================================================================

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::config::HealthConfig;
use crate::metrics::{MetricsSnapshot, WorkerMetrics};
use crate::queue::JobQueue;
use crate::store::StatusStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DependencyState {
    Connected,
    Disconnected,
    Error,
}

#[derive(Debug, Clone, Serialize)]
pub struct DependencyHealth {
    pub state: DependencyState,
    pub latency_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OverallStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthSnapshot {
    pub overall: OverallStatus,
    pub database: DependencyHealth,
    pub broker: DependencyHealth,
    /// Broker-reported backlog of the primary queue
    pub queue_depth: Option<u64>,
    /// Active consumers on the primary queue
    pub consumers: Option<u64>,
    pub worker: MetricsSnapshot,
    pub checked_at: DateTime<Utc>,
}

impl HealthSnapshot {
    pub fn ready(&self) -> bool {
        self.overall == OverallStatus::Healthy && self.consumers.unwrap_or(0) >= 1
    }
}

/// Observer seam for overall-status transitions; implementations are
/// passed at construction, nothing is registered globally.
pub trait AlertSink: Send + Sync {
    fn on_status_change(&self, previous: OverallStatus, current: OverallStatus, snapshot: &HealthSnapshot);
}

/// Default sink: structured log lines under the `alerts` target.
pub struct TracingAlertSink;

impl AlertSink for TracingAlertSink {
    fn on_status_change(
        &self,
        previous: OverallStatus,
        current: OverallStatus,
        snapshot: &HealthSnapshot,
    ) {
        warn!(
            target: "alerts",
            previous = ?previous,
            current = ?current,
            queue_depth = ?snapshot.queue_depth,
            consumers = ?snapshot.consumers,
            "Health status changed"
        );
    }
}

pub struct HealthMonitor {
    store: Arc<dyn StatusStore>,
    queue: Arc<dyn JobQueue>,
    metrics: Arc<WorkerMetrics>,
    config: HealthConfig,
    sinks: Vec<Box<dyn AlertSink>>,
    latest: RwLock<Option<HealthSnapshot>>,
}

impl HealthMonitor {
    pub fn new(
        store: Arc<dyn StatusStore>,
        queue: Arc<dyn JobQueue>,
        metrics: Arc<WorkerMetrics>,
        config: HealthConfig,
        sinks: Vec<Box<dyn AlertSink>>,
    ) -> Self {
        Self {
            store,
            queue,
            metrics,
            config,
            sinks,
            latest: RwLock::new(None),
        }
    }

    /// Probe all dependencies once and record the snapshot.
    pub async fn probe(&self) -> HealthSnapshot {
        let database = self.probe_database().await;
        let broker = self.probe_broker().await;

        let queue_depth = self.queue.depth().await.ok();
        let consumers = self.queue.consumer_count().await.ok();

        let connected = [&database, &broker]
            .iter()
            .filter(|d| d.state == DependencyState::Connected)
            .count();
        let overall = match connected {
            2 => OverallStatus::Healthy,
            0 => OverallStatus::Unhealthy,
            _ => OverallStatus::Degraded,
        };

        let snapshot = HealthSnapshot {
            overall,
            database,
            broker,
            queue_depth,
            consumers,
            worker: self.metrics.snapshot(),
            checked_at: Utc::now(),
        };

        let previous = {
            let mut latest = self.latest.write().await;
            latest.replace(snapshot.clone()).map(|s| s.overall)
        };

        if let Some(previous) = previous {
            if previous != snapshot.overall {
                for sink in &self.sinks {
                    sink.on_status_change(previous, snapshot.overall, &snapshot);
                }
            }
        }

        snapshot
    }

    async fn probe_database(&self) -> DependencyHealth {
        let started = Instant::now();
        match self.store.ping().await {
            Ok(()) => DependencyHealth {
                state: DependencyState::Connected,
                latency_ms: Some(started.elapsed().as_millis() as u64),
                error: None,
            },
            Err(e) => DependencyHealth {
                state: DependencyState::Error,
                latency_ms: None,
                error: Some(e.to_string()),
            },
        }
    }

    async fn probe_broker(&self) -> DependencyHealth {
        let started = Instant::now();
        match self.queue.ping().await {
            Ok(()) => DependencyHealth {
                state: DependencyState::Connected,
                latency_ms: Some(started.elapsed().as_millis() as u64),
                error: None,
            },
            Err(e) => DependencyHealth {
                state: DependencyState::Error,
                latency_ms: None,
                error: Some(e.to_string()),
            },
        }
    }

    pub async fn latest(&self) -> Option<HealthSnapshot> {
        self.latest.read().await.clone()
    }

    /// Probe loop; runs until the shutdown flag is set.
    pub async fn run(&self, shutdown: Arc<AtomicBool>) {
        let interval = Duration::from_secs(self.config.probe_interval_secs);
        info!(
            interval_secs = self.config.probe_interval_secs,
            "Health monitor running"
        );

        while !shutdown.load(Ordering::SeqCst) {
            self.probe().await;
            tokio::time::sleep(interval).await;
        }
    }
}

// ============================================================================
// HTTP endpoints
// ============================================================================

pub fn health_router(monitor: Arc<HealthMonitor>) -> Router {
    Router::new()
        .route("/health/live", get(live))
        .route("/health/ready", get(ready))
        .route("/health", get(full))
        .with_state(monitor)
}

async fn live() -> impl IntoResponse {
    (StatusCode::OK, "alive")
}

async fn ready(State(monitor): State<Arc<HealthMonitor>>) -> impl IntoResponse {
    let snapshot = match monitor.latest().await {
        Some(snapshot) => snapshot,
        None => monitor.probe().await,
    };

    let status = if snapshot.ready() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(snapshot))
}

async fn full(State(monitor): State<Arc<HealthMonitor>>) -> impl IntoResponse {
    let snapshot = monitor.probe().await;
    Json(snapshot)
}
