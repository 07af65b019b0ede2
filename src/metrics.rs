// ============================================================================
// Worker Metrics
// ============================================================================
//
// Rolling counters for the consumer: constructed explicitly at startup
// and passed by Arc to whoever needs them - no global registry. Job
// handlers share nothing mutable beyond these atomics; the latency
// window is a bounded ring of the last samples.
//
// ============================================================================

use serde::Serialize;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;
use tracing::info;

/// Bounded window for the rolling average latency.
const LATENCY_WINDOW: usize = 1000;

pub struct WorkerMetrics {
    processed: AtomicU64,
    success: AtomicU64,
    failure: AtomicU64,
    retry: AtomicU64,
    dead_lettered: AtomicU64,
    latencies_ms: Mutex<VecDeque<u64>>,
    started_at: Instant,
}

/// Point-in-time view of the counters, shaped for the health endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub processed: u64,
    pub success: u64,
    pub failure: u64,
    pub retry: u64,
    pub dead_lettered: u64,
    pub avg_latency_ms: f64,
    /// Messages per minute since startup
    pub rate_per_minute: f64,
}

impl WorkerMetrics {
    pub fn new() -> Self {
        Self {
            processed: AtomicU64::new(0),
            success: AtomicU64::new(0),
            failure: AtomicU64::new(0),
            retry: AtomicU64::new(0),
            dead_lettered: AtomicU64::new(0),
            latencies_ms: Mutex::new(VecDeque::with_capacity(LATENCY_WINDOW)),
            started_at: Instant::now(),
        }
    }

    pub fn record_success(&self, latency: Duration) {
        self.processed.fetch_add(1, Ordering::Relaxed);
        self.success.fetch_add(1, Ordering::Relaxed);
        self.push_latency(latency);
    }

    pub fn record_failure(&self, latency: Duration) {
        self.processed.fetch_add(1, Ordering::Relaxed);
        self.failure.fetch_add(1, Ordering::Relaxed);
        self.push_latency(latency);
    }

    pub fn record_retry(&self) {
        self.retry.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dead_letter(&self) {
        self.dead_lettered.fetch_add(1, Ordering::Relaxed);
    }

    fn push_latency(&self, latency: Duration) {
        let mut window = self.latencies_ms.lock().expect("latency window poisoned");
        if window.len() == LATENCY_WINDOW {
            window.pop_front();
        }
        window.push_back(latency.as_millis() as u64);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let avg_latency_ms = {
            let window = self.latencies_ms.lock().expect("latency window poisoned");
            if window.is_empty() {
                0.0
            } else {
                window.iter().sum::<u64>() as f64 / window.len() as f64
            }
        };

        let processed = self.processed.load(Ordering::Relaxed);
        let elapsed_minutes = self.started_at.elapsed().as_secs_f64() / 60.0;
        let rate_per_minute = if elapsed_minutes > 0.0 {
            processed as f64 / elapsed_minutes
        } else {
            0.0
        };

        MetricsSnapshot {
            processed,
            success: self.success.load(Ordering::Relaxed),
            failure: self.failure.load(Ordering::Relaxed),
            retry: self.retry.load(Ordering::Relaxed),
            dead_lettered: self.dead_lettered.load(Ordering::Relaxed),
            avg_latency_ms,
            rate_per_minute,
        }
    }

    pub fn log_summary(&self) {
        let snapshot = self.snapshot();
        info!(
            processed = snapshot.processed,
            success = snapshot.success,
            failure = snapshot.failure,
            retry = snapshot.retry,
            dead_lettered = snapshot.dead_lettered,
            avg_latency_ms = snapshot.avg_latency_ms,
            rate_per_minute = snapshot.rate_per_minute,
            "Worker metrics"
        );
    }
}

impl Default for WorkerMetrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_accumulate() {
        let metrics = WorkerMetrics::new();
        metrics.record_success(Duration::from_millis(10));
        metrics.record_success(Duration::from_millis(30));
        metrics.record_failure(Duration::from_millis(20));
        metrics.record_retry();
        metrics.record_dead_letter();

        let snap = metrics.snapshot();
        assert_eq!(snap.processed, 3);
        assert_eq!(snap.success, 2);
        assert_eq!(snap.failure, 1);
        assert_eq!(snap.retry, 1);
        assert_eq!(snap.dead_lettered, 1);
        assert!((snap.avg_latency_ms - 20.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_latency_window_is_bounded() {
        let metrics = WorkerMetrics::new();
        for _ in 0..(LATENCY_WINDOW + 100) {
            metrics.record_success(Duration::from_millis(5));
        }
        let window = metrics.latencies_ms.lock().unwrap();
        assert_eq!(window.len(), LATENCY_WINDOW);
    }
}
