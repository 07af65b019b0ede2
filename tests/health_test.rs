// ============================================================================
// Health Monitor Tests
// ============================================================================

mod common;

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use common::{MemoryQueue, MemoryStore};
use zaply_server::config::HealthConfig;
use zaply_server::health::{AlertSink, HealthMonitor, HealthSnapshot, OverallStatus};
use zaply_server::metrics::WorkerMetrics;
use zaply_server::queue::JobQueue;

struct CountingSink {
    fired: AtomicU32,
}

impl AlertSink for CountingSink {
    fn on_status_change(
        &self,
        _previous: OverallStatus,
        _current: OverallStatus,
        _snapshot: &HealthSnapshot,
    ) {
        self.fired.fetch_add(1, Ordering::SeqCst);
    }
}

fn monitor(
    store: Arc<MemoryStore>,
    queue: Arc<MemoryQueue>,
    sink: Arc<CountingSink>,
) -> HealthMonitor {
    struct ForwardingSink(Arc<CountingSink>);
    impl AlertSink for ForwardingSink {
        fn on_status_change(
            &self,
            previous: OverallStatus,
            current: OverallStatus,
            snapshot: &HealthSnapshot,
        ) {
            self.0.on_status_change(previous, current, snapshot);
        }
    }

    HealthMonitor::new(
        store,
        queue,
        Arc::new(WorkerMetrics::new()),
        HealthConfig {
            probe_interval_secs: 30,
        },
        vec![Box::new(ForwardingSink(sink))],
    )
}

#[tokio::test]
async fn test_healthy_with_consumer_is_ready() {
    let store = Arc::new(MemoryStore::new());
    let queue = Arc::new(MemoryQueue::new());
    let sink = Arc::new(CountingSink {
        fired: AtomicU32::new(0),
    });

    let monitor = monitor(store, queue.clone(), sink);
    let snapshot = monitor.probe().await;

    assert_eq!(snapshot.overall, OverallStatus::Healthy);
    assert!(snapshot.ready());
    assert_eq!(snapshot.consumers, Some(1));
    assert!(snapshot.database.latency_ms.is_some());
    assert!(snapshot.broker.latency_ms.is_some());
}

#[tokio::test]
async fn test_reachable_broker_with_zero_consumers_fails_readiness() {
    let store = Arc::new(MemoryStore::new());
    let queue = Arc::new(MemoryQueue::new());
    queue.set_consumers(0);
    let sink = Arc::new(CountingSink {
        fired: AtomicU32::new(0),
    });

    let monitor = monitor(store, queue, sink);
    let snapshot = monitor.probe().await;

    // Healthy dependencies, but nothing is consuming the queue.
    assert_eq!(snapshot.overall, OverallStatus::Healthy);
    assert!(!snapshot.ready());
}

#[tokio::test]
async fn test_broker_failure_degrades_and_notifies_sink() {
    let store = Arc::new(MemoryStore::new());
    let queue = Arc::new(MemoryQueue::new());
    let sink = Arc::new(CountingSink {
        fired: AtomicU32::new(0),
    });

    let monitor = monitor(store, queue.clone(), sink.clone());

    let snapshot = monitor.probe().await;
    assert_eq!(snapshot.overall, OverallStatus::Healthy);
    assert_eq!(sink.fired.load(Ordering::SeqCst), 0);

    queue.fail_ping(true);
    let snapshot = monitor.probe().await;
    assert_eq!(snapshot.overall, OverallStatus::Degraded);
    assert!(!snapshot.ready());
    // Status change notified exactly once.
    assert_eq!(sink.fired.load(Ordering::SeqCst), 1);

    // No change, no repeat notification.
    let _ = monitor.probe().await;
    assert_eq!(sink.fired.load(Ordering::SeqCst), 1);

    // Recovery notifies again.
    queue.fail_ping(false);
    let snapshot = monitor.probe().await;
    assert_eq!(snapshot.overall, OverallStatus::Healthy);
    assert_eq!(sink.fired.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_queue_depth_is_reported() {
    let store = Arc::new(MemoryStore::new());
    let queue = Arc::new(MemoryQueue::new());
    queue.publish(b"a", 0).await.unwrap();
    queue.publish(b"b", 0).await.unwrap();

    let sink = Arc::new(CountingSink {
        fired: AtomicU32::new(0),
    });
    let monitor = monitor(store, queue, sink);

    let snapshot = monitor.probe().await;
    assert_eq!(snapshot.queue_depth, Some(2));
}

#[tokio::test]
async fn test_probe_latency_and_liveness_are_cheap() {
    // Liveness has no dependency: the endpoint handler only proves the
    // process is alive, so all it needs is a constructed monitor.
    let store = Arc::new(MemoryStore::new());
    let queue = Arc::new(MemoryQueue::new());
    let sink = Arc::new(CountingSink {
        fired: AtomicU32::new(0),
    });
    let monitor = monitor(store, queue, sink);

    let first = monitor.probe().await;
    let cached = monitor.latest().await.unwrap();
    assert_eq!(cached.overall, first.overall);
    assert!(cached.checked_at <= chrono::Utc::now() + chrono::Duration::seconds(1));

    // A probe is bounded by the in-memory doubles - no real waits.
    let started = std::time::Instant::now();
    let _ = monitor.probe().await;
    assert!(started.elapsed() < Duration::from_secs(1));
}
