// ============================================================================
// Job Consumer
// ============================================================================
//
// Pulls deliveries from the durable queue and runs them through the
// processor under a bounded concurrency limit. Failure handling:
// - corrupt payloads dead-letter immediately, the processor never runs
// - permanent errors dead-letter without burning the retry budget
// - transient errors wait out the backoff, republish with an incremented
//   attempt count and acknowledge the original delivery
//
// A fixed inter-job delay after every processed job is the primary
// throughput throttle toward the externally rate-limited channel.
//
// ============================================================================

pub mod processor;
pub mod validation;

pub use processor::{JobProcessor, ProcessOutcome};

use futures_util::StreamExt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{error, info, warn};

use crate::audit::AuditLogger;
use crate::config::WorkerConfig;
use crate::metrics::WorkerMetrics;
use crate::models::DispatchJob;
use crate::queue::{JobDelivery, JobQueue};
use crate::retry::{RetryDecision, RetryEnvelope, RetryPolicy};
use crate::sender::sanitize::redact_secrets;

const METRICS_LOG_INTERVAL: Duration = Duration::from_secs(30);
const STALE_CLAIM_INTERVAL: Duration = Duration::from_secs(30);
const FETCH_ERROR_BACKOFF: Duration = Duration::from_secs(1);

pub struct Worker {
    queue: Arc<dyn JobQueue>,
    processor: JobProcessor,
    metrics: Arc<WorkerMetrics>,
    policy: RetryPolicy,
    config: WorkerConfig,
}

impl Worker {
    pub fn new(
        queue: Arc<dyn JobQueue>,
        processor: JobProcessor,
        metrics: Arc<WorkerMetrics>,
        policy: RetryPolicy,
        config: WorkerConfig,
    ) -> Self {
        Self {
            queue,
            processor,
            metrics,
            policy,
            config,
        }
    }

    /// Consume until the shutdown flag is set. In-flight jobs are drained
    /// before returning; already-queued jobs are left for the next start.
    pub async fn run(&self, shutdown: Arc<AtomicBool>) {
        info!(
            prefetch = self.config.prefetch,
            concurrency = self.config.concurrency,
            inter_job_delay_ms = self.config.inter_job_delay_ms,
            "Dispatch worker consuming"
        );

        let mut last_metrics_log = Instant::now();
        let mut last_stale_claim = Instant::now();

        while !shutdown.load(Ordering::SeqCst) {
            // Recover deliveries stuck pending on dead consumers.
            if last_stale_claim.elapsed() >= STALE_CLAIM_INTERVAL {
                last_stale_claim = Instant::now();
                match self.queue.claim_stale().await {
                    Ok(stale) if !stale.is_empty() => {
                        self.handle_batch(stale).await;
                    }
                    Ok(_) => {}
                    Err(e) => warn!(error = %e, "Failed to claim stale deliveries"),
                }
            }

            let block = Duration::from_millis(self.config.block_ms);
            match self.queue.fetch(self.config.prefetch, block).await {
                Ok(deliveries) if deliveries.is_empty() => {}
                Ok(deliveries) => self.handle_batch(deliveries).await,
                Err(e) => {
                    error!(error = %e, "Queue fetch failed");
                    tokio::time::sleep(FETCH_ERROR_BACKOFF).await;
                }
            }

            if last_metrics_log.elapsed() >= METRICS_LOG_INTERVAL {
                last_metrics_log = Instant::now();
                self.metrics.log_summary();
            }
        }

        info!("Shutdown flag set, dispatch worker stopped");
    }

    /// Process a batch under the bounded concurrency limit. The broker
    /// may hand out up to `prefetch` unacknowledged deliveries; at most
    /// `concurrency` are in flight at once.
    async fn handle_batch(&self, deliveries: Vec<JobDelivery>) {
        futures_util::stream::iter(deliveries)
            .for_each_concurrent(self.config.concurrency, |delivery| async move {
                self.handle_delivery(delivery).await;
                // Fixed pacing toward the rate-limited channel.
                tokio::time::sleep(Duration::from_millis(self.config.inter_job_delay_ms)).await;
            })
            .await;
    }

    async fn handle_delivery(&self, delivery: JobDelivery) {
        let started = Instant::now();

        // Corrupt payloads bypass retry counting entirely: nothing that
        // fails to deserialize can be salvaged by redelivery.
        let job = match DispatchJob::decode(&delivery.payload) {
            Ok(job) => job,
            Err(e) => {
                let reason = format!("payload deserialization failed: {}", e);
                error!(stream_id = %delivery.stream_id, error = %e, "Dead-lettering corrupt payload");
                self.dead_letter(&delivery, &reason).await;
                return;
            }
        };

        match self.processor.process(&job).await {
            Ok(ProcessOutcome::Sent { .. }) => {
                self.ack(&delivery).await;
                self.metrics.record_success(started.elapsed());
            }
            Ok(ProcessOutcome::PermanentFailure { .. }) => {
                // Outcome already durably recorded as failed - done.
                self.ack(&delivery).await;
                self.metrics.record_failure(started.elapsed());
            }
            Err(e) => {
                self.metrics.record_failure(started.elapsed());
                let reason = redact_secrets(&e.to_string());

                if !e.is_retryable() {
                    self.dead_letter(&delivery, &reason).await;
                    return;
                }

                let envelope = RetryEnvelope::with_attempt(delivery.attempt);
                match envelope.after_failure(&self.policy) {
                    RetryDecision::Requeue { attempt, delay } => {
                        warn!(
                            job_id = %job.id,
                            attempt = attempt,
                            delay_ms = delay.as_millis() as u64,
                            error = %reason,
                            "Job failed, requeueing with backoff"
                        );
                        tokio::time::sleep(delay).await;
                        if let Err(qe) = self.queue.requeue(&delivery, attempt).await {
                            // The delivery stays pending and will be
                            // reclaimed after the visibility timeout.
                            error!(error = %qe, stream_id = %delivery.stream_id, "Requeue failed");
                            return;
                        }
                        self.metrics.record_retry();
                    }
                    RetryDecision::DeadLetter { attempt } => {
                        let reason =
                            format!("retries exhausted after {} attempts: {}", attempt, reason);
                        self.dead_letter(&delivery, &reason).await;
                    }
                }
            }
        }
    }

    async fn ack(&self, delivery: &JobDelivery) {
        if let Err(e) = self.queue.ack(delivery).await {
            error!(error = %e, stream_id = %delivery.stream_id, "Ack failed");
        }
    }

    async fn dead_letter(&self, delivery: &JobDelivery, reason: &str) {
        match self.queue.dead_letter(delivery, reason).await {
            Ok(()) => {
                self.metrics.record_dead_letter();
                AuditLogger::log_job_dead_lettered(&delivery.stream_id, delivery.attempt, reason);
            }
            Err(e) => {
                error!(error = %e, stream_id = %delivery.stream_id, "Dead-letter routing failed");
            }
        }
    }
}
