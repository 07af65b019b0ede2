// ============================================================================
// Durable Job Queue
// ============================================================================
//
// At-least-once queue contract for dispatch jobs: one primary queue plus
// one dead-letter queue. The serialized job is the payload; the attempt
// count travels as message metadata. A delivery leaves the primary queue
// only when acknowledged - after success, after a permanent failure was
// recorded, or after an explicit requeue with an incremented attempt count.
//
// ============================================================================

pub mod dlq;
pub mod redis;

pub use dlq::DeadLetterEntry;
pub use redis::RedisJobQueue;

use async_trait::async_trait;
use std::time::Duration;

use crate::error::DispatchResult;

/// One message handed to a consumer, pending acknowledgement.
#[derive(Debug, Clone)]
pub struct JobDelivery {
    /// Broker-assigned entry id
    pub stream_id: String,
    /// Serialized DispatchJob (opaque to the queue)
    pub payload: Vec<u8>,
    /// Failed processing attempts so far (0 for a fresh job)
    pub attempt: u32,
}

/// Seam between the pipeline and the broker.
#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Publish a payload with the given attempt metadata. Returns the
    /// broker-assigned entry id.
    async fn publish(&self, payload: &[u8], attempt: u32) -> DispatchResult<String>;

    /// Fetch up to `max` deliveries, blocking up to `block` when the
    /// queue is empty. The broker may hand out several unacknowledged
    /// deliveries concurrently - this is the prefetch bound.
    async fn fetch(&self, max: usize, block: Duration) -> DispatchResult<Vec<JobDelivery>>;

    /// Acknowledge a delivery - removes it from the primary queue.
    async fn ack(&self, delivery: &JobDelivery) -> DispatchResult<()>;

    /// Republish the payload under an incremented attempt count, then
    /// acknowledge the original delivery. The job continues life as a
    /// new message rather than an immediate redelivery.
    async fn requeue(&self, delivery: &JobDelivery, attempt: u32) -> DispatchResult<()>;

    /// Route a delivery to the dead-letter queue and acknowledge it.
    async fn dead_letter(&self, delivery: &JobDelivery, reason: &str) -> DispatchResult<()>;

    /// Reclaim deliveries stuck pending on a dead consumer.
    async fn claim_stale(&self) -> DispatchResult<Vec<JobDelivery>>;

    /// Broker-reported backlog of the primary queue.
    async fn depth(&self) -> DispatchResult<u64>;

    /// Active consumers on the primary queue's group.
    async fn consumer_count(&self) -> DispatchResult<u64>;

    async fn ping(&self) -> DispatchResult<()>;
}
