// ============================================================================
// Redis Streams Job Queue
// ============================================================================
//
// Primary queue and DLQ are Redis streams. Consumers share one consumer
// group; a delivery stays in the group's pending list until XACK, which
// gives the at-least-once guarantee. XAUTOCLAIM recovers deliveries whose
// consumer died mid-flight.
//
// Entry layout: job=<msgpack payload> attempt=<count>. The attempt count
// is metadata on the stream entry, never part of the payload.
//
// ============================================================================

use async_trait::async_trait;
use redis::streams::{
    StreamAutoClaimOptions, StreamAutoClaimReply, StreamId, StreamReadOptions, StreamReadReply,
};
use redis::{cmd, AsyncCommands};
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::QueueConfig;
use crate::error::{DispatchError, DispatchResult};
use crate::queue::{DeadLetterEntry, JobDelivery, JobQueue};

const OP_MAX_ATTEMPTS: u32 = 3;
const OP_BACKOFF_MS: u64 = 100;

pub struct RedisJobQueue {
    /// Connection for publishes, acks and introspection
    conn: redis::aio::ConnectionManager,
    /// Dedicated connection for blocking reads, so a parked XREADGROUP
    /// cannot stall acks or health probes
    blocking_conn: redis::aio::ConnectionManager,
    cfg: QueueConfig,
    consumer_name: String,
}

impl RedisJobQueue {
    pub async fn connect(redis_url: &str, cfg: QueueConfig) -> DispatchResult<Self> {
        let client = redis::Client::open(redis_url)
            .map_err(|e| DispatchError::Queue(format!("invalid redis url: {}", e)))?;

        let conn = client.get_connection_manager().await?;
        let blocking_conn = client.get_connection_manager().await?;

        let queue = Self {
            conn,
            blocking_conn,
            cfg,
            consumer_name: format!("worker-{}", Uuid::new_v4()),
        };
        queue.ensure_group().await?;

        info!(
            stream = %queue.cfg.stream,
            group = %queue.cfg.group,
            consumer = %queue.consumer_name,
            "Job queue ready"
        );

        Ok(queue)
    }

    /// Create the consumer group (and the stream itself) if missing.
    async fn ensure_group(&self) -> DispatchResult<()> {
        let mut conn = self.conn.clone();
        let result: Result<String, redis::RedisError> = cmd("XGROUP")
            .arg("CREATE")
            .arg(&self.cfg.stream)
            .arg(&self.cfg.group)
            .arg("$")
            .arg("MKSTREAM")
            .query_async(&mut conn)
            .await;

        match result {
            Ok(_) => Ok(()),
            Err(e) if e.to_string().contains("BUSYGROUP") => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Execute a Redis operation with bounded retry and backoff.
    /// The connection manager reconnects on its own; the retry covers the
    /// window where the broker is briefly unreachable.
    async fn with_retry<T, F>(&self, operation_name: &str, mut operation: F) -> DispatchResult<T>
    where
        F: FnMut(
            redis::aio::ConnectionManager,
        )
            -> Pin<Box<dyn Future<Output = Result<T, redis::RedisError>> + Send>>,
    {
        for attempt in 1..=OP_MAX_ATTEMPTS {
            match operation(self.conn.clone()).await {
                Ok(result) => {
                    if attempt > 1 {
                        info!(
                            operation = operation_name,
                            attempt = attempt,
                            "Queue operation succeeded after retry"
                        );
                    }
                    return Ok(result);
                }
                Err(e) => {
                    if attempt == OP_MAX_ATTEMPTS {
                        return Err(DispatchError::Queue(format!(
                            "{} failed after {} attempts: {}",
                            operation_name, OP_MAX_ATTEMPTS, e
                        )));
                    }
                    let backoff_ms = OP_BACKOFF_MS * 2u64.pow(attempt - 1);
                    warn!(
                        operation = operation_name,
                        attempt = attempt,
                        error = %e,
                        "Queue operation failed, will retry"
                    );
                    tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
                }
            }
        }
        unreachable!()
    }

    async fn xadd(&self, stream: &str, payload: &[u8], attempt: u32) -> DispatchResult<String> {
        let max_len = self.cfg.max_len;
        let stream = stream.to_string();
        let payload = payload.to_vec();

        self.with_retry("xadd", move |mut conn| {
            let stream = stream.clone();
            let payload = payload.clone();
            Box::pin(async move {
                cmd("XADD")
                    .arg(&stream)
                    .arg("MAXLEN")
                    .arg("~")
                    .arg(max_len as i64)
                    .arg("*")
                    .arg("job")
                    .arg(&payload)
                    .arg("attempt")
                    .arg(attempt)
                    .query_async(&mut conn)
                    .await
            })
        })
        .await
    }

    async fn ack_and_delete(&self, stream_id: &str) -> DispatchResult<()> {
        let stream = self.cfg.stream.clone();
        let group = self.cfg.group.clone();
        let id = stream_id.to_string();

        self.with_retry("xack", move |mut conn| {
            let stream = stream.clone();
            let group = group.clone();
            let id = id.clone();
            Box::pin(async move {
                let mut pipe = redis::pipe();
                pipe.cmd("XACK").arg(&stream).arg(&group).arg(&id);
                pipe.cmd("XDEL").arg(&stream).arg(&id);
                let _: (i64, i64) = pipe.query_async(&mut conn).await?;
                Ok(())
            })
        })
        .await
    }

    fn delivery_from_entry(entry: &StreamId) -> Option<JobDelivery> {
        let payload: Vec<u8> = entry.get("job")?;
        let attempt: u32 = entry.get("attempt").unwrap_or(0);
        Some(JobDelivery {
            stream_id: entry.id.clone(),
            payload,
            attempt,
        })
    }
}

#[async_trait]
impl JobQueue for RedisJobQueue {
    async fn publish(&self, payload: &[u8], attempt: u32) -> DispatchResult<String> {
        let id = self.xadd(&self.cfg.stream, payload, attempt).await?;
        debug!(stream_id = %id, attempt = attempt, "Published dispatch job");
        Ok(id)
    }

    async fn fetch(&self, max: usize, block: Duration) -> DispatchResult<Vec<JobDelivery>> {
        // Blocking read runs on its own connection, outside the retry
        // helper - an empty read is the normal idle case, not a failure.
        let opts = StreamReadOptions::default()
            .group(&self.cfg.group, &self.consumer_name)
            .count(max)
            .block(block.as_millis() as usize);

        let mut conn = self.blocking_conn.clone();
        let reply: StreamReadReply = conn
            .xread_options(&[&self.cfg.stream], &[">"], &opts)
            .await?;

        let mut deliveries = Vec::new();
        for key in reply.keys {
            for entry in key.ids {
                match Self::delivery_from_entry(&entry) {
                    Some(delivery) => deliveries.push(delivery),
                    None => {
                        // Entry without a job field cannot be processed;
                        // drop it from the pending list.
                        warn!(stream_id = %entry.id, "Discarding malformed stream entry");
                        self.ack_and_delete(&entry.id).await?;
                    }
                }
            }
        }
        Ok(deliveries)
    }

    async fn ack(&self, delivery: &JobDelivery) -> DispatchResult<()> {
        self.ack_and_delete(&delivery.stream_id).await
    }

    async fn requeue(&self, delivery: &JobDelivery, attempt: u32) -> DispatchResult<()> {
        let id = self.xadd(&self.cfg.stream, &delivery.payload, attempt).await?;
        self.ack_and_delete(&delivery.stream_id).await?;
        debug!(
            old_stream_id = %delivery.stream_id,
            new_stream_id = %id,
            attempt = attempt,
            "Requeued job with incremented attempt count"
        );
        Ok(())
    }

    async fn dead_letter(&self, delivery: &JobDelivery, reason: &str) -> DispatchResult<()> {
        let entry = DeadLetterEntry::new(delivery.payload.clone(), delivery.attempt, reason);
        let encoded = rmp_serde::encode::to_vec_named(&entry)?;

        let id = self.xadd(&self.cfg.dlq_stream, &encoded, delivery.attempt).await?;
        self.ack_and_delete(&delivery.stream_id).await?;

        warn!(
            stream_id = %delivery.stream_id,
            dlq_id = %id,
            attempt = delivery.attempt,
            reason = reason,
            "Job dead-lettered"
        );
        Ok(())
    }

    async fn claim_stale(&self) -> DispatchResult<Vec<JobDelivery>> {
        let min_idle = self.cfg.visibility_timeout_ms;
        let stream = self.cfg.stream.clone();
        let group = self.cfg.group.clone();
        let consumer = self.consumer_name.clone();

        let reply: StreamAutoClaimReply = self
            .with_retry("xautoclaim", move |mut conn| {
                let stream = stream.clone();
                let group = group.clone();
                let consumer = consumer.clone();
                Box::pin(async move {
                    conn.xautoclaim_options(
                        &stream,
                        &group,
                        &consumer,
                        min_idle as usize,
                        "0-0",
                        StreamAutoClaimOptions::default().count(100),
                    )
                    .await
                })
            })
            .await?;

        let deliveries: Vec<JobDelivery> = reply
            .claimed
            .iter()
            .filter_map(Self::delivery_from_entry)
            .collect();

        if !deliveries.is_empty() {
            info!(
                claimed = deliveries.len(),
                "Reclaimed stale deliveries from dead consumers"
            );
        }
        Ok(deliveries)
    }

    async fn depth(&self) -> DispatchResult<u64> {
        let stream = self.cfg.stream.clone();
        self.with_retry("xlen", move |mut conn| {
            let stream = stream.clone();
            Box::pin(async move { cmd("XLEN").arg(&stream).query_async(&mut conn).await })
        })
        .await
    }

    async fn consumer_count(&self) -> DispatchResult<u64> {
        let stream = self.cfg.stream.clone();
        let groups: Vec<std::collections::HashMap<String, redis::Value>> = self
            .with_retry("xinfo_groups", move |mut conn| {
                let stream = stream.clone();
                Box::pin(async move {
                    cmd("XINFO")
                        .arg("GROUPS")
                        .arg(&stream)
                        .query_async(&mut conn)
                        .await
                })
            })
            .await?;

        for group in groups {
            let name: Option<String> = group
                .get("name")
                .and_then(|v| redis::from_redis_value(v).ok());
            if name.as_deref() == Some(self.cfg.group.as_str()) {
                let consumers: Option<u64> = group
                    .get("consumers")
                    .and_then(|v| redis::from_redis_value(v).ok());
                return Ok(consumers.unwrap_or(0));
            }
        }
        Ok(0)
    }

    async fn ping(&self) -> DispatchResult<()> {
        self.with_retry("ping", move |mut conn| {
            Box::pin(async move {
                let _: () = cmd("PING").query_async(&mut conn).await?;
                Ok(())
            })
        })
        .await
    }
}
