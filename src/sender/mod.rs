// ============================================================================
// Send Adapter
// ============================================================================
//
// Outbound call to the external messaging channel:
// - sanitize.rs - input validation and secret redaction
// - whatsapp.rs - HTTP client for both channel variants
// - circuit.rs  - circuit breaker wrapping any ChannelSender
//
// The adapter never errors past its own retry wrapper: every outcome,
// including exhausted retries, is normalized into SendOutcome.
//
// ============================================================================

pub mod circuit;
pub mod sanitize;
pub mod whatsapp;

pub use circuit::CircuitBreaker;
pub use whatsapp::WhatsAppSender;

use async_trait::async_trait;
use serde_json::Value;
use std::future::Future;
use std::time::Duration;
use tracing::warn;

use crate::models::Integration;

/// One outbound send, already validated and phone-normalized by the worker.
#[derive(Debug, Clone)]
pub struct SendRequest {
    pub integration: Integration,
    pub phone: String,
    pub content: String,
}

/// How a failed send should be treated upstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Network error, timeout, HTTP 5xx or 429 - worth retrying later
    Transient,
    /// Input rejected or 4xx business error - retrying cannot succeed
    Permanent,
}

/// Uniform result of a send attempt.
#[derive(Debug, Clone)]
pub struct SendOutcome {
    pub success: bool,
    pub external_message_id: Option<String>,
    /// Raw response snippet kept for the message log
    pub response: Option<Value>,
    /// Sanitized error text (secrets redacted)
    pub error: Option<String>,
    pub failure: Option<FailureKind>,
}

impl SendOutcome {
    pub fn sent(external_message_id: Option<String>, response: Option<Value>) -> Self {
        Self {
            success: true,
            external_message_id,
            response,
            error: None,
            failure: None,
        }
    }

    pub fn transient(error: impl Into<String>) -> Self {
        Self {
            success: false,
            external_message_id: None,
            response: None,
            error: Some(error.into()),
            failure: Some(FailureKind::Transient),
        }
    }

    pub fn permanent(error: impl Into<String>) -> Self {
        Self {
            success: false,
            external_message_id: None,
            response: None,
            error: Some(error.into()),
            failure: Some(FailureKind::Permanent),
        }
    }
}

/// Seam between the worker and the concrete channel client.
#[async_trait]
pub trait ChannelSender: Send + Sync {
    async fn send(&self, request: &SendRequest) -> SendOutcome;
}

/// Error classification used inside the adapter retry loop.
#[derive(Debug, Clone)]
pub(crate) enum AttemptError {
    Retryable(String),
    Permanent(String),
}

/// Run `op` up to `max_attempts` times with exponential backoff between
/// retryable failures. Permanent failures short-circuit immediately;
/// no backoff wait follows the final attempt.
pub(crate) async fn with_channel_retry<T, F, Fut>(
    max_attempts: u32,
    base_backoff: Duration,
    mut op: F,
) -> Result<T, AttemptError>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, AttemptError>>,
{
    let mut attempt = 0;
    loop {
        attempt += 1;
        match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(AttemptError::Permanent(e)) => return Err(AttemptError::Permanent(e)),
            Err(AttemptError::Retryable(e)) => {
                if attempt >= max_attempts {
                    return Err(AttemptError::Retryable(e));
                }
                let backoff = base_backoff * 2u32.saturating_pow(attempt - 1);
                warn!(
                    attempt = attempt,
                    max_attempts = max_attempts,
                    backoff_ms = backoff.as_millis() as u64,
                    error = %e,
                    "Channel send failed, backing off before retry"
                );
                tokio::time::sleep(backoff).await;
            }
        }
    }
}
