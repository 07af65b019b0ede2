use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde_json::json;
use thiserror::Error;

pub type DispatchResult<T> = Result<T, DispatchError>;

/// Error taxonomy of the dispatch pipeline.
///
/// Every variant is tagged retryable or permanent at origin so the
/// queue-level retry policy never burns its budget on an error that
/// cannot succeed on redelivery.
#[derive(Error, Debug)]
pub enum DispatchError {
    /// Malformed job input (missing fields, oversized content, bad phone).
    /// Permanent - recorded as `failed`, never retried.
    #[error("validation error: {0}")]
    Validation(String),

    /// Integration missing or not connected. Permanent - a configuration
    /// problem, not a transient fault.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Network failure, timeout, HTTP 5xx or 429 from the channel.
    /// Retried with backoff up to the policy bound, then dead-lettered.
    #[error("transient channel error: {0}")]
    TransientChannel(String),

    /// Structured 4xx business rejection from the channel. Never retried.
    #[error("permanent channel error: {0}")]
    PermanentChannel(String),

    /// Corrupt queue payload. Bypasses retry counting entirely - routed
    /// straight to the dead-letter queue.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Store write failure while recording a job outcome. The terminal
    /// outcome was not durably recorded, so the whole job is retried.
    #[error("persistence error: {0}")]
    Persistence(String),

    /// Broker operation failure (publish, ack, fetch).
    #[error("queue error: {0}")]
    Queue(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid transition: campaign is {from}, cannot move to {to}")]
    InvalidTransition { from: String, to: String },
}

impl DispatchError {
    /// Whether the queue-level policy should retry this error.
    ///
    /// Permanent errors dead-letter immediately; `Serialization` is also
    /// non-retryable but is handled before the processor runs.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            DispatchError::TransientChannel(_)
                | DispatchError::Persistence(_)
                | DispatchError::Queue(_)
        )
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            DispatchError::Validation(_) => StatusCode::BAD_REQUEST,
            DispatchError::NotFound(_) => StatusCode::NOT_FOUND,
            DispatchError::InvalidTransition { .. } => StatusCode::CONFLICT,
            DispatchError::Configuration(_) => StatusCode::UNPROCESSABLE_ENTITY,
            DispatchError::PermanentChannel(_) | DispatchError::TransientChannel(_) => {
                StatusCode::BAD_GATEWAY
            }
            DispatchError::Serialization(_)
            | DispatchError::Persistence(_)
            | DispatchError::Queue(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn error_code(&self) -> &'static str {
        match self {
            DispatchError::Validation(_) => "VALIDATION_ERROR",
            DispatchError::Configuration(_) => "CONFIGURATION_ERROR",
            DispatchError::TransientChannel(_) => "TRANSIENT_CHANNEL_ERROR",
            DispatchError::PermanentChannel(_) => "PERMANENT_CHANNEL_ERROR",
            DispatchError::Serialization(_) => "SERIALIZATION_ERROR",
            DispatchError::Persistence(_) => "PERSISTENCE_ERROR",
            DispatchError::Queue(_) => "QUEUE_ERROR",
            DispatchError::NotFound(_) => "NOT_FOUND",
            DispatchError::InvalidTransition { .. } => "INVALID_TRANSITION",
        }
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        DispatchError::Validation(msg.into())
    }

    pub fn configuration(msg: impl Into<String>) -> Self {
        DispatchError::Configuration(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        DispatchError::NotFound(msg.into())
    }

    fn log(&self) {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!(
                error = %self,
                error_code = %self.error_code(),
                "Dispatch error"
            );
        } else {
            tracing::debug!(
                error = %self,
                error_code = %self.error_code(),
                "Dispatch rejected"
            );
        }
    }
}

impl IntoResponse for DispatchError {
    fn into_response(self) -> axum::response::Response {
        self.log();

        let status = self.status_code();
        let body = if status.is_server_error() {
            // Internal detail stays in the logs
            json!({
                "error": "Internal server error",
                "error_code": self.error_code(),
                "status": status.as_u16(),
            })
        } else {
            json!({
                "error": self.to_string(),
                "error_code": self.error_code(),
                "status": status.as_u16(),
            })
        };

        (status, axum::Json(body)).into_response()
    }
}

// ============================================================================
// Conversion from common error types
// ============================================================================

impl From<sqlx::Error> for DispatchError {
    fn from(err: sqlx::Error) -> Self {
        DispatchError::Persistence(err.to_string())
    }
}

impl From<redis::RedisError> for DispatchError {
    fn from(err: redis::RedisError) -> Self {
        DispatchError::Queue(err.to_string())
    }
}

impl From<rmp_serde::encode::Error> for DispatchError {
    fn from(err: rmp_serde::encode::Error) -> Self {
        DispatchError::Serialization(err.to_string())
    }
}

impl From<rmp_serde::decode::Error> for DispatchError {
    fn from(err: rmp_serde::decode::Error) -> Self {
        DispatchError::Serialization(err.to_string())
    }
}

impl From<serde_json::Error> for DispatchError {
    fn from(err: serde_json::Error) -> Self {
        DispatchError::Serialization(err.to_string())
    }
}
