// ============================================================================
// WhatsApp Channel Client
// ============================================================================
//
// Speaks both wire variants behind the ChannelSender seam:
// - LegacySession: session-based gateway, probed via GET /session/status
// - CloudTemplate: cloud-hosted API, POST /v1/messages
//
// The variant is resolved once per integration and cached. Retryable
// failures (network, timeout, 5xx, 429) go through the bounded backoff
// loop; 4xx business rejections and local validation failures do not.
//
// ============================================================================

use reqwest::StatusCode;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::ChannelConfig;
use crate::models::{ChannelVariant, Integration};
use crate::sender::sanitize::{
    redact_secrets, sanitize_content, validate_instance_key, validate_phone,
};
use crate::sender::{with_channel_retry, AttemptError, ChannelSender, SendOutcome, SendRequest};

pub struct WhatsAppSender {
    client: reqwest::Client,
    config: ChannelConfig,
    /// Detected variant per integration id
    variant_cache: RwLock<HashMap<Uuid, ChannelVariant>>,
}

impl WhatsAppSender {
    pub fn new(config: ChannelConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.send_timeout_ms))
            .build()?;

        Ok(Self {
            client,
            config,
            variant_cache: RwLock::new(HashMap::new()),
        })
    }

    /// Resolve which wire variant this integration speaks.
    ///
    /// Explicit configuration wins; otherwise the cached detection is
    /// used; otherwise the instance status endpoint is probed once.
    async fn resolve_variant(
        &self,
        integration: &Integration,
    ) -> Result<ChannelVariant, AttemptError> {
        if let Some(variant) = integration.variant {
            return Ok(variant);
        }

        if let Some(cached) = self.variant_cache.read().await.get(&integration.id) {
            return Ok(*cached);
        }

        let variant = self.probe_variant(integration).await?;
        self.variant_cache
            .write()
            .await
            .insert(integration.id, variant);

        info!(
            integration_id = %integration.id,
            variant = variant.as_str(),
            "Detected channel variant for integration"
        );

        Ok(variant)
    }

    /// Probe the session-status endpoint: a session-style payload marks a
    /// legacy gateway, a 404/405 marks the cloud API.
    async fn probe_variant(
        &self,
        integration: &Integration,
    ) -> Result<ChannelVariant, AttemptError> {
        let url = format!(
            "{}/session/status/{}",
            integration.base_url.trim_end_matches('/'),
            integration.instance_key
        );

        let response = self
            .client
            .get(&url)
            .bearer_auth(&integration.api_token)
            .header("apikey", &integration.api_token)
            .send()
            .await
            .map_err(classify_reqwest_error)?;

        let status = response.status();
        if status.is_success() {
            let body: Value = response.json().await.unwrap_or(Value::Null);
            if body.get("state").is_some() || body.get("session").is_some() {
                return Ok(ChannelVariant::LegacySession);
            }
            return Ok(ChannelVariant::CloudTemplate);
        }

        match status {
            StatusCode::NOT_FOUND | StatusCode::METHOD_NOT_ALLOWED => {
                Ok(ChannelVariant::CloudTemplate)
            }
            s if s.is_server_error() || s == StatusCode::TOO_MANY_REQUESTS => Err(
                AttemptError::Retryable(format!("variant probe failed: HTTP {}", s.as_u16())),
            ),
            s => Err(AttemptError::Permanent(format!(
                "variant probe rejected: HTTP {}",
                s.as_u16()
            ))),
        }
    }

    async fn dispatch_once(
        &self,
        variant: ChannelVariant,
        request: &SendRequest,
        content: &str,
    ) -> Result<(Option<String>, Value), AttemptError> {
        let integration = &request.integration;
        let base = integration.base_url.trim_end_matches('/');

        let (url, payload) = match variant {
            ChannelVariant::LegacySession => (
                format!("{}/client/sendMessage/{}", base, integration.instance_key),
                json!({
                    "chatId": format!("{}@c.us", request.phone),
                    "contentType": "string",
                    "content": content,
                }),
            ),
            ChannelVariant::CloudTemplate => (
                format!("{}/v1/messages", base),
                json!({
                    "to": request.phone,
                    "type": "text",
                    "text": { "body": content },
                }),
            ),
        };

        let response = self
            .client
            .post(&url)
            .bearer_auth(&integration.api_token)
            .header("apikey", &integration.api_token)
            .json(&payload)
            .send()
            .await
            .map_err(classify_reqwest_error)?;

        let status = response.status();
        let body: Value = response.json().await.unwrap_or(Value::Null);

        if status.is_success() {
            let message_id = extract_message_id(variant, &body);
            return Ok((message_id, body));
        }

        let detail = format!("HTTP {}: {}", status.as_u16(), truncate_body(&body));
        if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
            Err(AttemptError::Retryable(detail))
        } else {
            Err(AttemptError::Permanent(detail))
        }
    }
}

#[async_trait::async_trait]
impl ChannelSender for WhatsAppSender {
    async fn send(&self, request: &SendRequest) -> SendOutcome {
        // Local validation failures are adapter-origin: never retried here.
        if let Err(e) = validate_instance_key(&request.integration.instance_key) {
            return SendOutcome::permanent(e.to_string());
        }
        if let Err(e) = validate_phone(&request.phone) {
            return SendOutcome::permanent(e.to_string());
        }
        let content = match sanitize_content(&request.content) {
            Ok(content) => content,
            Err(e) => return SendOutcome::permanent(e.to_string()),
        };

        let backoff = Duration::from_millis(self.config.backoff_ms);
        let result = with_channel_retry(self.config.max_attempts, backoff, |attempt| {
            let content = content.clone();
            async move {
                let variant = self.resolve_variant(&request.integration).await?;
                debug!(
                    integration_id = %request.integration.id,
                    variant = variant.as_str(),
                    attempt = attempt,
                    "Dispatching message to channel"
                );
                self.dispatch_once(variant, request, &content).await
            }
        })
        .await;

        match result {
            Ok((message_id, body)) => SendOutcome::sent(message_id, Some(body)),
            Err(AttemptError::Retryable(e)) => {
                let sanitized = redact_secrets(&e);
                warn!(
                    integration_id = %request.integration.id,
                    error = %sanitized,
                    "Channel send failed after exhausting adapter retries"
                );
                SendOutcome::transient(sanitized)
            }
            Err(AttemptError::Permanent(e)) => {
                let sanitized = redact_secrets(&e);
                warn!(
                    integration_id = %request.integration.id,
                    error = %sanitized,
                    "Channel rejected send"
                );
                SendOutcome::permanent(sanitized)
            }
        }
    }
}

fn classify_reqwest_error(err: reqwest::Error) -> AttemptError {
    // Timeouts and connection failures are transient by contract.
    AttemptError::Retryable(redact_secrets(&err.to_string()))
}

/// Pull the channel-assigned message id out of the response body.
fn extract_message_id(variant: ChannelVariant, body: &Value) -> Option<String> {
    let candidate = match variant {
        ChannelVariant::LegacySession => body
            .get("id")
            .or_else(|| body.get("key").and_then(|k| k.get("id"))),
        ChannelVariant::CloudTemplate => body
            .get("messages")
            .and_then(|m| m.get(0))
            .and_then(|m| m.get("id")),
    };
    candidate
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
}

fn truncate_body(body: &Value) -> String {
    let text = body.to_string();
    match text.char_indices().nth(256) {
        Some((idx, _)) => text[..idx].to_string(),
        None => text,
    }
}
