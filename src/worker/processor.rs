// ============================================================================
// Job Processor
// ============================================================================
//
// Per-job state machine, strictly ordered:
//   Received -> Validating -> Resolving-Integration -> Sending -> outcome
//
// Permanent failures (validation, configuration) are recorded as `failed`
// and absorbed here - the caller acknowledges, nothing is retried. Send
// failures are recorded first and then returned as errors so the
// queue-level retry policy decides what happens next; the processor never
// retries on its own.
//
// ============================================================================

use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::audit::AuditLogger;
use crate::error::{DispatchError, DispatchResult};
use crate::models::{DispatchJob, Integration, IntegrationStatus, MessageLogUpdate, MessageStatus};
use crate::sender::sanitize::redact_secrets;
use crate::sender::{ChannelSender, FailureKind, SendRequest};
use crate::store::StatusStore;
use crate::utils::log_safe_id;
use crate::worker::validation::{normalize_phone, validate_job};

/// Terminal result of processing one job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessOutcome {
    /// Message accepted by the channel - acknowledge the delivery.
    Sent { external_message_id: Option<String> },
    /// Unsalvageable job, already recorded as failed - acknowledge,
    /// do not retry.
    PermanentFailure { reason: String },
}

pub struct JobProcessor {
    store: Arc<dyn StatusStore>,
    sender: Arc<dyn ChannelSender>,
    default_country_code: String,
    log_hash_salt: String,
}

impl JobProcessor {
    pub fn new(
        store: Arc<dyn StatusStore>,
        sender: Arc<dyn ChannelSender>,
        default_country_code: String,
        log_hash_salt: String,
    ) -> Self {
        Self {
            store,
            sender,
            default_country_code,
            log_hash_salt,
        }
    }

    /// Run one job through validate -> resolve -> send -> record.
    ///
    /// Errors returned from here are candidates for queue-level retry;
    /// everything permanent is absorbed into `ProcessOutcome`.
    pub async fn process(&self, job: &DispatchJob) -> DispatchResult<ProcessOutcome> {
        let phone_hash = log_safe_id(&job.phone, &self.log_hash_salt);
        debug!(
            job_id = %job.id,
            phone_hash = %phone_hash,
            campaign_id = ?job.campaign_id,
            "Processing dispatch job"
        );

        // 1. Validate
        if let Err(e) = validate_job(job) {
            return self.permanent_failure(job, e).await;
        }

        // 2. Resolve integration
        let integration = match self.resolve_integration(job).await {
            Ok(integration) => integration,
            Err(e) if e.is_retryable() => return Err(e),
            Err(e) => return self.permanent_failure(job, e).await,
        };

        // 3. Normalize phone
        let phone = match normalize_phone(&job.phone, &self.default_country_code) {
            Ok(phone) => phone,
            Err(e) => return self.permanent_failure(job, e).await,
        };

        // 4. Send
        let request = SendRequest {
            integration,
            phone,
            content: job.content.clone(),
        };
        let outcome = self.sender.send(&request).await;

        if outcome.success {
            let external_id = outcome.external_message_id.clone();
            self.record_sent(job, &outcome.external_message_id, outcome.response.as_ref())
                .await?;

            info!(
                job_id = %job.id,
                phone_hash = %phone_hash,
                external_message_id = ?external_id,
                "Message sent"
            );
            AuditLogger::log_message_sent(job, external_id.as_deref());

            Ok(ProcessOutcome::Sent {
                external_message_id: external_id,
            })
        } else {
            let error_text = outcome
                .error
                .clone()
                .unwrap_or_else(|| "channel send failed".to_string());

            // Record the failure before re-throwing: the queue layer owns
            // the retry decision, the log owns the observable state.
            self.record_failed(job, &error_text).await?;

            warn!(
                job_id = %job.id,
                phone_hash = %phone_hash,
                error = %error_text,
                "Message send failed"
            );
            AuditLogger::log_message_failed(job, &error_text);

            match outcome.failure {
                Some(FailureKind::Permanent) => {
                    Err(DispatchError::PermanentChannel(error_text))
                }
                _ => Err(DispatchError::TransientChannel(error_text)),
            }
        }
    }

    /// Prefer the job's explicit integration (scoped to its company),
    /// fall back to the company's most recently created connected one.
    async fn resolve_integration(&self, job: &DispatchJob) -> DispatchResult<Integration> {
        let integration = match job.integration_id {
            Some(integration_id) => self
                .store
                .integration(integration_id, job.company_id)
                .await?
                .ok_or_else(|| {
                    DispatchError::configuration(format!(
                        "integration {} not found for company",
                        integration_id
                    ))
                })?,
            None => self
                .store
                .latest_connected_integration(job.company_id)
                .await?
                .ok_or_else(|| {
                    DispatchError::configuration("company has no connected integration")
                })?,
        };

        if integration.status != IntegrationStatus::Connected {
            return Err(DispatchError::configuration(format!(
                "integration {} is {}, expected connected",
                integration.id,
                integration.status.as_str()
            )));
        }
        Ok(integration)
    }

    /// Record an unsalvageable job as failed. Store errors propagate so
    /// the queue layer retries the whole job - the terminal outcome must
    /// be durably recorded before the delivery is acknowledged.
    async fn permanent_failure(
        &self,
        job: &DispatchJob,
        error: DispatchError,
    ) -> DispatchResult<ProcessOutcome> {
        let reason = redact_secrets(&error.to_string());
        self.record_failed(job, &reason).await?;

        warn!(
            job_id = %job.id,
            reason = %reason,
            "Job failed permanently, will not retry"
        );
        AuditLogger::log_message_failed(job, &reason);

        Ok(ProcessOutcome::PermanentFailure { reason })
    }

    async fn record_sent(
        &self,
        job: &DispatchJob,
        external_message_id: &Option<String>,
        response: Option<&serde_json::Value>,
    ) -> DispatchResult<()> {
        let snippet = response.map(|v| {
            let text = v.to_string();
            match text.char_indices().nth(512) {
                Some((idx, _)) => text[..idx].to_string(),
                None => text,
            }
        });

        self.store
            .update_message_log(
                job.message_log_id,
                MessageStatus::Sent,
                MessageLogUpdate {
                    external_message_id: external_message_id.clone(),
                    channel_response: snippet,
                    ..Default::default()
                },
            )
            .await?;

        if let (Some(campaign_id), Some(contact_id)) = (job.campaign_id, job.contact_id) {
            self.store
                .set_contact_status(campaign_id, contact_id, MessageStatus::Sent, None)
                .await?;
            self.store.recompute_campaign_aggregate(campaign_id).await?;
        }
        Ok(())
    }

    async fn record_failed(&self, job: &DispatchJob, error: &str) -> DispatchResult<()> {
        self.store
            .update_message_log(
                job.message_log_id,
                MessageStatus::Failed,
                MessageLogUpdate {
                    error: Some(error.to_string()),
                    ..Default::default()
                },
            )
            .await?;

        if let (Some(campaign_id), Some(contact_id)) = (job.campaign_id, job.contact_id) {
            self.store
                .set_contact_status(campaign_id, contact_id, MessageStatus::Failed, Some(error))
                .await?;
            self.store.recompute_campaign_aggregate(campaign_id).await?;
        }
        Ok(())
    }
}
