// ============================================================================
// Audit Logging
// ============================================================================
//
// Append-only structured records for message and campaign lifecycle
// events, emitted under the `audit` tracing target so log aggregation can
// index them separately. Phone numbers are never written raw - only the
// message log id and job id identify the recipient.
//
// ============================================================================

use chrono::Utc;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::DispatchJob;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuditEventType {
    MessageSent,
    MessageFailed,
    JobDeadLettered,
    CampaignEvent,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    pub timestamp: String,
    pub event_type: AuditEventType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub company_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub campaign_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message_log_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub external_message_id: Option<String>,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl AuditEvent {
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string())
    }
}

/// Stateless writer for audit records.
pub struct AuditLogger;

impl AuditLogger {
    pub fn log_message_sent(job: &DispatchJob, external_message_id: Option<&str>) {
        Self::log_event(&AuditEvent {
            timestamp: Utc::now().to_rfc3339(),
            event_type: AuditEventType::MessageSent,
            company_id: Some(job.company_id),
            campaign_id: job.campaign_id,
            message_log_id: Some(job.message_log_id),
            external_message_id: external_message_id.map(|s| s.to_string()),
            success: true,
            details: None,
        });
    }

    pub fn log_message_failed(job: &DispatchJob, error: &str) {
        Self::log_event(&AuditEvent {
            timestamp: Utc::now().to_rfc3339(),
            event_type: AuditEventType::MessageFailed,
            company_id: Some(job.company_id),
            campaign_id: job.campaign_id,
            message_log_id: Some(job.message_log_id),
            external_message_id: None,
            success: false,
            details: Some(error.to_string()),
        });
    }

    pub fn log_job_dead_lettered(stream_id: &str, attempt: u32, reason: &str) {
        Self::log_event(&AuditEvent {
            timestamp: Utc::now().to_rfc3339(),
            event_type: AuditEventType::JobDeadLettered,
            company_id: None,
            campaign_id: None,
            message_log_id: None,
            external_message_id: None,
            success: false,
            details: Some(format!(
                "delivery {} dead-lettered after {} attempts: {}",
                stream_id, attempt, reason
            )),
        });
    }

    pub fn log_campaign_event(
        campaign_id: Uuid,
        company_id: Uuid,
        event: &str,
        details: Option<String>,
    ) {
        Self::log_event(&AuditEvent {
            timestamp: Utc::now().to_rfc3339(),
            event_type: AuditEventType::CampaignEvent,
            company_id: Some(company_id),
            campaign_id: Some(campaign_id),
            message_log_id: None,
            external_message_id: None,
            success: true,
            details: Some(details.map_or_else(|| event.to_string(), |d| format!("{}: {}", event, d))),
        });
    }

    fn log_event(event: &AuditEvent) {
        tracing::info!(
            target: "audit",
            event_type = ?event.event_type,
            company_id = ?event.company_id,
            campaign_id = ?event.campaign_id,
            message_log_id = ?event.message_log_id,
            success = event.success,
            json = %event.to_json(),
            "Audit event"
        );
    }
}
