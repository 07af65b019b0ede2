// ============================================================================
// Core Data Model
// ============================================================================
//
// Domain types shared by the dispatcher, the queue and the worker:
// - Campaign / CampaignStatus - bulk send over a contact set
// - MessageLogEntry / MessageStatus - persistent per-message delivery log
// - Integration / IntegrationStatus - credentials for an external channel
// - DispatchJob - one outbound attempt, lives only on the queue
//
// ============================================================================

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Campaign lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CampaignStatus {
    Draft,
    Scheduled,
    Running,
    Paused,
    Completed,
    Cancelled,
}

impl CampaignStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CampaignStatus::Draft => "draft",
            CampaignStatus::Scheduled => "scheduled",
            CampaignStatus::Running => "running",
            CampaignStatus::Paused => "paused",
            CampaignStatus::Completed => "completed",
            CampaignStatus::Cancelled => "cancelled",
        }
    }
}

impl FromStr for CampaignStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "draft" => Ok(CampaignStatus::Draft),
            "scheduled" => Ok(CampaignStatus::Scheduled),
            "running" => Ok(CampaignStatus::Running),
            "paused" => Ok(CampaignStatus::Paused),
            "completed" => Ok(CampaignStatus::Completed),
            "cancelled" => Ok(CampaignStatus::Cancelled),
            other => Err(format!("unknown campaign status: {}", other)),
        }
    }
}

impl fmt::Display for CampaignStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A bulk send over a contact set using one rendered template
#[derive(Debug, Clone)]
pub struct Campaign {
    pub id: Uuid,
    pub company_id: Uuid,
    pub template_id: Option<Uuid>,
    pub status: CampaignStatus,
    pub total_contacts: i64,
    pub sent_count: i64,
    pub delivered_count: i64,
    pub failed_count: i64,
    /// Placeholder values merged into the template at fan-out time
    pub variables: HashMap<String, String>,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// Per-message delivery status
///
/// Rank order: pending < sent < delivered < read. `failed` is terminal and
/// reachable from any non-terminal state. See [`MessageStatus::can_transition`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    Pending,
    Sent,
    Delivered,
    Read,
    Failed,
}

impl MessageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageStatus::Pending => "pending",
            MessageStatus::Sent => "sent",
            MessageStatus::Delivered => "delivered",
            MessageStatus::Read => "read",
            MessageStatus::Failed => "failed",
        }
    }

    /// Rank used for monotonicity checks. `failed` has no rank.
    fn rank(&self) -> Option<u8> {
        match self {
            MessageStatus::Pending => Some(0),
            MessageStatus::Sent => Some(1),
            MessageStatus::Delivered => Some(2),
            MessageStatus::Read => Some(3),
            MessageStatus::Failed => None,
        }
    }

    /// Whether a stored entry may move from `self` to `to`.
    ///
    /// Updates arrive from two writers (the worker writes `sent`/`failed`,
    /// the receipt webhook writes `delivered`/`read`) with no ordering
    /// guarantee, so only strictly forward transitions are applied:
    /// - same status twice is a no-op (idempotent redelivery)
    /// - `failed` is reachable from any non-failed state
    /// - a successful requeued send supersedes an earlier `failed` with `sent`
    /// - otherwise the rank must strictly increase
    pub fn can_transition(&self, to: MessageStatus) -> bool {
        if *self == to {
            return false;
        }
        match (self, to) {
            (MessageStatus::Failed, MessageStatus::Sent) => true,
            (MessageStatus::Failed, _) => false,
            (_, MessageStatus::Failed) => true,
            (from, to) => match (from.rank(), to.rank()) {
                (Some(a), Some(b)) => b > a,
                _ => false,
            },
        }
    }
}

impl FromStr for MessageStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(MessageStatus::Pending),
            "sent" => Ok(MessageStatus::Sent),
            "delivered" => Ok(MessageStatus::Delivered),
            "read" => Ok(MessageStatus::Read),
            "failed" => Ok(MessageStatus::Failed),
            other => Err(format!("unknown message status: {}", other)),
        }
    }
}

impl fmt::Display for MessageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One row of the persistent message log
#[derive(Debug, Clone)]
pub struct MessageLogEntry {
    pub id: Uuid,
    pub company_id: Uuid,
    pub campaign_id: Option<Uuid>,
    pub contact_id: Option<Uuid>,
    pub phone: String,
    pub content: String,
    pub status: MessageStatus,
    pub external_message_id: Option<String>,
    /// Truncated raw channel response kept for troubleshooting
    pub channel_response: Option<String>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub sent_at: Option<DateTime<Utc>>,
    pub delivered_at: Option<DateTime<Utc>>,
    pub read_at: Option<DateTime<Utc>>,
    pub failed_at: Option<DateTime<Utc>>,
}

/// Fields for creating a new (pending) message log entry
#[derive(Debug, Clone)]
pub struct NewMessageLog {
    pub company_id: Uuid,
    pub campaign_id: Option<Uuid>,
    pub contact_id: Option<Uuid>,
    pub phone: String,
    pub content: String,
}

/// Fields applied together with a status update.
///
/// The matching status timestamp (sent_at/delivered_at/read_at/failed_at)
/// is stamped by the store when not supplied here.
#[derive(Debug, Clone, Default)]
pub struct MessageLogUpdate {
    pub external_message_id: Option<String>,
    pub channel_response: Option<String>,
    pub error: Option<String>,
    pub status_at: Option<DateTime<Utc>>,
}

/// Integration connection status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntegrationStatus {
    Disconnected,
    Connecting,
    Connected,
    Error,
}

impl IntegrationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            IntegrationStatus::Disconnected => "disconnected",
            IntegrationStatus::Connecting => "connecting",
            IntegrationStatus::Connected => "connected",
            IntegrationStatus::Error => "error",
        }
    }
}

impl FromStr for IntegrationStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "disconnected" => Ok(IntegrationStatus::Disconnected),
            "connecting" => Ok(IntegrationStatus::Connecting),
            "connected" => Ok(IntegrationStatus::Connected),
            "error" => Ok(IntegrationStatus::Error),
            other => Err(format!("unknown integration status: {}", other)),
        }
    }
}

/// Which wire protocol an integration speaks.
///
/// `None` on the integration record means "unknown" - the send adapter
/// probes the instance once and caches the detected variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelVariant {
    /// Session-based gateway: POST /client/sendMessage/{instance}
    LegacySession,
    /// Cloud-hosted template API: POST /v1/messages
    CloudTemplate,
}

impl ChannelVariant {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChannelVariant::LegacySession => "legacy_session",
            ChannelVariant::CloudTemplate => "cloud_template",
        }
    }
}

impl FromStr for ChannelVariant {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "legacy_session" => Ok(ChannelVariant::LegacySession),
            "cloud_template" => Ok(ChannelVariant::CloudTemplate),
            other => Err(format!("unknown channel variant: {}", other)),
        }
    }
}

/// A configured credential/connection to the external messaging channel
#[derive(Debug, Clone)]
pub struct Integration {
    pub id: Uuid,
    pub company_id: Uuid,
    pub status: IntegrationStatus,
    pub variant: Option<ChannelVariant>,
    pub base_url: String,
    pub instance_key: String,
    pub api_token: String,
    pub created_at: DateTime<Utc>,
}

/// A contact eligible for dispatch within a campaign
#[derive(Debug, Clone)]
pub struct Contact {
    pub id: Uuid,
    pub company_id: Uuid,
    pub name: String,
    pub phone: String,
}

/// One outbound message attempt for one recipient.
///
/// Ephemeral: serialized onto the queue, never persisted as a row. The
/// attempt count travels as stream-entry metadata, not in this payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchJob {
    pub id: Uuid,
    pub company_id: Uuid,
    pub campaign_id: Option<Uuid>,
    pub contact_id: Option<Uuid>,
    /// Log entry created as `pending` before this job was published
    pub message_log_id: Uuid,
    pub phone: String,
    pub content: String,
    pub integration_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
}

impl DispatchJob {
    pub fn encode(&self) -> Result<Vec<u8>, rmp_serde::encode::Error> {
        rmp_serde::encode::to_vec_named(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, rmp_serde::decode::Error> {
        rmp_serde::decode::from_slice(bytes)
    }
}

/// Recomputed per-campaign counters (full scan, never incremental)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CampaignAggregate {
    pub total: i64,
    pub pending: i64,
    pub sent: i64,
    pub delivered: i64,
    pub failed: i64,
}

impl CampaignAggregate {
    /// Aggregate a scan of per-contact statuses. `sent` counts every
    /// contact that progressed at least to sent, so
    /// `delivered <= sent` and `sent + failed <= total` hold by
    /// construction.
    pub fn from_statuses<I>(statuses: I) -> Self
    where
        I: IntoIterator<Item = MessageStatus>,
    {
        let mut aggregate = CampaignAggregate {
            total: 0,
            pending: 0,
            sent: 0,
            delivered: 0,
            failed: 0,
        };
        for status in statuses {
            aggregate.total += 1;
            match status {
                MessageStatus::Pending => aggregate.pending += 1,
                MessageStatus::Sent => aggregate.sent += 1,
                MessageStatus::Delivered | MessageStatus::Read => {
                    aggregate.sent += 1;
                    aggregate.delivered += 1;
                }
                MessageStatus::Failed => aggregate.failed += 1,
            }
        }
        aggregate
    }
}

/// Result of a campaign fan-out
#[derive(Debug, Clone, Serialize)]
pub struct DispatchSummary {
    pub campaign_id: Uuid,
    pub jobs_created: i64,
    pub total_contacts: i64,
    /// Rough completion estimate given the worker pacing
    pub eta_seconds: u64,
}

/// Result of a single ad-hoc send
#[derive(Debug, Clone, Serialize)]
pub struct SingleSendReceipt {
    pub message_log_id: Uuid,
    pub job_created: bool,
}

/// Variables for template rendering: campaign variables merged with the
/// contact's own fields (contact fields win).
pub fn render_variables(campaign: &Campaign, contact: &Contact) -> HashMap<String, String> {
    let mut vars = campaign.variables.clone();
    vars.insert("name".to_string(), contact.name.clone());
    vars.insert("phone".to_string(), contact.phone.clone());
    vars
}

/// Parse the JSONB variables column into a flat string map; non-string
/// values are rendered with their JSON representation.
pub fn variables_from_json(value: &Value) -> HashMap<String, String> {
    match value {
        Value::Object(map) => map
            .iter()
            .map(|(k, v)| {
                let rendered = match v {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                (k.clone(), rendered)
            })
            .collect(),
        _ => HashMap::new(),
    }
}
