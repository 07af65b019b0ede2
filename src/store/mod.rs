// ============================================================================
// Status Store
// ============================================================================
//
// Persistent state behind the pipeline: the message log, per-contact
// campaign status and the campaign records themselves. Aggregate counts
// are always recomputed from the per-contact rows - at-least-once
// redelivery makes incremental counters drift.
//
// ============================================================================

pub mod postgres;

pub use postgres::PgStatusStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::DispatchResult;
use crate::models::{
    Campaign, CampaignAggregate, CampaignStatus, Contact, Integration, MessageLogEntry,
    MessageLogUpdate, MessageStatus, NewMessageLog,
};

/// Seam between the pipeline and the persistent store.
#[async_trait]
pub trait StatusStore: Send + Sync {
    // ----- campaigns -----

    async fn campaign(
        &self,
        campaign_id: Uuid,
        company_id: Uuid,
    ) -> DispatchResult<Option<Campaign>>;

    /// Compare-and-set status transition. Returns false when the campaign
    /// was no longer in one of the expected source states. Stamps
    /// `started_at` / `completed_at` on the matching target states.
    async fn transition_campaign(
        &self,
        campaign_id: Uuid,
        from: &[CampaignStatus],
        to: CampaignStatus,
    ) -> DispatchResult<bool>;

    /// Campaigns with status `scheduled` whose `scheduled_at` has passed.
    async fn due_scheduled_campaigns(&self, now: DateTime<Utc>) -> DispatchResult<Vec<Campaign>>;

    /// Full recompute of campaign counters from per-contact statuses.
    /// Flips a running campaign to completed when nothing is pending.
    async fn recompute_campaign_aggregate(
        &self,
        campaign_id: Uuid,
    ) -> DispatchResult<CampaignAggregate>;

    // ----- templates & contacts -----

    async fn template_body(&self, template_id: Uuid) -> DispatchResult<Option<String>>;

    /// Bounded page of contacts still pending for a campaign.
    async fn pending_contacts(
        &self,
        campaign_id: Uuid,
        limit: i64,
    ) -> DispatchResult<Vec<Contact>>;

    /// Update the per-contact delivery status within a campaign.
    async fn set_contact_status(
        &self,
        campaign_id: Uuid,
        contact_id: Uuid,
        status: MessageStatus,
        error: Option<&str>,
    ) -> DispatchResult<()>;

    // ----- message log -----

    async fn create_message_log(&self, entry: NewMessageLog) -> DispatchResult<Uuid>;

    async fn message_log(&self, id: Uuid) -> DispatchResult<Option<MessageLogEntry>>;

    /// Rank-monotonic status update; see [`MessageStatus::can_transition`].
    /// Stamps the matching status timestamp when not supplied. Repeating
    /// an update with the same status is a silent no-op.
    async fn update_message_log(
        &self,
        id: Uuid,
        status: MessageStatus,
        update: MessageLogUpdate,
    ) -> DispatchResult<()>;

    // ----- integrations -----

    async fn integration(
        &self,
        integration_id: Uuid,
        company_id: Uuid,
    ) -> DispatchResult<Option<Integration>>;

    /// The company's most recently created `connected` integration.
    async fn latest_connected_integration(
        &self,
        company_id: Uuid,
    ) -> DispatchResult<Option<Integration>>;

    async fn ping(&self) -> DispatchResult<()>;
}
