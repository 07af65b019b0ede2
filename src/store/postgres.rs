// ============================================================================
// Postgres Status Store
// ============================================================================

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::{Pool, Postgres, Row};
use std::str::FromStr;
use std::time::Duration;
use tracing::debug;
use uuid::Uuid;

use crate::config::DbConfig;
use crate::error::{DispatchError, DispatchResult};
use crate::models::{
    variables_from_json, Campaign, CampaignAggregate, CampaignStatus, ChannelVariant, Contact,
    Integration, IntegrationStatus, MessageLogEntry, MessageLogUpdate, MessageStatus,
    NewMessageLog,
};
use crate::store::StatusStore;

pub type DbPool = Pool<Postgres>;

pub async fn create_pool(database_url: &str, cfg: &DbConfig) -> anyhow::Result<DbPool> {
    let pool = PgPoolOptions::new()
        .max_connections(cfg.max_connections)
        .acquire_timeout(Duration::from_secs(cfg.acquire_timeout_secs))
        .connect(database_url)
        .await?;
    Ok(pool)
}

pub struct PgStatusStore {
    pool: DbPool,
}

impl PgStatusStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

// ----------------------------------------------------------------------------
// Row types
// ----------------------------------------------------------------------------

#[derive(sqlx::FromRow)]
struct CampaignRow {
    id: Uuid,
    company_id: Uuid,
    template_id: Option<Uuid>,
    status: String,
    total_contacts: i64,
    sent_count: i64,
    delivered_count: i64,
    failed_count: i64,
    variables: serde_json::Value,
    scheduled_at: Option<DateTime<Utc>>,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
}

impl TryFrom<CampaignRow> for Campaign {
    type Error = DispatchError;

    fn try_from(row: CampaignRow) -> Result<Self, Self::Error> {
        let status = CampaignStatus::from_str(&row.status)
            .map_err(DispatchError::Persistence)?;
        Ok(Campaign {
            id: row.id,
            company_id: row.company_id,
            template_id: row.template_id,
            status,
            total_contacts: row.total_contacts,
            sent_count: row.sent_count,
            delivered_count: row.delivered_count,
            failed_count: row.failed_count,
            variables: variables_from_json(&row.variables),
            scheduled_at: row.scheduled_at,
            started_at: row.started_at,
            completed_at: row.completed_at,
            created_at: row.created_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct IntegrationRow {
    id: Uuid,
    company_id: Uuid,
    status: String,
    variant: Option<String>,
    base_url: String,
    instance_key: String,
    api_token: String,
    created_at: DateTime<Utc>,
}

impl TryFrom<IntegrationRow> for Integration {
    type Error = DispatchError;

    fn try_from(row: IntegrationRow) -> Result<Self, Self::Error> {
        let status = IntegrationStatus::from_str(&row.status)
            .map_err(DispatchError::Persistence)?;
        let variant = row
            .variant
            .as_deref()
            .map(ChannelVariant::from_str)
            .transpose()
            .map_err(DispatchError::Persistence)?;
        Ok(Integration {
            id: row.id,
            company_id: row.company_id,
            status,
            variant,
            base_url: row.base_url,
            instance_key: row.instance_key,
            api_token: row.api_token,
            created_at: row.created_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct MessageLogRow {
    id: Uuid,
    company_id: Uuid,
    campaign_id: Option<Uuid>,
    contact_id: Option<Uuid>,
    phone: String,
    content: String,
    status: String,
    external_message_id: Option<String>,
    channel_response: Option<String>,
    error: Option<String>,
    created_at: DateTime<Utc>,
    sent_at: Option<DateTime<Utc>>,
    delivered_at: Option<DateTime<Utc>>,
    read_at: Option<DateTime<Utc>>,
    failed_at: Option<DateTime<Utc>>,
}

impl TryFrom<MessageLogRow> for MessageLogEntry {
    type Error = DispatchError;

    fn try_from(row: MessageLogRow) -> Result<Self, Self::Error> {
        let status = MessageStatus::from_str(&row.status)
            .map_err(DispatchError::Persistence)?;
        Ok(MessageLogEntry {
            id: row.id,
            company_id: row.company_id,
            campaign_id: row.campaign_id,
            contact_id: row.contact_id,
            phone: row.phone,
            content: row.content,
            status,
            external_message_id: row.external_message_id,
            channel_response: row.channel_response,
            error: row.error,
            created_at: row.created_at,
            sent_at: row.sent_at,
            delivered_at: row.delivered_at,
            read_at: row.read_at,
            failed_at: row.failed_at,
        })
    }
}

const CAMPAIGN_COLUMNS: &str = "id, company_id, template_id, status, total_contacts, sent_count, \
     delivered_count, failed_count, variables, scheduled_at, started_at, completed_at, created_at";

const INTEGRATION_COLUMNS: &str =
    "id, company_id, status, variant, base_url, instance_key, api_token, created_at";

const MESSAGE_LOG_COLUMNS: &str = "id, company_id, campaign_id, contact_id, phone, content, \
     status, external_message_id, channel_response, error, created_at, sent_at, delivered_at, \
     read_at, failed_at";

fn timestamp_column(status: MessageStatus) -> Option<&'static str> {
    match status {
        MessageStatus::Sent => Some("sent_at"),
        MessageStatus::Delivered => Some("delivered_at"),
        MessageStatus::Read => Some("read_at"),
        MessageStatus::Failed => Some("failed_at"),
        MessageStatus::Pending => None,
    }
}

#[async_trait]
impl StatusStore for PgStatusStore {
    async fn campaign(
        &self,
        campaign_id: Uuid,
        company_id: Uuid,
    ) -> DispatchResult<Option<Campaign>> {
        let row = sqlx::query_as::<_, CampaignRow>(&format!(
            "SELECT {} FROM campaigns WHERE id = $1 AND company_id = $2",
            CAMPAIGN_COLUMNS
        ))
        .bind(campaign_id)
        .bind(company_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Campaign::try_from).transpose()
    }

    async fn transition_campaign(
        &self,
        campaign_id: Uuid,
        from: &[CampaignStatus],
        to: CampaignStatus,
    ) -> DispatchResult<bool> {
        let from_states: Vec<String> = from.iter().map(|s| s.as_str().to_string()).collect();

        let stamp = match to {
            CampaignStatus::Running => ", started_at = COALESCE(started_at, now())",
            CampaignStatus::Completed => ", completed_at = COALESCE(completed_at, now())",
            _ => "",
        };

        let sql = format!(
            "UPDATE campaigns SET status = $1{} WHERE id = $2 AND status = ANY($3)",
            stamp
        );
        let result = sqlx::query(&sql)
            .bind(to.as_str())
            .bind(campaign_id)
            .bind(&from_states)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn due_scheduled_campaigns(&self, now: DateTime<Utc>) -> DispatchResult<Vec<Campaign>> {
        let rows = sqlx::query_as::<_, CampaignRow>(&format!(
            "SELECT {} FROM campaigns \
             WHERE status = 'scheduled' AND scheduled_at IS NOT NULL AND scheduled_at <= $1 \
             ORDER BY scheduled_at",
            CAMPAIGN_COLUMNS
        ))
        .bind(now)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Campaign::try_from).collect()
    }

    async fn recompute_campaign_aggregate(
        &self,
        campaign_id: Uuid,
    ) -> DispatchResult<CampaignAggregate> {
        // Full scan of per-contact statuses - never incremented in place,
        // so at-least-once redelivery cannot double count.
        let row = sqlx::query(
            "SELECT \
                count(*) AS total, \
                count(*) FILTER (WHERE status = 'pending') AS pending, \
                count(*) FILTER (WHERE status IN ('sent', 'delivered', 'read')) AS sent, \
                count(*) FILTER (WHERE status IN ('delivered', 'read')) AS delivered, \
                count(*) FILTER (WHERE status = 'failed') AS failed \
             FROM campaign_contacts WHERE campaign_id = $1",
        )
        .bind(campaign_id)
        .fetch_one(&self.pool)
        .await?;

        let aggregate = CampaignAggregate {
            total: row.try_get("total")?,
            pending: row.try_get("pending")?,
            sent: row.try_get("sent")?,
            delivered: row.try_get("delivered")?,
            failed: row.try_get("failed")?,
        };

        sqlx::query(
            "UPDATE campaigns \
             SET sent_count = $1, delivered_count = $2, failed_count = $3 \
             WHERE id = $4",
        )
        .bind(aggregate.sent)
        .bind(aggregate.delivered)
        .bind(aggregate.failed)
        .bind(campaign_id)
        .execute(&self.pool)
        .await?;

        // Completion detection: nothing pending on a running campaign.
        if aggregate.pending == 0 && aggregate.total > 0 {
            let completed = self
                .transition_campaign(campaign_id, &[CampaignStatus::Running], CampaignStatus::Completed)
                .await?;
            if completed {
                debug!(campaign_id = %campaign_id, "Campaign completed");
            }
        }

        Ok(aggregate)
    }

    async fn template_body(&self, template_id: Uuid) -> DispatchResult<Option<String>> {
        let row = sqlx::query("SELECT body FROM templates WHERE id = $1")
            .bind(template_id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.map(|r| r.get("body")))
    }

    async fn pending_contacts(
        &self,
        campaign_id: Uuid,
        limit: i64,
    ) -> DispatchResult<Vec<Contact>> {
        let rows = sqlx::query(
            "SELECT c.id, c.company_id, c.name, c.phone \
             FROM campaign_contacts cc \
             JOIN contacts c ON c.id = cc.contact_id \
             WHERE cc.campaign_id = $1 AND cc.status = 'pending' \
             ORDER BY c.id \
             LIMIT $2",
        )
        .bind(campaign_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|r| Contact {
                id: r.get("id"),
                company_id: r.get("company_id"),
                name: r.get("name"),
                phone: r.get("phone"),
            })
            .collect())
    }

    async fn set_contact_status(
        &self,
        campaign_id: Uuid,
        contact_id: Uuid,
        status: MessageStatus,
        error: Option<&str>,
    ) -> DispatchResult<()> {
        // Same forward-only rule as the message log, enforced in SQL so a
        // redelivered job cannot regress a contact that already advanced.
        sqlx::query(
            "UPDATE campaign_contacts \
             SET status = $1, error = $2, updated_at = now() \
             WHERE campaign_id = $3 AND contact_id = $4 \
               AND status <> $1 \
               AND (status = 'pending' \
                    OR ($1 = 'failed' AND status <> 'failed') \
                    OR (status = 'failed' AND $1 = 'sent') \
                    OR (status = 'sent' AND $1 IN ('delivered', 'read')) \
                    OR (status = 'delivered' AND $1 = 'read'))",
        )
        .bind(status.as_str())
        .bind(error)
        .bind(campaign_id)
        .bind(contact_id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn create_message_log(&self, entry: NewMessageLog) -> DispatchResult<Uuid> {
        let id = Uuid::new_v4();
        sqlx::query(
            "INSERT INTO message_log \
                (id, company_id, campaign_id, contact_id, phone, content, status, created_at) \
             VALUES ($1, $2, $3, $4, $5, $6, 'pending', now())",
        )
        .bind(id)
        .bind(entry.company_id)
        .bind(entry.campaign_id)
        .bind(entry.contact_id)
        .bind(&entry.phone)
        .bind(&entry.content)
        .execute(&self.pool)
        .await?;

        Ok(id)
    }

    async fn message_log(&self, id: Uuid) -> DispatchResult<Option<MessageLogEntry>> {
        let row = sqlx::query_as::<_, MessageLogRow>(&format!(
            "SELECT {} FROM message_log WHERE id = $1",
            MESSAGE_LOG_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(MessageLogEntry::try_from).transpose()
    }

    async fn update_message_log(
        &self,
        id: Uuid,
        status: MessageStatus,
        update: MessageLogUpdate,
    ) -> DispatchResult<()> {
        // Two writers race on this row (worker and receipt webhook), so
        // the read-check-update is guarded by the previous status and
        // retried once if a concurrent writer got there first.
        for _ in 0..2 {
            let current: Option<String> =
                sqlx::query("SELECT status FROM message_log WHERE id = $1")
                    .bind(id)
                    .fetch_optional(&self.pool)
                    .await?
                    .map(|r| r.get("status"));

            let Some(current) = current else {
                return Err(DispatchError::not_found(format!(
                    "message log entry {}",
                    id
                )));
            };
            let current_status = MessageStatus::from_str(&current)
                .map_err(DispatchError::Persistence)?;

            if !current_status.can_transition(status) {
                // Idempotent repeat or out-of-order late write: no-op.
                debug!(
                    message_log_id = %id,
                    from = current_status.as_str(),
                    to = status.as_str(),
                    "Skipping non-monotonic message status update"
                );
                return Ok(());
            }

            let Some(ts_col) = timestamp_column(status) else {
                return Ok(());
            };

            let sql = format!(
                "UPDATE message_log \
                 SET status = $1, \
                     external_message_id = COALESCE($2, external_message_id), \
                     channel_response = COALESCE($3, channel_response), \
                     error = COALESCE($4, error), \
                     {ts} = COALESCE($5, {ts}, now()) \
                 WHERE id = $6 AND status = $7",
                ts = ts_col
            );
            let result = sqlx::query(&sql)
                .bind(status.as_str())
                .bind(&update.external_message_id)
                .bind(&update.channel_response)
                .bind(&update.error)
                .bind(update.status_at)
                .bind(id)
                .bind(current_status.as_str())
                .execute(&self.pool)
                .await?;

            if result.rows_affected() > 0 {
                return Ok(());
            }
            // Lost the race - re-read and re-evaluate the transition.
        }
        Ok(())
    }

    async fn integration(
        &self,
        integration_id: Uuid,
        company_id: Uuid,
    ) -> DispatchResult<Option<Integration>> {
        let row = sqlx::query_as::<_, IntegrationRow>(&format!(
            "SELECT {} FROM integrations WHERE id = $1 AND company_id = $2",
            INTEGRATION_COLUMNS
        ))
        .bind(integration_id)
        .bind(company_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Integration::try_from).transpose()
    }

    async fn latest_connected_integration(
        &self,
        company_id: Uuid,
    ) -> DispatchResult<Option<Integration>> {
        let row = sqlx::query_as::<_, IntegrationRow>(&format!(
            "SELECT {} FROM integrations \
             WHERE company_id = $1 AND status = 'connected' \
             ORDER BY created_at DESC \
             LIMIT 1",
            INTEGRATION_COLUMNS
        ))
        .bind(company_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Integration::try_from).transpose()
    }

    async fn ping(&self) -> DispatchResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}
