// ============================================================================
// Campaign Dispatcher
// ============================================================================
//
// Fan-out of a campaign into dispatch jobs: render the template per
// contact, create a pending log entry, publish in small batches with an
// inter-batch delay. The batch-and-sleep loop is the deliberate
// producer-side throttle - the broker gives the producer no credit-based
// backpressure signal.
//
// One bad job never aborts a campaign: a failed publish marks that entry
// failed and the loop continues.
//
// ============================================================================

pub mod template;

pub use template::render_template;

use chrono::Utc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::audit::AuditLogger;
use crate::config::DispatcherConfig;
use crate::error::{DispatchError, DispatchResult};
use crate::models::{
    render_variables, Campaign, CampaignStatus, Contact, DispatchJob, DispatchSummary,
    MessageStatus, MessageLogUpdate, NewMessageLog, SingleSendReceipt,
};
use crate::queue::JobQueue;
use crate::store::StatusStore;

pub struct CampaignDispatcher {
    store: Arc<dyn StatusStore>,
    queue: Arc<dyn JobQueue>,
    config: DispatcherConfig,
    /// Worker pacing used for the rough ETA estimate
    worker_pacing_ms: u64,
}

impl CampaignDispatcher {
    pub fn new(
        store: Arc<dyn StatusStore>,
        queue: Arc<dyn JobQueue>,
        config: DispatcherConfig,
        worker_pacing_ms: u64,
    ) -> Self {
        Self {
            store,
            queue,
            config,
            worker_pacing_ms,
        }
    }

    /// Fan a campaign out into dispatch jobs.
    ///
    /// Preconditions (4xx-class errors otherwise): the campaign exists
    /// for the company, is not already running or completed, has
    /// contacts, and its template exists.
    pub async fn send_campaign(
        &self,
        campaign_id: Uuid,
        company_id: Uuid,
        integration_id: Option<Uuid>,
    ) -> DispatchResult<DispatchSummary> {
        let campaign = self
            .store
            .campaign(campaign_id, company_id)
            .await?
            .ok_or_else(|| DispatchError::not_found(format!("campaign {}", campaign_id)))?;

        match campaign.status {
            CampaignStatus::Draft | CampaignStatus::Scheduled => {}
            other => {
                return Err(DispatchError::InvalidTransition {
                    from: other.to_string(),
                    to: CampaignStatus::Running.to_string(),
                })
            }
        }
        if campaign.total_contacts <= 0 {
            return Err(DispatchError::validation("campaign has no contacts"));
        }

        let template_id = campaign
            .template_id
            .ok_or_else(|| DispatchError::not_found("campaign has no template"))?;
        let template = self
            .store
            .template_body(template_id)
            .await?
            .ok_or_else(|| DispatchError::not_found(format!("template {}", template_id)))?;

        let transitioned = self
            .store
            .transition_campaign(
                campaign_id,
                &[CampaignStatus::Draft, CampaignStatus::Scheduled],
                CampaignStatus::Running,
            )
            .await?;
        if !transitioned {
            // Lost a race with a concurrent send.
            return Err(DispatchError::InvalidTransition {
                from: "unknown".to_string(),
                to: CampaignStatus::Running.to_string(),
            });
        }

        AuditLogger::log_campaign_event(campaign_id, company_id, "campaign_started", None);

        self.publish_pending(&campaign, &template, integration_id)
            .await
    }

    /// Continue fan-out of a resumed campaign: only contacts still
    /// pending are published.
    pub async fn resume_campaign(
        &self,
        campaign_id: Uuid,
        company_id: Uuid,
        integration_id: Option<Uuid>,
    ) -> DispatchResult<DispatchSummary> {
        let campaign = self
            .store
            .campaign(campaign_id, company_id)
            .await?
            .ok_or_else(|| DispatchError::not_found(format!("campaign {}", campaign_id)))?;

        let transitioned = self
            .store
            .transition_campaign(campaign_id, &[CampaignStatus::Paused], CampaignStatus::Running)
            .await?;
        if !transitioned {
            return Err(DispatchError::InvalidTransition {
                from: campaign.status.to_string(),
                to: CampaignStatus::Running.to_string(),
            });
        }

        let template_id = campaign
            .template_id
            .ok_or_else(|| DispatchError::not_found("campaign has no template"))?;
        let template = self
            .store
            .template_body(template_id)
            .await?
            .ok_or_else(|| DispatchError::not_found(format!("template {}", template_id)))?;

        AuditLogger::log_campaign_event(campaign_id, company_id, "campaign_resumed", None);

        self.publish_pending(&campaign, &template, integration_id)
            .await
    }

    /// Only a running campaign can be paused. Pausing stops new
    /// publication; already-queued jobs are not recalled.
    pub async fn pause_campaign(&self, campaign_id: Uuid, company_id: Uuid) -> DispatchResult<()> {
        let campaign = self
            .store
            .campaign(campaign_id, company_id)
            .await?
            .ok_or_else(|| DispatchError::not_found(format!("campaign {}", campaign_id)))?;

        let transitioned = self
            .store
            .transition_campaign(campaign_id, &[CampaignStatus::Running], CampaignStatus::Paused)
            .await?;
        if !transitioned {
            return Err(DispatchError::InvalidTransition {
                from: campaign.status.to_string(),
                to: CampaignStatus::Paused.to_string(),
            });
        }

        AuditLogger::log_campaign_event(campaign_id, company_id, "campaign_paused", None);
        Ok(())
    }

    pub async fn cancel_campaign(&self, campaign_id: Uuid, company_id: Uuid) -> DispatchResult<()> {
        let campaign = self
            .store
            .campaign(campaign_id, company_id)
            .await?
            .ok_or_else(|| DispatchError::not_found(format!("campaign {}", campaign_id)))?;

        let transitioned = self
            .store
            .transition_campaign(
                campaign_id,
                &[
                    CampaignStatus::Running,
                    CampaignStatus::Paused,
                    CampaignStatus::Scheduled,
                ],
                CampaignStatus::Cancelled,
            )
            .await?;
        if !transitioned {
            return Err(DispatchError::InvalidTransition {
                from: campaign.status.to_string(),
                to: CampaignStatus::Cancelled.to_string(),
            });
        }

        AuditLogger::log_campaign_event(campaign_id, company_id, "campaign_cancelled", None);
        Ok(())
    }

    /// One ad-hoc send outside any campaign. A publish failure marks the
    /// log entry failed and reports `job_created = false` - it never errors.
    pub async fn send_single_message(
        &self,
        company_id: Uuid,
        phone: &str,
        content: &str,
        integration_id: Option<Uuid>,
    ) -> DispatchResult<SingleSendReceipt> {
        if phone.trim().is_empty() {
            return Err(DispatchError::validation("phone is required"));
        }
        if content.is_empty() {
            return Err(DispatchError::validation("content is required"));
        }
        if content.chars().count() > crate::config::MAX_MESSAGE_LENGTH {
            return Err(DispatchError::validation(format!(
                "content exceeds {} characters",
                crate::config::MAX_MESSAGE_LENGTH
            )));
        }

        let message_log_id = self
            .store
            .create_message_log(NewMessageLog {
                company_id,
                campaign_id: None,
                contact_id: None,
                phone: phone.to_string(),
                content: content.to_string(),
            })
            .await?;

        let job = DispatchJob {
            id: Uuid::new_v4(),
            company_id,
            campaign_id: None,
            contact_id: None,
            message_log_id,
            phone: phone.to_string(),
            content: content.to_string(),
            integration_id,
            created_at: Utc::now(),
        };

        let job_created = match self.publish_job(&job).await {
            Ok(()) => true,
            Err(e) => {
                warn!(
                    message_log_id = %message_log_id,
                    error = %e,
                    "Single message publish failed"
                );
                self.mark_publish_failure(&job, &e).await;
                false
            }
        };

        Ok(SingleSendReceipt {
            message_log_id,
            job_created,
        })
    }

    /// Batch-and-sleep publish loop over the pending contacts of a
    /// campaign. Checks the campaign status at every batch boundary so a
    /// pause or cancel stops new publication promptly.
    async fn publish_pending(
        &self,
        campaign: &Campaign,
        template: &str,
        integration_id: Option<Uuid>,
    ) -> DispatchResult<DispatchSummary> {
        let contacts = self
            .store
            .pending_contacts(campaign.id, self.config.contact_page_limit)
            .await?;

        let total = contacts.len() as i64;
        let mut jobs_created: i64 = 0;

        for (batch_index, batch) in contacts.chunks(self.config.publish_batch_size).enumerate() {
            if batch_index > 0 {
                tokio::time::sleep(Duration::from_millis(self.config.publish_batch_delay_ms))
                    .await;

                // Pause/cancel stops publication, not in-flight jobs.
                let current = self.store.campaign(campaign.id, campaign.company_id).await?;
                match current.map(|c| c.status) {
                    Some(CampaignStatus::Running) => {}
                    other => {
                        info!(
                            campaign_id = %campaign.id,
                            status = ?other,
                            "Campaign no longer running, stopping publication"
                        );
                        break;
                    }
                }
            }

            for contact in batch {
                if self.publish_contact_job(campaign, template, contact, integration_id).await {
                    jobs_created += 1;
                }
            }
        }

        // Refresh counters; also completes the campaign in the edge case
        // where every publish failed and no job will ever run.
        self.store.recompute_campaign_aggregate(campaign.id).await?;

        let eta_seconds = (jobs_created as u64).saturating_mul(self.worker_pacing_ms) / 1000;

        info!(
            campaign_id = %campaign.id,
            jobs_created = jobs_created,
            total_contacts = total,
            eta_seconds = eta_seconds,
            "Campaign fan-out finished"
        );

        Ok(DispatchSummary {
            campaign_id: campaign.id,
            jobs_created,
            total_contacts: total,
            eta_seconds,
        })
    }

    /// Render, log and publish one contact's job. Partial-failure
    /// tolerant: any error is absorbed after marking the entry failed.
    async fn publish_contact_job(
        &self,
        campaign: &Campaign,
        template: &str,
        contact: &Contact,
        integration_id: Option<Uuid>,
    ) -> bool {
        let variables = render_variables(campaign, contact);
        let content = render_template(template, &variables);

        let message_log_id = match self
            .store
            .create_message_log(NewMessageLog {
                company_id: campaign.company_id,
                campaign_id: Some(campaign.id),
                contact_id: Some(contact.id),
                phone: contact.phone.clone(),
                content: content.clone(),
            })
            .await
        {
            Ok(id) => id,
            Err(e) => {
                error!(
                    campaign_id = %campaign.id,
                    contact_id = %contact.id,
                    error = %e,
                    "Failed to create message log entry, skipping contact"
                );
                return false;
            }
        };

        let job = DispatchJob {
            id: Uuid::new_v4(),
            company_id: campaign.company_id,
            campaign_id: Some(campaign.id),
            contact_id: Some(contact.id),
            message_log_id,
            phone: contact.phone.clone(),
            content,
            integration_id,
            created_at: Utc::now(),
        };

        match self.publish_job(&job).await {
            Ok(()) => true,
            Err(e) => {
                warn!(
                    campaign_id = %campaign.id,
                    contact_id = %contact.id,
                    error = %e,
                    "Publish failed, marking entry failed and continuing"
                );
                self.mark_publish_failure(&job, &e).await;
                false
            }
        }
    }

    async fn publish_job(&self, job: &DispatchJob) -> DispatchResult<()> {
        let payload = job.encode()?;
        self.queue.publish(&payload, 0).await?;
        Ok(())
    }

    /// Best effort: the job never made it onto the queue, so the entry
    /// (and the contact row, for campaign jobs) is terminal right away.
    async fn mark_publish_failure(&self, job: &DispatchJob, cause: &DispatchError) {
        let error_text = format!("publish failed: {}", cause);

        if let Err(e) = self
            .store
            .update_message_log(
                job.message_log_id,
                MessageStatus::Failed,
                MessageLogUpdate {
                    error: Some(error_text.clone()),
                    ..Default::default()
                },
            )
            .await
        {
            error!(message_log_id = %job.message_log_id, error = %e, "Failed to record publish failure");
        }

        if let (Some(campaign_id), Some(contact_id)) = (job.campaign_id, job.contact_id) {
            if let Err(e) = self
                .store
                .set_contact_status(campaign_id, contact_id, MessageStatus::Failed, Some(&error_text))
                .await
            {
                error!(campaign_id = %campaign_id, error = %e, "Failed to record contact failure");
            }
        }
    }

    /// Periodic sweep: dispatch scheduled campaigns whose time has come.
    ///
    /// A permanent error (bad configuration, missing template) cancels
    /// the campaign; a transient error (store, queue) leaves it scheduled
    /// for the next sweep.
    pub async fn run_scheduler(&self, shutdown: Arc<AtomicBool>) {
        let interval = Duration::from_secs(self.config.scheduler_interval_secs);
        info!(
            interval_secs = self.config.scheduler_interval_secs,
            "Campaign scheduler running"
        );

        while !shutdown.load(Ordering::SeqCst) {
            if let Err(e) = self.sweep_scheduled().await {
                error!(error = %e, "Scheduled campaign sweep failed");
            }
            tokio::time::sleep(interval).await;
        }

        info!("Campaign scheduler stopped");
    }

    pub async fn sweep_scheduled(&self) -> DispatchResult<()> {
        let due = self.store.due_scheduled_campaigns(Utc::now()).await?;

        for campaign in due {
            info!(
                campaign_id = %campaign.id,
                scheduled_at = ?campaign.scheduled_at,
                "Dispatching scheduled campaign"
            );

            match self.send_campaign(campaign.id, campaign.company_id, None).await {
                Ok(summary) => {
                    info!(
                        campaign_id = %campaign.id,
                        jobs_created = summary.jobs_created,
                        "Scheduled campaign dispatched"
                    );
                }
                Err(e) if e.is_retryable() => {
                    warn!(
                        campaign_id = %campaign.id,
                        error = %e,
                        "Scheduled dispatch hit a transient error, will retry next sweep"
                    );
                }
                Err(e) => {
                    error!(
                        campaign_id = %campaign.id,
                        error = %e,
                        "Scheduled dispatch failed permanently, cancelling campaign"
                    );
                    if let Err(cancel_err) = self
                        .cancel_campaign(campaign.id, campaign.company_id)
                        .await
                    {
                        error!(
                            campaign_id = %campaign.id,
                            error = %cancel_err,
                            "Failed to cancel scheduled campaign"
                        );
                    }
                }
            }
        }
        Ok(())
    }
}
