// ============================================================================
// In-memory test doubles
// ============================================================================
//
// Trait implementations backing the integration tests: a store, a queue
// and a channel sender that mirror the semantics of the production
// implementations without Postgres/Redis/HTTP.
//
// ============================================================================

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use uuid::Uuid;

use zaply_server::error::{DispatchError, DispatchResult};
use zaply_server::models::{
    Campaign, CampaignAggregate, CampaignStatus, Contact, Integration, IntegrationStatus,
    MessageLogEntry, MessageLogUpdate, MessageStatus, NewMessageLog,
};
use zaply_server::queue::{JobDelivery, JobQueue};
use zaply_server::sender::{ChannelSender, SendOutcome, SendRequest};
use zaply_server::store::StatusStore;

// ----------------------------------------------------------------------------
// MemoryStore
// ----------------------------------------------------------------------------

#[derive(Clone)]
struct ContactRow {
    contact_id: Uuid,
    status: MessageStatus,
    error: Option<String>,
}

#[derive(Default)]
struct StoreInner {
    campaigns: HashMap<Uuid, Campaign>,
    templates: HashMap<Uuid, String>,
    contacts: HashMap<Uuid, Contact>,
    campaign_contacts: HashMap<Uuid, Vec<ContactRow>>,
    message_log: HashMap<Uuid, MessageLogEntry>,
    integrations: HashMap<Uuid, Integration>,
    fail_create_log: bool,
}

#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<StoreInner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn seed_campaign(&self, campaign: Campaign) {
        self.inner
            .lock()
            .unwrap()
            .campaigns
            .insert(campaign.id, campaign);
    }

    pub fn seed_template(&self, id: Uuid, body: &str) {
        self.inner
            .lock()
            .unwrap()
            .templates
            .insert(id, body.to_string());
    }

    pub fn seed_contact(&self, contact: Contact) {
        self.inner
            .lock()
            .unwrap()
            .contacts
            .insert(contact.id, contact);
    }

    pub fn attach_contact(&self, campaign_id: Uuid, contact_id: Uuid) {
        self.inner
            .lock()
            .unwrap()
            .campaign_contacts
            .entry(campaign_id)
            .or_default()
            .push(ContactRow {
                contact_id,
                status: MessageStatus::Pending,
                error: None,
            });
    }

    pub fn seed_integration(&self, integration: Integration) {
        self.inner
            .lock()
            .unwrap()
            .integrations
            .insert(integration.id, integration);
    }

    pub fn fail_create_log(&self, fail: bool) {
        self.inner.lock().unwrap().fail_create_log = fail;
    }

    pub fn message_logs(&self) -> Vec<MessageLogEntry> {
        let mut logs: Vec<_> = self
            .inner
            .lock()
            .unwrap()
            .message_log
            .values()
            .cloned()
            .collect();
        logs.sort_by_key(|e| e.created_at);
        logs
    }

    pub fn campaign_snapshot(&self, campaign_id: Uuid) -> Option<Campaign> {
        self.inner.lock().unwrap().campaigns.get(&campaign_id).cloned()
    }

    pub fn contact_status(&self, campaign_id: Uuid, contact_id: Uuid) -> Option<MessageStatus> {
        self.inner
            .lock()
            .unwrap()
            .campaign_contacts
            .get(&campaign_id)?
            .iter()
            .find(|r| r.contact_id == contact_id)
            .map(|r| r.status)
    }
}

#[async_trait]
impl StatusStore for MemoryStore {
    async fn campaign(
        &self,
        campaign_id: Uuid,
        company_id: Uuid,
    ) -> DispatchResult<Option<Campaign>> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .campaigns
            .get(&campaign_id)
            .filter(|c| c.company_id == company_id)
            .cloned())
    }

    async fn transition_campaign(
        &self,
        campaign_id: Uuid,
        from: &[CampaignStatus],
        to: CampaignStatus,
    ) -> DispatchResult<bool> {
        let mut inner = self.inner.lock().unwrap();
        let Some(campaign) = inner.campaigns.get_mut(&campaign_id) else {
            return Ok(false);
        };
        if !from.contains(&campaign.status) {
            return Ok(false);
        }
        campaign.status = to;
        match to {
            CampaignStatus::Running => {
                campaign.started_at.get_or_insert_with(Utc::now);
            }
            CampaignStatus::Completed => {
                campaign.completed_at.get_or_insert_with(Utc::now);
            }
            _ => {}
        }
        Ok(true)
    }

    async fn due_scheduled_campaigns(&self, now: DateTime<Utc>) -> DispatchResult<Vec<Campaign>> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .campaigns
            .values()
            .filter(|c| {
                c.status == CampaignStatus::Scheduled
                    && c.scheduled_at.map(|t| t <= now).unwrap_or(false)
            })
            .cloned()
            .collect())
    }

    async fn recompute_campaign_aggregate(
        &self,
        campaign_id: Uuid,
    ) -> DispatchResult<CampaignAggregate> {
        let mut inner = self.inner.lock().unwrap();
        let statuses: Vec<MessageStatus> = inner
            .campaign_contacts
            .get(&campaign_id)
            .map(|rows| rows.iter().map(|r| r.status).collect())
            .unwrap_or_default();

        let aggregate = CampaignAggregate::from_statuses(statuses);

        if let Some(campaign) = inner.campaigns.get_mut(&campaign_id) {
            campaign.sent_count = aggregate.sent;
            campaign.delivered_count = aggregate.delivered;
            campaign.failed_count = aggregate.failed;

            if aggregate.pending == 0
                && aggregate.total > 0
                && campaign.status == CampaignStatus::Running
            {
                campaign.status = CampaignStatus::Completed;
                campaign.completed_at.get_or_insert_with(Utc::now);
            }
        }
        Ok(aggregate)
    }

    async fn template_body(&self, template_id: Uuid) -> DispatchResult<Option<String>> {
        Ok(self.inner.lock().unwrap().templates.get(&template_id).cloned())
    }

    async fn pending_contacts(
        &self,
        campaign_id: Uuid,
        limit: i64,
    ) -> DispatchResult<Vec<Contact>> {
        let inner = self.inner.lock().unwrap();
        let Some(rows) = inner.campaign_contacts.get(&campaign_id) else {
            return Ok(Vec::new());
        };
        Ok(rows
            .iter()
            .filter(|r| r.status == MessageStatus::Pending)
            .take(limit as usize)
            .filter_map(|r| inner.contacts.get(&r.contact_id).cloned())
            .collect())
    }

    async fn set_contact_status(
        &self,
        campaign_id: Uuid,
        contact_id: Uuid,
        status: MessageStatus,
        error: Option<&str>,
    ) -> DispatchResult<()> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(rows) = inner.campaign_contacts.get_mut(&campaign_id) {
            if let Some(row) = rows.iter_mut().find(|r| r.contact_id == contact_id) {
                if row.status.can_transition(status) {
                    row.status = status;
                    row.error = error.map(|e| e.to_string());
                }
            }
        }
        Ok(())
    }

    async fn create_message_log(&self, entry: NewMessageLog) -> DispatchResult<Uuid> {
        let mut inner = self.inner.lock().unwrap();
        if inner.fail_create_log {
            return Err(DispatchError::Persistence("store unavailable".to_string()));
        }
        let id = Uuid::new_v4();
        inner.message_log.insert(
            id,
            MessageLogEntry {
                id,
                company_id: entry.company_id,
                campaign_id: entry.campaign_id,
                contact_id: entry.contact_id,
                phone: entry.phone,
                content: entry.content,
                status: MessageStatus::Pending,
                external_message_id: None,
                channel_response: None,
                error: None,
                created_at: Utc::now(),
                sent_at: None,
                delivered_at: None,
                read_at: None,
                failed_at: None,
            },
        );
        Ok(id)
    }

    async fn message_log(&self, id: Uuid) -> DispatchResult<Option<MessageLogEntry>> {
        Ok(self.inner.lock().unwrap().message_log.get(&id).cloned())
    }

    async fn update_message_log(
        &self,
        id: Uuid,
        status: MessageStatus,
        update: MessageLogUpdate,
    ) -> DispatchResult<()> {
        let mut inner = self.inner.lock().unwrap();
        let Some(entry) = inner.message_log.get_mut(&id) else {
            return Err(DispatchError::not_found(format!("message log entry {}", id)));
        };

        if !entry.status.can_transition(status) {
            return Ok(());
        }

        entry.status = status;
        if update.external_message_id.is_some() {
            entry.external_message_id = update.external_message_id;
        }
        if update.channel_response.is_some() {
            entry.channel_response = update.channel_response;
        }
        if update.error.is_some() {
            entry.error = update.error;
        }

        let stamp = update.status_at.unwrap_or_else(Utc::now);
        match status {
            MessageStatus::Sent => {
                entry.sent_at.get_or_insert(stamp);
            }
            MessageStatus::Delivered => {
                entry.delivered_at.get_or_insert(stamp);
            }
            MessageStatus::Read => {
                entry.read_at.get_or_insert(stamp);
            }
            MessageStatus::Failed => {
                entry.failed_at.get_or_insert(stamp);
            }
            MessageStatus::Pending => {}
        }
        Ok(())
    }

    async fn integration(
        &self,
        integration_id: Uuid,
        company_id: Uuid,
    ) -> DispatchResult<Option<Integration>> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .integrations
            .get(&integration_id)
            .filter(|i| i.company_id == company_id)
            .cloned())
    }

    async fn latest_connected_integration(
        &self,
        company_id: Uuid,
    ) -> DispatchResult<Option<Integration>> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .integrations
            .values()
            .filter(|i| i.company_id == company_id && i.status == IntegrationStatus::Connected)
            .max_by_key(|i| i.created_at)
            .cloned())
    }

    async fn ping(&self) -> DispatchResult<()> {
        Ok(())
    }
}

// ----------------------------------------------------------------------------
// MemoryQueue
// ----------------------------------------------------------------------------

pub struct DeadLetter {
    pub payload: Vec<u8>,
    pub attempt: u32,
    pub reason: String,
}

#[derive(Default)]
struct QueueInner {
    next_id: u64,
    ready: VecDeque<JobDelivery>,
    pending: HashMap<String, JobDelivery>,
    dead: Vec<DeadLetter>,
    publishes: Vec<u32>,
    requeues: Vec<u32>,
    fail_publish: bool,
    /// When set, this many further publishes succeed before failing
    publish_successes_left: Option<u32>,
    fail_ping: bool,
    consumers: u64,
}

pub struct MemoryQueue {
    inner: Mutex<QueueInner>,
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(QueueInner {
                consumers: 1,
                ..Default::default()
            }),
        }
    }

    pub fn fail_publish(&self, fail: bool) {
        self.inner.lock().unwrap().fail_publish = fail;
    }

    pub fn fail_publish_after(&self, successes: u32) {
        self.inner.lock().unwrap().publish_successes_left = Some(successes);
    }

    pub fn fail_ping(&self, fail: bool) {
        self.inner.lock().unwrap().fail_ping = fail;
    }

    pub fn set_consumers(&self, consumers: u64) {
        self.inner.lock().unwrap().consumers = consumers;
    }

    pub fn publish_count(&self) -> usize {
        self.inner.lock().unwrap().publishes.len()
    }

    pub fn requeue_attempts(&self) -> Vec<u32> {
        self.inner.lock().unwrap().requeues.clone()
    }

    pub fn dead_letters(&self) -> Vec<DeadLetter> {
        let inner = self.inner.lock().unwrap();
        inner
            .dead
            .iter()
            .map(|d| DeadLetter {
                payload: d.payload.clone(),
                attempt: d.attempt,
                reason: d.reason.clone(),
            })
            .collect()
    }

    pub fn ready_len(&self) -> usize {
        self.inner.lock().unwrap().ready.len()
    }

    pub fn pending_len(&self) -> usize {
        self.inner.lock().unwrap().pending.len()
    }
}

#[async_trait]
impl JobQueue for MemoryQueue {
    async fn publish(&self, payload: &[u8], attempt: u32) -> DispatchResult<String> {
        let mut inner = self.inner.lock().unwrap();
        if inner.fail_publish {
            return Err(DispatchError::Queue("broker unavailable".to_string()));
        }
        if let Some(left) = inner.publish_successes_left {
            if left == 0 {
                return Err(DispatchError::Queue("broker unavailable".to_string()));
            }
            inner.publish_successes_left = Some(left - 1);
        }
        inner.next_id += 1;
        let id = format!("{}-0", inner.next_id);
        inner.ready.push_back(JobDelivery {
            stream_id: id.clone(),
            payload: payload.to_vec(),
            attempt,
        });
        inner.publishes.push(attempt);
        Ok(id)
    }

    async fn fetch(&self, max: usize, block: Duration) -> DispatchResult<Vec<JobDelivery>> {
        {
            let mut inner = self.inner.lock().unwrap();
            if !inner.ready.is_empty() {
                let mut out = Vec::new();
                while out.len() < max {
                    let Some(delivery) = inner.ready.pop_front() else {
                        break;
                    };
                    inner
                        .pending
                        .insert(delivery.stream_id.clone(), delivery.clone());
                    out.push(delivery);
                }
                return Ok(out);
            }
        }
        tokio::time::sleep(block).await;
        Ok(Vec::new())
    }

    async fn ack(&self, delivery: &JobDelivery) -> DispatchResult<()> {
        self.inner.lock().unwrap().pending.remove(&delivery.stream_id);
        Ok(())
    }

    async fn requeue(&self, delivery: &JobDelivery, attempt: u32) -> DispatchResult<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.pending.remove(&delivery.stream_id);
        inner.next_id += 1;
        let id = format!("{}-0", inner.next_id);
        inner.ready.push_back(JobDelivery {
            stream_id: id,
            payload: delivery.payload.clone(),
            attempt,
        });
        inner.requeues.push(attempt);
        Ok(())
    }

    async fn dead_letter(&self, delivery: &JobDelivery, reason: &str) -> DispatchResult<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.pending.remove(&delivery.stream_id);
        inner.dead.push(DeadLetter {
            payload: delivery.payload.clone(),
            attempt: delivery.attempt,
            reason: reason.to_string(),
        });
        Ok(())
    }

    async fn claim_stale(&self) -> DispatchResult<Vec<JobDelivery>> {
        Ok(Vec::new())
    }

    async fn depth(&self) -> DispatchResult<u64> {
        let inner = self.inner.lock().unwrap();
        Ok((inner.ready.len() + inner.pending.len()) as u64)
    }

    async fn consumer_count(&self) -> DispatchResult<u64> {
        Ok(self.inner.lock().unwrap().consumers)
    }

    async fn ping(&self) -> DispatchResult<()> {
        if self.inner.lock().unwrap().fail_ping {
            return Err(DispatchError::Queue("connection refused".to_string()));
        }
        Ok(())
    }
}

// ----------------------------------------------------------------------------
// MockSender
// ----------------------------------------------------------------------------

pub struct MockSender {
    scripted: Mutex<VecDeque<SendOutcome>>,
    default_outcome: SendOutcome,
    pub calls: AtomicU32,
    requests: Mutex<Vec<SendRequest>>,
}

impl MockSender {
    pub fn always_success() -> Self {
        Self::with_default(SendOutcome::sent(
            Some("wamid.test".to_string()),
            Some(serde_json::json!({"id": "wamid.test"})),
        ))
    }

    pub fn always_transient_failure() -> Self {
        Self::with_default(SendOutcome::transient("HTTP 503: upstream unavailable"))
    }

    pub fn always_permanent_failure() -> Self {
        Self::with_default(SendOutcome::permanent("HTTP 400: invalid recipient"))
    }

    pub fn with_default(default_outcome: SendOutcome) -> Self {
        Self {
            scripted: Mutex::new(VecDeque::new()),
            default_outcome,
            calls: AtomicU32::new(0),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn script(&self, outcome: SendOutcome) {
        self.scripted.lock().unwrap().push_back(outcome);
    }

    pub fn call_count(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn last_request(&self) -> Option<SendRequest> {
        self.requests.lock().unwrap().last().cloned()
    }
}

#[async_trait]
impl ChannelSender for MockSender {
    async fn send(&self, request: &SendRequest) -> SendOutcome {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.requests.lock().unwrap().push(request.clone());
        self.scripted
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| self.default_outcome.clone())
    }
}

// ----------------------------------------------------------------------------
// Fixtures
// ----------------------------------------------------------------------------

pub fn make_campaign(
    company_id: Uuid,
    template_id: Uuid,
    status: CampaignStatus,
    total_contacts: i64,
    variables: &[(&str, &str)],
) -> Campaign {
    Campaign {
        id: Uuid::new_v4(),
        company_id,
        template_id: Some(template_id),
        status,
        total_contacts,
        sent_count: 0,
        delivered_count: 0,
        failed_count: 0,
        variables: variables
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect(),
        scheduled_at: None,
        started_at: None,
        completed_at: None,
        created_at: Utc::now(),
    }
}

pub fn make_contact(company_id: Uuid, name: &str, phone: &str) -> Contact {
    Contact {
        id: Uuid::new_v4(),
        company_id,
        name: name.to_string(),
        phone: phone.to_string(),
    }
}

pub fn make_integration(company_id: Uuid, status: IntegrationStatus) -> Integration {
    Integration {
        id: Uuid::new_v4(),
        company_id,
        status,
        variant: None,
        base_url: "http://gateway.test".to_string(),
        instance_key: "instance-1".to_string(),
        api_token: "secret-token".to_string(),
        created_at: Utc::now(),
    }
}
