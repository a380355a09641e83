use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::{
    delivery::DeliveryLogEntry,
    email::Attachment,
    status::OutboxState,
};

/// Durable record of one send-intent and its fate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboxRecord {
    pub send_id: Uuid,
    pub state: OutboxState,
    pub recipients: Vec<String>,
    pub cc: Vec<String>,
    pub bcc: Vec<String>,
    pub from_addr: String,
    pub subject: String,
    pub body: String,
    pub content_type: String,

    #[serde(default, skip_serializing)]
    pub attachments: Vec<Attachment>,

    pub attempt_count: u32,
    pub dlq_attempt_count: u32,
    pub last_error: Option<String>,
    pub idempotency_key: Option<String>,
    pub correlation_id: String,
    pub template_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub dispatched_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl OutboxRecord {
    /// Builds the `queued` record stored by `OutboxStore::append`.
    pub fn queued(send_id: Uuid, new: NewOutboxRecord, now: DateTime<Utc>) -> Self {
        Self {
            send_id,
            state: OutboxState::Queued,
            recipients: new.recipients,
            cc: new.cc,
            bcc: new.bcc,
            from_addr: new.from_addr,
            subject: new.subject,
            body: new.body,
            content_type: new.content_type,
            attachments: new.attachments,
            attempt_count: 0,
            dlq_attempt_count: 0,
            last_error: None,
            idempotency_key: new.idempotency_key,
            correlation_id: new.correlation_id,
            template_id: new.template_id,
            created_at: now,
            updated_at: now,
            dispatched_at: None,
            completed_at: None,
        }
    }

    /// Every envelope recipient: to, then cc, then bcc.
    pub fn envelope_recipients(&self) -> impl Iterator<Item = &str> {
        self.recipients
            .iter()
            .chain(self.cc.iter())
            .chain(self.bcc.iter())
            .map(String::as_str)
    }

    /// Applies a conditional transition's field updates.
    pub fn apply(&mut self, to: OutboxState, update: &StateUpdate, now: DateTime<Utc>) {
        self.state = to;
        self.updated_at = now;

        if let Some(attempts) = update.attempt_count {
            self.attempt_count = self.attempt_count.max(attempts);
        }
        if let Some(attempts) = update.dlq_attempt_count {
            self.dlq_attempt_count = self.dlq_attempt_count.max(attempts);
        }
        if let Some(error) = &update.last_error {
            self.last_error = Some(error.clone());
        }
        if self.dispatched_at.is_none() {
            self.dispatched_at = update.dispatched_at;
        }
        if update.completed_at.is_some() {
            self.completed_at = update.completed_at;
        }
    }
}

/// Everything ingress knows about a send-intent once it has been validated and rendered.
#[derive(Debug, Clone)]
pub struct NewOutboxRecord {
    pub recipients: Vec<String>,
    pub cc: Vec<String>,
    pub bcc: Vec<String>,
    pub from_addr: String,
    pub subject: String,
    pub body: String,
    pub content_type: String,
    pub attachments: Vec<Attachment>,
    pub idempotency_key: Option<String>,
    pub correlation_id: String,
    pub template_id: Option<Uuid>,
}

/// Fields written together with a state transition. `None` leaves the column alone.
#[derive(Debug, Clone, Default)]
pub struct StateUpdate {
    /// Refuse the transition unless the record is still on this attempt.
    pub expected_attempt: Option<u32>,
    pub attempt_count: Option<u32>,
    pub dlq_attempt_count: Option<u32>,
    pub last_error: Option<String>,
    pub dispatched_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl StateUpdate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ties the transition to the claim made for `attempt`.
    pub fn for_attempt(mut self, attempt: u32) -> Self {
        self.expected_attempt = Some(attempt);
        self
    }

    pub fn with_attempt_count(mut self, attempts: u32) -> Self {
        self.attempt_count = Some(attempts);
        self
    }

    pub fn with_dlq_attempt_count(mut self, attempts: u32) -> Self {
        self.dlq_attempt_count = Some(attempts);
        self
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.last_error = Some(error.into());
        self
    }

    pub fn dispatched_at(mut self, at: DateTime<Utc>) -> Self {
        self.dispatched_at = Some(at);
        self
    }

    pub fn completed_at(mut self, at: DateTime<Utc>) -> Self {
        self.completed_at = Some(at);
        self
    }
}

/// Result of `OutboxStore::append`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Appended {
    pub send_id: Uuid,
    /// `false` when the idempotency key matched an existing record.
    pub created: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct OutboxFilter {
    pub state: Option<OutboxState>,
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
    pub page: Option<u64>,
    pub limit: Option<u64>,
}

impl OutboxFilter {
    pub const DEFAULT_LIMIT: u64 = 20;
    pub const MAX_LIMIT: u64 = 100;

    pub fn page(&self) -> u64 {
        self.page.unwrap_or(1).max(1)
    }

    pub fn limit(&self) -> u64 {
        self.limit
            .unwrap_or(Self::DEFAULT_LIMIT)
            .clamp(1, Self::MAX_LIMIT)
    }

    pub fn offset(&self) -> u64 {
        (self.page() - 1) * self.limit()
    }

    pub fn matches(&self, record: &OutboxRecord) -> bool {
        self.state.is_none_or(|state| record.state == state)
            && self.from.is_none_or(|from| record.created_at >= from)
            && self.to.is_none_or(|to| record.created_at < to)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct OutboxPage {
    pub records: Vec<OutboxRecord>,
    pub total: u64,
}

/// One row of the state audit trail.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateChange {
    pub from: Option<OutboxState>,
    pub to: OutboxState,
    pub occurred_at: DateTime<Utc>,
}

/// `GET /emails/{id}` payload.
#[derive(Debug, Clone, Serialize)]
pub struct OutboxDetail {
    #[serde(flatten)]
    pub record: OutboxRecord,
    pub deliveries: Vec<DeliveryLogEntry>,
    pub history: Vec<StateChange>,
}
