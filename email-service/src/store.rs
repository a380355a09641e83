use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::{
    error::EmailServiceError,
    models::{
        delivery::DeliveryLogEntry,
        outbox::{
            Appended, NewOutboxRecord, OutboxFilter, OutboxPage, OutboxRecord, StateChange,
            StateUpdate,
        },
        status::OutboxState,
        template::Template,
    },
};

/// Durable source of truth for every send-intent.
///
/// All mutation goes through [`OutboxStore::transition_state`] or the append
/// operations. Implementations must make the conditional transition atomic and
/// record a [`StateChange`] alongside it.
#[async_trait]
pub trait OutboxStore: Send + Sync {
    /// Stores a new record in `queued`. A repeated idempotency key returns the
    /// original send-id with `created == false`.
    async fn append(&self, record: NewOutboxRecord) -> Result<Appended, EmailServiceError>;

    /// Moves `send_id` from `from` to `to`, failing with `ConflictingState`
    /// unless the current state equals `from`. Returns the updated record.
    async fn transition_state(
        &self,
        send_id: Uuid,
        from: OutboxState,
        to: OutboxState,
        update: StateUpdate,
    ) -> Result<OutboxRecord, EmailServiceError>;

    async fn load(&self, send_id: Uuid) -> Result<OutboxRecord, EmailServiceError>;

    /// Append-only. Writing the same `(send_id, attempt)` twice keeps the first row.
    async fn append_delivery_attempt(&self, entry: DeliveryLogEntry)
    -> Result<(), EmailServiceError>;

    /// Delivery log of one record, ordered by attempt.
    async fn deliveries(&self, send_id: Uuid) -> Result<Vec<DeliveryLogEntry>, EmailServiceError>;

    /// State audit trail of one record, oldest first.
    async fn state_history(&self, send_id: Uuid) -> Result<Vec<StateChange>, EmailServiceError>;

    /// Newest records first.
    async fn list(&self, filter: &OutboxFilter) -> Result<OutboxPage, EmailServiceError>;

    /// Non-terminal records last updated before `updated_before`, oldest first.
    async fn list_stale(
        &self,
        updated_before: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<OutboxRecord>, EmailServiceError>;

    /// Operator delete; cascades to the delivery log and state history.
    async fn delete(&self, send_id: Uuid) -> Result<(), EmailServiceError>;
}

/// Persistence for templates. Soft-deleted templates behave as absent.
#[async_trait]
pub trait TemplateRepository: Send + Sync {
    /// Fails with `InvalidTemplate` when the name is held by a live template.
    async fn insert(&self, template: &Template) -> Result<(), EmailServiceError>;

    async fn get(&self, id: Uuid) -> Result<Template, EmailServiceError>;

    async fn update(&self, template: &Template) -> Result<(), EmailServiceError>;

    async fn soft_delete(&self, id: Uuid, at: DateTime<Utc>) -> Result<(), EmailServiceError>;
}

/// Read-through cache in front of a [`TemplateRepository`]. Failures are never fatal.
#[async_trait]
pub trait TemplateCache: Send + Sync {
    async fn get(&self, id: Uuid) -> anyhow::Result<Option<Template>>;

    async fn put(&self, template: &Template) -> anyhow::Result<()>;

    async fn invalidate(&self, id: Uuid) -> anyhow::Result<()>;
}
