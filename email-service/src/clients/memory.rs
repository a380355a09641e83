use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering},
    },
};

use anyhow::{Error, Result, anyhow};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::stream;
use tokio::sync::{
    Mutex,
    mpsc::{self, UnboundedReceiver, UnboundedSender},
};
use tracing::debug;
use uuid::Uuid;

use crate::{
    clients::broker::{Acknowledge, Broker, Delivery, DeliveryStream},
    error::EmailServiceError,
    models::{
        delivery::DeliveryLogEntry,
        message::{BrokerMessage, Topic},
        outbox::{
            Appended, NewOutboxRecord, OutboxFilter, OutboxPage, OutboxRecord, StateChange,
            StateUpdate,
        },
        status::OutboxState,
        template::Template,
    },
    store::{OutboxStore, TemplateRepository},
};

#[derive(Default)]
struct Tables {
    records: HashMap<Uuid, OutboxRecord>,
    idempotency_keys: HashMap<String, Uuid>,
    deliveries: HashMap<Uuid, Vec<DeliveryLogEntry>>,
    history: HashMap<Uuid, Vec<StateChange>>,
    templates: HashMap<Uuid, Template>,
}

/// In-process outbox and template store.
///
/// One mutex guards every table, so each operation is atomic in the same way a
/// single database transaction would be.
pub struct MemoryStore {
    tables: Mutex<Tables>,
    available: AtomicBool,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            tables: Mutex::new(Tables::default()),
            available: AtomicBool::new(true),
        }
    }

    /// Simulates an outage: every operation fails with a store error while unset.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    pub async fn record_count(&self) -> usize {
        self.tables.lock().await.records.len()
    }

    fn ensure_available(&self) -> Result<(), EmailServiceError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(EmailServiceError::store(anyhow!("memory store is unavailable")))
        }
    }
}

fn outbox_not_found(send_id: Uuid) -> EmailServiceError {
    EmailServiceError::NotFound(format!("outbox record {}", send_id))
}

fn template_not_found(id: Uuid) -> EmailServiceError {
    EmailServiceError::NotFound(format!("template {}", id))
}

fn name_taken(tables: &Tables, template: &Template) -> bool {
    tables.templates.values().any(|existing| {
        existing.id != template.id
            && existing.deleted_at.is_none()
            && existing.name == template.name
    })
}

#[async_trait]
impl OutboxStore for MemoryStore {
    async fn append(&self, record: NewOutboxRecord) -> Result<Appended, EmailServiceError> {
        self.ensure_available()?;
        let mut tables = self.tables.lock().await;

        if let Some(key) = &record.idempotency_key
            && let Some(existing) = tables.idempotency_keys.get(key)
        {
            return Ok(Appended {
                send_id: *existing,
                created: false,
            });
        }

        let send_id = Uuid::new_v4();
        let now = Utc::now();
        let record = OutboxRecord::queued(send_id, record, now);

        if let Some(key) = &record.idempotency_key {
            tables.idempotency_keys.insert(key.clone(), send_id);
        }
        tables.history.insert(
            send_id,
            vec![StateChange {
                from: None,
                to: OutboxState::Queued,
                occurred_at: now,
            }],
        );
        tables.records.insert(send_id, record);

        Ok(Appended {
            send_id,
            created: true,
        })
    }

    async fn transition_state(
        &self,
        send_id: Uuid,
        from: OutboxState,
        to: OutboxState,
        update: StateUpdate,
    ) -> Result<OutboxRecord, EmailServiceError> {
        if !from.can_transition_to(to) {
            return Err(EmailServiceError::IllegalTransition { from, to });
        }

        self.ensure_available()?;
        let mut tables = self.tables.lock().await;

        let record = tables
            .records
            .get_mut(&send_id)
            .ok_or_else(|| outbox_not_found(send_id))?;

        if record.state != from {
            return Err(EmailServiceError::ConflictingState {
                send_id,
                expected: from,
                actual: record.state,
            });
        }

        if let Some(expected) = update.expected_attempt
            && record.attempt_count != expected
        {
            return Err(EmailServiceError::StaleClaim {
                send_id,
                expected,
                actual: record.attempt_count,
            });
        }

        let now = Utc::now();
        record.apply(to, &update, now);
        let updated = record.clone();

        tables.history.entry(send_id).or_default().push(StateChange {
            from: Some(from),
            to,
            occurred_at: now,
        });

        Ok(updated)
    }

    async fn load(&self, send_id: Uuid) -> Result<OutboxRecord, EmailServiceError> {
        self.ensure_available()?;
        let tables = self.tables.lock().await;

        tables
            .records
            .get(&send_id)
            .cloned()
            .ok_or_else(|| outbox_not_found(send_id))
    }

    async fn append_delivery_attempt(
        &self,
        entry: DeliveryLogEntry,
    ) -> Result<(), EmailServiceError> {
        self.ensure_available()?;
        let mut tables = self.tables.lock().await;

        if !tables.records.contains_key(&entry.send_id) {
            return Err(outbox_not_found(entry.send_id));
        }

        let log = tables.deliveries.entry(entry.send_id).or_default();
        if log.iter().any(|existing| existing.attempt == entry.attempt) {
            debug!(
                send_id = %entry.send_id,
                attempt = entry.attempt,
                "Delivery attempt already logged"
            );
            return Ok(());
        }

        log.push(entry);
        log.sort_by_key(|e| e.attempt);
        Ok(())
    }

    async fn deliveries(&self, send_id: Uuid) -> Result<Vec<DeliveryLogEntry>, EmailServiceError> {
        self.ensure_available()?;
        let tables = self.tables.lock().await;

        if !tables.records.contains_key(&send_id) {
            return Err(outbox_not_found(send_id));
        }
        Ok(tables.deliveries.get(&send_id).cloned().unwrap_or_default())
    }

    async fn state_history(&self, send_id: Uuid) -> Result<Vec<StateChange>, EmailServiceError> {
        self.ensure_available()?;
        let tables = self.tables.lock().await;

        if !tables.records.contains_key(&send_id) {
            return Err(outbox_not_found(send_id));
        }
        Ok(tables.history.get(&send_id).cloned().unwrap_or_default())
    }

    async fn list(&self, filter: &OutboxFilter) -> Result<OutboxPage, EmailServiceError> {
        self.ensure_available()?;
        let tables = self.tables.lock().await;

        let mut matching: Vec<&OutboxRecord> = tables
            .records
            .values()
            .filter(|record| filter.matches(record))
            .collect();
        matching.sort_by(|a, b| b.created_at.cmp(&a.created_at));

        let total = matching.len() as u64;
        let records = matching
            .into_iter()
            .skip(filter.offset() as usize)
            .take(filter.limit() as usize)
            .cloned()
            .collect();

        Ok(OutboxPage { records, total })
    }

    async fn list_stale(
        &self,
        updated_before: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<OutboxRecord>, EmailServiceError> {
        self.ensure_available()?;
        let tables = self.tables.lock().await;

        let mut stale: Vec<OutboxRecord> = tables
            .records
            .values()
            .filter(|record| !record.state.is_terminal() && record.updated_at < updated_before)
            .cloned()
            .collect();
        stale.sort_by_key(|record| record.updated_at);
        stale.truncate(limit as usize);

        Ok(stale)
    }

    async fn delete(&self, send_id: Uuid) -> Result<(), EmailServiceError> {
        self.ensure_available()?;
        let mut tables = self.tables.lock().await;

        let record = tables
            .records
            .remove(&send_id)
            .ok_or_else(|| outbox_not_found(send_id))?;

        if let Some(key) = record.idempotency_key {
            tables.idempotency_keys.remove(&key);
        }
        tables.deliveries.remove(&send_id);
        tables.history.remove(&send_id);

        Ok(())
    }
}

#[async_trait]
impl TemplateRepository for MemoryStore {
    async fn insert(&self, template: &Template) -> Result<(), EmailServiceError> {
        self.ensure_available()?;
        let mut tables = self.tables.lock().await;

        if name_taken(&tables, template) {
            return Err(EmailServiceError::InvalidTemplate(format!(
                "name '{}' is already in use",
                template.name
            )));
        }

        tables.templates.insert(template.id, template.clone());
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Template, EmailServiceError> {
        self.ensure_available()?;
        let tables = self.tables.lock().await;

        tables
            .templates
            .get(&id)
            .filter(|template| template.deleted_at.is_none())
            .cloned()
            .ok_or_else(|| template_not_found(id))
    }

    async fn update(&self, template: &Template) -> Result<(), EmailServiceError> {
        self.ensure_available()?;
        let mut tables = self.tables.lock().await;

        let live = tables
            .templates
            .get(&template.id)
            .is_some_and(|existing| existing.deleted_at.is_none());
        if !live {
            return Err(template_not_found(template.id));
        }

        if name_taken(&tables, template) {
            return Err(EmailServiceError::InvalidTemplate(format!(
                "name '{}' is already in use",
                template.name
            )));
        }

        tables.templates.insert(template.id, template.clone());
        Ok(())
    }

    async fn soft_delete(&self, id: Uuid, at: DateTime<Utc>) -> Result<(), EmailServiceError> {
        self.ensure_available()?;
        let mut tables = self.tables.lock().await;

        match tables.templates.get_mut(&id) {
            Some(template) if template.deleted_at.is_none() => {
                template.deleted_at = Some(at);
                template.updated_at = at;
                Ok(())
            }
            _ => Err(template_not_found(id)),
        }
    }
}

/// A message accepted by [`MemoryBroker::publish`].
#[derive(Debug, Clone)]
pub struct PublishedMessage {
    pub topic: Topic,
    pub message: BrokerMessage,
    pub published_at: DateTime<Utc>,
}

struct TopicQueue {
    sender: UnboundedSender<BrokerMessage>,
    receiver: Arc<Mutex<UnboundedReceiver<BrokerMessage>>>,
}

impl TopicQueue {
    fn new() -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        Self {
            sender,
            receiver: Arc::new(Mutex::new(receiver)),
        }
    }
}

#[derive(Default)]
struct Counters {
    acks: AtomicUsize,
    nacks: AtomicUsize,
}

/// In-process broker with competing consumers per topic.
///
/// Delayed messages are held by a timer task until `not_before`. Nacked
/// messages go straight back onto their topic.
pub struct MemoryBroker {
    main: TopicQueue,
    dlq: TopicQueue,
    published: Mutex<Vec<PublishedMessage>>,
    counters: Arc<Counters>,
    failing_publishes: AtomicU32,
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self {
            main: TopicQueue::new(),
            dlq: TopicQueue::new(),
            published: Mutex::new(Vec::new()),
            counters: Arc::new(Counters::default()),
            failing_publishes: AtomicU32::new(0),
        }
    }

    /// Makes the next `count` publishes fail.
    pub fn fail_next_publishes(&self, count: u32) {
        self.failing_publishes.store(count, Ordering::SeqCst);
    }

    pub async fn published(&self) -> Vec<PublishedMessage> {
        self.published.lock().await.clone()
    }

    pub async fn published_to(&self, topic: Topic) -> Vec<PublishedMessage> {
        self.published
            .lock()
            .await
            .iter()
            .filter(|p| p.topic == topic)
            .cloned()
            .collect()
    }

    pub fn ack_count(&self) -> usize {
        self.counters.acks.load(Ordering::SeqCst)
    }

    pub fn nack_count(&self) -> usize {
        self.counters.nacks.load(Ordering::SeqCst)
    }

    fn queue(&self, topic: Topic) -> &TopicQueue {
        match topic {
            Topic::Main => &self.main,
            Topic::Dlq => &self.dlq,
        }
    }

    fn take_injected_failure(&self) -> bool {
        self.failing_publishes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

struct MemoryAcker {
    message: BrokerMessage,
    requeue: UnboundedSender<BrokerMessage>,
    counters: Arc<Counters>,
}

#[async_trait]
impl Acknowledge for MemoryAcker {
    async fn ack(&self) -> Result<(), Error> {
        self.counters.acks.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn nack(&self) -> Result<(), Error> {
        self.counters.nacks.fetch_add(1, Ordering::SeqCst);
        self.requeue
            .send(self.message.clone())
            .map_err(|_| anyhow!("memory broker topic closed"))
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn publish(&self, topic: Topic, message: &BrokerMessage) -> Result<(), Error> {
        if self.take_injected_failure() {
            return Err(anyhow!("memory broker rejected publish"));
        }

        let now = Utc::now();
        self.published.lock().await.push(PublishedMessage {
            topic,
            message: message.clone(),
            published_at: now,
        });

        let sender = self.queue(topic).sender.clone();
        match message.remaining_delay(now) {
            Some(delay) => {
                let message = message.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    let _ = sender.send(message);
                });
                Ok(())
            }
            None => sender
                .send(message.clone())
                .map_err(|_| anyhow!("memory broker topic closed")),
        }
    }

    async fn subscribe(&self, topic: Topic, group: &str) -> Result<DeliveryStream, Error> {
        debug!(%topic, group, "Subscribing to memory topic");

        let queue = self.queue(topic);
        let receiver = Arc::clone(&queue.receiver);
        let requeue = queue.sender.clone();
        let counters = Arc::clone(&self.counters);

        let deliveries = stream::unfold(receiver, move |receiver| {
            let requeue = requeue.clone();
            let counters = Arc::clone(&counters);
            async move {
                let message = receiver.lock().await.recv().await?;
                let acker = MemoryAcker {
                    message: message.clone(),
                    requeue,
                    counters,
                };
                Some((Ok(Delivery::new(message, Box::new(acker))), receiver))
            }
        });

        Ok(Box::pin(deliveries))
    }
}
