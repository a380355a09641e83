use std::{sync::Arc, time::Duration};

use chrono::Utc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::{
    clients::{
        broker::Broker,
        smtp::{Mailer, OutgoingEmail},
    },
    error::EmailServiceError,
    models::{
        delivery::DeliveryLogEntry,
        message::{BrokerMessage, Topic},
        outbox::{OutboxRecord, StateUpdate},
        status::{DeliveryCategory, OutboxState},
    },
    store::OutboxStore,
    utils::retry_with_backoff,
    workers::DeliveryPolicy,
};

/// Messages arriving closer than this to their `not_before` are handled as due.
const EARLY_TOLERANCE: Duration = Duration::from_millis(50);

/// Which retry budget an attempt is spending.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Main,
    Dlq,
}

impl Phase {
    /// A record that has made at least one DLQ attempt is in the DLQ phase.
    pub fn of(record: &OutboxRecord) -> Self {
        if record.dlq_attempt_count > 0 {
            Phase::Dlq
        } else {
            Phase::Main
        }
    }
}

/// The attempt path shared by the sender workers, the DLQ controller and the sweeper.
pub struct Dispatcher {
    store: Arc<dyn OutboxStore>,
    broker: Arc<dyn Broker>,
    mailer: Arc<dyn Mailer>,
    policy: DeliveryPolicy,
}

impl Dispatcher {
    pub fn new(
        store: Arc<dyn OutboxStore>,
        broker: Arc<dyn Broker>,
        mailer: Arc<dyn Mailer>,
        policy: DeliveryPolicy,
    ) -> Self {
        Self {
            store,
            broker,
            mailer,
            policy,
        }
    }

    pub fn store(&self) -> &dyn OutboxStore {
        self.store.as_ref()
    }

    pub fn policy(&self) -> &DeliveryPolicy {
        &self.policy
    }

    /// Loads the record behind a message. `None` when it no longer exists.
    pub async fn load(&self, send_id: Uuid) -> Result<Option<OutboxRecord>, EmailServiceError> {
        match self.store.load(send_id).await {
            Ok(record) => Ok(Some(record)),
            Err(EmailServiceError::NotFound(_)) => {
                warn!(send_id = %send_id, "Message refers to an unknown record, dropping it");
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// Conditional transition where losing the race is not an error.
    ///
    /// Returns `None` when another worker changed the record first.
    pub async fn try_transition(
        &self,
        send_id: Uuid,
        from: OutboxState,
        to: OutboxState,
        update: StateUpdate,
    ) -> Result<Option<OutboxRecord>, EmailServiceError> {
        match self.store.transition_state(send_id, from, to, update).await {
            Ok(record) => Ok(Some(record)),
            Err(e) if e.is_conflict() => {
                debug!(send_id = %send_id, %from, %to, error = %e, "Lost transition race");
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// Puts an early message back on its topic. Returns `true` when it did.
    pub async fn redelay_if_early(
        &self,
        topic: Topic,
        message: &BrokerMessage,
    ) -> Result<bool, EmailServiceError> {
        match message.remaining_delay(Utc::now()) {
            Some(remaining) if remaining > EARLY_TOLERANCE => {
                debug!(
                    send_id = %message.send_id,
                    remaining_ms = remaining.as_millis() as u64,
                    "Message arrived before not_before, delaying again"
                );
                self.publish(topic, message).await?;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    /// Runs one SMTP attempt for a record the caller has claimed into `dispatching`.
    pub async fn attempt(&self, record: OutboxRecord, phase: Phase) -> Result<(), EmailServiceError> {
        let attempt = record.attempt_count;
        let email = OutgoingEmail::from(&record);

        debug!(
            send_id = %record.send_id,
            attempt,
            dlq_attempt = record.dlq_attempt_count,
            recipients = record.recipients.len() + record.cc.len() + record.bcc.len(),
            "Dispatching email"
        );

        match self.mailer.send(&email).await {
            Ok(receipt) => {
                let entry = DeliveryLogEntry::new(record.send_id, attempt, DeliveryCategory::Success)
                    .with_code(Some(receipt.code))
                    .with_message(receipt.message);
                self.store.append_delivery_attempt(entry).await?;

                let sent = self
                    .try_transition(
                        record.send_id,
                        OutboxState::Dispatching,
                        OutboxState::Sent,
                        StateUpdate::new()
                            .for_attempt(attempt)
                            .completed_at(Utc::now()),
                    )
                    .await?;

                match sent {
                    Some(_) => info!(
                        send_id = %record.send_id,
                        attempt,
                        code = receipt.code,
                        category = %DeliveryCategory::Success,
                        "Email sent"
                    ),
                    None => warn!(
                        send_id = %record.send_id,
                        attempt,
                        code = receipt.code,
                        "Relay accepted an attempt whose claim was already taken over"
                    ),
                }
                Ok(())
            }
            Err(e) => {
                let category = e.classify(attempt, self.policy.timeout_transient_attempts);
                let entry = DeliveryLogEntry::new(record.send_id, attempt, category)
                    .with_code(e.code())
                    .with_message(e.to_string());
                self.store.append_delivery_attempt(entry).await?;

                match category {
                    DeliveryCategory::Permanent => error!(
                        send_id = %record.send_id,
                        attempt,
                        code = ?e.code(),
                        %category,
                        error = %e,
                        "Delivery attempt failed permanently"
                    ),
                    _ => warn!(
                        send_id = %record.send_id,
                        attempt,
                        code = ?e.code(),
                        %category,
                        error = %e,
                        "Delivery attempt failed"
                    ),
                }

                self.fail(record, category, e.to_string(), phase).await
            }
        }
    }

    /// Moves a failed `dispatching` record on: back to main, into the DLQ, or to `failed`.
    pub async fn fail(
        &self,
        record: OutboxRecord,
        category: DeliveryCategory,
        error: String,
        phase: Phase,
    ) -> Result<(), EmailServiceError> {
        let send_id = record.send_id;
        let attempt = record.attempt_count;

        if phase == Phase::Main
            && category == DeliveryCategory::Transient
            && attempt < self.policy.per_message_ceiling()
        {
            let Some(record) = self
                .try_transition(
                    send_id,
                    OutboxState::Dispatching,
                    OutboxState::Retrying,
                    StateUpdate::new().for_attempt(attempt).with_error(error),
                )
                .await?
            else {
                return Ok(());
            };

            let delay = self.policy.retry.backoff(attempt);
            let message = BrokerMessage::main(send_id, attempt + 1, record.correlation_id)
                .not_before(Utc::now() + delay);
            self.publish(Topic::Main, &message).await?;

            info!(
                send_id = %send_id,
                attempt,
                delay_ms = delay.as_millis() as u64,
                "Retry scheduled on main topic"
            );
            return Ok(());
        }

        let Some(record) = self
            .try_transition(
                send_id,
                OutboxState::Dispatching,
                OutboxState::Dlq,
                StateUpdate::new().for_attempt(attempt).with_error(error),
            )
            .await?
        else {
            return Ok(());
        };

        if record.dlq_attempt_count >= self.policy.dlq_ceiling() {
            return self.fail_terminally(record).await;
        }

        if phase == Phase::Main {
            warn!(send_id = %send_id, attempt, %category, "Moving record to DLQ");
        }

        self.publish_to_dlq(&record, category).await
    }

    /// `dlq -> failed`. The record stays for operator inspection.
    pub async fn fail_terminally(&self, record: OutboxRecord) -> Result<(), EmailServiceError> {
        let failed = self
            .try_transition(
                record.send_id,
                OutboxState::Dlq,
                OutboxState::Failed,
                StateUpdate::new()
                    .for_attempt(record.attempt_count)
                    .completed_at(Utc::now()),
            )
            .await?;

        if let Some(failed) = failed {
            error!(
                send_id = %failed.send_id,
                attempts = failed.attempt_count,
                dlq_attempts = failed.dlq_attempt_count,
                last_error = ?failed.last_error,
                "Delivery failed after exhausting the DLQ budget"
            );
        }
        Ok(())
    }

    /// Schedules the next DLQ attempt with DLQ backoff.
    pub async fn publish_to_dlq(
        &self,
        record: &OutboxRecord,
        category: DeliveryCategory,
    ) -> Result<(), EmailServiceError> {
        let next_dlq_attempt = record.dlq_attempt_count + 1;
        let delay = self.policy.dlq_retry.backoff(next_dlq_attempt);
        let message = BrokerMessage::dlq(
            record.send_id,
            record.attempt_count + 1,
            record.correlation_id.clone(),
            category,
        )
        .not_before(Utc::now() + delay);

        self.publish(Topic::Dlq, &message).await?;

        info!(
            send_id = %record.send_id,
            dlq_attempt = next_dlq_attempt,
            delay_ms = delay.as_millis() as u64,
            "DLQ attempt scheduled"
        );
        Ok(())
    }

    /// Publishes with bounded in-process retries.
    pub async fn publish(&self, topic: Topic, message: &BrokerMessage) -> Result<(), EmailServiceError> {
        retry_with_backoff(&self.policy.publish_retry, || self.broker.publish(topic, message))
            .await
            .map_err(|e| {
                error!(
                    send_id = %message.send_id,
                    %topic,
                    error = %e,
                    "Publish failed after retries"
                );
                EmailServiceError::broker(e)
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn phase_follows_dlq_attempts() {
        let mut record = OutboxRecord::queued(
            Uuid::new_v4(),
            crate::models::outbox::NewOutboxRecord {
                recipients: vec!["a@x.com".to_string()],
                cc: vec![],
                bcc: vec![],
                from_addr: "noreply@x.com".to_string(),
                subject: "s".to_string(),
                body: "b".to_string(),
                content_type: "text/plain".to_string(),
                attachments: vec![],
                idempotency_key: None,
                correlation_id: "c".to_string(),
                template_id: None,
            },
            Utc::now(),
        );

        record.attempt_count = 3;
        assert_eq!(Phase::of(&record), Phase::Main);

        record.dlq_attempt_count = 1;
        assert_eq!(Phase::of(&record), Phase::Dlq);
    }
}
