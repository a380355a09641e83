use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tracing::{debug, info};

use crate::{
    error::EmailServiceError,
    models::{
        message::{BrokerMessage, Topic},
        outbox::{OutboxRecord, StateUpdate},
        status::OutboxState,
    },
    workers::{
        MessageHandler,
        dispatch::{Dispatcher, Phase},
    },
};

/// Consumes the DLQ topic and spends the DLQ budget at the slower cadence.
pub struct DlqController {
    dispatcher: Arc<Dispatcher>,
}

impl DlqController {
    pub fn new(dispatcher: Arc<Dispatcher>) -> Self {
        Self { dispatcher }
    }

    fn budget_spent(&self, record: &OutboxRecord) -> bool {
        record.dlq_attempt_count >= self.dispatcher.policy().dlq_ceiling()
    }

    /// `retrying_dlq -> dispatching`, then one attempt.
    async fn dispatch(&self, record: OutboxRecord) -> Result<(), EmailServiceError> {
        let claimed = self
            .dispatcher
            .try_transition(
                record.send_id,
                OutboxState::RetryingDlq,
                OutboxState::Dispatching,
                StateUpdate::new()
                    .with_attempt_count(record.attempt_count + 1)
                    .with_dlq_attempt_count(record.dlq_attempt_count + 1)
                    .dispatched_at(Utc::now()),
            )
            .await?;

        match claimed {
            Some(record) => self.dispatcher.attempt(record, Phase::Dlq).await,
            None => Ok(()),
        }
    }
}

#[async_trait]
impl MessageHandler for DlqController {
    async fn handle(&self, message: &BrokerMessage) -> Result<(), EmailServiceError> {
        let Some(record) = self.dispatcher.load(message.send_id).await? else {
            return Ok(());
        };

        match record.state {
            OutboxState::Dlq if self.budget_spent(&record) => {
                self.dispatcher.fail_terminally(record).await
            }
            OutboxState::Dlq => {
                if self.dispatcher.redelay_if_early(Topic::Dlq, message).await? {
                    return Ok(());
                }

                let Some(record) = self
                    .dispatcher
                    .try_transition(
                        record.send_id,
                        OutboxState::Dlq,
                        OutboxState::RetryingDlq,
                        StateUpdate::new(),
                    )
                    .await?
                else {
                    return Ok(());
                };

                info!(
                    send_id = %record.send_id,
                    dlq_attempt = record.dlq_attempt_count + 1,
                    final_error_category = ?message.final_error_category,
                    "Retrying from DLQ"
                );
                self.dispatch(record).await
            }
            // Left behind by a controller that stopped between the two transitions.
            OutboxState::RetryingDlq if self.budget_spent(&record) => {
                self.dispatcher
                    .try_transition(
                        record.send_id,
                        OutboxState::RetryingDlq,
                        OutboxState::Failed,
                        StateUpdate::new().completed_at(Utc::now()),
                    )
                    .await?;
                Ok(())
            }
            OutboxState::RetryingDlq => self.dispatch(record).await,
            state => {
                debug!(
                    send_id = %record.send_id,
                    %state,
                    "Record is not waiting in the DLQ, skipping"
                );
                Ok(())
            }
        }
    }
}
