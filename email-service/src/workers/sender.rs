use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tracing::{debug, info};

use crate::{
    error::EmailServiceError,
    models::{
        message::{BrokerMessage, Topic},
        outbox::StateUpdate,
        status::OutboxState,
    },
    workers::{
        MessageHandler,
        dispatch::{Dispatcher, Phase},
    },
};

/// Consumes the main topic: claims `queued`/`retrying` records and attempts them.
pub struct SenderWorker {
    dispatcher: Arc<Dispatcher>,
}

impl SenderWorker {
    pub fn new(dispatcher: Arc<Dispatcher>) -> Self {
        Self { dispatcher }
    }
}

#[async_trait]
impl MessageHandler for SenderWorker {
    async fn handle(&self, message: &BrokerMessage) -> Result<(), EmailServiceError> {
        let Some(record) = self.dispatcher.load(message.send_id).await? else {
            return Ok(());
        };

        if record.state.is_terminal() {
            info!(
                send_id = %record.send_id,
                state = %record.state,
                "Record already settled, skipping duplicate message"
            );
            return Ok(());
        }

        if !record.state.is_claimable_by_sender() {
            debug!(
                send_id = %record.send_id,
                state = %record.state,
                "Record is not claimable from the main topic, skipping"
            );
            return Ok(());
        }

        if self.dispatcher.redelay_if_early(Topic::Main, message).await? {
            return Ok(());
        }

        let claimed = self
            .dispatcher
            .try_transition(
                record.send_id,
                record.state,
                OutboxState::Dispatching,
                StateUpdate::new()
                    .with_attempt_count(record.attempt_count + 1)
                    .dispatched_at(Utc::now()),
            )
            .await?;

        match claimed {
            Some(record) => self.dispatcher.attempt(record, Phase::Main).await,
            None => Ok(()),
        }
    }
}
