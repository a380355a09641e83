use std::{sync::Arc, time::Duration};

use chrono::Utc;
use tokio::{sync::watch, time::interval};
use tracing::{debug, error, info, warn};

use crate::{
    error::EmailServiceError,
    models::{
        delivery::DeliveryLogEntry,
        message::{BrokerMessage, Topic},
        outbox::OutboxRecord,
        status::{DeliveryCategory, OutboxState},
    },
    workers::{
        dispatch::{Dispatcher, Phase},
        shutdown_requested,
    },
};

pub const ABANDONED_DISPATCH: &str = "dispatch abandoned";

/// Restores progress for records whose broker message was lost or whose worker died.
pub struct OutboxSweeper {
    dispatcher: Arc<Dispatcher>,
    interval: Duration,
    stale_after: Duration,
    batch_size: u32,
}

/// What one sweep did.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
    pub republished: usize,
    pub recovered: usize,
    pub errors: usize,
}

impl OutboxSweeper {
    pub fn new(
        dispatcher: Arc<Dispatcher>,
        interval: Duration,
        stale_after: Duration,
        batch_size: u32,
    ) -> Self {
        Self {
            dispatcher,
            interval,
            stale_after,
            batch_size: batch_size.max(1),
        }
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> Result<(), EmailServiceError> {
        let mut ticker = interval(self.interval.max(Duration::from_millis(10)));
        // The first tick completes immediately; startup is not a reason to sweep.
        ticker.tick().await;

        info!(
            interval_seconds = self.interval.as_secs(),
            stale_after_seconds = self.stale_after.as_secs(),
            "Outbox sweeper started"
        );

        loop {
            tokio::select! {
                biased;
                _ = shutdown_requested(&mut shutdown) => break,
                _ = ticker.tick() => {
                    match self.sweep().await {
                        Ok(report) if report != SweepReport::default() => {
                            info!(
                                republished = report.republished,
                                recovered = report.recovered,
                                errors = report.errors,
                                "Outbox sweep finished"
                            );
                        }
                        Ok(_) => debug!("Outbox sweep found nothing stale"),
                        Err(e) => warn!(error = %e, "Outbox sweep failed"),
                    }
                }
            }
        }

        info!("Outbox sweeper stopped");
        Ok(())
    }

    /// One pass over the oldest stale records.
    pub async fn sweep(&self) -> Result<SweepReport, EmailServiceError> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(self.stale_after).unwrap_or(chrono::Duration::zero());

        let stale = self
            .dispatcher
            .store()
            .list_stale(cutoff, self.batch_size)
            .await?;

        let mut report = SweepReport::default();
        for record in stale {
            let send_id = record.send_id;
            let state = record.state;

            let result = match state {
                OutboxState::Dispatching => self.recover(record).await.map(|()| {
                    report.recovered += 1;
                }),
                _ => self.republish(record).await.map(|()| {
                    report.republished += 1;
                }),
            };

            if let Err(e) = result {
                report.errors += 1;
                error!(send_id = %send_id, %state, error = %e, "Failed to sweep stale record");
            }
        }

        Ok(report)
    }

    async fn republish(&self, record: OutboxRecord) -> Result<(), EmailServiceError> {
        let next_attempt = record.attempt_count + 1;

        let (topic, message) = match record.state {
            OutboxState::Queued | OutboxState::Retrying => (
                Topic::Main,
                BrokerMessage::main(record.send_id, next_attempt, record.correlation_id.clone()),
            ),
            OutboxState::Dlq | OutboxState::RetryingDlq => {
                let category = self
                    .dispatcher
                    .store()
                    .deliveries(record.send_id)
                    .await?
                    .last()
                    .map(|entry| entry.category)
                    .unwrap_or(DeliveryCategory::Transient);
                (
                    Topic::Dlq,
                    BrokerMessage::dlq(
                        record.send_id,
                        next_attempt,
                        record.correlation_id.clone(),
                        category,
                    ),
                )
            }
            OutboxState::Dispatching | OutboxState::Sent | OutboxState::Failed => return Ok(()),
        };

        self.dispatcher.publish(topic, &message).await?;

        info!(
            send_id = %record.send_id,
            state = %record.state,
            %topic,
            "Republished stale record"
        );
        Ok(())
    }

    /// Logs the abandoned attempt, then takes the failure path of its phase.
    async fn recover(&self, record: OutboxRecord) -> Result<(), EmailServiceError> {
        warn!(
            send_id = %record.send_id,
            attempt = record.attempt_count,
            updated_at = %record.updated_at,
            "Recovering abandoned dispatch"
        );

        let entry = DeliveryLogEntry::new(
            record.send_id,
            record.attempt_count,
            DeliveryCategory::Transient,
        )
        .with_message(ABANDONED_DISPATCH);
        self.dispatcher.store().append_delivery_attempt(entry).await?;

        let phase = Phase::of(&record);
        self.dispatcher
            .fail(
                record,
                DeliveryCategory::Transient,
                ABANDONED_DISPATCH.to_string(),
                phase,
            )
            .await
    }
}
