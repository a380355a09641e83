pub mod dispatch;
pub mod dlq;
pub mod sender;
pub mod sweeper;

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use futures_util::StreamExt;
use tokio::{sync::watch, task::JoinHandle, time::timeout};
use tracing::{Instrument, debug, error, info, info_span, warn};

use crate::{
    clients::broker::Broker,
    config::Config,
    error::EmailServiceError,
    models::{
        message::{BrokerMessage, Topic},
        retry::RetryConfig,
    },
};

pub use self::{
    dispatch::Dispatcher, dlq::DlqController, sender::SenderWorker, sweeper::OutboxSweeper,
};

/// Pause before a failed message is handed back, so an outage does not spin.
const REDELIVERY_PAUSE: Duration = Duration::from_millis(200);

/// Retry budgets and classification knobs shared by every worker.
#[derive(Debug, Clone)]
pub struct DeliveryPolicy {
    /// Main-topic ceiling and backoff.
    pub retry: RetryConfig,
    /// DLQ ceiling and backoff.
    pub dlq_retry: RetryConfig,
    /// Bounded in-process retries around broker publishes.
    pub publish_retry: RetryConfig,
    pub timeout_transient_attempts: u32,
}

impl DeliveryPolicy {
    pub fn from_config(config: &Config) -> Self {
        Self {
            retry: config.retry_config(),
            dlq_retry: config.dlq_retry_config(),
            publish_retry: config.publish_retry_config(),
            timeout_transient_attempts: config.smtp_timeout_transient_attempts,
        }
    }

    pub fn per_message_ceiling(&self) -> u32 {
        self.retry.max_attempts
    }

    pub fn dlq_ceiling(&self) -> u32 {
        self.dlq_retry.max_attempts
    }
}

/// Decides the fate of one broker message. `Ok` acks it, `Err` nacks it.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, message: &BrokerMessage) -> Result<(), EmailServiceError>;
}

/// Resolves once shutdown has been requested or the sender is gone.
pub async fn shutdown_requested(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}

/// Pulls from `topic` one message at a time until shutdown.
///
/// After shutdown is requested the in-flight message gets `grace` to finish;
/// past that it is abandoned and nacked.
pub async fn run_consumer(
    name: String,
    broker: Arc<dyn Broker>,
    topic: Topic,
    group: String,
    handler: Arc<dyn MessageHandler>,
    mut shutdown: watch::Receiver<bool>,
    grace: Duration,
) -> Result<(), EmailServiceError> {
    let mut deliveries = broker
        .subscribe(topic, &group)
        .await
        .map_err(EmailServiceError::broker)?;

    info!(worker = %name, %topic, %group, "Worker started");

    loop {
        let delivery = tokio::select! {
            biased;
            _ = shutdown_requested(&mut shutdown) => break,
            next = deliveries.next() => match next {
                Some(Ok(delivery)) => delivery,
                Some(Err(e)) => {
                    warn!(worker = %name, error = %e, "Broker delivery failed");
                    continue;
                }
                None => {
                    warn!(worker = %name, %topic, "Broker subscription closed");
                    break;
                }
            },
        };

        let message = delivery.message.clone();
        let span = info_span!(
            "handle_message",
            worker = %name,
            %topic,
            send_id = %message.send_id,
            correlation_id = %message.correlation_id,
        );

        let handling = handler.handle(&message).instrument(span);
        tokio::pin!(handling);

        let mut stopping = false;
        let outcome = tokio::select! {
            outcome = &mut handling => outcome,
            _ = shutdown_requested(&mut shutdown) => {
                stopping = true;
                info!(worker = %name, send_id = %message.send_id, "Shutdown requested, finishing in-flight message");
                match timeout(grace, &mut handling).await {
                    Ok(outcome) => outcome,
                    Err(_) => {
                        warn!(
                            worker = %name,
                            send_id = %message.send_id,
                            grace_seconds = grace.as_secs(),
                            "Grace period elapsed, abandoning in-flight message"
                        );
                        if let Err(e) = delivery.nack().await {
                            error!(worker = %name, error = %e, "Failed to nack abandoned message");
                        }
                        break;
                    }
                }
            }
        };

        match outcome {
            Ok(()) => {
                if let Err(e) = delivery.ack().await {
                    error!(worker = %name, send_id = %message.send_id, error = %e, "Failed to ack message");
                }
            }
            Err(e) => {
                warn!(
                    worker = %name,
                    send_id = %message.send_id,
                    error = %e,
                    "Message handling failed, returning it to the broker"
                );
                if !stopping {
                    tokio::time::sleep(REDELIVERY_PAUSE).await;
                }
                if let Err(e) = delivery.nack().await {
                    error!(worker = %name, send_id = %message.send_id, error = %e, "Failed to nack message");
                }
            }
        }

        if stopping {
            break;
        }
    }

    info!(worker = %name, "Worker stopped");
    Ok(())
}

/// Sender pool, DLQ controller and sweeper for one process.
pub fn spawn_workers(
    config: &Config,
    dispatcher: Arc<Dispatcher>,
    broker: Arc<dyn Broker>,
    shutdown: watch::Receiver<bool>,
) -> Vec<JoinHandle<Result<(), EmailServiceError>>> {
    let grace = config.shutdown_grace();
    let group = config.consumer_group.clone();
    let mut handles = Vec::with_capacity(config.worker_concurrency + 2);

    let sender: Arc<dyn MessageHandler> = Arc::new(SenderWorker::new(Arc::clone(&dispatcher)));
    for i in 0..config.worker_concurrency {
        handles.push(tokio::spawn(run_consumer(
            format!("sender-{}", i),
            Arc::clone(&broker),
            Topic::Main,
            group.clone(),
            Arc::clone(&sender),
            shutdown.clone(),
            grace,
        )));
    }

    let controller: Arc<dyn MessageHandler> = Arc::new(DlqController::new(Arc::clone(&dispatcher)));
    handles.push(tokio::spawn(run_consumer(
        "dlq-controller".to_string(),
        Arc::clone(&broker),
        Topic::Dlq,
        group,
        controller,
        shutdown.clone(),
        grace,
    )));

    let sweeper = OutboxSweeper::new(
        dispatcher,
        Duration::from_secs(config.sweeper_interval_seconds),
        Duration::from_secs(config.sweeper_stale_after_seconds),
        config.sweeper_batch_size,
    );
    handles.push(tokio::spawn(sweeper.run(shutdown)));

    debug!(workers = handles.len(), "Worker tasks spawned");
    handles
}
