use std::time::Duration;

use anyhow::{Error, Result, anyhow};
use async_trait::async_trait;
use chrono::Utc;
use futures_util::StreamExt;
use lapin::{
    BasicProperties, Channel, Connection, ConnectionProperties,
    acker::Acker,
    options::{
        BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions,
        BasicQosOptions, BasicRejectOptions, ConfirmSelectOptions, QueueDeclareOptions,
    },
    types::{AMQPValue, FieldTable},
};
use tracing::{info, warn};
use uuid::Uuid;

use crate::{
    clients::broker::{Acknowledge, Broker, Delivery, DeliveryStream},
    config::Config,
    models::message::{BrokerMessage, Topic},
};

/// Parking tiers for delayed messages, shortest first.
///
/// A delayed message waits in the longest tier not exceeding its remaining
/// delay. Every message in a tier queue shares the queue's TTL, so nothing
/// queued behind a long wait is held up by it. A message that comes back
/// with time still left is parked again for the remainder.
pub const DELAY_TIERS_MS: [u64; 14] = [
    100, 250, 500, 1_000, 2_000, 5_000, 10_000, 30_000, 60_000, 120_000, 300_000, 600_000,
    1_800_000, 3_600_000,
];

// Early arrivals within this margin are delivered rather than parked again.
const PARK_TOLERANCE: Duration = Duration::from_millis(50);

/// Tier for a message still `delay` away from its `not_before`.
pub fn delay_tier(delay: Duration) -> u64 {
    let delay_ms = delay.as_millis();
    DELAY_TIERS_MS
        .iter()
        .rev()
        .copied()
        .find(|tier| u128::from(*tier) <= delay_ms)
        .unwrap_or(DELAY_TIERS_MS[0])
}

/// RabbitMQ transport. Each topic is a durable queue. Delayed messages are
/// parked in `<topic>.delay.<ms>` tier queues that dead-letter back into the
/// topic queue. Publishes wait for the broker's confirm.
pub struct RabbitMqBroker {
    // Held so the connection outlives every channel opened from it.
    connection: Connection,
    publisher: Channel,
    main_queue: String,
    dlq_queue: String,
    prefetch_count: u16,
}

impl RabbitMqBroker {
    pub async fn connect(config: &Config) -> Result<Self, Error> {
        let connection = Self::dial(&config.broker_urls).await?;

        let publisher = connection
            .create_channel()
            .await
            .map_err(|e| anyhow!("RabbitMQ channel creation failed: {}", e))?;

        publisher
            .confirm_select(ConfirmSelectOptions::default())
            .await
            .map_err(|e| anyhow!("Failed to enable publisher confirms: {}", e))?;

        for queue in [&config.main_topic, &config.dlq_topic] {
            declare_topology(&publisher, queue).await?;
        }

        info!(
            main_queue = %config.main_topic,
            dlq_queue = %config.dlq_topic,
            "RabbitMQ topology declared"
        );

        Ok(Self {
            connection,
            publisher,
            main_queue: config.main_topic.clone(),
            dlq_queue: config.dlq_topic.clone(),
            prefetch_count: config.prefetch_count,
        })
    }

    /// Tries each broker in order and keeps the first that accepts.
    async fn dial(urls: &[String]) -> Result<Connection, Error> {
        let mut last_error = None;

        for (index, url) in urls.iter().enumerate() {
            info!(broker = index, "Connecting to RabbitMQ");

            match Connection::connect(url, ConnectionProperties::default()).await {
                Ok(connection) => {
                    info!(broker = index, "RabbitMQ connection established");
                    return Ok(connection);
                }
                Err(e) => {
                    warn!(broker = index, error = %e, "RabbitMQ broker unreachable");
                    last_error = Some(e);
                }
            }
        }

        Err(match last_error {
            Some(e) => anyhow!("Failed to connect to RabbitMQ: {}", e),
            None => anyhow!("No RabbitMQ brokers configured"),
        })
    }

    fn queue_name(&self, topic: Topic) -> &str {
        match topic {
            Topic::Main => &self.main_queue,
            Topic::Dlq => &self.dlq_queue,
        }
    }
}

/// Publishes to `queue`, or to its delay tier while `not_before` is ahead,
/// and waits for the broker to confirm.
async fn publish_confirmed(
    channel: &Channel,
    queue: &str,
    message: &BrokerMessage,
) -> Result<(), Error> {
    let payload = serde_json::to_vec(message)?;

    let properties = BasicProperties::default()
        .with_delivery_mode(2)
        .with_content_type("application/json".into())
        .with_message_id(message.send_id.to_string().into())
        .with_correlation_id(message.correlation_id.clone().into());

    let routing_key = match message.remaining_delay(Utc::now()) {
        Some(delay) => delay_queue_name(queue, delay_tier(delay)),
        None => queue.to_string(),
    };

    let confirmation = channel
        .basic_publish(
            "",
            &routing_key,
            BasicPublishOptions::default(),
            &payload,
            properties,
        )
        .await
        .map_err(|e| anyhow!("Failed to publish message to {}: {}", routing_key, e))?
        .await
        .map_err(|e| anyhow!("Publish to {} was not confirmed: {}", routing_key, e))?;

    if confirmation.is_nack() {
        return Err(anyhow!("Broker refused message for {}", routing_key));
    }

    Ok(())
}

pub fn delay_queue_name(queue: &str, tier_ms: u64) -> String {
    format!("{}.delay.{}", queue, tier_ms)
}

async fn declare_topology(channel: &Channel, queue: &str) -> Result<(), Error> {
    let durable = QueueDeclareOptions {
        durable: true,
        ..Default::default()
    };

    channel
        .queue_declare(queue, durable, FieldTable::default())
        .await
        .map_err(|e| anyhow!("Failed to declare queue {}: {}", queue, e))?;

    for tier_ms in DELAY_TIERS_MS {
        let mut delay_args = FieldTable::default();
        delay_args.insert(
            "x-dead-letter-exchange".into(),
            AMQPValue::LongString("".into()),
        );
        delay_args.insert(
            "x-dead-letter-routing-key".into(),
            AMQPValue::LongString(queue.into()),
        );
        delay_args.insert("x-message-ttl".into(), AMQPValue::LongLongInt(tier_ms as i64));

        let delay_queue = delay_queue_name(queue, tier_ms);
        channel
            .queue_declare(&delay_queue, durable, delay_args)
            .await
            .map_err(|e| anyhow!("Failed to declare delay queue {}: {}", delay_queue, e))?;
    }

    Ok(())
}

struct RabbitAcker {
    acker: Acker,
}

#[async_trait]
impl Acknowledge for RabbitAcker {
    async fn ack(&self) -> Result<(), Error> {
        self.acker
            .ack(BasicAckOptions::default())
            .await
            .map(|_| ())
            .map_err(|e| anyhow!("Failed to acknowledge message: {}", e))
    }

    async fn nack(&self) -> Result<(), Error> {
        self.acker
            .nack(BasicNackOptions {
                multiple: false,
                requeue: true,
            })
            .await
            .map(|_| ())
            .map_err(|e| anyhow!("Failed to nack message: {}", e))
    }
}

#[async_trait]
impl Broker for RabbitMqBroker {
    async fn publish(&self, topic: Topic, message: &BrokerMessage) -> Result<(), Error> {
        publish_confirmed(&self.publisher, self.queue_name(topic), message).await
    }

    async fn subscribe(&self, topic: Topic, group: &str) -> Result<DeliveryStream, Error> {
        let queue = self.queue_name(topic).to_string();

        let channel = self
            .connection
            .create_channel()
            .await
            .map_err(|e| anyhow!("RabbitMQ channel creation failed: {}", e))?;

        channel
            .basic_qos(self.prefetch_count, BasicQosOptions::default())
            .await
            .map_err(|e| anyhow!("Failed to set up QoS: {}", e))?;

        let consumer_tag = format!("{}-{}-{}", group, topic, Uuid::new_v4().simple());
        let consumer = channel
            .basic_consume(
                &queue,
                &consumer_tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| anyhow!("Failed to create consumer on {}: {}", queue, e))?;

        info!(%queue, %consumer_tag, "Consumer created for queue");

        let publisher = self.publisher.clone();
        let deliveries = consumer.filter_map(move |item| {
            // The stream owns the channel so it stays open while consuming.
            let _channel = &channel;
            let queue = queue.clone();
            let publisher = publisher.clone();

            async move {
                let delivery = match item {
                    Ok(delivery) => delivery,
                    Err(e) => return Some(Err(anyhow!("Consumer error on {}: {}", queue, e))),
                };

                match serde_json::from_slice::<BrokerMessage>(&delivery.data) {
                    Ok(message)
                        if message
                            .remaining_delay(Utc::now())
                            .is_some_and(|left| left > PARK_TOLERANCE) =>
                    {
                        let acker = RabbitAcker {
                            acker: delivery.acker,
                        };
                        let parked = publish_confirmed(&publisher, &queue, &message).await;
                        let settled = match parked {
                            Ok(()) => acker.ack().await,
                            Err(e) => {
                                warn!(
                                    %queue,
                                    send_id = %message.send_id,
                                    error = %e,
                                    "Failed to park early message"
                                );
                                acker.nack().await
                            }
                        };
                        if let Err(e) = settled {
                            warn!(
                                %queue,
                                send_id = %message.send_id,
                                error = %e,
                                "Failed to settle early message"
                            );
                        }
                        None
                    }
                    Ok(message) => Some(Ok(Delivery::new(
                        message,
                        Box::new(RabbitAcker {
                            acker: delivery.acker,
                        }),
                    ))),
                    Err(e) => {
                        warn!(
                            %queue,
                            delivery_tag = delivery.delivery_tag,
                            error = %e,
                            "Rejecting undecodable message"
                        );
                        if let Err(e) = delivery
                            .acker
                            .reject(BasicRejectOptions { requeue: false })
                            .await
                        {
                            warn!(%queue, error = %e, "Failed to reject poison message");
                        }
                        None
                    }
                }
            }
        });

        Ok(Box::pin(deliveries))
    }
}
