use std::pin::Pin;

use anyhow::{Error, Result};
use async_trait::async_trait;
use futures_util::Stream;

use crate::models::message::{BrokerMessage, Topic};

/// Settles one delivery with the broker.
#[async_trait]
pub trait Acknowledge: Send + Sync {
    async fn ack(&self) -> Result<(), Error>;

    /// Returns the message to the broker for redelivery.
    async fn nack(&self) -> Result<(), Error>;
}

/// A decoded message plus the handle that settles it.
pub struct Delivery {
    pub message: BrokerMessage,
    acker: Box<dyn Acknowledge>,
}

impl Delivery {
    pub fn new(message: BrokerMessage, acker: Box<dyn Acknowledge>) -> Self {
        Self { message, acker }
    }

    pub async fn ack(self) -> Result<(), Error> {
        self.acker.ack().await
    }

    pub async fn nack(self) -> Result<(), Error> {
        self.acker.nack().await
    }
}

pub type DeliveryStream = Pin<Box<dyn Stream<Item = Result<Delivery, Error>> + Send>>;

/// Transport for [`BrokerMessage`]s over the main and DLQ topics.
///
/// The send-id is the routing key. Messages whose `not_before` lies in the
/// future are held back by the broker until then.
#[async_trait]
pub trait Broker: Send + Sync {
    async fn publish(&self, topic: Topic, message: &BrokerMessage) -> Result<(), Error>;

    /// Joins `group` on `topic`. Every delivery must be acked or nacked.
    async fn subscribe(&self, topic: Topic, group: &str) -> Result<DeliveryStream, Error>;
}
