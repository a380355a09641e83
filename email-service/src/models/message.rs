use std::fmt::{Display, Formatter, Result};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::status::DeliveryCategory;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Topic {
    Main,
    Dlq,
}

impl Display for Topic {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result {
        match self {
            Topic::Main => write!(f, "main"),
            Topic::Dlq => write!(f, "dlq"),
        }
    }
}

/// Pointer to an outbox record in transit. The broker never carries email content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BrokerMessage {
    pub send_id: Uuid,
    pub attempt: u32,

    #[serde(rename = "not_before_ts", with = "chrono::serde::ts_milliseconds")]
    pub not_before: DateTime<Utc>,

    pub topic: Topic,
    pub correlation_id: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub final_error_category: Option<DeliveryCategory>,
}

impl BrokerMessage {
    pub fn main(send_id: Uuid, attempt: u32, correlation_id: impl Into<String>) -> Self {
        Self {
            send_id,
            attempt,
            not_before: Utc::now(),
            topic: Topic::Main,
            correlation_id: correlation_id.into(),
            final_error_category: None,
        }
    }

    pub fn dlq(
        send_id: Uuid,
        attempt: u32,
        correlation_id: impl Into<String>,
        final_error_category: DeliveryCategory,
    ) -> Self {
        Self {
            send_id,
            attempt,
            not_before: Utc::now(),
            topic: Topic::Dlq,
            correlation_id: correlation_id.into(),
            final_error_category: Some(final_error_category),
        }
    }

    pub fn not_before(mut self, at: DateTime<Utc>) -> Self {
        self.not_before = at;
        self
    }

    /// Time left until the message may be processed, if any.
    pub fn remaining_delay(&self, now: DateTime<Utc>) -> Option<std::time::Duration> {
        (self.not_before - now).to_std().ok().filter(|d| !d.is_zero())
    }
}
