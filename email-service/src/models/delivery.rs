use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::status::DeliveryCategory;

/// One row per SMTP attempt. Append-only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeliveryLogEntry {
    pub send_id: Uuid,
    pub attempt: u32,
    pub code: Option<u16>,
    pub category: DeliveryCategory,
    pub message: String,
    pub occurred_at: DateTime<Utc>,
}

impl DeliveryLogEntry {
    pub fn new(send_id: Uuid, attempt: u32, category: DeliveryCategory) -> Self {
        Self {
            send_id,
            attempt,
            code: None,
            category,
            message: String::new(),
            occurred_at: Utc::now(),
        }
    }

    pub fn with_code(mut self, code: Option<u16>) -> Self {
        self.code = code;
        self
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = message.into();
        self
    }
}
