use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const CONTENT_TYPE_HTML: &str = "text/html";
pub const CONTENT_TYPE_PLAIN: &str = "text/plain";

/// Body of `POST /emails`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SendEmailRequest {
    pub to: Vec<String>,

    #[serde(default)]
    pub cc: Vec<String>,

    #[serde(default)]
    pub bcc: Vec<String>,

    #[serde(default)]
    pub subject: Option<String>,

    #[serde(default)]
    pub body: Option<String>,

    #[serde(default)]
    pub content_type: Option<String>,

    #[serde(default)]
    pub template_id: Option<Uuid>,

    #[serde(default)]
    pub data: HashMap<String, String>,

    #[serde(default)]
    pub attachments: Vec<AttachmentPayload>,

    #[serde(default)]
    pub idempotency_key: Option<String>,
}

/// Attachment as it arrives over HTTP, content base64-encoded.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttachmentPayload {
    pub filename: String,
    pub content_type: String,
    pub content: String,
}

/// Decoded attachment carried on the outbox record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    pub filename: String,
    pub content_type: String,

    #[serde(with = "base64_bytes")]
    pub content: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendEmailResponse {
    pub send_id: Uuid,
}

mod base64_bytes {
    use base64::{Engine, engine::general_purpose::STANDARD};
    use serde::{Deserialize, Deserializer, Serializer, de::Error};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD.decode(encoded.as_bytes()).map_err(D::Error::custom)
    }
}
