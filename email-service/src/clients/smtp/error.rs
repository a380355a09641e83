use std::{io, time::Duration};

use thiserror::Error;

use crate::models::status::DeliveryCategory;

/// Failure of one SMTP session.
#[derive(Error, Debug)]
pub enum SmtpError {
    #[error("connection failed: {0}")]
    Connect(#[source] io::Error),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("connection closed unexpectedly")]
    ConnectionClosed,

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("malformed SMTP response: {0}")]
    Protocol(String),

    #[error("{stage} timed out after {after:?}")]
    Timeout { stage: String, after: Duration },

    #[error("authentication failed: {code} {message}")]
    Auth { code: u16, message: String },

    #[error("invalid address '{0}'")]
    InvalidAddress(String),

    #[error("{code} {message}")]
    Rejected { code: u16, message: String },
}

impl SmtpError {
    /// SMTP reply code, when the relay produced one.
    pub fn code(&self) -> Option<u16> {
        match self {
            Self::Auth { code, .. } | Self::Rejected { code, .. } => Some(*code),
            _ => None,
        }
    }

    /// Sorts the failure of delivery attempt `attempt` (1-based).
    ///
    /// Timeouts stay transient up to `timeout_transient_attempts`; an
    /// authentication failure gets exactly one retry.
    pub fn classify(&self, attempt: u32, timeout_transient_attempts: u32) -> DeliveryCategory {
        match self {
            Self::Connect(_)
            | Self::Io(_)
            | Self::ConnectionClosed
            | Self::Tls(_)
            | Self::Protocol(_) => DeliveryCategory::Transient,
            Self::Timeout { .. } if attempt <= timeout_transient_attempts => {
                DeliveryCategory::Transient
            }
            Self::Timeout { .. } => DeliveryCategory::Permanent,
            Self::Auth { .. } if attempt <= 1 => DeliveryCategory::Transient,
            Self::Auth { .. } => DeliveryCategory::Permanent,
            Self::InvalidAddress(_) => DeliveryCategory::Permanent,
            Self::Rejected { code, .. } if (400..500).contains(code) => DeliveryCategory::Transient,
            Self::Rejected { .. } => DeliveryCategory::Permanent,
        }
    }
}
