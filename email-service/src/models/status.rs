use std::{
    fmt::{Display, Formatter, Result},
    str::FromStr,
};

use serde::{Deserialize, Serialize};

/// Lifecycle of an outbox record.
///
/// ```text
/// queued ──► dispatching ──► sent
///               ├─► retrying ──► dispatching
///               └─► dlq ──► retrying_dlq ──► dispatching
///                                  └─► failed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutboxState {
    Queued,
    Dispatching,
    Sent,
    Retrying,
    Dlq,
    RetryingDlq,
    Failed,
}

impl OutboxState {
    pub const ALL: [OutboxState; 7] = [
        OutboxState::Queued,
        OutboxState::Dispatching,
        OutboxState::Sent,
        OutboxState::Retrying,
        OutboxState::Dlq,
        OutboxState::RetryingDlq,
        OutboxState::Failed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            OutboxState::Queued => "queued",
            OutboxState::Dispatching => "dispatching",
            OutboxState::Sent => "sent",
            OutboxState::Retrying => "retrying",
            OutboxState::Dlq => "dlq",
            OutboxState::RetryingDlq => "retrying_dlq",
            OutboxState::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, OutboxState::Sent | OutboxState::Failed)
    }

    /// States a sender worker may claim into `dispatching` from.
    pub fn is_claimable_by_sender(&self) -> bool {
        matches!(self, OutboxState::Queued | OutboxState::Retrying)
    }

    pub fn can_transition_to(&self, next: OutboxState) -> bool {
        use OutboxState::*;

        matches!(
            (self, next),
            (Queued, Dispatching)
                | (Retrying, Dispatching)
                | (RetryingDlq, Dispatching)
                | (Dispatching, Sent)
                | (Dispatching, Retrying)
                | (Dispatching, Dlq)
                | (Dlq, RetryingDlq)
                | (Dlq, Failed)
                | (RetryingDlq, Failed)
        )
    }
}

impl Display for OutboxState {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for OutboxState {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        OutboxState::ALL
            .into_iter()
            .find(|state| state.as_str() == s)
            .ok_or_else(|| format!("unknown outbox state '{}'", s))
    }
}

/// Outcome category recorded for every delivery attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryCategory {
    Success,
    Transient,
    Permanent,
}

impl DeliveryCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryCategory::Success => "success",
            DeliveryCategory::Transient => "transient",
            DeliveryCategory::Permanent => "permanent",
        }
    }
}

impl Display for DeliveryCategory {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for DeliveryCategory {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "success" => Ok(DeliveryCategory::Success),
            "transient" => Ok(DeliveryCategory::Transient),
            "permanent" => Ok(DeliveryCategory::Permanent),
            other => Err(format!("unknown delivery category '{}'", other)),
        }
    }
}
