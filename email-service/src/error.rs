use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use tracing::error;
use uuid::Uuid;

use crate::models::{response::ErrorBody, status::OutboxState};

#[derive(Debug, thiserror::Error)]
pub enum EmailServiceError {
    #[error("{0}")]
    Validation(String),

    #[error("invalid template: {0}")]
    InvalidTemplate(String),

    #[error("missing variable: {0}")]
    MissingVariable(String),

    #[error("{0} not found")]
    NotFound(String),

    #[error("record {send_id} is {actual}, expected {expected}")]
    ConflictingState {
        send_id: Uuid,
        expected: OutboxState,
        actual: OutboxState,
    },

    #[error("record {send_id} is on attempt {actual}, claim was for attempt {expected}")]
    StaleClaim {
        send_id: Uuid,
        expected: u32,
        actual: u32,
    },

    #[error("illegal transition {from} -> {to}")]
    IllegalTransition { from: OutboxState, to: OutboxState },

    #[error("store unavailable: {0}")]
    Store(anyhow::Error),

    #[error("broker unavailable: {0}")]
    Broker(anyhow::Error),
}

impl EmailServiceError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation(_) | Self::InvalidTemplate(_) | Self::MissingVariable(_) => {
                "VALIDATION"
            }
            Self::NotFound(_) => "NOT_FOUND",
            Self::ConflictingState { .. }
            | Self::StaleClaim { .. }
            | Self::IllegalTransition { .. } => "CONFLICT",
            Self::Store(_) => "STORE_UNAVAILABLE",
            Self::Broker(_) => "BROKER_UNAVAILABLE",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            Self::Validation(_) | Self::InvalidTemplate(_) | Self::MissingVariable(_) => {
                StatusCode::BAD_REQUEST
            }
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::ConflictingState { .. }
            | Self::StaleClaim { .. }
            | Self::IllegalTransition { .. } => StatusCode::CONFLICT,
            Self::Store(_) | Self::Broker(_) => StatusCode::SERVICE_UNAVAILABLE,
        }
    }

    pub fn store(error: impl Into<anyhow::Error>) -> Self {
        Self::Store(error.into())
    }

    pub fn broker(error: impl Into<anyhow::Error>) -> Self {
        Self::Broker(error.into())
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::ConflictingState { .. } | Self::StaleClaim { .. })
    }
}

impl IntoResponse for EmailServiceError {
    fn into_response(self) -> Response {
        let status = self.status();

        if status.is_server_error() {
            error!(error = %self, code = self.code(), "Request failed on a backing service");
        }

        let body = ErrorBody {
            code: self.code(),
            message: match &self {
                // Backing-service details stay in the logs.
                Self::Store(_) => "storage is temporarily unavailable".to_string(),
                Self::Broker(_) => "message broker is temporarily unavailable".to_string(),
                other => other.to_string(),
            },
        };

        (status, Json(body)).into_response()
    }
}
