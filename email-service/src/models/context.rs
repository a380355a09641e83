use std::time::Duration;

use tokio::time::Instant;
use uuid::Uuid;

/// Per-request values threaded explicitly through the pipeline.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub correlation_id: String,
    pub deadline: Option<Instant>,
}

impl RequestContext {
    pub fn new(correlation_id: impl Into<String>) -> Self {
        Self {
            correlation_id: correlation_id.into(),
            deadline: None,
        }
    }

    /// Context with a freshly generated correlation id.
    pub fn generate() -> Self {
        Self::new(Uuid::new_v4().to_string())
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.deadline = Some(Instant::now() + timeout);
        self
    }

    /// Time left before the deadline; `None` when no deadline is set.
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
    }
}
