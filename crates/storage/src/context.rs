//! Per-request deadline and cancellation.

use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;

use crate::error::{Result, StorageError};

/// Deadline and cancellation state for one engine call.
///
/// Long-running operations call [`RequestContext::check`] at each blocking
/// step and stop as soon as it fails.
#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    deadline: Option<Instant>,
    token: Option<CancellationToken>,
}

impl RequestContext {
    /// A context that never expires.
    pub fn unbounded() -> Self {
        Self::default()
    }

    /// A context expiring `timeout` from now.
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            deadline: Instant::now().checked_add(timeout),
            token: None,
        }
    }

    /// Set an absolute deadline.
    pub fn deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Attach a cancellation token.
    pub fn cancellation(mut self, token: CancellationToken) -> Self {
        self.token = Some(token);
        self
    }

    /// Time left before the deadline, `None` when unbounded.
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|d| d.saturating_duration_since(Instant::now()))
    }

    /// Fail if the request was cancelled or its deadline passed.
    pub fn check(&self) -> Result<()> {
        if self.token.as_ref().is_some_and(|t| t.is_cancelled()) {
            return Err(StorageError::Cancelled);
        }
        if self.deadline.is_some_and(|d| Instant::now() >= d) {
            return Err(StorageError::DeadlineExceeded);
        }
        Ok(())
    }
}
