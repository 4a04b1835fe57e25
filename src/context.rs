//! Per-call deadline and cancellation.

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};

/// Deadline and cancellation token for one external call.
///
/// Every operation that talks to the agent or the broker takes a
/// `CallContext` and races its I/O against it, so a stuck peer never holds
/// the caller past the deadline.
#[derive(Debug, Clone, Default)]
pub struct CallContext {
    deadline: Option<(Instant, Duration)>,
    cancel: CancellationToken,
}

impl CallContext {
    /// No deadline, fresh cancellation token.
    pub fn new() -> Self {
        Self::default()
    }

    /// Deadline `timeout` from now.
    pub fn with_timeout(timeout: Duration) -> Self {
        Self::new().timeout(timeout)
    }

    /// Replaces the deadline with one `timeout` from now.
    #[must_use]
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.deadline = Some((Instant::now() + timeout, timeout));
        self
    }

    /// Uses `token` for cancellation.
    #[must_use]
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// Applies `timeout` only when no deadline was set by the caller.
    #[must_use]
    pub fn or_timeout(self, timeout: Duration) -> Self {
        if self.deadline.is_some() {
            self
        } else {
            self.timeout(timeout)
        }
    }

    /// The cancellation token observed by this context.
    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Time left before the deadline, if any.
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|(at, _)| at.saturating_duration_since(Instant::now()))
    }

    /// Runs `fut` until it completes, the deadline passes or the token is
    /// cancelled, whichever comes first.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Timeout`] or [`Error::Cancelled`] tagged with
    /// `operation`, or whatever `fut` itself returns.
    pub async fn run<T, F>(&self, operation: &'static str, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        let guarded = async {
            tokio::select! {
                biased;
                () = self.cancel.cancelled() => Err(Error::Cancelled { operation }),
                result = fut => result,
            }
        };

        match self.deadline {
            Some((at, budget)) => tokio::time::timeout_at(at, guarded)
                .await
                .unwrap_or(Err(Error::Timeout {
                    operation,
                    timeout: budget,
                })),
            None => guarded.await,
        }
    }
}
