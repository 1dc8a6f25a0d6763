//! Per-request call context: deadline plus explicit cancellation.
//!
//! A context is cloned down through every suspension point (upstream
//! awaits, sandbox bridge, retry backoff) so that one cancel or one expired
//! deadline unwinds the whole request tree.

use std::future::Future;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;

use crate::error::{GatewayError, GatewayResult};

#[derive(Debug, Clone)]
pub struct CallContext {
    deadline: Option<Instant>,
    token: CancellationToken,
}

impl Default for CallContext {
    fn default() -> Self {
        Self::unbounded()
    }
}

impl CallContext {
    /// No deadline, cancellable.
    pub fn unbounded() -> Self {
        Self {
            deadline: None,
            token: CancellationToken::new(),
        }
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            deadline: Some(Instant::now() + timeout),
            token: CancellationToken::new(),
        }
    }

    /// Child context: inherits cancellation, tightens the deadline to the
    /// smaller of the parent's and the given timeout.
    pub fn child_with_timeout(&self, timeout: Duration) -> Self {
        let candidate = Instant::now() + timeout;
        let deadline = match self.deadline {
            Some(parent) => Some(parent.min(candidate)),
            None => Some(candidate),
        };
        Self {
            deadline,
            token: self.token.child_token(),
        }
    }

    pub fn child(&self) -> Self {
        Self {
            deadline: self.deadline,
            token: self.token.child_token(),
        }
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|d| d.saturating_duration_since(Instant::now()))
    }

    /// Fast-path check used before starting work.
    pub fn check(&self) -> GatewayResult<()> {
        if self.token.is_cancelled() {
            return Err(GatewayError::cancelled("request cancelled"));
        }
        if let Some(remaining) = self.remaining() {
            if remaining.is_zero() {
                return Err(GatewayError::timeout("deadline exceeded"));
            }
        }
        Ok(())
    }

    /// Run a future, racing it against cancellation and the deadline.
    pub async fn run<T, F>(&self, fut: F) -> GatewayResult<T>
    where
        F: Future<Output = GatewayResult<T>>,
    {
        self.check()?;
        match self.deadline {
            Some(deadline) => {
                tokio::select! {
                    _ = self.token.cancelled() => Err(GatewayError::cancelled("request cancelled")),
                    _ = tokio::time::sleep_until(deadline.into()) => {
                        Err(GatewayError::timeout("deadline exceeded"))
                    }
                    result = fut => result,
                }
            }
            None => {
                tokio::select! {
                    _ = self.token.cancelled() => Err(GatewayError::cancelled("request cancelled")),
                    result = fut => result,
                }
            }
        }
    }
}
