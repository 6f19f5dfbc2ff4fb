//! Call context: deadline plus cancellation.
//!
//! Every call takes a [`Context`]. Deriving a context (`with_timeout`,
//! `child`, ...) links cancellation downward: cancelling a parent cancels its
//! children, never the reverse. Deadlines only ever shrink.
//!
//! # Example
//!
//! ```ignore
//! let ctx = Context::background().with_timeout(Duration::from_secs(2));
//! let reply = echo.echo(&ctx, &EchoRequest { message: "hi".into() }).await?;
//! ```

use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::RpcError;

/// Deadline-bearing, cancellable context.
///
/// Cloning shares the same cancellation state.
#[derive(Debug, Clone)]
pub struct Context {
    deadline: Option<Instant>,
    token: CancellationToken,
}

impl Context {
    /// Root context: no deadline, never cancelled unless [`cancel`](Self::cancel) is called.
    pub fn background() -> Self {
        Self {
            deadline: None,
            token: CancellationToken::new(),
        }
    }

    /// Derived context whose deadline is at most `timeout` from now.
    ///
    /// A timeout too large for the clock adds no deadline.
    pub fn with_timeout(&self, timeout: Duration) -> Self {
        match Instant::now().checked_add(timeout) {
            Some(deadline) => self.with_deadline(deadline),
            None => self.child(),
        }
    }

    /// Derived context whose deadline is at most `deadline`.
    pub fn with_deadline(&self, deadline: Instant) -> Self {
        let deadline = match self.deadline {
            Some(parent) if parent < deadline => parent,
            _ => deadline,
        };
        Self {
            deadline: Some(deadline),
            token: self.token.child_token(),
        }
    }

    /// Derived context that can be cancelled independently of this one.
    pub fn child(&self) -> Self {
        Self {
            deadline: self.deadline,
            token: self.token.child_token(),
        }
    }

    /// Build a context from parts.
    pub(crate) fn from_parts(deadline: Option<Instant>, token: CancellationToken) -> Self {
        Self { deadline, token }
    }

    /// Cancel this context and everything derived from it.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// The deadline, if any.
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Time left before the deadline; `None` without a deadline.
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|d| d.saturating_duration_since(Instant::now()))
    }

    /// Whether [`cancel`](Self::cancel) was called here or on an ancestor.
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Resolves when cancelled. Ignores the deadline.
    pub async fn cancelled(&self) {
        self.token.cancelled().await
    }

    /// Why this context is done, or `None` if it is still live.
    ///
    /// Cancellation wins over an expired deadline.
    pub fn err(&self) -> Option<RpcError> {
        if self.token.is_cancelled() {
            return Some(RpcError::Cancelled);
        }
        match self.deadline {
            Some(d) if Instant::now() >= d => Some(RpcError::Timeout),
            _ => None,
        }
    }

    /// Resolves once the context is done, with the reason.
    pub async fn done(&self) -> RpcError {
        match self.deadline {
            Some(deadline) => {
                tokio::select! {
                    biased;
                    _ = self.token.cancelled() => RpcError::Cancelled,
                    _ = tokio::time::sleep_until(deadline) => RpcError::Timeout,
                }
            }
            None => {
                self.token.cancelled().await;
                RpcError::Cancelled
            }
        }
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::background()
    }
}
