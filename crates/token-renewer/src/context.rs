//! Cancellable deadlines for provider and store calls.
//!
//! A [`CallContext`] is created once per evaluation and handed down to every
//! call it makes. Children derived with [`CallContext::child`] never outlive
//! their parent: their deadline is the earlier of the two and cancelling the
//! parent cancels them.

use core::future::Future;
use core::time::Duration;
use token_renewer_tonic_core::Error as RpcError;
use tokio::time::{Instant, sleep_until};
use tokio_util::sync::CancellationToken;

#[derive(Clone, Debug)]
pub struct CallContext {
    deadline: Instant,
    cancel: CancellationToken,
}

impl CallContext {
    /// A root context that expires `timeout` from now.
    pub fn with_timeout(timeout: Duration) -> Self {
        Self::with_deadline(Instant::now() + timeout, CancellationToken::new())
    }

    /// A root context bound to an existing cancellation token, typically the
    /// process shutdown token.
    pub const fn with_deadline(deadline: Instant, cancel: CancellationToken) -> Self {
        Self { deadline, cancel }
    }

    /// Derives a context bounded by both this one and `timeout`.
    pub fn child(&self, timeout: Duration) -> Self {
        let bound = Instant::now() + timeout;
        Self {
            deadline: self.deadline.min(bound),
            cancel: self.cancel.child_token(),
        }
    }

    pub const fn deadline(&self) -> Instant {
        self.deadline
    }

    /// Time left before the deadline, zero once it has passed.
    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.deadline
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Cancels this context and every child derived from it.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub const fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Drives `fut` until it completes, the deadline passes, or the context is
    /// cancelled. The future is dropped in the latter two cases.
    ///
    /// # Errors
    ///
    /// [`RpcError::Cancelled`] or [`RpcError::DeadlineExceeded`].
    pub async fn run<F>(&self, fut: F) -> Result<F::Output, RpcError>
    where
        F: Future,
    {
        tokio::select! {
            biased;
            () = self.cancel.cancelled() => Err(RpcError::Cancelled),
            () = sleep_until(self.deadline) => Err(RpcError::DeadlineExceeded),
            out = fut => Ok(out),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn child_never_outlives_parent() {
        let parent = CallContext::with_timeout(Duration::from_secs(5));
        let child = parent.child(Duration::from_secs(30));
        assert_eq!(child.deadline(), parent.deadline());

        let tighter = parent.child(Duration::from_secs(1));
        assert!(tighter.deadline() < parent.deadline());
    }

    #[tokio::test(start_paused = true)]
    async fn run_reports_deadline() {
        let ctx = CallContext::with_timeout(Duration::from_millis(50));
        let res = ctx.run(std::future::pending::<()>()).await;
        assert_eq!(res, Err(RpcError::DeadlineExceeded));
        assert!(ctx.is_expired());
    }

    #[tokio::test(start_paused = true)]
    async fn parent_cancel_reaches_children() {
        let parent = CallContext::with_timeout(Duration::from_secs(60));
        let child = parent.child(Duration::from_secs(30));
        parent.cancel();
        assert!(child.is_cancelled());
        assert_eq!(
            child.run(std::future::pending::<()>()).await,
            Err(RpcError::Cancelled)
        );
    }

    #[tokio::test]
    async fn run_returns_output() {
        let ctx = CallContext::with_timeout(Duration::from_secs(1));
        assert_eq!(ctx.run(async { 7 }).await, Ok(7));
    }
}
