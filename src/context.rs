//! Cancellation and deadlines for driver calls.
//!
//! A [`Context`] is cheap to clone; clones share the cancellation flag, so
//! cancelling any clone aborts every call running under it.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::Instant;

use crate::pg::{PgError, PgResult};

#[derive(Debug, Default)]
struct CancelState {
    cancelled: AtomicBool,
    notify: Notify,
}

/// Execution context inherited by every driver call of a session or query.
#[derive(Debug, Clone, Default)]
pub struct Context {
    state: Arc<CancelState>,
    deadline: Option<Instant>,
}

impl Context {
    /// A context that is never cancelled and has no deadline.
    pub fn background() -> Self {
        Self::default()
    }

    /// A context whose calls fail with [`PgError::Timeout`] after `timeout`.
    pub fn with_timeout(timeout: Duration) -> Self {
        Self::background().child_with_deadline(Instant::now() + timeout)
    }

    /// A context that expires at `deadline`.
    pub fn with_deadline(deadline: Instant) -> Self {
        Self::background().child_with_deadline(deadline)
    }

    /// Same cancellation flag, tighter deadline.
    pub fn child_with_deadline(&self, deadline: Instant) -> Self {
        let deadline = match self.deadline {
            Some(existing) if existing < deadline => existing,
            _ => deadline,
        };
        Self {
            state: Arc::clone(&self.state),
            deadline: Some(deadline),
        }
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Cancel every call running under this context (and its clones).
    pub fn cancel(&self) {
        self.state.cancelled.store(true, Ordering::SeqCst);
        self.state.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.state.cancelled.load(Ordering::SeqCst)
    }

    /// Fail fast if the context is already cancelled or expired.
    pub fn check(&self) -> PgResult<()> {
        if self.is_cancelled() {
            return Err(PgError::Cancelled);
        }
        match self.deadline {
            Some(deadline) if Instant::now() >= deadline => Err(PgError::Timeout),
            _ => Ok(()),
        }
    }

    /// Drive `fut` to completion unless the context is cancelled or expires.
    ///
    /// An aborted future is dropped mid-flight; callers holding a connection
    /// must treat it as broken.
    pub async fn run<T, F>(&self, fut: F) -> PgResult<T>
    where
        F: Future<Output = PgResult<T>>,
    {
        self.check()?;

        let cancelled = async {
            loop {
                let notified = self.state.notify.notified();
                if self.is_cancelled() {
                    return;
                }
                notified.await;
            }
        };
        let expired = async {
            match self.deadline {
                Some(deadline) => tokio::time::sleep_until(deadline).await,
                None => std::future::pending::<()>().await,
            }
        };

        tokio::select! {
            result = fut => result,
            _ = cancelled => Err(PgError::Cancelled),
            _ = expired => Err(PgError::Timeout),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_background_runs_to_completion() {
        let ctx = Context::background();
        let value = ctx.run(async { Ok::<_, PgError>(7) }).await.unwrap();
        assert_eq!(value, 7);
    }

    #[tokio::test]
    async fn test_cancel_aborts_pending_call() {
        let ctx = Context::background();
        let canceller = ctx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            canceller.cancel();
        });

        let result = ctx
            .run(async {
                std::future::pending::<()>().await;
                Ok::<_, PgError>(())
            })
            .await;
        assert!(matches!(result, Err(PgError::Cancelled)));
        assert!(ctx.is_cancelled());
    }

    #[tokio::test]
    async fn test_deadline_expires() {
        let ctx = Context::with_timeout(Duration::from_millis(5));
        let result = ctx
            .run(async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok::<_, PgError>(())
            })
            .await;
        assert!(matches!(result, Err(PgError::Timeout)));
    }

    #[tokio::test]
    async fn test_already_cancelled_fails_fast() {
        let ctx = Context::background();
        ctx.cancel();
        assert!(matches!(ctx.check(), Err(PgError::Cancelled)));
        let result = ctx.run(async { Ok::<_, PgError>(1) }).await;
        assert!(matches!(result, Err(PgError::Cancelled)));
    }

    #[test]
    fn test_child_keeps_earlier_deadline() {
        let parent = Context::with_timeout(Duration::from_secs(1));
        let child = parent.child_with_deadline(Instant::now() + Duration::from_secs(60));
        assert_eq!(child.deadline(), parent.deadline());
    }
}
