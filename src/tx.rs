//! Reentrant transactions.
//!
//! A [`Session`] owns at most one physical transaction. Nested `begin`s only
//! bump a counter, the matching `commit`s count it back down, and the physical
//! commit happens when it reaches zero. A rollback at any depth rolls back the
//! whole physical transaction.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::context::Context;
use crate::error::{Result, SessionError};
use crate::provider::{ConnectionProvider, TxHandle, TxOptions};

pub struct Session {
    provider: Arc<dyn ConnectionProvider>,
    ctx: Context,
    handle: Option<Box<dyn TxHandle>>,
    level: usize,
    /// Options the outermost `begin` used.
    options: Option<TxOptions>,
}

impl Session {
    pub fn new(provider: Arc<dyn ConnectionProvider>, ctx: Context) -> Self {
        Self {
            provider,
            ctx,
            handle: None,
            level: 0,
            options: None,
        }
    }

    /// Begin a read-committed, read-write transaction.
    pub async fn begin(&mut self) -> Result<()> {
        self.begin_with(TxOptions::default()).await
    }

    /// Begin a transaction, or join the one already open.
    ///
    /// A nested begin never reaches the database, so its options are ignored.
    pub async fn begin_with(&mut self, options: TxOptions) -> Result<()> {
        if self.level > 0 {
            if self.options != Some(options) {
                warn!(
                    level = self.level,
                    outer = ?self.options,
                    requested = ?options,
                    "nested begin with different options; keeping the outer transaction's"
                );
            }
            self.level += 1;
            debug!(level = self.level, "joined transaction");
            return Ok(());
        }

        let handle = self.provider.begin(&self.ctx, options).await?;
        self.handle = Some(handle);
        self.options = Some(options);
        self.level = 1;
        debug!(?options, "transaction started");
        Ok(())
    }

    /// Leave one nesting level; the outermost commit commits for real.
    pub async fn commit(&mut self) -> Result<()> {
        if self.level == 0 {
            return Err(SessionError::NoTransaction("commit"));
        }

        self.level -= 1;
        if self.level > 0 {
            debug!(level = self.level, "nested commit");
            return Ok(());
        }

        self.options = None;
        match self.handle.take() {
            Some(handle) => {
                let result = handle.commit(&self.ctx).await;
                debug!(ok = result.is_ok(), "transaction committed");
                result.map_err(SessionError::from)
            }
            None => Err(SessionError::NoTransaction("commit")),
        }
    }

    /// Roll back the physical transaction regardless of depth.
    pub async fn rollback(&mut self) -> Result<()> {
        if self.level == 0 {
            return Err(SessionError::NoTransaction("rollback"));
        }

        let depth = self.level;
        self.level = 0;
        self.options = None;
        match self.handle.take() {
            Some(handle) => {
                let result = handle.rollback(&self.ctx).await;
                debug!(depth, ok = result.is_ok(), "transaction rolled back");
                result.map_err(SessionError::from)
            }
            None => Err(SessionError::NoTransaction("rollback")),
        }
    }

    /// Nesting depth; 0 means no transaction.
    pub fn level(&self) -> usize {
        self.level
    }

    pub fn provider(&self) -> &Arc<dyn ConnectionProvider> {
        &self.provider
    }

    pub fn context(&self) -> &Context {
        &self.ctx
    }

    /// The open physical transaction, if any.
    pub fn handle(&self) -> Option<&dyn TxHandle> {
        self.handle.as_deref()
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("level", &self.level)
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pg::PgError;
    use crate::provider::{AccessMode, IsolationLevel};
    use crate::testing::MockProvider;

    fn session(mock: &Arc<MockProvider>) -> Session {
        Session::new(mock.clone(), Context::background())
    }

    #[tokio::test]
    async fn test_nested_commits_reach_database_once() {
        let mock = Arc::new(MockProvider::new());
        let mut s = session(&mock);

        for expected in 1..=3 {
            s.begin().await.unwrap();
            assert_eq!(s.level(), expected);
        }
        assert_eq!(mock.begins(), 1);

        s.commit().await.unwrap();
        s.commit().await.unwrap();
        assert_eq!(mock.commits(), 0);
        assert!(s.handle().is_some());

        s.commit().await.unwrap();
        assert_eq!(s.level(), 0);
        assert_eq!(mock.commits(), 1);
        assert!(s.handle().is_none());
    }

    #[tokio::test]
    async fn test_rollback_supersedes_nesting() {
        let mock = Arc::new(MockProvider::new());
        let mut s = session(&mock);

        s.begin().await.unwrap();
        s.begin().await.unwrap();
        s.begin().await.unwrap();
        s.rollback().await.unwrap();

        assert_eq!(s.level(), 0);
        assert_eq!(mock.rollbacks(), 1);
        assert!(s.handle().is_none());

        // outer scopes see the rollback
        assert!(s.commit().await.unwrap_err().is_no_transaction());
        assert!(s.rollback().await.unwrap_err().is_no_transaction());
    }

    #[tokio::test]
    async fn test_commit_and_rollback_without_transaction() {
        let mock = Arc::new(MockProvider::new());
        let mut s = session(&mock);

        let err = s.commit().await.unwrap_err();
        assert_eq!(err.to_string(), "no transaction to commit");
        let err = s.rollback().await.unwrap_err();
        assert_eq!(err.to_string(), "no transaction to rollback");
        assert_eq!(s.level(), 0);
        assert_eq!(mock.commits() + mock.rollbacks(), 0);
    }

    #[tokio::test]
    async fn test_begin_begin_rollback_commit() {
        let mock = Arc::new(MockProvider::new());
        let mut s = session(&mock);

        s.begin().await.unwrap();
        s.begin().await.unwrap();
        s.rollback().await.unwrap();
        let err = s.commit().await.unwrap_err();
        assert!(err.is_no_transaction());
    }

    #[tokio::test]
    async fn test_failed_begin_leaves_counter_at_zero() {
        let mock = Arc::new(MockProvider::new());
        mock.fail_next_begin(PgError::server("too many connections"));
        let mut s = session(&mock);

        let err = s.begin().await.unwrap_err();
        assert!(err.driver_error().is_some());
        assert_eq!(s.level(), 0);
        assert!(s.handle().is_none());

        s.begin().await.unwrap();
        assert_eq!(s.level(), 1);
    }

    #[tokio::test]
    async fn test_cancelled_begin_leaves_counter_at_zero() {
        let mock = Arc::new(MockProvider::new());
        let ctx = Context::background();
        let mut s = Session::new(mock.clone(), ctx.clone());
        ctx.cancel();

        let err = s.begin().await.unwrap_err();
        assert!(err.is_cancelled());
        assert_eq!(s.level(), 0);
        assert!(s.handle().is_none());
        assert_eq!(mock.begins(), 0);
    }

    #[tokio::test]
    async fn test_begin_passes_options_and_nested_options_are_ignored() {
        let mock = Arc::new(MockProvider::new());
        let mut s = session(&mock);
        let serializable = TxOptions::new(IsolationLevel::Serializable, AccessMode::ReadOnly);

        s.begin_with(serializable).await.unwrap();
        s.begin().await.unwrap();

        assert_eq!(mock.begin_options(), vec![serializable]);
        assert_eq!(s.level(), 2);
    }

    #[tokio::test]
    async fn test_commit_error_is_returned_and_handle_cleared() {
        let mock = Arc::new(MockProvider::new());
        mock.fail_next_commit(PgError::CommitRolledBack);
        let mut s = session(&mock);

        s.begin().await.unwrap();
        let err = s.commit().await.unwrap_err();
        assert!(matches!(
            err.driver_error(),
            Some(PgError::CommitRolledBack)
        ));
        assert_eq!(s.level(), 0);
        assert!(s.handle().is_none());
    }
}
