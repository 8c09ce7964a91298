//! The boundary between the session layer and a database driver.
//!
//! [`Session`](crate::Session) and [`Query`](crate::Query) only talk to these
//! traits. [`PgPool`](crate::pg::PgPool) implements them over the wire
//! protocol; tests substitute an in-memory provider.

use async_trait::async_trait;

use crate::context::Context;
use crate::pg::{CommandTag, FieldDescription, Oid, PgResult, PgValue, TypeInfo};

/// Transaction isolation level.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum IsolationLevel {
    Serializable,
    RepeatableRead,
    #[default]
    ReadCommitted,
    ReadUncommitted,
}

impl IsolationLevel {
    pub fn as_sql(self) -> &'static str {
        match self {
            IsolationLevel::Serializable => "SERIALIZABLE",
            IsolationLevel::RepeatableRead => "REPEATABLE READ",
            IsolationLevel::ReadCommitted => "READ COMMITTED",
            IsolationLevel::ReadUncommitted => "READ UNCOMMITTED",
        }
    }
}

/// Transaction access mode.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum AccessMode {
    #[default]
    ReadWrite,
    ReadOnly,
}

impl AccessMode {
    pub fn as_sql(self) -> &'static str {
        match self {
            AccessMode::ReadWrite => "READ WRITE",
            AccessMode::ReadOnly => "READ ONLY",
        }
    }
}

/// Options for opening a physical transaction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TxOptions {
    pub isolation: IsolationLevel,
    pub access_mode: AccessMode,
}

impl TxOptions {
    pub fn new(isolation: IsolationLevel, access_mode: AccessMode) -> Self {
        Self {
            isolation,
            access_mode,
        }
    }

    /// The `BEGIN` statement opening a transaction with these options.
    pub fn begin_sql(&self) -> String {
        format!(
            "BEGIN ISOLATION LEVEL {} {}",
            self.isolation.as_sql(),
            self.access_mode.as_sql()
        )
    }
}

/// Pooled access to the database.
#[async_trait]
pub trait ConnectionProvider: Send + Sync {
    /// Acquire a connection and open a physical transaction on it.
    async fn begin(&self, ctx: &Context, options: TxOptions) -> PgResult<Box<dyn TxHandle>>;

    /// Run a statement on a pooled connection, returning its completion tag.
    async fn execute(&self, ctx: &Context, sql: &str) -> PgResult<CommandTag>;

    /// Run a query on a pooled connection, streaming its rows.
    ///
    /// The connection is held by the cursor until it is closed or exhausted.
    async fn query(&self, ctx: &Context, sql: &str) -> PgResult<Box<dyn RowCursor>>;

    /// Name of a wire type, if known.
    fn type_info(&self, oid: Oid) -> Option<TypeInfo>;
}

/// An open physical transaction bound to one connection.
#[async_trait]
pub trait TxHandle: Send + Sync {
    async fn execute(&self, ctx: &Context, sql: &str) -> PgResult<CommandTag>;

    /// Stream rows on the transaction's connection. The connection is busy
    /// until the cursor is closed or exhausted.
    async fn query(&self, ctx: &Context, sql: &str) -> PgResult<Box<dyn RowCursor>>;

    async fn commit(&self, ctx: &Context) -> PgResult<()>;

    async fn rollback(&self, ctx: &Context) -> PgResult<()>;

    /// Create a large object. `oid` 0 lets the server choose the identifier.
    async fn create_large_object(&self, ctx: &Context, oid: u32) -> PgResult<u32>;

    /// Replace the content of a large object with `data`.
    async fn write_large_object(&self, ctx: &Context, oid: u32, data: &[u8]) -> PgResult<()>;

    async fn read_large_object(&self, ctx: &Context, oid: u32) -> PgResult<Vec<u8>>;

    async fn unlink_large_object(&self, ctx: &Context, oid: u32) -> PgResult<()>;
}

/// Forward-only cursor over a result set.
#[async_trait]
pub trait RowCursor: Send {
    /// Advance to the next row. Returns false when the result is exhausted
    /// or an error occurred; errors are reported by [`close`](Self::close).
    async fn next(&mut self, ctx: &Context) -> bool;

    /// Release the cursor's connection and report any deferred error.
    async fn close(&mut self, ctx: &Context) -> PgResult<()>;

    /// Values of the current row; empty before the first `next`.
    fn values(&self) -> &[PgValue];

    fn columns(&self) -> &[FieldDescription];

    /// Completion tag, known once the result is exhausted or closed.
    fn command_tag(&self) -> Option<&CommandTag>;
}
