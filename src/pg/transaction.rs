//! Physical transactions and streaming row cursors over pooled connections.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{Mutex, MutexGuard, OwnedMutexGuard};
use tracing::{debug, warn};

use super::connection::{CommandTag, PgConnection, QueryStart, RowEvent};
use super::error::{PgError, PgResult};
use super::large_object;
use super::pool::{discard_if_aborted, PooledConnection};
use super::protocol::FieldDescription;
use super::types::PgValue;
use crate::context::Context;
use crate::provider::{RowCursor, TxHandle};

fn busy() -> PgError {
    PgError::Busy("the transaction's connection is held by an open cursor".to_string())
}

// ============================================================================
// Transaction
// ============================================================================

/// An open `BEGIN` block on one pooled connection.
///
/// Dropping it without commit or rollback discards the connection; the server
/// rolls the transaction back when the socket closes.
pub struct PgTransaction {
    conn: Arc<Mutex<PooledConnection>>,
}

impl PgTransaction {
    pub(crate) fn new(conn: PooledConnection) -> Self {
        Self {
            conn: Arc::new(Mutex::new(conn)),
        }
    }

    fn lock(&self) -> PgResult<MutexGuard<'_, PooledConnection>> {
        self.conn.try_lock().map_err(|_| busy())
    }
}

#[async_trait]
impl TxHandle for PgTransaction {
    async fn execute(&self, ctx: &Context, sql: &str) -> PgResult<CommandTag> {
        let mut guard = self.lock()?;
        let conn = guard.get()?;
        let result = ctx.run(conn.execute(sql)).await;
        discard_if_aborted(conn, &result);
        result
    }

    async fn query(&self, ctx: &Context, sql: &str) -> PgResult<Box<dyn RowCursor>> {
        let mut guard = Arc::clone(&self.conn).try_lock_owned().map_err(|_| busy())?;
        let conn = guard.get()?;
        let result = ctx.run(conn.start_query(sql)).await;
        discard_if_aborted(conn, &result);

        let rows = match result? {
            QueryStart::Rows(columns) => PgRows::streaming(RowsConn::Shared(guard), columns),
            QueryStart::Command(tag) => PgRows::completed(tag),
        };
        Ok(Box::new(rows))
    }

    async fn commit(&self, ctx: &Context) -> PgResult<()> {
        let mut guard = self.lock()?;
        let conn = guard.get()?;
        let result = ctx.run(conn.commit()).await;
        discard_if_aborted(conn, &result);
        if result.is_ok() {
            debug!("transaction committed");
        }
        result
    }

    async fn rollback(&self, ctx: &Context) -> PgResult<()> {
        let mut guard = self.lock()?;
        let conn = guard.get()?;
        let result = ctx.run(conn.rollback()).await;
        discard_if_aborted(conn, &result);
        if result.is_ok() {
            debug!("transaction rolled back");
        }
        result
    }

    async fn create_large_object(&self, ctx: &Context, oid: u32) -> PgResult<u32> {
        let mut guard = self.lock()?;
        let conn = guard.get()?;
        let result = ctx.run(large_object::create(conn, oid)).await;
        discard_if_aborted(conn, &result);
        result
    }

    async fn write_large_object(&self, ctx: &Context, oid: u32, data: &[u8]) -> PgResult<()> {
        let mut guard = self.lock()?;
        let conn = guard.get()?;
        let result = ctx.run(large_object::write_all(conn, oid, data)).await;
        discard_if_aborted(conn, &result);
        result
    }

    async fn read_large_object(&self, ctx: &Context, oid: u32) -> PgResult<Vec<u8>> {
        let mut guard = self.lock()?;
        let conn = guard.get()?;
        let result = ctx.run(large_object::read_all(conn, oid)).await;
        discard_if_aborted(conn, &result);
        result
    }

    async fn unlink_large_object(&self, ctx: &Context, oid: u32) -> PgResult<()> {
        let mut guard = self.lock()?;
        let conn = guard.get()?;
        let result = ctx.run(large_object::unlink(conn, oid)).await;
        discard_if_aborted(conn, &result);
        result
    }
}

// ============================================================================
// Row cursor
// ============================================================================

/// Where a cursor's connection comes from.
pub(crate) enum RowsConn {
    /// Checked out from the pool for this query alone
    Pooled(PooledConnection),
    /// Borrowed from an open transaction until the cursor is released
    Shared(OwnedMutexGuard<PooledConnection>),
}

impl RowsConn {
    fn get(&mut self) -> PgResult<&mut PgConnection> {
        match self {
            RowsConn::Pooled(conn) => conn.get(),
            RowsConn::Shared(guard) => guard.get(),
        }
    }
}

/// Streaming cursor over one result set.
///
/// The connection is released as soon as the result is exhausted or the
/// cursor is closed.
pub struct PgRows {
    conn: Option<RowsConn>,
    columns: Vec<FieldDescription>,
    current: Vec<PgValue>,
    tag: Option<CommandTag>,
    error: Option<PgError>,
}

impl PgRows {
    pub(crate) fn streaming(conn: RowsConn, columns: Vec<FieldDescription>) -> Self {
        Self {
            conn: Some(conn),
            columns,
            current: Vec::new(),
            tag: None,
            error: None,
        }
    }

    /// A cursor over a statement that returned no result set.
    pub(crate) fn completed(tag: CommandTag) -> Self {
        Self {
            conn: None,
            columns: Vec::new(),
            current: Vec::new(),
            tag: Some(tag),
            error: None,
        }
    }

    fn record(&mut self, error: PgError) {
        self.error.get_or_insert(error);
    }

    /// Read and discard the rest of the response.
    async fn drain(conn: &mut PgConnection) -> PgResult<Option<CommandTag>> {
        let mut tag = None;
        if conn.is_in_flight() {
            loop {
                match conn.next_row().await? {
                    RowEvent::Row(_) => {}
                    RowEvent::Done(t) => {
                        tag = Some(t);
                        break;
                    }
                }
            }
        }
        conn.finish().await?;
        Ok(tag)
    }
}

#[async_trait]
impl RowCursor for PgRows {
    async fn next(&mut self, ctx: &Context) -> bool {
        let Some(rows_conn) = self.conn.as_mut() else {
            return false;
        };
        let conn = match rows_conn.get() {
            Ok(conn) => conn,
            Err(e) => {
                self.conn = None;
                self.record(e);
                return false;
            }
        };

        let result = ctx.run(conn.next_row()).await;
        match result {
            Ok(RowEvent::Row(values)) => {
                self.current = values;
                true
            }
            Ok(RowEvent::Done(tag)) => {
                let finished = ctx.run(conn.finish()).await;
                discard_if_aborted(conn, &finished);
                if let Err(e) = finished {
                    self.error.get_or_insert(e);
                }
                self.tag = Some(tag);
                self.conn = None;
                false
            }
            Err(e) => {
                if conn.is_in_flight() && !e.is_cancellation() {
                    let _ = ctx.run(conn.finish()).await;
                }
                if conn.is_in_flight() {
                    conn.mark_broken();
                }
                self.error.get_or_insert(e);
                self.conn = None;
                false
            }
        }
    }

    async fn close(&mut self, ctx: &Context) -> PgResult<()> {
        if let Some(mut rows_conn) = self.conn.take() {
            match rows_conn.get() {
                Ok(conn) => {
                    let result = ctx.run(Self::drain(conn)).await;
                    if conn.is_in_flight() {
                        conn.mark_broken();
                    }
                    match result {
                        Ok(tag) => {
                            if self.tag.is_none() {
                                self.tag = tag;
                            }
                        }
                        Err(e) => self.record(e),
                    }
                }
                Err(e) => self.record(e),
            }
        }

        match self.error.take() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn values(&self) -> &[PgValue] {
        &self.current
    }

    fn columns(&self) -> &[FieldDescription] {
        &self.columns
    }

    fn command_tag(&self) -> Option<&CommandTag> {
        self.tag.as_ref()
    }
}

impl Drop for PgRows {
    fn drop(&mut self) {
        if let Some(mut rows_conn) = self.conn.take() {
            if let Ok(conn) = rows_conn.get() {
                if conn.is_in_flight() {
                    warn!("row cursor dropped before it was closed; discarding its connection");
                    conn.mark_broken();
                }
            }
        }
    }
}
