//! In-memory [`ConnectionProvider`] for unit tests.
//!
//! Statements are answered from a script keyed by exact SQL text. Unscripted
//! statements succeed: commands with an `OK` tag and queries with no rows.
//! Every statement is recorded with the route it took.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::context::Context;
use crate::pg::{CommandTag, FieldDescription, Oid, PgError, PgResult, PgValue, TypeInfo, TypeRegistry};
use crate::provider::{ConnectionProvider, RowCursor, TxHandle, TxOptions};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    Pool,
    Tx,
}

#[derive(Clone)]
enum Script {
    Command(String),
    Rows {
        columns: Vec<FieldDescription>,
        rows: Vec<Vec<PgValue>>,
        close_error: Option<fn() -> PgError>,
    },
    Fail(fn() -> PgError),
}

#[derive(Default)]
struct MockState {
    scripts: Mutex<HashMap<String, Script>>,
    statements: Mutex<Vec<(Route, String)>>,
    begin_options: Mutex<Vec<TxOptions>>,
    begin_error: Mutex<Option<PgError>>,
    commit_error: Mutex<Option<PgError>>,
    commits: AtomicUsize,
    rollbacks: AtomicUsize,
    open_cursors: Arc<AtomicUsize>,
    large_objects: Mutex<HashMap<u32, Vec<u8>>>,
    next_oid: Mutex<u32>,
    types: TypeRegistry,
}

impl MockState {
    fn execute(&self, route: Route, ctx: &Context, sql: &str) -> PgResult<CommandTag> {
        ctx.check()?;
        self.statements.lock().push((route, sql.to_string()));
        match self.scripts.lock().get(sql).cloned() {
            Some(Script::Command(tag)) => Ok(CommandTag::new(tag)),
            Some(Script::Rows { rows, .. }) => Ok(CommandTag::new(format!("SELECT {}", rows.len()))),
            Some(Script::Fail(make)) => Err(make()),
            None => Ok(CommandTag::new("OK")),
        }
    }

    fn query(&self, route: Route, ctx: &Context, sql: &str) -> PgResult<Box<dyn RowCursor>> {
        ctx.check()?;
        self.statements.lock().push((route, sql.to_string()));
        let (columns, rows, close_error) = match self.scripts.lock().get(sql).cloned() {
            Some(Script::Rows {
                columns,
                rows,
                close_error,
            }) => (columns, rows, close_error),
            Some(Script::Fail(make)) => return Err(make()),
            Some(Script::Command(_)) | None => (Vec::new(), Vec::new(), None),
        };
        self.open_cursors.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MockCursor {
            total: rows.len(),
            columns,
            rows: rows.into(),
            current: Vec::new(),
            tag: None,
            error: None,
            close_error,
            open: Some(self.open_cursors.clone()),
        }))
    }
}

pub struct MockProvider {
    state: Arc<MockState>,
}

impl MockProvider {
    pub fn new() -> Self {
        let state = MockState {
            next_oid: Mutex::new(16384),
            ..MockState::default()
        };
        Self {
            state: Arc::new(state),
        }
    }

    /// Answer `sql` with a completion tag.
    pub fn on_exec(&self, sql: &str, tag: &str) {
        self.state
            .scripts
            .lock()
            .insert(sql.to_string(), Script::Command(tag.to_string()));
    }

    /// Answer `sql` with a result set tagged `SELECT <rows>`.
    pub fn on_query(&self, sql: &str, columns: Vec<FieldDescription>, rows: Vec<Vec<PgValue>>) {
        self.state.scripts.lock().insert(
            sql.to_string(),
            Script::Rows {
                columns,
                rows,
                close_error: None,
            },
        );
    }

    /// Like [`on_query`](Self::on_query), but closing the cursor fails.
    pub fn on_query_failing_at_close(
        &self,
        sql: &str,
        columns: Vec<FieldDescription>,
        rows: Vec<Vec<PgValue>>,
        error: fn() -> PgError,
    ) {
        self.state.scripts.lock().insert(
            sql.to_string(),
            Script::Rows {
                columns,
                rows,
                close_error: Some(error),
            },
        );
    }

    pub fn on_error(&self, sql: &str, error: fn() -> PgError) {
        self.state
            .scripts
            .lock()
            .insert(sql.to_string(), Script::Fail(error));
    }

    pub fn fail_next_begin(&self, error: PgError) {
        *self.state.begin_error.lock() = Some(error);
    }

    pub fn fail_next_commit(&self, error: PgError) {
        *self.state.commit_error.lock() = Some(error);
    }

    pub fn register_type(&self, oid: Oid, name: &str) {
        self.state.types.register(oid, name);
    }

    pub fn statements(&self) -> Vec<(Route, String)> {
        self.state.statements.lock().clone()
    }

    pub fn begins(&self) -> usize {
        self.state.begin_options.lock().len()
    }

    pub fn begin_options(&self) -> Vec<TxOptions> {
        self.state.begin_options.lock().clone()
    }

    pub fn commits(&self) -> usize {
        self.state.commits.load(Ordering::SeqCst)
    }

    pub fn rollbacks(&self) -> usize {
        self.state.rollbacks.load(Ordering::SeqCst)
    }

    /// Cursors handed out and not yet closed or dropped.
    pub fn open_cursors(&self) -> usize {
        self.state.open_cursors.load(Ordering::SeqCst)
    }

    pub fn large_object(&self, oid: u32) -> Option<Vec<u8>> {
        self.state.large_objects.lock().get(&oid).cloned()
    }
}

#[async_trait]
impl ConnectionProvider for MockProvider {
    async fn begin(&self, ctx: &Context, options: TxOptions) -> PgResult<Box<dyn TxHandle>> {
        ctx.check()?;
        if let Some(err) = self.state.begin_error.lock().take() {
            return Err(err);
        }
        self.state.begin_options.lock().push(options);
        Ok(Box::new(MockTx {
            state: self.state.clone(),
        }))
    }

    async fn execute(&self, ctx: &Context, sql: &str) -> PgResult<CommandTag> {
        self.state.execute(Route::Pool, ctx, sql)
    }

    async fn query(&self, ctx: &Context, sql: &str) -> PgResult<Box<dyn RowCursor>> {
        self.state.query(Route::Pool, ctx, sql)
    }

    fn type_info(&self, oid: Oid) -> Option<TypeInfo> {
        self.state.types.lookup(oid)
    }
}

struct MockTx {
    state: Arc<MockState>,
}

fn missing_object(oid: u32) -> PgError {
    PgError::server(format!("large object {} does not exist", oid))
}

#[async_trait]
impl TxHandle for MockTx {
    async fn execute(&self, ctx: &Context, sql: &str) -> PgResult<CommandTag> {
        self.state.execute(Route::Tx, ctx, sql)
    }

    async fn query(&self, ctx: &Context, sql: &str) -> PgResult<Box<dyn RowCursor>> {
        self.state.query(Route::Tx, ctx, sql)
    }

    async fn commit(&self, ctx: &Context) -> PgResult<()> {
        ctx.check()?;
        self.state.commits.fetch_add(1, Ordering::SeqCst);
        match self.state.commit_error.lock().take() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    async fn rollback(&self, ctx: &Context) -> PgResult<()> {
        ctx.check()?;
        self.state.rollbacks.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn create_large_object(&self, ctx: &Context, oid: u32) -> PgResult<u32> {
        ctx.check()?;
        let mut objects = self.state.large_objects.lock();
        let oid = if oid == 0 {
            let mut next = self.state.next_oid.lock();
            *next += 1;
            *next
        } else {
            oid
        };
        if objects.contains_key(&oid) {
            return Err(PgError::server(format!("large object {} already exists", oid)));
        }
        objects.insert(oid, Vec::new());
        Ok(oid)
    }

    async fn write_large_object(&self, ctx: &Context, oid: u32, data: &[u8]) -> PgResult<()> {
        ctx.check()?;
        match self.state.large_objects.lock().get_mut(&oid) {
            Some(content) => {
                *content = data.to_vec();
                Ok(())
            }
            None => Err(missing_object(oid)),
        }
    }

    async fn read_large_object(&self, ctx: &Context, oid: u32) -> PgResult<Vec<u8>> {
        ctx.check()?;
        self.state
            .large_objects
            .lock()
            .get(&oid)
            .cloned()
            .ok_or_else(|| missing_object(oid))
    }

    async fn unlink_large_object(&self, ctx: &Context, oid: u32) -> PgResult<()> {
        ctx.check()?;
        match self.state.large_objects.lock().remove(&oid) {
            Some(_) => Ok(()),
            None => Err(missing_object(oid)),
        }
    }
}

struct MockCursor {
    columns: Vec<FieldDescription>,
    rows: VecDeque<Vec<PgValue>>,
    total: usize,
    current: Vec<PgValue>,
    tag: Option<CommandTag>,
    error: Option<PgError>,
    close_error: Option<fn() -> PgError>,
    open: Option<Arc<AtomicUsize>>,
}

impl MockCursor {
    fn release(&mut self) {
        if let Some(open) = self.open.take() {
            open.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

#[async_trait]
impl RowCursor for MockCursor {
    async fn next(&mut self, ctx: &Context) -> bool {
        if self.tag.is_some() || self.error.is_some() {
            return false;
        }
        if let Err(err) = ctx.check() {
            self.error = Some(err);
            return false;
        }
        match self.rows.pop_front() {
            Some(row) => {
                self.current = row;
                true
            }
            None => {
                self.tag = Some(CommandTag::new(format!("SELECT {}", self.total)));
                false
            }
        }
    }

    async fn close(&mut self, _ctx: &Context) -> PgResult<()> {
        self.release();
        if self.tag.is_none() && self.error.is_none() {
            self.rows.clear();
            self.tag = Some(CommandTag::new(format!("SELECT {}", self.total)));
        }
        if let Some(err) = self.error.take() {
            return Err(err);
        }
        match self.close_error {
            Some(make) => Err(make()),
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

impl Drop for MockCursor {
    fn drop(&mut self) {
        self.release();
    }
}
