//! Statement execution and typed field access.
//!
//! A [`Query`] runs one statement at a time, either on the pool or on the
//! open transaction of a [`Session`]. For selects it owns the row cursor until
//! it is closed or exhausted; closing keeps the last row and the column list,
//! so fields stay readable afterwards.
//!
//! Typed accessors such as [`Query::int`] panic when the column doesn't exist
//! or its value can't be converted. Use [`Query::value`] together with the
//! functions in [`decode`](crate::decode) to handle those cases.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{trace, warn};
use uuid::Uuid;

use crate::bind::{BindValues, NamedBinder, TemplateBinder};
use crate::context::Context;
use crate::decode::{self, DecodeResult};
use crate::error::{Result, SessionError};
use crate::pg::{CommandTag, FieldDescription, Oid, PgValue, TypeInfo};
use crate::provider::{ConnectionProvider, RowCursor};
use crate::tx::Session;

static NULL: PgValue = PgValue::Null;

/// What the latest execution produced.
enum Outcome {
    Idle,
    Command(CommandTag),
    Rows(Box<dyn RowCursor>),
    Closed(CommandTag),
}

pub struct Query<'s> {
    session: Option<&'s Session>,
    provider: Arc<dyn ConnectionProvider>,
    ctx: Context,
    binder: Arc<dyn TemplateBinder>,
    outcome: Outcome,
    /// Lowercased column name to position, built at select time.
    fields: HashMap<String, usize>,
    last_values: Vec<PgValue>,
    last_columns: Vec<FieldDescription>,
}

impl Query<'static> {
    /// A query running on pooled connections.
    pub fn new(provider: Arc<dyn ConnectionProvider>, ctx: Context) -> Self {
        Self::build(None, provider, ctx)
    }
}

impl<'s> Query<'s> {
    /// A query running inside `session`'s transaction when one is open, and
    /// on the pool otherwise.
    pub fn with_session(session: &'s Session) -> Self {
        Self::build(
            Some(session),
            session.provider().clone(),
            session.context().clone(),
        )
    }

    fn build(
        session: Option<&'s Session>,
        provider: Arc<dyn ConnectionProvider>,
        ctx: Context,
    ) -> Self {
        Self {
            session,
            provider,
            ctx,
            binder: Arc::new(NamedBinder),
            outcome: Outcome::Idle,
            fields: HashMap::new(),
            last_values: Vec::new(),
            last_columns: Vec::new(),
        }
    }

    /// Use another template binder for the `*_bind` methods.
    pub fn with_binder(mut self, binder: Arc<dyn TemplateBinder>) -> Self {
        self.binder = binder;
        self
    }

    pub fn context(&self) -> &Context {
        &self.ctx
    }

    pub fn session(&self) -> Option<&'s Session> {
        self.session
    }

    pub fn provider(&self) -> &Arc<dyn ConnectionProvider> {
        &self.provider
    }

    /// Forget the previous execution, closing its cursor if still open.
    async fn reset(&mut self) {
        if let Outcome::Rows(mut cursor) = std::mem::replace(&mut self.outcome, Outcome::Idle) {
            if let Err(err) = cursor.close(&self.ctx).await {
                warn!(error = %err, "previous result closed with an error");
            }
        }
        self.fields.clear();
        self.last_values.clear();
        self.last_columns.clear();
    }

    /// Run a command (insert, update, delete, DDL).
    pub async fn exec(&mut self, sql: &str) -> Result<()> {
        self.reset().await;
        trace!(sql, "exec");

        let tag = match self.session.and_then(Session::handle) {
            Some(tx) => tx.execute(&self.ctx, sql).await?,
            None => self.provider.execute(&self.ctx, sql).await?,
        };
        self.outcome = Outcome::Command(tag);
        Ok(())
    }

    /// Bind `template` and run it as a command.
    pub async fn exec_bind(&mut self, template: &str, values: &BindValues, key: &str) -> Result<()> {
        let sql = self.binder.bind(template, values, key)?;
        self.exec(&sql).await
    }

    /// Run a query; iterate its rows with [`next`](Self::next).
    pub async fn select(&mut self, sql: &str) -> Result<()> {
        self.reset().await;
        trace!(sql, "select");

        let cursor = match self.session.and_then(Session::handle) {
            Some(tx) => tx.query(&self.ctx, sql).await?,
            None => self.provider.query(&self.ctx, sql).await?,
        };
        for (index, column) in cursor.columns().iter().enumerate() {
            self.fields.insert(column.name.to_lowercase(), index);
        }
        self.outcome = Outcome::Rows(cursor);
        Ok(())
    }

    /// Bind `template` and run it as a query.
    pub async fn select_bind(&mut self, template: &str, values: &BindValues, key: &str) -> Result<()> {
        let sql = self.binder.bind(template, values, key)?;
        self.select(&sql).await
    }

    /// Select, read the first row and close. Returns whether a row was found.
    pub async fn select_row(&mut self, sql: &str) -> Result<bool> {
        self.select(sql).await?;
        self.first_row().await
    }

    pub async fn select_bind_row(
        &mut self,
        template: &str,
        values: &BindValues,
        key: &str,
    ) -> Result<bool> {
        self.select_bind(template, values, key).await?;
        self.first_row().await
    }

    async fn first_row(&mut self) -> Result<bool> {
        let found = self.next().await;
        self.close().await?;
        Ok(found)
    }

    /// Advance to the next row. False once exhausted, on error, or when no
    /// select is active; errors are reported by [`close`](Self::close).
    pub async fn next(&mut self) -> bool {
        match &mut self.outcome {
            Outcome::Rows(cursor) => cursor.next(&self.ctx).await,
            _ => false,
        }
    }

    /// Release the cursor, keeping the current row and the columns readable.
    ///
    /// Returns errors the driver only reports once the result is finished.
    pub async fn close(&mut self) -> Result<()> {
        if !matches!(self.outcome, Outcome::Rows(_)) {
            return Ok(());
        }
        let Outcome::Rows(mut cursor) = std::mem::replace(&mut self.outcome, Outcome::Idle) else {
            return Ok(());
        };

        self.last_values = cursor.values().to_vec();
        self.last_columns = cursor.columns().to_vec();
        let result = cursor.close(&self.ctx).await;
        self.outcome = Outcome::Closed(cursor.command_tag().cloned().unwrap_or_default());
        result.map_err(SessionError::from)
    }

    /// Rows touched by the last command, or returned by the last select.
    ///
    /// An open select is closed first, so [`next`](Self::next) stops working.
    pub async fn rows_affected(&mut self) -> u64 {
        if self.is_select() {
            if let Err(err) = self.close().await {
                warn!(error = %err, "result closed with an error while counting rows");
            }
        }
        match &self.outcome {
            Outcome::Command(tag) | Outcome::Closed(tag) => tag.rows_affected(),
            Outcome::Idle | Outcome::Rows(_) => 0,
        }
    }

    /// Completion tag of the last command or closed select.
    pub fn command_tag(&self) -> Option<&CommandTag> {
        match &self.outcome {
            Outcome::Command(tag) | Outcome::Closed(tag) => Some(tag),
            Outcome::Rows(cursor) => cursor.command_tag(),
            Outcome::Idle => None,
        }
    }

    /// True while a select cursor is open.
    pub fn is_select(&self) -> bool {
        matches!(self.outcome, Outcome::Rows(_))
    }

    pub fn is_command(&self) -> bool {
        matches!(self.outcome, Outcome::Command(_))
    }

    // ------------------------------------------------------------------
    // Introspection
    // ------------------------------------------------------------------

    pub fn fields(&self) -> &[FieldDescription] {
        match &self.outcome {
            Outcome::Rows(cursor) => cursor.columns(),
            _ => &self.last_columns,
        }
    }

    /// Values of the current row (or of the row current at close).
    pub fn values(&self) -> &[PgValue] {
        match &self.outcome {
            Outcome::Rows(cursor) => cursor.values(),
            _ => &self.last_values,
        }
    }

    fn index_of(&self, name: &str) -> Option<usize> {
        self.fields.get(&name.to_lowercase()).copied()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.index_of(name).is_some()
    }

    /// Column name, or `""` out of range.
    pub fn field_name(&self, index: usize) -> &str {
        self.fields().get(index).map_or("", |f| f.name.as_str())
    }

    fn known_type(&self, column: Option<&FieldDescription>) -> Option<TypeInfo> {
        column.and_then(|f| self.provider.type_info(f.type_oid))
    }

    /// Type of the column at `index`; `Oid(0)` when out of range or unknown.
    pub fn field_type_index(&self, index: usize) -> Oid {
        self.known_type(self.fields().get(index))
            .map_or(Oid(0), |t| t.oid)
    }

    pub fn field_type_name_index(&self, index: usize) -> String {
        self.known_type(self.fields().get(index))
            .map(|t| t.name)
            .unwrap_or_default()
    }

    pub fn field_type(&self, name: &str) -> Oid {
        self.index_of(name).map_or(Oid(0), |i| self.field_type_index(i))
    }

    pub fn field_type_name(&self, name: &str) -> String {
        self.index_of(name)
            .map(|i| self.field_type_name_index(i))
            .unwrap_or_default()
    }

    /// Raw value of a column; `None` for an unknown name.
    pub fn value(&self, name: &str) -> Option<&PgValue> {
        self.index_of(name).and_then(|i| self.values().get(i))
    }

    pub fn value_index(&self, index: usize) -> Option<&PgValue> {
        self.values().get(index)
    }

    /// # Panics
    ///
    /// If the column doesn't exist.
    pub fn is_null(&self, name: &str) -> bool {
        self.field(name).is_null()
    }

    // ------------------------------------------------------------------
    // Typed accessors
    // ------------------------------------------------------------------

    fn field(&self, name: &str) -> &PgValue {
        let index = self
            .index_of(name)
            .unwrap_or_else(|| panic!("can't find field {}", name));
        self.values().get(index).unwrap_or(&NULL)
    }

    fn convert<T>(&self, name: &str, convert: impl FnOnce(&PgValue) -> DecodeResult<T>) -> T {
        convert(self.field(name)).unwrap_or_else(|e| panic!("can't convert field {}: {}", name, e))
    }

    pub fn int(&self, name: &str) -> i32 {
        self.convert(name, decode::int)
    }

    pub fn int64(&self, name: &str) -> i64 {
        self.convert(name, decode::int64)
    }

    pub fn uint64(&self, name: &str) -> u64 {
        self.convert(name, decode::uint64)
    }

    pub fn bool(&self, name: &str) -> bool {
        self.convert(name, decode::bool)
    }

    pub fn float32(&self, name: &str) -> f32 {
        self.convert(name, decode::float32)
    }

    pub fn float64(&self, name: &str) -> f64 {
        self.convert(name, decode::float64)
    }

    pub fn time(&self, name: &str) -> DateTime<Utc> {
        self.convert(name, decode::time)
    }

    /// Only `time` columns convert; a column of unknown type yields zero.
    pub fn duration(&self, name: &str) -> chrono::Duration {
        let value = self.field(name);
        let declared = Some(self.field_type(name)).filter(|oid| *oid != Oid(0));
        decode::duration(value, declared)
            .unwrap_or_else(|e| panic!("can't convert field {}: {}", name, e))
    }

    pub fn bytes(&self, name: &str) -> Vec<u8> {
        self.convert(name, decode::bytes)
    }

    pub fn string(&self, name: &str) -> String {
        decode::string(self.field(name))
    }

    pub fn json(&self, name: &str) -> serde_json::Value {
        self.convert(name, decode::json)
    }

    pub fn uuid(&self, name: &str) -> Uuid {
        self.convert(name, decode::uuid)
    }

    pub fn string_array(&self, name: &str) -> Vec<String> {
        self.convert(name, decode::string_array)
    }

    pub fn time_array(&self, name: &str) -> Vec<DateTime<Utc>> {
        self.convert(name, decode::time_array)
    }

    pub fn int_array(&self, name: &str) -> Vec<i32> {
        self.convert(name, decode::int_array)
    }

    pub fn int_array64(&self, name: &str) -> Vec<i64> {
        self.convert(name, decode::int_array64)
    }
}

impl std::fmt::Debug for Query<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Query")
            .field("in_session", &self.session.is_some())
            .field("is_select", &self.is_select())
            .field("command_tag", &self.command_tag())
            .field("fields", &self.fields().len())
            .finish_non_exhaustive()
    }
}

// ============================================================================
// One-shot helpers
// ============================================================================

/// Run a query on the pool; the returned [`Query`] holds the open cursor.
pub async fn select(
    provider: Arc<dyn ConnectionProvider>,
    ctx: Context,
    sql: &str,
) -> Result<Query<'static>> {
    let mut q = Query::new(provider, ctx);
    q.select(sql).await?;
    Ok(q)
}

/// Run a query on the pool and read its first row; `None` when empty.
pub async fn select_row(
    provider: Arc<dyn ConnectionProvider>,
    ctx: Context,
    sql: &str,
) -> Result<Option<Query<'static>>> {
    let mut q = Query::new(provider, ctx);
    Ok(q.select_row(sql).await?.then_some(q))
}

pub async fn select_tx<'s>(session: &'s Session, sql: &str) -> Result<Query<'s>> {
    let mut q = Query::with_session(session);
    q.select(sql).await?;
    Ok(q)
}

pub async fn select_tx_row<'s>(session: &'s Session, sql: &str) -> Result<Option<Query<'s>>> {
    let mut q = Query::with_session(session);
    Ok(q.select_row(sql).await?.then_some(q))
}

/// Run a command on the pool; the returned [`Query`] carries its tag.
pub async fn exec(
    provider: Arc<dyn ConnectionProvider>,
    ctx: Context,
    sql: &str,
) -> Result<Query<'static>> {
    let mut q = Query::new(provider, ctx);
    q.exec(sql).await?;
    Ok(q)
}

pub async fn exec_tx(session: &Session, sql: &str) -> Result<()> {
    Query::with_session(session).exec(sql).await
}
