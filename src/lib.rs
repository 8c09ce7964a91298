//! pgsession - reentrant PostgreSQL sessions and typed result decoding.
//!
//! ```no_run
//! # async fn demo() -> pgsession::Result<()> {
//! use std::sync::Arc;
//! use pgsession::pg::{PgPool, PgPoolConfig};
//! use pgsession::{Context, Query, Session};
//!
//! let pool = Arc::new(PgPool::connect(PgPoolConfig::from_env()?).await?);
//! let mut session = Session::new(pool, Context::background());
//!
//! session.begin().await?;
//! let mut q = Query::with_session(&session);
//! if q.select_row("SELECT count(*) AS n FROM users").await? {
//!     println!("{} users", q.int64("n"));
//! }
//! drop(q);
//! session.commit().await?;
//! # Ok(())
//! # }
//! ```

pub mod bind;
pub mod context;
pub mod decode;
pub mod error;
pub mod lobj;
pub mod pg;
pub mod provider;
pub mod query;
pub mod tx;

#[cfg(test)]
mod testing;

pub use bind::{BindError, BindValue, BindValues, NamedBinder, TemplateBinder};
pub use context::Context;
pub use decode::DecodeError;
pub use error::{Result, SessionError};
pub use provider::{AccessMode, ConnectionProvider, IsolationLevel, RowCursor, TxHandle, TxOptions};
pub use query::Query;
pub use tx::Session;
