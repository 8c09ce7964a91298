//! Error types for sessions and queries.
//!
//! Driver failures are wrapped, state misuse gets its own variant, and
//! conversion failures are not errors at all: typed accessors panic.

use thiserror::Error;

use crate::bind::BindError;
use crate::pg::PgError;

#[derive(Error, Debug)]
pub enum SessionError {
    /// Commit or rollback without an open transaction.
    #[error("no transaction to {0}")]
    NoTransaction(&'static str),

    #[error("Database error: {0}")]
    DriverError(#[from] PgError),

    #[error("Bind error: {0}")]
    BindError(#[from] BindError),
}

impl SessionError {
    pub fn is_no_transaction(&self) -> bool {
        matches!(self, SessionError::NoTransaction(_))
    }

    /// True when the driver call was aborted by context cancellation or
    /// deadline expiry.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, SessionError::DriverError(e) if e.is_cancellation())
    }

    /// The wrapped driver error, if any.
    pub fn driver_error(&self) -> Option<&PgError> {
        match self {
            SessionError::DriverError(e) => Some(e),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, SessionError>;
