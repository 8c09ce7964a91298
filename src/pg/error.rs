//! Error types for the PostgreSQL driver.

use std::fmt;
use std::io;

/// Result type for PostgreSQL operations.
pub type PgResult<T> = Result<T, PgError>;

/// Errors that can occur during PostgreSQL operations.
#[derive(Debug)]
pub enum PgError {
    /// I/O error during communication.
    Io(io::Error),

    /// Protocol error (unexpected message, invalid format, etc.).
    Protocol(String),

    /// Authentication failed.
    Auth(String),

    /// Invalid or missing configuration.
    Config(String),

    /// Server returned an error.
    Server {
        severity: String,
        code: String,
        message: String,
        detail: Option<String>,
        hint: Option<String>,
    },

    /// A value could not be decoded from its wire representation.
    Type(String),

    /// Connection is closed or in invalid state.
    ConnectionClosed,

    /// The pool was shut down while waiting for a connection.
    PoolClosed,

    /// The connection is held by an open row cursor.
    Busy(String),

    /// COMMIT was answered with ROLLBACK because the transaction had failed.
    CommitRolledBack,

    /// The execution context was cancelled.
    Cancelled,

    /// The execution context deadline passed.
    Timeout,
}

impl PgError {
    /// Build a server error carrying only a message (SQLSTATE left empty).
    pub fn server(message: impl Into<String>) -> Self {
        PgError::Server {
            severity: "ERROR".to_string(),
            code: String::new(),
            message: message.into(),
            detail: None,
            hint: None,
        }
    }

    /// True for errors produced by context cancellation or deadline expiry.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, PgError::Cancelled | PgError::Timeout)
    }

    /// SQLSTATE code of a server error.
    pub fn code(&self) -> Option<&str> {
        match self {
            PgError::Server { code, .. } if !code.is_empty() => Some(code),
            _ => None,
        }
    }
}

impl fmt::Display for PgError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PgError::Io(e) => write!(f, "I/O error: {}", e),
            PgError::Protocol(msg) => write!(f, "Protocol error: {}", msg),
            PgError::Auth(msg) => write!(f, "Authentication failed: {}", msg),
            PgError::Config(msg) => write!(f, "Configuration error: {}", msg),
            PgError::Server {
                severity,
                code,
                message,
                detail,
                hint,
            } => {
                write!(f, "{}: {} ({})", severity, message, code)?;
                if let Some(d) = detail {
                    write!(f, "\nDetail: {}", d)?;
                }
                if let Some(h) = hint {
                    write!(f, "\nHint: {}", h)?;
                }
                Ok(())
            }
            PgError::Type(msg) => write!(f, "Type error: {}", msg),
            PgError::ConnectionClosed => write!(f, "Connection is closed"),
            PgError::PoolClosed => write!(f, "Pool is closed"),
            PgError::Busy(msg) => write!(f, "Connection is busy: {}", msg),
            PgError::CommitRolledBack => {
                write!(f, "Commit failed: the transaction was rolled back")
            }
            PgError::Cancelled => write!(f, "Operation cancelled"),
            PgError::Timeout => write!(f, "Operation timed out"),
        }
    }
}

impl std::error::Error for PgError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            PgError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for PgError {
    fn from(e: io::Error) -> Self {
        PgError::Io(e)
    }
}
