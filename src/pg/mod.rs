//! PostgreSQL wire protocol driver.
//!
//! A small async client that:
//! - Speaks the v3 simple query protocol with text-format results
//! - Streams rows one at a time instead of buffering whole result sets
//! - Pools connections behind a semaphore
//!
//! Architecture:
//! - `protocol`: Low-level wire protocol encoding/decoding
//! - `connection`: Startup, authentication and the query state machine
//! - `types`: Type OIDs, the type registry and text-format decoding
//! - `pool`: Connection pool, the [`ConnectionProvider`](crate::ConnectionProvider) implementation
//! - `transaction`: Physical transactions and row cursors
//! - `large_object`: `lo_*` based large-object primitives

pub mod connection;
pub mod error;
pub mod large_object;
pub mod pool;
pub mod protocol;
pub mod scram;
pub mod transaction;
pub mod types;


pub use connection::{CommandTag, PgConfig, PgConnection, QueryResult};
pub use error::{PgError, PgResult};
pub use pool::{PgPool, PgPoolConfig, PooledConnection};
pub use protocol::{FieldDescription, Format, TransactionStatus};
pub use transaction::{PgRows, PgTransaction};
pub use types::{Oid, PgValue, TypeInfo, TypeRegistry};
