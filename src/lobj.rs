//! Large objects stored through a session's transaction.
//!
//! Large-object descriptors only live as long as the transaction that opened
//! them, so every call needs an open transaction on the session.

use tracing::debug;

use crate::error::{Result, SessionError};
use crate::provider::TxHandle;
use crate::tx::Session;

fn handle<'a>(session: &'a Session, operation: &'static str) -> Result<&'a dyn TxHandle> {
    session
        .handle()
        .ok_or(SessionError::NoTransaction(operation))
}

/// Write `data` to large object `oid`, creating a new object when `oid` is 0.
///
/// An existing object ends up holding exactly `data`. Returns the object's oid.
pub async fn save_large_object(session: &Session, oid: u32, data: &[u8]) -> Result<u32> {
    let tx = handle(session, "save large object")?;
    let ctx = session.context();

    let oid = if oid == 0 {
        tx.create_large_object(ctx, 0).await?
    } else {
        oid
    };
    tx.write_large_object(ctx, oid, data).await?;
    debug!(oid, bytes = data.len(), "large object saved");
    Ok(oid)
}

pub async fn load_large_object(session: &Session, oid: u32) -> Result<Vec<u8>> {
    let tx = handle(session, "load large object")?;
    let data = tx.read_large_object(session.context(), oid).await?;
    debug!(oid, bytes = data.len(), "large object loaded");
    Ok(data)
}

pub async fn remove_large_object(session: &Session, oid: u32) -> Result<()> {
    let tx = handle(session, "remove large object")?;
    tx.unlink_large_object(session.context(), oid).await?;
    debug!(oid, "large object removed");
    Ok(())
}
