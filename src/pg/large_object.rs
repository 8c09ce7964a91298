//! Large-object primitives built on the server-side `lo_*` functions.
//!
//! Every call must run inside a transaction block: large-object descriptors
//! are only valid until the end of the transaction that opened them.

use super::connection::PgConnection;
use super::error::{PgError, PgResult};
use super::types::{encode_hex, PgValue};

/// Open mode flags from `libpq/libpq-fs.h`
pub const INV_WRITE: i32 = 0x0002_0000;
pub const INV_READ: i32 = 0x0004_0000;

/// Bytes sent per `lowrite` call and requested per `loread` call.
const CHUNK_SIZE: usize = 64 * 1024;

/// Run a single-value query and return that value.
async fn scalar(conn: &mut PgConnection, sql: &str) -> PgResult<PgValue> {
    conn.simple_query(sql)
        .await?
        .into_iter()
        .next()
        .and_then(|result| result.rows.into_iter().next())
        .and_then(|row| row.into_iter().next())
        .ok_or_else(|| PgError::Protocol(format!("no value returned by: {}", sql)))
}

fn as_i64(value: PgValue, function: &str) -> PgResult<i64> {
    match value {
        PgValue::Oid(v) => Ok(v as i64),
        PgValue::Int4(v) => Ok(v as i64),
        PgValue::Int8(v) => Ok(v),
        other => Err(PgError::Type(format!(
            "{} returned {} instead of an integer",
            function,
            other.kind()
        ))),
    }
}

/// Create a large object; `oid` 0 lets the server assign one.
pub async fn create(conn: &mut PgConnection, oid: u32) -> PgResult<u32> {
    let value = scalar(conn, &format!("SELECT lo_create({})", oid)).await?;
    let created = as_i64(value, "lo_create")?;
    u32::try_from(created).map_err(|_| PgError::Type(format!("invalid oid {}", created)))
}

/// Open a large object, returning its descriptor.
pub async fn open(conn: &mut PgConnection, oid: u32, mode: i32) -> PgResult<i32> {
    let value = scalar(conn, &format!("SELECT lo_open({}, {})", oid, mode)).await?;
    let fd = as_i64(value, "lo_open")?;
    i32::try_from(fd).map_err(|_| PgError::Type(format!("invalid descriptor {}", fd)))
}

pub async fn close(conn: &mut PgConnection, fd: i32) -> PgResult<()> {
    scalar(conn, &format!("SELECT lo_close({})", fd)).await?;
    Ok(())
}

/// Overwrite the object with `data` and truncate it to `data.len()`.
pub async fn write_all(conn: &mut PgConnection, oid: u32, data: &[u8]) -> PgResult<()> {
    let fd = open(conn, oid, INV_WRITE).await?;

    for chunk in data.chunks(CHUNK_SIZE) {
        let sql = format!("SELECT lowrite({}, decode('{}', 'hex'))", fd, encode_hex(chunk));
        let written = as_i64(scalar(conn, &sql).await?, "lowrite")?;
        if written != chunk.len() as i64 {
            return Err(PgError::Protocol(format!(
                "short large object write: {} of {} bytes",
                written,
                chunk.len()
            )));
        }
    }

    scalar(conn, &format!("SELECT lo_truncate64({}, {})", fd, data.len())).await?;
    close(conn, fd).await
}

/// Read the whole object.
pub async fn read_all(conn: &mut PgConnection, oid: u32) -> PgResult<Vec<u8>> {
    let fd = open(conn, oid, INV_READ).await?;

    let mut data = Vec::new();
    loop {
        match scalar(conn, &format!("SELECT loread({}, {})", fd, CHUNK_SIZE)).await? {
            PgValue::Bytea(chunk) => {
                let last = chunk.len() < CHUNK_SIZE;
                data.extend_from_slice(&chunk);
                if last {
                    break;
                }
            }
            other => {
                return Err(PgError::Type(format!(
                    "loread returned {} instead of bytea",
                    other.kind()
                )))
            }
        }
    }

    close(conn, fd).await?;
    Ok(data)
}

/// Delete the object.
pub async fn unlink(conn: &mut PgConnection, oid: u32) -> PgResult<()> {
    scalar(conn, &format!("SELECT lo_unlink({})", oid)).await?;
    Ok(())
}
