//! Cluster-wide advisory lock, used only by operations that must scan
//! multiple trigger rows at once (misfire scanning, cluster recovery).
//!
//! The lock is a plain `SELECT ... FOR UPDATE` against a well-known row in
//! `LOCKS`, held only for the duration of the enclosing transaction and
//! released automatically on commit or rollback — a session-level
//! `pg_advisory_lock` would outlive the transaction and is deliberately not
//! used here.

use sqlx::PgConnection;

use crate::error::Result;
use crate::gateway::Gateway;

pub const TRIGGER_ACCESS_LOCK: &str = "TRIGGER_ACCESS";
pub const STATE_ACCESS_LOCK: &str = "STATE_ACCESS";

/// Block until `lock_name`'s row is locked for this transaction.
pub async fn acquire(gw: &Gateway, conn: &mut PgConnection, lock_name: &str) -> Result<()> {
    let table = gw.table("LOCKS");
    let sql = format!("SELECT LOCK_NAME FROM {table} WHERE LOCK_NAME = $1 FOR UPDATE");
    sqlx::query(&sql).bind(lock_name).fetch_one(conn).await?;
    Ok(())
}
