//! The trigger state machine: every legal transition is a conditional
//! `UPDATE ... WHERE TRIGGER_STATE IN (olds)` whose affected-row count is the
//! sole race resolver across the cluster — no locking is needed to keep two
//! schedulers from both winning the same claim.

use sqlx::PgConnection;

use crate::error::Result;
use crate::gateway::Gateway;
use crate::model::{TriggerKey, TriggerState};

/// Attempt `key`'s state transition from one of `from` to `to`. Returns
/// `true` if this call won the race (one row updated), `false` if another
/// instance already moved the row out of `from` first — which is not an
/// error.
pub async fn conditional_update_state(
    gw: &Gateway,
    conn: &mut PgConnection,
    key: &TriggerKey,
    from: &[TriggerState],
    to: TriggerState,
) -> Result<bool> {
    let table = gw.table("TRIGGERS");
    let from_codes: Vec<&'static str> = from.iter().map(|s| s.as_db_str()).collect();

    let sql = format!(
        "UPDATE {table} SET TRIGGER_STATE = $1 \
         WHERE TRIGGER_NAME = $2 AND TRIGGER_GROUP = $3 AND TRIGGER_STATE = ANY($4)"
    );

    let result = sqlx::query(&sql)
        .bind(to.as_db_str())
        .bind(&key.name)
        .bind(&key.group)
        .bind(&from_codes)
        .execute(conn)
        .await?;

    Ok(result.rows_affected() > 0)
}

/// Batched version of [`conditional_update_state`] for whole-group
/// pause/resume, where every row transitioning is a win (no race to lose —
/// pausing/resuming is idempotent and commutative across instances).
pub async fn conditional_update_group_state(
    gw: &Gateway,
    conn: &mut PgConnection,
    group: &str,
    from: &[TriggerState],
    to: TriggerState,
) -> Result<u64> {
    let table = gw.table("TRIGGERS");
    let from_codes: Vec<&'static str> = from.iter().map(|s| s.as_db_str()).collect();

    let sql = format!(
        "UPDATE {table} SET TRIGGER_STATE = $1 \
         WHERE TRIGGER_GROUP = $2 AND TRIGGER_STATE = ANY($3)"
    );

    let result = sqlx::query(&sql)
        .bind(to.as_db_str())
        .bind(group)
        .bind(&from_codes)
        .execute(conn)
        .await?;

    Ok(result.rows_affected())
}

/// Pause a single trigger: `Waiting -> Paused`, `Blocked -> PausedBlocked`.
pub async fn pause_trigger(gw: &Gateway, conn: &mut PgConnection, key: &TriggerKey) -> Result<()> {
    conditional_update_state(gw, conn, key, &[TriggerState::Waiting, TriggerState::Acquired], TriggerState::Paused).await?;
    conditional_update_state(gw, conn, key, &[TriggerState::Blocked], TriggerState::PausedBlocked).await?;
    Ok(())
}

/// Resume a single trigger: the inverse of [`pause_trigger`].
pub async fn resume_trigger(gw: &Gateway, conn: &mut PgConnection, key: &TriggerKey) -> Result<()> {
    conditional_update_state(gw, conn, key, &[TriggerState::Paused], TriggerState::Waiting).await?;
    conditional_update_state(gw, conn, key, &[TriggerState::PausedBlocked], TriggerState::Blocked).await?;
    Ok(())
}

/// Pause every trigger in `group`.
pub async fn pause_group(gw: &Gateway, conn: &mut PgConnection, group: &str) -> Result<()> {
    conditional_update_group_state(gw, conn, group, &[TriggerState::Waiting, TriggerState::Acquired], TriggerState::Paused).await?;
    conditional_update_group_state(gw, conn, group, &[TriggerState::Blocked], TriggerState::PausedBlocked).await?;
    record_paused_group(gw, conn, group).await
}

/// Resume every trigger in `group` — the inverse of [`pause_group`].
pub async fn resume_group(gw: &Gateway, conn: &mut PgConnection, group: &str) -> Result<()> {
    conditional_update_group_state(gw, conn, group, &[TriggerState::Paused], TriggerState::Waiting).await?;
    conditional_update_group_state(gw, conn, group, &[TriggerState::PausedBlocked], TriggerState::Blocked).await?;
    forget_paused_group(gw, conn, group).await
}

async fn record_paused_group(gw: &Gateway, conn: &mut PgConnection, group: &str) -> Result<()> {
    let table = gw.table("PAUSED_TRIGGER_GRPS");
    let sql = format!("INSERT INTO {table} (TRIGGER_GROUP) VALUES ($1) ON CONFLICT DO NOTHING");
    sqlx::query(&sql).bind(group).execute(conn).await?;
    Ok(())
}

async fn forget_paused_group(gw: &Gateway, conn: &mut PgConnection, group: &str) -> Result<()> {
    let table = gw.table("PAUSED_TRIGGER_GRPS");
    let sql = format!("DELETE FROM {table} WHERE TRIGGER_GROUP = $1");
    sqlx::query(&sql).bind(group).execute(conn).await?;
    Ok(())
}
