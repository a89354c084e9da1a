//! Misfire handling: find `Waiting` triggers whose next-fire-time has
//! passed by more than the configured threshold and rewrite their schedule
//! per the trigger's misfire instruction.
//!
//! Scanning runs under the `TRIGGER_ACCESS` advisory lock for the same
//! reason cluster recovery does — it walks an unbounded set of rows rather
//! than claiming one via a single conditional update.

use chrono::{DateTime, Utc};
use sqlx::{PgConnection, Row};

use crate::error::Result;
use crate::gateway::Gateway;
use crate::lock::{self, TRIGGER_ACCESS_LOCK};
use crate::model::{TriggerKey, TriggerState};
use crate::repository::TriggerRepository;
use crate::schedule::{apply_misfire, epoch_millis_or_sentinel};

/// Select `Waiting` triggers whose `next_fire_time` is older than
/// `now - threshold_ms`, optionally restricted to one group, and rewrite
/// each one's schedule per its misfire instruction. Returns the keys
/// touched. A trigger whose recomputed next-fire-time is `None` moves
/// straight to `Complete` in the same update. The repeat
/// count/interval and cron expression are not themselves rewritten by any
/// instruction this store implements, so only `TRIGGER_STATE` and
/// `NEXT_FIRE_TIME` change; the variant row is left untouched.
pub async fn scan_misfires(
    gw: &Gateway,
    conn: &mut PgConnection,
    now: DateTime<Utc>,
    threshold_ms: i64,
    group_filter: Option<&str>,
) -> Result<Vec<TriggerKey>> {
    lock::acquire(gw, conn, TRIGGER_ACCESS_LOCK).await?;

    let table = gw.table("TRIGGERS");
    let cutoff = now.timestamp_millis() - threshold_ms;

    let candidates = match group_filter {
        Some(group) => {
            let sql = format!(
                "SELECT TRIGGER_NAME, TRIGGER_GROUP FROM {table} \
                 WHERE TRIGGER_STATE = 'WAITING' AND NEXT_FIRE_TIME >= 0 AND NEXT_FIRE_TIME < $1 \
                 AND TRIGGER_GROUP = $2"
            );
            sqlx::query(&sql).bind(cutoff).bind(group).fetch_all(&mut *conn).await?
        }
        None => {
            let sql = format!(
                "SELECT TRIGGER_NAME, TRIGGER_GROUP FROM {table} \
                 WHERE TRIGGER_STATE = 'WAITING' AND NEXT_FIRE_TIME >= 0 AND NEXT_FIRE_TIME < $1"
            );
            sqlx::query(&sql).bind(cutoff).fetch_all(&mut *conn).await?
        }
    };

    let trigger_repo = TriggerRepository::new(gw.clone(), false);
    let mut touched = Vec::new();

    for row in candidates {
        let key = TriggerKey::new(
            row.try_get::<String, _>("TRIGGER_NAME")?,
            row.try_get::<String, _>("TRIGGER_GROUP")?,
        );

        let Some(trigger) = trigger_repo.get(conn, &key).await? else {
            continue;
        };
        if trigger.state != TriggerState::Waiting {
            // Lost a race to acquisition/pause between the scan and this pass.
            continue;
        }

        let (_, next) =
            apply_misfire(&trigger.schedule, trigger.misfire_instruction, now, trigger.end_time)?;
        let next_state = if next.is_none() { TriggerState::Complete } else { TriggerState::Waiting };

        let sql = format!(
            "UPDATE {table} SET TRIGGER_STATE = $1, NEXT_FIRE_TIME = $2 \
             WHERE TRIGGER_NAME = $3 AND TRIGGER_GROUP = $4 AND TRIGGER_STATE = 'WAITING'"
        );
        let result = sqlx::query(&sql)
            .bind(next_state.as_db_str())
            .bind(epoch_millis_or_sentinel(next))
            .bind(&key.name)
            .bind(&key.group)
            .execute(&mut *conn)
            .await?;

        if result.rows_affected() == 0 {
            continue;
        }

        tracing::info!(trigger = %key, next_state = ?next_state, "misfire handled");
        touched.push(key);
    }

    Ok(touched)
}
