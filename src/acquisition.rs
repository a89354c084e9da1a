//! Trigger acquisition and completion: the scheduler-instance-facing loop
//! that claims `Waiting` triggers, upgrades them to `Executing` at fire
//! time, and fans completion effects back out across stateful-job siblings.

use chrono::{DateTime, Duration, Utc};
use sqlx::{PgConnection, Row};
use uuid::Uuid;

use crate::error::Result;
use crate::gateway::Gateway;
use crate::model::{
    AcquiredTrigger, FiredTrigger, FiredTriggerState, JobDataMap, JobDetail, Trigger, TriggerKey,
    TriggerState,
};
use crate::repository::{FiredTriggerRepository, JobRepository, TriggerRepository};
use crate::schedule::compute_next_fire;
use crate::state_machine::conditional_update_state;

/// Outcome of firing an acquired trigger, handed back to the façade so it
/// knows whether to actually invoke the job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FireResult {
    Proceed,
    /// The job is stateful and another trigger for it is already executing;
    /// this trigger was moved to `Blocked` and must not run.
    Blocked,
}

/// Select `Waiting` candidates due within `window` of `now`, attempt to
/// claim up to `max_count` of them, and record a `FIRED_TRIGGERS` entry for
/// each win. Losing a claim race to another instance is not an error — the
/// loop simply moves to the next candidate.
pub async fn acquire_next_triggers(
    gw: &Gateway,
    conn: &mut PgConnection,
    instance_id: &str,
    now: DateTime<Utc>,
    window: Duration,
    max_count: usize,
) -> Result<Vec<AcquiredTrigger>> {
    let triggers_table = gw.table("TRIGGERS");
    let paused_table = gw.table("PAUSED_TRIGGER_GRPS");

    let overfetch = (max_count * 3).max(max_count + 10);
    let horizon = (now + window).timestamp_millis();

    let sql = format!(
        "SELECT t.TRIGGER_NAME, t.TRIGGER_GROUP FROM {triggers_table} t \
         LEFT JOIN {paused_table} p ON t.TRIGGER_GROUP = p.TRIGGER_GROUP \
         WHERE t.TRIGGER_STATE = 'WAITING' AND t.NEXT_FIRE_TIME <= $1 AND p.TRIGGER_GROUP IS NULL \
         ORDER BY t.NEXT_FIRE_TIME ASC LIMIT $2"
    );

    let candidates = sqlx::query(&sql)
        .bind(horizon)
        .bind(overfetch as i64)
        .fetch_all(&mut *conn)
        .await?;

    let trigger_repo = TriggerRepository::new(gw.clone(), false);
    let job_repo = JobRepository::new(gw.clone(), false);
    let fired_repo = FiredTriggerRepository::new(gw.clone());

    let mut acquired = Vec::with_capacity(max_count);
    for row in candidates {
        if acquired.len() >= max_count {
            break;
        }
        let key = TriggerKey::new(
            row.try_get::<String, _>("TRIGGER_NAME")?,
            row.try_get::<String, _>("TRIGGER_GROUP")?,
        );

        let won = conditional_update_state(
            gw,
            conn,
            &key,
            &[TriggerState::Waiting],
            TriggerState::Acquired,
        )
        .await?;
        if !won {
            continue;
        }

        let Some(trigger) = trigger_repo.get(conn, &key).await? else {
            continue;
        };
        let job: Option<JobDetail> = job_repo.get(conn, &trigger.job_key).await?;
        let (is_stateful, requests_recovery) =
            job.map(|j| (j.stateful, j.requests_recovery)).unwrap_or((false, false));

        let fire_instance_id = Uuid::new_v4().to_string();
        fired_repo
            .insert(
                conn,
                &FiredTrigger {
                    fire_instance_id: fire_instance_id.clone(),
                    trigger_key: key.clone(),
                    job_key: Some(trigger.job_key.clone()),
                    volatile: trigger.volatile,
                    instance_id: instance_id.to_string(),
                    fired_time: trigger.next_fire_time.unwrap_or(now),
                    sched_time: trigger.next_fire_time,
                    state: FiredTriggerState::Acquired,
                    is_stateful,
                    requests_recovery,
                },
            )
            .await?;

        acquired.push(AcquiredTrigger { fire_instance_id, trigger });
    }

    Ok(acquired)
}

/// Upgrade an acquired fire instance to `Executing`, recompute the firing
/// trigger's own next-fire-time (`Complete` when there is none left), bump a
/// simple trigger's `TIMES_TRIGGERED` count, and decide the trigger's own
/// post-fire state: for a stateful job it parks itself in `Blocked` — along
/// with every *other* trigger of that job (`Waiting -> Blocked` / `Paused ->
/// PausedBlocked`) — until this fire completes, since at most one trigger of
/// a stateful job may be `Acquired`/`Executing` at a time; for a
/// non-stateful job it goes straight back to `Waiting`. If the conditional
/// update on the firing trigger's own row affects no rows — it was
/// concurrently deleted, paused, or reclaimed by cluster recovery — the
/// caller must not invoke the job; that race is reported as
/// `FireResult::Blocked` rather than an error.
pub async fn fire_trigger(
    gw: &Gateway,
    conn: &mut PgConnection,
    fire_instance_id: &str,
    trigger: &Trigger,
    job_stateful: bool,
) -> Result<FireResult> {
    let fired_repo = FiredTriggerRepository::new(gw.clone());
    fired_repo.mark_executing(conn, fire_instance_id).await?;

    let next = compute_next_fire(&trigger.schedule, Utc::now(), trigger.end_time)?;
    let next_state = if next.is_none() {
        TriggerState::Complete
    } else if job_stateful {
        TriggerState::Blocked
    } else {
        TriggerState::Waiting
    };

    let table = gw.table("TRIGGERS");
    let next_ms = crate::schedule::epoch_millis_or_sentinel(next);
    let sql = format!(
        "UPDATE {table} SET TRIGGER_STATE = $1, NEXT_FIRE_TIME = $2, PREV_FIRE_TIME = $3 \
         WHERE TRIGGER_NAME = $4 AND TRIGGER_GROUP = $5 AND TRIGGER_STATE = $6"
    );
    let result = sqlx::query(&sql)
        .bind(next_state.as_db_str())
        .bind(next_ms)
        .bind(trigger.next_fire_time.map(|t| t.timestamp_millis()))
        .bind(&trigger.key.name)
        .bind(&trigger.key.group)
        .bind(TriggerState::Acquired.as_db_str())
        .execute(&mut *conn)
        .await?;

    if result.rows_affected() == 0 {
        return Ok(FireResult::Blocked);
    }

    let trigger_repo = TriggerRepository::new(gw.clone(), false);
    trigger_repo
        .increment_times_triggered(conn, &trigger.key, trigger.schedule.type_code())
        .await?;

    if job_stateful && next_state == TriggerState::Blocked {
        let siblings = trigger_repo.sibling_keys(conn, &trigger.job_key, &trigger.key).await?;
        for sibling in &siblings {
            conditional_update_state(gw, conn, sibling, &[TriggerState::Waiting], TriggerState::Blocked).await?;
            conditional_update_state(gw, conn, sibling, &[TriggerState::Paused], TriggerState::PausedBlocked)
                .await?;
        }
    }

    Ok(FireResult::Proceed)
}

/// Remove the fire instance's ledger row and, for a stateful job, unblock
/// the fired trigger itself along with every sibling trigger of that job.
/// When `job_dirty`, the supplied job-data map is persisted via the
/// ordinary write-skip update path.
pub async fn complete_trigger(
    gw: &Gateway,
    conn: &mut PgConnection,
    fire_instance_id: &str,
    trigger_key: &TriggerKey,
    job_key: Option<&crate::model::JobKey>,
    job_stateful: bool,
    job_dirty: bool,
    new_job_data: Option<JobDataMap>,
) -> Result<()> {
    let fired_repo = FiredTriggerRepository::new(gw.clone());
    fired_repo.delete(conn, fire_instance_id).await?;

    if job_stateful {
        if let Some(job_key) = job_key {
            let trigger_repo = TriggerRepository::new(gw.clone(), false);

            conditional_update_state(gw, conn, trigger_key, &[TriggerState::Blocked], TriggerState::Waiting)
                .await?;
            conditional_update_state(gw, conn, trigger_key, &[TriggerState::PausedBlocked], TriggerState::Paused)
                .await?;

            let siblings = trigger_repo.sibling_keys(conn, job_key, trigger_key).await?;
            for sibling in &siblings {
                conditional_update_state(gw, conn, sibling, &[TriggerState::Blocked], TriggerState::Waiting).await?;
                conditional_update_state(gw, conn, sibling, &[TriggerState::PausedBlocked], TriggerState::Paused)
                    .await?;
            }
        }
    }

    if job_dirty {
        if let (Some(job_key), Some(data)) = (job_key, new_job_data) {
            let job_repo = JobRepository::new(gw.clone(), false);
            if let Some(mut job) = job_repo.get(conn, job_key).await? {
                job.job_data = data;
                job_repo.update(conn, &job).await?;
            }
        }
    }

    Ok(())
}
