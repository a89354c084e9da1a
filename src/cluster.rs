//! Cluster manager: scheduler-instance heartbeats, failure detection, and
//! recovery of fired-trigger entries orphaned by a dead peer.
//!
//! Detection and recovery both run under the `TRIGGER_ACCESS` advisory lock
//! (`crate::lock`) so that at most one instance in the cluster is walking
//! heartbeat rows at a time — the scan touches many rows and is not itself
//! expressible as a single conditional update, unlike acquisition.

use chrono::{DateTime, TimeZone, Utc};
use sqlx::{PgConnection, Row};

use crate::error::Result;
use crate::gateway::Gateway;
use crate::lock::{self, TRIGGER_ACCESS_LOCK};
use crate::model::{
    JobDataMap, MisfireInstruction, SchedulerStateRow, Trigger, TriggerKey, TriggerSchedule,
    TriggerState, RECOVERY_GROUP,
};
use crate::repository::{FiredTriggerRepository, TriggerRepository};
use crate::state_machine::conditional_update_state;

/// Job-data keys copied onto a synthetic recovery trigger, naming the
/// orphaned original.
pub const FAILED_JOB_ORIG_TRIGGER_NAME: &str = "QRTZ_FAILED_JOB_ORIG_TRIGGER_NAME";
pub const FAILED_JOB_ORIG_TRIGGER_GROUP: &str = "QRTZ_FAILED_JOB_ORIG_TRIGGER_GROUP";
pub const FAILED_JOB_ORIG_TRIGGER_FIRETIME_MS: &str =
    "QRTZ_FAILED_JOB_ORIG_TRIGGER_FIRETIME_IN_MILLISECONDS";

#[derive(Clone)]
pub struct ClusterManager {
    gw: Gateway,
}

impl ClusterManager {
    pub fn new(gw: Gateway) -> Self {
        Self { gw }
    }

    /// Upsert this instance's heartbeat row.
    pub async fn check_in(
        &self,
        conn: &mut PgConnection,
        instance_id: &str,
        now: DateTime<Utc>,
        interval_ms: i64,
    ) -> Result<()> {
        let table = self.gw.table("SCHEDULER_STATE");
        let sql = format!(
            "INSERT INTO {table} (INSTANCE_NAME, LAST_CHECKIN_TIME, CHECKIN_INTERVAL, RECOVERER) \
             VALUES ($1, $2, $3, NULL) \
             ON CONFLICT (INSTANCE_NAME) DO UPDATE SET LAST_CHECKIN_TIME = EXCLUDED.LAST_CHECKIN_TIME, \
             CHECKIN_INTERVAL = EXCLUDED.CHECKIN_INTERVAL"
        );
        sqlx::query(&sql)
            .bind(instance_id)
            .bind(now.timestamp_millis())
            .bind(interval_ms)
            .execute(&mut *conn)
            .await?;
        Ok(())
    }

    /// Remove this instance's heartbeat row, on clean shutdown.
    pub async fn drop_heartbeat(&self, conn: &mut PgConnection, instance_id: &str) -> Result<()> {
        let table = self.gw.table("SCHEDULER_STATE");
        let sql = format!("DELETE FROM {table} WHERE INSTANCE_NAME = $1");
        sqlx::query(&sql).bind(instance_id).execute(&mut *conn).await?;
        Ok(())
    }

    async fn all_heartbeats(&self, conn: &mut PgConnection) -> Result<Vec<SchedulerStateRow>> {
        let table = self.gw.table("SCHEDULER_STATE");
        let sql = format!("SELECT INSTANCE_NAME, LAST_CHECKIN_TIME, CHECKIN_INTERVAL, RECOVERER FROM {table}");
        let rows = sqlx::query(&sql).fetch_all(&mut *conn).await?;
        rows.iter()
            .map(|r| {
                Ok(SchedulerStateRow {
                    instance_id: r.try_get("INSTANCE_NAME")?,
                    last_checkin_time: chrono::Utc
                        .timestamp_millis_opt(r.try_get::<i64, _>("LAST_CHECKIN_TIME")?)
                        .single()
                        .unwrap_or_else(Utc::now),
                    checkin_interval_ms: r.try_get("CHECKIN_INTERVAL")?,
                    recoverer: r.try_get("RECOVERER")?,
                })
            })
            .collect()
    }

    /// True when `row` hasn't checked in within `2 * checkin_interval_ms` of
    /// `now`.
    fn is_failed(row: &SchedulerStateRow, now: DateTime<Utc>) -> bool {
        let deadline = row.last_checkin_time + chrono::Duration::milliseconds(2 * row.checkin_interval_ms);
        deadline < now
    }

    /// Claim recovery of `instance_id` by setting `RECOVERER`. Returns
    /// `false` if another instance already claimed it first.
    async fn claim_recovery(&self, conn: &mut PgConnection, instance_id: &str, claimant: &str) -> Result<bool> {
        let table = self.gw.table("SCHEDULER_STATE");
        let sql = format!(
            "UPDATE {table} SET RECOVERER = $1 WHERE INSTANCE_NAME = $2 AND RECOVERER IS NULL"
        );
        let result = sqlx::query(&sql).bind(claimant).bind(instance_id).execute(&mut *conn).await?;
        Ok(result.rows_affected() > 0)
    }

    /// Refresh this instance's own heartbeat, then look for and recover any
    /// peer whose heartbeat has gone stale. Failures recovering one peer are
    /// logged and do not prevent recovering the others or abort the
    /// enclosing scheduler.
    pub async fn detect_and_recover(
        &self,
        conn: &mut PgConnection,
        this_instance: &str,
        now: DateTime<Utc>,
    ) -> Result<Vec<String>> {
        lock::acquire(&self.gw, conn, TRIGGER_ACCESS_LOCK).await?;

        let heartbeats = self.all_heartbeats(conn).await?;
        let mut recovered = Vec::new();

        for row in heartbeats {
            if row.instance_id == this_instance || !Self::is_failed(&row, now) {
                continue;
            }
            if row.recoverer.is_some() {
                continue;
            }
            if !self.claim_recovery(conn, &row.instance_id, this_instance).await? {
                continue;
            }

            match self.recover_instance(conn, &row.instance_id).await {
                Ok(()) => {
                    tracing::info!(dead_instance = %row.instance_id, "recovered orphaned fire instances");
                    recovered.push(row.instance_id);
                }
                Err(e) => {
                    tracing::error!(dead_instance = %row.instance_id, error = %e, "cluster recovery failed, retrying next tick");
                }
            }
        }

        Ok(recovered)
    }

    /// Walk `dead_instance`'s fired-trigger entries: discard volatile ones,
    /// create synthetic recovery triggers for jobs that request recovery,
    /// unblock any sibling trigger left `Blocked`/`PausedBlocked` solely
    /// because of the dead instance, and finally drop its heartbeat row.
    async fn recover_instance(&self, conn: &mut PgConnection, dead_instance: &str) -> Result<()> {
        let fired_repo = FiredTriggerRepository::new(self.gw.clone());
        let trigger_repo = TriggerRepository::new(self.gw.clone(), false);

        let entries = fired_repo.by_instance(conn, dead_instance).await?;
        fired_repo.delete_volatile_by_instance(conn, dead_instance).await?;

        for entry in entries.iter().filter(|e| !e.volatile) {
            if entry.requests_recovery {
                if let Some(job_key) = &entry.job_key {
                    self.create_recovery_trigger(conn, entry, job_key).await?;
                }
            }

            if entry.is_stateful {
                if let Some(job_key) = &entry.job_key {
                    let siblings = trigger_repo
                        .sibling_keys(conn, job_key, &entry.trigger_key)
                        .await?;
                    for sibling in &siblings {
                        conditional_update_state(
                            &self.gw,
                            conn,
                            sibling,
                            &[TriggerState::Blocked],
                            TriggerState::Waiting,
                        )
                        .await?;
                        conditional_update_state(
                            &self.gw,
                            conn,
                            sibling,
                            &[TriggerState::PausedBlocked],
                            TriggerState::Paused,
                        )
                        .await?;
                    }
                    conditional_update_state(
                        &self.gw,
                        conn,
                        &entry.trigger_key,
                        &[TriggerState::Blocked],
                        TriggerState::Waiting,
                    )
                    .await?;
                    conditional_update_state(
                        &self.gw,
                        conn,
                        &entry.trigger_key,
                        &[TriggerState::PausedBlocked],
                        TriggerState::Paused,
                    )
                    .await?;
                }
            }
        }

        fired_repo.delete_by_instance(conn, dead_instance).await?;

        let table = self.gw.table("SCHEDULER_STATE");
        let sql = format!("DELETE FROM {table} WHERE INSTANCE_NAME = $1");
        sqlx::query(&sql).bind(dead_instance).execute(&mut *conn).await?;

        Ok(())
    }

    /// Insert a synthetic fire-now trigger into the reserved recovery group,
    /// carrying the orphaned job's data plus the three `QRTZ_FAILED_JOB_*`
    /// entries naming the original trigger and its fired time.
    async fn create_recovery_trigger(
        &self,
        conn: &mut PgConnection,
        entry: &crate::model::FiredTrigger,
        job_key: &crate::model::JobKey,
    ) -> Result<()> {
        let trigger_repo = TriggerRepository::new(self.gw.clone(), false);

        let mut job_data = JobDataMap::new();
        if let Some(original) = trigger_repo.get(conn, &entry.trigger_key).await? {
            job_data = original.job_data;
        }
        job_data.insert(FAILED_JOB_ORIG_TRIGGER_NAME, entry.trigger_key.name.clone());
        job_data.insert(FAILED_JOB_ORIG_TRIGGER_GROUP, entry.trigger_key.group.clone());
        job_data.insert(FAILED_JOB_ORIG_TRIGGER_FIRETIME_MS, entry.fired_time.timestamp_millis());

        let recovery_key = TriggerKey::recovery(&entry.trigger_key.name);
        let recovery_trigger = Trigger {
            key: recovery_key,
            job_key: job_key.clone(),
            description: Some(format!(
                "recovery of {} after instance failure",
                entry.trigger_key
            )),
            volatile: false,
            next_fire_time: Some(entry.fired_time),
            prev_fire_time: None,
            start_time: entry.fired_time,
            end_time: None,
            calendar_name: None,
            misfire_instruction: MisfireInstruction::FireNow,
            state: TriggerState::Waiting,
            job_data,
            schedule: TriggerSchedule::Simple {
                repeat_count: 0,
                repeat_interval_ms: 0,
                times_triggered: 0,
            },
        };

        match trigger_repo.insert(conn, &recovery_trigger).await {
            Ok(()) => Ok(()),
            Err(crate::error::StoreError::TriggerAlreadyExists(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failed_instance_detected_after_double_interval() {
        let now = Utc::now();
        let stale = SchedulerStateRow {
            instance_id: "A".into(),
            last_checkin_time: now - chrono::Duration::milliseconds(30_001),
            checkin_interval_ms: 15_000,
            recoverer: None,
        };
        assert!(ClusterManager::is_failed(&stale, now));

        let fresh = SchedulerStateRow {
            last_checkin_time: now - chrono::Duration::milliseconds(1_000),
            ..stale
        };
        assert!(!ClusterManager::is_failed(&fresh, now));
    }
}
