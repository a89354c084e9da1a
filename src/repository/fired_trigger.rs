//! Fired-trigger ledger: one row per in-flight fire instance, the
//! mechanism the cluster manager walks during failure recovery to find
//! executions orphaned by a dead instance.

use chrono::TimeZone;
use sqlx::{PgConnection, Row};

use crate::error::Result;
use crate::gateway::Gateway;
use crate::model::{FiredTrigger, FiredTriggerState, JobKey, TriggerKey};

#[derive(Clone)]
pub struct FiredTriggerRepository {
    gw: Gateway,
}

impl FiredTriggerRepository {
    pub fn new(gw: Gateway) -> Self {
        Self { gw }
    }

    pub async fn insert(&self, conn: &mut PgConnection, entry: &FiredTrigger) -> Result<()> {
        let table = self.gw.table("FIRED_TRIGGERS");
        let sql = format!(
            "INSERT INTO {table} \
             (ENTRY_ID, TRIGGER_NAME, TRIGGER_GROUP, IS_VOLATILE, INSTANCE_NAME, FIRED_TIME, \
              SCHED_TIME, ENTRY_STATE, JOB_NAME, JOB_GROUP, IS_STATEFUL, REQUESTS_RECOVERY) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)"
        );
        sqlx::query(&sql)
            .bind(&entry.fire_instance_id)
            .bind(&entry.trigger_key.name)
            .bind(&entry.trigger_key.group)
            .bind(entry.volatile)
            .bind(&entry.instance_id)
            .bind(entry.fired_time.timestamp_millis())
            .bind(entry.sched_time.map(|t| t.timestamp_millis()))
            .bind(entry.state.as_db_str())
            .bind(entry.job_key.as_ref().map(|k| &k.name))
            .bind(entry.job_key.as_ref().map(|k| &k.group))
            .bind(entry.is_stateful)
            .bind(entry.requests_recovery)
            .execute(&mut *conn)
            .await?;
        Ok(())
    }

    pub async fn mark_executing(&self, conn: &mut PgConnection, fire_instance_id: &str) -> Result<bool> {
        let table = self.gw.table("FIRED_TRIGGERS");
        let sql = format!("UPDATE {table} SET ENTRY_STATE = $1 WHERE ENTRY_ID = $2");
        let result = sqlx::query(&sql)
            .bind(FiredTriggerState::Executing.as_db_str())
            .bind(fire_instance_id)
            .execute(&mut *conn)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn delete(&self, conn: &mut PgConnection, fire_instance_id: &str) -> Result<bool> {
        let table = self.gw.table("FIRED_TRIGGERS");
        let sql = format!("DELETE FROM {table} WHERE ENTRY_ID = $1");
        let result = sqlx::query(&sql).bind(fire_instance_id).execute(&mut *conn).await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn delete_by_instance(&self, conn: &mut PgConnection, instance_id: &str) -> Result<u64> {
        let table = self.gw.table("FIRED_TRIGGERS");
        let sql = format!("DELETE FROM {table} WHERE INSTANCE_NAME = $1");
        let result = sqlx::query(&sql).bind(instance_id).execute(&mut *conn).await?;
        Ok(result.rows_affected())
    }

    pub async fn by_instance(&self, conn: &mut PgConnection, instance_id: &str) -> Result<Vec<FiredTrigger>> {
        let table = self.gw.table("FIRED_TRIGGERS");
        let sql = format!(
            "SELECT ENTRY_ID, TRIGGER_NAME, TRIGGER_GROUP, IS_VOLATILE, INSTANCE_NAME, FIRED_TIME, \
             SCHED_TIME, ENTRY_STATE, JOB_NAME, JOB_GROUP, IS_STATEFUL, REQUESTS_RECOVERY \
             FROM {table} WHERE INSTANCE_NAME = $1"
        );
        let rows = sqlx::query(&sql).bind(instance_id).fetch_all(&mut *conn).await?;
        rows.iter().map(row_to_fired_trigger).collect()
    }

    pub async fn by_trigger(&self, conn: &mut PgConnection, key: &TriggerKey) -> Result<Vec<FiredTrigger>> {
        let table = self.gw.table("FIRED_TRIGGERS");
        let sql = format!(
            "SELECT ENTRY_ID, TRIGGER_NAME, TRIGGER_GROUP, IS_VOLATILE, INSTANCE_NAME, FIRED_TIME, \
             SCHED_TIME, ENTRY_STATE, JOB_NAME, JOB_GROUP, IS_STATEFUL, REQUESTS_RECOVERY \
             FROM {table} WHERE TRIGGER_NAME = $1 AND TRIGGER_GROUP = $2"
        );
        let rows = sqlx::query(&sql)
            .bind(&key.name)
            .bind(&key.group)
            .fetch_all(&mut *conn)
            .await?;
        rows.iter().map(row_to_fired_trigger).collect()
    }

    /// Volatile fire entries belonging to a dead instance are discarded
    /// outright rather than recovered, matching the "volatile work is never
    /// durably recovered" non-goal.
    pub async fn delete_volatile_by_instance(&self, conn: &mut PgConnection, instance_id: &str) -> Result<u64> {
        let table = self.gw.table("FIRED_TRIGGERS");
        let sql = format!("DELETE FROM {table} WHERE INSTANCE_NAME = $1 AND IS_VOLATILE = TRUE");
        let result = sqlx::query(&sql).bind(instance_id).execute(&mut *conn).await?;
        Ok(result.rows_affected())
    }
}

fn row_to_fired_trigger(row: &sqlx::postgres::PgRow) -> Result<FiredTrigger> {
    let job_name: Option<String> = row.try_get("JOB_NAME")?;
    let job_group: Option<String> = row.try_get("JOB_GROUP")?;
    let job_key = match (job_name, job_group) {
        (Some(name), Some(group)) => Some(JobKey::new(name, group)),
        _ => None,
    };

    let fired_ms: i64 = row.try_get("FIRED_TIME")?;
    let sched_ms: Option<i64> = row.try_get("SCHED_TIME")?;
    let state_str: String = row.try_get("ENTRY_STATE")?;

    Ok(FiredTrigger {
        fire_instance_id: row.try_get("ENTRY_ID")?,
        trigger_key: TriggerKey::new(
            row.try_get::<String, _>("TRIGGER_NAME")?,
            row.try_get::<String, _>("TRIGGER_GROUP")?,
        ),
        job_key,
        volatile: row.try_get("IS_VOLATILE")?,
        instance_id: row.try_get("INSTANCE_NAME")?,
        fired_time: chrono::Utc
            .timestamp_millis_opt(fired_ms)
            .single()
            .unwrap_or_else(chrono::Utc::now),
        sched_time: sched_ms.and_then(|ms| chrono::Utc.timestamp_millis_opt(ms).single()),
        state: FiredTriggerState::from_db_str(&state_str).unwrap_or(FiredTriggerState::Acquired),
        is_stateful: row.try_get::<Option<bool>, _>("IS_STATEFUL")?.unwrap_or(false),
        requests_recovery: row.try_get::<Option<bool>, _>("REQUESTS_RECOVERY")?.unwrap_or(false),
    })
}
