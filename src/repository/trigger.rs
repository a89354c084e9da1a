//! Trigger repository: CRUD across the base `TRIGGERS` row and its variant
//! table (`SIMPLE_TRIGGERS` / `CRON_TRIGGERS` / `BLOB_TRIGGERS`), dispatched
//! on `TRIGGER_TYPE`, plus listener associations and group queries.

use sqlx::{PgConnection, Row};

use crate::codec::codec_for;
use crate::error::{Result, StoreError};
use crate::gateway::{is_unique_violation, Gateway};
use crate::model::{
    JobDataMap, JobKey, MisfireInstruction, Trigger, TriggerKey, TriggerSchedule, TriggerState,
};
use crate::schedule::{epoch_millis_or_sentinel, sentinel_to_time};

#[derive(Clone)]
pub struct TriggerRepository {
    gw: Gateway,
    use_properties: bool,
}

impl TriggerRepository {
    pub fn new(gw: Gateway, use_properties: bool) -> Self {
        Self { gw, use_properties }
    }

    pub async fn insert(&self, conn: &mut PgConnection, trigger: &Trigger) -> Result<()> {
        let codec = codec_for(self.use_properties);
        let blob = codec.encode(&trigger.job_data)?;
        let table = self.gw.table("TRIGGERS");

        let sql = format!(
            "INSERT INTO {table} \
             (TRIGGER_NAME, TRIGGER_GROUP, JOB_NAME, JOB_GROUP, DESCRIPTION, IS_VOLATILE, \
              NEXT_FIRE_TIME, PREV_FIRE_TIME, TRIGGER_STATE, TRIGGER_TYPE, START_TIME, END_TIME, \
              CALENDAR_NAME, MISFIRE_INSTR, JOB_DATA) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)"
        );

        let result = sqlx::query(&sql)
            .bind(&trigger.key.name)
            .bind(&trigger.key.group)
            .bind(&trigger.job_key.name)
            .bind(&trigger.job_key.group)
            .bind(&trigger.description)
            .bind(trigger.volatile)
            .bind(epoch_millis_or_sentinel(trigger.next_fire_time))
            .bind(trigger.prev_fire_time.map(|t| t.timestamp_millis()))
            .bind(trigger.state.as_db_str())
            .bind(trigger.schedule.type_code())
            .bind(trigger.start_time.timestamp_millis())
            .bind(trigger.end_time.map(|t| t.timestamp_millis()))
            .bind(&trigger.calendar_name)
            .bind(trigger.misfire_instruction.as_db_value())
            .bind(&blob)
            .execute(&mut *conn)
            .await;

        match result {
            Ok(_) => {}
            Err(e) if is_unique_violation(&e) => {
                return Err(StoreError::TriggerAlreadyExists(trigger.key.clone()))
            }
            Err(e) => return Err(e.into()),
        }

        self.insert_variant(conn, &trigger.key, &trigger.schedule).await?;
        Ok(())
    }

    async fn insert_variant(
        &self,
        conn: &mut PgConnection,
        key: &TriggerKey,
        schedule: &TriggerSchedule,
    ) -> Result<()> {
        match schedule {
            TriggerSchedule::Simple {
                repeat_count,
                repeat_interval_ms,
                times_triggered,
            } => {
                let table = self.gw.table("SIMPLE_TRIGGERS");
                let sql = format!(
                    "INSERT INTO {table} (TRIGGER_NAME, TRIGGER_GROUP, REPEAT_COUNT, REPEAT_INTERVAL, TIMES_TRIGGERED) \
                     VALUES ($1, $2, $3, $4, $5)"
                );
                sqlx::query(&sql)
                    .bind(&key.name)
                    .bind(&key.group)
                    .bind(repeat_count)
                    .bind(repeat_interval_ms)
                    .bind(times_triggered)
                    .execute(&mut *conn)
                    .await?;
            }
            TriggerSchedule::Cron { expression, timezone } => {
                let table = self.gw.table("CRON_TRIGGERS");
                let sql = format!(
                    "INSERT INTO {table} (TRIGGER_NAME, TRIGGER_GROUP, CRON_EXPRESSION, TIME_ZONE_ID) \
                     VALUES ($1, $2, $3, $4)"
                );
                sqlx::query(&sql)
                    .bind(&key.name)
                    .bind(&key.group)
                    .bind(expression)
                    .bind(timezone)
                    .execute(&mut *conn)
                    .await?;
            }
            TriggerSchedule::Blob { payload } => {
                let table = self.gw.table("BLOB_TRIGGERS");
                let sql = format!(
                    "INSERT INTO {table} (TRIGGER_NAME, TRIGGER_GROUP, BLOB_DATA) VALUES ($1, $2, $3)"
                );
                sqlx::query(&sql)
                    .bind(&key.name)
                    .bind(&key.group)
                    .bind(payload)
                    .execute(&mut *conn)
                    .await?;
            }
        }
        Ok(())
    }

    async fn delete_variant(&self, conn: &mut PgConnection, key: &TriggerKey, type_code: &str) -> Result<()> {
        let bare_table = match type_code {
            "SIMPLE" => "SIMPLE_TRIGGERS",
            "CRON" => "CRON_TRIGGERS",
            "BLOB" => "BLOB_TRIGGERS",
            other => return Err(StoreError::Codec(format!("unknown TRIGGER_TYPE '{other}'"))),
        };
        let table = self.gw.table(bare_table);
        let sql = format!("DELETE FROM {table} WHERE TRIGGER_NAME = $1 AND TRIGGER_GROUP = $2");
        sqlx::query(&sql).bind(&key.name).bind(&key.group).execute(&mut *conn).await?;
        Ok(())
    }

    /// Bump a simple trigger's fire count by one. A no-op for cron/blob
    /// variants, which carry no `TIMES_TRIGGERED` column. Called by firing
    /// so a finite `repeat_count` is actually exhausted instead of looping
    /// forever.
    pub async fn increment_times_triggered(
        &self,
        conn: &mut PgConnection,
        key: &TriggerKey,
        type_code: &str,
    ) -> Result<()> {
        if type_code != "SIMPLE" {
            return Ok(());
        }
        let table = self.gw.table("SIMPLE_TRIGGERS");
        let sql = format!(
            "UPDATE {table} SET TIMES_TRIGGERED = TIMES_TRIGGERED + 1 \
             WHERE TRIGGER_NAME = $1 AND TRIGGER_GROUP = $2"
        );
        sqlx::query(&sql).bind(&key.name).bind(&key.group).execute(&mut *conn).await?;
        Ok(())
    }

    pub async fn replace_listeners(
        &self,
        conn: &mut PgConnection,
        key: &TriggerKey,
        listener_names: &[String],
    ) -> Result<()> {
        let table = self.gw.table("TRIGGER_LISTENERS");
        let delete_sql = format!("DELETE FROM {table} WHERE TRIGGER_NAME = $1 AND TRIGGER_GROUP = $2");
        sqlx::query(&delete_sql).bind(&key.name).bind(&key.group).execute(&mut *conn).await?;

        let insert_sql = format!(
            "INSERT INTO {table} (TRIGGER_NAME, TRIGGER_GROUP, TRIGGER_LISTENER) VALUES ($1, $2, $3)"
        );
        for listener in listener_names {
            sqlx::query(&insert_sql)
                .bind(&key.name)
                .bind(&key.group)
                .bind(listener)
                .execute(&mut *conn)
                .await?;
        }
        Ok(())
    }

    /// Update the base row, its variant row, and (when `update_job_data`)
    /// the job-data blob. Honors the façade's dirty-flag write-skip
    /// optimization — when `update_job_data` is false, `JOB_DATA` is left
    /// untouched rather than rewritten with a possibly-stale encoding.
    pub async fn update(
        &self,
        conn: &mut PgConnection,
        trigger: &Trigger,
        update_job_data: bool,
    ) -> Result<()> {
        let table = self.gw.table("TRIGGERS");

        if update_job_data {
            let codec = codec_for(self.use_properties);
            let blob = codec.encode(&trigger.job_data)?;
            let sql = format!(
                "UPDATE {table} SET DESCRIPTION = $1, IS_VOLATILE = $2, NEXT_FIRE_TIME = $3, \
                 PREV_FIRE_TIME = $4, TRIGGER_STATE = $5, START_TIME = $6, END_TIME = $7, \
                 CALENDAR_NAME = $8, MISFIRE_INSTR = $9, JOB_DATA = $10 \
                 WHERE TRIGGER_NAME = $11 AND TRIGGER_GROUP = $12"
            );
            sqlx::query(&sql)
                .bind(&trigger.description)
                .bind(trigger.volatile)
                .bind(epoch_millis_or_sentinel(trigger.next_fire_time))
                .bind(trigger.prev_fire_time.map(|t| t.timestamp_millis()))
                .bind(trigger.state.as_db_str())
                .bind(trigger.start_time.timestamp_millis())
                .bind(trigger.end_time.map(|t| t.timestamp_millis()))
                .bind(&trigger.calendar_name)
                .bind(trigger.misfire_instruction.as_db_value())
                .bind(&blob)
                .bind(&trigger.key.name)
                .bind(&trigger.key.group)
                .execute(&mut *conn)
                .await?;
        } else {
            let sql = format!(
                "UPDATE {table} SET DESCRIPTION = $1, IS_VOLATILE = $2, NEXT_FIRE_TIME = $3, \
                 PREV_FIRE_TIME = $4, TRIGGER_STATE = $5, START_TIME = $6, END_TIME = $7, \
                 CALENDAR_NAME = $8, MISFIRE_INSTR = $9 \
                 WHERE TRIGGER_NAME = $10 AND TRIGGER_GROUP = $11"
            );
            sqlx::query(&sql)
                .bind(&trigger.description)
                .bind(trigger.volatile)
                .bind(epoch_millis_or_sentinel(trigger.next_fire_time))
                .bind(trigger.prev_fire_time.map(|t| t.timestamp_millis()))
                .bind(trigger.state.as_db_str())
                .bind(trigger.start_time.timestamp_millis())
                .bind(trigger.end_time.map(|t| t.timestamp_millis()))
                .bind(&trigger.calendar_name)
                .bind(trigger.misfire_instruction.as_db_value())
                .bind(&trigger.key.name)
                .bind(&trigger.key.group)
                .execute(&mut *conn)
                .await?;
        }

        self.delete_variant(conn, &trigger.key, trigger.schedule.type_code()).await?;
        self.insert_variant(conn, &trigger.key, &trigger.schedule).await
    }

    /// Delete a trigger, cascading to its variant row, listener rows and
    /// any fired-trigger ledger entries. If the owning job is non-durable
    /// and this was its last trigger, the job is deleted too.
    pub async fn delete(
        &self,
        conn: &mut PgConnection,
        key: &TriggerKey,
        job_repo: &super::job::JobRepository,
    ) -> Result<bool> {
        let Some(trigger) = self.get(conn, key).await? else {
            return Ok(false);
        };

        self.delete_variant(conn, key, trigger.schedule.type_code()).await?;

        let listeners_table = self.gw.table("TRIGGER_LISTENERS");
        let delete_listeners =
            format!("DELETE FROM {listeners_table} WHERE TRIGGER_NAME = $1 AND TRIGGER_GROUP = $2");
        sqlx::query(&delete_listeners).bind(&key.name).bind(&key.group).execute(&mut *conn).await?;

        let fired_table = self.gw.table("FIRED_TRIGGERS");
        let delete_fired = format!("DELETE FROM {fired_table} WHERE TRIGGER_NAME = $1 AND TRIGGER_GROUP = $2");
        sqlx::query(&delete_fired).bind(&key.name).bind(&key.group).execute(&mut *conn).await?;

        let table = self.gw.table("TRIGGERS");
        let delete_trigger = format!("DELETE FROM {table} WHERE TRIGGER_NAME = $1 AND TRIGGER_GROUP = $2");
        let result = sqlx::query(&delete_trigger).bind(&key.name).bind(&key.group).execute(&mut *conn).await?;

        if let Some(job) = job_repo.get(conn, &trigger.job_key).await? {
            if !job.durable {
                let remaining = job_repo.trigger_count(conn, &trigger.job_key).await?;
                if remaining == 0 {
                    job_repo.delete(conn, &trigger.job_key).await?;
                }
            }
        }

        Ok(result.rows_affected() > 0)
    }

    pub async fn get(&self, conn: &mut PgConnection, key: &TriggerKey) -> Result<Option<Trigger>> {
        let table = self.gw.table("TRIGGERS");
        let sql = format!(
            "SELECT TRIGGER_NAME, TRIGGER_GROUP, JOB_NAME, JOB_GROUP, DESCRIPTION, IS_VOLATILE, \
             NEXT_FIRE_TIME, PREV_FIRE_TIME, TRIGGER_STATE, TRIGGER_TYPE, START_TIME, END_TIME, \
             CALENDAR_NAME, MISFIRE_INSTR, JOB_DATA \
             FROM {table} WHERE TRIGGER_NAME = $1 AND TRIGGER_GROUP = $2"
        );

        let row = sqlx::query(&sql).bind(&key.name).bind(&key.group).fetch_optional(&mut *conn).await?;
        let Some(row) = row else { return Ok(None) };

        let type_code: String = row.try_get("TRIGGER_TYPE")?;
        let schedule = self.get_variant(conn, key, &type_code).await?;

        let job_data_bytes: Option<Vec<u8>> = row.try_get("JOB_DATA")?;
        let codec = codec_for(self.use_properties);
        let job_data = match job_data_bytes {
            Some(bytes) => codec.decode(&bytes)?,
            None => JobDataMap::new(),
        };

        let next_fire_ms: i64 = row.try_get("NEXT_FIRE_TIME")?;
        let prev_fire_ms: Option<i64> = row.try_get("PREV_FIRE_TIME")?;
        let start_ms: i64 = row.try_get("START_TIME")?;
        let end_ms: Option<i64> = row.try_get("END_TIME")?;
        let state_str: String = row.try_get("TRIGGER_STATE")?;
        let misfire_instr: Option<i32> = row.try_get("MISFIRE_INSTR")?;

        Ok(Some(Trigger {
            key: key.clone(),
            job_key: JobKey::new(row.try_get::<String, _>("JOB_NAME")?, row.try_get::<String, _>("JOB_GROUP")?),
            description: row.try_get("DESCRIPTION")?,
            volatile: row.try_get("IS_VOLATILE")?,
            next_fire_time: sentinel_to_time(next_fire_ms),
            prev_fire_time: prev_fire_ms.and_then(sentinel_to_time),
            start_time: sentinel_to_time(start_ms).unwrap_or_default(),
            end_time: end_ms.and_then(sentinel_to_time),
            calendar_name: row.try_get("CALENDAR_NAME")?,
            misfire_instruction: MisfireInstruction::from_db_value(misfire_instr.unwrap_or(0)),
            state: TriggerState::from_db_str(&state_str)
                .ok_or_else(|| StoreError::Codec(format!("unrecognized TRIGGER_STATE '{state_str}'")))?,
            job_data,
            schedule,
        }))
    }

    async fn get_variant(
        &self,
        conn: &mut PgConnection,
        key: &TriggerKey,
        type_code: &str,
    ) -> Result<TriggerSchedule> {
        match type_code {
            "SIMPLE" => {
                let table = self.gw.table("SIMPLE_TRIGGERS");
                let sql = format!(
                    "SELECT REPEAT_COUNT, REPEAT_INTERVAL, TIMES_TRIGGERED FROM {table} \
                     WHERE TRIGGER_NAME = $1 AND TRIGGER_GROUP = $2"
                );
                let row = sqlx::query(&sql).bind(&key.name).bind(&key.group).fetch_one(&mut *conn).await?;
                Ok(TriggerSchedule::Simple {
                    repeat_count: row.try_get("REPEAT_COUNT")?,
                    repeat_interval_ms: row.try_get("REPEAT_INTERVAL")?,
                    times_triggered: row.try_get("TIMES_TRIGGERED")?,
                })
            }
            "CRON" => {
                let table = self.gw.table("CRON_TRIGGERS");
                let sql = format!(
                    "SELECT CRON_EXPRESSION, TIME_ZONE_ID FROM {table} WHERE TRIGGER_NAME = $1 AND TRIGGER_GROUP = $2"
                );
                let row = sqlx::query(&sql).bind(&key.name).bind(&key.group).fetch_one(&mut *conn).await?;
                Ok(TriggerSchedule::Cron {
                    expression: row.try_get("CRON_EXPRESSION")?,
                    timezone: row.try_get::<Option<String>, _>("TIME_ZONE_ID")?.unwrap_or_else(|| "UTC".to_string()),
                })
            }
            "BLOB" => {
                let table = self.gw.table("BLOB_TRIGGERS");
                let sql = format!("SELECT BLOB_DATA FROM {table} WHERE TRIGGER_NAME = $1 AND TRIGGER_GROUP = $2");
                let row = sqlx::query(&sql).bind(&key.name).bind(&key.group).fetch_one(&mut *conn).await?;
                Ok(TriggerSchedule::Blob {
                    payload: row.try_get::<Option<Vec<u8>>, _>("BLOB_DATA")?.unwrap_or_default(),
                })
            }
            other => Err(StoreError::Codec(format!("unknown TRIGGER_TYPE '{other}'"))),
        }
    }

    pub async fn trigger_state(&self, conn: &mut PgConnection, key: &TriggerKey) -> Result<Option<TriggerState>> {
        let table = self.gw.table("TRIGGERS");
        let sql = format!("SELECT TRIGGER_STATE FROM {table} WHERE TRIGGER_NAME = $1 AND TRIGGER_GROUP = $2");
        let row = sqlx::query(&sql).bind(&key.name).bind(&key.group).fetch_optional(&mut *conn).await?;
        match row {
            None => Ok(None),
            Some(row) => {
                let s: String = row.try_get("TRIGGER_STATE")?;
                Ok(TriggerState::from_db_str(&s))
            }
        }
    }

    pub async fn group_names(&self, conn: &mut PgConnection) -> Result<Vec<String>> {
        let table = self.gw.table("TRIGGERS");
        let sql = format!("SELECT DISTINCT TRIGGER_GROUP FROM {table}");
        let rows = sqlx::query(&sql).fetch_all(&mut *conn).await?;
        rows.into_iter()
            .map(|r| r.try_get::<String, _>("TRIGGER_GROUP").map_err(Into::into))
            .collect()
    }

    pub async fn names_in_group(&self, conn: &mut PgConnection, group: &str) -> Result<Vec<String>> {
        let table = self.gw.table("TRIGGERS");
        let sql = format!("SELECT TRIGGER_NAME FROM {table} WHERE TRIGGER_GROUP = $1");
        let rows = sqlx::query(&sql).bind(group).fetch_all(&mut *conn).await?;
        rows.into_iter()
            .map(|r| r.try_get::<String, _>("TRIGGER_NAME").map_err(Into::into))
            .collect()
    }

    /// Keys of every other trigger for the same job, used by the stateful
    /// blocking/unblocking fan-out.
    pub async fn sibling_keys(
        &self,
        conn: &mut PgConnection,
        job_key: &JobKey,
        exclude: &TriggerKey,
    ) -> Result<Vec<TriggerKey>> {
        let table = self.gw.table("TRIGGERS");
        let sql = format!(
            "SELECT TRIGGER_NAME, TRIGGER_GROUP FROM {table} \
             WHERE JOB_NAME = $1 AND JOB_GROUP = $2 AND NOT (TRIGGER_NAME = $3 AND TRIGGER_GROUP = $4)"
        );
        let rows = sqlx::query(&sql)
            .bind(&job_key.name)
            .bind(&job_key.group)
            .bind(&exclude.name)
            .bind(&exclude.group)
            .fetch_all(&mut *conn)
            .await?;
        rows.into_iter()
            .map(|r| {
                Ok(TriggerKey::new(
                    r.try_get::<String, _>("TRIGGER_NAME")?,
                    r.try_get::<String, _>("TRIGGER_GROUP")?,
                ))
            })
            .collect()
    }

    /// Is `group` in `PAUSED_TRIGGER_GRPS`?
    pub async fn group_is_paused(&self, conn: &mut PgConnection, group: &str) -> Result<bool> {
        let table = self.gw.table("PAUSED_TRIGGER_GRPS");
        let sql = format!("SELECT 1 AS present FROM {table} WHERE TRIGGER_GROUP = $1");
        let row = sqlx::query(&sql).bind(group).fetch_optional(&mut *conn).await?;
        Ok(row.is_some())
    }
}
