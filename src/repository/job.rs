//! Job repository: CRUD for `JOB_DETAILS` and its listener associations.
//!
//! Each method takes its own connection so callers control transaction
//! boundaries, one method per operation, `anyhow`-free typed errors via
//! [`StoreError`].

use std::sync::Arc;

use sqlx::{PgConnection, Row};

use crate::codec::codec_for;
use crate::error::{Result, StoreError};
use crate::gateway::{is_unique_violation, Gateway};
use crate::model::{JobDataMap, JobDetail, JobKey};
use crate::resolver::ClassResolver;

#[derive(Clone)]
pub struct JobRepository {
    gw: Gateway,
    use_properties: bool,
    resolver: Option<Arc<dyn ClassResolver>>,
}

impl JobRepository {
    pub fn new(gw: Gateway, use_properties: bool) -> Self {
        Self { gw, use_properties, resolver: None }
    }

    /// Validate `job_class_name` against `resolver` on every `insert`/
    /// `update`. Without one configured, class names pass through
    /// unchecked — the façade is free to validate them itself instead.
    pub fn with_resolver(mut self, resolver: Arc<dyn ClassResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    fn check_class(&self, job: &JobDetail) -> Result<()> {
        if let Some(resolver) = &self.resolver {
            resolver.resolve(&job.job_class_name)?;
        }
        Ok(())
    }

    /// Insert a new job and cascade-insert its listener associations.
    /// Fails with [`StoreError::JobAlreadyExists`] if the key is taken.
    pub async fn insert(&self, conn: &mut PgConnection, job: &JobDetail) -> Result<()> {
        self.check_class(job)?;
        let codec = codec_for(self.use_properties);
        let blob = codec.encode(&job.job_data)?;
        let table = self.gw.table("JOB_DETAILS");

        let sql = format!(
            "INSERT INTO {table} \
             (JOB_NAME, JOB_GROUP, DESCRIPTION, JOB_CLASS_NAME, IS_DURABLE, IS_VOLATILE, \
              IS_STATEFUL, REQUESTS_RECOVERY, JOB_DATA) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)"
        );

        let result = sqlx::query(&sql)
            .bind(&job.key.name)
            .bind(&job.key.group)
            .bind(&job.description)
            .bind(&job.job_class_name)
            .bind(job.durable)
            .bind(job.volatile)
            .bind(job.stateful)
            .bind(job.requests_recovery)
            .bind(&blob)
            .execute(&mut *conn)
            .await;

        match result {
            Ok(_) => {}
            Err(e) if is_unique_violation(&e) => {
                return Err(StoreError::JobAlreadyExists(job.key.clone()))
            }
            Err(e) => return Err(e.into()),
        }

        self.replace_listeners(conn, &job.key, &job.listener_names).await
    }

    /// Replace a job's listener set: delete-then-insert, inside the
    /// caller's transaction.
    pub async fn replace_listeners(
        &self,
        conn: &mut PgConnection,
        key: &JobKey,
        listener_names: &[String],
    ) -> Result<()> {
        let listeners_table = self.gw.table("JOB_LISTENERS");
        let delete_sql = format!("DELETE FROM {listeners_table} WHERE JOB_NAME = $1 AND JOB_GROUP = $2");
        sqlx::query(&delete_sql)
            .bind(&key.name)
            .bind(&key.group)
            .execute(&mut *conn)
            .await?;

        let insert_sql =
            format!("INSERT INTO {listeners_table} (JOB_NAME, JOB_GROUP, JOB_LISTENER) VALUES ($1, $2, $3)");
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

    /// Update a job's base row and its listener set in one transaction.
    pub async fn update(&self, conn: &mut PgConnection, job: &JobDetail) -> Result<()> {
        self.check_class(job)?;
        let codec = codec_for(self.use_properties);
        let blob = codec.encode(&job.job_data)?;
        let table = self.gw.table("JOB_DETAILS");

        let sql = format!(
            "UPDATE {table} SET DESCRIPTION = $1, JOB_CLASS_NAME = $2, IS_DURABLE = $3, \
             IS_VOLATILE = $4, IS_STATEFUL = $5, REQUESTS_RECOVERY = $6, JOB_DATA = $7 \
             WHERE JOB_NAME = $8 AND JOB_GROUP = $9"
        );

        sqlx::query(&sql)
            .bind(&job.description)
            .bind(&job.job_class_name)
            .bind(job.durable)
            .bind(job.volatile)
            .bind(job.stateful)
            .bind(job.requests_recovery)
            .bind(&blob)
            .bind(&job.key.name)
            .bind(&job.key.group)
            .execute(&mut *conn)
            .await?;

        self.replace_listeners(conn, &job.key, &job.listener_names).await
    }

    /// Delete a job's listener rows. Callers must have already deleted all
    /// referencing triggers (`TriggerRepository::delete` cascades that for
    /// a single trigger; deleting the last trigger of a non-durable job
    /// deletes the job as a side effect of that call, per the Job
    /// invariant).
    pub async fn delete(&self, conn: &mut PgConnection, key: &JobKey) -> Result<bool> {
        let listeners_table = self.gw.table("JOB_LISTENERS");
        let delete_listeners = format!("DELETE FROM {listeners_table} WHERE JOB_NAME = $1 AND JOB_GROUP = $2");
        sqlx::query(&delete_listeners)
            .bind(&key.name)
            .bind(&key.group)
            .execute(&mut *conn)
            .await?;

        let table = self.gw.table("JOB_DETAILS");
        let delete_job = format!("DELETE FROM {table} WHERE JOB_NAME = $1 AND JOB_GROUP = $2");
        let result = sqlx::query(&delete_job)
            .bind(&key.name)
            .bind(&key.group)
            .execute(&mut *conn)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    pub async fn get(&self, conn: &mut PgConnection, key: &JobKey) -> Result<Option<JobDetail>> {
        let table = self.gw.table("JOB_DETAILS");
        let sql = format!(
            "SELECT JOB_NAME, JOB_GROUP, DESCRIPTION, JOB_CLASS_NAME, IS_DURABLE, IS_VOLATILE, \
             IS_STATEFUL, REQUESTS_RECOVERY, JOB_DATA FROM {table} WHERE JOB_NAME = $1 AND JOB_GROUP = $2"
        );

        let row = sqlx::query(&sql)
            .bind(&key.name)
            .bind(&key.group)
            .fetch_optional(&mut *conn)
            .await?;

        let Some(row) = row else { return Ok(None) };

        let job_data_bytes: Option<Vec<u8>> = row.try_get("JOB_DATA")?;
        let codec = codec_for(self.use_properties);
        let job_data = match job_data_bytes {
            Some(bytes) => codec.decode(&bytes)?,
            None => JobDataMap::new(),
        };

        let listeners = self.listener_names(conn, key).await?;

        Ok(Some(JobDetail {
            key: key.clone(),
            description: row.try_get("DESCRIPTION")?,
            job_class_name: row.try_get("JOB_CLASS_NAME")?,
            durable: row.try_get("IS_DURABLE")?,
            volatile: row.try_get("IS_VOLATILE")?,
            stateful: row.try_get("IS_STATEFUL")?,
            requests_recovery: row.try_get("REQUESTS_RECOVERY")?,
            job_data,
            listener_names: listeners,
        }))
    }

    pub async fn listener_names(&self, conn: &mut PgConnection, key: &JobKey) -> Result<Vec<String>> {
        let table = self.gw.table("JOB_LISTENERS");
        let sql = format!("SELECT JOB_LISTENER FROM {table} WHERE JOB_NAME = $1 AND JOB_GROUP = $2");
        let rows = sqlx::query(&sql)
            .bind(&key.name)
            .bind(&key.group)
            .fetch_all(&mut *conn)
            .await?;
        rows.into_iter()
            .map(|r| r.try_get::<String, _>("JOB_LISTENER").map_err(Into::into))
            .collect()
    }

    pub async fn group_names(&self, conn: &mut PgConnection) -> Result<Vec<String>> {
        let table = self.gw.table("JOB_DETAILS");
        let sql = format!("SELECT DISTINCT JOB_GROUP FROM {table}");
        let rows = sqlx::query(&sql).fetch_all(&mut *conn).await?;
        rows.into_iter()
            .map(|r| r.try_get::<String, _>("JOB_GROUP").map_err(Into::into))
            .collect()
    }

    pub async fn names_in_group(&self, conn: &mut PgConnection, group: &str) -> Result<Vec<String>> {
        let table = self.gw.table("JOB_DETAILS");
        let sql = format!("SELECT JOB_NAME FROM {table} WHERE JOB_GROUP = $1");
        let rows = sqlx::query(&sql).bind(group).fetch_all(&mut *conn).await?;
        rows.into_iter()
            .map(|r| r.try_get::<String, _>("JOB_NAME").map_err(Into::into))
            .collect()
    }

    /// Number of triggers remaining for `key` — used by `TriggerRepository`
    /// to decide whether a non-durable job's last trigger deletion should
    /// cascade into deleting the job itself.
    pub async fn trigger_count(&self, conn: &mut PgConnection, key: &JobKey) -> Result<i64> {
        let table = self.gw.table("TRIGGERS");
        let sql = format!("SELECT COUNT(*) AS n FROM {table} WHERE JOB_NAME = $1 AND JOB_GROUP = $2");
        let row = sqlx::query(&sql)
            .bind(&key.name)
            .bind(&key.group)
            .fetch_one(&mut *conn)
            .await?;
        Ok(row.try_get::<i64, _>("n")?)
    }
}
