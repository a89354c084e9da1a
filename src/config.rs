//! Store configuration, read directly from the environment — a handful of
//! scalar options don't warrant pulling in a config-file framework.

use std::env;

use crate::error::{Result, StoreError};

#[derive(Debug, Clone)]
pub struct JobStoreConfig {
    pub database_url: String,
    pub table_prefix: String,
    pub instance_id: String,
    pub use_properties: bool,
    pub misfire_threshold_ms: i64,
    pub cluster_checkin_interval_ms: i64,
}

impl JobStoreConfig {
    /// Read configuration from environment variables, falling back to the
    /// production-safe defaults.
    pub fn from_env() -> Result<Self> {
        let database_url = env::var("DATABASE_URL")
            .map_err(|_| StoreError::Config("DATABASE_URL is not set".to_string()))?;

        let table_prefix = env::var("JOBSTORE_TABLE_PREFIX").unwrap_or_else(|_| "QRTZ_".to_string());
        let instance_id = env::var("JOBSTORE_INSTANCE_ID")
            .unwrap_or_else(|_| format!("AUTO-{}", uuid::Uuid::new_v4()));
        let use_properties = env::var("JOBSTORE_USE_PROPERTIES")
            .map(|v| v == "true" || v == "1")
            .unwrap_or(false);
        let misfire_threshold_ms = env::var("JOBSTORE_MISFIRE_THRESHOLD_MS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(60_000);
        let cluster_checkin_interval_ms = env::var("JOBSTORE_CLUSTER_CHECKIN_INTERVAL_MS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(15_000);

        Ok(Self {
            database_url,
            table_prefix,
            instance_id,
            use_properties,
            misfire_threshold_ms,
            cluster_checkin_interval_ms,
        })
    }
}
