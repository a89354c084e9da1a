//! Smoke test for a job store deployment: connects using `JobStoreConfig`,
//! verifies every table the schema (`migrations/0001_init.sql`) defines is
//! present under the configured prefix, and checks in a throwaway
//! scheduler-instance heartbeat. Intended for operators standing up a new
//! environment, not for the test suite (see `tests/` for that).

use sqlx::postgres::PgPoolOptions;
use tracing::{error, info};

use jobstore::cluster::ClusterManager;
use jobstore::{Gateway, JobStoreConfig};

const REQUIRED_TABLES: &[&str] = &[
    "JOB_DETAILS",
    "JOB_LISTENERS",
    "TRIGGERS",
    "SIMPLE_TRIGGERS",
    "CRON_TRIGGERS",
    "BLOB_TRIGGERS",
    "TRIGGER_LISTENERS",
    "CALENDARS",
    "PAUSED_TRIGGER_GRPS",
    "FIRED_TRIGGERS",
    "SCHEDULER_STATE",
    "LOCKS",
];

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    let config = JobStoreConfig::from_env()?;
    info!(table_prefix = %config.table_prefix, instance_id = %config.instance_id, "starting job store check");

    let pool = PgPoolOptions::new().max_connections(5).connect(&config.database_url).await?;
    info!("database connection established");

    let mut missing = Vec::new();
    for bare_name in REQUIRED_TABLES {
        let table_name = format!("{}{}", config.table_prefix, bare_name);
        let exists: Option<bool> = sqlx::query_scalar(
            "SELECT EXISTS(SELECT 1 FROM information_schema.tables WHERE table_name = $1)",
        )
        .bind(&table_name)
        .fetch_one(&pool)
        .await?;

        if exists == Some(true) {
            info!(table = %table_name, "present");
        } else {
            error!(table = %table_name, "missing");
            missing.push(table_name);
        }
    }

    if !missing.is_empty() {
        return Err(format!("missing tables: {}", missing.join(", ")).into());
    }

    let gw = Gateway::new(pool.clone(), config.table_prefix.clone());
    let cluster = ClusterManager::new(gw);
    let mut conn = pool.acquire().await?;
    cluster
        .check_in(&mut conn, &config.instance_id, chrono::Utc::now(), config.cluster_checkin_interval_ms)
        .await?;
    info!(instance_id = %config.instance_id, "heartbeat check-in succeeded");

    Ok(())
}
