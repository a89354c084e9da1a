//! Error types for the job store.
//!
//! `StoreError` is the single error type every public repository and
//! acquisition/cluster/misfire operation returns. A lost race on a
//! conditional state update is never represented here — see
//! [`crate::state_machine::conditional_update_state`], which returns a plain
//! `bool` instead, so "another instance won" can never be confused with a
//! real failure.

use thiserror::Error;

use crate::model::{JobKey, TriggerKey};

/// Errors surfaced by the job store to its caller.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("job already exists: {0}")]
    JobAlreadyExists(JobKey),

    #[error("trigger already exists: {0}")]
    TriggerAlreadyExists(TriggerKey),

    #[error("calendar already exists: {0}")]
    CalendarAlreadyExists(String),

    #[error("database error: {0}")]
    Db(#[from] sqlx::Error),

    #[error("job class could not be resolved: {0}")]
    ClassLoad(String),

    #[error("calendar '{0}' is still referenced by one or more triggers")]
    CalendarInUse(String),

    #[error("job-data codec constraint violated: {0}")]
    Codec(String),

    #[error("trigger '{0}' references unknown job '{1}'")]
    UnknownJob(TriggerKey, JobKey),

    #[error("configuration error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, StoreError>;
