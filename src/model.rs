//! Persistent data model: jobs, triggers, calendars, the fired-trigger
//! ledger and scheduler-instance heartbeats.
//!
//! Identity is always `(name, group)` or a bare name; entities hold foreign
//! keys, never pointers, matching the "ownership is purely logical" design
//! note in the specification (no in-memory object graph spans transactions).

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The reserved trigger group synthetic recovery triggers are created in.
pub const RECOVERY_GROUP: &str = "RECOVERY";

/// Job-data entries whose keys carry this prefix are stripped by the codec
/// before serialization, mirroring the façade's "transient" marking.
pub const TRANSIENT_PREFIX: &str = "__transient_";

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct JobKey {
    pub name: String,
    pub group: String,
}

impl JobKey {
    pub fn new(name: impl Into<String>, group: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            group: group.into(),
        }
    }
}

impl fmt::Display for JobKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.group, self.name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TriggerKey {
    pub name: String,
    pub group: String,
}

impl TriggerKey {
    pub fn new(name: impl Into<String>, group: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            group: group.into(),
        }
    }

    pub fn recovery(original_name: &str) -> Self {
        Self::new(format!("recover_{original_name}"), RECOVERY_GROUP)
    }
}

impl fmt::Display for TriggerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.group, self.name)
    }
}

/// A single job-data value. Binary mode allows any variant; properties mode
/// (`JobStoreConfig::use_properties`) constrains values to `String`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum JobDataValue {
    String(String),
    I64(i64),
    F64(f64),
    Bool(bool),
    Bytes(Vec<u8>),
}

impl JobDataValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            JobDataValue::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn is_string(&self) -> bool {
        matches!(self, JobDataValue::String(_))
    }
}

impl From<&str> for JobDataValue {
    fn from(s: &str) -> Self {
        JobDataValue::String(s.to_string())
    }
}

impl From<String> for JobDataValue {
    fn from(s: String) -> Self {
        JobDataValue::String(s)
    }
}

impl From<i64> for JobDataValue {
    fn from(v: i64) -> Self {
        JobDataValue::I64(v)
    }
}

/// A job's data map, plus the dirty flag the façade uses to gate whether an
/// update rewrites the underlying blob column at all.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobDataMap {
    pub entries: BTreeMap<String, JobDataValue>,
    #[serde(skip)]
    pub dirty: bool,
}

impl JobDataMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<JobDataValue>) {
        self.entries.insert(key.into(), value.into());
        self.dirty = true;
    }

    pub fn get(&self, key: &str) -> Option<&JobDataValue> {
        self.entries.get(key)
    }

    /// Entries with a transient-prefixed key are dropped, never serialized.
    pub fn durable_entries(&self) -> BTreeMap<String, JobDataValue> {
        self.entries
            .iter()
            .filter(|(k, _)| !k.starts_with(TRANSIENT_PREFIX))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }
}

#[derive(Debug, Clone, Default)]
pub struct JobDetail {
    pub key: JobKey,
    pub description: Option<String>,
    pub job_class_name: String,
    pub durable: bool,
    pub volatile: bool,
    pub stateful: bool,
    pub requests_recovery: bool,
    pub job_data: JobDataMap,
    pub listener_names: Vec<String>,
}

/// The state of a trigger, persisted as a short string in `TRIGGER_STATE`.
/// `Deleted` is never written to a row — it is the value callers use to mean
/// "no such trigger" when reading state, modeled instead as `Option::None`
/// from [`crate::repository::trigger::TriggerRepository::trigger_state`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TriggerState {
    Waiting,
    Acquired,
    Executing,
    Paused,
    Blocked,
    PausedBlocked,
    Complete,
    Error,
}

impl TriggerState {
    pub fn as_db_str(self) -> &'static str {
        match self {
            TriggerState::Waiting => "WAITING",
            TriggerState::Acquired => "ACQUIRED",
            TriggerState::Executing => "EXECUTING",
            TriggerState::Paused => "PAUSED",
            TriggerState::Blocked => "BLOCKED",
            TriggerState::PausedBlocked => "PAUSED_BLOCKED",
            TriggerState::Complete => "COMPLETE",
            TriggerState::Error => "ERROR",
        }
    }

    pub fn from_db_str(s: &str) -> Option<Self> {
        Some(match s {
            "WAITING" => TriggerState::Waiting,
            "ACQUIRED" => TriggerState::Acquired,
            "EXECUTING" => TriggerState::Executing,
            "PAUSED" => TriggerState::Paused,
            "BLOCKED" => TriggerState::Blocked,
            "PAUSED_BLOCKED" => TriggerState::PausedBlocked,
            "COMPLETE" => TriggerState::Complete,
            "ERROR" => TriggerState::Error,
            _ => return None,
        })
    }
}

/// Misfire instruction policy codes, as stored in `MISFIRE_INSTR`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MisfireInstruction {
    Smart,
    FireNow,
    DoNothing,
    RescheduleNowWithExistingCount,
}

impl MisfireInstruction {
    pub fn as_db_value(self) -> i32 {
        match self {
            MisfireInstruction::Smart => 0,
            MisfireInstruction::FireNow => 1,
            MisfireInstruction::DoNothing => 2,
            MisfireInstruction::RescheduleNowWithExistingCount => 3,
        }
    }

    pub fn from_db_value(v: i32) -> Self {
        match v {
            1 => MisfireInstruction::FireNow,
            2 => MisfireInstruction::DoNothing,
            3 => MisfireInstruction::RescheduleNowWithExistingCount,
            _ => MisfireInstruction::Smart,
        }
    }
}

/// The discriminated trigger-variant payload (`TRIGGER_TYPE`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum TriggerSchedule {
    Simple {
        repeat_count: i64,
        repeat_interval_ms: i64,
        times_triggered: i64,
    },
    Cron {
        expression: String,
        timezone: String,
    },
    Blob {
        payload: Vec<u8>,
    },
}

impl TriggerSchedule {
    pub fn type_code(&self) -> &'static str {
        match self {
            TriggerSchedule::Simple { .. } => "SIMPLE",
            TriggerSchedule::Cron { .. } => "CRON",
            TriggerSchedule::Blob { .. } => "BLOB",
        }
    }
}

/// A fully materialized trigger row (base + variant).
#[derive(Debug, Clone)]
pub struct Trigger {
    pub key: TriggerKey,
    pub job_key: JobKey,
    pub description: Option<String>,
    pub volatile: bool,
    pub next_fire_time: Option<DateTime<Utc>>,
    pub prev_fire_time: Option<DateTime<Utc>>,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub calendar_name: Option<String>,
    pub misfire_instruction: MisfireInstruction,
    pub state: TriggerState,
    pub job_data: JobDataMap,
    pub schedule: TriggerSchedule,
}

#[derive(Debug, Clone)]
pub struct Calendar {
    pub name: String,
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FiredTriggerState {
    Acquired,
    Executing,
}

impl FiredTriggerState {
    pub fn as_db_str(self) -> &'static str {
        match self {
            FiredTriggerState::Acquired => "ACQUIRED",
            FiredTriggerState::Executing => "EXECUTING",
        }
    }

    pub fn from_db_str(s: &str) -> Option<Self> {
        Some(match s {
            "ACQUIRED" => FiredTriggerState::Acquired,
            "EXECUTING" => FiredTriggerState::Executing,
            _ => return None,
        })
    }
}

/// One in-flight fire instance, owned by exactly one scheduler instance.
#[derive(Debug, Clone)]
pub struct FiredTrigger {
    pub fire_instance_id: String,
    pub trigger_key: TriggerKey,
    pub job_key: Option<JobKey>,
    pub volatile: bool,
    pub instance_id: String,
    pub fired_time: DateTime<Utc>,
    pub sched_time: Option<DateTime<Utc>>,
    pub state: FiredTriggerState,
    pub is_stateful: bool,
    pub requests_recovery: bool,
}

/// A scheduler-instance heartbeat row.
#[derive(Debug, Clone)]
pub struct SchedulerStateRow {
    pub instance_id: String,
    pub last_checkin_time: DateTime<Utc>,
    pub checkin_interval_ms: i64,
    pub recoverer: Option<String>,
}

/// A trigger acquired by this instance, ready to be handed to the façade's
/// executor pool.
#[derive(Debug, Clone)]
pub struct AcquiredTrigger {
    pub fire_instance_id: String,
    pub trigger: Trigger,
}
