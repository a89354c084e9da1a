//! Next-fire-time arithmetic for the two built-in trigger variants, and the
//! misfire-instruction policy that rewrites a trigger's schedule when it is
//! found past due. Cron parsing uses the `cron` crate rather than a
//! hand-rolled evaluator — this store has no business inventing its own
//! calendar math.

use chrono::{DateTime, TimeZone, Utc};
use cron::Schedule as CronSchedule;
use std::str::FromStr;

use crate::error::{Result, StoreError};
use crate::model::{MisfireInstruction, TriggerSchedule};

/// Compute the next fire time strictly after `after`, or `None` if the
/// trigger has no further fires.
pub fn compute_next_fire(
    schedule: &TriggerSchedule,
    after: DateTime<Utc>,
    end_time: Option<DateTime<Utc>>,
) -> Result<Option<DateTime<Utc>>> {
    let candidate = match schedule {
        TriggerSchedule::Simple {
            repeat_count,
            repeat_interval_ms,
            times_triggered,
        } => {
            if *repeat_count >= 0 && *times_triggered >= *repeat_count {
                None
            } else {
                Some(after + chrono::Duration::milliseconds(*repeat_interval_ms))
            }
        }
        TriggerSchedule::Cron { expression, .. } => {
            let parsed = parse_cron(expression)?;
            parsed.after(&after).next()
        }
        TriggerSchedule::Blob { .. } => None,
    };

    Ok(match (candidate, end_time) {
        (Some(t), Some(end)) if t > end => None,
        (c, _) => c,
    })
}

fn parse_cron(expression: &str) -> Result<CronSchedule> {
    CronSchedule::from_str(expression)
        .map_err(|e| StoreError::Codec(format!("invalid cron expression '{expression}': {e}")))
}

/// Apply a misfire instruction, returning the rewritten schedule and the new
/// next-fire-time. `None` for the next-fire-time means the trigger should
/// move straight to `Complete`.
pub fn apply_misfire(
    schedule: &TriggerSchedule,
    instruction: MisfireInstruction,
    now: DateTime<Utc>,
    end_time: Option<DateTime<Utc>>,
) -> Result<(TriggerSchedule, Option<DateTime<Utc>>)> {
    let resolved = resolve_smart(schedule, instruction);

    match resolved {
        MisfireInstruction::FireNow => Ok((schedule.clone(), clamp(Some(now), end_time))),
        MisfireInstruction::DoNothing => {
            let next = compute_next_fire(schedule, now, end_time)?;
            Ok((schedule.clone(), next))
        }
        MisfireInstruction::RescheduleNowWithExistingCount => {
            let rescheduled = match schedule {
                TriggerSchedule::Simple {
                    repeat_count,
                    repeat_interval_ms,
                    times_triggered,
                } => TriggerSchedule::Simple {
                    repeat_count: *repeat_count,
                    repeat_interval_ms: *repeat_interval_ms,
                    times_triggered: *times_triggered,
                },
                other => other.clone(),
            };
            Ok((rescheduled, clamp(Some(now), end_time)))
        }
        MisfireInstruction::Smart => unreachable!("resolve_smart never returns Smart"),
    }
}

fn resolve_smart(schedule: &TriggerSchedule, instruction: MisfireInstruction) -> MisfireInstruction {
    if instruction != MisfireInstruction::Smart {
        return instruction;
    }
    match schedule {
        TriggerSchedule::Simple { .. } => MisfireInstruction::FireNow,
        TriggerSchedule::Cron { .. } => MisfireInstruction::DoNothing,
        TriggerSchedule::Blob { .. } => MisfireInstruction::DoNothing,
    }
}

fn clamp(t: Option<DateTime<Utc>>, end_time: Option<DateTime<Utc>>) -> Option<DateTime<Utc>> {
    match (t, end_time) {
        (Some(t), Some(end)) if t > end => None,
        (t, _) => t,
    }
}

/// Convert a nullable fire time to its on-disk `i64` encoding: `-1` means
/// "no further fires", applied uniformly on both insert and update so a
/// completed trigger's `NEXT_FIRE_TIME` column stays a plain `BIGINT`
/// rather than nullable sentinel logic living in every caller.
pub fn epoch_millis_or_sentinel(t: Option<DateTime<Utc>>) -> i64 {
    t.map(|t| t.timestamp_millis()).unwrap_or(-1)
}

/// The inverse of [`epoch_millis_or_sentinel`].
pub fn sentinel_to_time(ms: i64) -> Option<DateTime<Utc>> {
    if ms < 0 {
        None
    } else {
        Utc.timestamp_millis_opt(ms).single()
    }
}
