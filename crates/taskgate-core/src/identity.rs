//! Task identity: deterministic dedup ids and trailing-edge throttle buckets.
//!
//! Everything here is pure; the current time is always passed in.

use crate::options::{Dedup, DispatchOptions, Throttle};
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use std::time::Duration;

const MICROS_PER_SEC: i64 = 1_000_000;

/// Resolved identity of one dispatch call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskIdentity {
    pub dedup_id: Option<String>,
    /// Set when throttling computed the execution time.
    pub schedule_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThrottledSchedule {
    pub schedule_at: DateTime<Utc>,
    pub effective_seed: String,
}

/// Lowercase hex SHA-256 of `seed`.
pub fn hash_seed(seed: &str) -> String {
    hex::encode(Sha256::digest(seed.as_bytes()))
}

/// Full queue task name for a dedup id.
pub fn task_name(queue_path: &str, id: &str) -> String {
    format!("{queue_path}/tasks/{id}")
}

/// Dedup id for `options` at `now`, or `None` when the queue should assign a name.
pub fn build_dedup_id(options: &DispatchOptions, now: DateTime<Utc>) -> Result<Option<String>> {
    Ok(resolve_identity(options, now)?.dedup_id)
}

pub fn resolve_identity(options: &DispatchOptions, now: DateTime<Utc>) -> Result<TaskIdentity> {
    match options.dedup() {
        Dedup::None => Ok(TaskIdentity {
            dedup_id: None,
            schedule_at: None,
        }),
        Dedup::Id(id) => Ok(TaskIdentity {
            dedup_id: Some(id.clone()),
            schedule_at: None,
        }),
        Dedup::Seed {
            seed,
            throttle: None,
        } => Ok(TaskIdentity {
            dedup_id: Some(hash_seed(seed)),
            schedule_at: None,
        }),
        Dedup::Seed {
            seed,
            throttle: Some(Throttle { interval, delay }),
        } => {
            let throttled = build_throttled_schedule(seed, *interval, *delay, now)?;
            Ok(TaskIdentity {
                dedup_id: Some(hash_seed(&throttled.effective_seed)),
                schedule_at: Some(throttled.schedule_at),
            })
        }
    }
}

/// Places `now` in a bucket of length `interval` and schedules execution `delay` after the bucket
/// closes. A call landing exactly on a boundary opens the next bucket.
///
/// The effective seed embeds the execution time so every call in one bucket shares a dedup id,
/// while a later bucket never collides with one that was already dispatched.
pub fn build_throttled_schedule(
    seed: &str,
    interval: Duration,
    delay: Duration,
    now: DateTime<Utc>,
) -> Result<ThrottledSchedule> {
    let interval_us = duration_micros(interval)?;
    if interval_us <= 0 {
        return Err(Error::configuration("throttle interval must be positive"));
    }
    let delay_us = duration_micros(delay)?;

    let now_us = now.timestamp_micros();
    let bucket_end = now_us
        .div_euclid(interval_us)
        .checked_add(1)
        .and_then(|n| n.checked_mul(interval_us))
        .ok_or_else(|| Error::configuration("throttle bucket out of range"))?;
    let run_at_us = bucket_end
        .checked_add(delay_us)
        .ok_or_else(|| Error::configuration("throttle delay out of range"))?;

    let schedule_at = DateTime::<Utc>::from_timestamp_micros(run_at_us)
        .ok_or_else(|| Error::configuration("throttled schedule time out of range"))?;
    let effective_seed = format!(
        "{seed}@{}.{:06}",
        run_at_us.div_euclid(MICROS_PER_SEC),
        run_at_us.rem_euclid(MICROS_PER_SEC)
    );

    Ok(ThrottledSchedule {
        schedule_at,
        effective_seed,
    })
}

fn duration_micros(d: Duration) -> Result<i64> {
    i64::try_from(d.as_micros()).map_err(|_| Error::configuration("duration too large"))
}
