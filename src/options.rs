//! Typed option records.
//!
//! Every option the queue recognizes is an explicit field; unknown fields are
//! rejected at parse time (`deny_unknown_fields`). The JSON shape of these
//! records is persisted verbatim in the `opts` field of the job hash, so the
//! scripts and every other client read the same layout.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::backoff::BackoffStrategyFn;

/// Per-job options, stored as JSON in the job hash.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct JobOptions {
    /// Milliseconds to wait before the job may be dispatched.
    #[serde(default, skip_serializing_if = "is_zero_u64")]
    pub delay: u64,

    /// Override for the enqueue wall time (milliseconds since epoch).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,

    /// Total tries allowed, including the first. Zero behaves like one.
    #[serde(default, skip_serializing_if = "is_zero_u32")]
    pub attempts: u32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backoff: Option<BackoffOptions>,

    #[serde(default, skip_serializing_if = "KeepPolicy::is_keep_all")]
    pub remove_on_complete: KeepPolicy,

    #[serde(default, skip_serializing_if = "KeepPolicy::is_keep_all")]
    pub remove_on_fail: KeepPolicy,

    /// Caller-supplied id. Adds with an existing id are idempotent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_id: Option<String>,

    /// 0 = unprioritized; 1..2^21-1, lower dispatches first.
    #[serde(default, skip_serializing_if = "is_zero_u32")]
    pub priority: u32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repeat: Option<RepeatOptions>,

    /// Retained stacktrace entries (default 10).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack_trace_limit: Option<usize>,

    /// Retained log lines in `<id>:logs`. Absent keeps everything.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub keep_logs: Option<usize>,

    /// Rate-limit grouping for this job; pairs with the worker's limiter.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<JobLimitOptions>,

    #[serde(default, skip_serializing_if = "std::ops::Not::not", rename = "fpof")]
    pub fail_parent_on_failure: bool,

    #[serde(default, skip_serializing_if = "std::ops::Not::not", rename = "cpof")]
    pub continue_parent_on_failure: bool,

    #[serde(default, skip_serializing_if = "std::ops::Not::not", rename = "idof")]
    pub ignore_dependency_on_failure: bool,

    #[serde(default, skip_serializing_if = "std::ops::Not::not", rename = "rdof")]
    pub remove_dependency_on_failure: bool,
}

fn is_zero_u64(v: &u64) -> bool {
    *v == 0
}

fn is_zero_u32(v: &u32) -> bool {
    *v == 0
}

impl JobOptions {
    /// Effective number of tries; `attempts: 0` means a single try.
    pub fn max_attempts(&self) -> u32 {
        self.attempts.max(1)
    }

    pub fn stack_trace_limit(&self) -> usize {
        self.stack_trace_limit.unwrap_or(10)
    }
}

/// Rate-limit partition carried by a job.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct JobLimitOptions {
    pub group_key: String,
}

/// `backoff: number | {type, delay?, options?}`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum BackoffOptions {
    /// Bare number: fixed backoff of that many milliseconds.
    Millis(u64),
    Strategy(BackoffStrategyOptions),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct BackoffStrategyOptions {
    #[serde(rename = "type")]
    pub kind: BackoffKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delay: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub options: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum BackoffKind {
    Fixed,
    Exponential,
    /// Resolved from the registered strategy table by name in `options`.
    Custom,
}

/// `removeOnComplete` / `removeOnFail`: `bool | N | {count, age}`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum KeepPolicy {
    Always(bool),
    /// Keep the newest N finished jobs.
    Count(u32),
    Limits(KeepLimits),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct KeepLimits {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub count: Option<u32>,
    /// Maximum age in seconds, measured against `finishedOn`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub age: Option<u64>,
}

impl Default for KeepPolicy {
    fn default() -> Self {
        KeepPolicy::Always(false)
    }
}

impl KeepPolicy {
    pub fn is_keep_all(&self) -> bool {
        matches!(self, KeepPolicy::Always(false))
    }

    /// `(keep_count, max_age_secs)` as the scripts consume them:
    /// count -1 keeps everything, 0 removes immediately, N caps the set;
    /// age 0 means unbounded.
    pub fn script_args(&self) -> (i64, u64) {
        match self {
            KeepPolicy::Always(true) => (0, 0),
            KeepPolicy::Always(false) => (-1, 0),
            KeepPolicy::Count(n) => (*n as i64, 0),
            KeepPolicy::Limits(l) => (l.count.map(|c| c as i64).unwrap_or(-1), l.age.unwrap_or(0)),
        }
    }
}

/// `repeat` options. `pattern` and `every` are mutually exclusive.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct RepeatOptions {
    /// Cron pattern, five or six fields.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pattern: Option<String>,

    /// Fixed interval in milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub every: Option<u64>,

    /// IANA timezone name for `pattern`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tz: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_date: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_date: Option<DateTime<Utc>>,

    /// Maximum number of occurrences to produce.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<u64>,

    /// Fire the first occurrence at upsert time, then follow the pattern.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub immediately: bool,

    /// Evaluate `pattern` in UTC even when `tz` is unset.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub utc: bool,

    /// Base id for materialized occurrences.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_id: Option<String>,

    /// Explicit definition key (legacy format); used verbatim instead of the
    /// hashed fingerprint.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
}

/// Hash used for repeat-key fingerprints.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RepeatKeyHashAlgorithm {
    #[default]
    Md5,
    Sha256,
}

/// Hook overriding next-occurrence computation:
/// `(now_millis, opts, name) -> Ok(Some(millis)) | Ok(None)` where `None`
/// terminates the series.
pub type RepeatStrategyFn = dyn Fn(i64, &RepeatOptions, &str) -> crate::error::Result<Option<i64>>
    + Send
    + Sync;

/// Queue-level tunables that are code, not data.
#[derive(Clone, Default)]
pub struct QueueSettings {
    pub repeat_strategy: Option<Arc<RepeatStrategyFn>>,
    pub repeat_key_hash_algorithm: RepeatKeyHashAlgorithm,
    pub backoff_strategies: HashMap<String, Arc<BackoffStrategyFn>>,
}

impl std::fmt::Debug for QueueSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueSettings")
            .field("repeat_strategy", &self.repeat_strategy.is_some())
            .field(
                "repeat_key_hash_algorithm",
                &self.repeat_key_hash_algorithm,
            )
            .field(
                "backoff_strategies",
                &self.backoff_strategies.keys().collect::<Vec<_>>(),
            )
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct QueueOptions {
    pub prefix: String,
    pub settings: QueueSettings,
    pub default_job_options: JobOptions,
    /// Approximate cap on the `events` stream (`XADD MAXLEN ~`).
    pub max_events_len: u64,
}

impl Default for QueueOptions {
    fn default() -> Self {
        Self {
            prefix: crate::keys::DEFAULT_PREFIX.to_string(),
            settings: QueueSettings::default(),
            default_job_options: JobOptions::default(),
            max_events_len: 10_000,
        }
    }
}

/// Worker rate limiter: at most `max` dispatches per `duration` ms window.
#[derive(Debug, Clone)]
pub struct RateLimiterOptions {
    pub max: u64,
    pub duration: u64,
    /// Partition counters by the job's `opts.limit.groupKey`.
    pub group_limited: bool,
}

#[derive(Debug, Clone)]
pub struct WorkerOptions {
    pub concurrency: usize,
    /// TTL of the per-job lock, milliseconds.
    pub lock_duration: u64,
    /// Renewal cadence; defaults to half the lock duration.
    pub lock_renew_time: Option<u64>,
    pub stalled_interval: u64,
    /// Recoveries allowed before a stalled job is failed.
    pub max_stalled_count: u32,
    pub limiter: Option<RateLimiterOptions>,
    pub autorun: bool,
    pub skip_stalled_check: bool,
    pub skip_lock_renewal: bool,
    /// Longest a fetch blocks on the wake-up marker, milliseconds.
    pub drain_delay: u64,
    pub prefix: String,
    pub settings: QueueSettings,
}

impl Default for WorkerOptions {
    fn default() -> Self {
        Self {
            concurrency: 1,
            lock_duration: 30_000,
            lock_renew_time: None,
            stalled_interval: 30_000,
            max_stalled_count: 1,
            limiter: None,
            autorun: true,
            skip_stalled_check: false,
            skip_lock_renewal: false,
            drain_delay: 5_000,
            prefix: crate::keys::DEFAULT_PREFIX.to_string(),
            settings: QueueSettings::default(),
        }
    }
}

impl WorkerOptions {
    pub fn lock_renew_time(&self) -> u64 {
        self.lock_renew_time.unwrap_or(self.lock_duration / 2)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_options_round_trip() {
        let opts = JobOptions {
            delay: 500,
            attempts: 3,
            backoff: Some(BackoffOptions::Strategy(BackoffStrategyOptions {
                kind: BackoffKind::Exponential,
                delay: Some(1000),
                options: None,
            })),
            priority: 7,
            fail_parent_on_failure: true,
            ..Default::default()
        };
        let json = serde_json::to_string(&opts).unwrap();
        let back: JobOptions = serde_json::from_str(&json).unwrap();
        assert_eq!(opts, back);
    }

    #[test]
    fn bare_number_backoff() {
        let opts: JobOptions = serde_json::from_str(r#"{"backoff":250}"#).unwrap();
        assert_eq!(opts.backoff, Some(BackoffOptions::Millis(250)));
    }

    #[test]
    fn unknown_fields_rejected() {
        let err = serde_json::from_str::<JobOptions>(r#"{"dealy":5}"#);
        assert!(err.is_err());
    }

    #[test]
    fn keep_policy_shapes() {
        assert_eq!(
            serde_json::from_str::<KeepPolicy>("true").unwrap().script_args(),
            (0, 0)
        );
        assert_eq!(
            serde_json::from_str::<KeepPolicy>("25").unwrap().script_args(),
            (25, 0)
        );
        let capped: KeepPolicy =
            serde_json::from_str(r#"{"count":10,"age":3600}"#).unwrap();
        assert_eq!(capped.script_args(), (10, 3600));
        assert_eq!(KeepPolicy::default().script_args(), (-1, 0));
    }

    #[test]
    fn zero_attempts_means_one_try() {
        assert_eq!(JobOptions::default().max_attempts(), 1);
    }
}
