//! Job record: the persistent hash behind every queued unit of work.

use std::collections::HashMap;

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::error::{ConveyorError, Result};
use crate::options::JobOptions;

/// Reference to a parent job in a (possibly different) queue.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ParentRef {
    pub id: String,
    /// `<prefix>:<queueName>` of the parent's queue.
    pub queue_key: String,
}

impl ParentRef {
    /// Qualified job key used in cross-queue references.
    pub fn qualified_key(&self) -> String {
        format!("{}:{}", self.queue_key, self.id)
    }
}

/// One job, deserialized from its store hash.
///
/// The hash is the single source of truth; this struct is a snapshot. Which
/// state set currently holds the id is a store query, not a field.
#[derive(Debug, Clone)]
pub struct Job {
    pub id: String,
    pub name: String,
    pub data: serde_json::Value,
    pub opts: JobOptions,
    /// Enqueue wall time, milliseconds since epoch.
    pub timestamp: i64,
    pub delay: u64,
    pub priority: u32,
    pub progress: serde_json::Value,
    /// Bumped on every dispatch, including stalled re-runs.
    pub attempts_started: u32,
    /// Bumped on every failure that consumed a try.
    pub attempts_made: u32,
    pub stalled_counter: u32,
    pub failed_reason: Option<String>,
    pub stacktrace: Vec<String>,
    pub returnvalue: Option<serde_json::Value>,
    pub processed_on: Option<i64>,
    pub finished_on: Option<i64>,
    pub parent: Option<ParentRef>,
    pub parent_key: Option<String>,
    /// Set when the job was materialized by a job scheduler.
    pub repeat_job_key: Option<String>,
}

impl Job {
    pub fn new(name: &str, data: serde_json::Value, opts: JobOptions) -> Self {
        let timestamp = opts.timestamp.unwrap_or_else(|| Utc::now().timestamp_millis());
        Self {
            id: opts.job_id.clone().unwrap_or_default(),
            name: name.to_string(),
            data,
            delay: opts.delay,
            priority: opts.priority,
            opts,
            timestamp,
            progress: serde_json::Value::Null,
            attempts_started: 0,
            attempts_made: 0,
            stalled_counter: 0,
            failed_reason: None,
            stacktrace: Vec::new(),
            returnvalue: None,
            processed_on: None,
            finished_on: None,
            parent: None,
            parent_key: None,
            repeat_job_key: None,
        }
    }

    /// Rebuild from a `HGETALL`-shaped map.
    pub fn from_hash(id: &str, map: &HashMap<String, String>) -> Result<Self> {
        let name = map.get("name").cloned().unwrap_or_default();
        let data = parse_json_field(map.get("data"));
        let opts: JobOptions = match map.get("opts") {
            Some(raw) if !raw.is_empty() => serde_json::from_str(raw)?,
            _ => JobOptions::default(),
        };
        let parent: Option<ParentRef> = match map.get("parent") {
            Some(raw) if !raw.is_empty() => Some(serde_json::from_str(raw)?),
            _ => None,
        };
        let stacktrace: Vec<String> = match map.get("stacktrace") {
            Some(raw) if !raw.is_empty() => serde_json::from_str(raw).unwrap_or_default(),
            _ => Vec::new(),
        };

        Ok(Self {
            id: id.to_string(),
            name,
            data,
            opts,
            timestamp: parse_num(map.get("timestamp")).unwrap_or(0),
            delay: parse_num(map.get("delay")).unwrap_or(0) as u64,
            priority: parse_num(map.get("priority")).unwrap_or(0) as u32,
            progress: parse_json_field(map.get("progress")),
            attempts_started: parse_num(map.get("attemptsStarted")).unwrap_or(0) as u32,
            attempts_made: parse_num(map.get("attemptsMade")).unwrap_or(0) as u32,
            stalled_counter: parse_num(map.get("stalledCounter")).unwrap_or(0) as u32,
            failed_reason: non_empty(map.get("failedReason")),
            stacktrace,
            returnvalue: map
                .get("returnvalue")
                .filter(|raw| !raw.is_empty())
                .map(|raw| {
                    serde_json::from_str(raw)
                        .unwrap_or_else(|_| serde_json::Value::String(raw.clone()))
                }),
            processed_on: parse_num(map.get("processedOn")),
            finished_on: parse_num(map.get("finishedOn")),
            parent,
            parent_key: non_empty(map.get("parentKey")),
            repeat_job_key: non_empty(map.get("repeatJobKey")),
        })
    }

    /// Rebuild from the flat `[field, value, ...]` reply the dispatch script
    /// returns. The job id travels next to the array, not inside it.
    pub fn from_flat_reply(id: &str, flat: &[String]) -> Result<Self> {
        if flat.len() % 2 != 0 {
            return Err(ConveyorError::ScriptReply(format!(
                "odd field/value reply for job {id}"
            )));
        }
        let map: HashMap<String, String> = flat
            .chunks_exact(2)
            .map(|kv| (kv[0].clone(), kv[1].clone()))
            .collect();
        Self::from_hash(id, &map)
    }

    /// Field/value pairs the add scripts write into the job hash.
    pub fn to_hash_pairs(&self) -> Result<Vec<(String, String)>> {
        let mut pairs = vec![
            ("name".to_string(), self.name.clone()),
            ("data".to_string(), serde_json::to_string(&self.data)?),
            ("opts".to_string(), serde_json::to_string(&self.opts)?),
            ("timestamp".to_string(), self.timestamp.to_string()),
            ("delay".to_string(), self.delay.to_string()),
            ("priority".to_string(), self.priority.to_string()),
        ];
        if let Some(parent) = &self.parent {
            pairs.push(("parent".to_string(), serde_json::to_string(parent)?));
        }
        if let Some(parent_key) = &self.parent_key {
            pairs.push(("parentKey".to_string(), parent_key.clone()));
        }
        if let Some(rjk) = &self.repeat_job_key {
            pairs.push(("repeatJobKey".to_string(), rjk.clone()));
        }
        Ok(pairs)
    }

    /// Where an add must place this job. Exactly one target applies.
    pub fn add_target(&self) -> AddTarget {
        if self.parent.is_some() {
            AddTarget::WaitingChildren
        } else if self.delay > 0 {
            AddTarget::Delayed
        } else if self.priority > 0 {
            AddTarget::Prioritized
        } else {
            AddTarget::Wait
        }
    }

    pub fn is_finished(&self) -> bool {
        self.finished_on.is_some()
    }

    pub fn has_failed(&self) -> bool {
        self.failed_reason.is_some()
    }

    /// True when a failure at `attempts_made + 1` consumed tries would still
    /// leave a retry budget.
    pub fn retries_remaining(&self) -> bool {
        self.attempts_made + 1 < self.opts.max_attempts()
    }

    #[cfg(test)]
    pub(crate) fn stub_for_tests() -> Self {
        Job::new("test", serde_json::Value::Null, JobOptions::default())
    }
}

/// Placement of a freshly added job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddTarget {
    Wait,
    Prioritized,
    Delayed,
    WaitingChildren,
}

fn parse_num(raw: Option<&String>) -> Option<i64> {
    raw.and_then(|s| s.parse().ok())
}

fn non_empty(raw: Option<&String>) -> Option<String> {
    raw.filter(|s| !s.is_empty()).cloned()
}

fn parse_json_field(raw: Option<&String>) -> serde_json::Value {
    match raw {
        Some(s) if !s.is_empty() => {
            serde_json::from_str(s).unwrap_or_else(|_| serde_json::Value::String(s.clone()))
        }
        _ => serde_json::Value::Null,
    }
}
