//! Script runtime: loads the atomic transition scripts and maps their
//! replies to typed outcomes.
//!
//! Scripts ship as versioned text resources under `src/commands/` and are
//! invoked content-addressed (`EVALSHA` with transparent reload on
//! `NOSCRIPT`, courtesy of [`redis::Script`]). They are the authoritative
//! definition of every transition; this module only builds keys and argument
//! lists and decodes the discriminated integer codes.

use redis::aio::ConnectionManager;
use redis::{Script, Value};
use serde::Serialize;

use crate::error::{ConveyorError, Result, ScriptCode};
use crate::job::Job;
use crate::keys::KeySpace;
use crate::options::RateLimiterOptions;

const ADD_JOBS: &str = include_str!("commands/add_jobs.lua");
const MOVE_TO_ACTIVE: &str = include_str!("commands/move_to_active.lua");
const MOVE_TO_FINISHED: &str = include_str!("commands/move_to_finished.lua");
const MOVE_TO_DELAYED: &str = include_str!("commands/move_to_delayed.lua");
const RETRY_FROM_ACTIVE: &str = include_str!("commands/retry_from_active.lua");
const MOVE_TO_WAITING_CHILDREN: &str =
    include_str!("commands/move_to_waiting_children.lua");
const EXTEND_LOCK: &str = include_str!("commands/extend_lock.lua");
const PROMOTE: &str = include_str!("commands/promote.lua");
const REPROCESS_JOB: &str = include_str!("commands/reprocess_job.lua");
const REMOVE_JOB: &str = include_str!("commands/remove_job.lua");
const PAUSE: &str = include_str!("commands/pause.lua");
const MOVE_STALLED_JOBS_TO_WAIT: &str =
    include_str!("commands/move_stalled_jobs_to_wait.lua");
const UPDATE_PROGRESS: &str = include_str!("commands/update_progress.lua");
const ADD_LOG: &str = include_str!("commands/add_log.lua");
const CHANGE_PRIORITY: &str = include_str!("commands/change_priority.lua");
const CLEAN_SET: &str = include_str!("commands/clean_set.lua");
const DRAIN: &str = include_str!("commands/drain.lua");
const OBLITERATE: &str = include_str!("commands/obliterate.lua");
const UPSERT_SCHEDULER: &str = include_str!("commands/upsert_scheduler.lua");
const REMOVE_SCHEDULER: &str = include_str!("commands/remove_scheduler.lua");

/// One node of an add batch, serialized into the `add_jobs` script.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AddNode {
    /// Base key `<prefix>:<queue>:` of the node's queue.
    pub prefix: String,
    /// Caller-supplied id, empty allocates from the counter.
    pub id: String,
    pub name: String,
    /// Pre-serialized payload JSON.
    pub data: String,
    /// Pre-serialized options JSON.
    pub opts: String,
    pub timestamp: i64,
    pub delay: u64,
    pub priority: u32,
    /// 1-based index of the parent node within the batch, 0 = none.
    pub parent_idx: usize,
    /// Qualified key of an existing parent job, empty = none.
    pub parent_key: String,
    /// Parent ref JSON paired with `parent_key`.
    pub parent_json: String,
    /// 1 places the node in waiting-children.
    pub wait_children: u8,
    pub repeat_job_key: String,
    pub max_events: u64,
}

/// Outcome of a dispatch attempt.
#[derive(Debug)]
pub enum Dispatch {
    Job(Box<Job>),
    /// Rate limiter saturated until the given wall time (ms).
    RateLimited { limit_until: i64 },
    /// Nothing ready; `delay_until` hints at the soonest delayed job.
    Empty { delay_until: Option<i64> },
}

/// Loaded scripts bound to one queue's key space.
pub struct Scripts {
    keys: KeySpace,
    max_events: u64,
    add_jobs: Script,
    move_to_active: Script,
    move_to_finished: Script,
    move_to_delayed: Script,
    retry_from_active: Script,
    move_to_waiting_children: Script,
    extend_lock: Script,
    promote: Script,
    reprocess_job: Script,
    remove_job: Script,
    pause: Script,
    move_stalled_jobs_to_wait: Script,
    update_progress: Script,
    add_log: Script,
    change_priority: Script,
    clean_set: Script,
    drain: Script,
    obliterate: Script,
    upsert_scheduler: Script,
    remove_scheduler: Script,
}

impl Scripts {
    pub fn new(keys: KeySpace, max_events: u64) -> Self {
        Self {
            keys,
            max_events,
            add_jobs: Script::new(ADD_JOBS),
            move_to_active: Script::new(MOVE_TO_ACTIVE),
            move_to_finished: Script::new(MOVE_TO_FINISHED),
            move_to_delayed: Script::new(MOVE_TO_DELAYED),
            retry_from_active: Script::new(RETRY_FROM_ACTIVE),
            move_to_waiting_children: Script::new(MOVE_TO_WAITING_CHILDREN),
            extend_lock: Script::new(EXTEND_LOCK),
            promote: Script::new(PROMOTE),
            reprocess_job: Script::new(REPROCESS_JOB),
            remove_job: Script::new(REMOVE_JOB),
            pause: Script::new(PAUSE),
            move_stalled_jobs_to_wait: Script::new(MOVE_STALLED_JOBS_TO_WAIT),
            update_progress: Script::new(UPDATE_PROGRESS),
            add_log: Script::new(ADD_LOG),
            change_priority: Script::new(CHANGE_PRIORITY),
            clean_set: Script::new(CLEAN_SET),
            drain: Script::new(DRAIN),
            obliterate: Script::new(OBLITERATE),
            upsert_scheduler: Script::new(UPSERT_SCHEDULER),
            remove_scheduler: Script::new(REMOVE_SCHEDULER),
        }
    }

    pub fn keys(&self) -> &KeySpace {
        &self.keys
    }

    pub fn max_events(&self) -> u64 {
        self.max_events
    }

    /// Atomically add a batch of jobs; returns assigned ids in input order.
    pub async fn add_jobs(
        &self,
        conn: &mut ConnectionManager,
        nodes: &[AddNode],
        now: i64,
    ) -> Result<Vec<String>> {
        run_add_jobs(&self.add_jobs, conn, nodes, now).await
    }

    /// Claim the next ready job under the dispatch precedence rules.
    pub async fn move_to_active(
        &self,
        conn: &mut ConnectionManager,
        token: &str,
        lock_duration: u64,
        limiter: Option<&RateLimiterOptions>,
        now: i64,
    ) -> Result<Dispatch> {
        let (limiter_max, limiter_duration, group_limited) = match limiter {
            Some(l) => (l.max, l.duration, if l.group_limited { "1" } else { "0" }),
            None => (0, 0, "0"),
        };
        let reply: Vec<Value> = self
            .move_to_active
            .key(self.keys.wait())
            .key(self.keys.active())
            .key(self.keys.prioritized())
            .key(self.keys.delayed())
            .key(self.keys.meta())
            .key(self.keys.events())
            .key(self.keys.marker())
            .key(self.keys.limiter())
            .key(self.keys.priority_counter())
            .arg(self.keys.to_key(""))
            .arg(token)
            .arg(lock_duration)
            .arg(now)
            .arg(self.max_events)
            .arg(limiter_max)
            .arg(limiter_duration)
            .arg(group_limited)
            .invoke_async(conn)
            .await?;

        if reply.len() != 4 {
            return Err(ConveyorError::ScriptReply(format!(
                "move_to_active reply of {} elements",
                reply.len()
            )));
        }

        let job_id = value_as_string(&reply[0]).unwrap_or_default();
        let limit_until = value_as_i64(&reply[2]).unwrap_or(0);
        let delay_until = value_as_i64(&reply[3]).unwrap_or(0);

        if !job_id.is_empty() {
            let fields = match &reply[1] {
                Value::Array(items) => items
                    .iter()
                    .filter_map(value_as_string)
                    .collect::<Vec<_>>(),
                _ => Vec::new(),
            };
            let job = Job::from_flat_reply(&job_id, &fields)?;
            Ok(Dispatch::Job(Box::new(job)))
        } else if limit_until > 0 {
            Ok(Dispatch::RateLimited { limit_until })
        } else {
            Ok(Dispatch::Empty {
                delay_until: (delay_until > 0).then_some(delay_until),
            })
        }
    }

    pub async fn move_to_completed(
        &self,
        conn: &mut ConnectionManager,
        job_id: &str,
        token: &str,
        return_value: &str,
        keep: (i64, u64),
        now: i64,
    ) -> Result<()> {
        self.finish(conn, job_id, token, "completed", return_value, keep, "", now)
            .await
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn move_to_failed(
        &self,
        conn: &mut ConnectionManager,
        job_id: &str,
        token: &str,
        reason: &str,
        keep: (i64, u64),
        stacktrace: &str,
        now: i64,
    ) -> Result<()> {
        self.finish(conn, job_id, token, "failed", reason, keep, stacktrace, now)
            .await
    }

    #[allow(clippy::too_many_arguments)]
    async fn finish(
        &self,
        conn: &mut ConnectionManager,
        job_id: &str,
        token: &str,
        target: &str,
        value: &str,
        keep: (i64, u64),
        stacktrace: &str,
        now: i64,
    ) -> Result<()> {
        let target_key = if target == "completed" {
            self.keys.completed()
        } else {
            self.keys.failed()
        };
        let code: i64 = self
            .move_to_finished
            .key(self.keys.active())
            .key(target_key)
            .key(self.keys.job(job_id))
            .key(self.keys.job_lock(job_id))
            .key(self.keys.events())
            .key(self.keys.marker())
            .key(self.keys.stalled())
            .arg(job_id)
            .arg(token)
            .arg(now)
            .arg(target)
            .arg(value)
            .arg(keep.0)
            .arg(keep.1)
            .arg(self.max_events)
            .arg(self.keys.to_key(""))
            .arg(stacktrace)
            .invoke_async(conn)
            .await?;
        map_code(code, job_id)
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn move_to_delayed(
        &self,
        conn: &mut ConnectionManager,
        job_id: &str,
        token: &str,
        due_at: i64,
        count_attempt: bool,
        stacktrace: &str,
        reason: &str,
        now: i64,
    ) -> Result<()> {
        let code: i64 = self
            .move_to_delayed
            .key(self.keys.active())
            .key(self.keys.delayed())
            .key(self.keys.job(job_id))
            .key(self.keys.job_lock(job_id))
            .key(self.keys.events())
            .key(self.keys.marker())
            .key(self.keys.priority_counter())
            .key(self.keys.stalled())
            .arg(job_id)
            .arg(token)
            .arg(now)
            .arg(due_at)
            .arg(self.max_events)
            .arg(if count_attempt { "1" } else { "0" })
            .arg(stacktrace)
            .arg(reason)
            .invoke_async(conn)
            .await?;
        map_code(code, job_id)
    }

    pub async fn retry_from_active(
        &self,
        conn: &mut ConnectionManager,
        job_id: &str,
        token: &str,
        stacktrace: &str,
        reason: &str,
        now: i64,
    ) -> Result<()> {
        let code: i64 = self
            .retry_from_active
            .key(self.keys.active())
            .key(self.keys.wait())
            .key(self.keys.paused())
            .key(self.keys.meta())
            .key(self.keys.prioritized())
            .key(self.keys.priority_counter())
            .key(self.keys.job(job_id))
            .key(self.keys.job_lock(job_id))
            .key(self.keys.events())
            .key(self.keys.marker())
            .key(self.keys.stalled())
            .arg(job_id)
            .arg(token)
            .arg(now)
            .arg(self.max_events)
            .arg(stacktrace)
            .arg(reason)
            .invoke_async(conn)
            .await?;
        map_code(code, job_id)
    }

    /// Returns true when the job moved to waiting-children, false when no
    /// unresolved dependencies remained.
    pub async fn move_to_waiting_children(
        &self,
        conn: &mut ConnectionManager,
        job_id: &str,
        token: &str,
        now: i64,
    ) -> Result<bool> {
        let code: i64 = self
            .move_to_waiting_children
            .key(self.keys.active())
            .key(self.keys.waiting_children())
            .key(self.keys.job(job_id))
            .key(self.keys.job_lock(job_id))
            .key(self.keys.job_dependencies(job_id))
            .key(self.keys.stalled())
            .arg(job_id)
            .arg(token)
            .arg(now)
            .invoke_async(conn)
            .await?;
        match code {
            1 => Ok(true),
            0 => Ok(false),
            c => map_code(c, job_id).map(|_| false),
        }
    }

    /// Returns true when the lock was renewed.
    pub async fn extend_lock(
        &self,
        conn: &mut ConnectionManager,
        job_id: &str,
        token: &str,
        duration: u64,
    ) -> Result<bool> {
        let code: i64 = self
            .extend_lock
            .key(self.keys.job_lock(job_id))
            .key(self.keys.stalled())
            .arg(token)
            .arg(duration)
            .arg(job_id)
            .invoke_async(conn)
            .await?;
        Ok(code == 1)
    }

    pub async fn promote(&self, conn: &mut ConnectionManager, job_id: &str) -> Result<()> {
        let code: i64 = self
            .promote
            .key(self.keys.delayed())
            .key(self.keys.wait())
            .key(self.keys.paused())
            .key(self.keys.meta())
            .key(self.keys.prioritized())
            .key(self.keys.priority_counter())
            .key(self.keys.events())
            .key(self.keys.marker())
            .key(self.keys.job(job_id))
            .arg(job_id)
            .arg(self.max_events)
            .invoke_async(conn)
            .await?;
        map_code(code, job_id)
    }

    pub async fn reprocess_job(
        &self,
        conn: &mut ConnectionManager,
        job_id: &str,
        prev_state: &str,
    ) -> Result<()> {
        let source = if prev_state == "completed" {
            self.keys.completed()
        } else {
            self.keys.failed()
        };
        let code: i64 = self
            .reprocess_job
            .key(source)
            .key(self.keys.wait())
            .key(self.keys.paused())
            .key(self.keys.meta())
            .key(self.keys.events())
            .key(self.keys.marker())
            .key(self.keys.job(job_id))
            .key(self.keys.prioritized())
            .key(self.keys.priority_counter())
            .arg(job_id)
            .arg(prev_state)
            .arg(self.max_events)
            .invoke_async(conn)
            .await?;
        map_code(code, job_id)
    }

    pub async fn remove_job(&self, conn: &mut ConnectionManager, job_id: &str) -> Result<()> {
        let code: i64 = self
            .remove_job
            .key(self.keys.wait())
            .key(self.keys.paused())
            .key(self.keys.active())
            .key(self.keys.prioritized())
            .key(self.keys.delayed())
            .key(self.keys.completed())
            .key(self.keys.failed())
            .key(self.keys.waiting_children())
            .key(self.keys.events())
            .arg(job_id)
            .arg(self.keys.to_key(""))
            .arg(self.max_events)
            .invoke_async(conn)
            .await?;
        match code {
            1 => Ok(()),
            -1 => Err(ConveyorError::JobNotFound(job_id.to_string())),
            -2 => Err(ConveyorError::RemoveRejected(job_id.to_string())),
            c => Err(ConveyorError::ScriptReply(format!("remove_job code {c}"))),
        }
    }

    pub async fn pause(&self, conn: &mut ConnectionManager, pause: bool) -> Result<()> {
        let _: i64 = self
            .pause
            .key(self.keys.wait())
            .key(self.keys.paused())
            .key(self.keys.meta())
            .key(self.keys.events())
            .key(self.keys.marker())
            .key(self.keys.prioritized())
            .arg(if pause { "pause" } else { "resume" })
            .arg(self.max_events)
            .invoke_async(conn)
            .await?;
        Ok(())
    }

    /// One stalled sweep. Returns `(requeued, to_fail)`; the caller fails
    /// each id in `to_fail` through the terminal transition.
    pub async fn move_stalled_jobs_to_wait(
        &self,
        conn: &mut ConnectionManager,
        max_stalled_count: u32,
        stalled_interval: u64,
        now: i64,
    ) -> Result<(Vec<String>, Vec<String>)> {
        let reply: Vec<Value> = self
            .move_stalled_jobs_to_wait
            .key(self.keys.stalled())
            .key(self.keys.wait())
            .key(self.keys.active())
            .key(self.keys.stalled_check())
            .key(self.keys.meta())
            .key(self.keys.paused())
            .key(self.keys.marker())
            .key(self.keys.events())
            .arg(max_stalled_count)
            .arg(self.keys.to_key(""))
            .arg(now)
            .arg(stalled_interval)
            .arg(self.max_events)
            .invoke_async(conn)
            .await?;
        let decode = |v: Option<&Value>| -> Vec<String> {
            match v {
                Some(Value::Array(items)) => {
                    items.iter().filter_map(value_as_string).collect()
                }
                _ => Vec::new(),
            }
        };
        Ok((decode(reply.first()), decode(reply.get(1))))
    }

    pub async fn update_progress(
        &self,
        conn: &mut ConnectionManager,
        job_id: &str,
        progress: &str,
    ) -> Result<()> {
        let code: i64 = self
            .update_progress
            .key(self.keys.job(job_id))
            .key(self.keys.events())
            .arg(job_id)
            .arg(progress)
            .arg(self.max_events)
            .invoke_async(conn)
            .await?;
        map_code(code, job_id)
    }

    pub async fn add_log(
        &self,
        conn: &mut ConnectionManager,
        job_id: &str,
        line: &str,
        keep_logs: usize,
    ) -> Result<usize> {
        let code: i64 = self
            .add_log
            .key(self.keys.job_logs(job_id))
            .key(self.keys.job(job_id))
            .key(self.keys.events())
            .arg(job_id)
            .arg(line)
            .arg(keep_logs)
            .arg(self.max_events)
            .invoke_async(conn)
            .await?;
        if code < 0 {
            map_code(code, job_id).map(|_| 0)
        } else {
            Ok(code as usize)
        }
    }

    pub async fn change_priority(
        &self,
        conn: &mut ConnectionManager,
        job_id: &str,
        priority: u32,
        lifo: bool,
    ) -> Result<()> {
        let code: i64 = self
            .change_priority
            .key(self.keys.wait())
            .key(self.keys.paused())
            .key(self.keys.meta())
            .key(self.keys.prioritized())
            .key(self.keys.priority_counter())
            .key(self.keys.job(job_id))
            .key(self.keys.marker())
            .arg(job_id)
            .arg(priority)
            .arg(if lifo { "1" } else { "0" })
            .invoke_async(conn)
            .await?;
        map_code(code, job_id)
    }

    /// Remove up to `limit` jobs finished before `cutoff` from the named
    /// terminal set. Returns the number removed.
    pub async fn clean_set(
        &self,
        conn: &mut ConnectionManager,
        set: &str,
        cutoff: i64,
        limit: usize,
    ) -> Result<usize> {
        let set_key = if set == "completed" {
            self.keys.completed()
        } else {
            self.keys.failed()
        };
        let removed: i64 = self
            .clean_set
            .key(set_key)
            .key(self.keys.events())
            .arg(cutoff)
            .arg(limit)
            .arg(self.keys.to_key(""))
            .arg(self.max_events)
            .invoke_async(conn)
            .await?;
        Ok(removed as usize)
    }

    pub async fn drain(&self, conn: &mut ConnectionManager, also_delayed: bool) -> Result<()> {
        let _: i64 = self
            .drain
            .key(self.keys.wait())
            .key(self.keys.paused())
            .key(self.keys.prioritized())
            .key(self.keys.delayed())
            .key(self.keys.marker())
            .key(self.keys.events())
            .arg(self.keys.to_key(""))
            .arg(if also_delayed { "1" } else { "0" })
            .arg(self.max_events)
            .invoke_async(conn)
            .await?;
        Ok(())
    }

    /// One obliterate batch; returns the number of keys still remaining.
    pub async fn obliterate(
        &self,
        conn: &mut ConnectionManager,
        count: usize,
        force: bool,
    ) -> Result<i64> {
        let remaining: i64 = self
            .obliterate
            .key(self.keys.meta())
            .key(self.keys.active())
            .arg(self.keys.to_key(""))
            .arg(count)
            .arg(if force { "1" } else { "0" })
            .invoke_async(conn)
            .await?;
        if remaining == -2 {
            return Err(ConveyorError::ObliterateActive);
        }
        Ok(remaining)
    }

    /// Returns true when a new occurrence was materialized.
    #[allow(clippy::too_many_arguments)]
    pub async fn upsert_scheduler(
        &self,
        conn: &mut ConnectionManager,
        def_key: &str,
        next_millis: i64,
        occurrence_id: &str,
        name: &str,
        data: &str,
        opts: &str,
        def_fields: &str,
        legacy_member: &str,
        legacy_def_key: &str,
        now: i64,
    ) -> Result<bool> {
        let created: i64 = self
            .upsert_scheduler
            .key(self.keys.repeat())
            .key(self.keys.delayed())
            .key(self.keys.events())
            .key(self.keys.marker())
            .key(self.keys.repeat_def(def_key))
            .key(self.keys.priority_counter())
            .arg(def_key)
            .arg(next_millis)
            .arg(occurrence_id)
            .arg(name)
            .arg(data)
            .arg(opts)
            .arg(self.keys.to_key(""))
            .arg(now)
            .arg(self.max_events)
            .arg(def_fields)
            .arg(legacy_member)
            .arg(legacy_def_key)
            .invoke_async(conn)
            .await?;
        Ok(created == 1)
    }

    pub async fn remove_scheduler(
        &self,
        conn: &mut ConnectionManager,
        def_key: &str,
        legacy_member: &str,
        occurrence_prefix: &str,
    ) -> Result<bool> {
        let removed: i64 = self
            .remove_scheduler
            .key(self.keys.repeat())
            .key(self.keys.delayed())
            .key(self.keys.repeat_def(def_key))
            .key(self.keys.events())
            .arg(def_key)
            .arg(legacy_member)
            .arg(self.keys.to_key(""))
            .arg(occurrence_prefix)
            .arg(self.max_events)
            .invoke_async(conn)
            .await?;
        Ok(removed == 1)
    }

    /// Plain event emission for events that have no owning script.
    pub async fn emit_event(
        &self,
        conn: &mut ConnectionManager,
        fields: &[(&str, &str)],
    ) -> Result<()> {
        let mut cmd = redis::cmd("XADD");
        cmd.arg(self.keys.events())
            .arg("MAXLEN")
            .arg("~")
            .arg(self.max_events)
            .arg("*");
        for (k, v) in fields {
            cmd.arg(*k).arg(*v);
        }
        let _: String = cmd.query_async(conn).await?;
        Ok(())
    }
}

/// A standalone handle on the add script, for clients that span queues
/// (the flow producer) and cannot bind to a single key space.
pub(crate) fn add_jobs_script() -> Script {
    Script::new(ADD_JOBS)
}

pub(crate) async fn run_add_jobs(
    script: &Script,
    conn: &mut ConnectionManager,
    nodes: &[AddNode],
    now: i64,
) -> Result<Vec<String>> {
    let payload = serde_json::to_string(nodes)?;
    let reply: Vec<Value> = script.arg(payload).arg(now).invoke_async(conn).await?;

    match reply.first() {
        Some(Value::Int(1)) => Ok(reply[1..].iter().filter_map(value_as_string).collect()),
        Some(Value::Int(code)) => {
            let index = reply
                .get(1)
                .and_then(value_as_i64)
                .unwrap_or(0)
                .saturating_sub(1) as usize;
            let id = nodes
                .get(index)
                .map(|n| n.parent_key.clone())
                .unwrap_or_default();
            Err(ScriptCode::from_reply(*code)
                .map(|c| c.into_error(&id))
                .unwrap_or_else(|| {
                    ConveyorError::ScriptReply(format!("add_jobs code {code}"))
                }))
        }
        other => Err(ConveyorError::ScriptReply(format!(
            "add_jobs reply {other:?}"
        ))),
    }
}

fn map_code(code: i64, job_id: &str) -> Result<()> {
    if code >= 0 {
        return Ok(());
    }
    Err(ScriptCode::from_reply(code)
        .map(|c| c.into_error(job_id))
        .unwrap_or_else(|| ConveyorError::ScriptReply(format!("code {code}"))))
}

fn value_as_string(v: &Value) -> Option<String> {
    match v {
        Value::BulkString(bytes) => Some(String::from_utf8_lossy(bytes).into_owned()),
        Value::SimpleString(s) => Some(s.clone()),
        Value::Int(i) => Some(i.to_string()),
        _ => None,
    }
}

fn value_as_i64(v: &Value) -> Option<i64> {
    match v {
        Value::Int(i) => Some(*i),
        Value::BulkString(bytes) => String::from_utf8_lossy(bytes).parse().ok(),
        _ => None,
    }
}
