//! Queue client: producers add jobs, operators manage them.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;

use crate::connection::RedisLink;
use crate::error::{ConveyorError, Result};
use crate::job::Job;
use crate::keys::KeySpace;
use crate::options::{JobOptions, QueueOptions};
use crate::repeat::{Repeat, RepeatableJob};
use crate::scripts::{AddNode, Scripts};

/// Highest admissible priority value (2^21 - 1).
pub const MAX_PRIORITY: u32 = (1 << 21) - 1;

/// Which state set currently holds a job id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Waiting,
    Prioritized,
    Active,
    Delayed,
    Completed,
    Failed,
    WaitingChildren,
    Paused,
    Unknown,
}

/// Per-state cardinalities.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JobCounts {
    pub waiting: u64,
    pub prioritized: u64,
    pub active: u64,
    pub delayed: u64,
    pub completed: u64,
    pub failed: u64,
    pub waiting_children: u64,
    pub paused: u64,
}

pub struct Queue {
    name: String,
    link: RedisLink,
    conn: ConnectionManager,
    scripts: Arc<Scripts>,
    repeat: Repeat,
    opts: QueueOptions,
}

impl Queue {
    pub async fn new(url: &str, name: &str, opts: QueueOptions) -> Result<Self> {
        let link = RedisLink::connect(url).await?;
        Ok(Self::with_link(link, name, opts))
    }

    pub fn with_link(link: RedisLink, name: &str, opts: QueueOptions) -> Self {
        let keys = KeySpace::new(&opts.prefix, name);
        let scripts = Arc::new(Scripts::new(keys, opts.max_events_len));
        let repeat = Repeat::new(Arc::clone(&scripts), opts.settings.clone());
        let conn = link.manager();
        Self {
            name: name.to_string(),
            link,
            conn,
            scripts,
            repeat,
            opts,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn keys(&self) -> &KeySpace {
        self.scripts.keys()
    }

    pub fn link(&self) -> &RedisLink {
        &self.link
    }

    /// Add one job. With `repeat` options set this upserts the job scheduler
    /// and returns the first materialized occurrence.
    pub async fn add(
        &self,
        name: &str,
        data: serde_json::Value,
        opts: JobOptions,
    ) -> Result<Job> {
        let opts = self.effective_opts(opts);
        validate_priority(opts.priority)?;
        let now = Utc::now().timestamp_millis();
        let mut conn = self.conn.clone();

        if let Some(repeat) = opts.repeat.clone() {
            let occurrence = self
                .repeat
                .upsert(&mut conn, name, &data, &opts, &repeat, now)
                .await?
                .ok_or_else(|| {
                    ConveyorError::Internal(format!(
                        "job scheduler for {name} produced no occurrence"
                    ))
                })?;
            return self.get_job(&occurrence).await?.ok_or_else(|| {
                ConveyorError::Internal(format!("occurrence {occurrence} vanished"))
            });
        }

        let mut job = Job::new(name, data, opts);
        let node = self.node_for(&job)?;
        let ids = self.scripts.add_jobs(&mut conn, &[node], now).await?;
        job.id = ids
            .into_iter()
            .next()
            .ok_or_else(|| ConveyorError::ScriptReply("empty add reply".to_string()))?;
        tracing::debug!(queue = %self.name, job_id = %job.id, name = %job.name, "Added job");
        Ok(job)
    }

    /// Add a batch atomically, preserving the batch's relative FIFO order.
    pub async fn add_bulk(
        &self,
        jobs: Vec<(String, serde_json::Value, JobOptions)>,
    ) -> Result<Vec<Job>> {
        let now = Utc::now().timestamp_millis();
        let mut records = Vec::with_capacity(jobs.len());
        let mut nodes = Vec::with_capacity(jobs.len());
        for (name, data, opts) in jobs {
            let opts = self.effective_opts(opts);
            validate_priority(opts.priority)?;
            if opts.repeat.is_some() {
                return Err(ConveyorError::Internal(
                    "repeatable jobs cannot be added in bulk".to_string(),
                ));
            }
            let job = Job::new(&name, data, opts);
            nodes.push(self.node_for(&job)?);
            records.push(job);
        }

        let mut conn = self.conn.clone();
        let ids = self.scripts.add_jobs(&mut conn, &nodes, now).await?;
        for (job, id) in records.iter_mut().zip(ids) {
            job.id = id;
        }
        tracing::debug!(queue = %self.name, count = records.len(), "Added job batch");
        Ok(records)
    }

    fn node_for(&self, job: &Job) -> Result<AddNode> {
        Ok(AddNode {
            prefix: self.scripts.keys().to_key(""),
            id: job.opts.job_id.clone().unwrap_or_default(),
            name: job.name.clone(),
            data: serde_json::to_string(&job.data)?,
            opts: serde_json::to_string(&job.opts)?,
            timestamp: job.timestamp,
            delay: job.delay,
            priority: job.priority,
            parent_idx: 0,
            parent_key: String::new(),
            parent_json: String::new(),
            wait_children: 0,
            repeat_job_key: job.repeat_job_key.clone().unwrap_or_default(),
            max_events: self.opts.max_events_len,
        })
    }

    /// Fill gaps in per-add options from the queue's defaults.
    fn effective_opts(&self, mut opts: JobOptions) -> JobOptions {
        let defaults = &self.opts.default_job_options;
        if opts.attempts == 0 {
            opts.attempts = defaults.attempts;
        }
        if opts.backoff.is_none() {
            opts.backoff = defaults.backoff.clone();
        }
        if opts.remove_on_complete.is_keep_all() {
            opts.remove_on_complete = defaults.remove_on_complete.clone();
        }
        if opts.remove_on_fail.is_keep_all() {
            opts.remove_on_fail = defaults.remove_on_fail.clone();
        }
        if opts.stack_trace_limit.is_none() {
            opts.stack_trace_limit = defaults.stack_trace_limit;
        }
        if opts.keep_logs.is_none() {
            opts.keep_logs = defaults.keep_logs;
        }
        opts
    }

    pub async fn get_job(&self, job_id: &str) -> Result<Option<Job>> {
        let mut conn = self.conn.clone();
        let map: HashMap<String, String> =
            conn.hgetall(self.scripts.keys().job(job_id)).await?;
        if map.is_empty() {
            return Ok(None);
        }
        Ok(Some(Job::from_hash(job_id, &map)?))
    }

    /// Which state set holds the id right now.
    pub async fn get_state(&self, job_id: &str) -> Result<JobState> {
        let keys = self.scripts.keys();
        let mut conn = self.conn.clone();

        let zsets = [
            (keys.completed(), JobState::Completed),
            (keys.failed(), JobState::Failed),
            (keys.delayed(), JobState::Delayed),
            (keys.prioritized(), JobState::Prioritized),
            (keys.waiting_children(), JobState::WaitingChildren),
        ];
        for (key, state) in zsets {
            let score: Option<f64> = conn.zscore(&key, job_id).await?;
            if score.is_some() {
                return Ok(state);
            }
        }

        let lists = [
            (keys.active(), JobState::Active),
            (keys.wait(), JobState::Waiting),
            (keys.paused(), JobState::Paused),
        ];
        for (key, state) in lists {
            let pos: Option<u64> = redis::cmd("LPOS")
                .arg(&key)
                .arg(job_id)
                .query_async(&mut conn)
                .await?;
            if pos.is_some() {
                return Ok(state);
            }
        }

        Ok(JobState::Unknown)
    }

    pub async fn get_job_counts(&self) -> Result<JobCounts> {
        let keys = self.scripts.keys();
        let mut conn = self.conn.clone();
        Ok(JobCounts {
            waiting: conn.llen(keys.wait()).await?,
            paused: conn.llen(keys.paused()).await?,
            active: conn.llen(keys.active()).await?,
            prioritized: conn.zcard(keys.prioritized()).await?,
            delayed: conn.zcard(keys.delayed()).await?,
            completed: conn.zcard(keys.completed()).await?,
            failed: conn.zcard(keys.failed()).await?,
            waiting_children: conn.zcard(keys.waiting_children()).await?,
        })
    }

    /// Jobs currently in `state`, oldest first, `[offset, offset+limit)`.
    pub async fn get_jobs_in(
        &self,
        state: JobState,
        offset: isize,
        limit: isize,
    ) -> Result<Vec<Job>> {
        let keys = self.scripts.keys();
        let mut conn = self.conn.clone();
        let end = if limit < 0 { -1 } else { offset + limit - 1 };

        let ids: Vec<String> = match state {
            JobState::Completed => conn.zrange(keys.completed(), offset, end).await?,
            JobState::Failed => conn.zrange(keys.failed(), offset, end).await?,
            JobState::Delayed => conn.zrange(keys.delayed(), offset, end).await?,
            JobState::Prioritized => conn.zrange(keys.prioritized(), offset, end).await?,
            JobState::WaitingChildren => {
                conn.zrange(keys.waiting_children(), offset, end).await?
            }
            JobState::Active => conn.lrange(keys.active(), offset, end).await?,
            JobState::Waiting => conn.lrange(keys.wait(), offset, end).await?,
            JobState::Paused => conn.lrange(keys.paused(), offset, end).await?,
            JobState::Unknown => Vec::new(),
        };

        let mut jobs = Vec::with_capacity(ids.len());
        for id in ids {
            let map: HashMap<String, String> = conn.hgetall(keys.job(&id)).await?;
            if !map.is_empty() {
                jobs.push(Job::from_hash(&id, &map)?);
            }
        }
        Ok(jobs)
    }

    pub async fn get_job_logs(&self, job_id: &str) -> Result<Vec<String>> {
        let mut conn = self.conn.clone();
        Ok(conn.lrange(self.scripts.keys().job_logs(job_id), 0, -1).await?)
    }

    pub async fn update_job_progress(
        &self,
        job_id: &str,
        progress: &serde_json::Value,
    ) -> Result<()> {
        let mut conn = self.conn.clone();
        self.scripts
            .update_progress(&mut conn, job_id, &serde_json::to_string(progress)?)
            .await
    }

    pub async fn add_job_log(&self, job_id: &str, line: &str) -> Result<usize> {
        let job = self
            .get_job(job_id)
            .await?
            .ok_or_else(|| ConveyorError::JobNotFound(job_id.to_string()))?;
        let mut conn = self.conn.clone();
        self.scripts
            .add_log(&mut conn, job_id, line, job.opts.keep_logs.unwrap_or(0))
            .await
    }

    pub async fn pause(&self) -> Result<()> {
        let mut conn = self.conn.clone();
        self.scripts.pause(&mut conn, true).await?;
        tracing::info!(queue = %self.name, "Queue paused");
        Ok(())
    }

    pub async fn resume(&self) -> Result<()> {
        let mut conn = self.conn.clone();
        self.scripts.pause(&mut conn, false).await?;
        tracing::info!(queue = %self.name, "Queue resumed");
        Ok(())
    }

    pub async fn is_paused(&self) -> Result<bool> {
        let mut conn = self.conn.clone();
        let paused: bool = conn.hexists(self.scripts.keys().meta(), "paused").await?;
        Ok(paused)
    }

    /// Remove a job. Refused while active or while it belongs to a job
    /// scheduler.
    pub async fn remove(&self, job_id: &str) -> Result<()> {
        if let Some(job) = self.get_job(job_id).await? {
            if job.repeat_job_key.is_some() {
                return Err(ConveyorError::SchedulerOwnedJob(job_id.to_string()));
            }
        }
        let mut conn = self.conn.clone();
        self.scripts.remove_job(&mut conn, job_id).await
    }

    /// Move a delayed job to the front of the line immediately.
    pub async fn promote(&self, job_id: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        self.scripts.promote(&mut conn, job_id).await
    }

    /// Client-driven retry of a completed or failed job.
    pub async fn retry_job(&self, job_id: &str, prev_state: JobState) -> Result<()> {
        let prev = match prev_state {
            JobState::Completed => "completed",
            JobState::Failed => "failed",
            _ => {
                return Err(ConveyorError::WrongState(job_id.to_string()));
            }
        };
        let mut conn = self.conn.clone();
        self.scripts.reprocess_job(&mut conn, job_id, prev).await
    }

    pub async fn change_priority(
        &self,
        job_id: &str,
        priority: u32,
        lifo: bool,
    ) -> Result<()> {
        validate_priority(priority)?;
        let mut conn = self.conn.clone();
        self.scripts
            .change_priority(&mut conn, job_id, priority, lifo)
            .await
    }

    /// Remove terminal jobs finished more than `grace_ms` ago. Returns the
    /// number removed.
    pub async fn clean(
        &self,
        grace_ms: i64,
        limit: usize,
        state: JobState,
    ) -> Result<usize> {
        let set = match state {
            JobState::Completed => "completed",
            JobState::Failed => "failed",
            _ => {
                return Err(ConveyorError::Internal(
                    "clean only applies to terminal sets".to_string(),
                ));
            }
        };
        let cutoff = Utc::now().timestamp_millis() - grace_ms;
        let mut conn = self.conn.clone();
        self.scripts.clean_set(&mut conn, set, cutoff, limit).await
    }

    /// Empty the queue of everything not active.
    pub async fn drain(&self, also_delayed: bool) -> Result<()> {
        let mut conn = self.conn.clone();
        self.scripts.drain(&mut conn, also_delayed).await?;
        tracing::info!(queue = %self.name, also_delayed, "Queue drained");
        Ok(())
    }

    /// Delete every key of the queue. Refused while actives exist unless
    /// forced.
    pub async fn obliterate(&self, force: bool) -> Result<()> {
        let mut conn = self.conn.clone();
        loop {
            let remaining = self.scripts.obliterate(&mut conn, 1000, force).await?;
            if remaining <= 0 {
                break;
            }
        }
        tracing::warn!(queue = %self.name, "Queue obliterated");
        Ok(())
    }

    pub async fn remove_job_scheduler(&self, key: &str) -> Result<bool> {
        let mut conn = self.conn.clone();
        self.repeat.remove(&mut conn, key).await
    }

    pub async fn get_repeatable_jobs(
        &self,
        offset: isize,
        limit: isize,
        asc: bool,
    ) -> Result<Vec<RepeatableJob>> {
        let mut conn = self.conn.clone();
        self.repeat.list(&mut conn, offset, limit, asc).await
    }
}

fn validate_priority(priority: u32) -> Result<()> {
    if priority > MAX_PRIORITY {
        return Err(ConveyorError::Internal(format!(
            "priority {priority} exceeds maximum {MAX_PRIORITY}"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn priority_bounds() {
        assert!(validate_priority(0).is_ok());
        assert!(validate_priority(MAX_PRIORITY).is_ok());
        assert!(validate_priority(MAX_PRIORITY + 1).is_err());
    }
}
