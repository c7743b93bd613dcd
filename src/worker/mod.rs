//! Worker runtime: fetch loop, concurrency gate, lock renewal, stalled
//! recovery, rate limiting and graceful shutdown.
//!
//! # Processing flow
//!
//! 1. The fetch loop claims jobs while fewer than `concurrency` are in
//!    flight; when nothing is ready it blocks on the wake-up marker.
//! 2. Each claimed job runs its handler as an independent task.
//! 3. A timer renews the locks of every in-flight job; a renewal that fails
//!    cancels the handler locally and the job's fate belongs to the stalled
//!    checker from then on.
//! 4. The stalled checker sweeps the queue on its own cadence (one leader
//!    per queue at a time).

mod context;
mod stalled;

pub use context::{JobContext, ProcessError, Processor};

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use redis::aio::{ConnectionManager, MultiplexedConnection};
use redis::AsyncCommands;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::backoff;
use crate::connection::{RedisLink, ReconnectBackoff};
use crate::error::{ConveyorError, Result};
use crate::keys::KeySpace;
use crate::options::WorkerOptions;
use crate::repeat::Repeat;
use crate::scripts::{Dispatch, Scripts};
use stalled::StalledChecker;

struct InFlight {
    token: String,
    cancel: CancellationToken,
}

pub struct Worker {
    queue_name: String,
    opts: WorkerOptions,
    link: RedisLink,
    scripts: Arc<Scripts>,
    repeat: Repeat,
    processor: Arc<dyn Processor>,
    token_base: String,
    token_seq: AtomicU64,
    concurrency: AtomicUsize,
    running: AtomicBool,
    shutdown: CancellationToken,
    in_flight: Mutex<HashMap<String, InFlight>>,
    slot_free: tokio::sync::Notify,
}

impl Worker {
    /// Connect and build a worker. With `autorun` (the default) the fetch
    /// loop starts immediately.
    pub async fn new(
        url: &str,
        queue_name: &str,
        processor: Arc<dyn Processor>,
        opts: WorkerOptions,
    ) -> Result<Arc<Self>> {
        let link = RedisLink::connect(url).await?;
        Ok(Self::with_link(link, queue_name, processor, opts))
    }

    pub fn with_link(
        link: RedisLink,
        queue_name: &str,
        processor: Arc<dyn Processor>,
        opts: WorkerOptions,
    ) -> Arc<Self> {
        let keys = KeySpace::new(&opts.prefix, queue_name);
        let scripts = Arc::new(Scripts::new(keys, 10_000));
        let repeat = Repeat::new(Arc::clone(&scripts), opts.settings.clone());
        let worker = Arc::new(Self {
            queue_name: queue_name.to_string(),
            concurrency: AtomicUsize::new(opts.concurrency.max(1)),
            link,
            scripts,
            repeat,
            processor,
            token_base: Uuid::new_v4().to_string(),
            token_seq: AtomicU64::new(0),
            running: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
            in_flight: Mutex::new(HashMap::new()),
            slot_free: tokio::sync::Notify::new(),
            opts,
        });

        if worker.opts.autorun {
            let w = Arc::clone(&worker);
            tokio::spawn(async move {
                let queue = w.queue_name.clone();
                if let Err(e) = w.run().await {
                    tracing::error!(queue = %queue, error = %e, "Worker loop ended");
                }
            });
        }
        worker
    }

    pub fn queue_name(&self) -> &str {
        &self.queue_name
    }

    /// Re-read on every fetch cycle.
    pub fn set_concurrency(&self, concurrency: usize) {
        self.concurrency.store(concurrency.max(1), Ordering::SeqCst);
    }

    fn in_flight_count(&self) -> usize {
        self.in_flight.lock().expect("in_flight poisoned").len()
    }

    /// Main fetch loop. Returns once `close` is called.
    pub async fn run(self: Arc<Self>) -> Result<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        tracing::info!(
            queue = %self.queue_name,
            concurrency = self.concurrency.load(Ordering::SeqCst),
            "Worker started"
        );

        if !self.opts.skip_lock_renewal {
            let w = Arc::clone(&self);
            tokio::spawn(async move { w.renew_locks_loop().await });
        }
        if !self.opts.skip_stalled_check {
            let checker = StalledChecker::new(
                Arc::clone(&self.scripts),
                self.link.manager(),
                self.opts.stalled_interval,
                self.opts.max_stalled_count,
            );
            tokio::spawn(checker.run(self.shutdown.clone()));
        }

        let mut conn = self.link.manager();
        let mut blocking = self.link.blocking_connection().await?;
        let mut reconnect = ReconnectBackoff::default();
        let mut dispatched_since_drain = false;

        'outer: loop {
            if self.shutdown.is_cancelled() {
                break;
            }

            while self.in_flight_count() >= self.concurrency.load(Ordering::SeqCst) {
                // the sleep arm covers a notify that fires between the count
                // check and the wait registration
                tokio::select! {
                    _ = self.shutdown.cancelled() => break 'outer,
                    _ = self.slot_free.notified() => {}
                    _ = tokio::time::sleep(Duration::from_millis(50)) => {}
                }
            }

            let token = format!(
                "{}:{}",
                self.token_base,
                self.token_seq.fetch_add(1, Ordering::Relaxed)
            );
            let now = Utc::now().timestamp_millis();
            match self
                .scripts
                .move_to_active(
                    &mut conn,
                    &token,
                    self.opts.lock_duration,
                    self.opts.limiter.as_ref(),
                    now,
                )
                .await
            {
                Ok(Dispatch::Job(job)) => {
                    reconnect.reset();
                    dispatched_since_drain = true;
                    if let Some(def_key) = job.repeat_job_key.clone() {
                        // schedule the series' next occurrence before the
                        // handler runs; the upsert is idempotent
                        if let Err(e) = self
                            .repeat
                            .advance(&mut conn, &def_key, &job.name, &job.data, &job.opts, now)
                            .await
                        {
                            tracing::warn!(
                                scheduler = %def_key,
                                error = %e,
                                "Could not advance job scheduler"
                            );
                        }
                    }
                    Self::spawn_processing(&self, *job, token);
                }
                Ok(Dispatch::RateLimited { limit_until }) => {
                    reconnect.reset();
                    let wait = (limit_until - now).clamp(10, self.opts.drain_delay as i64);
                    tokio::select! {
                        _ = self.shutdown.cancelled() => break,
                        _ = tokio::time::sleep(Duration::from_millis(wait as u64)) => {}
                    }
                }
                Ok(Dispatch::Empty { delay_until }) => {
                    reconnect.reset();
                    if dispatched_since_drain
                        && delay_until.is_none()
                        && self.in_flight_count() == 0
                    {
                        dispatched_since_drain = false;
                        let _ = self
                            .scripts
                            .emit_event(&mut conn, &[("event", "drained")])
                            .await;
                    }
                    let timeout = delay_until
                        .map(|d| (d - now).clamp(10, self.opts.drain_delay as i64) as u64)
                        .unwrap_or(self.opts.drain_delay);
                    self.wait_for_marker(&mut blocking, Duration::from_millis(timeout))
                        .await;
                }
                Err(e) => {
                    let delay = reconnect.next_delay();
                    tracing::warn!(
                        queue = %self.queue_name,
                        error = %e,
                        retry_in_ms = delay.as_millis() as u64,
                        "Dispatch failed"
                    );
                    tokio::select! {
                        _ = self.shutdown.cancelled() => break,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }

        tracing::info!(queue = %self.queue_name, "Worker loop stopped");
        Ok(())
    }

    /// Block on the wake-up marker up to `timeout`. A marker scored in the
    /// future is put back and waited out.
    async fn wait_for_marker(&self, blocking: &mut MultiplexedConnection, timeout: Duration) {
        let secs = (timeout.as_millis() as f64 / 1000.0).max(0.01);
        let marker_key = self.scripts.keys().marker();
        tokio::select! {
            _ = self.shutdown.cancelled() => {}
            popped = async {
                let r: redis::RedisResult<Option<(String, String, f64)>> =
                    blocking.bzpopmin(&marker_key, secs).await;
                r
            } => {
                match popped {
                    Ok(Some((_, member, score))) => {
                        let now = Utc::now().timestamp_millis();
                        let at = score as i64;
                        if at > now {
                            let _: redis::RedisResult<bool> =
                                blocking.zadd(&marker_key, member, at).await;
                            let wait = Duration::from_millis(
                                ((at - now) as u64).min(timeout.as_millis() as u64),
                            );
                            tokio::select! {
                                _ = self.shutdown.cancelled() => {}
                                _ = tokio::time::sleep(wait) => {}
                            }
                        }
                    }
                    Ok(None) => {}
                    Err(e) => {
                        tracing::debug!(error = %e, "Marker wait interrupted");
                        tokio::time::sleep(Duration::from_millis(50)).await;
                    }
                }
            }
        }
    }

    fn spawn_processing(this: &Arc<Self>, job: crate::job::Job, token: String) {
        // `abort` stays independent of the shutdown token: a graceful close
        // lets handlers finish; only lock loss and `close(true)` abort them.
        // Handlers observe closes cooperatively via the context token.
        let abort = CancellationToken::new();
        let observe = this.shutdown.child_token();
        let job_id = job.id.clone();
        {
            let mut in_flight = this.in_flight.lock().expect("in_flight poisoned");
            in_flight.insert(
                job_id.clone(),
                InFlight {
                    token: token.clone(),
                    cancel: abort.clone(),
                },
            );
        }

        let this = Arc::clone(this);
        tokio::spawn(async move {
            let mut ctx = JobContext::new(
                job,
                token,
                Arc::clone(&this.scripts),
                this.link.manager(),
                observe,
            );
            let outcome = tokio::select! {
                _ = abort.cancelled() => None,
                result = this.processor.process(&mut ctx) => Some(result),
            };

            match outcome {
                // cancelled: lock lost or forced shutdown. The stalled
                // checker owns the job now, so nothing is reported.
                None => {
                    tracing::warn!(job_id = %job_id, "Processing cancelled, outcome not reported");
                }
                Some(result) => {
                    if let Err(e) = this.settle(&mut ctx, result).await {
                        match e {
                            ConveyorError::LockMismatch(_) | ConveyorError::JobNotFound(_) => {
                                tracing::warn!(
                                    job_id = %job_id,
                                    error = %e,
                                    "Lock lost before settling, outcome dropped"
                                );
                            }
                            other => {
                                tracing::error!(job_id = %job_id, error = %other, "Settling failed");
                            }
                        }
                    }
                }
            }

            let mut in_flight = this.in_flight.lock().expect("in_flight poisoned");
            in_flight.remove(&job_id);
            drop(in_flight);
            this.slot_free.notify_waiters();
        });
    }

    async fn settle(
        &self,
        ctx: &mut JobContext,
        result: std::result::Result<serde_json::Value, ProcessError>,
    ) -> Result<()> {
        let mut conn = self.link.manager();
        let now = Utc::now().timestamp_millis();
        let job_id = ctx.job.id.clone();
        let token = ctx.token().to_string();

        if let Some(due_at) = ctx.requested_delay() {
            return self
                .scripts
                .move_to_delayed(&mut conn, &job_id, &token, due_at, false, "", "", now)
                .await;
        }

        if ctx.requested_wait_children() {
            let moved = self
                .scripts
                .move_to_waiting_children(&mut conn, &job_id, &token, now)
                .await?;
            if moved {
                return Ok(());
            }
            // no unresolved dependencies: fall through and complete
        }

        match result {
            Ok(value) => {
                let keep = ctx.job.opts.remove_on_complete.script_args();
                self.scripts
                    .move_to_completed(
                        &mut conn,
                        &job_id,
                        &token,
                        &serde_json::to_string(&value)?,
                        keep,
                        now,
                    )
                    .await?;
                tracing::debug!(job_id = %job_id, "Job completed");
                Ok(())
            }
            Err(e) => self.settle_failure(ctx, &mut conn, e.to_string(), now).await,
        }
    }

    async fn settle_failure(
        &self,
        ctx: &JobContext,
        conn: &mut ConnectionManager,
        reason: String,
        now: i64,
    ) -> Result<()> {
        let job = &ctx.job;
        let job_id = job.id.clone();
        let token = ctx.token().to_string();

        let mut stacktrace = job.stacktrace.clone();
        stacktrace.push(reason.clone());
        let limit = job.opts.stack_trace_limit();
        if stacktrace.len() > limit {
            let excess = stacktrace.len() - limit;
            stacktrace.drain(..excess);
        }
        let stack_json = serde_json::to_string(&stacktrace)?;

        let mut terminal_reason = reason.clone();
        let mut will_retry = !ctx.is_discarded() && job.retries_remaining();

        if will_retry {
            let delay = match &job.opts.backoff {
                Some(b) => match backoff::compute_delay(
                    b,
                    job.attempts_made + 1,
                    Some(&reason),
                    job,
                    &self.opts.settings,
                ) {
                    Ok(d) => d,
                    Err(e) => {
                        // a broken backoff strategy fails the job with the
                        // strategy's own message
                        will_retry = false;
                        terminal_reason = e.to_string();
                        None
                    }
                },
                None => None,
            };

            if will_retry {
                tracing::debug!(
                    job_id = %job_id,
                    attempts_made = job.attempts_made + 1,
                    delay_ms = delay.unwrap_or(0),
                    "Job failed, retrying"
                );
                return match delay {
                    Some(ms) => {
                        self.scripts
                            .move_to_delayed(
                                conn,
                                &job_id,
                                &token,
                                now + ms as i64,
                                true,
                                &stack_json,
                                &reason,
                                now,
                            )
                            .await
                    }
                    None => {
                        self.scripts
                            .retry_from_active(conn, &job_id, &token, &stack_json, &reason, now)
                            .await
                    }
                };
            }
        }

        let keep = job.opts.remove_on_fail.script_args();
        self.scripts
            .move_to_failed(conn, &job_id, &token, &terminal_reason, keep, &stack_json, now)
            .await?;
        tracing::debug!(job_id = %job_id, reason = %terminal_reason, "Job failed terminally");
        Ok(())
    }

    async fn renew_locks_loop(self: Arc<Self>) {
        let mut conn = self.link.manager();
        let mut ticker =
            tokio::time::interval(Duration::from_millis(self.opts.lock_renew_time().max(1)));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let entries: Vec<(String, String, CancellationToken)> = {
                let in_flight = self.in_flight.lock().expect("in_flight poisoned");
                in_flight
                    .iter()
                    .map(|(id, f)| (id.clone(), f.token.clone(), f.cancel.clone()))
                    .collect()
            };

            for (job_id, token, cancel) in entries {
                match self
                    .scripts
                    .extend_lock(&mut conn, &job_id, &token, self.opts.lock_duration)
                    .await
                {
                    Ok(true) => {}
                    Ok(false) => {
                        tracing::warn!(job_id = %job_id, "Lock lost, cancelling handler");
                        cancel.cancel();
                    }
                    Err(e) => {
                        tracing::warn!(job_id = %job_id, error = %e, "Lock renewal errored");
                    }
                }
            }
        }
    }

    /// Stop fetching and wait for in-flight jobs. `force` abandons them
    /// instead; they will stall and be recovered elsewhere.
    pub async fn close(&self, force: bool) {
        tracing::info!(queue = %self.queue_name, force, "Worker closing");
        self.shutdown.cancel();
        if force {
            let in_flight = self.in_flight.lock().expect("in_flight poisoned");
            for flight in in_flight.values() {
                flight.cancel.cancel();
            }
        }
        while self.in_flight_count() > 0 {
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        tracing::info!(queue = %self.queue_name, "Worker closed");
    }
}
