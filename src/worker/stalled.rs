//! Stalled-job recovery.
//!
//! Every worker runs a checker, but only one per queue sweeps at a time: the
//! sweep script takes an atomic `SET NX PX` probe on the stalled-check key
//! and no-ops everywhere else.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::job::Job;
use crate::options::KeepPolicy;
use crate::scripts::Scripts;

pub(crate) const STALLED_FAILURE_REASON: &str = "job stalled more than allowable limit";

pub(crate) struct StalledChecker {
    scripts: Arc<Scripts>,
    conn: ConnectionManager,
    stalled_interval: u64,
    max_stalled_count: u32,
}

impl StalledChecker {
    pub(crate) fn new(
        scripts: Arc<Scripts>,
        conn: ConnectionManager,
        stalled_interval: u64,
        max_stalled_count: u32,
    ) -> Self {
        Self {
            scripts,
            conn,
            stalled_interval,
            max_stalled_count,
        }
    }

    pub(crate) async fn run(mut self, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(Duration::from_millis(self.stalled_interval));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.sweep().await {
                        tracing::warn!(error = %e, "Stalled sweep failed");
                    }
                }
            }
        }
    }

    async fn sweep(&mut self) -> Result<()> {
        let now = Utc::now().timestamp_millis();
        let (requeued, to_fail) = self
            .scripts
            .move_stalled_jobs_to_wait(
                &mut self.conn,
                self.max_stalled_count,
                self.stalled_interval,
                now,
            )
            .await?;

        for job_id in &requeued {
            tracing::warn!(job_id = %job_id, "Recovered stalled job");
        }

        for job_id in to_fail {
            if let Err(e) = self.fail_stalled(&job_id).await {
                tracing::error!(job_id = %job_id, error = %e, "Failed to fail stalled job");
            }
        }
        Ok(())
    }

    /// Fail a job past its stall limit through the normal terminal
    /// transition, so keep policies and parent policies apply. The sweep
    /// already bumped its stalledCounter and attemptsStarted; the empty
    /// token skips the lock assertion (the lock is gone by definition).
    async fn fail_stalled(&mut self, job_id: &str) -> Result<()> {
        let map: HashMap<String, String> = self
            .conn
            .hgetall(self.scripts.keys().job(job_id))
            .await?;
        let keep = if map.is_empty() {
            KeepPolicy::default().script_args()
        } else {
            Job::from_hash(job_id, &map)?.opts.remove_on_fail.script_args()
        };
        let now = Utc::now().timestamp_millis();
        self.scripts
            .move_to_failed(
                &mut self.conn,
                job_id,
                "",
                STALLED_FAILURE_REASON,
                keep,
                "",
                now,
            )
            .await?;
        tracing::warn!(job_id = %job_id, "Stalled job exceeded recovery limit, failed");
        Ok(())
    }
}
