//! Processor-facing surface of an in-flight job.

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use serde::Serialize;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::job::Job;
use crate::scripts::Scripts;

/// Error type handlers fail with; the display string becomes `failedReason`.
pub type ProcessError = Box<dyn std::error::Error + Send + Sync>;

/// User-supplied job handler.
///
/// Returning a value completes the job; returning an error routes it through
/// the retry policy. Handlers should poll `ctx.cancellation()` at natural
/// suspension points so a closing worker can drain quickly. A handler whose
/// lock is lost is aborted and its outcome is never reported; the stalled
/// checker owns such jobs.
#[async_trait]
pub trait Processor: Send + Sync + 'static {
    async fn process(
        &self,
        ctx: &mut JobContext,
    ) -> std::result::Result<serde_json::Value, ProcessError>;
}

/// An active job plus the store operations a handler may perform on it.
pub struct JobContext {
    pub job: Job,
    token: String,
    scripts: Arc<Scripts>,
    conn: ConnectionManager,
    cancel: CancellationToken,
    discarded: bool,
    delay_until: Option<i64>,
    wait_children: bool,
}

impl JobContext {
    pub(crate) fn new(
        job: Job,
        token: String,
        scripts: Arc<Scripts>,
        conn: ConnectionManager,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            job,
            token,
            scripts,
            conn,
            cancel,
            discarded: false,
            delay_until: None,
            wait_children: false,
        }
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    /// Fires when the worker is closing. Handlers that poll this at natural
    /// suspension points can wrap up early; their returned outcome is still
    /// reported. (A lost lock aborts the handler outright instead.)
    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Persist progress and emit a `progress` event.
    pub async fn update_progress<P: Serialize>(&mut self, progress: P) -> Result<()> {
        let raw = serde_json::to_string(&progress)?;
        self.job.progress = serde_json::from_str(&raw).unwrap_or(serde_json::Value::Null);
        self.scripts
            .update_progress(&mut self.conn, &self.job.id, &raw)
            .await
    }

    /// Append a line to the job's log, bounded by `keepLogs`.
    pub async fn log(&mut self, line: &str) -> Result<usize> {
        self.scripts
            .add_log(
                &mut self.conn,
                &self.job.id,
                line,
                self.job.opts.keep_logs.unwrap_or(0),
            )
            .await
    }

    /// Bypass remaining retries: the next failure is terminal.
    pub fn discard(&mut self) {
        self.discarded = true;
    }

    pub(crate) fn is_discarded(&self) -> bool {
        self.discarded
    }

    /// Request a move to `delayed` firing at `timestamp` (ms) once the
    /// handler returns. The handler's return value is not recorded.
    pub fn delay_until(&mut self, timestamp: i64) {
        self.delay_until = Some(timestamp);
    }

    pub(crate) fn requested_delay(&self) -> Option<i64> {
        self.delay_until
    }

    /// Request a move to `waiting-children` once the handler returns. If no
    /// unresolved dependencies remain the job completes normally instead.
    pub fn wait_for_children(&mut self) {
        self.wait_children = true;
    }

    pub(crate) fn requested_wait_children(&self) -> bool {
        self.wait_children
    }
}
