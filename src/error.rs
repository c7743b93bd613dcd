use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConveyorError {
    #[error("Job not found: {0}")]
    JobNotFound(String),

    #[error("Job {0} is not in the expected state")]
    WrongState(String),

    #[error("Lock mismatch for job {0}")]
    LockMismatch(String),

    #[error("Missing parent job for {0}")]
    ParentMissing(String),

    #[error("End date must be greater than current timestamp")]
    EndDateInPast,

    #[error("Both .pattern and .every options are defined for this repeatable job")]
    ConflictingRepeatOptions,

    #[error("Job {0} belongs to a job scheduler and cannot be removed directly. remove")]
    SchedulerOwnedJob(String),

    #[error("Could not remove job {0}: it is active or has pending dependents")]
    RemoveRejected(String),

    #[error("Cannot obliterate queue with active jobs")]
    ObliterateActive,

    #[error("Invalid cron pattern {pattern:?}: {source}")]
    InvalidPattern {
        pattern: String,
        source: cron::error::Error,
    },

    #[error("Unknown timezone: {0}")]
    UnknownTimezone(String),

    #[error("Unknown backoff strategy: {0}")]
    UnknownBackoffStrategy(String),

    /// A registered backoff or repeat strategy failed; the strategy's own
    /// message is surfaced verbatim.
    #[error("{0}")]
    Strategy(String),

    #[error("Invalid options: {0}")]
    InvalidOptions(#[from] serde_json::Error),

    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Unexpected script reply: {0}")]
    ScriptReply(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Discriminated integer codes returned by the atomic scripts.
///
/// The worker's control flow branches on these, so the numeric values are
/// load-bearing and must stay in sync with `src/commands/*.lua`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScriptCode {
    JobNotFound,
    WrongState,
    LockMismatch,
    ParentMissing,
}

impl ScriptCode {
    pub fn from_reply(code: i64) -> Option<Self> {
        match code {
            -1 => Some(ScriptCode::JobNotFound),
            -2 => Some(ScriptCode::WrongState),
            -3 => Some(ScriptCode::LockMismatch),
            -6 => Some(ScriptCode::ParentMissing),
            _ => None,
        }
    }

    pub fn into_error(self, job_id: &str) -> ConveyorError {
        match self {
            ScriptCode::JobNotFound => ConveyorError::JobNotFound(job_id.to_string()),
            ScriptCode::WrongState => ConveyorError::WrongState(job_id.to_string()),
            ScriptCode::LockMismatch => ConveyorError::LockMismatch(job_id.to_string()),
            ScriptCode::ParentMissing => ConveyorError::ParentMissing(job_id.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, ConveyorError>;
