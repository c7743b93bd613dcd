//! conveyor: a distributed, persistent job queue on a Redis-compatible
//! store.
//!
//! Producers add named jobs with structured payloads; workers across any
//! number of processes claim them atomically, run them, and report back.
//! Delivery is at-least-once; dispatch is FIFO within a priority class.
//! Delayed execution, cron/interval repetition, rate limiting, retries with
//! backoff and parent/child flows are built in.
//!
//! All shared state lives in the store. Every multi-key transition is a
//! single server-side script (see `src/commands/`), so any number of
//! producers, workers and observers coordinate without shared memory.

pub mod backoff;
pub mod connection;
pub mod error;
pub mod events;
pub mod flow;
pub mod job;
pub mod keys;
pub mod options;
pub mod queue;
pub mod repeat;
pub mod scripts;
pub mod worker;

pub use error::{ConveyorError, Result};
pub use events::{EventSubscription, QueueEvent, QueueEvents, QueueEventsOptions};
pub use flow::{AddedFlowNode, FlowJob, FlowProducer, FlowProducerOptions};
pub use job::{Job, ParentRef};
pub use options::{
    BackoffKind, BackoffOptions, JobOptions, KeepPolicy, QueueOptions, QueueSettings,
    RateLimiterOptions, RepeatOptions, WorkerOptions,
};
pub use queue::{JobCounts, JobState, Queue};
pub use repeat::RepeatableJob;
pub use worker::{JobContext, ProcessError, Processor, Worker};
