//! vidsync-queue: persistent job queue with leases, retries and stall
//! recovery, plus the per-kind worker pools that drain it.

pub mod queue;
pub mod scheduler;

pub use queue::{
    CancelOutcome, EnqueueOptions, FailOutcome, JobQueue, QueueCounts, QueueError, QueuePolicy,
    QueueResult,
};
pub use scheduler::{JobContext, JobHandler, JobOutcome, Scheduler, SchedulerSettings};
