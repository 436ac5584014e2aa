//! Per-owner serialized job execution.

mod item;
mod job;
mod outcome;
mod queue;

pub use item::{
    Claim, MemoryWorkItemStore, Prepare, WorkItem, WorkItemStats, WorkItemStore, WorkStep,
};
pub use job::{JobId, JobRecord, JobResult, JobStatus, JobStore, MemoryJobStore};
pub use outcome::JobOutcome;
pub use queue::{JobDispatcher, PlaceholderGuard, QueueSettings, WorkQueue};
