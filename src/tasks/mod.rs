//! Background task tracking and execution.

pub mod registry;
pub mod worker_pool;

pub use registry::{CancellationToken, Task, TaskError, TaskRegistry, TaskStatus, TaskUpdate};
pub use worker_pool::{Job, JobContext, JobResult, WorkerPool};
