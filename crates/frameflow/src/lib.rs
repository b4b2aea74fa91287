//! frameflow: bounded-concurrency task queues and pooled frame buffers for media
//! pipelines.

pub mod buffer;
pub mod permit;
pub mod queue;
pub mod task;
pub mod telemetry;

pub use buffer::{
    AttributeSignature, BufferAttributes, BufferBackend, HeapBackend, PixelBuffer, PixelFormat,
    PoolCache, PoolError,
};
pub use permit::{Permit, PermitPool};
pub use queue::{QueueConfig, QueueSnapshot, TaskQueue};
pub use task::{CancellationToken, Task, TaskBuilder, TaskId, TaskStatus};
