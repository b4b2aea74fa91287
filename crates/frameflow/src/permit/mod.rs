//! Counting permit pool for bounded task execution.
//!
//! A [`Permit`] is one unit of concurrency capacity:
//! - acquired by a dispatch unit before its task starts executing
//! - held by the queue slot while the task runs
//! - returned to the pool on drop, so release happens exactly once however the task settles

mod pool;

pub use pool::{Permit, PermitPool};
