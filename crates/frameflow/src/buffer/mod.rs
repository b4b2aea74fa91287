//! Frame buffer pooling.
//!
//! Requests are canonicalized into an [`AttributeSignature`]; the [`PoolCache`]
//! keeps one [`ResourcePool`] per signature and evicts pools that sat idle for a
//! full flush interval. Storage comes from a pluggable [`BufferBackend`].

mod backend;
mod cache;
mod format;
mod pool;

pub use backend::{
    BackendError, BufferBackend, BufferRecycler, HeapBackend, NativePool, PixelBuffer,
};
pub use cache::{CacheConfig, CacheSnapshot, DEFAULT_FLUSH_INTERVAL, PoolCache, PoolStats};
pub use format::{AttributeSignature, BufferAttributes, Compatibility, PixelFormat};
pub use pool::{PoolError, ResourcePool};
