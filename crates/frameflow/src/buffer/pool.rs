//! ResourcePool - one native pool plus its last-access time.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use tokio::time::Instant;

use super::backend::{BackendError, BufferBackend, NativePool, PixelBuffer};
use super::format::AttributeSignature;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PoolError {
    #[error("invalid buffer attributes: {0}")]
    InvalidAttributes(String),

    #[error("buffer allocation failed: {0}")]
    Allocation(#[from] BackendError),
}

struct PoolState {
    native: Box<dyn NativePool>,
    last_access: Instant,
}

/// A native pool for exactly one signature.
///
/// Draws and flushes go through one lock, so a flush never races an in-flight
/// draw on the same pool. Both count as an access.
pub struct ResourcePool {
    signature: AttributeSignature,
    state: Mutex<PoolState>,
    drawn: AtomicU64,
    failed: AtomicU64,
    flushes: AtomicU64,
}

impl ResourcePool {
    pub fn new(
        backend: &dyn BufferBackend,
        signature: AttributeSignature,
    ) -> Result<Self, PoolError> {
        let native = backend.create_pool(&signature)?;
        tracing::debug!(signature = %signature, "Resource pool created");

        Ok(Self {
            signature,
            state: Mutex::new(PoolState {
                native,
                last_access: Instant::now(),
            }),
            drawn: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            flushes: AtomicU64::new(0),
        })
    }

    pub fn signature(&self) -> &AttributeSignature {
        &self.signature
    }

    /// Draw one buffer and refresh the last-access time.
    pub fn create_buffer(&self) -> Result<PixelBuffer, PoolError> {
        let mut state = self.lock_state();
        match state.native.allocate() {
            Ok(buffer) => {
                state.last_access = Instant::now();
                self.drawn.fetch_add(1, Ordering::Relaxed);
                Ok(buffer)
            }
            Err(e) => {
                self.failed.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(signature = %self.signature, error = %e, "Buffer draw failed");
                Err(e.into())
            }
        }
    }

    /// Release idle buffers. Checked-out buffers stay valid.
    pub fn flush(&self) -> usize {
        let mut state = self.lock_state();
        let released = state.native.flush();
        state.last_access = Instant::now();
        self.flushes.fetch_add(1, Ordering::Relaxed);
        released
    }

    pub fn last_access(&self) -> Instant {
        self.lock_state().last_access
    }

    pub fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_access())
    }

    pub fn buffers_drawn(&self) -> u64 {
        self.drawn.load(Ordering::Relaxed)
    }

    pub fn failed_draws(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }

    pub fn flushes(&self) -> u64 {
        self.flushes.load(Ordering::Relaxed)
    }

    fn lock_state(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(|poisoned| {
            tracing::error!(signature = %self.signature, "Pool mutex poisoned, recovering");
            poisoned.into_inner()
        })
    }
}

impl Drop for ResourcePool {
    fn drop(&mut self) {
        tracing::trace!(signature = %self.signature, "Resource pool released");
    }
}

impl std::fmt::Debug for ResourcePool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourcePool")
            .field("signature", &self.signature)
            .field("buffers_drawn", &self.buffers_drawn())
            .field("flushes", &self.flushes())
            .finish()
    }
}
