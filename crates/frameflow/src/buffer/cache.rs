//! PoolCache - signature-keyed resource pools with idle eviction.
//!
//! The pool map, the flush policy and the sweeper handle live under one mutex.
//! Draws take only the per-pool lock; eviction takes the map lock and then each
//! pool's lock, never the other way around.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use serde::Serialize;
use tokio::runtime::Handle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use super::backend::{BufferBackend, PixelBuffer};
use super::format::{AttributeSignature, BufferAttributes, PixelFormat};
use super::pool::{PoolError, ResourcePool};

pub const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_secs(1);

/// Cache configuration.
///
/// `Default` reads:
/// - `FRAMEFLOW_AUTO_FLUSH`: `0` or `false` disables the periodic sweep
/// - `FRAMEFLOW_FLUSH_INTERVAL`: sweep interval and idle threshold, in seconds
#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub auto_flush: bool,
    pub flush_interval: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        let auto_flush = !matches!(
            std::env::var("FRAMEFLOW_AUTO_FLUSH").as_deref(),
            Ok("0") | Ok("false")
        );

        let flush_interval = std::env::var("FRAMEFLOW_FLUSH_INTERVAL")
            .ok()
            .and_then(|s| s.parse::<f64>().ok())
            .filter(|secs| secs.is_finite() && *secs > 0.0)
            .map(Duration::from_secs_f64)
            .unwrap_or(DEFAULT_FLUSH_INTERVAL);

        Self {
            auto_flush,
            flush_interval,
        }
    }
}

impl CacheConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_auto_flush(mut self, auto_flush: bool) -> Self {
        self.auto_flush = auto_flush;
        self
    }

    pub fn with_flush_interval(mut self, interval: Duration) -> Self {
        self.flush_interval = interval;
        self
    }
}

fn normalize_interval(interval: Duration) -> Duration {
    if interval.is_zero() {
        DEFAULT_FLUSH_INTERVAL
    } else {
        interval
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

#[derive(Debug, Clone, Serialize)]
pub struct PoolStats {
    pub signature: AttributeSignature,
    pub buffers_drawn: u64,
    pub failed_draws: u64,
    pub idle_ms: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct CacheSnapshot {
    pub auto_flush: bool,
    pub flush_interval_ms: u64,
    pub pools: Vec<PoolStats>,
}

struct CacheState {
    pools: HashMap<AttributeSignature, Arc<ResourcePool>>,
    auto_flush: bool,
    interval: Duration,
    sweeper: Option<CancellationToken>,
}

struct CacheInner {
    backend: Arc<dyn BufferBackend>,
    runtime: Handle,
    state: Mutex<CacheState>,
}

impl Drop for CacheInner {
    fn drop(&mut self) {
        let state = self.state.get_mut().unwrap_or_else(|p| p.into_inner());
        if let Some(sweeper) = state.sweeper.take() {
            sweeper.cancel();
        }
    }
}

/// Shared handle to a pool cache. Clones share the same pools; the sweeper
/// stops once the last handle is dropped.
#[derive(Clone)]
pub struct PoolCache {
    inner: Arc<CacheInner>,
}

impl PoolCache {
    /// Create a cache on the current tokio runtime.
    ///
    /// # Panics
    ///
    /// Panics if called outside a tokio runtime.
    pub fn new(backend: Arc<dyn BufferBackend>, config: CacheConfig) -> Self {
        Self::with_handle(backend, config, Handle::current())
    }

    pub fn with_handle(
        backend: Arc<dyn BufferBackend>,
        config: CacheConfig,
        runtime: Handle,
    ) -> Self {
        let cache = Self {
            inner: Arc::new(CacheInner {
                backend,
                runtime,
                state: Mutex::new(CacheState {
                    pools: HashMap::new(),
                    auto_flush: false,
                    interval: normalize_interval(config.flush_interval),
                    sweeper: None,
                }),
            }),
        };
        cache.configure_auto_flush(config.auto_flush, config.flush_interval);
        cache
    }

    /// Draw a buffer of the given size. A missing format is invalid: nothing is
    /// drawn and no pool is created.
    pub fn get_buffer(
        &self,
        width: u32,
        height: u32,
        pixel_format: Option<PixelFormat>,
    ) -> Option<PixelBuffer> {
        let attributes = BufferAttributes {
            pixel_format,
            ..BufferAttributes::new().with_size(width, height)
        };
        self.get_buffer_for(&attributes)
    }

    /// Draw a buffer in the default format (`PixelFormat::NV12_FULL_RANGE`).
    pub fn get_default_buffer(&self, width: u32, height: u32) -> Option<PixelBuffer> {
        self.get_buffer(width, height, Some(PixelFormat::default()))
    }

    /// Like [`try_get_buffer`](Self::try_get_buffer), with failures logged and
    /// folded into `None`.
    pub fn get_buffer_for(&self, attributes: &BufferAttributes) -> Option<PixelBuffer> {
        match self.try_get_buffer(attributes) {
            Ok(buffer) => Some(buffer),
            Err(PoolError::InvalidAttributes(reason)) => {
                tracing::debug!(%reason, "Buffer request rejected");
                None
            }
            Err(e) => {
                tracing::warn!(error = %e, "No buffer available");
                None
            }
        }
    }

    pub fn try_get_buffer(
        &self,
        attributes: &BufferAttributes,
    ) -> Result<PixelBuffer, PoolError> {
        let signature = attributes.validate()?;
        let (pool, auto_flush) = {
            let mut state = self.lock_state();
            let pool = self.resolve(&mut state, signature)?;
            (pool, state.auto_flush)
        };

        let buffer = pool.create_buffer();
        if !auto_flush {
            pool.flush();
        }
        buffer
    }

    /// The pool for `attributes`, created if absent. Holding the returned pool
    /// keeps it usable after eviction; the cache just forgets it.
    pub fn pool_for(
        &self,
        attributes: &BufferAttributes,
    ) -> Result<Arc<ResourcePool>, PoolError> {
        let signature = attributes.validate()?;
        let mut state = self.lock_state();
        self.resolve(&mut state, signature)
    }

    /// Set the policy and re-arm the sweeper. A zero interval means the default.
    /// Any previous sweeper is cancelled first, so at most one runs at a time.
    pub fn configure_auto_flush(&self, enabled: bool, interval: Duration) {
        let interval = normalize_interval(interval);
        let mut state = self.lock_state();

        if let Some(previous) = state.sweeper.take() {
            previous.cancel();
        }
        state.auto_flush = enabled;
        state.interval = interval;
        if enabled {
            state.sweeper = Some(self.spawn_sweeper(interval));
        }

        tracing::debug!(
            enabled,
            interval_ms = millis(interval),
            "Auto-flush configured"
        );
    }

    /// Flush and drop every pool idle for at least the configured interval.
    pub fn evict_idle(&self) -> usize {
        let now = Instant::now();
        let mut state = self.lock_state();
        let interval = state.interval;
        let before = state.pools.len();

        state.pools.retain(|signature, pool| {
            let idle = pool.idle_for(now);
            if idle < interval {
                return true;
            }
            let released = pool.flush();
            tracing::info!(
                signature = %signature,
                idle_ms = millis(idle),
                released,
                "Evicting idle pool"
            );
            false
        });

        before - state.pools.len()
    }

    /// Stop the sweeper and drop every pool. The cache can still be used
    /// afterwards; pools are recreated on demand and auto-flush stays off.
    pub fn shutdown(&self) -> usize {
        let mut state = self.lock_state();
        if let Some(sweeper) = state.sweeper.take() {
            sweeper.cancel();
        }
        state.auto_flush = false;

        let pools: Vec<_> = state.pools.drain().map(|(_, pool)| pool).collect();
        for pool in &pools {
            pool.flush();
        }
        tracing::info!(pools = pools.len(), "Pool cache shut down");
        pools.len()
    }

    pub fn len(&self) -> usize {
        self.lock_state().pools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, signature: &AttributeSignature) -> bool {
        self.lock_state().pools.contains_key(signature)
    }

    pub fn auto_flush(&self) -> bool {
        self.lock_state().auto_flush
    }

    pub fn flush_interval(&self) -> Duration {
        self.lock_state().interval
    }

    pub fn snapshot(&self) -> CacheSnapshot {
        let now = Instant::now();
        let state = self.lock_state();
        let mut pools: Vec<PoolStats> = state
            .pools
            .values()
            .map(|pool| PoolStats {
                signature: *pool.signature(),
                buffers_drawn: pool.buffers_drawn(),
                failed_draws: pool.failed_draws(),
                idle_ms: millis(pool.idle_for(now)),
            })
            .collect();
        pools.sort_by_key(|p| {
            (
                p.signature.width(),
                p.signature.height(),
                p.signature.pixel_format().raw(),
            )
        });

        CacheSnapshot {
            auto_flush: state.auto_flush,
            flush_interval_ms: millis(state.interval),
            pools,
        }
    }

    fn resolve(
        &self,
        state: &mut CacheState,
        signature: AttributeSignature,
    ) -> Result<Arc<ResourcePool>, PoolError> {
        if let Some(pool) = state.pools.get(&signature) {
            return Ok(Arc::clone(pool));
        }

        let pool = Arc::new(ResourcePool::new(self.inner.backend.as_ref(), signature)?);
        state.pools.insert(signature, Arc::clone(&pool));
        tracing::info!(
            signature = %signature,
            pools = state.pools.len(),
            "Pool added to cache"
        );
        Ok(pool)
    }

    fn spawn_sweeper(&self, interval: Duration) -> CancellationToken {
        let token = CancellationToken::new();
        let stop = token.clone();
        let cache: Weak<CacheInner> = Arc::downgrade(&self.inner);

        self.inner.runtime.spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = stop.cancelled() => break,
                    _ = ticker.tick() => {
                        let Some(inner) = cache.upgrade() else { break };
                        let evicted = PoolCache { inner }.evict_idle();
                        if evicted > 0 {
                            tracing::debug!(evicted, "Sweep finished");
                        }
                    }
                }
            }
            tracing::trace!("Sweeper stopped");
        });

        token
    }

    fn lock_state(&self) -> MutexGuard<'_, CacheState> {
        self.inner.state.lock().unwrap_or_else(|poisoned| {
            tracing::error!("Cache mutex poisoned, recovering");
            poisoned.into_inner()
        })
    }
}

impl std::fmt::Debug for PoolCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.lock_state();
        f.debug_struct("PoolCache")
            .field("pools", &state.pools.len())
            .field("auto_flush", &state.auto_flush)
            .field("interval", &state.interval)
            .finish()
    }
}
