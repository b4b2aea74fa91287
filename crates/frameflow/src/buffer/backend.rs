//! Buffer backends.
//!
//! A backend turns an [`AttributeSignature`] into a native pool; the native pool
//! hands out [`PixelBuffer`]s. [`HeapBackend`] is the in-process implementation:
//! frames are plain byte vectors recycled through a per-pool free list.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};

use super::format::{AttributeSignature, PixelFormat};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BackendError {
    #[error("buffer pool exhausted")]
    Exhausted,

    #[error("unsupported pixel format {0}")]
    UnsupportedFormat(PixelFormat),

    #[error("backend failure: {0}")]
    Backend(String),
}

/// Creates native pools for validated signatures.
pub trait BufferBackend: Send + Sync {
    fn create_pool(
        &self,
        signature: &AttributeSignature,
    ) -> Result<Box<dyn NativePool>, BackendError>;
}

/// One native pool. Calls are serialized by the owning `ResourcePool`.
pub trait NativePool: Send + Sync {
    fn allocate(&self) -> Result<PixelBuffer, BackendError>;

    /// Release buffers that are not checked out. Returns how many were released.
    fn flush(&self) -> usize;
}

/// Receives frame storage back when a [`PixelBuffer`] is dropped.
pub trait BufferRecycler: Send + Sync {
    fn recycle(&self, data: Vec<u8>);
}

/// A drawn frame. Owns its storage; remains valid after its pool is flushed or
/// evicted.
pub struct PixelBuffer {
    signature: AttributeSignature,
    data: Vec<u8>,
    home: Option<Weak<dyn BufferRecycler>>,
}

impl PixelBuffer {
    pub fn new(signature: AttributeSignature, data: Vec<u8>) -> Self {
        Self {
            signature,
            data,
            home: None,
        }
    }

    /// Storage goes back to `home` on drop, if it is still alive.
    pub fn recycled(
        signature: AttributeSignature,
        data: Vec<u8>,
        home: Weak<dyn BufferRecycler>,
    ) -> Self {
        Self {
            signature,
            data,
            home: Some(home),
        }
    }

    pub fn signature(&self) -> &AttributeSignature {
        &self.signature
    }

    pub fn width(&self) -> u32 {
        self.signature.width()
    }

    pub fn height(&self) -> u32 {
        self.signature.height()
    }

    pub fn pixel_format(&self) -> PixelFormat {
        self.signature.pixel_format()
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.data
    }
}

impl Drop for PixelBuffer {
    fn drop(&mut self) {
        if let Some(home) = self.home.take().and_then(|h| h.upgrade()) {
            home.recycle(std::mem::take(&mut self.data));
        }
    }
}

impl std::fmt::Debug for PixelBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PixelBuffer")
            .field("signature", &self.signature)
            .field("len", &self.data.len())
            .field("recycled", &self.home.is_some())
            .finish()
    }
}

/// Heap-allocated frames.
#[derive(Debug, Default)]
pub struct HeapBackend {
    max_buffers: Option<usize>,
    pools_created: AtomicUsize,
}

impl HeapBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cap the number of buffers each pool may have checked out at once.
    pub fn with_max_buffers(mut self, max_buffers: usize) -> Self {
        self.max_buffers = Some(max_buffers);
        self
    }

    pub fn pools_created(&self) -> usize {
        self.pools_created.load(Ordering::Acquire)
    }
}

impl BufferBackend for HeapBackend {
    fn create_pool(
        &self,
        signature: &AttributeSignature,
    ) -> Result<Box<dyn NativePool>, BackendError> {
        let frame_len = signature
            .pixel_format()
            .frame_len(signature.width(), signature.height())
            .ok_or(BackendError::UnsupportedFormat(signature.pixel_format()))?;

        self.pools_created.fetch_add(1, Ordering::AcqRel);

        Ok(Box::new(HeapPool {
            signature: *signature,
            frame_len,
            max_buffers: self.max_buffers,
            free: Arc::new(FreeList::default()),
        }))
    }
}

#[derive(Default)]
struct FreeList {
    idle: Mutex<Vec<Vec<u8>>>,
    outstanding: AtomicUsize,
}

impl FreeList {
    fn idle(&self) -> std::sync::MutexGuard<'_, Vec<Vec<u8>>> {
        // Only plain pushes and pops happen under this lock.
        self.idle.lock().unwrap_or_else(|p| p.into_inner())
    }
}

impl BufferRecycler for FreeList {
    fn recycle(&self, data: Vec<u8>) {
        self.outstanding.fetch_sub(1, Ordering::AcqRel);
        self.idle().push(data);
    }
}

struct HeapPool {
    signature: AttributeSignature,
    frame_len: usize,
    max_buffers: Option<usize>,
    free: Arc<FreeList>,
}

impl NativePool for HeapPool {
    fn allocate(&self) -> Result<PixelBuffer, BackendError> {
        if let Some(max) = self.max_buffers {
            if self.free.outstanding.load(Ordering::Acquire) >= max {
                return Err(BackendError::Exhausted);
            }
        }

        let data = self
            .free
            .idle()
            .pop()
            .unwrap_or_else(|| vec![0; self.frame_len]);
        self.free.outstanding.fetch_add(1, Ordering::AcqRel);

        let free: Arc<dyn BufferRecycler> = self.free.clone();
        let home: Weak<dyn BufferRecycler> = Arc::downgrade(&free);
        Ok(PixelBuffer::recycled(self.signature, data, home))
    }

    fn flush(&self) -> usize {
        let mut idle = self.free.idle();
        let released = idle.len();
        idle.clear();
        released
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn signature(format: PixelFormat) -> AttributeSignature {
        AttributeSignature::new(4, 2, format).unwrap()
    }

    #[test]
    fn allocates_frame_sized_buffers() {
        let backend = HeapBackend::new();
        let pool = backend.create_pool(&signature(PixelFormat::BGRA32)).unwrap();

        let buffer = pool.allocate().unwrap();
        assert_eq!(buffer.len(), 32);
        assert_eq!(buffer.width(), 4);
        assert_eq!(buffer.pixel_format(), PixelFormat::BGRA32);
        assert_eq!(backend.pools_created(), 1);
    }

    #[test]
    fn unknown_format_is_rejected() {
        let backend = HeapBackend::new();
        let format = PixelFormat::from_fourcc(*b"v210");
        let err = backend.create_pool(&signature(format)).err().unwrap();
        assert_eq!(err, BackendError::UnsupportedFormat(format));
        assert_eq!(backend.pools_created(), 0);
    }

    #[test]
    fn dropped_buffers_are_reused() {
        let backend = HeapBackend::new();
        let pool = backend.create_pool(&signature(PixelFormat::GRAY8)).unwrap();

        let mut buffer = pool.allocate().unwrap();
        buffer.as_mut_slice()[0] = 7;
        drop(buffer);

        let again = pool.allocate().unwrap();
        assert_eq!(again.as_slice()[0], 7);
    }

    #[test]
    fn flush_releases_idle_buffers_only() {
        let backend = HeapBackend::new();
        let pool = backend.create_pool(&signature(PixelFormat::GRAY8)).unwrap();

        let held = pool.allocate().unwrap();
        drop(pool.allocate().unwrap());
        drop(pool.allocate().unwrap());

        // both returned buffers went through the same slot
        assert_eq!(pool.flush(), 1);
        assert_eq!(pool.flush(), 0);
        assert_eq!(held.len(), 8);
    }

    #[test]
    fn max_buffers_limits_outstanding() {
        let backend = HeapBackend::new().with_max_buffers(1);
        let pool = backend.create_pool(&signature(PixelFormat::GRAY8)).unwrap();

        let first = pool.allocate().unwrap();
        assert_eq!(pool.allocate().err(), Some(BackendError::Exhausted));

        drop(first);
        assert!(pool.allocate().is_ok());
    }

    #[test]
    fn buffer_outlives_its_pool() {
        let backend = HeapBackend::new();
        let pool = backend.create_pool(&signature(PixelFormat::GRAY8)).unwrap();
        let mut buffer = pool.allocate().unwrap();
        drop(pool);

        buffer.as_mut_slice().fill(1);
        assert!(buffer.as_slice().iter().all(|b| *b == 1));
    }
}
