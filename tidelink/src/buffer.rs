//! Fixed-capacity reusable byte buffers.
//!
//! A [`Buffer`] is drawn from a [`BufferPool`] and must be returned via
//! [`BufferPool::release`] exactly once. A buffer dropped without being
//! released is a leak; a buffer released twice is a bug. Rust has no GC
//! finalizers, so leak detection is implemented with `Drop` plus a
//! `Weak` back-reference to the pool's outstanding-allocation ledger.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use bytes::BytesMut;
use crossbeam_queue::SegQueue;
use parking_lot::Mutex;

use crate::error::{Result, TransportError};

/// Conservative MTU: the maximum useful size of a single datagram payload.
pub const MAX_PACKET_SIZE: usize = 1024;

struct PoolShared {
    free: SegQueue<BytesMut>,
    outstanding: Mutex<HashSet<u64>>,
    capacity: usize,
    created: AtomicU64,
    next_id: AtomicU64,
}

/// A reusable byte buffer checked out from a [`BufferPool`].
///
/// Must be handed back via [`BufferPool::release`]. If dropped instead, the
/// pool's leak counter is incremented and a warning is logged -- this is the
/// allocation-ID-ledger substitute for a GC finalizer.
pub struct Buffer {
    id: u64,
    data: Option<BytesMut>,
    pool: Weak<PoolShared>,
}

impl Buffer {
    fn leaked(&self) -> bool {
        self.data.is_some()
    }

    /// The allocation id, unique for the lifetime of the owning pool.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Immutable view of the written bytes.
    pub fn as_slice(&self) -> &[u8] {
        self.data.as_deref().map(|b| &b[..]).unwrap_or(&[])
    }

    /// Mutable view of the underlying storage (capacity-bounded).
    pub fn as_mut(&mut self) -> &mut BytesMut {
        self.data.as_mut().expect("buffer already released")
    }

    /// Number of bytes currently written.
    pub fn len(&self) -> usize {
        self.data.as_ref().map(|b| b.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Drop for Buffer {
    fn drop(&mut self) {
        if self.leaked() {
            if let Some(pool) = self.pool.upgrade() {
                pool.outstanding.lock().remove(&self.id);
            }
            tracing::warn!(buffer_id = self.id, "buffer dropped without release (leak)");
        }
    }
}

/// Thread-safe free list of fixed-capacity byte buffers.
///
/// `acquire`/`release` are lock-free on the fast path (the free list is a
/// `crossbeam_queue::SegQueue`); only the outstanding-allocation ledger used
/// for leak/double-release detection is guarded by a short-lived mutex.
pub struct BufferPool {
    shared: Arc<PoolShared>,
    initial_size: usize,
}

impl BufferPool {
    /// Create a pool pre-populated with `initial_size` buffers of `capacity`
    /// bytes each (capacity defaults to [`MAX_PACKET_SIZE`] at the call site).
    pub fn new(capacity: usize, initial_size: usize) -> Self {
        let shared = Arc::new(PoolShared {
            free: SegQueue::new(),
            outstanding: Mutex::new(HashSet::new()),
            capacity,
            created: AtomicU64::new(initial_size as u64),
            next_id: AtomicU64::new(0),
        });
        for _ in 0..initial_size {
            shared.free.push(BytesMut::with_capacity(capacity));
        }
        Self {
            shared,
            initial_size,
        }
    }

    /// Acquire a buffer, growing the pool if the free list is empty.
    pub fn acquire(&self) -> Buffer {
        let mut data = self.shared.free.pop().unwrap_or_else(|| {
            self.shared.created.fetch_add(1, Ordering::Relaxed);
            BytesMut::with_capacity(self.shared.capacity)
        });
        data.clear();
        let id = self.shared.next_id.fetch_add(1, Ordering::Relaxed);
        self.shared.outstanding.lock().insert(id);
        Buffer {
            id,
            data: Some(data),
            pool: Arc::downgrade(&self.shared),
        }
    }

    /// Return a buffer to the free list.
    ///
    /// Releasing a buffer whose id is not (or no longer) outstanding is a
    /// double-release bug: it is logged and rejected rather than corrupting
    /// the free list.
    pub fn release(&self, mut buffer: Buffer) -> Result<()> {
        if !self.shared.outstanding.lock().remove(&buffer.id) {
            tracing::warn!(buffer_id = buffer.id, "double release of buffer");
            return Err(TransportError::BufferPoolMisuse(
                "buffer released twice or not owned by this pool",
            ));
        }
        if let Some(mut data) = buffer.data.take() {
            data.clear();
            self.shared.free.push(data);
        }
        Ok(())
    }

    /// Number of buffers currently sitting in the free list.
    pub fn free_count(&self) -> usize {
        self.shared.free.len()
    }

    /// Number of buffers acquired but not yet released.
    pub fn outstanding_count(&self) -> usize {
        self.shared.outstanding.lock().len()
    }

    /// Total buffers ever allocated (initial fill plus any growth).
    pub fn created_count(&self) -> u64 {
        self.shared.created.load(Ordering::Relaxed)
    }

    /// The pool's initial (creation-time) size, used as the quiescence baseline.
    pub fn initial_size(&self) -> usize {
        self.initial_size
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquire_release_balances() {
        let pool = BufferPool::new(MAX_PACKET_SIZE, 4);
        assert_eq!(pool.free_count(), 4);
        let buf = pool.acquire();
        assert_eq!(pool.free_count(), 3);
        pool.release(buf).unwrap();
        assert_eq!(pool.free_count(), 4);
    }

    #[test]
    fn quiescence_restores_initial_size() {
        let pool = BufferPool::new(MAX_PACKET_SIZE, 8);
        let bufs: Vec<_> = (0..8).map(|_| pool.acquire()).collect();
        assert_eq!(pool.free_count(), 0);
        for b in bufs {
            pool.release(b).unwrap();
        }
        assert_eq!(pool.free_count(), pool.initial_size());
    }

    #[test]
    fn pool_grows_past_initial_size() {
        let pool = BufferPool::new(MAX_PACKET_SIZE, 1);
        let _a = pool.acquire();
        let _b = pool.acquire();
        assert_eq!(pool.created_count(), 2);
    }

    #[test]
    fn double_release_is_rejected() {
        let pool = BufferPool::new(MAX_PACKET_SIZE, 2);
        let buf = pool.acquire();
        let id = buf.id();
        pool.release(buf).unwrap();

        // Simulate a second release attempt on the same allocation id.
        let ghost = Buffer {
            id,
            data: Some(BytesMut::new()),
            pool: Arc::downgrade(&pool.shared),
        };
        assert!(pool.release(ghost).is_err());
    }

    #[test]
    fn dropped_buffer_is_removed_from_outstanding() {
        let pool = BufferPool::new(MAX_PACKET_SIZE, 2);
        {
            let _leaked = pool.acquire();
            assert_eq!(pool.outstanding_count(), 1);
        }
        // Drop ran; the ledger entry must be gone even though the storage
        // itself was not returned to the free list.
        assert_eq!(pool.outstanding_count(), 0);
        assert_eq!(pool.free_count(), 1);
    }
}
