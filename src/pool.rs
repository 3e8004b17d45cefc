//! Buffer pool for outbound frames.
//!
//! Sending serializes every frame into one contiguous byte-vector that is
//! then shared by all sessions transmitting it. The pool recycles those
//! vectors so steady-state publishing settles into zero allocations: when
//! the last reference to a frame drops, its storage returns here instead of
//! being freed.

use std::ops::Deref;
use std::sync::{Arc, Mutex, Weak};

use crate::config::DEFAULT_POOL_IDLE_LIMIT;

/// A frame after hand-off: immutable bytes shared by the publisher and every
/// session whose send slot references it.
pub type SharedFrame = Arc<PooledBuffer>;

/// Concurrency-safe pool of byte-vectors.
pub struct BufferPool {
    idle: Mutex<Vec<Vec<u8>>>,
    idle_limit: usize,
}

impl BufferPool {
    /// Pool keeping at most [`DEFAULT_POOL_IDLE_LIMIT`] idle buffers.
    pub fn new() -> Arc<Self> {
        Self::with_idle_limit(DEFAULT_POOL_IDLE_LIMIT)
    }

    /// Pool keeping at most `idle_limit` idle buffers; buffers returned
    /// beyond the limit are freed.
    pub fn with_idle_limit(idle_limit: usize) -> Arc<Self> {
        Arc::new(Self {
            idle: Mutex::new(Vec::new()),
            idle_limit,
        })
    }

    /// Check out an empty buffer, reusing a previously released one when
    /// available. The buffer returns to the pool on drop.
    pub fn allocate(self: &Arc<Self>) -> PooledBuffer {
        let data = self
            .idle
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop()
            .unwrap_or_default();
        PooledBuffer {
            data,
            pool: Arc::downgrade(self),
        }
    }

    /// Number of idle buffers currently held.
    pub fn idle_count(&self) -> usize {
        self.idle.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    fn release(&self, mut data: Vec<u8>) {
        data.clear();
        let mut idle = self.idle.lock().unwrap_or_else(|e| e.into_inner());
        if idle.len() < self.idle_limit {
            idle.push(data);
        }
    }
}

/// A byte-vector checked out of a [`BufferPool`].
///
/// Mutable while building a frame; wrap it in an [`Arc`] (see
/// [`SharedFrame`]) to hand it off, after which the type system enforces
/// immutability. The underlying vector returns to the pool when the buffer
/// drops, keeping its capacity.
pub struct PooledBuffer {
    data: Vec<u8>,
    pool: Weak<BufferPool>,
}

impl PooledBuffer {
    /// Grow capacity for a frame of `needed` bytes. Insufficient capacity
    /// reserves 1.1x the needed size to absorb future growth.
    pub fn ensure_capacity(&mut self, needed: usize) {
        if self.data.capacity() < needed {
            self.data.reserve(needed + needed / 10);
        }
    }

    /// Append bytes to the frame under construction.
    pub fn extend_from_slice(&mut self, bytes: &[u8]) {
        self.data.extend_from_slice(bytes);
    }

    /// The frame bytes accumulated so far.
    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    /// Current length in bytes.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Whether the buffer holds no bytes.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Capacity of the underlying storage.
    pub fn capacity(&self) -> usize {
        self.data.capacity()
    }
}

impl Deref for PooledBuffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.data
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        if let Some(pool) = self.pool.upgrade() {
            pool.release(std::mem::take(&mut self.data));
        }
    }
}
