//! Fixed-size memory pool.
//!
//! A pool owns `n_parts` buffers of `part_size` bytes each and hands them
//! out LIFO. `reserve` blocks while the pool is empty; dropping a
//! [`PoolBuffer`] returns its storage. Pools serve the fixed-size
//! ephemeral parts of the pipeline (raw file packs, decoded sequence
//! parts, splitter bin buffers, radix scratch); the per-bin arena is a
//! separate animal.

use std::sync::{Arc, Condvar, Mutex};

use crate::error::{KmerBinError, Result};
use crate::queues::ErrorBroker;

struct PoolState {
    free: Vec<Vec<u8>>,
}

/// A blocking LIFO pool of equally sized byte buffers.
pub struct MemoryPool {
    part_size: usize,
    state: Mutex<PoolState>,
    available: Arc<Condvar>,
    broker: Arc<ErrorBroker>,
}

impl MemoryPool {
    /// Creates a pool of `n_parts` buffers of `part_size` bytes.
    #[must_use]
    pub fn new(n_parts: usize, part_size: usize, broker: Arc<ErrorBroker>) -> Arc<Self> {
        let free = (0..n_parts).map(|_| Vec::with_capacity(part_size)).collect();
        let available = Arc::new(Condvar::new());
        broker.register(&available);
        Arc::new(Self {
            part_size,
            state: Mutex::new(PoolState { free }),
            available,
            broker,
        })
    }

    /// The size of each part in bytes.
    #[must_use]
    pub fn part_size(&self) -> usize {
        self.part_size
    }

    /// Takes a free part, blocking until one is returned.
    ///
    /// # Errors
    ///
    /// Returns [`KmerBinError::Cancelled`] when the run is tearing down.
    pub fn reserve(self: &Arc<Self>) -> Result<PoolBuffer> {
        let mut state = self
            .state
            .lock()
            .map_err(|_| KmerBinError::InternalInvariant("pool mutex poisoned".into()))?;
        loop {
            if self.broker.is_cancelled() {
                return Err(KmerBinError::Cancelled);
            }
            if let Some(mut data) = state.free.pop() {
                data.clear();
                return Ok(PoolBuffer {
                    data,
                    pool: Arc::clone(self),
                });
            }
            state = self
                .available
                .wait(state)
                .map_err(|_| KmerBinError::InternalInvariant("pool mutex poisoned".into()))?;
        }
    }

    fn put_back(&self, data: Vec<u8>) {
        if let Ok(mut state) = self.state.lock() {
            state.free.push(data);
        }
        self.available.notify_one();
    }
}

/// A buffer borrowed from a [`MemoryPool`]; returns itself on drop.
pub struct PoolBuffer {
    data: Vec<u8>,
    pool: Arc<MemoryPool>,
}

impl PoolBuffer {
    /// Bytes written so far.
    #[must_use]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// True when nothing was written yet.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Remaining capacity before the part is full.
    #[must_use]
    pub fn remaining(&self) -> usize {
        self.pool.part_size().saturating_sub(self.data.len())
    }
}

impl std::ops::Deref for PoolBuffer {
    type Target = Vec<u8>;

    fn deref(&self) -> &Vec<u8> {
        &self.data
    }
}

impl std::ops::DerefMut for PoolBuffer {
    fn deref_mut(&mut self) -> &mut Vec<u8> {
        &mut self.data
    }
}

impl Drop for PoolBuffer {
    fn drop(&mut self) {
        let data = std::mem::take(&mut self.data);
        self.pool.put_back(data);
    }
}

impl std::fmt::Debug for PoolBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolBuffer").field("len", &self.len()).finish()
    }
}
