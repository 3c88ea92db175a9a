//! Buffer arena indexed by purpose

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, trace};

use super::{BufferPurpose, BufferStats};
use crate::config::BufferConfig;
use crate::error::{AdapterError, Result};

/// Buffers of one purpose; a slot holds `None` while its buffer is leased
struct PurposeSlots {
    size: usize,
    slots: Vec<Mutex<Option<Vec<u8>>>>,
}

struct PoolInner {
    purposes: [PurposeSlots; 3],
    acquired: AtomicU64,
    released: AtomicU64,
    exhausted: AtomicU64,
}

/// Pre-allocated message buffers.
///
/// Cloning the pool shares the same buffers.
#[derive(Clone)]
pub struct BufferPool {
    inner: Arc<PoolInner>,
}

/// Free buffers per purpose at one instant
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolAvailability {
    free: [usize; 3],
    total: [usize; 3],
}

impl PoolAvailability {
    pub fn free(&self, purpose: BufferPurpose) -> usize {
        self.free[purpose.index()]
    }

    pub fn total(&self, purpose: BufferPurpose) -> usize {
        self.total[purpose.index()]
    }
}

impl BufferPool {
    /// Allocate every buffer described by the configuration
    pub fn new(config: &BufferConfig) -> Self {
        let slots = |count: usize, size: usize| PurposeSlots {
            size,
            slots: (0..count)
                .map(|_| Mutex::new(Some(Vec::with_capacity(size))))
                .collect(),
        };

        debug!(
            "Allocating buffers (reply={}x{}, produce={}x{}, receive={}x{})",
            config.reply_buffers,
            config.reply_buffer_size,
            config.produce_buffers,
            config.reply_buffer_size,
            config.receive_buffers,
            config.ethernet_buffer_size
        );

        Self {
            inner: Arc::new(PoolInner {
                purposes: [
                    slots(config.reply_buffers, config.reply_buffer_size),
                    slots(config.produce_buffers, config.reply_buffer_size),
                    slots(config.receive_buffers, config.ethernet_buffer_size),
                ],
                acquired: AtomicU64::new(0),
                released: AtomicU64::new(0),
                exhausted: AtomicU64::new(0),
            }),
        }
    }

    /// Take a free buffer of the given purpose
    pub fn acquire(&self, purpose: BufferPurpose) -> Result<BufferLease> {
        let group = &self.inner.purposes[purpose.index()];

        for (slot, cell) in group.slots.iter().enumerate() {
            if let Some(mut data) = cell.lock().take() {
                data.clear();
                self.inner.acquired.fetch_add(1, Ordering::Relaxed);
                trace!("Leased {} buffer {}", purpose, slot);
                return Ok(BufferLease {
                    pool: Arc::clone(&self.inner),
                    purpose,
                    slot,
                    capacity: group.size,
                    data,
                });
            }
        }

        self.inner.exhausted.fetch_add(1, Ordering::Relaxed);
        debug!("No free {} buffer", purpose);
        Err(AdapterError::BufferExhausted(purpose))
    }

    /// Return a lease to the pool.
    ///
    /// Dropping the lease has the same effect.
    pub fn release(&self, lease: BufferLease) {
        drop(lease);
    }

    pub fn availability(&self) -> PoolAvailability {
        let mut free = [0; 3];
        let mut total = [0; 3];
        for purpose in BufferPurpose::ALL {
            let group = &self.inner.purposes[purpose.index()];
            total[purpose.index()] = group.slots.len();
            free[purpose.index()] = group.slots.iter().filter(|c| c.lock().is_some()).count();
        }
        PoolAvailability { free, total }
    }

    pub fn stats(&self) -> BufferStats {
        BufferStats {
            acquired: self.inner.acquired.load(Ordering::Relaxed),
            released: self.inner.released.load(Ordering::Relaxed),
            exhausted: self.inner.exhausted.load(Ordering::Relaxed),
        }
    }
}

/// Exclusive use of one pooled buffer
pub struct BufferLease {
    pool: Arc<PoolInner>,
    purpose: BufferPurpose,
    slot: usize,
    capacity: usize,
    data: Vec<u8>,
}

impl BufferLease {
    pub fn purpose(&self) -> BufferPurpose {
        self.purpose
    }

    /// Fixed size of the underlying buffer
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Bytes written so far
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn remaining(&self) -> usize {
        self.capacity - self.data.len()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    pub fn clear(&mut self) {
        self.data.clear();
    }

    /// Append bytes, failing when they do not fit
    pub fn extend_from_slice(&mut self, bytes: &[u8]) -> Result<()> {
        if bytes.len() > self.remaining() {
            return Err(AdapterError::BufferOverflow {
                capacity: self.capacity,
                requested: self.data.len() + bytes.len(),
            });
        }
        self.data.extend_from_slice(bytes);
        Ok(())
    }

    /// Let `fill` write into the unused tail; it returns how many bytes it
    /// wrote.
    pub fn fill_with<F>(&mut self, fill: F) -> Result<usize>
    where
        F: FnOnce(&mut [u8]) -> Result<usize>,
    {
        let start = self.data.len();
        self.data.resize(self.capacity, 0);
        let written = match fill(&mut self.data[start..]) {
            Ok(n) if n <= self.capacity - start => n,
            Ok(n) => {
                self.data.truncate(start);
                return Err(AdapterError::BufferOverflow {
                    capacity: self.capacity,
                    requested: start + n,
                });
            }
            Err(e) => {
                self.data.truncate(start);
                return Err(e);
            }
        };
        self.data.truncate(start + written);
        Ok(written)
    }
}

impl std::fmt::Debug for BufferLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferLease")
            .field("purpose", &self.purpose)
            .field("slot", &self.slot)
            .field("len", &self.data.len())
            .field("capacity", &self.capacity)
            .finish()
    }
}

impl Drop for BufferLease {
    fn drop(&mut self) {
        let mut data = std::mem::take(&mut self.data);
        data.clear();
        *self.pool.purposes[self.purpose.index()].slots[self.slot].lock() = Some(data);
        self.pool.released.fetch_add(1, Ordering::Relaxed);
        trace!("Released {} buffer {}", self.purpose, self.slot);
    }
}
