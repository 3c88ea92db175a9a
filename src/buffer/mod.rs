//! Message buffers
//!
//! Fixed-capacity byte buffers for received frames, replies and produced
//! I/O data. Buffers are allocated once when the pool is built; a
//! [`BufferLease`] grants exclusive use of one and hands it back when it
//! is released or dropped, so every exit path of the owning operation
//! returns the buffer.
//!
//! # Example
//!
//! ```ignore
//! use enip_adapter::buffer::{BufferPool, BufferPurpose};
//!
//! let pool = BufferPool::new(&config.buffers);
//! let mut reply = pool.acquire(BufferPurpose::Reply)?;
//! reply.extend_from_slice(&[0xD4, 0x00, 0x00, 0x00])?;
//! sink.send_reply(originator, reply.as_slice())?;
//! // reply goes back to the pool here
//! ```

pub mod pool;

pub use pool::{BufferLease, BufferPool, PoolAvailability};

use serde::{Deserialize, Serialize};

/// What a buffer is used for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BufferPurpose {
    /// Explicit message and Forward_Open/Forward_Close replies
    Reply,
    /// Cyclic produced I/O data
    Produce,
    /// Inbound frames
    Receive,
}

impl BufferPurpose {
    pub const ALL: [BufferPurpose; 3] = [
        BufferPurpose::Reply,
        BufferPurpose::Produce,
        BufferPurpose::Receive,
    ];

    pub(crate) fn index(self) -> usize {
        match self {
            BufferPurpose::Reply => 0,
            BufferPurpose::Produce => 1,
            BufferPurpose::Receive => 2,
        }
    }
}

impl std::fmt::Display for BufferPurpose {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BufferPurpose::Reply => write!(f, "reply"),
            BufferPurpose::Produce => write!(f, "produce"),
            BufferPurpose::Receive => write!(f, "receive"),
        }
    }
}

/// Buffer pool statistics
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BufferStats {
    /// Successful acquisitions
    pub acquired: u64,
    /// Leases returned
    pub released: u64,
    /// Acquisitions refused because every buffer of the purpose was leased
    pub exhausted: u64,
}
