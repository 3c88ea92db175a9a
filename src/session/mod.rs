//! Encapsulation sessions
//!
//! An originator registers a session before sending any CIP request. The
//! table holds a fixed number of them; a handle names a slot and stays
//! unique for as long as its session lives.

pub mod table;

pub use table::SessionTable;

use std::net::SocketAddr;
use std::time::Instant;

use serde::{Deserialize, Serialize};

/// Handle returned by RegisterSession
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SessionHandle(u32);

impl SessionHandle {
    pub fn new(raw: u32) -> Self {
        Self(raw)
    }

    pub fn raw(self) -> u32 {
        self.0
    }

    /// Handles are slot index + 1 so that 0 is never a valid handle
    pub(crate) fn from_slot(slot: usize) -> Self {
        Self(slot as u32 + 1)
    }

    pub(crate) fn slot(self) -> Option<usize> {
        (self.0 as usize).checked_sub(1)
    }
}

impl std::fmt::Display for SessionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "0x{:08X}", self.0)
    }
}

/// A registered encapsulation session
#[derive(Debug, Clone)]
pub struct Session {
    pub handle: SessionHandle,
    pub originator: SocketAddr,
    pub protocol_version: u16,
    pub created_at: Instant,
    pub last_activity: Instant,
}

/// Session table statistics
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionStats {
    pub registered: u64,
    pub unregistered: u64,
    pub expired: u64,
    pub rejected: u64,
    pub active: usize,
}
