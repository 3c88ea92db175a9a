//! Connection ID generation
//!
//! Generated IDs carry the adapter incarnation in the upper 16 bits and
//! a running counter in the lower 16, so IDs from a previous power cycle
//! are unlikely to be mistaken for current ones.

use std::collections::HashSet;

pub struct ConnectionIdAllocator {
    incarnation: u16,
    counter: u16,
}

impl ConnectionIdAllocator {
    pub fn new(incarnation: u16) -> Self {
        Self {
            incarnation,
            counter: 0,
        }
    }

    /// Use the configured incarnation, or pick a random one
    pub fn from_config(incarnation: Option<u16>) -> Self {
        Self::new(incarnation.unwrap_or_else(rand::random))
    }

    pub fn incarnation(&self) -> u16 {
        self.incarnation
    }

    /// Next ID not contained in `in_use`.
    ///
    /// `in_use` holds at most two IDs per connection and
    /// `Config::validate` keeps that below the 16-bit counter space, so
    /// the search always terminates.
    pub fn next(&mut self, in_use: &HashSet<u32>) -> u32 {
        loop {
            self.counter = self.counter.wrapping_add(1);
            let id = (u32::from(self.incarnation) << 16) | u32::from(self.counter);
            if id != 0 && !in_use.contains(&id) {
                return id;
            }
        }
    }
}
