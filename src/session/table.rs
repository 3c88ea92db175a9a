//! Fixed-size session table with idle expiry

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use tracing::{debug, info};

use super::{Session, SessionHandle, SessionStats};
use crate::config::SessionConfig;
use crate::error::{ensure, AdapterError, FaultScope, Resource, Result};

pub struct SessionTable {
    slots: Vec<Option<Session>>,
    protocol_version: u16,
    idle_timeout: Option<Duration>,
    live: usize,
    stats: SessionStats,
}

impl SessionTable {
    pub fn new(config: &SessionConfig) -> Self {
        Self {
            slots: vec![None; config.max_sessions],
            protocol_version: config.protocol_version,
            idle_timeout: config.idle_timeout(),
            live: 0,
            stats: SessionStats::default(),
        }
    }

    /// Register a session in the lowest free slot
    pub fn register(
        &mut self,
        originator: SocketAddr,
        version: u16,
        options: u16,
        now: Instant,
    ) -> Result<SessionHandle> {
        if version != self.protocol_version || options != 0 {
            self.stats.rejected += 1;
            return Err(AdapterError::UnsupportedProtocol { version, options });
        }

        let Some(slot) = self.slots.iter().position(Option::is_none) else {
            self.stats.rejected += 1;
            debug!("Session table full, refusing {}", originator);
            return Err(AdapterError::ResourceUnavailable(Resource::Sessions));
        };

        let handle = SessionHandle::from_slot(slot);
        self.slots[slot] = Some(Session {
            handle,
            originator,
            protocol_version: version,
            created_at: now,
            last_activity: now,
        });
        self.live += 1;
        self.stats.registered += 1;
        ensure(self.live <= self.slots.len(), FaultScope::Session(handle), || {
            format!("{} live sessions in {} slots", self.live, self.slots.len())
        })?;

        info!("Registered session {} for {}", handle, originator);
        Ok(handle)
    }

    /// Remove a session, freeing its slot
    pub fn unregister(&mut self, handle: SessionHandle) -> Result<Session> {
        let session = self.take(handle)?;
        self.stats.unregistered += 1;
        info!("Unregistered session {} ({})", handle, session.originator);
        Ok(session)
    }

    /// Reset the idle clock of a session
    pub fn touch(&mut self, handle: SessionHandle, now: Instant) -> Result<()> {
        let session = self
            .get_mut(handle)
            .ok_or(AdapterError::SessionNotFound(handle))?;
        session.last_activity = now;
        Ok(())
    }

    /// Evict sessions idle beyond the configured timeout
    pub fn expire(&mut self, now: Instant) -> Vec<SessionHandle> {
        let Some(timeout) = self.idle_timeout else {
            return Vec::new();
        };

        let expired: Vec<SessionHandle> = self
            .iter()
            .filter(|s| now.saturating_duration_since(s.last_activity) > timeout)
            .map(|s| s.handle)
            .collect();

        for handle in &expired {
            if self.take(*handle).is_ok() {
                self.stats.expired += 1;
                info!("Session {} idle for more than {:?}, evicted", handle, timeout);
            }
        }

        expired
    }

    /// Drop every session registered from a transport endpoint that went away
    pub fn close_originator(&mut self, originator: SocketAddr) -> Vec<SessionHandle> {
        let handles: Vec<SessionHandle> = self
            .iter()
            .filter(|s| s.originator == originator)
            .map(|s| s.handle)
            .collect();

        for handle in &handles {
            if self.take(*handle).is_ok() {
                self.stats.unregistered += 1;
                debug!("Transport to {} closed, dropping session {}", originator, handle);
            }
        }

        handles
    }

    pub fn get(&self, handle: SessionHandle) -> Option<&Session> {
        self.slots.get(handle.slot()?)?.as_ref()
    }

    fn get_mut(&mut self, handle: SessionHandle) -> Option<&mut Session> {
        self.slots.get_mut(handle.slot()?)?.as_mut()
    }

    pub fn contains(&self, handle: SessionHandle) -> bool {
        self.get(handle).is_some()
    }

    pub fn len(&self) -> usize {
        self.live
    }

    pub fn is_empty(&self) -> bool {
        self.live == 0
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Session> {
        self.slots.iter().flatten()
    }

    pub fn stats(&self) -> SessionStats {
        SessionStats {
            active: self.live,
            ..self.stats.clone()
        }
    }

    /// Forget every session
    pub fn clear(&mut self) {
        self.slots.iter_mut().for_each(|s| *s = None);
        self.live = 0;
    }

    fn take(&mut self, handle: SessionHandle) -> Result<Session> {
        let session = handle
            .slot()
            .and_then(|slot| self.slots.get_mut(slot))
            .and_then(Option::take)
            .ok_or(AdapterError::SessionNotFound(handle))?;
        self.live -= 1;
        Ok(session)
    }
}
