//! Connection storage with per-class budgets
//!
//! Lookup by triple (Forward_Close), by consumed connection ID (incoming
//! I/O data) and by output assembly (exclusive ownership).

use std::collections::{HashMap, HashSet};
use std::time::Instant;

use super::{Connection, ConnectionClass, ConnectionPath, ConnectionTriple};
use crate::config::ConnectionLimits;
use crate::error::{ensure, AdapterError, FaultScope, Resource, Result};
use crate::session::SessionHandle;

/// Live connections
pub struct ConnectionTable {
    connections: HashMap<ConnectionTriple, Connection>,
    /// Consumed connection ID -> triple
    by_consumed_id: HashMap<u32, ConnectionTriple>,
    /// Output assembly -> exclusive owner
    owners: HashMap<u32, ConnectionTriple>,
    /// Live connections per class
    counts: [usize; 4],
    limits: ConnectionLimits,
}

impl ConnectionTable {
    pub fn new(limits: ConnectionLimits) -> Self {
        Self {
            connections: HashMap::with_capacity(limits.total()),
            by_consumed_id: HashMap::with_capacity(limits.total()),
            owners: HashMap::new(),
            counts: [0; 4],
            limits,
        }
    }

    /// Check class and per-path budgets for one more connection
    pub fn check_capacity(&self, class: ConnectionClass, path: &ConnectionPath) -> Result<()> {
        if self.count(class) >= self.limits.capacity(class) {
            return Err(AdapterError::ResourceUnavailable(Resource::Connections(class)));
        }
        if let Some(per_path) = self.limits.per_path_capacity(class) {
            if self.consumers_on_path(class, path) >= per_path {
                return Err(AdapterError::ResourceUnavailable(Resource::PathConsumers(
                    class,
                )));
            }
        }
        Ok(())
    }

    /// Exclusive owner of an output assembly
    pub fn exclusive_owner_of(&self, consumed_point: u32) -> Option<&Connection> {
        self.owners
            .get(&consumed_point)
            .and_then(|triple| self.connections.get(triple))
    }

    /// Live connections of `class` bound to the same assembly points
    pub fn consumers_on_path(&self, class: ConnectionClass, path: &ConnectionPath) -> usize {
        self.connections
            .values()
            .filter(|c| c.class == class && c.path.points() == path.points())
            .count()
    }

    /// A live exclusive-owner or input-only connection multicasting the
    /// given input assembly
    pub fn multicast_producer_for(&self, produced_point: u32) -> Option<&Connection> {
        self.connections.values().find(|c| {
            c.produces()
                && c.is_multicast_producer()
                && c.path.produced_point() == Some(produced_point)
        })
    }

    /// Listen-only connections that depend on a multicast production
    pub fn listen_only_on(&self, produced_id: u32) -> Vec<ConnectionTriple> {
        self.connections
            .values()
            .filter(|c| c.class == ConnectionClass::ListenOnly && c.produced_id == produced_id)
            .map(|c| c.triple)
            .collect()
    }

    /// Whether some non-listen-only connection still produces `produced_id`
    pub fn has_producer(&self, produced_id: u32) -> bool {
        self.connections
            .values()
            .any(|c| c.produces() && c.produced_id == produced_id)
    }

    pub fn ids_in_use(&self) -> HashSet<u32> {
        self.connections
            .values()
            .flat_map(|c| [c.consumed_id, c.produced_id])
            .collect()
    }

    /// Add an admitted connection
    pub fn insert(&mut self, connection: Connection) -> Result<()> {
        let triple = connection.triple;
        let scope = FaultScope::Connection(triple);
        let class = connection.class;

        ensure(!self.connections.contains_key(&triple), scope, || {
            "triple already in table".into()
        })?;
        ensure(
            !self.by_consumed_id.contains_key(&connection.consumed_id),
            scope,
            || format!("consumed id 0x{:08X} already in use", connection.consumed_id),
        )?;
        ensure(
            self.count(class) < self.limits.capacity(class),
            scope,
            || format!("{} budget exceeded", class),
        )?;

        if class == ConnectionClass::ExclusiveOwner {
            if let Some(point) = connection.path.consumed_point() {
                ensure(!self.owners.contains_key(&point), scope, || {
                    format!("output assembly {} already owned", point)
                })?;
                self.owners.insert(point, triple);
            }
        }

        self.by_consumed_id.insert(connection.consumed_id, triple);
        self.counts[class.index()] += 1;
        self.connections.insert(triple, connection);
        Ok(())
    }

    /// Remove a connection, releasing its slot
    pub fn remove(&mut self, triple: &ConnectionTriple) -> Option<Connection> {
        let connection = self.connections.remove(triple)?;
        self.by_consumed_id.remove(&connection.consumed_id);
        if connection.class == ConnectionClass::ExclusiveOwner {
            if let Some(point) = connection.path.consumed_point() {
                self.owners.remove(&point);
            }
        }
        self.counts[connection.class.index()] -= 1;
        Some(connection)
    }

    pub fn get(&self, triple: &ConnectionTriple) -> Option<&Connection> {
        self.connections.get(triple)
    }

    pub fn get_mut(&mut self, triple: &ConnectionTriple) -> Option<&mut Connection> {
        self.connections.get_mut(triple)
    }

    pub fn contains(&self, triple: &ConnectionTriple) -> bool {
        self.connections.contains_key(triple)
    }

    /// Connection consuming packets with this ID
    pub fn find_by_consumed_id(&mut self, id: u32) -> Option<&mut Connection> {
        let triple = self.by_consumed_id.get(&id)?;
        self.connections.get_mut(triple)
    }

    /// Connections whose watchdog expired
    pub fn expired(&self, now: Instant) -> Vec<ConnectionTriple> {
        self.connections
            .values()
            .filter(|c| c.deadline <= now)
            .map(|c| c.triple)
            .collect()
    }

    pub fn owned_by(&self, session: SessionHandle) -> Vec<ConnectionTriple> {
        self.connections
            .values()
            .filter(|c| c.owner == Some(session))
            .map(|c| c.triple)
            .collect()
    }

    pub fn count(&self, class: ConnectionClass) -> usize {
        self.counts[class.index()]
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Connection> {
        self.connections.values()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Connection> {
        self.connections.values_mut()
    }

    /// Drop everything
    pub fn clear(&mut self) {
        self.connections.clear();
        self.by_consumed_id.clear();
        self.owners.clear();
        self.counts = [0; 4];
    }
}
