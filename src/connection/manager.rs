//! Connection Manager
//!
//! Admits and tears down connections, consumes I/O data and runs the
//! per-tick watchdog and production scan.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{debug, info, warn};

use super::table::ConnectionTable;
use super::{
    Connection, ConnectionClass, ConnectionIdAllocator, ConnectionPath, ConnectionState,
    ConnectionStats, ConnectionTriple, ConnectionType, NetworkParams, ProductionTrigger,
    TransportTrigger,
};
use crate::buffer::{BufferPool, BufferPurpose};
use crate::config::{Config, TeardownPolicy, MAX_FORWARD_OPEN_SIZE};
use crate::error::{AdapterError, Result};
use crate::io::{AssemblyStore, FrameSink, ProducedFrame, ProductionTarget, RUN_IDLE_RUN};
use crate::session::SessionHandle;
use crate::status::extended;

pub const SERVICE_FORWARD_OPEN: u8 = 0x54;
pub const SERVICE_LARGE_FORWARD_OPEN: u8 = 0x5B;
pub const SERVICE_FORWARD_CLOSE: u8 = 0x4E;

const SEQUENCE_COUNT_LEN: usize = 2;
const RUN_IDLE_HEADER_LEN: usize = 4;

/// Decoded Forward_Open / Large_Forward_Open request
#[derive(Debug, Clone)]
pub struct ForwardOpenRequest {
    pub triple: ConnectionTriple,
    /// O->T ID proposed by the originator; the target always replaces it
    pub o_to_t_connection_id: u32,
    /// T->O ID proposed by the originator, kept for point-to-point production
    pub t_to_o_connection_id: u32,
    /// Timeout multiplier index (0..=7)
    pub timeout_multiplier: u8,
    pub o_to_t: NetworkParams,
    pub t_to_o: NetworkParams,
    pub transport: TransportTrigger,
    pub path: ConnectionPath,
    /// Large_Forward_Open allows connection sizes above 511 bytes
    pub large: bool,
}

impl ForwardOpenRequest {
    pub fn service(&self) -> u8 {
        if self.large {
            SERVICE_LARGE_FORWARD_OPEN
        } else {
            SERVICE_FORWARD_OPEN
        }
    }
}

/// Successful Forward_Open reply data
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ForwardOpenResponse {
    /// Forward_Open or Large_Forward_Open
    pub service: u8,
    pub triple: ConnectionTriple,
    pub class: ConnectionClass,
    pub o_to_t_connection_id: u32,
    pub t_to_o_connection_id: u32,
    /// Actual packet intervals (microseconds)
    pub o_to_t_api_us: u32,
    pub t_to_o_api_us: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwardCloseRequest {
    pub triple: ConnectionTriple,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ForwardCloseResponse {
    pub triple: ConnectionTriple,
    pub class: ConnectionClass,
    /// Listen-only connections closed along with this one
    pub dependents: Vec<ConnectionTriple>,
}

/// Result of consuming one I/O packet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumeOutcome {
    /// First valid packet; the connection is now established
    Established,
    /// Data (or heartbeat) applied
    Applied,
    /// Originator is idle; data not applied
    Idle,
    /// Old or repeated sequence count; watchdog reset only
    Stale,
}

/// What one tick did
#[derive(Debug, Clone, Default, Serialize)]
pub struct TickReport {
    pub timed_out: Vec<ConnectionTriple>,
    /// Listen-only connections closed because their producer went away
    pub closed_dependents: Vec<ConnectionTriple>,
    pub expired_sessions: Vec<SessionHandle>,
    /// Connections closed or detached with an expired session
    pub session_connections: Vec<ConnectionTriple>,
    pub produced: usize,
    pub production_failures: usize,
}

impl TickReport {
    pub fn is_idle(&self) -> bool {
        self.timed_out.is_empty()
            && self.closed_dependents.is_empty()
            && self.expired_sessions.is_empty()
            && self.session_connections.is_empty()
            && self.produced == 0
            && self.production_failures == 0
    }
}

/// Parsed class 0/1 payload
struct IoPacket<'a> {
    sequence: Option<u16>,
    run: Option<bool>,
    data: &'a [u8],
}

pub struct ConnectionManager<A: AssemblyStore> {
    config: Arc<Config>,
    table: ConnectionTable,
    assemblies: A,
    ids: ConnectionIdAllocator,
    stats: ConnectionStats,
}

impl<A: AssemblyStore> ConnectionManager<A> {
    pub fn new(config: Arc<Config>, assemblies: A) -> Self {
        let ids = ConnectionIdAllocator::from_config(config.connections.incarnation_id);
        info!(
            "Connection manager ready (explicit={}, exclusive_owner={}, input_only={}, listen_only={}, incarnation=0x{:04X})",
            config.connections.explicit,
            config.connections.exclusive_owner,
            config.connections.input_only,
            config.connections.listen_only,
            ids.incarnation()
        );

        Self {
            table: ConnectionTable::new(config.connections.clone()),
            config,
            assemblies,
            ids,
            stats: ConnectionStats::default(),
        }
    }

    /// Handle Forward_Open; either a slot is allocated and IDs returned,
    /// or nothing changes.
    pub fn forward_open(
        &mut self,
        owner: Option<SessionHandle>,
        originator: SocketAddr,
        request: &ForwardOpenRequest,
        now: Instant,
    ) -> Result<ForwardOpenResponse> {
        match self.admit(owner, originator, request, now) {
            Ok(response) => {
                self.stats.opened += 1;
                info!(
                    "Opened {} connection {} ({}), O->T 0x{:08X} T->O 0x{:08X}",
                    response.class,
                    response.triple,
                    request.path,
                    response.o_to_t_connection_id,
                    response.t_to_o_connection_id
                );
                Ok(response)
            }
            Err(e) => {
                if !e.is_fatal() {
                    self.stats.rejected += 1;
                    debug!("Forward_Open {} rejected: {}", request.triple, e);
                }
                Err(e)
            }
        }
    }

    fn admit(
        &mut self,
        owner: Option<SessionHandle>,
        originator: SocketAddr,
        request: &ForwardOpenRequest,
        now: Instant,
    ) -> Result<ForwardOpenResponse> {
        if self.table.contains(&request.triple) {
            return Err(AdapterError::ConnectionInUse {
                existing: request.triple,
                ownership: false,
            });
        }

        check_transport(&request.transport)?;

        if let Some(key) = &request.path.electronic_key {
            key.check(&self.config.identity)?;
        }

        let class = request.path.classify(
            &request.transport,
            &self.config.assemblies,
            &self.assemblies,
        )?;

        self.validate_parameters(class, request)?;
        self.table.check_capacity(class, &request.path)?;

        if class == ConnectionClass::ExclusiveOwner {
            if let Some(point) = request.path.consumed_point() {
                if let Some(existing) = self.table.exclusive_owner_of(point) {
                    return Err(AdapterError::ConnectionInUse {
                        existing: existing.triple,
                        ownership: true,
                    });
                }
            }
        }

        // An existing multicast production of the same input assembly is
        // shared: same T->O ID and interval.
        let shared = match (class, request.path.produced_point()) {
            (ConnectionClass::ListenOnly, Some(point)) => {
                let producer = self
                    .table
                    .multicast_producer_for(point)
                    .ok_or(AdapterError::NoProducingConnection(point))?;
                Some(SharedProduction::of(producer))
            }
            (_, Some(point)) if request.t_to_o.connection_type == ConnectionType::Multicast => self
                .table
                .multicast_producer_for(point)
                .map(SharedProduction::of),
            _ => None,
        };

        if let Some(production) = &shared {
            if production.size != request.t_to_o.size {
                return Err(AdapterError::invalid_parameters(
                    extended::INVALID_T_TO_O_SIZE,
                    format!(
                        "T->O size {} differs from the shared production ({})",
                        request.t_to_o.size, production.size
                    ),
                ));
            }
        }

        let tick_us = self.config.timing.tick_us;
        let mut in_use = self.table.ids_in_use();
        let consumed_id = self.ids.next(&in_use);
        in_use.insert(consumed_id);

        let (produced_id, t_to_o_api_us) = match &shared {
            Some(production) => (production.id, production.api_us),
            None if request.t_to_o.connection_type == ConnectionType::Multicast => {
                (self.ids.next(&in_use), round_to_tick(request.t_to_o.rpi_us, tick_us))
            }
            None => (
                request.t_to_o_connection_id,
                round_to_tick(request.t_to_o.rpi_us, tick_us),
            ),
        };

        let mut connection = Connection {
            triple: request.triple,
            class,
            path: request.path,
            transport: request.transport,
            o_to_t: request.o_to_t,
            t_to_o: request.t_to_o,
            consumed_id,
            produced_id,
            o_to_t_api_us: round_to_tick(request.o_to_t.rpi_us, tick_us),
            t_to_o_api_us,
            timeout_multiplier: request.timeout_multiplier,
            state: ConnectionState::Negotiating,
            owner,
            originator,
            opened_at: now,
            last_activity: now,
            deadline: now,
            next_production: now,
            consumed_sequence: None,
            produced_sequence: 0,
            production_count: 0,
        };
        connection.deadline = now + connection.timeout().max(self.config.connections.initial_timeout());
        // Joining sharers continue the stream's counters
        if let Some(production) = &shared {
            connection.produced_sequence = production.sequence;
            connection.production_count = production.count;
        }

        let response = ForwardOpenResponse {
            service: request.service(),
            triple: connection.triple,
            class,
            o_to_t_connection_id: connection.consumed_id,
            t_to_o_connection_id: connection.produced_id,
            o_to_t_api_us: connection.o_to_t_api_us,
            t_to_o_api_us: connection.t_to_o_api_us,
        };

        self.table.insert(connection)?;
        Ok(response)
    }

    fn validate_parameters(&self, class: ConnectionClass, request: &ForwardOpenRequest) -> Result<()> {
        if request.timeout_multiplier > 7 {
            return Err(AdapterError::invalid_parameters(
                extended::INVALID_NETWORK_CONNECTION_PARAMETER,
                format!("timeout multiplier index {}", request.timeout_multiplier),
            ));
        }

        let max_size = if request.large {
            u16::MAX
        } else {
            MAX_FORWARD_OPEN_SIZE
        };
        for (dir, params) in [("O->T", &request.o_to_t), ("T->O", &request.t_to_o)] {
            if params.size > max_size {
                return Err(AdapterError::invalid_parameters(
                    extended::INVALID_CONNECTION_SIZE,
                    format!("{} size {} above {}", dir, params.size, max_size),
                ));
            }
            if params.connection_type != ConnectionType::Null {
                let (min, max) = (self.config.min_rpi_us(), self.config.connections.max_rpi_us);
                if params.rpi_us < min || params.rpi_us > max {
                    return Err(AdapterError::invalid_parameters(
                        extended::RPI_NOT_SUPPORTED,
                        format!("{} RPI {}us outside {}..={}us", dir, params.rpi_us, min, max),
                    ));
                }
            }
        }

        let reply_size = self.config.buffers.reply_buffer_size;
        if class == ConnectionClass::Explicit {
            for (dir, params) in [("O->T", &request.o_to_t), ("T->O", &request.t_to_o)] {
                if params.connection_type == ConnectionType::Null {
                    return Err(AdapterError::invalid_parameters(
                        extended::INVALID_NETWORK_CONNECTION_PARAMETER,
                        format!("{} connection type is null", dir),
                    ));
                }
                if usize::from(params.size) > reply_size {
                    return Err(AdapterError::invalid_parameters(
                        extended::INVALID_CONNECTION_SIZE,
                        format!("{} size {} above reply buffer {}", dir, params.size, reply_size),
                    ));
                }
            }
            return Ok(());
        }

        if request.t_to_o.connection_type == ConnectionType::Null {
            return Err(AdapterError::invalid_parameters(
                extended::INVALID_NETWORK_CONNECTION_PARAMETER,
                "I/O connection without T->O production",
            ));
        }
        match request.o_to_t.connection_type {
            ConnectionType::PointToPoint => {}
            // The watchdog runs on O->T data or heartbeats
            ConnectionType::Null => {
                return Err(AdapterError::invalid_parameters(
                    extended::INVALID_NETWORK_CONNECTION_PARAMETER,
                    "I/O connection without O->T data or heartbeat",
                ))
            }
            ConnectionType::Multicast => {
                return Err(AdapterError::invalid_parameters(
                    extended::INVALID_NETWORK_CONNECTION_PARAMETER,
                    "multicast O->T is not consumed",
                ))
            }
        }
        if class == ConnectionClass::ListenOnly
            && request.t_to_o.connection_type != ConnectionType::Multicast
        {
            return Err(AdapterError::invalid_parameters(
                extended::INVALID_NETWORK_CONNECTION_PARAMETER,
                "listen-only T->O must be multicast",
            ));
        }

        let (expected_o_to_t, expected_t_to_o) = self.expected_sizes(class, request);
        check_size(
            &request.o_to_t,
            expected_o_to_t,
            extended::INVALID_O_TO_T_SIZE,
            "O->T",
        )?;
        check_size(
            &request.t_to_o,
            expected_t_to_o,
            extended::INVALID_T_TO_O_SIZE,
            "T->O",
        )?;

        if usize::from(request.t_to_o.size) > reply_size {
            return Err(AdapterError::invalid_parameters(
                extended::INVALID_T_TO_O_SIZE,
                format!("T->O size {} above produce buffer {}", request.t_to_o.size, reply_size),
            ));
        }
        if usize::from(request.o_to_t.size) > self.config.buffers.ethernet_buffer_size {
            return Err(AdapterError::invalid_parameters(
                extended::INVALID_O_TO_T_SIZE,
                format!("O->T size {} above receive buffer", request.o_to_t.size),
            ));
        }

        Ok(())
    }

    /// O->T and T->O sizes an I/O connection must request
    fn expected_sizes(&self, class: ConnectionClass, request: &ForwardOpenRequest) -> (usize, usize) {
        let sequence = if request.transport.has_sequence_count() {
            SEQUENCE_COUNT_LEN
        } else {
            0
        };

        let o_to_t = match class {
            ConnectionClass::ExclusiveOwner => {
                let data = request
                    .path
                    .consumed_point()
                    .and_then(|p| self.assemblies.size_of(p))
                    .unwrap_or(0);
                let header = if self.config.io.consumed_has_run_idle_header {
                    RUN_IDLE_HEADER_LEN
                } else {
                    0
                };
                sequence + header + data
            }
            // Heartbeats carry no data
            _ => sequence,
        };

        let data = request
            .path
            .produced_point()
            .and_then(|p| self.assemblies.size_of(p))
            .unwrap_or(0);
        let header = if self.config.io.produced_has_run_idle_header {
            RUN_IDLE_HEADER_LEN
        } else {
            0
        };

        (o_to_t, sequence + header + data)
    }

    /// Handle Forward_Close; an unknown triple changes nothing
    pub fn forward_close(&mut self, request: &ForwardCloseRequest) -> Result<ForwardCloseResponse> {
        let class = self
            .table
            .get(&request.triple)
            .map(|c| c.class)
            .ok_or(AdapterError::ConnectionNotFound(request.triple))?;

        let dependents = self.close_connection(&request.triple, ConnectionState::Closed)?;
        Ok(ForwardCloseResponse {
            triple: request.triple,
            class,
            dependents,
        })
    }

    /// Move a connection to a terminal state and free its slot. Returns
    /// listen-only connections that lost their producer and were closed
    /// too.
    fn close_connection(
        &mut self,
        triple: &ConnectionTriple,
        terminal: ConnectionState,
    ) -> Result<Vec<ConnectionTriple>> {
        let Some(connection) = self.table.get_mut(triple) else {
            return Ok(Vec::new());
        };
        connection.transition(terminal)?;

        let Some(connection) = self.table.remove(triple) else {
            return Ok(Vec::new());
        };
        match terminal {
            ConnectionState::TimedOut => {
                self.stats.timed_out += 1;
                warn!(
                    "{} connection {} timed out after {:?} of inactivity",
                    connection.class,
                    triple,
                    connection.timeout()
                );
            }
            _ => {
                self.stats.closed += 1;
                info!("Closed {} connection {}", connection.class, triple);
            }
        }

        let mut dependents = Vec::new();
        if connection.produces()
            && connection.is_multicast_producer()
            && !self.table.has_producer(connection.produced_id)
        {
            for listener in self.table.listen_only_on(connection.produced_id) {
                if let Some(dependent) = self.table.get_mut(&listener) {
                    dependent.transition(ConnectionState::Closed)?;
                }
                if self.table.remove(&listener).is_some() {
                    self.stats.closed += 1;
                    info!(
                        "Closed listen-only connection {}: producer {} gone",
                        listener, triple
                    );
                    dependents.push(listener);
                }
            }
        }

        Ok(dependents)
    }

    /// Periodic scan: expire connections past their watchdog and produce
    /// data for connections whose interval elapsed.
    pub fn on_tick(
        &mut self,
        now: Instant,
        buffers: &BufferPool,
        sink: &mut dyn FrameSink,
    ) -> Result<TickReport> {
        let mut report = TickReport::default();

        for triple in self.table.expired(now) {
            if !self.table.contains(&triple) {
                continue;
            }
            let dependents = self.close_connection(&triple, ConnectionState::TimedOut)?;
            report.timed_out.push(triple);
            report.closed_dependents.extend(dependents);
        }

        self.produce_due(now, buffers, sink, &mut report);
        Ok(report)
    }

    fn produce_due(
        &mut self,
        now: Instant,
        buffers: &BufferPool,
        sink: &mut dyn FrameSink,
        report: &mut TickReport,
    ) {
        let due: Vec<ConnectionTriple> = self
            .table
            .iter()
            .filter(|c| c.produces() && c.next_production <= now)
            .map(|c| c.triple)
            .collect();

        let mut sent_ids = HashSet::new();
        for triple in due {
            let Some(connection) = self.table.get_mut(&triple) else {
                continue;
            };
            let interval = connection.production_interval().max(Duration::from_micros(1));
            connection.next_production += interval;
            if connection.next_production <= now {
                connection.next_production = now + interval;
            }

            // Multicast consumers of the same production share one packet
            if connection.is_multicast_producer() && !sent_ids.insert(connection.produced_id) {
                continue;
            }

            match self.produce(&triple, buffers, sink) {
                Ok(()) => {
                    self.stats.produced += 1;
                    report.produced += 1;
                }
                Err(e) => {
                    self.stats.production_failures += 1;
                    report.production_failures += 1;
                    warn!("Production for {} failed: {}", triple, e);
                }
            }
        }
    }

    /// Fill a production buffer and hand it to the transport
    fn produce(
        &mut self,
        triple: &ConnectionTriple,
        buffers: &BufferPool,
        sink: &mut dyn FrameSink,
    ) -> Result<()> {
        let Some(connection) = self.table.get_mut(triple) else {
            return Ok(());
        };
        let Some(point) = connection.path.produced_point() else {
            return Ok(());
        };

        let mut lease = buffers.acquire(BufferPurpose::Produce)?;
        if connection.transport.has_sequence_count() {
            lease.extend_from_slice(&connection.produced_sequence.to_le_bytes())?;
        }
        if self.config.io.produced_has_run_idle_header {
            let header = self.assemblies.run_idle_header(point);
            lease.extend_from_slice(&header.to_le_bytes())?;
        }
        let assemblies = &mut self.assemblies;
        lease.fill_with(|out| assemblies.read(point, out))?;

        let target = if connection.is_multicast_producer() {
            ProductionTarget::Multicast
        } else {
            ProductionTarget::Unicast(connection.originator)
        };
        sink.send_produced(&ProducedFrame {
            connection_id: connection.produced_id,
            sequence: connection.production_count,
            target,
            payload: lease.as_slice(),
        })?;

        let produced_id = connection.produced_id;
        let multicast = connection.is_multicast_producer();
        let sequence = connection.produced_sequence.wrapping_add(1);
        let count = connection.production_count.wrapping_add(1);
        if multicast {
            for sharer in self
                .table
                .iter_mut()
                .filter(|c| c.produced_id == produced_id && c.is_multicast_producer())
            {
                sharer.produced_sequence = sequence;
                sharer.production_count = count;
            }
        } else {
            connection.produced_sequence = sequence;
            connection.production_count = count;
        }
        Ok(())
    }

    /// Consume one class 0/1 packet addressed to `connection_id`
    pub fn on_io_data(
        &mut self,
        connection_id: u32,
        payload: &[u8],
        now: Instant,
    ) -> Result<ConsumeOutcome> {
        let consumed_has_run_idle = self.config.io.consumed_has_run_idle_header;
        let connection = self
            .table
            .find_by_consumed_id(connection_id)
            .filter(|c| c.class.is_io())
            .ok_or(AdapterError::UnknownConnectionId(connection_id))?;

        let packet = parse_io_packet(connection, payload, consumed_has_run_idle)?;

        // Data that will be applied must fill the consumed assembly exactly
        if connection.class == ConnectionClass::ExclusiveOwner && packet.run != Some(false) {
            if let Some(size) = connection
                .path
                .consumed_point()
                .and_then(|p| self.assemblies.size_of(p))
            {
                if packet.data.len() != size {
                    return Err(AdapterError::MalformedIoData {
                        connection_id,
                        expected: payload.len() - packet.data.len() + size,
                        got: payload.len(),
                    });
                }
            }
        }

        let fresh = match (packet.sequence, connection.consumed_sequence) {
            (Some(seq), Some(last)) => sequence_newer(seq, last),
            _ => true,
        };
        let first = connection.state == ConnectionState::Negotiating;
        if first {
            connection.transition(ConnectionState::Established)?;
            debug!("{} connection {} established", connection.class, connection.triple);
        }
        connection.refresh(now);

        if !fresh {
            self.stats.duplicates += 1;
            return Ok(ConsumeOutcome::Stale);
        }
        if packet.sequence.is_some() {
            connection.consumed_sequence = packet.sequence;
        }
        self.stats.consumed += 1;

        let outcome = if first {
            ConsumeOutcome::Established
        } else {
            ConsumeOutcome::Applied
        };
        if connection.class != ConnectionClass::ExclusiveOwner {
            return Ok(outcome);
        }

        let Some(point) = connection.path.consumed_point() else {
            return Ok(outcome);
        };
        if let Some(run) = packet.run {
            self.assemblies.on_run_idle(point, run);
            if !run {
                return Ok(if first { outcome } else { ConsumeOutcome::Idle });
            }
        }
        self.assemblies.write(point, packet.data)?;
        Ok(outcome)
    }

    /// Record activity on a class 3 connection
    pub fn on_explicit_message(&mut self, connection_id: u32, now: Instant) -> Result<()> {
        let connection = self
            .table
            .find_by_consumed_id(connection_id)
            .filter(|c| c.class == ConnectionClass::Explicit)
            .ok_or(AdapterError::UnknownConnectionId(connection_id))?;

        if connection.state == ConnectionState::Negotiating {
            connection.transition(ConnectionState::Established)?;
        }
        connection.refresh(now);
        Ok(())
    }

    /// Apply the teardown policy to the connections of a closed session.
    /// Returns every connection closed or detached.
    pub fn on_session_closed(
        &mut self,
        session: SessionHandle,
        policy: TeardownPolicy,
    ) -> Result<Vec<ConnectionTriple>> {
        let owned = self.table.owned_by(session);
        if owned.is_empty() {
            return Ok(owned);
        }

        match policy {
            TeardownPolicy::CloseConnections => {
                let mut closed = Vec::with_capacity(owned.len());
                for triple in owned {
                    if !self.table.contains(&triple) {
                        continue;
                    }
                    let dependents = self.close_connection(&triple, ConnectionState::Closed)?;
                    closed.push(triple);
                    closed.extend(dependents);
                }
                info!("Session {} closed, {} connection(s) closed", session, closed.len());
                Ok(closed)
            }
            TeardownPolicy::Detach => {
                for triple in &owned {
                    if let Some(connection) = self.table.get_mut(triple) {
                        connection.owner = None;
                    }
                }
                info!(
                    "Session {} closed, {} connection(s) detached",
                    session,
                    owned.len()
                );
                Ok(owned)
            }
        }
    }

    /// Drop a connection without consulting the state machine
    pub fn quarantine(&mut self, triple: &ConnectionTriple) -> bool {
        match self.table.remove(triple) {
            Some(connection) => {
                self.stats.closed += 1;
                warn!("Quarantined {} connection {}", connection.class, triple);
                true
            }
            None => false,
        }
    }

    /// Drop every connection
    pub fn reset(&mut self) {
        let dropped = self.table.len();
        self.table.clear();
        self.stats.closed += dropped as u64;
        warn!("Connection table reset, {} connection(s) dropped", dropped);
    }

    pub fn get(&self, triple: &ConnectionTriple) -> Option<&Connection> {
        self.table.get(triple)
    }

    pub fn find_by_consumed_id(&self, id: u32) -> Option<&Connection> {
        self.table.iter().find(|c| c.consumed_id == id)
    }

    /// Connections opened through a session
    pub fn owned_by(&self, session: SessionHandle) -> Vec<ConnectionTriple> {
        self.table.owned_by(session)
    }

    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }

    pub fn count(&self, class: ConnectionClass) -> usize {
        self.table.count(class)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Connection> {
        self.table.iter()
    }

    pub fn assemblies(&self) -> &A {
        &self.assemblies
    }

    pub fn assemblies_mut(&mut self) -> &mut A {
        &mut self.assemblies
    }

    pub fn stats(&self) -> ConnectionStats {
        ConnectionStats {
            active: self.table.len(),
            ..self.stats.clone()
        }
    }
}

/// T->O production an opening connection joins
struct SharedProduction {
    id: u32,
    api_us: u32,
    size: u16,
    sequence: u16,
    count: u32,
}

impl SharedProduction {
    fn of(producer: &Connection) -> Self {
        Self {
            id: producer.produced_id,
            api_us: producer.t_to_o_api_us,
            size: producer.t_to_o.size,
            sequence: producer.produced_sequence,
            count: producer.production_count,
        }
    }
}

fn check_transport(transport: &TransportTrigger) -> Result<()> {
    match transport.class {
        0 | 1 if transport.trigger == ProductionTrigger::Cyclic => Ok(()),
        3 => Ok(()),
        class => Err(AdapterError::invalid_parameters(
            extended::TRANSPORT_CLASS_NOT_SUPPORTED,
            format!("transport class {} with {:?} trigger", class, transport.trigger),
        )),
    }
}

fn check_size(params: &NetworkParams, expected: usize, extended: u16, dir: &str) -> Result<()> {
    let size = usize::from(params.size);
    let ok = if params.fixed_size {
        size == expected
    } else {
        size >= expected
    };
    if ok {
        Ok(())
    } else {
        Err(AdapterError::invalid_parameters(
            extended,
            format!("{} size {} but {} expected", dir, size, expected),
        ))
    }
}

/// Round an RPI up to a whole number of timer ticks, or down to the
/// largest whole multiple that fits in 32 bits
fn round_to_tick(rpi_us: u32, tick_us: u32) -> u32 {
    let tick = u64::from(tick_us.max(1));
    let rounded = u64::from(rpi_us).div_ceil(tick) * tick;
    u32::try_from(rounded).unwrap_or_else(|_| {
        let tick = tick_us.max(1);
        u32::MAX / tick * tick
    })
}

/// Sequence count comparison modulo 2^16
fn sequence_newer(seq: u16, last: u16) -> bool {
    (seq.wrapping_sub(last) as i16) > 0
}

fn parse_io_packet<'a>(
    connection: &Connection,
    payload: &'a [u8],
    consumed_has_run_idle: bool,
) -> Result<IoPacket<'a>> {
    let expected = usize::from(connection.o_to_t.size);
    let size_ok = if connection.o_to_t.fixed_size {
        payload.len() == expected
    } else {
        payload.len() <= expected
    };
    let malformed = || AdapterError::MalformedIoData {
        connection_id: connection.consumed_id,
        expected,
        got: payload.len(),
    };
    if !size_ok {
        return Err(malformed());
    }

    let mut data = payload;
    let sequence = if connection.transport.has_sequence_count() {
        if data.len() < SEQUENCE_COUNT_LEN {
            return Err(malformed());
        }
        let seq = u16::from_le_bytes([data[0], data[1]]);
        data = &data[SEQUENCE_COUNT_LEN..];
        Some(seq)
    } else {
        None
    };

    let run = if consumed_has_run_idle && connection.class == ConnectionClass::ExclusiveOwner {
        if data.len() < RUN_IDLE_HEADER_LEN {
            return Err(malformed());
        }
        let header = u32::from_le_bytes([data[0], data[1], data[2], data[3]]);
        data = &data[RUN_IDLE_HEADER_LEN..];
        Some(header & RUN_IDLE_RUN != 0)
    } else {
        None
    };

    Ok(IoPacket {
        sequence,
        run,
        data,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::ElectronicKey;
    use crate::error::Resource;
    use crate::io::MemoryAssemblies;
    use std::net::{IpAddr, Ipv4Addr};

    const OUTPUT: u32 = 150;
    const INPUT: u32 = 100;
    const CONFIG: u32 = 151;

    #[derive(Default)]
    struct RecordingSink {
        produced: Vec<(u32, u32, Vec<u8>)>,
        fail: bool,
    }

    impl FrameSink for RecordingSink {
        fn send_reply(&mut self, _originator: SocketAddr, _frame: &[u8]) -> Result<()> {
            Ok(())
        }

        fn send_produced(&mut self, frame: &ProducedFrame<'_>) -> Result<()> {
            if self.fail {
                return Err(AdapterError::Transport("link down".into()));
            }
            self.produced
                .push((frame.connection_id, frame.sequence, frame.payload.to_vec()));
            Ok(())
        }
    }

    fn config() -> Config {
        let mut config = Config::default();
        config.connections.incarnation_id = Some(0x00AB);
        config.connections.initial_timeout_ms = 100;
        config
    }

    fn assemblies() -> MemoryAssemblies {
        let mut store = MemoryAssemblies::new();
        store.insert(INPUT, 8);
        store.insert(101, 8);
        store.insert(OUTPUT, 4);
        store.insert(160, 4);
        store.insert(CONFIG, 0);
        store
    }

    fn manager(config: Config) -> ConnectionManager<MemoryAssemblies> {
        ConnectionManager::new(Arc::new(config), assemblies())
    }

    fn originator() -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::new(192, 168, 1, 10)), 2222)
    }

    fn triple(serial: u16) -> ConnectionTriple {
        ConnectionTriple {
            connection_serial: serial,
            originator_vendor_id: 0x1337,
            originator_serial: 0x1234_5678,
        }
    }

    /// Exclusive owner: O->T = seq + run/idle + 4 data, T->O = seq + 8 data
    fn exclusive_owner(serial: u16, output: u32) -> ForwardOpenRequest {
        ForwardOpenRequest {
            triple: triple(serial),
            o_to_t_connection_id: 0,
            t_to_o_connection_id: 0xFFFF_0000 + u32::from(serial),
            timeout_multiplier: 0,
            o_to_t: NetworkParams::point_to_point(10_000, 10),
            t_to_o: NetworkParams::multicast(10_000, 10),
            transport: TransportTrigger::cyclic_class1(),
            path: ConnectionPath::assembly_with_config(CONFIG, output, INPUT),
            large: false,
        }
    }

    fn input_only(serial: u16, heartbeat: u32) -> ForwardOpenRequest {
        ForwardOpenRequest {
            o_to_t: NetworkParams::point_to_point(10_000, 2),
            t_to_o: NetworkParams::point_to_point(10_000, 10),
            path: ConnectionPath::assembly(heartbeat, INPUT),
            ..exclusive_owner(serial, OUTPUT)
        }
    }

    fn explicit(serial: u16) -> ForwardOpenRequest {
        ForwardOpenRequest {
            o_to_t: NetworkParams::point_to_point(100_000, 500),
            t_to_o: NetworkParams::point_to_point(100_000, 500),
            transport: TransportTrigger::explicit_class3(),
            path: ConnectionPath::message_router(),
            ..exclusive_owner(serial, OUTPUT)
        }
    }

    fn eo_packet(seq: u16, run: bool, data: [u8; 4]) -> Vec<u8> {
        let mut packet = seq.to_le_bytes().to_vec();
        packet.extend_from_slice(&(if run { RUN_IDLE_RUN } else { 0 }).to_le_bytes());
        packet.extend_from_slice(&data);
        packet
    }

    #[test]
    fn test_forward_open_assigns_ids() {
        let mut manager = manager(config());
        let now = Instant::now();

        let response = manager
            .forward_open(None, originator(), &exclusive_owner(1, OUTPUT), now)
            .unwrap();
        assert_eq!(response.class, ConnectionClass::ExclusiveOwner);
        assert_eq!(response.o_to_t_connection_id >> 16, 0x00AB);
        // Multicast production gets a target generated ID
        assert_eq!(response.t_to_o_connection_id >> 16, 0x00AB);
        assert_ne!(response.o_to_t_connection_id, response.t_to_o_connection_id);
        assert_eq!(
            manager.get(&triple(1)).unwrap().state,
            ConnectionState::Negotiating
        );

        // Point-to-point production keeps the originator's ID
        let response = manager
            .forward_open(None, originator(), &input_only(2, 152), now)
            .unwrap();
        assert_eq!(response.t_to_o_connection_id, 0xFFFF_0002);
    }

    #[test]
    fn test_duplicate_triple_rejected() {
        let mut manager = manager(config());
        let now = Instant::now();
        manager
            .forward_open(None, originator(), &exclusive_owner(1, OUTPUT), now)
            .unwrap();

        let err = manager
            .forward_open(None, originator(), &exclusive_owner(1, 160), now)
            .unwrap_err();
        assert!(matches!(
            err,
            AdapterError::ConnectionInUse {
                ownership: false,
                ..
            }
        ));
        assert_eq!(manager.len(), 1);
    }

    #[test]
    fn test_exclusive_owner_conflict() {
        let mut manager = manager(config());
        let now = Instant::now();
        let first = manager
            .forward_open(None, originator(), &exclusive_owner(1, OUTPUT), now)
            .unwrap();

        let err = manager
            .forward_open(None, originator(), &exclusive_owner(2, OUTPUT), now)
            .unwrap_err();
        match err {
            AdapterError::ConnectionInUse {
                existing,
                ownership,
            } => {
                assert!(ownership);
                assert_eq!(existing, triple(1));
            }
            other => panic!("unexpected error {:?}", other),
        }

        let original = manager.get(&triple(1)).unwrap();
        assert_eq!(original.consumed_id, first.o_to_t_connection_id);
        assert_eq!(manager.count(ConnectionClass::ExclusiveOwner), 1);
    }

    #[test]
    fn test_class_capacity_and_reuse() {
        let mut config = config();
        config.connections.exclusive_owner = 2;
        let mut manager = manager(config);
        let now = Instant::now();

        manager
            .forward_open(None, originator(), &exclusive_owner(1, OUTPUT), now)
            .unwrap();
        manager
            .forward_open(None, originator(), &exclusive_owner(2, 160), now)
            .unwrap();

        let mut third = exclusive_owner(3, 160);
        third.path = ConnectionPath::assembly(INPUT, 101);
        third.o_to_t.size = 14;
        let err = manager
            .forward_open(None, originator(), &third, now)
            .unwrap_err();
        assert!(matches!(err, AdapterError::ResourceUnavailable(_)));

        manager
            .forward_close(&ForwardCloseRequest { triple: triple(1) })
            .unwrap();
        manager.forward_open(None, originator(), &third, now).unwrap();
        assert_eq!(manager.count(ConnectionClass::ExclusiveOwner), 2);
    }

    #[test]
    fn test_input_only_per_path_limit() {
        let mut config = config();
        config.connections.input_only_per_path = 2;
        let mut manager = manager(config);
        let now = Instant::now();

        manager
            .forward_open(None, originator(), &input_only(1, 152), now)
            .unwrap();
        manager
            .forward_open(None, originator(), &input_only(2, 152), now)
            .unwrap();
        let err = manager
            .forward_open(None, originator(), &input_only(3, 152), now)
            .unwrap_err();
        assert!(matches!(err, AdapterError::ResourceUnavailable(_)));
        assert_eq!(manager.count(ConnectionClass::InputOnly), 2);
    }

    #[test]
    fn test_listen_only_requires_and_follows_producer() {
        let mut manager = manager(config());
        let now = Instant::now();

        let mut listen = input_only(5, 153);
        listen.t_to_o = NetworkParams::multicast(10_000, 10);

        let err = manager
            .forward_open(None, originator(), &listen, now)
            .unwrap_err();
        assert!(matches!(err, AdapterError::NoProducingConnection(INPUT)));

        let owner = manager
            .forward_open(None, originator(), &exclusive_owner(1, OUTPUT), now)
            .unwrap();
        let response = manager.forward_open(None, originator(), &listen, now).unwrap();
        assert_eq!(response.class, ConnectionClass::ListenOnly);
        assert_eq!(response.t_to_o_connection_id, owner.t_to_o_connection_id);

        let closed = manager
            .forward_close(&ForwardCloseRequest { triple: triple(1) })
            .unwrap();
        assert_eq!(closed.dependents, vec![triple(5)]);
        assert!(manager.is_empty());
    }

    #[test]
    fn test_listen_only_per_path_limit() {
        let mut config = config();
        config.connections.exclusive_owner = 2;
        config.connections.listen_only = 4;
        config.connections.listen_only_per_path = 2;
        let mut manager = manager(config);
        let now = Instant::now();

        manager
            .forward_open(None, originator(), &exclusive_owner(1, OUTPUT), now)
            .unwrap();
        let mut other = exclusive_owner(2, 160);
        other.path = ConnectionPath::assembly_with_config(CONFIG, 160, 101);
        manager.forward_open(None, originator(), &other, now).unwrap();

        let listener = |serial: u16, input: u32| ForwardOpenRequest {
            t_to_o: NetworkParams::multicast(10_000, 10),
            path: ConnectionPath::assembly(153, input),
            ..input_only(serial, 153)
        };

        manager
            .forward_open(None, originator(), &listener(10, INPUT), now)
            .unwrap();
        manager
            .forward_open(None, originator(), &listener(11, INPUT), now)
            .unwrap();
        let err = manager
            .forward_open(None, originator(), &listener(12, INPUT), now)
            .unwrap_err();
        assert!(matches!(
            err,
            AdapterError::ResourceUnavailable(Resource::PathConsumers(ConnectionClass::ListenOnly))
        ));

        // Another input assembly is another path
        let response = manager
            .forward_open(None, originator(), &listener(13, 101), now)
            .unwrap();
        assert_eq!(response.class, ConnectionClass::ListenOnly);
        assert_eq!(manager.count(ConnectionClass::ListenOnly), 3);
    }

    #[test]
    fn test_point_to_point_productions_with_same_id() {
        let mut manager = manager(config());
        let buffers = BufferPool::new(&Config::default().buffers);
        let mut sink = RecordingSink::default();
        let now = Instant::now();

        for (serial, host) in [(1u16, 1u8), (2, 2)] {
            let mut request = input_only(serial, 152);
            request.t_to_o_connection_id = 0x1234;
            let from = SocketAddr::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, host)), 2222);
            manager.forward_open(None, from, &request, now).unwrap();
        }

        let report = manager.on_tick(now, &buffers, &mut sink).unwrap();
        assert_eq!(report.produced, 2);
        assert!(sink.produced.iter().all(|(id, _, _)| *id == 0x1234));
    }

    #[test]
    fn test_shared_production_sequence_survives_producer_close() {
        let mut config = config();
        config.connections.exclusive_owner = 2;
        let mut manager = manager(config);
        let buffers = BufferPool::new(&Config::default().buffers);
        let mut sink = RecordingSink::default();
        let start = Instant::now();

        let first = manager
            .forward_open(None, originator(), &exclusive_owner(1, OUTPUT), start)
            .unwrap();
        let second = manager
            .forward_open(None, originator(), &exclusive_owner(2, 160), start)
            .unwrap();
        assert_eq!(first.t_to_o_connection_id, second.t_to_o_connection_id);

        for ms in [0, 10, 20] {
            manager
                .on_tick(start + Duration::from_millis(ms), &buffers, &mut sink)
                .unwrap();
        }
        manager
            .forward_close(&ForwardCloseRequest { triple: triple(1) })
            .unwrap();
        manager
            .on_tick(start + Duration::from_millis(30), &buffers, &mut sink)
            .unwrap();

        let sequences: Vec<u16> = sink
            .produced
            .iter()
            .map(|(_, _, payload)| u16::from_le_bytes([payload[0], payload[1]]))
            .collect();
        let counts: Vec<u32> = sink.produced.iter().map(|(_, count, _)| *count).collect();
        assert_eq!(sequences, vec![0, 1, 2, 3]);
        assert_eq!(counts, vec![0, 1, 2, 3]);
    }

    #[test]
    fn test_forward_close_unknown_triple() {
        let mut manager = manager(config());
        let now = Instant::now();
        manager
            .forward_open(None, originator(), &exclusive_owner(1, OUTPUT), now)
            .unwrap();
        let before = manager.stats();

        let err = manager
            .forward_close(&ForwardCloseRequest { triple: triple(9) })
            .unwrap_err();
        assert!(matches!(err, AdapterError::ConnectionNotFound(_)));
        assert_eq!(manager.len(), 1);
        assert_eq!(manager.stats().closed, before.closed);
    }

    #[test]
    fn test_parameter_validation() {
        let mut manager = manager(config());
        let now = Instant::now();

        let mut bad_rpi = exclusive_owner(1, OUTPUT);
        bad_rpi.o_to_t.rpi_us = 1_000;
        assert!(matches!(
            manager.forward_open(None, originator(), &bad_rpi, now),
            Err(AdapterError::InvalidParameters {
                extended: extended::RPI_NOT_SUPPORTED,
                ..
            })
        ));

        let mut bad_size = exclusive_owner(2, OUTPUT);
        bad_size.o_to_t.size = 8;
        assert!(matches!(
            manager.forward_open(None, originator(), &bad_size, now),
            Err(AdapterError::InvalidParameters {
                extended: extended::INVALID_O_TO_T_SIZE,
                ..
            })
        ));

        let mut too_large = explicit(3);
        too_large.o_to_t.size = 600;
        assert!(matches!(
            manager.forward_open(None, originator(), &too_large, now),
            Err(AdapterError::InvalidParameters {
                extended: extended::INVALID_CONNECTION_SIZE,
                ..
            })
        ));

        let mut bad_multiplier = exclusive_owner(4, OUTPUT);
        bad_multiplier.timeout_multiplier = 8;
        assert!(manager
            .forward_open(None, originator(), &bad_multiplier, now)
            .is_err());

        let mut bad_transport = exclusive_owner(5, OUTPUT);
        bad_transport.transport = TransportTrigger::from_byte(0x02);
        assert!(matches!(
            manager.forward_open(None, originator(), &bad_transport, now),
            Err(AdapterError::InvalidParameters {
                extended: extended::TRANSPORT_CLASS_NOT_SUPPORTED,
                ..
            })
        ));

        assert!(manager.is_empty());
        assert_eq!(manager.stats().rejected, 5);
    }

    #[test]
    fn test_invalid_path_and_key() {
        let mut manager = manager(config());
        let now = Instant::now();

        let mut unknown = exclusive_owner(1, OUTPUT);
        unknown.path = ConnectionPath::assembly(OUTPUT, 999);
        assert!(matches!(
            manager.forward_open(None, originator(), &unknown, now),
            Err(AdapterError::InvalidConnectionPath(_))
        ));

        let mut keyed = exclusive_owner(2, OUTPUT);
        let mut key = ElectronicKey::exact(&Config::default().identity);
        key.product_code = 1;
        keyed.path = keyed.path.with_key(key);
        assert!(matches!(
            manager.forward_open(None, originator(), &keyed, now),
            Err(AdapterError::ElectronicKeyMismatch { .. })
        ));
    }

    #[test]
    fn test_io_data_establishes_and_writes() {
        let mut manager = manager(config());
        let now = Instant::now();
        let response = manager
            .forward_open(None, originator(), &exclusive_owner(1, OUTPUT), now)
            .unwrap();
        let id = response.o_to_t_connection_id;

        let outcome = manager
            .on_io_data(id, &eo_packet(1, true, [1, 2, 3, 4]), now)
            .unwrap();
        assert_eq!(outcome, ConsumeOutcome::Established);
        assert_eq!(
            manager.get(&triple(1)).unwrap().state,
            ConnectionState::Established
        );
        assert_eq!(manager.assemblies().data(OUTPUT), Some(&[1, 2, 3, 4][..]));

        // Repeated sequence count is not applied
        let outcome = manager
            .on_io_data(id, &eo_packet(1, true, [9, 9, 9, 9]), now)
            .unwrap();
        assert_eq!(outcome, ConsumeOutcome::Stale);
        assert_eq!(manager.assemblies().data(OUTPUT), Some(&[1, 2, 3, 4][..]));

        // Idle packets leave the output untouched
        let outcome = manager
            .on_io_data(id, &eo_packet(2, false, [5, 5, 5, 5]), now)
            .unwrap();
        assert_eq!(outcome, ConsumeOutcome::Idle);
        assert_eq!(manager.assemblies().is_running(OUTPUT), Some(false));
        assert_eq!(manager.assemblies().data(OUTPUT), Some(&[1, 2, 3, 4][..]));

        let outcome = manager
            .on_io_data(id, &eo_packet(3, true, [7, 7, 7, 7]), now)
            .unwrap();
        assert_eq!(outcome, ConsumeOutcome::Applied);
        assert_eq!(manager.assemblies().data(OUTPUT), Some(&[7, 7, 7, 7][..]));
    }

    #[test]
    fn test_malformed_io_data_keeps_state() {
        let mut manager = manager(config());
        let now = Instant::now();
        let id = manager
            .forward_open(None, originator(), &exclusive_owner(1, OUTPUT), now)
            .unwrap()
            .o_to_t_connection_id;

        let err = manager.on_io_data(id, &[0x01, 0x00, 0x01], now).unwrap_err();
        assert!(matches!(err, AdapterError::MalformedIoData { expected: 10, got: 3, .. }));
        assert_eq!(
            manager.get(&triple(1)).unwrap().state,
            ConnectionState::Negotiating
        );

        assert!(matches!(
            manager.on_io_data(0xDEAD_BEEF, &[], now),
            Err(AdapterError::UnknownConnectionId(0xDEAD_BEEF))
        ));
    }

    #[test]
    fn test_short_variable_size_data_has_no_effect() {
        let mut manager = manager(config());
        let now = Instant::now();
        let mut request = exclusive_owner(1, OUTPUT);
        request.o_to_t.fixed_size = false;
        let id = manager
            .forward_open(None, originator(), &request, now)
            .unwrap()
            .o_to_t_connection_id;

        let mut packet = 1u16.to_le_bytes().to_vec();
        packet.extend_from_slice(&RUN_IDLE_RUN.to_le_bytes());
        packet.extend_from_slice(&[9, 9]);
        let err = manager
            .on_io_data(id, &packet, now + Duration::from_millis(50))
            .unwrap_err();
        assert!(matches!(err, AdapterError::MalformedIoData { expected: 10, got: 8, .. }));

        let connection = manager.get(&triple(1)).unwrap();
        assert_eq!(connection.state, ConnectionState::Negotiating);
        assert_eq!(connection.consumed_sequence, None);
        assert_eq!(connection.last_activity, now);
        assert_eq!(manager.stats().consumed, 0);
        assert_eq!(manager.assemblies().data(OUTPUT), Some(&[0, 0, 0, 0][..]));

        // A full packet is still accepted afterwards
        let outcome = manager
            .on_io_data(id, &eo_packet(1, true, [1, 2, 3, 4]), now)
            .unwrap();
        assert_eq!(outcome, ConsumeOutcome::Established);
    }

    #[test]
    fn test_tick_times_out_and_frees_slot() {
        let mut config = config();
        config.connections.exclusive_owner = 1;
        let mut manager = manager(config);
        let buffers = BufferPool::new(&Config::default().buffers);
        let mut sink = RecordingSink::default();
        let start = Instant::now();

        let id = manager
            .forward_open(None, originator(), &exclusive_owner(1, OUTPUT), start)
            .unwrap()
            .o_to_t_connection_id;
        manager
            .on_io_data(id, &eo_packet(1, true, [0; 4]), start)
            .unwrap();

        // Watchdog is 4 x 10ms
        let report = manager
            .on_tick(start + Duration::from_millis(30), &buffers, &mut sink)
            .unwrap();
        assert!(report.timed_out.is_empty());

        let report = manager
            .on_tick(start + Duration::from_millis(50), &buffers, &mut sink)
            .unwrap();
        assert_eq!(report.timed_out, vec![triple(1)]);
        assert!(manager.is_empty());
        assert_eq!(manager.stats().timed_out, 1);

        manager
            .forward_open(
                None,
                originator(),
                &exclusive_owner(2, OUTPUT),
                start + Duration::from_millis(50),
            )
            .unwrap();
    }

    #[test]
    fn test_negotiating_uses_initial_timeout() {
        let mut manager = manager(config());
        let buffers = BufferPool::new(&Config::default().buffers);
        let mut sink = RecordingSink::default();
        let start = Instant::now();
        manager
            .forward_open(None, originator(), &exclusive_owner(1, OUTPUT), start)
            .unwrap();

        let report = manager
            .on_tick(start + Duration::from_millis(60), &buffers, &mut sink)
            .unwrap();
        assert!(report.timed_out.is_empty());

        let report = manager
            .on_tick(start + Duration::from_millis(110), &buffers, &mut sink)
            .unwrap();
        assert_eq!(report.timed_out, vec![triple(1)]);
    }

    #[test]
    fn test_production_layout_and_schedule() {
        let mut config = config();
        config.io.produced_has_run_idle_header = true;
        let mut manager = manager(config);
        manager
            .assemblies_mut()
            .set(INPUT, &[1, 2, 3, 4, 5, 6, 7, 8])
            .unwrap();
        let buffers = BufferPool::new(&Config::default().buffers);
        let mut sink = RecordingSink::default();
        let start = Instant::now();

        let mut request = exclusive_owner(1, OUTPUT);
        request.t_to_o.size = 14;
        request.t_to_o.rpi_us = 20_000;
        let response = manager
            .forward_open(None, originator(), &request, start)
            .unwrap();

        let report = manager.on_tick(start, &buffers, &mut sink).unwrap();
        assert_eq!(report.produced, 1);
        let (id, sequence, payload) = &sink.produced[0];
        assert_eq!(*id, response.t_to_o_connection_id);
        assert_eq!(*sequence, 0);
        assert_eq!(&payload[..2], &[0, 0]);
        assert_eq!(&payload[2..6], &RUN_IDLE_RUN.to_le_bytes());
        assert_eq!(&payload[6..], &[1, 2, 3, 4, 5, 6, 7, 8]);

        // Not due again until the 20ms interval elapsed
        let report = manager
            .on_tick(start + Duration::from_millis(10), &buffers, &mut sink)
            .unwrap();
        assert_eq!(report.produced, 0);

        manager
            .on_tick(start + Duration::from_millis(20), &buffers, &mut sink)
            .unwrap();
        assert_eq!(sink.produced.len(), 2);
        assert_eq!(&sink.produced[1].2[..2], &[1, 0]);
        assert_eq!(buffers.availability().free(BufferPurpose::Produce), 1);
    }

    #[test]
    fn test_production_failure_does_not_abort_scan() {
        let mut manager = manager(config());
        let buffers = BufferPool::new(&Config::default().buffers);
        let mut sink = RecordingSink {
            fail: true,
            ..Default::default()
        };
        let start = Instant::now();
        manager
            .forward_open(None, originator(), &exclusive_owner(1, OUTPUT), start)
            .unwrap();
        manager
            .forward_open(None, originator(), &input_only(2, 152), start)
            .unwrap();

        let report = manager.on_tick(start, &buffers, &mut sink).unwrap();
        assert_eq!(report.production_failures, 2);
        assert_eq!(manager.len(), 2);
        assert_eq!(buffers.availability().free(BufferPurpose::Produce), 1);
    }

    #[test]
    fn test_explicit_connection_activity() {
        let mut manager = manager(config());
        let start = Instant::now();
        let response = manager
            .forward_open(None, originator(), &explicit(1), start)
            .unwrap();
        assert_eq!(response.class, ConnectionClass::Explicit);
        assert_eq!(response.o_to_t_api_us, 100_000);

        manager
            .on_explicit_message(response.o_to_t_connection_id, start)
            .unwrap();
        assert_eq!(
            manager.get(&triple(1)).unwrap().state,
            ConnectionState::Established
        );
        assert!(manager
            .on_io_data(response.o_to_t_connection_id, &[], start)
            .is_err());
    }

    #[test]
    fn test_session_teardown_policies() {
        let session = SessionHandle::new(1);
        let other = SessionHandle::new(2);
        let now = Instant::now();

        let mut manager = manager(config());
        manager
            .forward_open(Some(session), originator(), &exclusive_owner(1, OUTPUT), now)
            .unwrap();
        manager
            .forward_open(Some(other), originator(), &exclusive_owner(2, 160), now)
            .unwrap();
        let closed = manager
            .on_session_closed(session, TeardownPolicy::CloseConnections)
            .unwrap();
        assert_eq!(closed, vec![triple(1)]);
        assert_eq!(manager.len(), 1);

        let detached = manager
            .on_session_closed(other, TeardownPolicy::Detach)
            .unwrap();
        assert_eq!(detached, vec![triple(2)]);
        assert_eq!(manager.len(), 1);
        assert_eq!(manager.get(&triple(2)).unwrap().owner, None);
    }

    #[test]
    fn test_round_to_tick_and_sequence() {
        assert_eq!(round_to_tick(10_000, 10_000), 10_000);
        assert_eq!(round_to_tick(15_000, 10_000), 20_000);
        assert_eq!(round_to_tick(u32::MAX, 10_000), 4_294_960_000);
        assert!(sequence_newer(2, 1));
        assert!(sequence_newer(0, u16::MAX));
        assert!(!sequence_newer(1, 1));
        assert!(!sequence_newer(1, 2));
    }
}
