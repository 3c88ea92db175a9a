//! CIP connections
//!
//! Forward_Open creates a connection, Forward_Close or the inactivity
//! watchdog removes it. Connections come in four classes that share
//! assembly paths under different rules:
//!
//! - exclusive owner: writes the output assembly; one per output path
//! - input-only: reads the input assembly, a few per path
//! - listen-only: joins the multicast production of another connection
//! - explicit: class 3 messaging to the Message Router
//!
//! # Example
//!
//! ```ignore
//! use enip_adapter::connection::ConnectionManager;
//!
//! let mut manager = ConnectionManager::new(config, assemblies);
//! let response = manager.forward_open(Some(session), originator, &request, now)?;
//!
//! // every timer tick
//! let report = manager.on_tick(now, &buffers, &mut sink)?;
//! ```

pub mod ids;
pub mod manager;
pub mod path;
pub mod table;

pub use ids::ConnectionIdAllocator;
pub use manager::{
    ConsumeOutcome, ForwardCloseRequest, ForwardCloseResponse, ForwardOpenRequest,
    ForwardOpenResponse, ConnectionManager, TickReport,
};
pub use path::{ConnectionPath, ElectronicKey, PathTarget};
pub use table::ConnectionTable;

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::error::{ensure, FaultScope, Result};
use crate::session::SessionHandle;

/// Identifies a connection across Forward_Open and Forward_Close
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConnectionTriple {
    pub connection_serial: u16,
    pub originator_vendor_id: u16,
    pub originator_serial: u32,
}

impl std::fmt::Display for ConnectionTriple {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{:04X}/{:04X}/{:08X}",
            self.connection_serial, self.originator_vendor_id, self.originator_serial
        )
    }
}

/// Connection class, deciding capacity and sharing rules
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConnectionClass {
    ExclusiveOwner,
    InputOnly,
    ListenOnly,
    Explicit,
}

impl ConnectionClass {
    pub const ALL: [ConnectionClass; 4] = [
        ConnectionClass::ExclusiveOwner,
        ConnectionClass::InputOnly,
        ConnectionClass::ListenOnly,
        ConnectionClass::Explicit,
    ];

    pub fn is_io(self) -> bool {
        !matches!(self, ConnectionClass::Explicit)
    }

    pub(crate) fn index(self) -> usize {
        match self {
            ConnectionClass::ExclusiveOwner => 0,
            ConnectionClass::InputOnly => 1,
            ConnectionClass::ListenOnly => 2,
            ConnectionClass::Explicit => 3,
        }
    }
}

impl std::fmt::Display for ConnectionClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionClass::ExclusiveOwner => write!(f, "exclusive-owner"),
            ConnectionClass::InputOnly => write!(f, "input-only"),
            ConnectionClass::ListenOnly => write!(f, "listen-only"),
            ConnectionClass::Explicit => write!(f, "explicit"),
        }
    }
}

/// Network connection type from the connection parameters word
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionType {
    Null,
    Multicast,
    PointToPoint,
}

/// Network connection priority
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Priority {
    Low,
    High,
    Scheduled,
    Urgent,
}

/// O->T or T->O network parameters of a Forward_Open
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkParams {
    /// Requested packet interval (microseconds)
    pub rpi_us: u32,
    /// Connection size in bytes
    pub size: u16,
    pub connection_type: ConnectionType,
    pub priority: Priority,
    /// Fixed (true) or variable size
    pub fixed_size: bool,
}

impl NetworkParams {
    pub fn point_to_point(rpi_us: u32, size: u16) -> Self {
        Self {
            rpi_us,
            size,
            connection_type: ConnectionType::PointToPoint,
            priority: Priority::Scheduled,
            fixed_size: true,
        }
    }

    pub fn multicast(rpi_us: u32, size: u16) -> Self {
        Self {
            connection_type: ConnectionType::Multicast,
            ..Self::point_to_point(rpi_us, size)
        }
    }
}

/// Production trigger of an I/O connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProductionTrigger {
    Cyclic,
    ChangeOfState,
    Application,
}

/// Transport class and trigger byte of a Forward_Open
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransportTrigger {
    /// Transport class (0, 1 or 3 are meaningful)
    pub class: u8,
    pub trigger: ProductionTrigger,
    /// Server (true) or client transport
    pub server: bool,
}

impl TransportTrigger {
    /// Cyclic class 1 client transport, the usual I/O connection
    pub fn cyclic_class1() -> Self {
        Self {
            class: 1,
            trigger: ProductionTrigger::Cyclic,
            server: false,
        }
    }

    /// Application-triggered class 3 server transport
    pub fn explicit_class3() -> Self {
        Self {
            class: 3,
            trigger: ProductionTrigger::Application,
            server: true,
        }
    }

    /// Whether packets carry a 16-bit sequence count
    pub fn has_sequence_count(&self) -> bool {
        self.class != 0
    }

    /// Parse the raw transport class/trigger byte
    pub fn from_byte(byte: u8) -> Self {
        let trigger = match (byte >> 4) & 0x07 {
            0 => ProductionTrigger::Cyclic,
            1 => ProductionTrigger::ChangeOfState,
            _ => ProductionTrigger::Application,
        };
        Self {
            class: byte & 0x0F,
            trigger,
            server: byte & 0x80 != 0,
        }
    }
}

/// Connection lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionState {
    /// Forward_Open accepted, waiting for the first valid packet
    Negotiating,
    /// Exchanging data
    Established,
    /// Watchdog expired
    TimedOut,
    /// Forward_Close or session teardown
    Closed,
}

impl ConnectionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, ConnectionState::TimedOut | ConnectionState::Closed)
    }

    /// Allowed transitions; terminal states have no exits
    pub fn can_transition_to(self, next: ConnectionState) -> bool {
        use ConnectionState::*;
        matches!(
            (self, next),
            (Negotiating, Established)
                | (Negotiating, TimedOut)
                | (Negotiating, Closed)
                | (Established, TimedOut)
                | (Established, Closed)
        )
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionState::Negotiating => write!(f, "NEGOTIATING"),
            ConnectionState::Established => write!(f, "ESTABLISHED"),
            ConnectionState::TimedOut => write!(f, "TIMED_OUT"),
            ConnectionState::Closed => write!(f, "CLOSED"),
        }
    }
}

/// A live connection table entry
#[derive(Debug, Clone)]
pub struct Connection {
    pub triple: ConnectionTriple,
    pub class: ConnectionClass,
    pub path: ConnectionPath,
    pub transport: TransportTrigger,
    pub o_to_t: NetworkParams,
    pub t_to_o: NetworkParams,
    /// ID of packets we consume
    pub consumed_id: u32,
    /// ID of packets we produce
    pub produced_id: u32,
    /// Actual O->T packet interval (microseconds)
    pub o_to_t_api_us: u32,
    /// Actual T->O packet interval (microseconds)
    pub t_to_o_api_us: u32,
    /// Index of the timeout multiplier (4 << index)
    pub timeout_multiplier: u8,
    pub state: ConnectionState,
    /// Session the connection was opened through; `None` once detached
    pub owner: Option<SessionHandle>,
    pub originator: SocketAddr,
    pub opened_at: Instant,
    pub last_activity: Instant,
    /// Inactivity watchdog
    pub deadline: Instant,
    /// Next scheduled production
    pub next_production: Instant,
    /// Last consumed sequence count (class 1)
    pub consumed_sequence: Option<u16>,
    /// Sequence count of the next produced packet (class 1)
    pub produced_sequence: u16,
    /// Encapsulation sequence number of the next produced packet
    pub production_count: u32,
}

impl Connection {
    /// Watchdog period: RPI x multiplier
    pub fn timeout(&self) -> Duration {
        let multiplier = 4u64 << self.timeout_multiplier.min(7);
        Duration::from_micros(u64::from(self.o_to_t.rpi_us) * multiplier)
    }

    pub fn production_interval(&self) -> Duration {
        Duration::from_micros(u64::from(self.t_to_o_api_us))
    }

    /// Whether the tick scan produces data for this connection
    pub fn produces(&self) -> bool {
        matches!(
            self.class,
            ConnectionClass::ExclusiveOwner | ConnectionClass::InputOnly
        ) && self.t_to_o.connection_type != ConnectionType::Null
    }

    pub fn is_multicast_producer(&self) -> bool {
        self.t_to_o.connection_type == ConnectionType::Multicast
    }

    /// Move to `next`, refusing transitions the state machine forbids
    pub fn transition(&mut self, next: ConnectionState) -> Result<()> {
        ensure(
            self.state.can_transition_to(next),
            FaultScope::Connection(self.triple),
            || format!("illegal transition {} -> {}", self.state, next),
        )?;
        self.state = next;
        Ok(())
    }

    /// Record activity and push the watchdog out
    pub fn refresh(&mut self, now: Instant) {
        self.last_activity = now;
        self.deadline = now + self.timeout();
    }
}

/// Connection manager statistics
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConnectionStats {
    pub opened: u64,
    pub closed: u64,
    pub timed_out: u64,
    pub rejected: u64,
    pub produced: u64,
    pub production_failures: u64,
    pub consumed: u64,
    pub duplicates: u64,
    pub active: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_machine_transitions() {
        use ConnectionState::*;
        assert!(Negotiating.can_transition_to(Established));
        assert!(Established.can_transition_to(TimedOut));
        assert!(Negotiating.can_transition_to(Closed));
        assert!(!Established.can_transition_to(Negotiating));
        for terminal in [TimedOut, Closed] {
            assert!(terminal.is_terminal());
            for next in [Negotiating, Established, TimedOut, Closed] {
                assert!(!terminal.can_transition_to(next));
            }
        }
    }

    #[test]
    fn test_transport_trigger_from_byte() {
        let t = TransportTrigger::from_byte(0x01);
        assert_eq!(t.class, 1);
        assert_eq!(t.trigger, ProductionTrigger::Cyclic);
        assert!(!t.server);

        let t = TransportTrigger::from_byte(0xA3);
        assert_eq!(t.class, 3);
        assert_eq!(t.trigger, ProductionTrigger::Application);
        assert!(t.server);

        assert!(!TransportTrigger::from_byte(0x00).has_sequence_count());
    }

    #[test]
    fn test_triple_display() {
        let triple = ConnectionTriple {
            connection_serial: 0x0042,
            originator_vendor_id: 0x1337,
            originator_serial: 0x1234_5678,
        };
        assert_eq!(triple.to_string(), "0042/1337/12345678");
    }
}
