use thiserror::Error;

use crate::buffer::BufferPurpose;
use crate::connection::{ConnectionClass, ConnectionTriple};
use crate::session::SessionHandle;
use crate::status::{encapsulation, extended, general, CipStatus};

/// Which table budget was exhausted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resource {
    /// Encapsulation session slots
    Sessions,
    /// Connection slots of one class
    Connections(ConnectionClass),
    /// Consumers sharing one connection path
    PathConsumers(ConnectionClass),
}

impl std::fmt::Display for Resource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Resource::Sessions => write!(f, "session table full"),
            Resource::Connections(class) => write!(f, "no free {} connection slot", class),
            Resource::PathConsumers(class) => {
                write!(f, "per-path {} consumer limit reached", class)
            }
        }
    }
}

/// What a fatal fault is confined to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultScope {
    Session(SessionHandle),
    Connection(ConnectionTriple),
    Adapter,
}

impl std::fmt::Display for FaultScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FaultScope::Session(handle) => write!(f, "session {}", handle),
            FaultScope::Connection(triple) => write!(f, "connection {}", triple),
            FaultScope::Adapter => write!(f, "adapter"),
        }
    }
}

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("resource unavailable: {0}")]
    ResourceUnavailable(Resource),

    #[error("invalid connection path: {0}")]
    InvalidConnectionPath(String),

    #[error("invalid connection parameters: {reason}")]
    InvalidParameters { reason: String, extended: u16 },

    #[error("connection in use: {existing} (ownership conflict: {ownership})")]
    ConnectionInUse {
        existing: ConnectionTriple,
        ownership: bool,
    },

    #[error("connection not found: {0}")]
    ConnectionNotFound(ConnectionTriple),

    #[error("session not found: {0}")]
    SessionNotFound(SessionHandle),

    #[error("no free {0} buffer")]
    BufferExhausted(BufferPurpose),

    #[error("unsupported encapsulation protocol version {version} (options 0x{options:04X})")]
    UnsupportedProtocol { version: u16, options: u16 },

    #[error("electronic key mismatch: {reason}")]
    ElectronicKeyMismatch { reason: String, extended: u16 },

    #[error("no producing connection for listen-only path (T->O assembly {0})")]
    NoProducingConnection(u32),

    #[error("malformed I/O data on connection 0x{connection_id:08X}: expected {expected} bytes, got {got}")]
    MalformedIoData {
        connection_id: u32,
        expected: usize,
        got: usize,
    },

    #[error("unknown connection id 0x{0:08X}")]
    UnknownConnectionId(u32),

    #[error("buffer overflow: capacity {capacity}, requested {requested}")]
    BufferOverflow { capacity: usize, requested: usize },

    #[error("assembly error: {0}")]
    Assembly(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("encoding error: {0}")]
    Encoding(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invariant violated in {scope}: {what}")]
    InvariantViolation { scope: FaultScope, what: String },
}

pub type Result<T> = std::result::Result<T, AdapterError>;

impl AdapterError {
    /// Status reported to the originator in a Connection Manager reply
    pub fn cip_status(&self) -> CipStatus {
        match self {
            AdapterError::ResourceUnavailable(Resource::Sessions) => {
                CipStatus::new(general::RESOURCE_UNAVAILABLE, None)
            }
            AdapterError::ResourceUnavailable(_) => {
                CipStatus::connection_failure(extended::OUT_OF_CONNECTIONS)
            }
            AdapterError::InvalidConnectionPath(_) => {
                CipStatus::connection_failure(extended::INVALID_SEGMENT_IN_PATH)
            }
            AdapterError::InvalidParameters { extended, .. }
            | AdapterError::ElectronicKeyMismatch { extended, .. } => {
                CipStatus::connection_failure(*extended)
            }
            AdapterError::ConnectionInUse { ownership, .. } => {
                CipStatus::connection_failure(if *ownership {
                    extended::OWNERSHIP_CONFLICT
                } else {
                    extended::CONNECTION_IN_USE
                })
            }
            AdapterError::ConnectionNotFound(_) => {
                CipStatus::connection_failure(extended::CONNECTION_NOT_FOUND)
            }
            AdapterError::NoProducingConnection(_) => {
                CipStatus::connection_failure(extended::NON_LISTEN_ONLY_CONNECTION_NOT_OPENED)
            }
            AdapterError::BufferExhausted(_) | AdapterError::BufferOverflow { .. } => {
                CipStatus::new(general::RESOURCE_UNAVAILABLE, None)
            }
            AdapterError::MalformedIoData { expected, got, .. } => {
                if got < expected {
                    CipStatus::new(general::NOT_ENOUGH_DATA, None)
                } else {
                    CipStatus::new(general::TOO_MUCH_DATA, None)
                }
            }
            AdapterError::UnknownConnectionId(_) => {
                CipStatus::new(general::PATH_DESTINATION_UNKNOWN, None)
            }
            _ => CipStatus::new(general::DEVICE_STATE_CONFLICT, None),
        }
    }

    /// Status reported in the encapsulation header for session-level failures
    pub fn encapsulation_status(&self) -> u32 {
        match self {
            AdapterError::SessionNotFound(_) => encapsulation::INVALID_SESSION_HANDLE,
            AdapterError::UnsupportedProtocol { .. } => encapsulation::UNSUPPORTED_PROTOCOL,
            AdapterError::ResourceUnavailable(_) | AdapterError::BufferExhausted(_) => {
                encapsulation::INSUFFICIENT_MEMORY
            }
            AdapterError::BufferOverflow { .. } => encapsulation::INVALID_LENGTH,
            _ => encapsulation::INCORRECT_DATA,
        }
    }

    /// Fatal errors are invariant violations; everything else is answered
    /// to the originator and the adapter keeps running.
    pub fn is_fatal(&self) -> bool {
        matches!(self, AdapterError::InvariantViolation { .. })
    }

    pub fn fault_scope(&self) -> Option<FaultScope> {
        match self {
            AdapterError::InvariantViolation { scope, .. } => Some(*scope),
            _ => None,
        }
    }

    pub(crate) fn invalid_parameters(extended: u16, reason: impl Into<String>) -> Self {
        AdapterError::InvalidParameters {
            reason: reason.into(),
            extended,
        }
    }
}

/// Check an internal invariant, turning a violation into a fatal error
pub(crate) fn ensure(condition: bool, scope: FaultScope, what: impl FnOnce() -> String) -> Result<()> {
    if condition {
        Ok(())
    } else {
        Err(AdapterError::InvariantViolation {
            scope,
            what: what(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn triple() -> ConnectionTriple {
        ConnectionTriple {
            connection_serial: 7,
            originator_vendor_id: 0x1337,
            originator_serial: 0x1234_5678,
        }
    }

    #[test]
    fn test_cip_status_mapping() {
        let err = AdapterError::ResourceUnavailable(Resource::Connections(
            ConnectionClass::ExclusiveOwner,
        ));
        assert_eq!(
            err.cip_status(),
            CipStatus::connection_failure(extended::OUT_OF_CONNECTIONS)
        );

        let err = AdapterError::ConnectionInUse {
            existing: triple(),
            ownership: true,
        };
        assert_eq!(err.cip_status().extended, Some(extended::OWNERSHIP_CONFLICT));

        let err = AdapterError::ConnectionNotFound(triple());
        assert_eq!(err.cip_status().extended, Some(extended::CONNECTION_NOT_FOUND));
    }

    #[test]
    fn test_encapsulation_status_mapping() {
        let err = AdapterError::SessionNotFound(SessionHandle::new(3));
        assert_eq!(err.encapsulation_status(), encapsulation::INVALID_SESSION_HANDLE);

        let err = AdapterError::UnsupportedProtocol {
            version: 2,
            options: 0,
        };
        assert_eq!(err.encapsulation_status(), encapsulation::UNSUPPORTED_PROTOCOL);
    }

    #[test]
    fn test_ensure_is_fatal() {
        assert!(ensure(true, FaultScope::Adapter, || "unused".into()).is_ok());

        let err = ensure(false, FaultScope::Connection(triple()), || {
            "slot accounting drifted".into()
        })
        .unwrap_err();
        assert!(err.is_fatal());
        assert_eq!(err.fault_scope(), Some(FaultScope::Connection(triple())));
        assert!(!AdapterError::BufferExhausted(BufferPurpose::Reply).is_fatal());
    }
}
