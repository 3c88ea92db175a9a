//! CIP and encapsulation status codes
//!
//! Codes surfaced to originators when a request is rejected. General
//! status values are the CIP common ones, extended values are the
//! Connection Manager object's.

use serde::Serialize;

/// CIP general status codes
pub mod general {
    pub const SUCCESS: u8 = 0x00;
    pub const CONNECTION_FAILURE: u8 = 0x01;
    pub const RESOURCE_UNAVAILABLE: u8 = 0x02;
    pub const INVALID_PARAMETER_VALUE: u8 = 0x03;
    pub const PATH_SEGMENT_ERROR: u8 = 0x04;
    pub const PATH_DESTINATION_UNKNOWN: u8 = 0x05;
    pub const SERVICE_NOT_SUPPORTED: u8 = 0x08;
    pub const DEVICE_STATE_CONFLICT: u8 = 0x10;
    pub const NOT_ENOUGH_DATA: u8 = 0x13;
    pub const TOO_MUCH_DATA: u8 = 0x15;
}

/// Connection Manager extended status codes
pub mod extended {
    pub const CONNECTION_IN_USE: u16 = 0x0100;
    pub const TRANSPORT_CLASS_NOT_SUPPORTED: u16 = 0x0103;
    pub const OWNERSHIP_CONFLICT: u16 = 0x0106;
    pub const CONNECTION_NOT_FOUND: u16 = 0x0107;
    pub const INVALID_NETWORK_CONNECTION_PARAMETER: u16 = 0x0108;
    pub const INVALID_CONNECTION_SIZE: u16 = 0x0109;
    pub const RPI_NOT_SUPPORTED: u16 = 0x0111;
    pub const OUT_OF_CONNECTIONS: u16 = 0x0113;
    pub const VENDOR_OR_PRODUCT_CODE_MISMATCH: u16 = 0x0114;
    pub const DEVICE_TYPE_MISMATCH: u16 = 0x0115;
    pub const REVISION_MISMATCH: u16 = 0x0116;
    pub const NON_LISTEN_ONLY_CONNECTION_NOT_OPENED: u16 = 0x0119;
    pub const INVALID_O_TO_T_SIZE: u16 = 0x0127;
    pub const INVALID_T_TO_O_SIZE: u16 = 0x0128;
    pub const INVALID_SEGMENT_IN_PATH: u16 = 0x0315;
}

/// Encapsulation header status codes
pub mod encapsulation {
    pub const SUCCESS: u32 = 0x0000;
    pub const INVALID_COMMAND: u32 = 0x0001;
    pub const INSUFFICIENT_MEMORY: u32 = 0x0002;
    pub const INCORRECT_DATA: u32 = 0x0003;
    pub const INVALID_SESSION_HANDLE: u32 = 0x0064;
    pub const INVALID_LENGTH: u32 = 0x0065;
    pub const UNSUPPORTED_PROTOCOL: u32 = 0x0069;
}

/// Status of a CIP service reply
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct CipStatus {
    /// General status
    pub general: u8,
    /// Extended status, present for Connection Manager failures
    pub extended: Option<u16>,
}

impl CipStatus {
    pub const SUCCESS: CipStatus = CipStatus {
        general: general::SUCCESS,
        extended: None,
    };

    pub fn new(general: u8, extended: Option<u16>) -> Self {
        Self { general, extended }
    }

    /// Connection failure (0x01) with a Connection Manager extended code
    pub fn connection_failure(extended: u16) -> Self {
        Self::new(general::CONNECTION_FAILURE, Some(extended))
    }

    pub fn is_success(&self) -> bool {
        self.general == general::SUCCESS
    }
}

impl std::fmt::Display for CipStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.extended {
            Some(ext) => write!(f, "0x{:02X}/0x{:04X}", self.general, ext),
            None => write!(f, "0x{:02X}", self.general),
        }
    }
}
