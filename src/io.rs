//! Collaborator interfaces
//!
//! The adapter core does not own sockets, CIP encoders or assembly data.
//! Hosts plug them in through these traits.

use std::collections::HashMap;
use std::net::SocketAddr;

use crate::buffer::BufferLease;
use crate::connection::manager::SERVICE_FORWARD_CLOSE;
use crate::connection::{ConnectionTriple, ForwardCloseResponse, ForwardOpenResponse};
use crate::error::{AdapterError, Result};
use crate::status::CipStatus;

/// Run/idle header word: bit 0 set means the producer is running
pub const RUN_IDLE_RUN: u32 = 0x0000_0001;

/// Assembly object storage
pub trait AssemblyStore: Send {
    /// Data size of an assembly instance, `None` if it does not exist
    fn size_of(&self, instance: u32) -> Option<usize>;

    /// Copy the current data of `instance` into `out`, returning the length
    fn read(&mut self, instance: u32, out: &mut [u8]) -> Result<usize>;

    /// Store consumed data into `instance`
    fn write(&mut self, instance: u32, data: &[u8]) -> Result<()>;

    /// Run/idle state reported by the originator of `instance`'s data
    fn on_run_idle(&mut self, _instance: u32, _run: bool) {}

    /// Run/idle header to prepend to produced data
    fn run_idle_header(&self, _instance: u32) -> u32 {
        RUN_IDLE_RUN
    }
}

/// Where a produced packet goes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProductionTarget {
    Unicast(SocketAddr),
    Multicast,
}

/// One cyclic packet ready to be sent
#[derive(Debug)]
pub struct ProducedFrame<'a> {
    /// T->O connection ID
    pub connection_id: u32,
    /// Encapsulation sequence number
    pub sequence: u32,
    pub target: ProductionTarget,
    /// Sequence count, run/idle header and assembly data
    pub payload: &'a [u8],
}

/// Transport collaborator
pub trait FrameSink: Send {
    /// Send an explicit reply to an originator
    fn send_reply(&mut self, originator: SocketAddr, frame: &[u8]) -> Result<()>;

    /// Send cyclic I/O data
    fn send_produced(&mut self, frame: &ProducedFrame<'_>) -> Result<()>;
}

/// CIP encoding collaborator; each method writes one reply into `out`
/// and returns the number of bytes written.
pub trait ReplyEncoder {
    fn encode_forward_open(
        &self,
        response: &ForwardOpenResponse,
        out: &mut BufferLease,
    ) -> Result<usize>;

    fn encode_forward_close(
        &self,
        response: &ForwardCloseResponse,
        out: &mut BufferLease,
    ) -> Result<usize>;

    fn encode_error(&self, service: u8, status: CipStatus, out: &mut BufferLease)
        -> Result<usize>;
}

/// Reply bit of a CIP service code
pub const REPLY_SERVICE: u8 = 0x80;

/// Encodes Connection Manager replies in the Message Router response
/// layout (service, reserved, general status, additional status words,
/// reply data).
#[derive(Debug, Default, Clone, Copy)]
pub struct CipReplyEncoder;

impl CipReplyEncoder {
    fn header(service: u8, status: CipStatus, out: &mut BufferLease) -> Result<()> {
        out.extend_from_slice(&[service | REPLY_SERVICE, 0, status.general])?;
        match status.extended {
            Some(ext) => {
                out.extend_from_slice(&[1])?;
                out.extend_from_slice(&ext.to_le_bytes())
            }
            None => out.extend_from_slice(&[0]),
        }
    }

    fn triple(triple: &ConnectionTriple, out: &mut BufferLease) -> Result<()> {
        out.extend_from_slice(&triple.connection_serial.to_le_bytes())?;
        out.extend_from_slice(&triple.originator_vendor_id.to_le_bytes())?;
        out.extend_from_slice(&triple.originator_serial.to_le_bytes())
    }
}

impl ReplyEncoder for CipReplyEncoder {
    fn encode_forward_open(
        &self,
        response: &ForwardOpenResponse,
        out: &mut BufferLease,
    ) -> Result<usize> {
        let start = out.len();
        Self::header(response.service, CipStatus::SUCCESS, out)?;
        out.extend_from_slice(&response.o_to_t_connection_id.to_le_bytes())?;
        out.extend_from_slice(&response.t_to_o_connection_id.to_le_bytes())?;
        Self::triple(&response.triple, out)?;
        out.extend_from_slice(&response.o_to_t_api_us.to_le_bytes())?;
        out.extend_from_slice(&response.t_to_o_api_us.to_le_bytes())?;
        // No application reply
        out.extend_from_slice(&[0, 0])?;
        Ok(out.len() - start)
    }

    fn encode_forward_close(
        &self,
        response: &ForwardCloseResponse,
        out: &mut BufferLease,
    ) -> Result<usize> {
        let start = out.len();
        Self::header(SERVICE_FORWARD_CLOSE, CipStatus::SUCCESS, out)?;
        Self::triple(&response.triple, out)?;
        out.extend_from_slice(&[0, 0])?;
        Ok(out.len() - start)
    }

    fn encode_error(
        &self,
        service: u8,
        status: CipStatus,
        out: &mut BufferLease,
    ) -> Result<usize> {
        let start = out.len();
        Self::header(service, status, out)?;
        Ok(out.len() - start)
    }
}

/// Assembly store keeping every instance in memory
#[derive(Debug, Default, Clone)]
pub struct MemoryAssemblies {
    instances: HashMap<u32, Vec<u8>>,
    running: HashMap<u32, bool>,
}

impl MemoryAssemblies {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an instance of `size` zero bytes
    pub fn insert(&mut self, instance: u32, size: usize) {
        self.instances.insert(instance, vec![0; size]);
    }

    /// Replace the data of an existing instance
    pub fn set(&mut self, instance: u32, data: &[u8]) -> Result<()> {
        self.write(instance, data)
    }

    pub fn data(&self, instance: u32) -> Option<&[u8]> {
        self.instances.get(&instance).map(Vec::as_slice)
    }

    /// Last run/idle state seen for an instance
    pub fn is_running(&self, instance: u32) -> Option<bool> {
        self.running.get(&instance).copied()
    }
}

impl AssemblyStore for MemoryAssemblies {
    fn size_of(&self, instance: u32) -> Option<usize> {
        self.instances.get(&instance).map(Vec::len)
    }

    fn read(&mut self, instance: u32, out: &mut [u8]) -> Result<usize> {
        let data = self
            .instances
            .get(&instance)
            .ok_or_else(|| AdapterError::Assembly(format!("no assembly {}", instance)))?;
        if data.len() > out.len() {
            return Err(AdapterError::BufferOverflow {
                capacity: out.len(),
                requested: data.len(),
            });
        }
        out[..data.len()].copy_from_slice(data);
        Ok(data.len())
    }

    fn write(&mut self, instance: u32, data: &[u8]) -> Result<()> {
        let slot = self
            .instances
            .get_mut(&instance)
            .ok_or_else(|| AdapterError::Assembly(format!("no assembly {}", instance)))?;
        if slot.len() != data.len() {
            return Err(AdapterError::Assembly(format!(
                "assembly {} holds {} bytes, got {}",
                instance,
                slot.len(),
                data.len()
            )));
        }
        slot.copy_from_slice(data);
        Ok(())
    }

    fn on_run_idle(&mut self, instance: u32, run: bool) {
        self.running.insert(instance, run);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::{BufferPool, BufferPurpose};
    use crate::config::BufferConfig;
    use crate::connection::manager::SERVICE_FORWARD_OPEN;
    use crate::connection::ConnectionClass;

    #[test]
    fn test_memory_assemblies() {
        let mut store = MemoryAssemblies::new();
        store.insert(100, 4);
        assert_eq!(store.size_of(100), Some(4));
        assert_eq!(store.size_of(101), None);

        store.set(100, &[1, 2, 3, 4]).unwrap();
        let mut out = [0u8; 8];
        assert_eq!(store.read(100, &mut out).unwrap(), 4);
        assert_eq!(&out[..4], &[1, 2, 3, 4]);

        assert!(store.write(100, &[1, 2]).is_err());
        assert!(store.read(101, &mut out).is_err());

        let mut small = [0u8; 2];
        assert!(matches!(
            store.read(100, &mut small),
            Err(AdapterError::BufferOverflow { .. })
        ));
    }

    #[test]
    fn test_cip_reply_layout() {
        let pool = BufferPool::new(&BufferConfig::default());
        let triple = ConnectionTriple {
            connection_serial: 0x0102,
            originator_vendor_id: 0x0304,
            originator_serial: 0x0506_0708,
        };

        let mut out = pool.acquire(BufferPurpose::Reply).unwrap();
        let response = ForwardOpenResponse {
            service: SERVICE_FORWARD_OPEN,
            triple,
            class: ConnectionClass::ExclusiveOwner,
            o_to_t_connection_id: 0x1111_2222,
            t_to_o_connection_id: 0x3333_4444,
            o_to_t_api_us: 10_000,
            t_to_o_api_us: 20_000,
        };
        let n = CipReplyEncoder.encode_forward_open(&response, &mut out).unwrap();
        assert_eq!(n, 4 + 8 + 8 + 8 + 2);
        assert_eq!(&out.as_slice()[..4], &[0xD4, 0, 0, 0]);
        assert_eq!(&out.as_slice()[4..8], &0x1111_2222u32.to_le_bytes());
        assert_eq!(&out.as_slice()[12..14], &[0x02, 0x01]);
        drop(out);

        let mut out = pool.acquire(BufferPurpose::Reply).unwrap();
        let status = CipStatus::connection_failure(0x0100);
        let n = CipReplyEncoder
            .encode_error(SERVICE_FORWARD_OPEN, status, &mut out)
            .unwrap();
        assert_eq!(n, 6);
        assert_eq!(out.as_slice(), &[0xD4, 0, 0x01, 1, 0x00, 0x01]);
    }
}
