//! EtherNet/IP adapter connection and session management
//!
//! Sessions, CIP connections (exclusive-owner, input-only, listen-only and
//! explicit), the Forward_Open / Forward_Close admission rules, the
//! per-tick watchdog and production scan, and the fixed buffer pool the
//! adapter works from. Wire decoding, sockets and assembly data live
//! outside this crate and plug in through the traits in [`io`].
//!
//! # Example
//!
//! ```ignore
//! use enip_adapter::{Adapter, CmRequest, Config, MemoryAssemblies};
//! use enip_adapter::io::CipReplyEncoder;
//!
//! let mut adapter = Adapter::new(Config::default(), assemblies)?;
//! let session = adapter.register_session(peer, 1, 0, Instant::now())?;
//! let outcome = adapter.handle_request(
//!     peer,
//!     session,
//!     &CmRequest::ForwardOpen(request),
//!     Instant::now(),
//!     &CipReplyEncoder,
//!     &mut transport,
//! )?;
//! ```

pub mod adapter;
pub mod buffer;
pub mod config;
pub mod connection;
pub mod error;
pub mod io;
pub mod scheduler;
pub mod session;
pub mod status;

pub use adapter::{Adapter, AdapterSnapshot, CmRequest, ServiceOutcome, SharedAdapter};
pub use buffer::{BufferLease, BufferPool, BufferPurpose};
pub use config::{Config, TeardownPolicy};
pub use connection::{
    ConnectionClass, ConnectionManager, ConnectionState, ConnectionTriple, ForwardCloseRequest,
    ForwardOpenRequest, ForwardOpenResponse,
};
pub use error::{AdapterError, FaultScope, Result};
pub use io::{AssemblyStore, FrameSink, MemoryAssemblies, ReplyEncoder};
pub use scheduler::TickScheduler;
pub use session::{SessionHandle, SessionTable};
pub use status::CipStatus;
