//! Adapter façade
//!
//! Ties the session table, connection manager and buffer pool together
//! and supervises fatal faults. Every entry point takes `&mut self`; hosts
//! that serve several sockets share one adapter through [`SharedAdapter`].

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::buffer::{BufferPool, BufferPurpose, BufferStats};
use crate::config::Config;
use crate::connection::manager::SERVICE_FORWARD_CLOSE;
use crate::connection::{
    ConnectionClass, ConnectionManager, ConnectionStats, ConnectionTriple, ConsumeOutcome,
    ForwardCloseRequest, ForwardCloseResponse, ForwardOpenRequest, ForwardOpenResponse,
    TickReport,
};
use crate::error::{FaultScope, Result};
use crate::io::{AssemblyStore, FrameSink, MemoryAssemblies, ReplyEncoder};
use crate::session::{SessionHandle, SessionStats, SessionTable};
use crate::status::CipStatus;

/// Connection Manager service request
#[derive(Debug, Clone)]
pub enum CmRequest {
    ForwardOpen(ForwardOpenRequest),
    ForwardClose(ForwardCloseRequest),
}

impl CmRequest {
    pub fn service(&self) -> u8 {
        match self {
            CmRequest::ForwardOpen(request) => request.service(),
            CmRequest::ForwardClose(_) => SERVICE_FORWARD_CLOSE,
        }
    }

    pub fn triple(&self) -> ConnectionTriple {
        match self {
            CmRequest::ForwardOpen(request) => request.triple,
            CmRequest::ForwardClose(request) => request.triple,
        }
    }
}

/// What a Connection Manager request resulted in; the reply has been sent
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServiceOutcome {
    Opened(ForwardOpenResponse),
    Closed(ForwardCloseResponse),
    /// Rejected with the status sent to the originator
    Rejected(CipStatus),
}

/// Live and budgeted slots of one connection class
#[derive(Debug, Clone, Serialize)]
pub struct ClassUsage {
    pub class: ConnectionClass,
    pub active: usize,
    pub capacity: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct BufferUsage {
    pub purpose: BufferPurpose,
    pub free: usize,
    pub total: usize,
}

/// Point-in-time statistics
#[derive(Debug, Clone, Serialize)]
pub struct AdapterSnapshot {
    pub sessions: SessionStats,
    pub session_capacity: usize,
    pub connections: ConnectionStats,
    pub classes: Vec<ClassUsage>,
    pub buffers: BufferStats,
    pub buffer_usage: Vec<BufferUsage>,
    pub quarantined: u64,
}

pub struct Adapter<A: AssemblyStore = MemoryAssemblies> {
    config: Arc<Config>,
    sessions: SessionTable,
    connections: ConnectionManager<A>,
    buffers: BufferPool,
    quarantined: u64,
}

impl<A: AssemblyStore> Adapter<A> {
    /// Build an adapter, allocating every table and buffer up front
    pub fn new(config: Config, assemblies: A) -> Result<Self> {
        config.validate()?;
        let config = Arc::new(config);

        info!(
            "Initializing adapter \"{}\" (vendor={}, product={}, rev={}.{}, sessions={})",
            config.identity.device_name,
            config.identity.vendor_id,
            config.identity.product_code,
            config.identity.major_revision,
            config.identity.minor_revision,
            config.sessions.max_sessions
        );

        Ok(Self {
            sessions: SessionTable::new(&config.sessions),
            connections: ConnectionManager::new(Arc::clone(&config), assemblies),
            buffers: BufferPool::new(&config.buffers),
            config,
            quarantined: 0,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn buffers(&self) -> &BufferPool {
        &self.buffers
    }

    pub fn sessions(&self) -> &SessionTable {
        &self.sessions
    }

    pub fn connections(&self) -> &ConnectionManager<A> {
        &self.connections
    }

    pub fn assemblies(&self) -> &A {
        self.connections.assemblies()
    }

    pub fn assemblies_mut(&mut self) -> &mut A {
        self.connections.assemblies_mut()
    }

    /// RegisterSession
    pub fn register_session(
        &mut self,
        originator: SocketAddr,
        version: u16,
        options: u16,
        now: Instant,
    ) -> Result<SessionHandle> {
        let result = self.sessions.register(originator, version, options, now);
        self.supervise(result)
    }

    /// UnregisterSession; returns the connections closed or detached
    pub fn unregister_session(&mut self, handle: SessionHandle) -> Result<Vec<ConnectionTriple>> {
        self.sessions.unregister(handle)?;
        let result = self
            .connections
            .on_session_closed(handle, self.config.sessions.teardown_policy);
        self.supervise(result)
    }

    /// The transport to an originator went away; its sessions end
    pub fn transport_closed(&mut self, originator: SocketAddr) -> Result<Vec<ConnectionTriple>> {
        let policy = self.config.sessions.teardown_policy;
        let mut affected = Vec::new();
        for handle in self.sessions.close_originator(originator) {
            let result = self.connections.on_session_closed(handle, policy);
            affected.extend(self.supervise(result)?);
        }
        Ok(affected)
    }

    /// Serve one Forward_Open / Forward_Close received on `session`.
    ///
    /// Connection Manager rejections are encoded and sent like successes
    /// and come back as [`ServiceOutcome::Rejected`]. Unknown sessions,
    /// an exhausted reply pool, encoder or transport failures and fatal
    /// faults are returned as errors; a connection opened by a request
    /// whose reply could not be sent is closed again.
    pub fn handle_request(
        &mut self,
        originator: SocketAddr,
        session: SessionHandle,
        request: &CmRequest,
        now: Instant,
        encoder: &dyn ReplyEncoder,
        sink: &mut dyn FrameSink,
    ) -> Result<ServiceOutcome> {
        self.sessions.touch(session, now)?;
        let mut lease = self.buffers.acquire(BufferPurpose::Reply)?;

        let result = match request {
            CmRequest::ForwardOpen(open) => self
                .connections
                .forward_open(Some(session), originator, open, now)
                .map(ServiceOutcome::Opened),
            CmRequest::ForwardClose(close) => self
                .connections
                .forward_close(close)
                .map(ServiceOutcome::Closed),
        };
        let outcome = match self.supervise(result) {
            Ok(outcome) => outcome,
            Err(e) if e.is_fatal() => return Err(e),
            Err(e) => ServiceOutcome::Rejected(e.cip_status()),
        };

        let sent = match &outcome {
            ServiceOutcome::Opened(response) => encoder.encode_forward_open(response, &mut lease),
            ServiceOutcome::Closed(response) => encoder.encode_forward_close(response, &mut lease),
            ServiceOutcome::Rejected(status) => {
                encoder.encode_error(request.service(), *status, &mut lease)
            }
        }
        .and_then(|_| sink.send_reply(originator, lease.as_slice()));

        if let Err(e) = sent {
            warn!("Reply to {} for {} failed: {}", originator, request.triple(), e);
            if let ServiceOutcome::Opened(response) = &outcome {
                let close = ForwardCloseRequest {
                    triple: response.triple,
                };
                let result = self.connections.forward_close(&close).map(|_| ());
                self.supervise(result)?;
            }
            return Err(e);
        }

        debug!(
            "Service 0x{:02X} for {} from {}: {:?}",
            request.service(),
            request.triple(),
            originator,
            outcome
        );
        Ok(outcome)
    }

    /// Consume a class 0/1 packet
    pub fn on_io_data(
        &mut self,
        connection_id: u32,
        payload: &[u8],
        now: Instant,
    ) -> Result<ConsumeOutcome> {
        let result = self.connections.on_io_data(connection_id, payload, now);
        self.supervise(result)
    }

    /// Class 3 traffic on an explicit connection
    pub fn on_explicit_message(
        &mut self,
        session: SessionHandle,
        connection_id: u32,
        now: Instant,
    ) -> Result<()> {
        self.sessions.touch(session, now)?;
        let result = self.connections.on_explicit_message(connection_id, now);
        self.supervise(result)
    }

    /// One timer tick: expire idle sessions, then run the connection scan
    pub fn on_tick(&mut self, now: Instant, sink: &mut dyn FrameSink) -> Result<TickReport> {
        let policy = self.config.sessions.teardown_policy;
        let expired = self.sessions.expire(now);

        let mut session_connections = Vec::new();
        for handle in &expired {
            let result = self.connections.on_session_closed(*handle, policy);
            session_connections.extend(self.supervise(result)?);
        }

        let result = self.connections.on_tick(now, &self.buffers, sink);
        let mut report = self.supervise(result)?;
        report.expired_sessions = expired;
        report.session_connections = session_connections;
        Ok(report)
    }

    /// Isolate a fault: drop the session (and its connections), the
    /// connection, or everything.
    pub fn quarantine(&mut self, scope: FaultScope) {
        self.quarantined += 1;
        match scope {
            FaultScope::Session(handle) => {
                if self.sessions.unregister(handle).is_err() {
                    debug!("Session {} already gone", handle);
                }
                for triple in self.connections.owned_by(handle) {
                    self.connections.quarantine(&triple);
                }
            }
            FaultScope::Connection(triple) => {
                self.connections.quarantine(&triple);
            }
            FaultScope::Adapter => {
                self.connections.reset();
                self.sessions.clear();
            }
        }
        error!("Quarantined {}", scope);
    }

    /// Pass `result` through, quarantining the fault scope of fatal errors
    fn supervise<T>(&mut self, result: Result<T>) -> Result<T> {
        if let Err(e) = &result {
            if let Some(scope) = e.fault_scope() {
                error!("Fatal fault: {}", e);
                self.quarantine(scope);
            }
        }
        result
    }

    pub fn snapshot(&self) -> AdapterSnapshot {
        let limits = &self.config.connections;
        let availability = self.buffers.availability();

        AdapterSnapshot {
            sessions: self.sessions.stats(),
            session_capacity: self.sessions.capacity(),
            connections: self.connections.stats(),
            classes: ConnectionClass::ALL
                .iter()
                .map(|&class| ClassUsage {
                    class,
                    active: self.connections.count(class),
                    capacity: limits.capacity(class),
                })
                .collect(),
            buffers: self.buffers.stats(),
            buffer_usage: BufferPurpose::ALL
                .iter()
                .map(|&purpose| BufferUsage {
                    purpose,
                    free: availability.free(purpose),
                    total: availability.total(purpose),
                })
                .collect(),
            quarantined: self.quarantined,
        }
    }
}

/// Adapter shared between socket tasks and the tick scheduler
pub struct SharedAdapter<A: AssemblyStore = MemoryAssemblies> {
    inner: Arc<Mutex<Adapter<A>>>,
}

impl<A: AssemblyStore> SharedAdapter<A> {
    pub fn new(adapter: Adapter<A>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(adapter)),
        }
    }

    pub async fn register_session(
        &self,
        originator: SocketAddr,
        version: u16,
        options: u16,
    ) -> Result<SessionHandle> {
        let mut adapter = self.inner.lock().await;
        adapter.register_session(originator, version, options, clock_now())
    }

    pub async fn unregister_session(&self, handle: SessionHandle) -> Result<Vec<ConnectionTriple>> {
        let mut adapter = self.inner.lock().await;
        adapter.unregister_session(handle)
    }

    pub async fn transport_closed(&self, originator: SocketAddr) -> Result<Vec<ConnectionTriple>> {
        let mut adapter = self.inner.lock().await;
        adapter.transport_closed(originator)
    }

    pub async fn handle_request(
        &self,
        originator: SocketAddr,
        session: SessionHandle,
        request: &CmRequest,
        encoder: &(dyn ReplyEncoder + Sync),
        sink: &mut (dyn FrameSink + Send),
    ) -> Result<ServiceOutcome> {
        let mut adapter = self.inner.lock().await;
        adapter.handle_request(originator, session, request, clock_now(), encoder, sink)
    }

    pub async fn on_io_data(&self, connection_id: u32, payload: &[u8]) -> Result<ConsumeOutcome> {
        let mut adapter = self.inner.lock().await;
        adapter.on_io_data(connection_id, payload, clock_now())
    }

    pub async fn on_tick(&self, now: Instant, sink: &mut (dyn FrameSink + Send)) -> Result<TickReport> {
        let mut adapter = self.inner.lock().await;
        adapter.on_tick(now, sink)
    }

    pub async fn snapshot(&self) -> AdapterSnapshot {
        let adapter = self.inner.lock().await;
        adapter.snapshot()
    }

    pub fn clone_inner(&self) -> Arc<Mutex<Adapter<A>>> {
        self.inner.clone()
    }
}

impl<A: AssemblyStore> Clone for SharedAdapter<A> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

// Tokio clock, so paused time applies
fn clock_now() -> Instant {
    tokio::time::Instant::now().into_std()
}
