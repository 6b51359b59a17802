//! Fiber Transport Boundary
//!
//! The core never opens sockets itself. It consumes a [`Transport`] that
//! delivers encoded envelopes to whichever process hosts the target address,
//! and receives inbound bytes through `Fiber::on_receive`.
//!
//! [`LocalNetwork`] is the in-process implementation: one unbounded channel
//! per process id. It backs same-process deployments and every test in the
//! workspace. Detaching a process, or finding its inbound channel closed, is
//! published on [`Transport::disconnects`].

use crate::codec::EnvelopeCodec;
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use strand_types::{ActorId, CoreError, Envelope, Result};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, trace, warn};

/// Delivers bytes to the process hosting `target`
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    async fn send(&self, target: ActorId, bytes: Bytes) -> Result<()>;

    /// Stream of process ids the transport has lost, if it can tell
    fn disconnects(&self) -> Option<broadcast::Receiver<u16>> {
        None
    }
}

/// Bytes received from another fiber
#[derive(Debug, Clone)]
pub struct Inbound {
    /// Routing address of the sending fiber
    pub from: ActorId,
    pub bytes: Bytes,
}

/// Routing address of the fiber hosted by `process`
pub const fn process_address(process: u16) -> ActorId {
    ActorId::new(process, 0, 0)
}

/// Transport counters
#[derive(Debug, Default)]
pub struct TransportMetrics {
    pub sends: AtomicU64,
    pub bytes_sent: AtomicU64,
    pub failed_sends: AtomicU64,
}

impl TransportMetrics {
    pub fn record_send(&self, bytes: usize) {
        self.sends.fetch_add(1, Ordering::Relaxed);
        self.bytes_sent.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn record_failure(&self) {
        self.failed_sends.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get_stats(&self) -> TransportStats {
        TransportStats {
            sends: self.sends.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            failed_sends: self.failed_sends.load(Ordering::Relaxed),
        }
    }
}

/// Transport statistics snapshot
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportStats {
    pub sends: u64,
    pub bytes_sent: u64,
    pub failed_sends: u64,
}

const DISCONNECT_BACKLOG: usize = 64;

/// In-process router keyed by process id
#[derive(Debug)]
pub struct LocalNetwork {
    routes: Mutex<HashMap<u16, mpsc::UnboundedSender<Inbound>>>,
    disconnects: broadcast::Sender<u16>,
    metrics: TransportMetrics,
}

impl Default for LocalNetwork {
    fn default() -> Self {
        let (disconnects, _) = broadcast::channel(DISCONNECT_BACKLOG);
        Self {
            routes: Mutex::new(HashMap::new()),
            disconnects,
            metrics: TransportMetrics::default(),
        }
    }
}

impl LocalNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register `process` and return its transport plus inbound stream
    pub fn attach(
        self: &Arc<Self>,
        process: u16,
    ) -> Result<(LocalTransport, mpsc::UnboundedReceiver<Inbound>)> {
        let mut routes = self.routes.lock();
        if routes.contains_key(&process) {
            return Err(CoreError::configuration(
                format!("process {} already attached to local network", process),
                Some("process.id"),
            ));
        }
        let (tx, rx) = mpsc::unbounded_channel();
        routes.insert(process, tx);
        debug!(process = process, "Process attached to local network");

        Ok((
            LocalTransport {
                network: Arc::clone(self),
                from: process_address(process),
            },
            rx,
        ))
    }

    /// Remove a process; later sends to it fail
    pub fn detach(&self, process: u16) -> bool {
        let removed = self.routes.lock().remove(&process).is_some();
        if removed {
            debug!(process = process, "Process detached from local network");
            self.publish_disconnect(process);
        }
        removed
    }

    /// Receiver of processes detached from now on
    pub fn subscribe_disconnects(&self) -> broadcast::Receiver<u16> {
        self.disconnects.subscribe()
    }

    fn publish_disconnect(&self, process: u16) {
        // No subscribers is fine
        let _ = self.disconnects.send(process);
    }

    pub fn is_attached(&self, process: u16) -> bool {
        self.routes.lock().contains_key(&process)
    }

    pub fn metrics(&self) -> &TransportMetrics {
        &self.metrics
    }

    fn route(&self, from: ActorId, target: ActorId, bytes: Bytes) -> Result<()> {
        let process = target.process();
        let sender = self.routes.lock().get(&process).cloned();
        let Some(sender) = sender else {
            self.metrics.record_failure();
            return Err(CoreError::transport(
                format!("no route to process {}", process),
                Some(target),
            ));
        };

        let size = bytes.len();
        if sender.send(Inbound { from, bytes }).is_err() {
            self.metrics.record_failure();
            warn!(process = process, "Inbound channel closed, dropping route");
            if self.routes.lock().remove(&process).is_some() {
                self.publish_disconnect(process);
            }
            return Err(CoreError::transport(
                format!("process {} stopped receiving", process),
                Some(target),
            ));
        }

        self.metrics.record_send(size);
        trace!(%target, bytes = size, "Routed envelope");
        Ok(())
    }
}

/// Sending half handed to one fiber
#[derive(Debug, Clone)]
pub struct LocalTransport {
    network: Arc<LocalNetwork>,
    from: ActorId,
}

#[async_trait]
impl Transport for LocalTransport {
    async fn send(&self, target: ActorId, bytes: Bytes) -> Result<()> {
        self.network.route(self.from, target, bytes)
    }

    fn disconnects(&self) -> Option<broadcast::Receiver<u16>> {
        Some(self.network.subscribe_disconnects())
    }
}

/// Encodes envelopes and hands them to the transport
#[derive(Clone)]
pub struct Outbound {
    transport: Arc<dyn Transport>,
    codec: Arc<dyn EnvelopeCodec>,
}

impl std::fmt::Debug for Outbound {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Outbound").finish_non_exhaustive()
    }
}

impl Outbound {
    pub fn new(transport: Arc<dyn Transport>, codec: Arc<dyn EnvelopeCodec>) -> Self {
        Self { transport, codec }
    }

    pub fn codec(&self) -> &dyn EnvelopeCodec {
        self.codec.as_ref()
    }

    /// Send to the process hosting `envelope.target`
    pub async fn send(&self, envelope: &Envelope) -> Result<()> {
        let bytes = self.codec.encode(envelope)?;
        self.transport.send(envelope.target, bytes).await
    }

    pub fn disconnects(&self) -> Option<broadcast::Receiver<u16>> {
        self.transport.disconnects()
    }
}
