//! Fiber Context
//!
//! A fiber is one independently scheduled execution unit. Everything that
//! would otherwise be process-wide state lives on the fiber and is passed
//! explicitly: the address generator, RPC table, lock table, dispatcher,
//! mailboxes, and the outbound transport. Handlers reach it through
//! [`HandlerContext::fiber`](crate::HandlerContext).
//!
//! ```text
//! transport ──bytes──▶ on_receive ──Response──▶ RpcSender (complete pending call)
//!                                 └─Message/Request─▶ Mailbox ──▶ MessageDispatcher ──▶ handler
//! ```

use crate::codec::{BincodeCodec, EnvelopeCodec};
use crate::coroutine_lock::CoroutineLockComponent;
use crate::dispatcher::MessageDispatcher;
use crate::mailbox::{DeliveryMode, Mailbox};
use crate::registry::MailboxRegistry;
use crate::rpc::{CallOptions, RpcSender};
use crate::transport::{process_address, Inbound, LocalNetwork, Outbound, Transport};
use bytes::Bytes;
use std::fmt;
use std::sync::{Arc, Weak};
use strand_config::StrandConfig;
use strand_types::{
    ActorId, ActorMessage, ActorRequest, CoreError, Envelope, EnvelopeKind, ErrorCode, IdGenerator, Result,
};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

struct FiberInner {
    address: ActorId,
    ids: IdGenerator,
    rpc: RpcSender,
    locks: CoroutineLockComponent,
    dispatcher: MessageDispatcher,
    mailboxes: MailboxRegistry,
    outbound: Outbound,
    config: StrandConfig,
    shutdown: CancellationToken,
}

/// Cloneable handle to a fiber
#[derive(Clone)]
pub struct Fiber {
    inner: Arc<FiberInner>,
}

/// Non-owning fiber handle held by long-lived tasks
#[derive(Clone)]
pub struct WeakFiber {
    inner: Weak<FiberInner>,
}

impl WeakFiber {
    pub fn upgrade(&self) -> Option<Fiber> {
        self.inner.upgrade().map(|inner| Fiber { inner })
    }
}

impl fmt::Debug for Fiber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Fiber")
            .field("address", &self.inner.address)
            .field("mailboxes", &self.inner.mailboxes.len())
            .field("pending_rpcs", &self.inner.rpc.pending_count())
            .finish()
    }
}

/// Builds a [`Fiber`] from configuration
pub struct FiberBuilder {
    config: StrandConfig,
    codec: Arc<dyn EnvelopeCodec>,
    clock: Option<fn() -> u32>,
}

impl FiberBuilder {
    pub fn new(config: StrandConfig) -> Self {
        Self {
            config,
            codec: Arc::new(BincodeCodec),
            clock: None,
        }
    }

    /// Replace the default bincode envelope codec
    pub fn codec(mut self, codec: Arc<dyn EnvelopeCodec>) -> Self {
        self.codec = codec;
        self
    }

    /// Inject the address clock (seconds since 2020-01-01)
    pub fn clock(mut self, clock: fn() -> u32) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn build(self, transport: Arc<dyn Transport>) -> Result<Fiber> {
        let ids = match self.clock {
            Some(clock) => IdGenerator::with_clock(self.config.process.id, clock)?,
            None => IdGenerator::new(self.config.process.id)?,
        };
        let outbound = Outbound::new(transport, self.codec);
        let rpc = RpcSender::new(outbound.clone(), self.config.rpc.timeout());
        let locks = CoroutineLockComponent::new(&self.config.lock);
        let address = process_address(ids.process());

        info!(
            process = ids.process(),
            rpc_timeout_ms = self.config.rpc.timeout_ms,
            "Fiber created"
        );

        Ok(Fiber {
            inner: Arc::new(FiberInner {
                address,
                ids,
                rpc,
                locks,
                dispatcher: MessageDispatcher::new(),
                mailboxes: MailboxRegistry::new(),
                outbound,
                config: self.config,
                shutdown: CancellationToken::new(),
            }),
        })
    }
}

impl Fiber {
    pub fn builder(config: StrandConfig) -> FiberBuilder {
        FiberBuilder::new(config)
    }

    /// Build a fiber attached to `network` under its configured process id
    pub fn on_local_network(
        config: StrandConfig,
        network: &Arc<LocalNetwork>,
    ) -> Result<(Fiber, mpsc::UnboundedReceiver<Inbound>)> {
        let process = u16::try_from(config.process.id).map_err(|_| {
            CoreError::configuration(
                format!("process id {} does not fit the address field", config.process.id),
                Some("process.id"),
            )
        })?;
        let (transport, inbound) = network.attach(process)?;
        match Fiber::builder(config).build(Arc::new(transport)) {
            Ok(fiber) => Ok((fiber, inbound)),
            Err(e) => {
                network.detach(process);
                Err(e)
            }
        }
    }

    pub fn downgrade(&self) -> WeakFiber {
        WeakFiber {
            inner: Arc::downgrade(&self.inner),
        }
    }

    /// Routing address other fibers reply to
    pub fn address(&self) -> ActorId {
        self.inner.address
    }

    pub fn process(&self) -> u16 {
        self.inner.ids.process()
    }

    pub fn id_generator(&self) -> &IdGenerator {
        &self.inner.ids
    }

    pub fn rpc(&self) -> &RpcSender {
        &self.inner.rpc
    }

    pub fn locks(&self) -> &CoroutineLockComponent {
        &self.inner.locks
    }

    pub fn dispatcher(&self) -> &MessageDispatcher {
        &self.inner.dispatcher
    }

    pub fn mailboxes(&self) -> &MailboxRegistry {
        &self.inner.mailboxes
    }

    pub fn config(&self) -> &StrandConfig {
        &self.inner.config
    }

    pub(crate) fn outbound(&self) -> &Outbound {
        &self.inner.outbound
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.inner.shutdown.clone()
    }

    /// Give `entity` a mailbox on this fiber
    pub fn add_mailbox(&self, entity: ActorId, mode: DeliveryMode) -> Result<()> {
        self.inner
            .mailboxes
            .register(Mailbox::new(entity, mode, self.downgrade()))
    }

    /// Remove the mailbox; queued envelopes for an ordered mailbox are abandoned
    pub fn remove_mailbox(&self, entity: ActorId) -> bool {
        self.inner.mailboxes.unregister(entity).is_some()
    }

    /// Typed call with the default timeout
    pub async fn call<R: ActorRequest>(&self, target: ActorId, request: &R) -> Result<R::Response> {
        self.inner.rpc.call(target, request, CallOptions::default()).await
    }

    pub async fn call_with<R: ActorRequest>(
        &self,
        target: ActorId,
        request: &R,
        options: CallOptions,
    ) -> Result<R::Response> {
        self.inner.rpc.call(target, request, options).await
    }

    /// Fire-and-forget message
    pub async fn send<M: ActorMessage>(&self, target: ActorId, message: &M) -> Result<()> {
        self.inner.rpc.send(target, message).await
    }

    /// Route inbound bytes from the transport
    pub async fn on_receive(&self, from: ActorId, bytes: Bytes) {
        let envelope = match self.inner.outbound.codec().decode(&bytes) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(%from, error = %e, "Dropping undecodable envelope");
                return;
            }
        };

        if envelope.is_response() {
            if let Some(response) = envelope.into_raw_response() {
                self.inner.rpc.on_response(response);
            }
            return;
        }

        let target = envelope.target;
        match self.inner.mailboxes.get(target) {
            Some(mailbox) => {
                if let Err(e) = mailbox.deliver(self, from, envelope) {
                    warn!(%target, error = %e, "Mailbox rejected envelope");
                }
            }
            None => self.reject_unroutable(from, envelope).await,
        }
    }

    async fn reject_unroutable(&self, from: ActorId, envelope: Envelope) {
        let target = envelope.target;
        match envelope.kind {
            EnvelopeKind::Request { rpc_id } => {
                debug!(%target, rpc_id = rpc_id, opcode = envelope.opcode, "Request for unknown entity");
                let error = CoreError::NotFoundActor { actor: target };
                let response = Envelope::response(
                    from,
                    0,
                    rpc_id,
                    ErrorCode::NotFoundActor.into(),
                    error.to_string(),
                    Bytes::new(),
                );
                if let Err(e) = self.inner.outbound.send(&response).await {
                    warn!(%from, error = %e, "Failed to answer request for unknown entity");
                }
            }
            _ => {
                warn!(%target, opcode = envelope.opcode, "Message for unknown entity dropped");
            }
        }
    }

    /// Pump inbound bytes until the channel closes or the fiber shuts down
    pub async fn run(&self, mut inbound: mpsc::UnboundedReceiver<Inbound>) {
        let shutdown = self.inner.shutdown.clone();
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                next = inbound.recv() => match next {
                    Some(Inbound { from, bytes }) => self.on_receive(from, bytes).await,
                    None => break,
                },
            }
        }
        debug!(process = self.process(), "Fiber receive loop stopped");
    }

    pub fn spawn_receiver(&self, inbound: mpsc::UnboundedReceiver<Inbound>) -> JoinHandle<()> {
        let fiber = self.clone();
        tokio::spawn(async move { fiber.run(inbound).await })
    }

    /// Start the RPC sweeper, the lock ticker and, when the transport reports
    /// lost processes, the disconnect watcher
    pub fn spawn_maintenance(&self) -> Vec<JoinHandle<()>> {
        let config = &self.inner.config;
        let mut tasks = vec![
            self.inner
                .rpc
                .spawn_sweeper(config.rpc.sweep_interval(), self.shutdown_token()),
            self.inner
                .locks
                .spawn_ticker(config.lock.tick_interval(), self.shutdown_token()),
        ];
        if let Some(lost) = self.inner.outbound.disconnects() {
            tasks.push(
                self.inner
                    .rpc
                    .spawn_disconnect_watcher(lost, self.shutdown_token()),
            );
        }
        tasks
    }

    /// Stop background tasks and drop every mailbox
    pub fn shutdown(&self) {
        info!(process = self.process(), "Fiber shutting down");
        self.inner.shutdown.cancel();
        self.inner.mailboxes.clear();
    }
}
