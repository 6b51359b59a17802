//! Opcode dispatch for mailbox traffic
//!
//! Handlers are plain async closures registered per opcode. Message handlers
//! get the decoded payload; request handlers also get a [`Reply`] capability
//! that can answer the caller at most once. The dispatcher answers on the
//! handler's behalf with `HandlerFailure` when the handler returns an error,
//! panics, or lets every copy of its `Reply` drop unused.

use crate::codec::{decode_payload, encode_payload};
use crate::fiber::Fiber;
use bytes::Bytes;
use futures::future::{BoxFuture, FutureExt};
use parking_lot::RwLock;
use std::any::type_name;
use std::collections::HashMap;
use std::future::Future;
use std::marker::PhantomData;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use strand_types::{ActorId, ActorMessage, ActorRequest, CoreError, Envelope, EnvelopeKind, ErrorCode, Result};
use tracing::{debug, error, warn};

type HandlerFuture = BoxFuture<'static, Result<()>>;
type MessageFn = dyn Fn(HandlerContext, Bytes) -> Result<HandlerFuture> + Send + Sync;
type RequestFn = dyn Fn(HandlerContext, Bytes, Arc<ReplySlot>) -> Result<HandlerFuture> + Send + Sync;

/// What a handler knows about the envelope it is processing
#[derive(Debug, Clone)]
pub struct HandlerContext {
    /// Fiber hosting the target entity
    pub fiber: Fiber,
    /// Entity the envelope was addressed to
    pub entity: ActorId,
    /// Routing address of the sender
    pub from: ActorId,
}

enum Route {
    Message(Arc<MessageFn>),
    Request(Arc<RequestFn>),
}

struct RouteEntry {
    type_name: &'static str,
    route: Route,
}

/// Dispatch counters
#[derive(Debug, Default)]
pub struct DispatchMetrics {
    pub dispatched: AtomicU64,
    pub unknown_type: AtomicU64,
    pub type_mismatch: AtomicU64,
    pub handler_failures: AtomicU64,
}

impl DispatchMetrics {
    pub fn get_stats(&self) -> DispatchStats {
        DispatchStats {
            dispatched: self.dispatched.load(Ordering::Relaxed),
            unknown_type: self.unknown_type.load(Ordering::Relaxed),
            type_mismatch: self.type_mismatch.load(Ordering::Relaxed),
            handler_failures: self.handler_failures.load(Ordering::Relaxed),
        }
    }
}

/// Dispatch statistics snapshot
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DispatchStats {
    pub dispatched: u64,
    pub unknown_type: u64,
    pub type_mismatch: u64,
    pub handler_failures: u64,
}

/// Opcode → handler table for one fiber
#[derive(Default)]
pub struct MessageDispatcher {
    routes: RwLock<HashMap<u16, Arc<RouteEntry>>>,
    metrics: DispatchMetrics,
}

impl std::fmt::Debug for MessageDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageDispatcher")
            .field("routes", &self.routes.read().len())
            .finish()
    }
}

impl MessageDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn metrics(&self) -> &DispatchMetrics {
        &self.metrics
    }

    pub fn is_registered(&self, opcode: u16) -> bool {
        self.routes.read().contains_key(&opcode)
    }

    fn insert(&self, opcode: u16, type_name: &'static str, route: Route) -> Result<()> {
        let mut routes = self.routes.write();
        if let Some(existing) = routes.get(&opcode) {
            return Err(CoreError::configuration(
                format!(
                    "opcode {} already registered for {}, cannot register {}",
                    opcode, existing.type_name, type_name
                ),
                None,
            ));
        }
        routes.insert(opcode, Arc::new(RouteEntry { type_name, route }));
        debug!(opcode = opcode, message_type = type_name, "Handler registered");
        Ok(())
    }

    /// Register a fire-and-forget handler for `M`
    pub fn register_message<M, F, Fut>(&self, handler: F) -> Result<()>
    where
        M: ActorMessage,
        F: Fn(HandlerContext, M) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let erased = move |ctx: HandlerContext, payload: Bytes| -> Result<HandlerFuture> {
            let message: M = decode_payload(&payload)?;
            Ok(handler(ctx, message).boxed())
        };
        self.insert(M::OPCODE, type_name::<M>(), Route::Message(Arc::new(erased)))
    }

    /// Register a request handler for `R`
    pub fn register_request<R, F, Fut>(&self, handler: F) -> Result<()>
    where
        R: ActorRequest,
        F: Fn(HandlerContext, R, Reply<R::Response>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let erased = move |ctx: HandlerContext, payload: Bytes, slot: Arc<ReplySlot>| -> Result<HandlerFuture> {
            let request: R = decode_payload(&payload)?;
            Ok(handler(ctx, request, Reply::new(slot)).boxed())
        };
        self.insert(R::OPCODE, type_name::<R>(), Route::Request(Arc::new(erased)))
    }

    /// Run the handler registered for `envelope.opcode`
    ///
    /// Errors are logged here; the returned error is informational and is
    /// never sent anywhere by the caller.
    pub async fn dispatch(&self, ctx: HandlerContext, envelope: Envelope) -> Result<()> {
        let opcode = envelope.opcode;
        let entry = self.routes.read().get(&opcode).cloned();
        let Some(entry) = entry else {
            self.metrics.unknown_type.fetch_add(1, Ordering::Relaxed);
            warn!(opcode = opcode, entity = %ctx.entity, "No handler for opcode, dropping envelope");
            return Err(CoreError::UnknownMessageType { opcode });
        };

        match (&entry.route, envelope.kind) {
            (Route::Message(handler), EnvelopeKind::Message) => {
                let future = handler(ctx, envelope.payload).map_err(|e| self.mismatch(opcode, &entry, e))?;
                self.metrics.dispatched.fetch_add(1, Ordering::Relaxed);

                run_guarded(future).await.map_err(|e| {
                    self.metrics.handler_failures.fetch_add(1, Ordering::Relaxed);
                    error!(opcode = opcode, message_type = entry.type_name, error = %e, "Message handler failed");
                    e
                })
            }
            (Route::Request(handler), EnvelopeKind::Request { rpc_id }) => {
                let slot = Arc::new(ReplySlot::new(ctx.fiber.clone(), ctx.from, rpc_id));
                let future = match handler(ctx, envelope.payload, Arc::clone(&slot)) {
                    Ok(future) => future,
                    Err(e) => {
                        // Undecodable requests are dropped without an answer
                        slot.claimed.store(true, Ordering::Release);
                        return Err(self.mismatch(opcode, &entry, e));
                    }
                };
                self.metrics.dispatched.fetch_add(1, Ordering::Relaxed);

                match run_guarded(future).await {
                    Ok(()) => {
                        if Arc::strong_count(&slot) == 1 && !slot.is_claimed() {
                            self.metrics.handler_failures.fetch_add(1, Ordering::Relaxed);
                            warn!(
                                opcode = opcode,
                                rpc_id = rpc_id,
                                message_type = entry.type_name,
                                "Request handler finished without replying"
                            );
                        }
                        Ok(())
                    }
                    Err(e) => {
                        self.metrics.handler_failures.fetch_add(1, Ordering::Relaxed);
                        error!(
                            opcode = opcode,
                            rpc_id = rpc_id,
                            message_type = entry.type_name,
                            error = %e,
                            "Request handler failed"
                        );
                        if slot.claim() {
                            if let Err(send_error) =
                                slot.respond_failure(CoreError::handler_failure(e.to_string())).await
                            {
                                warn!(rpc_id = rpc_id, error = %send_error, "Failed to report handler failure to caller");
                            }
                        }
                        Err(e)
                    }
                }
            }
            (_, kind) => {
                self.metrics.type_mismatch.fetch_add(1, Ordering::Relaxed);
                warn!(
                    opcode = opcode,
                    message_type = entry.type_name,
                    kind = ?kind,
                    "Envelope kind does not match registered handler, dropping"
                );
                Err(CoreError::MessageTypeMismatch {
                    opcode,
                    expected: entry.type_name,
                    message: format!("unexpected envelope kind {:?}", kind),
                })
            }
        }
    }

    fn mismatch(&self, opcode: u16, entry: &RouteEntry, error: CoreError) -> CoreError {
        self.metrics.type_mismatch.fetch_add(1, Ordering::Relaxed);
        warn!(
            opcode = opcode,
            message_type = entry.type_name,
            error = %error,
            "Payload does not decode as registered type, dropping"
        );
        CoreError::MessageTypeMismatch {
            opcode,
            expected: entry.type_name,
            message: error.to_string(),
        }
    }
}

/// Await a handler, turning a panic into `HandlerFailure`
async fn run_guarded(future: HandlerFuture) -> Result<()> {
    match AssertUnwindSafe(future).catch_unwind().await {
        Ok(result) => result,
        Err(panic) => {
            let message = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "handler panicked".to_string());
            Err(CoreError::handler_failure(format!("panic: {}", message)))
        }
    }
}

/// Shared answer state for one inbound request
///
/// Whoever claims the slot first answers. If the last handle is dropped
/// unclaimed, the caller gets `HandlerFailure`.
pub(crate) struct ReplySlot {
    fiber: Fiber,
    to: ActorId,
    rpc_id: i32,
    claimed: AtomicBool,
}

impl ReplySlot {
    fn new(fiber: Fiber, to: ActorId, rpc_id: i32) -> Self {
        Self {
            fiber,
            to,
            rpc_id,
            claimed: AtomicBool::new(false),
        }
    }

    fn claim(&self) -> bool {
        !self.claimed.swap(true, Ordering::AcqRel)
    }

    fn is_claimed(&self) -> bool {
        self.claimed.load(Ordering::Acquire)
    }

    async fn respond(&self, opcode: u16, error: i32, text: String, payload: Bytes) -> Result<()> {
        let envelope = Envelope::response(self.to, opcode, self.rpc_id, error, text, payload);
        self.fiber.outbound().send(&envelope).await
    }

    async fn respond_failure(&self, error: CoreError) -> Result<()> {
        self.respond(0, error.error_code(), error.to_string(), Bytes::new()).await
    }
}

impl Drop for ReplySlot {
    fn drop(&mut self) {
        if !self.claim() {
            return;
        }
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            warn!(rpc_id = self.rpc_id, "Unanswered request outside a runtime, caller will time out");
            return;
        };
        let fiber = self.fiber.clone();
        let rpc_id = self.rpc_id;
        let error = CoreError::handler_failure("handler completed without replying");
        let envelope = Envelope::response(self.to, 0, self.rpc_id, error.error_code(), error.to_string(), Bytes::new());
        handle.spawn(async move {
            if let Err(e) = fiber.outbound().send(&envelope).await {
                warn!(rpc_id = rpc_id, error = %e, "Failed to answer unreplied request");
            }
        });
    }
}

/// One-shot capability to answer a request
///
/// Consumed by [`Reply::send`] or [`Reply::fail`].
pub struct Reply<T> {
    slot: Arc<ReplySlot>,
    _marker: PhantomData<fn(T)>,
}

impl<T> std::fmt::Debug for Reply<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reply").field("rpc_id", &self.slot.rpc_id).finish()
    }
}

impl<T> Reply<T> {
    pub(crate) fn new(slot: Arc<ReplySlot>) -> Self {
        Self {
            slot,
            _marker: PhantomData,
        }
    }

    fn claim(&self) -> Result<()> {
        if self.slot.claim() {
            Ok(())
        } else {
            Err(CoreError::rpc_fail("request already answered"))
        }
    }

    pub fn rpc_id(&self) -> i32 {
        self.slot.rpc_id
    }

    /// Answer with an error; its code travels to the caller
    pub async fn fail(self, error: CoreError) -> Result<()> {
        self.claim()?;
        self.slot.respond_failure(error).await
    }
}

impl<T: ActorMessage> Reply<T> {
    /// Answer with a successful response
    pub async fn send(self, response: T) -> Result<()> {
        let encoded = encode_payload(&response);
        self.claim()?;
        match encoded {
            Ok(payload) => {
                self.slot
                    .respond(T::OPCODE, ErrorCode::Success.into(), String::new(), payload)
                    .await
            }
            Err(e) => {
                self.slot
                    .respond_failure(CoreError::handler_failure(e.to_string()))
                    .await?;
                Err(e)
            }
        }
    }
}
