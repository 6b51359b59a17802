//! Fiber Coordination Runtime
//!
//! Request/response messaging, keyed mutual exclusion and mailbox dispatch
//! for Strand fibers. Nothing here blocks an OS thread: callers suspend on
//! RPC completions and lock hand-offs, and the only synchronous locks are
//! short critical sections never held across `.await`.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────── Fiber ─────────────────────────────┐
//! │                                                                 │
//! │  IdGenerator   RpcSender ◀── responses ──┐                      │
//! │                  │ requests              │                      │
//! │                  ▼                       │                      │
//! │  Outbound (codec + transport) ──▶ other fibers ──▶ on_receive   │
//! │                                                     │           │
//! │  CoroutineLockComponent       MailboxRegistry ◀─────┘           │
//! │                                 │                               │
//! │                                 ▼                               │
//! │                          MessageDispatcher ──▶ handlers         │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Examples
//!
//! ```rust,no_run
//! use strand_actors::{DeliveryMode, Fiber, HandlerContext, LocalNetwork, Reply};
//! use strand_config::StrandConfig;
//! use strand_types::{ActorMessage, ActorRequest};
//! use serde::{Deserialize, Serialize};
//!
//! #[derive(Serialize, Deserialize)]
//! struct Ping;
//! #[derive(Serialize, Deserialize)]
//! struct Pong;
//! impl ActorMessage for Ping { const OPCODE: u16 = 1; }
//! impl ActorMessage for Pong { const OPCODE: u16 = 2; }
//! impl ActorRequest for Ping { type Response = Pong; }
//!
//! # async fn demo() -> strand_types::Result<()> {
//! let network = LocalNetwork::new();
//! let (fiber, inbound) = Fiber::on_local_network(StrandConfig::default(), &network)?;
//! fiber.spawn_receiver(inbound);
//!
//! let entity = fiber.id_generator().generate_instance_id();
//! fiber.add_mailbox(entity, DeliveryMode::Ordered)?;
//! fiber.dispatcher().register_request(|_ctx: HandlerContext, _ping: Ping, reply: Reply<Pong>| async move {
//!     reply.send(Pong).await
//! })?;
//!
//! let _pong: Pong = fiber.call(entity, &Ping).await?;
//! # Ok(())
//! # }
//! ```

pub mod codec;
pub mod coroutine_lock;
pub mod dispatcher;
pub mod fiber;
pub mod mailbox;
pub mod registry;
pub mod rpc;
pub mod transport;

pub use codec::{decode_payload, encode_payload, BincodeCodec, EnvelopeCodec};
pub use coroutine_lock::{CoroutineLock, CoroutineLockComponent, LockType};
pub use dispatcher::{DispatchMetrics, DispatchStats, HandlerContext, MessageDispatcher, Reply};
pub use fiber::{Fiber, FiberBuilder, WeakFiber};
pub use mailbox::{DeliveryMode, Mailbox};
pub use registry::MailboxRegistry;
pub use rpc::{CallOptions, RpcMetrics, RpcSender, RpcStats};
pub use transport::{
    process_address, Inbound, LocalNetwork, LocalTransport, Outbound, Transport, TransportMetrics,
    TransportStats,
};
