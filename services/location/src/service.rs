//! Location handlers
//!
//! Installs the directory on a fiber: one well-known mailbox per process and
//! a request handler per location opcode. Domain errors are answered with
//! their own error code so [`crate::LocationProxy`] can restore them.

use crate::component::LocationComponent;
use crate::messages::*;
use std::time::Duration;
use strand_actors::{DeliveryMode, Fiber, HandlerContext, Reply};
use strand_types::{ActorId, ActorMessage, Result};
use tracing::{debug, info};

/// Sequence reserved for the location mailbox at time 0
const LOCATION_SEQUENCE: u32 = 1;

pub struct LocationService;

impl LocationService {
    /// Well-known address of the directory hosted by `process`
    pub const fn address(process: u16) -> ActorId {
        ActorId::new(process, 0, LOCATION_SEQUENCE)
    }

    /// Register the directory mailbox and handlers on `fiber`
    ///
    /// Unordered delivery: serialization per key comes from the directory's
    /// CoroutineLock, so a locked key never blocks requests for other keys.
    pub fn install(fiber: &Fiber, component: LocationComponent) -> Result<ActorId> {
        let address = Self::address(fiber.process());
        fiber.add_mailbox(address, DeliveryMode::Unordered)?;
        let dispatcher = fiber.dispatcher();

        let directory = component.clone();
        dispatcher.register_request(
            move |_ctx: HandlerContext, req: ObjectAddRequest, reply: Reply<ObjectAddResponse>| {
                let directory = directory.clone();
                async move {
                    let result = directory.add(req.key, req.instance_id).await;
                    answer(reply, result.map(|_| ObjectAddResponse)).await
                }
            },
        )?;

        let directory = component.clone();
        dispatcher.register_request(
            move |_ctx: HandlerContext, req: ObjectGetRequest, reply: Reply<ObjectGetResponse>| {
                let directory = directory.clone();
                async move {
                    let result = directory.get(req.key).await;
                    answer(reply, result.map(|instance_id| ObjectGetResponse { instance_id })).await
                }
            },
        )?;

        let directory = component.clone();
        dispatcher.register_request(
            move |_ctx: HandlerContext, req: ObjectLockRequest, reply: Reply<ObjectLockResponse>| {
                let directory = directory.clone();
                async move {
                    let lease = Duration::from_millis(req.lease_ms);
                    let result = directory.lock(req.key, req.instance_id, lease).await;
                    answer(reply, result.map(|_| ObjectLockResponse)).await
                }
            },
        )?;

        let directory = component.clone();
        dispatcher.register_request(
            move |_ctx: HandlerContext, req: ObjectUnlockRequest, reply: Reply<ObjectUnlockResponse>| {
                let result = directory.unlock(req.key, req.old_instance_id, req.instance_id);
                answer(reply, result.map(|_| ObjectUnlockResponse))
            },
        )?;

        let directory = component;
        dispatcher.register_request(
            move |_ctx: HandlerContext, req: ObjectRemoveRequest, reply: Reply<ObjectRemoveResponse>| {
                let directory = directory.clone();
                async move {
                    let result = directory.remove(req.key).await;
                    answer(reply, result.map(|_| ObjectRemoveResponse)).await
                }
            },
        )?;

        info!(process = fiber.process(), %address, "Location service installed");
        Ok(address)
    }
}

async fn answer<T: ActorMessage>(reply: Reply<T>, result: Result<T>) -> Result<()> {
    match result {
        Ok(response) => reply.send(response).await,
        Err(error) => {
            debug!(rpc_id = reply.rpc_id(), error = %error, "Location request rejected");
            reply.fail(error).await
        }
    }
}
