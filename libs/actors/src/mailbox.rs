//! Entity mailboxes
//!
//! An entity with a mailbox can receive envelopes on its fiber. Ordered
//! mailboxes run one handler at a time in arrival order on a dedicated worker
//! task; unordered mailboxes start every handler immediately.

use crate::dispatcher::HandlerContext;
use crate::fiber::{Fiber, WeakFiber};
use strand_types::{ActorId, CoreError, Envelope, Result};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

/// How a mailbox schedules its handlers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryMode {
    /// FIFO; the next envelope waits for the previous handler to finish
    Ordered,
    /// Each envelope gets its own task
    Unordered,
}

struct Delivery {
    from: ActorId,
    envelope: Envelope,
}

/// Delivery endpoint for one entity
pub struct Mailbox {
    entity: ActorId,
    mode: DeliveryMode,
    queue: Option<mpsc::UnboundedSender<Delivery>>,
    worker: Option<JoinHandle<()>>,
}

impl std::fmt::Debug for Mailbox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mailbox")
            .field("entity", &self.entity)
            .field("mode", &self.mode)
            .finish()
    }
}

impl Mailbox {
    pub(crate) fn new(entity: ActorId, mode: DeliveryMode, fiber: WeakFiber) -> Self {
        match mode {
            DeliveryMode::Ordered => {
                let (tx, rx) = mpsc::unbounded_channel();
                let worker = tokio::spawn(run_ordered(entity, rx, fiber));
                Self {
                    entity,
                    mode,
                    queue: Some(tx),
                    worker: Some(worker),
                }
            }
            DeliveryMode::Unordered => Self {
                entity,
                mode,
                queue: None,
                worker: None,
            },
        }
    }

    pub fn entity(&self) -> ActorId {
        self.entity
    }

    pub fn mode(&self) -> DeliveryMode {
        self.mode
    }

    pub(crate) fn deliver(&self, fiber: &Fiber, from: ActorId, envelope: Envelope) -> Result<()> {
        match &self.queue {
            Some(queue) => queue
                .send(Delivery { from, envelope })
                .map_err(|_| CoreError::NotFoundActor { actor: self.entity }),
            None => {
                let ctx = HandlerContext {
                    fiber: fiber.clone(),
                    entity: self.entity,
                    from,
                };
                let fiber = fiber.clone();
                tokio::spawn(async move {
                    if let Err(e) = fiber.dispatcher().dispatch(ctx, envelope).await {
                        trace!(error = %e, "Unordered dispatch finished with error");
                    }
                });
                Ok(())
            }
        }
    }
}

impl Drop for Mailbox {
    fn drop(&mut self) {
        if let Some(worker) = self.worker.take() {
            worker.abort();
        }
        debug!(entity = %self.entity, "Mailbox closed");
    }
}

async fn run_ordered(entity: ActorId, mut rx: mpsc::UnboundedReceiver<Delivery>, fiber: WeakFiber) {
    while let Some(delivery) = rx.recv().await {
        let Some(fiber) = fiber.upgrade() else {
            break;
        };
        let ctx = HandlerContext {
            fiber: fiber.clone(),
            entity,
            from: delivery.from,
        };
        if let Err(e) = fiber.dispatcher().dispatch(ctx, delivery.envelope).await {
            trace!(%entity, error = %e, "Ordered dispatch finished with error");
        }
    }
}
