//! # Location Service
//!
//! Directory of which instance currently owns each logical object, with
//! lease-bounded migration locks.
//!
//! A migration moves an object from instance `A` to instance `B`:
//!
//! 1. `lock(key, A, lease)`: the key stops answering lookups
//! 2. the object's state moves to `B`
//! 3. `unlock(key, A, B)`: queued lookups resume and observe `B`
//!
//! If step 3 never happens the lease expires and lookups resume with `A`.
//!
//! - [`component`]: the directory itself
//! - [`service`]: mailbox and request handlers that expose it on a fiber
//! - [`proxy`]: typed client for remote fibers
//! - [`messages`]: wire contracts

pub mod component;
pub mod messages;
pub mod proxy;
pub mod service;

pub use component::{LocationComponent, LocationStats};
pub use proxy::LocationProxy;
pub use service::LocationService;
