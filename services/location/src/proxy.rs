//! Client side of the location directory

use crate::messages::*;
use crate::service::LocationService;
use std::time::Duration;
use strand_actors::Fiber;
use strand_types::{ActorId, CoreError, ErrorCode, Result};

/// Typed calls against a remote (or local) location service
#[derive(Debug, Clone)]
pub struct LocationProxy {
    fiber: Fiber,
    service: ActorId,
}

impl LocationProxy {
    pub fn new(fiber: Fiber, service: ActorId) -> Self {
        Self { fiber, service }
    }

    /// Proxy for the directory hosted by `process`
    pub fn for_process(fiber: Fiber, process: u16) -> Self {
        Self::new(fiber, LocationService::address(process))
    }

    pub fn service(&self) -> ActorId {
        self.service
    }

    pub async fn add(&self, key: u64, instance_id: ActorId) -> Result<()> {
        self.fiber
            .call(self.service, &ObjectAddRequest { key, instance_id })
            .await
            .map(|_| ())
            .map_err(|e| refine(key, e))
    }

    pub async fn get(&self, key: u64) -> Result<Option<ActorId>> {
        self.fiber
            .call(self.service, &ObjectGetRequest { key })
            .await
            .map(|response| response.instance_id)
            .map_err(|e| refine(key, e))
    }

    /// Lock `key` for migration away from `instance_id`; zero lease uses the directory default
    pub async fn lock(&self, key: u64, instance_id: ActorId, lease: Duration) -> Result<()> {
        let request = ObjectLockRequest {
            key,
            instance_id,
            lease_ms: lease.as_millis() as u64,
        };
        self.fiber
            .call(self.service, &request)
            .await
            .map(|_| ())
            .map_err(|e| refine(key, e))
    }

    pub async fn unlock(&self, key: u64, old_instance_id: ActorId, instance_id: ActorId) -> Result<()> {
        let request = ObjectUnlockRequest {
            key,
            old_instance_id,
            instance_id,
        };
        self.fiber
            .call(self.service, &request)
            .await
            .map(|_| ())
            .map_err(|e| refine(key, e))
    }

    pub async fn remove(&self, key: u64) -> Result<()> {
        self.fiber
            .call(self.service, &ObjectRemoveRequest { key })
            .await
            .map(|_| ())
            .map_err(|e| refine(key, e))
    }
}

/// Restore location errors from their wire codes
fn refine(key: u64, error: CoreError) -> CoreError {
    let CoreError::Remote { code, text } = error else {
        return error;
    };
    match ErrorCode::try_from(code) {
        Ok(ErrorCode::DuplicateKey) => CoreError::DuplicateKey { key },
        Ok(ErrorCode::KeyNotFound) => CoreError::KeyNotFound { key },
        Ok(ErrorCode::LockMismatch) => CoreError::LockMismatch { key, message: text },
        Ok(ErrorCode::LockLeaseExpired) => CoreError::LockLeaseExpired { key },
        _ => CoreError::Remote { code, text },
    }
}
