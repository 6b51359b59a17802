//! Location Directory
//!
//! Maps a logical object key to the instance that currently owns it. Every
//! operation runs under the CoroutineLock `(LockType::LOCATION, key)`, so
//! operations on one key apply in arrival order.
//!
//! Migration holds that lock across two calls: `lock` keeps the guard in the
//! lock record, which makes every later `get`/`add`/`remove`/`lock` on the key
//! queue behind it until `unlock` swaps the owner and drops the guard, or the
//! lease timer drops it for an owner that never came back. Waiting callers
//! get the remaining lease on top of the lock wait timeout, so a long lease
//! never turns into a `LockTimeout` for readers.
//!
//! A migrator that unlocks after its lease expired gets `LockLeaseExpired`,
//! once; the expired token is forgotten when the key is locked again or
//! removed.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use strand_actors::{CoroutineLock, CoroutineLockComponent, LockType};
use strand_config::StrandConfig;
use strand_types::{ActorId, CoreError, Result};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Lease horizon for leases too long to fit in an `Instant`, about 30 years
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

struct LockRecord {
    locked_by: ActorId,
    lease_id: u64,
    expires_at: Instant,
    guard: CoroutineLock,
    lease_task: JoinHandle<()>,
}

struct LocationInner {
    locks: CoroutineLockComponent,
    wait_timeout: Duration,
    default_lease: Duration,
    locations: Mutex<HashMap<u64, ActorId>>,
    held: Mutex<HashMap<u64, LockRecord>>,
    /// Lock tokens whose lease ran out before unlock
    expired: Mutex<HashMap<u64, ActorId>>,
    next_lease_id: AtomicU64,
    lease_expirations: AtomicU64,
}

/// Directory snapshot for stats logging
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LocationStats {
    pub entries: usize,
    pub locked: usize,
    pub lease_expirations: u64,
}

/// Key → owner directory with migration locks
#[derive(Clone)]
pub struct LocationComponent {
    inner: Arc<LocationInner>,
}

impl std::fmt::Debug for LocationComponent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocationComponent").field("stats", &self.stats()).finish()
    }
}

impl LocationComponent {
    pub fn new(locks: CoroutineLockComponent, wait_timeout: Duration, default_lease: Duration) -> Self {
        Self {
            inner: Arc::new(LocationInner {
                locks,
                wait_timeout,
                default_lease,
                locations: Mutex::new(HashMap::new()),
                held: Mutex::new(HashMap::new()),
                expired: Mutex::new(HashMap::new()),
                next_lease_id: AtomicU64::new(1),
                lease_expirations: AtomicU64::new(0),
            }),
        }
    }

    /// Component sharing the fiber's lock table with configured timeouts
    pub fn from_config(locks: CoroutineLockComponent, config: &StrandConfig) -> Self {
        Self::new(locks, config.lock.wait_timeout(), config.location.lease())
    }

    async fn acquire(&self, key: u64) -> Result<CoroutineLock> {
        self.inner
            .locks
            .wait(LockType::LOCATION, key, self.wait_budget(key))
            .await
    }

    /// Lock wait timeout plus whatever is left of a migration lease on `key`
    fn wait_budget(&self, key: u64) -> Duration {
        let remaining_lease = self
            .inner
            .held
            .lock()
            .get(&key)
            .map(|record| record.expires_at.saturating_duration_since(Instant::now()))
            .unwrap_or_default();
        self.inner.wait_timeout.saturating_add(remaining_lease)
    }

    /// Register `key` at `instance`
    pub async fn add(&self, key: u64, instance: ActorId) -> Result<()> {
        let _guard = self.acquire(key).await?;
        let mut locations = self.inner.locations.lock();
        if let Some(existing) = locations.get(&key) {
            warn!(key = key, %existing, %instance, "Location add rejected, key already registered");
            return Err(CoreError::DuplicateKey { key });
        }
        locations.insert(key, instance);
        debug!(key = key, %instance, "Location added");
        Ok(())
    }

    /// Current owner of `key`; waits while a migration holds the key
    pub async fn get(&self, key: u64) -> Result<Option<ActorId>> {
        let _guard = self.acquire(key).await?;
        Ok(self.inner.locations.lock().get(&key).copied())
    }

    /// Start a migration of `key` away from `current`
    ///
    /// The key stays locked until [`Self::unlock`] or until `lease` elapses.
    /// A zero `lease` uses the configured default.
    pub async fn lock(&self, key: u64, current: ActorId, lease: Duration) -> Result<()> {
        let guard = self.acquire(key).await?;

        match self.inner.locations.lock().get(&key) {
            None => return Err(CoreError::KeyNotFound { key }),
            Some(owner) if *owner != current => {
                return Err(CoreError::lock_mismatch(
                    key,
                    format!("lock requested by {} but owner is {}", current, owner),
                ));
            }
            Some(_) => {}
        }

        let lease = if lease.is_zero() { self.inner.default_lease } else { lease };
        let lease_id = self.inner.next_lease_id.fetch_add(1, Ordering::Relaxed);
        let now = Instant::now();
        let expires_at = now.checked_add(lease).unwrap_or_else(|| now + FAR_FUTURE);
        let lease_task = spawn_lease_timer(Arc::downgrade(&self.inner), key, lease_id, lease);

        self.inner.expired.lock().remove(&key);
        self.inner.held.lock().insert(
            key,
            LockRecord {
                locked_by: current,
                lease_id,
                expires_at,
                guard,
                lease_task,
            },
        );
        debug!(key = key, %current, lease_ms = lease.as_millis() as u64, "Location locked");
        Ok(())
    }

    /// Finish a migration: `old` must match the lock token
    ///
    /// Moves the key to `new` and wakes queued operations. `ActorId::ZERO`
    /// as `new` releases the lock without changing the owner.
    pub fn unlock(&self, key: u64, old: ActorId, new: ActorId) -> Result<()> {
        let record = {
            let mut held = self.inner.held.lock();
            let locked_by = held.get(&key).map(|record| record.locked_by);
            match locked_by {
                None => {
                    drop(held);
                    return Err(self.reject_unlocked(key, old));
                }
                Some(locked_by) if locked_by != old => {
                    warn!(key = key, %old, %locked_by, "Unlock rejected, token mismatch");
                    return Err(CoreError::lock_mismatch(
                        key,
                        format!("unlock by {} but lock is held by {}", old, locked_by),
                    ));
                }
                Some(_) => held.remove(&key),
            }
        };
        let Some(record) = record else {
            return Err(CoreError::lock_mismatch(key, "key is not locked"));
        };
        record.lease_task.abort();

        if !new.is_zero() {
            self.inner.locations.lock().insert(key, new);
        }
        debug!(key = key, %old, %new, "Location unlocked");

        // Queued operations observe the new owner
        drop(record.guard);
        Ok(())
    }

    fn reject_unlocked(&self, key: u64, old: ActorId) -> CoreError {
        let mut expired = self.inner.expired.lock();
        if expired.get(&key) == Some(&old) {
            expired.remove(&key);
            warn!(key = key, %old, "Unlock rejected, migration lease already expired");
            return CoreError::LockLeaseExpired { key };
        }
        warn!(key = key, %old, "Unlock rejected, key is not locked");
        CoreError::lock_mismatch(key, "key is not locked")
    }

    /// Delete `key`; absent keys are ignored
    pub async fn remove(&self, key: u64) -> Result<()> {
        let _guard = self.acquire(key).await?;
        self.inner.expired.lock().remove(&key);
        if self.inner.locations.lock().remove(&key).is_some() {
            debug!(key = key, "Location removed");
        }
        Ok(())
    }

    /// Whether a migration currently holds `key`
    pub fn is_locked(&self, key: u64) -> bool {
        self.inner.held.lock().contains_key(&key)
    }

    pub fn stats(&self) -> LocationStats {
        LocationStats {
            entries: self.inner.locations.lock().len(),
            locked: self.inner.held.lock().len(),
            lease_expirations: self.inner.lease_expirations.load(Ordering::Relaxed),
        }
    }
}

fn spawn_lease_timer(inner: Weak<LocationInner>, key: u64, lease_id: u64, lease: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        tokio::time::sleep(lease).await;
        if let Some(inner) = inner.upgrade() {
            expire_lease(&inner, key, lease_id);
        }
    })
}

/// Force-release a lock whose owner never unlocked
fn expire_lease(inner: &LocationInner, key: u64, lease_id: u64) {
    let record = {
        let mut held = inner.held.lock();
        if held.get(&key).map(|record| record.lease_id) == Some(lease_id) {
            held.remove(&key)
        } else {
            None
        }
    };
    let Some(record) = record else {
        return;
    };

    inner.lease_expirations.fetch_add(1, Ordering::Relaxed);
    inner.expired.lock().insert(key, record.locked_by);
    let owner = inner.locations.lock().get(&key).copied();
    let error = CoreError::LockLeaseExpired { key };
    warn!(
        key = key,
        locked_by = %record.locked_by,
        owner = ?owner,
        error = %error,
        "Migration lease expired, releasing lock with previous owner"
    );
    drop(record.guard);
}

impl Drop for LocationInner {
    fn drop(&mut self) {
        let held = self.held.get_mut();
        if !held.is_empty() {
            info!(locked = held.len(), "Dropping location directory with active locks");
        }
        for (_, record) in held.drain() {
            record.lease_task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: u64 = 1001;

    fn component() -> (LocationComponent, CoroutineLockComponent) {
        let locks = CoroutineLockComponent::default();
        let component = LocationComponent::new(locks.clone(), Duration::from_secs(60), Duration::from_secs(60));
        (component, locks)
    }

    fn instance(sequence: u32) -> ActorId {
        ActorId::new(1, 100, sequence)
    }

    #[tokio::test]
    async fn test_add_then_get() {
        let (directory, locks) = component();
        directory.add(KEY, instance(1)).await.unwrap();
        assert_eq!(directory.get(KEY).await.unwrap(), Some(instance(1)));
        assert_eq!(directory.get(KEY + 1).await.unwrap(), None);
        assert_eq!(locks.lock_count(), 0);
    }

    #[tokio::test]
    async fn test_duplicate_add_is_rejected() {
        let (directory, _locks) = component();
        directory.add(KEY, instance(1)).await.unwrap();
        let err = directory.add(KEY, instance(2)).await.unwrap_err();
        assert_eq!(err, CoreError::DuplicateKey { key: KEY });
        assert_eq!(directory.get(KEY).await.unwrap(), Some(instance(1)));
    }

    #[tokio::test]
    async fn test_lock_requires_current_owner() {
        let (directory, locks) = component();
        let err = directory.lock(KEY, instance(1), Duration::ZERO).await.unwrap_err();
        assert_eq!(err, CoreError::KeyNotFound { key: KEY });

        directory.add(KEY, instance(1)).await.unwrap();
        let err = directory.lock(KEY, instance(9), Duration::ZERO).await.unwrap_err();
        assert!(matches!(err, CoreError::LockMismatch { key: KEY, .. }));
        assert!(!directory.is_locked(KEY));
        assert_eq!(locks.lock_count(), 0);
    }

    #[tokio::test]
    async fn test_migration_serializes_reads() {
        let (directory, locks) = component();
        directory.add(KEY, instance(1)).await.unwrap();
        directory.lock(KEY, instance(1), Duration::ZERO).await.unwrap();

        let reader = {
            let directory = directory.clone();
            tokio::spawn(async move { directory.get(KEY).await })
        };
        tokio::task::yield_now().await;
        assert!(!reader.is_finished());

        directory.unlock(KEY, instance(1), instance(2)).unwrap();
        assert_eq!(reader.await.unwrap().unwrap(), Some(instance(2)));
        assert_eq!(locks.lock_count(), 0);
    }

    #[tokio::test]
    async fn test_unlock_with_wrong_token_keeps_lock() {
        let (directory, _locks) = component();
        directory.add(KEY, instance(1)).await.unwrap();
        directory.lock(KEY, instance(1), Duration::ZERO).await.unwrap();

        let reader = {
            let directory = directory.clone();
            tokio::spawn(async move { directory.get(KEY).await })
        };
        tokio::task::yield_now().await;

        let err = directory.unlock(KEY, instance(7), instance(2)).unwrap_err();
        assert!(matches!(err, CoreError::LockMismatch { .. }));
        tokio::task::yield_now().await;
        assert!(!reader.is_finished());
        assert!(directory.is_locked(KEY));

        directory.unlock(KEY, instance(1), instance(2)).unwrap();
        assert_eq!(reader.await.unwrap().unwrap(), Some(instance(2)));
    }

    #[tokio::test]
    async fn test_unlock_without_lock_is_mismatch() {
        let (directory, _locks) = component();
        directory.add(KEY, instance(1)).await.unwrap();
        assert!(matches!(
            directory.unlock(KEY, instance(1), instance(2)),
            Err(CoreError::LockMismatch { .. })
        ));
    }

    #[tokio::test]
    async fn test_unlock_with_zero_keeps_owner() {
        let (directory, _locks) = component();
        directory.add(KEY, instance(1)).await.unwrap();
        directory.lock(KEY, instance(1), Duration::ZERO).await.unwrap();
        directory.unlock(KEY, instance(1), ActorId::ZERO).unwrap();
        assert_eq!(directory.get(KEY).await.unwrap(), Some(instance(1)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_lease_expiry_reverts_to_old_owner() {
        let (directory, locks) = component();
        directory.add(KEY, instance(1)).await.unwrap();
        directory.lock(KEY, instance(1), Duration::from_millis(100)).await.unwrap();

        let reader = {
            let directory = directory.clone();
            tokio::spawn(async move { directory.get(KEY).await })
        };

        assert_eq!(reader.await.unwrap().unwrap(), Some(instance(1)));
        assert!(!directory.is_locked(KEY));
        assert_eq!(directory.stats().lease_expirations, 1);
        assert_eq!(locks.lock_count(), 0);

        // The migrator learns its lease ran out, once
        assert_eq!(
            directory.unlock(KEY, instance(1), instance(2)),
            Err(CoreError::LockLeaseExpired { key: KEY })
        );
        assert!(matches!(
            directory.unlock(KEY, instance(1), instance(2)),
            Err(CoreError::LockMismatch { .. })
        ));
        assert_eq!(directory.get(KEY).await.unwrap(), Some(instance(1)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_token_only_matches_its_owner() {
        let (directory, _locks) = component();
        directory.add(KEY, instance(1)).await.unwrap();
        directory.lock(KEY, instance(1), Duration::from_millis(100)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;

        assert!(matches!(
            directory.unlock(KEY, instance(5), instance(2)),
            Err(CoreError::LockMismatch { .. })
        ));

        // Locking again forgets the expired token
        directory.lock(KEY, instance(1), Duration::from_secs(10)).await.unwrap();
        directory.unlock(KEY, instance(1), instance(2)).unwrap();
        assert!(matches!(
            directory.unlock(KEY, instance(1), instance(2)),
            Err(CoreError::LockMismatch { .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_lease_longer_than_wait_timeout_keeps_readers_waiting() {
        let locks = CoroutineLockComponent::default();
        let directory = LocationComponent::new(locks.clone(), Duration::from_secs(1), Duration::from_secs(60));
        directory.add(KEY, instance(1)).await.unwrap();
        directory.lock(KEY, instance(1), Duration::from_secs(5)).await.unwrap();

        let reader = {
            let directory = directory.clone();
            tokio::spawn(async move { directory.get(KEY).await })
        };
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert!(!reader.is_finished());

        directory.unlock(KEY, instance(1), instance(2)).unwrap();
        assert_eq!(reader.await.unwrap().unwrap(), Some(instance(2)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_lease_longer_than_wait_timeout_reverts_instead_of_timing_out() {
        let locks = CoroutineLockComponent::default();
        let directory = LocationComponent::new(locks.clone(), Duration::from_secs(1), Duration::from_secs(60));
        directory.add(KEY, instance(1)).await.unwrap();
        directory.lock(KEY, instance(1), Duration::from_secs(120)).await.unwrap();

        assert_eq!(directory.get(KEY).await.unwrap(), Some(instance(1)));
        assert_eq!(directory.stats().lease_expirations, 1);
        assert_eq!(locks.lock_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unlock_cancels_lease_timer() {
        let (directory, _locks) = component();
        directory.add(KEY, instance(1)).await.unwrap();
        directory.lock(KEY, instance(1), Duration::from_millis(100)).await.unwrap();
        directory.unlock(KEY, instance(1), instance(2)).unwrap();

        // A second migration must not be cut short by the first lease
        directory.lock(KEY, instance(2), Duration::from_secs(10)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(directory.is_locked(KEY));
        assert_eq!(directory.stats().lease_expirations, 0);
    }

    #[tokio::test]
    async fn test_remove_and_stats() {
        let (directory, locks) = component();
        directory.add(KEY, instance(1)).await.unwrap();
        directory.add(KEY + 1, instance(2)).await.unwrap();
        assert_eq!(directory.stats().entries, 2);

        directory.remove(KEY).await.unwrap();
        directory.remove(KEY).await.unwrap();
        assert_eq!(directory.get(KEY).await.unwrap(), None);
        assert_eq!(
            directory.stats(),
            LocationStats { entries: 1, locked: 0, lease_expirations: 0 }
        );
        assert_eq!(locks.lock_count(), 0);
    }

    #[tokio::test]
    async fn test_operations_apply_in_arrival_order() {
        let (directory, _locks) = component();
        directory.add(KEY, instance(1)).await.unwrap();
        directory.lock(KEY, instance(1), Duration::ZERO).await.unwrap();

        // Queued behind the migration: a remove, then a re-add
        let remove = {
            let directory = directory.clone();
            tokio::spawn(async move { directory.remove(KEY).await })
        };
        tokio::task::yield_now().await;
        let add = {
            let directory = directory.clone();
            tokio::spawn(async move { directory.add(KEY, instance(3)).await })
        };
        tokio::task::yield_now().await;

        directory.unlock(KEY, instance(1), instance(2)).unwrap();
        remove.await.unwrap().unwrap();
        add.await.unwrap().unwrap();
        assert_eq!(directory.get(KEY).await.unwrap(), Some(instance(3)));
    }
}
