//! CoroutineLock: FIFO mutual exclusion per `(LockType, key)`
//!
//! Acquiring never blocks an OS thread. The first caller for an idle key gets
//! the lock at level 0; later callers queue and are handed the lock one at a
//! time, in arrival order, as each holder drops its [`CoroutineLock`] guard.
//! The queue entry for a key exists exactly while someone holds the key and is
//! removed when the last holder releases.
//!
//! ```text
//! Idle ──wait──▶ Held(0) ──wait──▶ Held + queued ──drop──▶ Held(level+1) ──drop──▶ Idle
//! ```

use parking_lot::Mutex;
use std::collections::hash_map::Entry;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use strand_config::LockConfig;
use strand_types::{CoreError, Result};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Lock domain; the same key in different domains never contends
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LockType(pub u32);

impl LockType {
    pub const LOCATION: LockType = LockType(1);
    pub const MAILBOX: LockType = LockType(2);
    pub const RESOURCES: LockType = LockType(3);
    pub const DB: LockType = LockType(4);
}

impl fmt::Display for LockType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            LockType::LOCATION => write!(f, "location"),
            LockType::MAILBOX => write!(f, "mailbox"),
            LockType::RESOURCES => write!(f, "resources"),
            LockType::DB => write!(f, "db"),
            LockType(other) => write!(f, "lock-type-{}", other),
        }
    }
}

type LockKey = (LockType, u64);

struct LockQueue {
    /// Hand-offs since the key became held
    level: u32,
    waiters: VecDeque<oneshot::Sender<u32>>,
}

struct LockInner {
    queues: Mutex<HashMap<LockKey, LockQueue>>,
    /// Releases deferred to the next `update`
    next_frame: Mutex<VecDeque<LockKey>>,
    level_warn_threshold: u32,
    drain_cap_per_tick: usize,
    default_timeout: Duration,
}

/// Keyed lock table for one fiber
#[derive(Clone)]
pub struct CoroutineLockComponent {
    inner: Arc<LockInner>,
}

impl fmt::Debug for CoroutineLockComponent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CoroutineLockComponent")
            .field("held", &self.lock_count())
            .field("deferred", &self.pending_releases())
            .finish()
    }
}

impl Default for CoroutineLockComponent {
    fn default() -> Self {
        Self::new(&LockConfig::default())
    }
}

impl CoroutineLockComponent {
    pub fn new(config: &LockConfig) -> Self {
        Self {
            inner: Arc::new(LockInner {
                queues: Mutex::new(HashMap::new()),
                next_frame: Mutex::new(VecDeque::new()),
                level_warn_threshold: config.level_warn_threshold.max(1),
                drain_cap_per_tick: config.drain_cap_per_tick.max(1),
                default_timeout: config.wait_timeout(),
            }),
        }
    }

    pub fn default_timeout(&self) -> Duration {
        self.inner.default_timeout
    }

    /// Acquire with the configured default timeout
    pub async fn acquire(&self, lock_type: LockType, key: u64) -> Result<CoroutineLock> {
        self.wait(lock_type, key, self.inner.default_timeout).await
    }

    /// Acquire `(lock_type, key)`, suspending while another holder has it
    ///
    /// Fails with `LockTimeout` if the lock is not handed over within
    /// `timeout`. A hand-off that races with the timeout is kept rather than
    /// lost.
    pub async fn wait(&self, lock_type: LockType, key: u64, timeout: Duration) -> Result<CoroutineLock> {
        let rx = {
            let mut queues = self.inner.queues.lock();
            match queues.entry((lock_type, key)) {
                Entry::Vacant(vacant) => {
                    vacant.insert(LockQueue {
                        level: 0,
                        waiters: VecDeque::new(),
                    });
                    return Ok(self.guard(lock_type, key, 0));
                }
                Entry::Occupied(mut occupied) => {
                    let (tx, rx) = oneshot::channel();
                    occupied.get_mut().waiters.push_back(tx);
                    rx
                }
            }
        };

        let mut waiter = Waiter {
            rx,
            component: self.clone(),
            key: (lock_type, key),
        };

        let outcome = tokio::time::timeout(timeout, &mut waiter.rx).await;
        match outcome {
            Ok(Ok(level)) => Ok(self.guard(lock_type, key, level)),
            Ok(Err(_)) => Err(CoreError::LockTimeout {
                lock_type: lock_type.0,
                key,
                timeout_ms: timeout.as_millis() as u64,
            }),
            Err(_) => {
                waiter.rx.close();
                match waiter.rx.try_recv() {
                    Ok(level) => {
                        debug!(%lock_type, key = key, "Lock handed over as wait timed out, keeping it");
                        Ok(self.guard(lock_type, key, level))
                    }
                    Err(_) => Err(CoreError::LockTimeout {
                        lock_type: lock_type.0,
                        key,
                        timeout_ms: timeout.as_millis() as u64,
                    }),
                }
            }
        }
    }

    fn guard(&self, lock_type: LockType, key: u64, level: u32) -> CoroutineLock {
        CoroutineLock {
            component: self.clone(),
            lock_type,
            key,
            level,
            released: false,
        }
    }

    /// Hand `key` to the next live waiter, or mark it idle
    fn notify(&self, key: LockKey) {
        let mut queues = self.inner.queues.lock();
        let Entry::Occupied(mut entry) = queues.entry(key) else {
            warn!(lock_type = %key.0, key = key.1, "Release of a lock that is not held");
            return;
        };

        loop {
            let Some(waiter) = entry.get_mut().waiters.pop_front() else {
                entry.remove();
                return;
            };
            let level = entry.get().level + 1;
            // A send fails only when the waiter already gave up
            if waiter.send(level).is_ok() {
                entry.get_mut().level = level;
                if level % self.inner.level_warn_threshold == 0 {
                    warn!(
                        lock_type = %key.0,
                        key = key.1,
                        level = level,
                        queued = entry.get().waiters.len(),
                        "CoroutineLock queue is deep"
                    );
                }
                return;
            }
        }
    }

    /// Process up to `drain_cap_per_tick` deferred releases
    ///
    /// Returns the number processed; the rest wait for the next tick.
    pub fn update(&self) -> usize {
        let batch: Vec<LockKey> = {
            let mut next_frame = self.inner.next_frame.lock();
            let count = next_frame.len().min(self.inner.drain_cap_per_tick);
            next_frame.drain(..count).collect()
        };
        for key in &batch {
            self.notify(*key);
        }
        batch.len()
    }

    /// Drive [`Self::update`] every `interval` until `shutdown` fires
    pub fn spawn_ticker(&self, interval: Duration, shutdown: CancellationToken) -> JoinHandle<()> {
        let component = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        component.update();
                    }
                }
            }
            debug!("CoroutineLock ticker stopped");
        })
    }

    /// Keys currently held
    pub fn lock_count(&self) -> usize {
        self.inner.queues.lock().len()
    }

    pub fn is_locked(&self, lock_type: LockType, key: u64) -> bool {
        self.inner.queues.lock().contains_key(&(lock_type, key))
    }

    /// Waiters queued behind the current holder of `key`
    pub fn queue_len(&self, lock_type: LockType, key: u64) -> usize {
        self.inner
            .queues
            .lock()
            .get(&(lock_type, key))
            .map(|q| q.waiters.len())
            .unwrap_or(0)
    }

    /// Releases waiting for the next tick
    pub fn pending_releases(&self) -> usize {
        self.inner.next_frame.lock().len()
    }
}

/// A queued acquisition; passes the lock on if dropped after a hand-off
struct Waiter {
    rx: oneshot::Receiver<u32>,
    component: CoroutineLockComponent,
    key: LockKey,
}

impl Drop for Waiter {
    fn drop(&mut self) {
        self.rx.close();
        if self.rx.try_recv().is_ok() {
            self.component.notify(self.key);
        }
    }
}

/// Held lock; dropping it hands the key to the next waiter
#[must_use = "the lock is released as soon as the guard is dropped"]
pub struct CoroutineLock {
    component: CoroutineLockComponent,
    lock_type: LockType,
    key: u64,
    level: u32,
    released: bool,
}

impl fmt::Debug for CoroutineLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CoroutineLock")
            .field("lock_type", &self.lock_type)
            .field("key", &self.key)
            .field("level", &self.level)
            .finish()
    }
}

impl CoroutineLock {
    pub fn lock_type(&self) -> LockType {
        self.lock_type
    }

    pub fn key(&self) -> u64 {
        self.key
    }

    /// Hand-offs that preceded this acquisition
    pub fn level(&self) -> u32 {
        self.level
    }

    /// Release on the next `update` tick instead of immediately
    pub fn release_next_tick(mut self) {
        self.released = true;
        self.component
            .inner
            .next_frame
            .lock()
            .push_back((self.lock_type, self.key));
    }
}

impl Drop for CoroutineLock {
    fn drop(&mut self) {
        if !self.released {
            self.released = true;
            self.component.notify((self.lock_type, self.key));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const KEY: u64 = 42;

    fn component() -> CoroutineLockComponent {
        CoroutineLockComponent::default()
    }

    #[tokio::test]
    async fn test_first_acquire_is_level_zero() {
        let locks = component();
        let guard = locks.wait(LockType::LOCATION, KEY, Duration::from_secs(1)).await.unwrap();
        assert_eq!(guard.level(), 0);
        assert!(locks.is_locked(LockType::LOCATION, KEY));
        drop(guard);
        assert_eq!(locks.lock_count(), 0);
    }

    #[tokio::test]
    async fn test_domains_do_not_contend() {
        let locks = component();
        let _a = locks.acquire(LockType::LOCATION, KEY).await.unwrap();
        let _b = locks.acquire(LockType::DB, KEY).await.unwrap();
        assert_eq!(locks.lock_count(), 2);
    }

    #[tokio::test]
    async fn test_mutual_exclusion_and_fifo() {
        let locks = component();
        let order = Arc::new(Mutex::new(Vec::new()));
        let inside = Arc::new(AtomicUsize::new(0));

        let first = locks.acquire(LockType::LOCATION, KEY).await.unwrap();

        let mut tasks = Vec::new();
        for i in 0..5 {
            let locks = locks.clone();
            let order = order.clone();
            let inside = inside.clone();
            tasks.push(tokio::spawn(async move {
                let guard = locks.acquire(LockType::LOCATION, KEY).await.unwrap();
                assert_eq!(inside.fetch_add(1, Ordering::SeqCst), 0);
                order.lock().push((i, guard.level()));
                tokio::task::yield_now().await;
                inside.fetch_sub(1, Ordering::SeqCst);
            }));
            // Let each task enqueue before spawning the next
            tokio::task::yield_now().await;
        }
        assert_eq!(locks.queue_len(LockType::LOCATION, KEY), 5);

        drop(first);
        for task in tasks {
            task.await.unwrap();
        }

        let order = order.lock().clone();
        assert_eq!(order, vec![(0, 1), (1, 2), (2, 3), (3, 4), (4, 5)]);
        assert_eq!(locks.lock_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_times_out() {
        let locks = component();
        let _held = locks.acquire(LockType::RESOURCES, KEY).await.unwrap();

        let err = locks
            .wait(LockType::RESOURCES, KEY, Duration::from_millis(50))
            .await
            .unwrap_err();
        assert_eq!(
            err,
            CoreError::LockTimeout {
                lock_type: LockType::RESOURCES.0,
                key: KEY,
                timeout_ms: 50
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_timed_out_waiter_is_skipped() {
        let locks = component();
        let held = locks.acquire(LockType::LOCATION, KEY).await.unwrap();

        assert!(locks.wait(LockType::LOCATION, KEY, Duration::from_millis(10)).await.is_err());

        let next = {
            let locks = locks.clone();
            tokio::spawn(async move { locks.acquire(LockType::LOCATION, KEY).await.unwrap().level() })
        };
        tokio::task::yield_now().await;

        drop(held);
        assert_eq!(next.await.unwrap(), 1);
        assert_eq!(locks.lock_count(), 0);
    }

    #[tokio::test]
    async fn test_abandoned_waiter_passes_lock_on() {
        let locks = component();
        let held = locks.acquire(LockType::LOCATION, KEY).await.unwrap();

        let abandoned = {
            let locks = locks.clone();
            tokio::spawn(async move {
                let _guard = locks.acquire(LockType::LOCATION, KEY).await;
                std::future::pending::<()>().await;
            })
        };
        let next = {
            let locks = locks.clone();
            tokio::spawn(async move { locks.acquire(LockType::LOCATION, KEY).await.unwrap().level() })
        };
        tokio::task::yield_now().await;
        assert_eq!(locks.queue_len(LockType::LOCATION, KEY), 2);

        // Hand-off reaches the first waiter, which is cancelled before it runs
        drop(held);
        abandoned.abort();
        let _ = abandoned.await;

        assert_eq!(next.await.unwrap(), 2);
        assert_eq!(locks.lock_count(), 0);
    }

    #[tokio::test]
    async fn test_release_next_tick_defers_hand_off() {
        let locks = component();
        let held = locks.acquire(LockType::MAILBOX, KEY).await.unwrap();

        let waiter = {
            let locks = locks.clone();
            tokio::spawn(async move { locks.acquire(LockType::MAILBOX, KEY).await.map(|g| g.level()) })
        };
        tokio::task::yield_now().await;

        held.release_next_tick();
        assert_eq!(locks.pending_releases(), 1);
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());

        assert_eq!(locks.update(), 1);
        assert_eq!(waiter.await.unwrap().unwrap(), 1);
        assert_eq!(locks.lock_count(), 0);
    }

    #[tokio::test]
    async fn test_update_respects_drain_cap() {
        let config = LockConfig {
            drain_cap_per_tick: 2,
            ..LockConfig::default()
        };
        let locks = CoroutineLockComponent::new(&config);

        for key in 0..5 {
            locks.acquire(LockType::DB, key).await.unwrap().release_next_tick();
        }
        assert_eq!(locks.lock_count(), 5);

        assert_eq!(locks.update(), 2);
        assert_eq!(locks.update(), 2);
        assert_eq!(locks.update(), 1);
        assert_eq!(locks.update(), 0);
        assert_eq!(locks.lock_count(), 0);
    }

    #[tokio::test]
    async fn test_guard_released_on_panic() {
        let locks = component();
        let task = {
            let locks = locks.clone();
            tokio::spawn(async move {
                let _guard = locks.acquire(LockType::LOCATION, KEY).await.unwrap();
                panic!("handler blew up");
            })
        };
        assert!(task.await.is_err());
        assert!(!locks.is_locked(LockType::LOCATION, KEY));
    }

    /// Records the `level` field of every deep-queue warning
    struct DeepQueueLevels(Arc<Mutex<Vec<u64>>>);

    struct LevelField(Option<u64>);

    impl tracing::field::Visit for LevelField {
        fn record_u64(&mut self, field: &tracing::field::Field, value: u64) {
            if field.name() == "level" {
                self.0 = Some(value);
            }
        }

        fn record_debug(&mut self, _field: &tracing::field::Field, _value: &dyn fmt::Debug) {}
    }

    impl<S: tracing::Subscriber> tracing_subscriber::Layer<S> for DeepQueueLevels {
        fn on_event(&self, event: &tracing::Event<'_>, _ctx: tracing_subscriber::layer::Context<'_, S>) {
            if *event.metadata().level() != tracing::Level::WARN {
                return;
            }
            let mut field = LevelField(None);
            event.record(&mut field);
            if let Some(level) = field.0 {
                self.0.lock().push(level);
            }
        }
    }

    #[test_log::test(tokio::test)]
    async fn test_deep_queue_warns_at_threshold_multiples() {
        use tracing_subscriber::layer::SubscriberExt;

        let levels = Arc::new(Mutex::new(Vec::new()));
        let subscriber = tracing_subscriber::registry().with(DeepQueueLevels(levels.clone()));
        let _default = tracing::subscriber::set_default(subscriber);

        let config = LockConfig {
            level_warn_threshold: 2,
            ..LockConfig::default()
        };
        let locks = CoroutineLockComponent::new(&config);
        let first = locks.acquire(LockType::LOCATION, KEY).await.unwrap();

        let mut tasks = Vec::new();
        for _ in 0..5 {
            let locks = locks.clone();
            tasks.push(tokio::spawn(async move {
                locks.acquire(LockType::LOCATION, KEY).await.unwrap().level()
            }));
            tokio::task::yield_now().await;
        }

        drop(first);
        let mut handed = Vec::new();
        for task in tasks {
            handed.push(task.await.unwrap());
        }

        assert_eq!(handed, vec![1, 2, 3, 4, 5]);
        assert_eq!(*levels.lock(), vec![2, 4]);
        assert_eq!(locks.lock_count(), 0);
    }
}
