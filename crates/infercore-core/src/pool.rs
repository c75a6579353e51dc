//! Warm Pool (C5).
//!
//! Keeps a bounded set of already-constructed runner instances alive
//! across requests, keyed by `(tenant, model, runner)`, with LRU+TTL
//! eviction and a single-flight barrier so concurrent requests for the
//! same key share one in-flight construction instead of racing to build
//! it twice.
//!
//! Single-flight construction uses a `watch::channel`-per-key
//! subscription: a waiter `subscribe()`s and loops on `changed()` until
//! a value lands instead of racing a second builder. Eviction uses an
//! `instant.elapsed()`-sorted sweep over the slot map.

use std::{
    collections::HashMap,
    future::Future,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use itertools::Itertools;
use parking_lot::Mutex;
use tokio::sync::watch;

use crate::{config::PoolConfig, error::CoreError, CoreResult};

/// Marker trait for values a [`Pool`] can hold. `release` runs on
/// eviction and on [`Pool::clear`]; a failure there is logged and does
/// not block the slot from being freed.
pub trait PooledResource: Send + Sync + 'static {
    fn release(&self) -> Result<(), String> {
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PoolKey {
    pub tenant_id: String,
    pub model_id: String,
    pub runner_name: String,
}

struct Entry<T> {
    sender: watch::Sender<Option<Arc<T>>>,
    last_used: Mutex<Instant>,
}

#[derive(Debug, Clone, Default)]
pub struct PoolStats {
    pub size: usize,
    pub max_size: usize,
    pub utilization: f64,
    /// How long ago each resident key was last touched.
    pub last_access: HashMap<PoolKey, Duration>,
}

/// A bounded, single-flight warm pool of `T` instances. Process-wide,
/// explicit-init object per spec §9; one `Pool` exists per runner
/// backend kind.
pub struct Pool<T: PooledResource> {
    config: PoolConfig,
    slots: Mutex<HashMap<PoolKey, Entry<T>>>,
    closed: AtomicBool,
}

impl<T: PooledResource> Pool<T> {
    pub fn new(config: PoolConfig) -> Self {
        Self { config, slots: Mutex::new(HashMap::new()), closed: AtomicBool::new(false) }
    }

    /// Returns the pooled instance for `key`, building it with `build`
    /// if absent. Concurrent callers for the same `key` share one
    /// construction: only the caller that wins the race to insert the
    /// slot actually runs `build`; the rest subscribe to its result.
    pub async fn get_or_create<F, Fut>(&self, key: PoolKey, build: F) -> CoreResult<Arc<T>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = CoreResult<T>>,
    {
        if self.closed.load(Ordering::Acquire) {
            return Err(CoreError::Internal("pool is closed".into()));
        }

        let (sender, is_owner) = {
            let mut slots = self.slots.lock();
            match slots.get(&key) {
                Some(entry) => {
                    *entry.last_used.lock() = Instant::now();
                    (entry.sender.clone(), false)
                }
                None => {
                    let (tx, _rx) = watch::channel(None);
                    slots.insert(key.clone(), Entry { sender: tx.clone(), last_used: Mutex::new(Instant::now()) });
                    (tx, true)
                }
            }
        };

        if is_owner {
            return self.build_and_publish(key, sender, build).await;
        }

        let mut receiver = sender.subscribe();
        loop {
            if let Some(value) = receiver.borrow_and_update().clone() {
                return Ok(value);
            }
            if receiver.changed().await.is_err() || !self.slots.lock().contains_key(&key) {
                return Err(CoreError::RunnerInitFailed(format!(
                    "pool entry for tenant={} model={} runner={} failed to build",
                    key.tenant_id, key.model_id, key.runner_name
                )));
            }
        }
    }

    async fn build_and_publish<F, Fut>(&self, key: PoolKey, sender: watch::Sender<Option<Arc<T>>>, build: F) -> CoreResult<Arc<T>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = CoreResult<T>>,
    {
        match build().await {
            Ok(value) => {
                let arc = Arc::new(value);
                // Evict down to capacity before publishing the new instance, so a
                // waiter can never observe both the outgoing LRU entry's slot gone
                // and the new one not yet live.
                self.maintain();
                let _ = sender.send(Some(arc.clone()));
                Ok(arc)
            }
            Err(err) => {
                self.slots.lock().remove(&key);
                let _ = sender.send(None);
                tracing::warn!(
                    event = "pool_build_failed",
                    tenant_id = %key.tenant_id,
                    model_id = %key.model_id,
                    runner_name = %key.runner_name,
                    error = %err,
                    "runner instance construction failed"
                );
                Err(err)
            }
        }
    }

    /// Builds and inserts an instance ahead of the first request, if one
    /// is not already present for `key`. Errors are logged, not
    /// propagated — prewarming is best-effort.
    pub async fn prewarm<F, Fut>(&self, key: PoolKey, build: F)
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = CoreResult<T>>,
    {
        if let Err(err) = self.get_or_create(key.clone(), build).await {
            tracing::warn!(event = "pool_prewarm_failed", tenant_id = %key.tenant_id, model_id = %key.model_id, error = %err, "prewarm failed");
        }
    }

    /// Drops and releases every pooled instance and closes the pool:
    /// subsequent `get_or_create` calls are rejected rather than silently
    /// rebuilding.
    pub fn clear(&self) {
        self.closed.store(true, Ordering::Release);
        let removed: Vec<Entry<T>> = self.slots.lock().drain().map(|(_, e)| e).collect();
        for entry in &removed {
            Self::release_entry(entry);
        }
    }

    pub fn stats(&self) -> PoolStats {
        let slots = self.slots.lock();
        let now = Instant::now();
        let size = slots.len();
        let max_size = self.config.max_size;
        let last_access = slots.iter().map(|(k, e)| (k.clone(), now.duration_since(*e.last_used.lock()))).collect();
        PoolStats {
            size,
            max_size,
            utilization: if max_size > 0 { size as f64 / max_size as f64 } else { 0.0 },
            last_access,
        }
    }

    /// LRU+TTL sweep: first drops anything idle past `idle_ttl_secs`,
    /// then — if still over `max_size` — drops the least-recently-used
    /// entries down to `max_size`.
    fn maintain(&self) {
        let mut slots = self.slots.lock();
        let now = Instant::now();
        let ttl = Duration::from_secs(self.config.idle_ttl_secs);

        let expired: Vec<PoolKey> = slots
            .iter()
            .filter(|(_, e)| now.duration_since(*e.last_used.lock()) >= ttl)
            .map(|(k, _)| k.clone())
            .collect();
        for key in expired {
            if let Some(entry) = slots.remove(&key) {
                Self::release_entry(&entry);
            }
        }

        if slots.len() <= self.config.max_size {
            return;
        }

        let by_age = slots
            .iter()
            .map(|(k, e)| (k.clone(), now.duration_since(*e.last_used.lock())))
            .sorted_unstable_by_key(|(_, age)| *age);
        for (key, _) in by_age.skip(self.config.max_size) {
            if let Some(entry) = slots.remove(&key) {
                Self::release_entry(&entry);
            }
        }
    }

    fn release_entry(entry: &Entry<T>) {
        if let Some(value) = entry.sender.borrow().as_ref() {
            if let Err(err) = value.release() {
                tracing::warn!(event = "pool_release_failed", error = %err, "failed to release pooled resource");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Dummy(u32);
    impl PooledResource for Dummy {}

    fn key(n: &str) -> PoolKey {
        PoolKey { tenant_id: "t1".into(), model_id: "m1".into(), runner_name: n.into() }
    }

    fn small_pool() -> Pool<Dummy> {
        Pool::new(PoolConfig { max_size: 1, idle_ttl_secs: 900 })
    }

    #[tokio::test]
    async fn concurrent_requests_share_one_construction() {
        let pool = Pool::new(PoolConfig { max_size: 10, idle_ttl_secs: 900 });
        let builds = Arc::new(AtomicUsize::new(0));
        let pool = Arc::new(pool);

        let mut handles = vec![];
        for _ in 0..8 {
            let pool = Arc::clone(&pool);
            let builds = Arc::clone(&builds);
            handles.push(tokio::spawn(async move {
                pool.get_or_create(key("r"), || async move {
                    builds.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    Ok(Dummy(42))
                })
                .await
            }));
        }

        for h in handles {
            let value = h.await.unwrap().unwrap();
            assert_eq!(value.0, 42);
        }
        assert_eq!(builds.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn build_failure_is_propagated_and_clears_slot() {
        let pool = Pool::new(PoolConfig { max_size: 10, idle_ttl_secs: 900 });
        let err = pool.get_or_create(key("r"), || async { Err::<Dummy, _>(CoreError::RunnerInitFailed("boom".into())) }).await;
        assert!(err.is_err());
        assert_eq!(pool.stats().size, 0);
    }

    #[tokio::test]
    async fn eviction_respects_max_size() {
        let pool = small_pool();
        pool.get_or_create(key("a"), || async { Ok(Dummy(1)) }).await.unwrap();
        pool.get_or_create(key("b"), || async { Ok(Dummy(2)) }).await.unwrap();
        assert_eq!(pool.stats().size, 1);
    }

    #[tokio::test]
    async fn clear_empties_the_pool() {
        let pool = small_pool();
        pool.get_or_create(key("a"), || async { Ok(Dummy(1)) }).await.unwrap();
        pool.clear();
        assert_eq!(pool.stats().size, 0);
    }

    #[tokio::test]
    async fn get_or_create_after_clear_is_rejected() {
        let pool = small_pool();
        pool.get_or_create(key("a"), || async { Ok(Dummy(1)) }).await.unwrap();
        pool.clear();
        let err = pool.get_or_create(key("b"), || async { Ok(Dummy(2)) }).await;
        assert!(matches!(err, Err(CoreError::Internal(_))));
    }

    #[tokio::test]
    async fn stats_report_utilization_and_last_access() {
        let pool = Pool::new(PoolConfig { max_size: 4, idle_ttl_secs: 900 });
        pool.get_or_create(key("a"), || async { Ok(Dummy(1)) }).await.unwrap();
        pool.get_or_create(key("b"), || async { Ok(Dummy(2)) }).await.unwrap();
        let stats = pool.stats();
        assert_eq!(stats.size, 2);
        assert_eq!(stats.utilization, 0.5);
        assert_eq!(stats.last_access.len(), 2);
        assert!(stats.last_access.contains_key(&key("a")));
        assert!(stats.last_access.contains_key(&key("b")));
    }
}
