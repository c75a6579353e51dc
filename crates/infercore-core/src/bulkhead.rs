//! Bulkhead. Caps the number of in-flight executions
//! against a single runner instance and bounds how many more callers may
//! queue behind it, so one overloaded runner cannot starve the whole
//! pool.
//!
//! `tokio::sync::Semaphore` fits because a bulkhead only needs a count,
//! not per-slot identity or inspection.

use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};

use tokio::sync::{OwnedSemaphorePermit, Semaphore, SemaphorePermit};

use crate::{config::BulkheadConfig, error::CoreError, CoreResult};

/// A held bulkhead slot; releases on drop.
pub struct BulkheadGuard<'a> {
    _permit: SemaphorePermit<'a>,
    queued: &'a AtomicUsize,
}

impl Drop for BulkheadGuard<'_> {
    fn drop(&mut self) {
        self.queued.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Same slot, held independent of any borrow — for work handed off to a
/// spawned task (the streaming path) where a borrowed guard's lifetime
/// can't stretch across the `tokio::spawn` boundary.
pub struct OwnedBulkheadGuard {
    _permit: OwnedSemaphorePermit,
    queued: Arc<AtomicUsize>,
}

impl Drop for OwnedBulkheadGuard {
    fn drop(&mut self) {
        self.queued.fetch_sub(1, Ordering::AcqRel);
    }
}

/// One bulkhead per runner (or per runner instance, depending on how
/// coarsely the orchestrator wants to isolate failure domains).
pub struct Bulkhead {
    semaphore: Arc<Semaphore>,
    /// Total outstanding callers (holding a permit or waiting for one)
    /// allowed before a new caller is rejected with `BUSY`: `capacity +
    /// queue_depth`, not `queue_depth` alone — `queue_depth` bounds the
    /// wait queue *beyond* capacity, it does not cap total admission.
    total_capacity: usize,
    queued: Arc<AtomicUsize>,
}

impl Bulkhead {
    pub fn new(config: BulkheadConfig) -> Self {
        let capacity = config.capacity.max(1);
        Self {
            semaphore: Arc::new(Semaphore::new(capacity)),
            total_capacity: capacity + config.queue_depth,
            queued: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Acquires a slot, queueing if the capacity is currently full.
    /// Rejects immediately with [`CoreError::Busy`] if `capacity +
    /// queue_depth` callers are already holding or waiting for a permit —
    /// callers should not pile up indefinitely behind a saturated runner.
    pub async fn acquire(&self) -> CoreResult<BulkheadGuard<'_>> {
        if self.queued.fetch_add(1, Ordering::AcqRel) >= self.total_capacity {
            self.queued.fetch_sub(1, Ordering::AcqRel);
            return Err(CoreError::Busy);
        }

        match self.semaphore.acquire().await {
            Ok(permit) => Ok(BulkheadGuard { _permit: permit, queued: &self.queued }),
            Err(_) => {
                self.queued.fetch_sub(1, Ordering::AcqRel);
                Err(CoreError::Internal("bulkhead semaphore closed".into()))
            }
        }
    }

    /// Same contract as [`Self::acquire`], but the returned guard owns
    /// its permit so it can be moved into a spawned task.
    pub async fn acquire_owned(self: &Arc<Self>) -> CoreResult<OwnedBulkheadGuard> {
        if self.queued.fetch_add(1, Ordering::AcqRel) >= self.total_capacity {
            self.queued.fetch_sub(1, Ordering::AcqRel);
            return Err(CoreError::Busy);
        }

        match Arc::clone(&self.semaphore).acquire_owned().await {
            Ok(permit) => Ok(OwnedBulkheadGuard { _permit: permit, queued: self.queued.clone() }),
            Err(_) => {
                self.queued.fetch_sub(1, Ordering::AcqRel);
                Err(CoreError::Internal("bulkhead semaphore closed".into()))
            }
        }
    }

    pub fn queued(&self) -> usize {
        self.queued.load(Ordering::Acquire)
    }

    pub fn available_permits(&self) -> usize {
        self.semaphore.available_permits()
    }
}

/// Shared handle, convenient for the orchestrator to keep one per runner
/// in a map without wrapping every call site in `Arc::clone` boilerplate.
pub type SharedBulkhead = Arc<Bulkhead>;

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn acquire_bounds_concurrency() {
        let bh = Bulkhead::new(BulkheadConfig { capacity: 1, queue_depth: 10 });
        let guard = bh.acquire().await.unwrap();
        assert_eq!(bh.available_permits(), 0);
        drop(guard);
        assert_eq!(bh.available_permits(), 1);
    }

    #[tokio::test]
    async fn queue_overflow_rejects_immediately() {
        let bh = Arc::new(Bulkhead::new(BulkheadConfig { capacity: 1, queue_depth: 0 }));
        let _held = bh.acquire().await.unwrap();
        let err = bh.acquire().await;
        assert!(matches!(err, Err(CoreError::Busy)));
    }

    #[tokio::test]
    async fn guard_drop_frees_queue_slot() {
        let bh = Bulkhead::new(BulkheadConfig { capacity: 2, queue_depth: 1 });
        let g1 = bh.acquire().await.unwrap();
        assert_eq!(bh.queued(), 1);
        drop(g1);
        assert_eq!(bh.queued(), 0);
    }

    #[tokio::test]
    async fn capacity_is_fully_reachable_before_queueing() {
        let bh = Bulkhead::new(BulkheadConfig { capacity: 2, queue_depth: 1 });
        let g1 = bh.acquire().await.unwrap();
        let g2 = bh.acquire().await.unwrap();
        assert_eq!(bh.available_permits(), 0);
        drop(g1);
        drop(g2);
    }
}
