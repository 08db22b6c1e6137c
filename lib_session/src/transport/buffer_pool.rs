//! # Outbound Buffer Pool
//!
//! Lock-free byte accounting for transport buffers that have been lent out
//! but not yet written to the wire. A transport asks the pool before handing
//! out a buffer; the writer side gives the bytes back once the frame is gone.
//!
//! When the pool is exhausted, `get_buffer` returns `None` and the session
//! core backs off until the next tick instead of growing memory without bound.
//!
//! The counter is shared through an `Arc`, so the coordinator side that
//! acquires and the socket tasks that release can live on different threads.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// # Buffer Pool
///
/// A capacity in bytes plus an atomic in-use counter. Cloning shares the counter.
#[derive(Debug, Clone)]
pub struct BufferPool {
    capacity: u64,
    in_use: Arc<AtomicU64>,
}

impl BufferPool {
    /// Creates a pool that lends out at most `capacity` bytes at once.
    pub fn new(capacity: u64) -> Self {
        Self {
            capacity,
            in_use: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Reserves `bytes`. Returns `false`, reserving nothing, if that would
    /// exceed capacity.
    ///
    /// Uses a compare-exchange loop so that concurrent callers never push the
    /// counter past capacity, even briefly.
    pub fn try_acquire(&self, bytes: u64) -> bool {
        let mut current = self.in_use.load(Ordering::Relaxed);
        loop {
            let next = match current.checked_add(bytes) {
                Some(next) if next <= self.capacity => next,
                _ => return false,
            };
            match self.in_use.compare_exchange_weak(
                current,
                next,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    /// Returns `bytes` previously reserved with [`try_acquire`](Self::try_acquire).
    pub fn release(&self, bytes: u64) {
        // Saturate so a double release cannot wrap the counter.
        let _ = self
            .in_use
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| Some(v.saturating_sub(bytes)));
    }

    /// Bytes currently lent out.
    pub fn in_use(&self) -> u64 {
        self.in_use.load(Ordering::Relaxed)
    }

    /// Maximum bytes lent out at once.
    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    /// Current usage as a percentage of capacity.
    pub fn usage_percent(&self) -> f64 {
        if self.capacity == 0 {
            0.0
        } else {
            (self.in_use() as f64 / self.capacity as f64) * 100.0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_acquire_respects_capacity() {
        let pool = BufferPool::new(100);
        assert!(pool.try_acquire(60));
        assert!(!pool.try_acquire(50));
        assert_eq!(pool.in_use(), 60);
        assert!(pool.try_acquire(40));
        assert_eq!(pool.usage_percent(), 100.0);
    }

    #[test]
    fn test_release_is_shared_and_saturating() {
        let pool = BufferPool::new(10);
        let writer_side = pool.clone();
        assert!(pool.try_acquire(10));
        writer_side.release(10);
        assert_eq!(pool.in_use(), 0);
        writer_side.release(5);
        assert_eq!(pool.in_use(), 0);
    }

    #[test]
    fn test_zero_capacity_pool() {
        let pool = BufferPool::new(0);
        assert!(!pool.try_acquire(1));
        assert!(pool.try_acquire(0));
        assert_eq!(pool.usage_percent(), 0.0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_acquire_never_overshoots() {
        let pool = BufferPool::new(1000);
        let mut handles = Vec::new();
        for _ in 0..8 {
            let pool = pool.clone();
            handles.push(tokio::spawn(async move {
                let mut granted = 0u64;
                for _ in 0..100 {
                    if pool.try_acquire(7) {
                        granted += 7;
                    }
                    tokio::task::yield_now().await;
                }
                granted
            }));
        }

        let mut total = 0;
        for handle in handles {
            total += handle.await.unwrap();
        }
        assert_eq!(pool.in_use(), total);
        assert!(total <= 1000);
        assert_eq!(total, 1000 / 7 * 7);
    }
}
