//! Bounded-concurrency admission control.
//!
//! Grounded on the `CronScheduler`'s two-level `Arc<Semaphore>` admission
//! pattern (`try_acquire` for non-blocking rejection, the permit itself
//! releasing on drop): here a single semaphore of `max_concurrent` permits
//! plus an explicit bounded counter of FIFO waiters models the combined
//! "in-flight + queued" capacity of §4.4, rather than the scheduler's
//! separate global/per-schedule split (inference has only one scope).

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

pub struct Bulkhead {
    semaphore: Arc<Semaphore>,
    max_concurrent: usize,
    max_queue_size: usize,
    waiting: AtomicUsize,
}

#[derive(Debug, Clone, Copy)]
pub struct BulkheadRejected {
    pub current_load: usize,
    pub max_concurrent: usize,
}

impl Bulkhead {
    pub fn new(max_concurrent: usize, max_queue_size: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(max_concurrent)),
            max_concurrent,
            max_queue_size,
            waiting: AtomicUsize::new(0),
        }
    }

    pub fn current_load(&self) -> usize {
        self.max_concurrent - self.semaphore.available_permits()
    }

    pub fn queue_size(&self) -> usize {
        self.waiting.load(Ordering::SeqCst)
    }

    /// Admits immediately if a permit is free. Otherwise, if there is room
    /// in the bounded wait queue, blocks (FIFO, via the semaphore's own
    /// fair wake order) until a permit frees up. If the wait queue is also
    /// full, rejects synchronously — never blocks in that case.
    pub async fn acquire(&self) -> Result<OwnedSemaphorePermit, BulkheadRejected> {
        if let Ok(permit) = self.semaphore.clone().try_acquire_owned() {
            return Ok(permit);
        }

        let waiting = self.waiting.fetch_add(1, Ordering::SeqCst);
        if waiting >= self.max_queue_size {
            self.waiting.fetch_sub(1, Ordering::SeqCst);
            return Err(BulkheadRejected {
                current_load: self.current_load(),
                max_concurrent: self.max_concurrent,
            });
        }

        let permit = self
            .semaphore
            .clone()
            .acquire_owned()
            .await
            .expect("semaphore is never closed");
        self.waiting.fetch_sub(1, Ordering::SeqCst);
        Ok(permit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn rejects_synchronously_once_in_flight_and_queue_are_full() {
        let bh = Arc::new(Bulkhead::new(2, 2));
        let p1 = bh.acquire().await.unwrap();
        let p2 = bh.acquire().await.unwrap();
        assert_eq!(bh.current_load(), 2);

        let bh_a = bh.clone();
        let bh_b = bh.clone();
        let waiter_a = tokio::spawn(async move { bh_a.acquire().await });
        let waiter_b = tokio::spawn(async move { bh_b.acquire().await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(bh.queue_size(), 2);

        let fifth = bh.acquire().await;
        assert!(fifth.is_err());
        let rejected = fifth.unwrap_err();
        assert_eq!(rejected.current_load, 2);
        assert_eq!(rejected.max_concurrent, 2);

        drop(p1);
        drop(p2);
        waiter_a.await.unwrap().unwrap();
        waiter_b.await.unwrap().unwrap();
    }
}
