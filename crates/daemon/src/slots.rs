//! Bounded concurrency gate for worker processes.
//!
//! Wraps a tokio semaphore; FIFO fairness comes from the semaphore's own
//! wait queue. A [`Slot`] is an RAII guard, so a job that errors or panics
//! still gives its capacity back.

use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Error type for slot acquisition
#[derive(Debug, Error)]
pub enum SlotError {
    /// The underlying semaphore was closed during shutdown
    #[error("slot limiter is closed")]
    Closed,
}

/// Fixed-capacity pool of job slots.
#[derive(Debug, Clone)]
pub struct SlotLimiter {
    semaphore: Arc<Semaphore>,
    capacity: usize,
}

impl SlotLimiter {
    /// Create a limiter with `capacity` slots (at least one).
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            semaphore: Arc::new(Semaphore::new(capacity)),
            capacity,
        }
    }

    /// Wait until a slot is free and take it.
    pub async fn acquire(&self) -> Result<Slot, SlotError> {
        let permit = self
            .semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| SlotError::Closed)?;
        Ok(Slot {
            permit: Some(permit),
        })
    }

    /// Take a slot only if one is free right now.
    pub fn try_acquire(&self) -> Option<Slot> {
        self.semaphore
            .clone()
            .try_acquire_owned()
            .ok()
            .map(|permit| Slot {
                permit: Some(permit),
            })
    }

    /// Best-effort snapshot; only good for deciding whether to say "queued".
    pub fn is_full(&self) -> bool {
        self.semaphore.available_permits() == 0
    }

    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    pub fn in_use(&self) -> usize {
        self.capacity.saturating_sub(self.available())
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

/// A held unit of capacity.
#[derive(Debug)]
pub struct Slot {
    permit: Option<OwnedSemaphorePermit>,
}

impl Slot {
    /// Give the slot back. Calling this again is a no-op.
    pub fn release(&mut self) {
        self.permit.take();
    }

    pub fn is_held(&self) -> bool {
        self.permit.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[test]
    fn test_zero_capacity_is_raised_to_one() {
        let limiter = SlotLimiter::new(0);
        assert_eq!(limiter.capacity(), 1);
        assert_eq!(limiter.available(), 1);
    }

    #[test]
    fn test_try_acquire_until_full() {
        let limiter = SlotLimiter::new(2);
        assert!(!limiter.is_full());

        let first = limiter.try_acquire();
        let second = limiter.try_acquire();
        assert!(first.is_some());
        assert!(second.is_some());
        assert!(limiter.is_full());
        assert_eq!(limiter.in_use(), 2);
        assert!(limiter.try_acquire().is_none());

        drop(first);
        assert!(!limiter.is_full());
        assert_eq!(limiter.in_use(), 1);
    }

    #[test]
    fn test_double_release_does_not_inflate_capacity() {
        let limiter = SlotLimiter::new(3);
        let mut slot = limiter.try_acquire().unwrap();
        assert_eq!(limiter.available(), 2);

        slot.release();
        assert!(!slot.is_held());
        assert_eq!(limiter.available(), 3);

        slot.release();
        drop(slot);
        assert_eq!(limiter.available(), 3);
    }

    #[tokio::test]
    async fn test_acquire_waits_for_release() {
        let limiter = SlotLimiter::new(1);
        let mut held = limiter.acquire().await.unwrap();

        let waiter = {
            let limiter = limiter.clone();
            tokio::spawn(async move { limiter.acquire().await.map(|_| ()) })
        };

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(!waiter.is_finished());

        held.release();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter should be admitted after release")
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_burst_never_exceeds_capacity() {
        let limiter = SlotLimiter::new(5);
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..100 {
            let limiter = limiter.clone();
            let active = active.clone();
            let peak = peak.clone();
            handles.push(tokio::spawn(async move {
                let _slot = limiter.acquire().await.unwrap();
                let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(2)).await;
                active.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert!(peak.load(Ordering::SeqCst) <= 5);
        assert_eq!(limiter.available(), 5);
    }

    #[derive(Debug, Clone)]
    enum Op {
        Acquire,
        Release(usize),
        Drop(usize),
    }

    fn op_strategy() -> impl Strategy<Value = Op> {
        prop_oneof![
            Just(Op::Acquire),
            (0usize..16).prop_map(Op::Release),
            (0usize..16).prop_map(Op::Drop),
        ]
    }

    // Any interleaving of acquire / release / drop, including repeated
    // releases of the same slot, keeps the pool within [0, capacity].
    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        #[test]
        fn prop_available_never_exceeds_capacity(
            capacity in 1usize..8,
            ops in proptest::collection::vec(op_strategy(), 0..64),
        ) {
            let limiter = SlotLimiter::new(capacity);
            let mut slots: Vec<Slot> = Vec::new();

            for op in ops {
                match op {
                    Op::Acquire => {
                        if let Some(slot) = limiter.try_acquire() {
                            slots.push(slot);
                        }
                    }
                    Op::Release(i) => {
                        if !slots.is_empty() {
                            let idx = i % slots.len();
                            slots[idx].release();
                        }
                    }
                    Op::Drop(i) => {
                        if !slots.is_empty() {
                            let idx = i % slots.len();
                            slots.remove(idx);
                        }
                    }
                }

                let held = slots.iter().filter(|s| s.is_held()).count();
                prop_assert!(limiter.available() <= capacity);
                prop_assert_eq!(limiter.in_use(), held);
            }
        }
    }
}
