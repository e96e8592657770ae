//! FIFO slot gate bounding concurrent async work.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Grant {
    /// A counted slot, handed over by `release` or a capacity increase
    Tracked,
    /// Woken by `clear_queue`; counts against nothing
    Untracked,
}

struct LimiterState {
    max_concurrency: usize,
    active: usize,
    waiters: VecDeque<oneshot::Sender<Grant>>,
}

impl LimiterState {
    /// Hand one tracked slot to the oldest waiter still listening.
    fn wake_next(&mut self) -> bool {
        while let Some(waiter) = self.waiters.pop_front() {
            if waiter.send(Grant::Tracked).is_ok() {
                return true;
            }
        }
        false
    }
}

struct LimiterInner {
    state: Mutex<LimiterState>,
}

impl LimiterInner {
    fn release(&self) {
        let mut state = self.state.lock();
        if state.active <= state.max_concurrency && state.wake_next() {
            // Slot moved straight to a waiter, `active` is unchanged
            return;
        }
        state.active = state.active.saturating_sub(1);
    }
}

/// Bounds how many holders of a [`Slot`] exist at once.
///
/// Waiters are resumed strictly in the order they called [`acquire`]. A
/// released slot goes directly to the longest waiter, so a fresh `acquire`
/// can never overtake the queue.
///
/// [`acquire`]: ConcurrencyLimiter::acquire
#[derive(Clone)]
pub struct ConcurrencyLimiter {
    inner: Arc<LimiterInner>,
}

impl ConcurrencyLimiter {
    pub fn new(max_concurrency: usize) -> Self {
        Self {
            inner: Arc::new(LimiterInner {
                state: Mutex::new(LimiterState {
                    max_concurrency,
                    active: 0,
                    waiters: VecDeque::new(),
                }),
            }),
        }
    }

    /// Wait for a slot. The slot is released when the returned [`Slot`] drops.
    pub async fn acquire(&self) -> Slot {
        let receiver = {
            let mut state = self.inner.state.lock();
            if state.active < state.max_concurrency && state.waiters.is_empty() {
                state.active += 1;
                return Slot::tracked(self.inner.clone());
            }

            let (sender, receiver) = oneshot::channel();
            state.waiters.push_back(sender);
            receiver
        };

        let mut pending = PendingGrant {
            receiver,
            inner: self.inner.clone(),
        };

        match (&mut pending.receiver).await {
            Ok(Grant::Tracked) => Slot::tracked(self.inner.clone()),
            Ok(Grant::Untracked) | Err(_) => Slot::untracked(),
        }
    }

    /// Take a slot only if one is free right now and nobody is queued.
    pub fn try_acquire(&self) -> Option<Slot> {
        let mut state = self.inner.state.lock();
        if state.active < state.max_concurrency && state.waiters.is_empty() {
            state.active += 1;
            Some(Slot::tracked(self.inner.clone()))
        } else {
            None
        }
    }

    /// Resize the limiter. Growing wakes queued waiters up to the new capacity;
    /// shrinking never preempts current holders.
    pub fn set_max_concurrency(&self, max_concurrency: usize) {
        let mut state = self.inner.state.lock();
        state.max_concurrency = max_concurrency;

        while state.active < state.max_concurrency && state.wake_next() {
            state.active += 1;
        }
    }

    /// Resume every queued waiter immediately **without** granting it a slot.
    ///
    /// This is a shutdown escape hatch: woken callers receive an untracked
    /// [`Slot`] and run unsynchronized, so more callers than
    /// `max_concurrency` may proceed at once. Callers that care check
    /// [`Slot::is_tracked`] and treat `false` as cancellation.
    pub fn clear_queue(&self) -> usize {
        let mut state = self.inner.state.lock();
        let mut cleared = 0;

        for waiter in state.waiters.drain(..) {
            if waiter.send(Grant::Untracked).is_ok() {
                cleared += 1;
            }
        }

        if cleared > 0 {
            warn!(cleared, "Limiter queue cleared, waiters proceed unsynchronized");
        }
        cleared
    }

    pub fn max_concurrency(&self) -> usize {
        self.inner.state.lock().max_concurrency
    }

    pub fn active(&self) -> usize {
        self.inner.state.lock().active
    }

    pub fn available(&self) -> usize {
        let state = self.inner.state.lock();
        state.max_concurrency.saturating_sub(state.active)
    }

    pub fn queued(&self) -> usize {
        self.inner.state.lock().waiters.len()
    }
}

/// Receiver side of a queued `acquire`. If the waiting future is dropped after
/// a slot was handed to it, the slot goes back to the limiter.
struct PendingGrant {
    receiver: oneshot::Receiver<Grant>,
    inner: Arc<LimiterInner>,
}

impl Drop for PendingGrant {
    fn drop(&mut self) {
        if let Ok(Grant::Tracked) = self.receiver.try_recv() {
            self.inner.release();
        }
    }
}

/// A held limiter slot.
#[must_use = "the slot is released as soon as it is dropped"]
pub struct Slot {
    inner: Option<Arc<LimiterInner>>,
}

impl Slot {
    fn tracked(inner: Arc<LimiterInner>) -> Self {
        Self { inner: Some(inner) }
    }

    fn untracked() -> Self {
        Self { inner: None }
    }

    /// `false` when the slot came from [`ConcurrencyLimiter::clear_queue`].
    pub fn is_tracked(&self) -> bool {
        self.inner.is_some()
    }

    pub fn release(self) {
        drop(self)
    }
}

impl Drop for Slot {
    fn drop(&mut self) {
        if let Some(inner) = self.inner.take() {
            inner.release();
        }
    }
}

/// Limiters shared by name, so unrelated call sites can bound the same resource.
#[derive(Clone, Default)]
pub struct LimiterRegistry {
    limiters: Arc<Mutex<HashMap<String, ConcurrencyLimiter>>>,
}

impl LimiterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The limiter registered under `key`, created with `max_concurrency` if new.
    pub fn get_or_create(&self, key: &str, max_concurrency: usize) -> ConcurrencyLimiter {
        self.limiters
            .lock()
            .entry(key.to_string())
            .or_insert_with(|| {
                debug!(key, max_concurrency, "Limiter created");
                ConcurrencyLimiter::new(max_concurrency)
            })
            .clone()
    }

    pub fn get(&self, key: &str) -> Option<ConcurrencyLimiter> {
        self.limiters.lock().get(key).cloned()
    }

    pub fn remove(&self, key: &str) -> Option<ConcurrencyLimiter> {
        self.limiters.lock().remove(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::sync::mpsc;

    #[tokio::test]
    async fn test_immediate_acquire() {
        let limiter = ConcurrencyLimiter::new(2);
        let a = limiter.acquire().await;
        let b = limiter.acquire().await;

        assert!(a.is_tracked() && b.is_tracked());
        assert_eq!(limiter.available(), 0);
        assert!(limiter.try_acquire().is_none());

        drop(a);
        assert_eq!(limiter.available(), 1);
        drop(b);
        assert_eq!(limiter.active(), 0);
    }

    #[tokio::test]
    async fn test_fifo_order() {
        let limiter = ConcurrencyLimiter::new(1);
        let first = limiter.acquire().await;
        let (order_tx, mut order_rx) = mpsc::unbounded_channel();

        let mut handles = Vec::new();
        for name in ["A", "B", "C"] {
            let task_limiter = limiter.clone();
            let order_tx = order_tx.clone();
            handles.push(tokio::spawn(async move {
                let slot = task_limiter.acquire().await;
                order_tx.send(name).unwrap();
                tokio::time::sleep(Duration::from_millis(5)).await;
                drop(slot);
            }));
            // Make the enqueue order deterministic
            while limiter.queued() < handles.len() {
                tokio::task::yield_now().await;
            }
        }

        drop(first);
        for handle in handles {
            handle.await.unwrap();
        }
        drop(order_tx);

        let mut order = Vec::new();
        while let Some(name) = order_rx.recv().await {
            order.push(name);
        }
        assert_eq!(order, vec!["A", "B", "C"]);
        assert_eq!(limiter.active(), 0);
    }

    #[tokio::test]
    async fn test_release_hands_slot_to_waiter() {
        let limiter = ConcurrencyLimiter::new(1);
        let held = limiter.acquire().await;

        let waiter = tokio::spawn({
            let limiter = limiter.clone();
            async move { limiter.acquire().await.is_tracked() }
        });
        while limiter.queued() == 0 {
            tokio::task::yield_now().await;
        }

        drop(held);
        // A newcomer cannot take the slot meant for the queued waiter
        assert!(limiter.try_acquire().is_none());
        assert!(waiter.await.unwrap());
        assert_eq!(limiter.active(), 0);
    }

    #[tokio::test]
    async fn test_grow_wakes_waiters() {
        let limiter = ConcurrencyLimiter::new(1);
        let _held = limiter.acquire().await;

        let waiters: Vec<_> = (0..2)
            .map(|_| {
                let limiter = limiter.clone();
                tokio::spawn(async move {
                    let slot = limiter.acquire().await;
                    slot.is_tracked()
                })
            })
            .collect();
        while limiter.queued() < 2 {
            tokio::task::yield_now().await;
        }

        limiter.set_max_concurrency(3);
        for waiter in waiters {
            assert!(waiter.await.unwrap());
        }
        assert_eq!(limiter.queued(), 0);
    }

    #[tokio::test]
    async fn test_shrink_does_not_preempt() {
        let limiter = ConcurrencyLimiter::new(3);
        let a = limiter.acquire().await;
        let b = limiter.acquire().await;
        let c = limiter.acquire().await;

        limiter.set_max_concurrency(1);
        assert_eq!(limiter.active(), 3);
        assert_eq!(limiter.available(), 0);

        drop(a);
        drop(b);
        assert_eq!(limiter.active(), 1);
        assert!(limiter.try_acquire().is_none());

        drop(c);
        assert!(limiter.try_acquire().is_some());
    }

    #[tokio::test]
    async fn test_clear_queue_grants_untracked() {
        let limiter = ConcurrencyLimiter::new(1);
        let held = limiter.acquire().await;

        let waiter = tokio::spawn({
            let limiter = limiter.clone();
            async move { limiter.acquire().await.is_tracked() }
        });
        while limiter.queued() == 0 {
            tokio::task::yield_now().await;
        }

        assert_eq!(limiter.clear_queue(), 1);
        assert!(!waiter.await.unwrap());
        // The untracked slot released nothing
        assert_eq!(limiter.active(), 1);
        drop(held);
        assert_eq!(limiter.active(), 0);
    }

    #[tokio::test]
    async fn test_dropped_waiter_does_not_leak() {
        let limiter = ConcurrencyLimiter::new(1);
        let held = limiter.acquire().await;

        let waiter = tokio::spawn({
            let limiter = limiter.clone();
            async move {
                let _slot = limiter.acquire().await;
            }
        });
        while limiter.queued() == 0 {
            tokio::task::yield_now().await;
        }
        waiter.abort();
        let _ = waiter.await;

        drop(held);
        assert_eq!(limiter.active(), 0);
        assert!(limiter.try_acquire().is_some());
    }

    #[test]
    fn test_registry_shares_limiters() {
        let registry = LimiterRegistry::new();
        let a = registry.get_or_create("uploads", 2);
        let b = registry.get_or_create("uploads", 5);

        assert_eq!(b.max_concurrency(), 2);
        let _slot = a.try_acquire().unwrap();
        assert_eq!(b.active(), 1);
        assert!(registry.get("missing").is_none());
        assert!(registry.remove("uploads").is_some());
    }
}
