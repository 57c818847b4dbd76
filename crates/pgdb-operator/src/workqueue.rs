//! Deduplicating, rate-limited work queue
//!
//! Items are identities, not payloads: adding an item that is already queued
//! is a no-op, and adding an item that is currently being processed only marks
//! it dirty so it is queued again once the worker calls [`WorkQueue::done`].
//! This gives two guarantees the controller relies on:
//!
//! - a given item is never handed to two workers at the same time
//! - any number of adds between two `get`s collapse into one processing run

use crate::rate_limiter::RateLimiter;
use parking_lot::Mutex;
use std::collections::{HashSet, VecDeque};
use std::hash::Hash;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::Notify;
use tracing::trace;

struct QueueState<T> {
    /// FIFO of items ready to be handed out
    queue: VecDeque<T>,
    /// Items that need processing (queued, or re-added while in flight)
    dirty: HashSet<T>,
    /// Items currently held by a worker
    processing: HashSet<T>,
    shutting_down: bool,
}

/// Work queue with per-item coalescing and rate-limited requeue
pub struct WorkQueue<T> {
    name: String,
    state: Mutex<QueueState<T>>,
    notify: Notify,
    rate_limiter: Box<dyn RateLimiter<T>>,
}

impl<T> WorkQueue<T>
where
    T: Eq + Hash + Clone + Send + Sync + std::fmt::Debug + 'static,
{
    /// Create a queue that uses `rate_limiter` for [`WorkQueue::add_rate_limited`]
    pub fn new(name: impl Into<String>, rate_limiter: impl RateLimiter<T> + 'static) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            state: Mutex::new(QueueState {
                queue: VecDeque::new(),
                dirty: HashSet::new(),
                processing: HashSet::new(),
                shutting_down: false,
            }),
            notify: Notify::new(),
            rate_limiter: Box::new(rate_limiter),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Mark `item` as needing processing
    pub fn add(&self, item: T) {
        let mut state = self.state.lock();
        if state.shutting_down || state.dirty.contains(&item) {
            return;
        }
        state.dirty.insert(item.clone());
        if state.processing.contains(&item) {
            trace!(queue = %self.name, ?item, "Item in flight, marked dirty");
            return;
        }
        state.queue.push_back(item);
        drop(state);
        self.notify.notify_one();
    }

    /// Wait for the next item; `None` once the queue is shut down and drained
    pub async fn get(&self) -> Option<T> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            // Register before checking state so a shutdown in between is not missed
            notified.as_mut().enable();

            {
                let mut state = self.state.lock();
                if let Some(item) = state.queue.pop_front() {
                    state.processing.insert(item.clone());
                    state.dirty.remove(&item);
                    let more = !state.queue.is_empty();
                    drop(state);
                    if more {
                        self.notify.notify_one();
                    }
                    return Some(item);
                }
                if state.shutting_down {
                    return None;
                }
            }

            notified.await;
        }
    }

    /// Mark processing of `item` finished, requeueing it if it was dirtied meanwhile
    pub fn done(&self, item: &T) {
        let mut state = self.state.lock();
        state.processing.remove(item);
        if state.dirty.contains(item) {
            state.queue.push_back(item.clone());
            drop(state);
            self.notify.notify_one();
        }
    }

    /// Add `item` once `delay` has elapsed
    pub fn add_after(self: &Arc<Self>, item: T, delay: Duration) {
        if self.is_shutting_down() {
            return;
        }
        if delay.is_zero() {
            self.add(item);
            return;
        }

        let queue: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(queue) = queue.upgrade() {
                queue.add(item);
            }
        });
    }

    /// Add `item` after the rate limiter says it may be retried
    pub fn add_rate_limited(self: &Arc<Self>, item: T) {
        let delay = self.rate_limiter.when(&item);
        trace!(queue = %self.name, ?item, delay_ms = delay.as_millis() as u64, "Requeue scheduled");
        self.add_after(item, delay);
    }

    /// Reset the failure history of `item`
    pub fn forget(&self, item: &T) {
        self.rate_limiter.forget(item);
    }

    /// Number of rate-limited requeues recorded for `item`
    pub fn num_requeues(&self, item: &T) -> u32 {
        self.rate_limiter.num_requeues(item)
    }

    /// Number of items waiting to be handed out
    pub fn len(&self) -> usize {
        self.state.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stop accepting items; `get` returns `None` once the queue drains
    pub fn shutdown(&self) {
        self.state.lock().shutting_down = true;
        self.notify.notify_waiters();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.state.lock().shutting_down
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rate_limiter::{default_controller_rate_limiter, ItemExponentialFailureRateLimiter};

    fn queue() -> Arc<WorkQueue<String>> {
        WorkQueue::new("test", default_controller_rate_limiter())
    }

    #[tokio::test]
    async fn test_add_coalesces() {
        let q = queue();
        q.add("default/app1".to_string());
        q.add("default/app1".to_string());
        q.add("default/app1".to_string());
        q.add("default/app2".to_string());

        assert_eq!(q.len(), 2);
        assert_eq!(q.get().await.as_deref(), Some("default/app1"));
        assert_eq!(q.get().await.as_deref(), Some("default/app2"));
        assert!(q.is_empty());
    }

    #[tokio::test]
    async fn test_add_while_processing_is_deferred() {
        let q = queue();
        q.add("k".to_string());
        let item = q.get().await.unwrap();

        // Re-added while in flight: not handed out until done
        q.add("k".to_string());
        q.add("k".to_string());
        assert_eq!(q.len(), 0);

        q.done(&item);
        assert_eq!(q.len(), 1);
        assert_eq!(q.get().await.as_deref(), Some("k"));
        q.done(&item);
        assert!(q.is_empty());
    }

    #[tokio::test]
    async fn test_done_without_dirty_does_not_requeue() {
        let q = queue();
        q.add("k".to_string());
        let item = q.get().await.unwrap();
        q.done(&item);
        assert!(q.is_empty());
    }

    #[tokio::test]
    async fn test_get_waits_for_add() {
        let q = queue();
        let getter = {
            let q = q.clone();
            tokio::spawn(async move { q.get().await })
        };

        tokio::task::yield_now().await;
        q.add("late".to_string());

        assert_eq!(getter.await.unwrap().as_deref(), Some("late"));
    }

    #[tokio::test]
    async fn test_shutdown_wakes_waiters() {
        let q = queue();
        let getters: Vec<_> = (0..3)
            .map(|_| {
                let q = q.clone();
                tokio::spawn(async move { q.get().await })
            })
            .collect();

        tokio::task::yield_now().await;
        q.shutdown();

        for getter in getters {
            assert_eq!(getter.await.unwrap(), None);
        }
    }

    #[tokio::test]
    async fn test_shutdown_drains_then_stops() {
        let q = queue();
        q.add("a".to_string());
        q.shutdown();

        // Adds after shutdown are ignored
        q.add("b".to_string());

        assert_eq!(q.get().await.as_deref(), Some("a"));
        assert_eq!(q.get().await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_add_after_delays() {
        let q = queue();
        q.add_after("k".to_string(), Duration::from_secs(5));
        tokio::task::yield_now().await;
        assert!(q.is_empty());

        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(q.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_add_rate_limited_backs_off() {
        let q = WorkQueue::new(
            "test",
            ItemExponentialFailureRateLimiter::new(Duration::from_secs(1), Duration::from_secs(60)),
        );

        q.add_rate_limited("k".to_string());
        q.add_rate_limited("k".to_string());
        assert_eq!(q.num_requeues(&"k".to_string()), 2);

        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert_eq!(q.len(), 1);

        q.forget(&"k".to_string());
        assert_eq!(q.num_requeues(&"k".to_string()), 0);
    }

    #[tokio::test]
    async fn test_item_never_handed_out_twice_concurrently() {
        let q = queue();
        q.add("k".to_string());
        let first = q.get().await.unwrap();

        q.add("k".to_string());
        let second = tokio::time::timeout(Duration::from_millis(50), q.get()).await;
        assert!(second.is_err(), "item must not be handed out while in flight");

        q.done(&first);
        let second = tokio::time::timeout(Duration::from_millis(50), q.get()).await;
        assert_eq!(second.unwrap().as_deref(), Some("k"));
    }
}
