//! Rate-limited deduplicating work queue
//!
//! FIFO keyed by the item itself. Adding an item that is already pending is a
//! no-op; adding one that is being processed marks it dirty so it is queued
//! again once processing is done. Failed items can be re-added with a
//! per-item exponential backoff.

use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt::Debug;
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

const DEFAULT_BASE_DELAY: Duration = Duration::from_secs(1);
const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(300);

/// Items the queue can carry
pub trait QueueItem: Clone + Eq + Hash + Debug + Send + Sync + 'static {}

impl<T> QueueItem for T where T: Clone + Eq + Hash + Debug + Send + Sync + 'static {}

struct QueueState<T> {
    queue: VecDeque<T>,
    /// Items waiting to be processed (queued, or re-added while processing)
    dirty: HashSet<T>,
    processing: HashSet<T>,
    failures: HashMap<T, u32>,
    shutting_down: bool,
}

struct Shared<T> {
    state: Mutex<QueueState<T>>,
    notify: Notify,
    base_delay: Duration,
    max_delay: Duration,
}

/// Cloneable handle to one queue
pub struct WorkQueue<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for WorkQueue<T> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<T: QueueItem> Default for WorkQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: QueueItem> WorkQueue<T> {
    pub fn new() -> Self {
        Self::with_backoff(DEFAULT_BASE_DELAY, DEFAULT_MAX_DELAY)
    }

    /// Queue whose rate-limited re-adds wait `base * 2^(failures-1)`, capped at `max`
    pub fn with_backoff(base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(QueueState {
                    queue: VecDeque::new(),
                    dirty: HashSet::new(),
                    processing: HashSet::new(),
                    failures: HashMap::new(),
                    shutting_down: false,
                }),
                notify: Notify::new(),
                base_delay,
                max_delay,
            }),
        }
    }

    pub fn add(&self, item: T) {
        let mut state = self.shared.state.lock();
        if state.shutting_down || state.dirty.contains(&item) {
            return;
        }
        state.dirty.insert(item.clone());
        if state.processing.contains(&item) {
            return;
        }
        state.queue.push_back(item);
        drop(state);
        self.shared.notify.notify_one();
    }

    /// Re-add after a fixed delay
    pub fn add_after(&self, item: T, delay: Duration) {
        if delay.is_zero() {
            self.add(item);
            return;
        }
        let queue = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.add(item);
        });
    }

    /// Re-add with the item's next backoff delay
    pub fn add_rate_limited(&self, item: T) {
        let delay = {
            let mut state = self.shared.state.lock();
            let failures = state.failures.entry(item.clone()).or_insert(0);
            *failures += 1;
            backoff_delay(self.shared.base_delay, self.shared.max_delay, *failures)
        };
        self.add_after(item, delay);
    }

    /// Times the item went through `add_rate_limited` since it was last forgotten
    pub fn num_requeues(&self, item: &T) -> u32 {
        self.shared
            .state
            .lock()
            .failures
            .get(item)
            .copied()
            .unwrap_or(0)
    }

    /// Drop the item's backoff history
    pub fn forget(&self, item: &T) {
        self.shared.state.lock().failures.remove(item);
    }

    /// Wait for the next item; `None` once the queue is shut down
    ///
    /// The item stays marked as processing until [`WorkQueue::done`].
    pub async fn get(&self) -> Option<T> {
        loop {
            let notified = self.shared.notify.notified();
            {
                let mut state = self.shared.state.lock();
                if let Some(item) = state.queue.pop_front() {
                    state.dirty.remove(&item);
                    state.processing.insert(item.clone());
                    let more = !state.queue.is_empty();
                    drop(state);
                    if more {
                        // Pass the wakeup on so sibling consumers see the rest
                        self.shared.notify.notify_one();
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

    /// Finish processing; an item re-added meanwhile goes back in the queue
    pub fn done(&self, item: &T) {
        let mut state = self.shared.state.lock();
        state.processing.remove(item);
        if state.dirty.contains(item) && !state.shutting_down {
            state.queue.push_back(item.clone());
            drop(state);
            self.shared.notify.notify_one();
        }
    }

    /// `get` followed by `done` and `forget`
    pub async fn pop(&self) -> Option<T> {
        let item = self.get().await?;
        self.done(&item);
        self.forget(&item);
        Some(item)
    }

    pub fn len(&self) -> usize {
        self.shared.state.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stop accepting items and wake every waiting consumer
    pub fn shutdown(&self) {
        self.shared.state.lock().shutting_down = true;
        self.shared.notify.notify_waiters();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shared.state.lock().shutting_down
    }
}

fn backoff_delay(base: Duration, max: Duration, failures: u32) -> Duration {
    let exp = failures.saturating_sub(1).min(31);
    base.checked_mul(1u32 << exp).map_or(max, |d| d.min(max))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_pending_duplicates_collapse() {
        let queue = WorkQueue::new();
        queue.add("a".to_string());
        queue.add("b".to_string());
        queue.add("a".to_string());
        assert_eq!(queue.len(), 2);

        assert_eq!(queue.pop().await.as_deref(), Some("a"));
        assert_eq!(queue.pop().await.as_deref(), Some("b"));
        assert!(queue.is_empty());

        // Once dequeued the id can be queued again
        queue.add("a".to_string());
        assert_eq!(queue.pop().await.as_deref(), Some("a"));
    }

    #[tokio::test]
    async fn test_readd_while_processing_requeues_on_done() {
        let queue = WorkQueue::new();
        queue.add(7u64);
        let item = queue.get().await.unwrap();

        queue.add(7);
        assert!(queue.is_empty());

        queue.done(&item);
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.pop().await, Some(7));
    }

    #[tokio::test]
    async fn test_pop_blocks_until_add() {
        let queue: WorkQueue<u64> = WorkQueue::new();
        let consumer = queue.clone();
        let handle = tokio::spawn(async move { consumer.pop().await });

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!handle.is_finished());
        queue.add(3);
        assert_eq!(handle.await.unwrap(), Some(3));
    }

    #[tokio::test]
    async fn test_shutdown_wakes_consumers() {
        let queue: WorkQueue<u64> = WorkQueue::new();
        let consumer = queue.clone();
        let handle = tokio::spawn(async move { consumer.pop().await });

        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.shutdown();
        assert_eq!(handle.await.unwrap(), None);

        queue.add(1);
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_rate_limited_backoff_grows_and_pop_forgets() {
        let queue = WorkQueue::with_backoff(Duration::from_millis(10), Duration::from_millis(25));
        queue.add_rate_limited(5u64);
        queue.add_rate_limited(5u64);
        assert_eq!(queue.num_requeues(&5), 2);

        let popped = tokio::time::timeout(Duration::from_secs(1), queue.pop())
            .await
            .unwrap();
        assert_eq!(popped, Some(5));
        assert_eq!(queue.num_requeues(&5), 0);
    }

    #[test]
    fn test_backoff_delay_is_capped() {
        let base = Duration::from_millis(100);
        let max = Duration::from_secs(1);
        assert_eq!(backoff_delay(base, max, 1), Duration::from_millis(100));
        assert_eq!(backoff_delay(base, max, 3), Duration::from_millis(400));
        assert_eq!(backoff_delay(base, max, 10), max);
        assert_eq!(backoff_delay(base, max, 200), max);
    }
}
