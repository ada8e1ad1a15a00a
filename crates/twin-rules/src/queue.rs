//! Hysteresis priority dispatch queue.
//!
//! Shapes bursts of rule-trigger requests into an ordered stream: a payload
//! offered again within the hysteresis window of its last acceptance is
//! silently rejected, and accepted payloads are served lowest priority value
//! first, FIFO among equal priorities.
//!
//! The duplicate check in [`HysteresisQueue::offer`] is not linearizable
//! with concurrent offers of the same payload; two offers racing within the
//! same instant may both be accepted. Hysteresis is a debounce, not a lock.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::{Notify, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Queue entry ordered by priority, then by sequence number.
#[derive(Debug)]
struct PrioritizedMessage<T> {
    payload: T,
    priority: i32,
    seq: u64,
}

impl<T> PartialEq for PrioritizedMessage<T> {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}

impl<T> Eq for PrioritizedMessage<T> {}

impl<T> PartialOrd for PrioritizedMessage<T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<T> Ord for PrioritizedMessage<T> {
    fn cmp(&self, other: &Self) -> Ordering {
        // BinaryHeap pops the greatest element: invert both keys so the
        // lowest priority value and then the oldest sequence come out first.
        other
            .priority
            .cmp(&self.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

/// Thread-safe, debounced priority queue.
pub struct HysteresisQueue<T> {
    heap: Mutex<BinaryHeap<PrioritizedMessage<T>>>,
    last_accepted: DashMap<T, Instant>,
    sequence: AtomicU64,
    hysteresis: Duration,
    available: Notify,
}

impl<T> HysteresisQueue<T>
where
    T: Eq + Hash + Clone + Send + Sync + 'static,
{
    pub fn new(hysteresis: Duration) -> Self {
        Self {
            heap: Mutex::new(BinaryHeap::new()),
            last_accepted: DashMap::new(),
            sequence: AtomicU64::new(0),
            hysteresis,
            available: Notify::new(),
        }
    }

    pub fn hysteresis(&self) -> Duration {
        self.hysteresis
    }

    /// Enqueue `payload` unless it was accepted less than the hysteresis
    /// window ago. Returns whether it was enqueued.
    pub fn offer(&self, payload: T, priority: i32) -> bool {
        let now = Instant::now();
        let suppressed = self
            .last_accepted
            .get(&payload)
            .map(|last| now.saturating_duration_since(*last) < self.hysteresis)
            .unwrap_or(false);
        if suppressed {
            tracing::debug!(priority, "dispatch request suppressed by hysteresis");
            return false;
        }

        self.last_accepted.insert(payload.clone(), now);
        let seq = self.sequence.fetch_add(1, AtomicOrdering::Relaxed);
        self.heap.lock().push(PrioritizedMessage {
            payload,
            priority,
            seq,
        });
        self.available.notify_one();
        true
    }

    /// Remove and return the next entry without waiting.
    pub fn poll(&self) -> Option<T> {
        self.heap.lock().pop().map(|m| m.payload)
    }

    /// Wait until an entry is available and return it.
    ///
    /// Cancel-safe: dropping the future never loses an entry.
    pub async fn take(&self) -> T {
        loop {
            let notified = self.available.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(payload) = self.poll() {
                return payload;
            }
            notified.await;
        }
    }

    /// Like [`take`](Self::take), but gives up with `None` once `shutdown`
    /// turns `true` or its sender is dropped.
    pub async fn take_until(&self, shutdown: &mut watch::Receiver<bool>) -> Option<T> {
        if *shutdown.borrow() {
            return None;
        }
        tokio::select! {
            payload = self.take() => Some(payload),
            _ = shutdown.wait_for(|stop| *stop) => None,
        }
    }

    /// Current queue depth.
    pub fn size(&self) -> usize {
        self.heap.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.lock().is_empty()
    }

    /// Number of payloads still tracked for hysteresis.
    pub fn tracked(&self) -> usize {
        self.last_accepted.len()
    }

    /// Forget acceptances older than the hysteresis window.
    ///
    /// Returns the number of forgotten payloads.
    pub fn clean_up(&self) -> usize {
        let now = Instant::now();
        let before = self.last_accepted.len();
        self.last_accepted
            .retain(|_, last| now.saturating_duration_since(*last) < self.hysteresis);
        before.saturating_sub(self.last_accepted.len())
    }

    /// Run [`clean_up`](Self::clean_up) every `period` in a background task.
    ///
    /// The task ends when the handle is stopped or the queue is dropped.
    pub fn start_house_keeping(self: &Arc<Self>, period: Duration) -> HouseKeepingHandle {
        let queue: Weak<Self> = Arc::downgrade(self);
        HouseKeepingHandle::spawn(period, move || match queue.upgrade() {
            Some(queue) => {
                let removed = queue.clean_up();
                if removed > 0 {
                    tracing::debug!(removed, "hysteresis entries cleaned up");
                }
                true
            }
            None => false,
        })
    }
}

/// Handle to a periodic background task.
pub struct HouseKeepingHandle {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl HouseKeepingHandle {
    /// Spawn a task calling `tick` every `period` until it returns `false`
    /// or the handle is stopped.
    pub(crate) fn spawn<F>(period: Duration, mut tick: F) -> Self
    where
        F: FnMut() -> bool + Send + 'static,
    {
        let (shutdown, mut rx) = watch::channel(false);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick completes immediately.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if !tick() {
                            break;
                        }
                    }
                    _ = rx.wait_for(|stop| *stop) => break,
                }
            }
        });
        Self { shutdown, handle }
    }

    pub fn is_running(&self) -> bool {
        !self.handle.is_finished()
    }

    /// Signal the task to stop and wait for it to finish.
    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        let _ = self.handle.await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_hysteresis_window() {
        let queue = HysteresisQueue::new(Duration::from_millis(1000));

        assert!(queue.offer("x", 5));
        tokio::time::advance(Duration::from_millis(500)).await;
        assert!(!queue.offer("x", 5));
        assert!(queue.offer("y", 5));
        tokio::time::advance(Duration::from_millis(1000)).await;
        assert!(queue.offer("x", 5));

        assert_eq!(queue.size(), 3);
    }

    #[test]
    fn test_priority_then_fifo() {
        let queue = HysteresisQueue::new(Duration::from_millis(1000));
        queue.offer("a", 5);
        queue.offer("b", 1);
        queue.offer("c", 5);

        assert_eq!(queue.poll(), Some("b"));
        assert_eq!(queue.poll(), Some("a"));
        assert_eq!(queue.poll(), Some("c"));
        assert_eq!(queue.poll(), None);
    }

    #[test]
    fn test_negative_priorities_come_first() {
        let queue = HysteresisQueue::new(Duration::ZERO);
        queue.offer("low", 10);
        queue.offer("urgent", -3);
        assert_eq!(queue.poll(), Some("urgent"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_take_wakes_exactly_one_waiter() {
        let queue = Arc::new(HysteresisQueue::new(Duration::ZERO));

        let first = tokio::spawn({
            let queue = queue.clone();
            async move { queue.take().await }
        });
        let second = tokio::spawn({
            let queue = queue.clone();
            async move { queue.take().await }
        });

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!first.is_finished());
        assert!(!second.is_finished());

        assert!(queue.offer("a", 1));
        tokio::time::sleep(Duration::from_millis(10)).await;
        let finished = first.is_finished() as usize + second.is_finished() as usize;
        assert_eq!(finished, 1);

        assert!(queue.offer("b", 1));
        let mut got = vec![first.await.unwrap(), second.await.unwrap()];
        got.sort();
        assert_eq!(got, vec!["a", "b"]);
        assert!(queue.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_take_until_cancels() {
        let queue = Arc::new(HysteresisQueue::<&'static str>::new(Duration::ZERO));
        let (tx, mut rx) = watch::channel(false);

        let waiter = tokio::spawn({
            let queue = queue.clone();
            async move { queue.take_until(&mut rx).await }
        });

        tokio::time::sleep(Duration::from_millis(10)).await;
        tx.send(true).unwrap();
        assert_eq!(waiter.await.unwrap(), None);

        // Nothing was consumed by the cancelled waiter.
        queue.offer("later", 1);
        assert_eq!(queue.size(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_clean_up_forgets_old_entries() {
        let queue = HysteresisQueue::new(Duration::from_millis(1000));
        queue.offer("x", 1);
        queue.offer("y", 1);
        tokio::time::advance(Duration::from_millis(600)).await;
        queue.offer("z", 1);
        assert_eq!(queue.tracked(), 3);

        tokio::time::advance(Duration::from_millis(500)).await;
        assert_eq!(queue.clean_up(), 2);
        assert_eq!(queue.tracked(), 1);
        // The hysteresis map is not the queue.
        assert_eq!(queue.size(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_house_keeping_runs_periodically() {
        let queue = Arc::new(HysteresisQueue::new(Duration::from_millis(100)));
        queue.offer("x", 1);

        let handle = queue.start_house_keeping(Duration::from_millis(250));
        assert!(handle.is_running());

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(queue.tracked(), 0);

        handle.stop().await;
    }
}
