//! Hash-partitioned worker lanes
//!
//! A [`LanePool`] serializes work per object while running many objects in
//! parallel: items are assigned to a fixed number of lanes by a stable
//! hash of their key, and each lane is a single task draining its queue in
//! FIFO order. Two updates to the same object therefore never run
//! concurrently, without a per-object mutex map.
//!
//! Lane queues are bounded. When a watch storm pushes a queue past its
//! capacity the oldest entry is dropped and counted; the newest event for
//! an object supersedes older ones, so dropping from the front loses no
//! final state.

use std::collections::hash_map::DefaultHasher;
use std::collections::VecDeque;
use std::future::Future;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

struct Lane<T> {
    queue: Mutex<VecDeque<T>>,
    notify: Notify,
}

/// A fixed pool of worker lanes with per-key FIFO ordering
pub struct LanePool<T: Send + 'static> {
    lanes: Vec<Arc<Lane<T>>>,
    capacity: usize,
    on_drop: Arc<dyn Fn() + Send + Sync>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl<T: Send + 'static> LanePool<T> {
    /// Start `parallelism` lanes, each owned by one spawned task running
    /// `handler` for every item in queue order.
    ///
    /// On cancellation a lane finishes the item it is working on and
    /// exits; queued items are not drained. `on_drop` fires once per item
    /// evicted by the bounded-queue policy.
    pub fn start<F, Fut>(
        parallelism: usize,
        capacity: usize,
        token: CancellationToken,
        on_drop: impl Fn() + Send + Sync + 'static,
        handler: F,
    ) -> Self
    where
        F: Fn(T) -> Fut + Send + Sync + Clone + 'static,
        Fut: Future<Output = ()> + Send,
    {
        assert!(parallelism > 0, "lane pool needs at least one lane");
        assert!(capacity > 0, "lane capacity must be positive");

        let lanes: Vec<Arc<Lane<T>>> = (0..parallelism)
            .map(|_| {
                Arc::new(Lane {
                    queue: Mutex::new(VecDeque::new()),
                    notify: Notify::new(),
                })
            })
            .collect();

        let workers = lanes
            .iter()
            .map(|lane| {
                let lane = lane.clone();
                let token = token.clone();
                let handler = handler.clone();
                tokio::spawn(async move {
                    loop {
                        let item = lane.queue.lock().pop_front();
                        match item {
                            Some(item) => {
                                handler(item).await;
                                if token.is_cancelled() {
                                    return;
                                }
                            }
                            None => {
                                tokio::select! {
                                    _ = lane.notify.notified() => {}
                                    _ = token.cancelled() => return,
                                }
                            }
                        }
                    }
                })
            })
            .collect();

        Self {
            lanes,
            capacity,
            on_drop: Arc::new(on_drop),
            workers: Mutex::new(workers),
        }
    }

    /// Queue an item on the lane its key hashes to
    pub fn submit<K: Hash>(&self, key: &K, item: T) {
        let lane = &self.lanes[self.lane_index(key)];
        {
            let mut queue = lane.queue.lock();
            queue.push_back(item);
            if queue.len() > self.capacity {
                queue.pop_front();
                (self.on_drop)();
            }
        }
        lane.notify.notify_one();
    }

    /// The lane an object key is pinned to
    fn lane_index<K: Hash>(&self, key: &K) -> usize {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        (hasher.finish() % self.lanes.len() as u64) as usize
    }

    /// Wait for every lane task to exit (after cancelling their token)
    pub async fn join(&self) {
        let workers = std::mem::take(&mut *self.workers.lock());
        for worker in workers {
            let _ = worker.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::time::Duration;

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(300)).await;
    }

    #[tokio::test]
    async fn test_items_with_one_key_run_in_order() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let token = CancellationToken::new();

        let pool = {
            let seen = seen.clone();
            LanePool::start(4, 64, token.clone(), || {}, move |item: u32| {
                let seen = seen.clone();
                async move {
                    // Yield to give out-of-order execution a chance to happen
                    tokio::time::sleep(Duration::from_millis(1)).await;
                    seen.lock().push(item);
                }
            })
        };

        for i in 0..20 {
            pool.submit(&"pod-a", i);
        }
        settle().await;

        assert_eq!(*seen.lock(), (0..20).collect::<Vec<_>>());
        token.cancel();
        pool.join().await;
    }

    #[tokio::test]
    async fn test_distinct_keys_run_concurrently() {
        let in_flight = Arc::new(AtomicU64::new(0));
        let peak = Arc::new(AtomicU64::new(0));
        let token = CancellationToken::new();

        let pool = {
            let in_flight = in_flight.clone();
            let peak = peak.clone();
            LanePool::start(8, 64, token.clone(), || {}, move |_: u32| {
                let in_flight = in_flight.clone();
                let peak = peak.clone();
                async move {
                    let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(30)).await;
                    in_flight.fetch_sub(1, Ordering::SeqCst);
                }
            })
        };

        for i in 0..8u32 {
            pool.submit(&format!("pod-{i}"), i);
        }
        settle().await;

        assert!(
            peak.load(Ordering::SeqCst) > 1,
            "independent keys should overlap"
        );
        token.cancel();
        pool.join().await;
    }

    #[tokio::test]
    async fn test_full_lane_drops_oldest_and_counts() {
        let dropped = Arc::new(AtomicU64::new(0));
        let seen = Arc::new(Mutex::new(Vec::new()));
        let token = CancellationToken::new();
        // A gate the handler blocks on so the queue can fill up
        let gate = Arc::new(Notify::new());

        let pool = {
            let seen = seen.clone();
            let gate = gate.clone();
            let dropped = dropped.clone();
            let pool = LanePool::start(
                1,
                2,
                token.clone(),
                move || {
                    dropped.fetch_add(1, Ordering::SeqCst);
                },
                move |item: u32| {
                    let seen = seen.clone();
                    let gate = gate.clone();
                    async move {
                        gate.notified().await;
                        seen.lock().push(item);
                    }
                },
            );
            pool
        };

        // First item is picked up by the worker and parks on the gate;
        // the rest contend for a capacity-2 queue.
        pool.submit(&"k", 0);
        tokio::time::sleep(Duration::from_millis(50)).await;
        for i in 1..=4 {
            pool.submit(&"k", i);
        }

        for _ in 0..3 {
            gate.notify_one();
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        assert_eq!(dropped.load(Ordering::SeqCst), 2);
        // Oldest queued items (1, 2) were evicted; 0 was already in flight
        assert_eq!(*seen.lock(), vec![0, 3, 4]);

        token.cancel();
        gate.notify_one();
        pool.join().await;
    }

    #[tokio::test]
    async fn test_cancel_finishes_current_item_and_stops() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let token = CancellationToken::new();
        let gate = Arc::new(Notify::new());

        let pool = {
            let seen = seen.clone();
            let gate = gate.clone();
            LanePool::start(1, 64, token.clone(), || {}, move |item: u32| {
                let seen = seen.clone();
                let gate = gate.clone();
                async move {
                    gate.notified().await;
                    seen.lock().push(item);
                }
            })
        };

        pool.submit(&"k", 1);
        tokio::time::sleep(Duration::from_millis(50)).await;
        pool.submit(&"k", 2);
        pool.submit(&"k", 3);

        // Cancel while item 1 is in flight, then let it finish
        token.cancel();
        gate.notify_one();
        pool.join().await;

        assert_eq!(*seen.lock(), vec![1], "queued items are not drained");
    }

    #[tokio::test]
    async fn test_same_key_always_hashes_to_same_lane() {
        let token = CancellationToken::new();
        let pool: LanePool<u32> =
            LanePool::start(16, 4, token.clone(), || {}, |_| async {});

        let first = pool.lane_index(&("default", "pod0"));
        for _ in 0..100 {
            assert_eq!(pool.lane_index(&("default", "pod0")), first);
        }

        token.cancel();
        pool.join().await;
    }
}
