//! Deadline-driven node heartbeat scheduler
//!
//! One timer serves the whole fleet: registered nodes sit in a min-heap
//! keyed on their next deadline, a single loop sleeps until the earliest
//! one, and every node whose deadline has elapsed is handed to the caller
//! in one batch before any of them is re-enqueued. Per-node jitter of
//! ±10% keeps ten thousand nodes from stampeding the API server on the
//! same tick.
//!
//! A failed status write re-schedules just that node on a backoff ladder
//! (1s initial, doubling, capped at the heartbeat interval); the scheduler
//! itself never halts on individual-node errors.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::time::Duration;

use parking_lot::Mutex;
use rand::Rng;
use tokio::sync::Notify;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

const INITIAL_BACKOFF: Duration = Duration::from_secs(1);

#[derive(Debug, PartialEq, Eq)]
struct Entry {
    deadline: Instant,
    generation: u64,
    name: String,
}

impl Ord for Entry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.deadline
            .cmp(&other.deadline)
            .then_with(|| self.name.cmp(&other.name))
    }
}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Debug)]
struct NodeState {
    generation: u64,
    backoff: Duration,
    deadline: Instant,
}

#[derive(Debug, Default)]
struct Inner {
    heap: BinaryHeap<Reverse<Entry>>,
    nodes: HashMap<String, NodeState>,
}

/// Schedules periodic status refreshes for every registered node
#[derive(Debug)]
pub struct HeartbeatScheduler {
    interval: Duration,
    inner: Mutex<Inner>,
    notify: Notify,
}

impl HeartbeatScheduler {
    /// Create a scheduler with the given heartbeat interval
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            inner: Mutex::new(Inner::default()),
            notify: Notify::new(),
        }
    }

    /// Register a node, scheduling its first refresh one (jittered)
    /// interval from now. Returns false if it was already registered.
    pub fn register(&self, name: &str) -> bool {
        let deadline = Instant::now() + self.jittered_interval();
        {
            let mut inner = self.inner.lock();
            if inner.nodes.contains_key(name) {
                return false;
            }
            inner.nodes.insert(
                name.to_string(),
                NodeState {
                    generation: 0,
                    backoff: INITIAL_BACKOFF,
                    deadline,
                },
            );
            inner.heap.push(Reverse(Entry {
                deadline,
                generation: 0,
                name: name.to_string(),
            }));
        }
        self.notify.notify_one();
        true
    }

    /// Drop a node from the schedule. Stale heap entries are discarded
    /// lazily. Returns false if the node was not registered.
    pub fn remove(&self, name: &str) -> bool {
        self.inner.lock().nodes.remove(name).is_some()
    }

    /// True when the node is registered
    pub fn contains(&self, name: &str) -> bool {
        self.inner.lock().nodes.contains_key(name)
    }

    /// Number of registered nodes
    pub fn len(&self) -> usize {
        self.inner.lock().nodes.len()
    }

    /// True when no node is registered
    pub fn is_empty(&self) -> bool {
        self.inner.lock().nodes.is_empty()
    }

    /// The node's currently scheduled deadline
    pub fn deadline_of(&self, name: &str) -> Option<Instant> {
        self.inner.lock().nodes.get(name).map(|s| s.deadline)
    }

    /// Reset the node's failure backoff after a successful refresh
    pub fn succeed(&self, name: &str) {
        if let Some(state) = self.inner.lock().nodes.get_mut(name) {
            state.backoff = INITIAL_BACKOFF;
        }
    }

    /// Re-schedule a node after a failed refresh: its next attempt runs
    /// at the current backoff instead of a full interval out, and the
    /// backoff doubles, capped at the interval.
    pub fn fail(&self, name: &str) {
        {
            let mut inner = self.inner.lock();
            let Some(state) = inner.nodes.get_mut(name) else {
                return;
            };
            let deadline = Instant::now() + state.backoff.min(self.interval);
            state.backoff = (state.backoff * 2).min(self.interval);
            state.generation += 1;
            state.deadline = deadline;
            let entry = Entry {
                deadline,
                generation: state.generation,
                name: name.to_string(),
            };
            inner.heap.push(Reverse(entry));
        }
        self.notify.notify_one();
    }

    /// Pop every node whose deadline has elapsed. The batch is not
    /// re-enqueued; callers hand it to the worker pool first and then
    /// call [`Self::requeue`].
    pub fn take_due(&self, now: Instant) -> Vec<String> {
        let mut inner = self.inner.lock();
        let mut due = Vec::new();

        loop {
            let elapsed = match inner.heap.peek() {
                Some(Reverse(entry)) => entry.deadline <= now,
                None => false,
            };
            if !elapsed {
                break;
            }
            let Some(Reverse(entry)) = inner.heap.pop() else {
                break;
            };
            let live = inner
                .nodes
                .get(&entry.name)
                .is_some_and(|s| s.generation == entry.generation);
            if live {
                due.push(entry.name);
            }
        }

        due
    }

    /// Schedule each node's next refresh one (jittered) interval from now
    pub fn requeue(&self, names: &[String]) {
        let mut inner = self.inner.lock();
        for name in names {
            let Some(state) = inner.nodes.get_mut(name) else {
                continue;
            };
            let deadline = Instant::now() + self.jittered_interval();
            state.generation += 1;
            state.deadline = deadline;
            let entry = Entry {
                deadline,
                generation: state.generation,
                name: name.clone(),
            };
            inner.heap.push(Reverse(entry));
        }
    }

    /// Earliest live deadline, discarding stale heap entries on the way
    fn peek_next(&self) -> Option<Instant> {
        let mut inner = self.inner.lock();
        loop {
            let head = match inner.heap.peek() {
                Some(Reverse(entry)) => {
                    let live = inner
                        .nodes
                        .get(&entry.name)
                        .is_some_and(|s| s.generation == entry.generation);
                    (entry.deadline, live)
                }
                None => return None,
            };
            if head.1 {
                return Some(head.0);
            }
            inner.heap.pop();
        }
    }

    /// Run the timer loop until cancellation, invoking `on_due` with each
    /// batch of elapsed nodes.
    pub async fn run<F>(&self, token: CancellationToken, mut on_due: F)
    where
        F: FnMut(Vec<String>),
    {
        loop {
            match self.peek_next() {
                Some(deadline) => {
                    tokio::select! {
                        _ = tokio::time::sleep_until(deadline) => {
                            let due = self.take_due(Instant::now());
                            if !due.is_empty() {
                                on_due(due.clone());
                                self.requeue(&due);
                            }
                        }
                        _ = self.notify.notified() => {}
                        _ = token.cancelled() => return,
                    }
                }
                None => {
                    tokio::select! {
                        _ = self.notify.notified() => {}
                        _ = token.cancelled() => return,
                    }
                }
            }
        }
    }

    fn jittered_interval(&self) -> Duration {
        let factor = rand::thread_rng().gen_range(0.9..=1.1);
        Duration::from_secs_f64(self.interval.as_secs_f64() * factor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_register_schedules_within_jitter_bounds() {
        let scheduler = HeartbeatScheduler::new(Duration::from_secs(10));
        let before = Instant::now();
        assert!(scheduler.register("node0"));
        assert!(!scheduler.register("node0"), "double register is a no-op");

        let deadline = scheduler.deadline_of("node0").unwrap();
        let delta = deadline - before;
        assert!(delta >= Duration::from_secs_f64(8.9), "got {delta:?}");
        assert!(delta <= Duration::from_secs_f64(11.1), "got {delta:?}");
    }

    #[tokio::test]
    async fn test_take_due_returns_whole_elapsed_batch() {
        let scheduler = HeartbeatScheduler::new(Duration::from_secs(10));
        scheduler.register("a");
        scheduler.register("b");
        scheduler.register("c");

        // Nothing due yet
        assert!(scheduler.take_due(Instant::now()).is_empty());

        // Everything due well past the deadline
        let later = Instant::now() + Duration::from_secs(20);
        let mut due = scheduler.take_due(later);
        due.sort();
        assert_eq!(due, vec!["a", "b", "c"]);

        // The batch was not re-enqueued yet
        assert!(scheduler.take_due(later).is_empty());

        // requeue puts each node back one interval out
        scheduler.requeue(&due);
        assert!(scheduler.deadline_of("a").is_some());
    }

    #[tokio::test]
    async fn test_removed_node_is_not_dispatched() {
        let scheduler = HeartbeatScheduler::new(Duration::from_secs(10));
        scheduler.register("a");
        scheduler.register("b");
        assert!(scheduler.remove("a"));
        assert!(!scheduler.remove("a"));

        let later = Instant::now() + Duration::from_secs(20);
        assert_eq!(scheduler.take_due(later), vec!["b"]);
        assert_eq!(scheduler.len(), 1);
    }

    #[tokio::test]
    async fn test_failure_backoff_reschedules_earlier_and_doubles() {
        let scheduler = HeartbeatScheduler::new(Duration::from_secs(30));
        scheduler.register("node0");

        let before = Instant::now();
        scheduler.fail("node0");
        let deadline = scheduler.deadline_of("node0").unwrap();
        assert!(
            deadline - before <= Duration::from_secs(2),
            "first retry runs at the initial backoff, not a full interval"
        );

        // Backoff doubles per failure but never exceeds the interval
        for _ in 0..10 {
            scheduler.fail("node0");
        }
        let before = Instant::now();
        scheduler.fail("node0");
        let deadline = scheduler.deadline_of("node0").unwrap();
        assert!(deadline - before <= Duration::from_secs(31));

        // Success resets the ladder
        scheduler.succeed("node0");
        let before = Instant::now();
        scheduler.fail("node0");
        let deadline = scheduler.deadline_of("node0").unwrap();
        assert!(deadline - before <= Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_stale_entries_are_discarded() {
        let scheduler = HeartbeatScheduler::new(Duration::from_secs(10));
        scheduler.register("node0");
        // Two failures stack two extra heap entries; only the newest
        // generation is live.
        scheduler.fail("node0");
        scheduler.fail("node0");

        let later = Instant::now() + Duration::from_secs(60);
        assert_eq!(scheduler.take_due(later), vec!["node0"]);
        assert!(scheduler.take_due(later).is_empty());
    }

    #[tokio::test]
    async fn test_run_dispatches_batches() {
        let scheduler = Arc::new(HeartbeatScheduler::new(Duration::from_millis(50)));
        scheduler.register("a");
        scheduler.register("b");

        let token = CancellationToken::new();
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();

        let loop_scheduler = scheduler.clone();
        let loop_token = token.clone();
        let task = tokio::spawn(async move {
            loop_scheduler
                .run(loop_token, move |batch| {
                    let _ = tx.send(batch);
                })
                .await;
        });

        let mut seen = Vec::new();
        while seen.len() < 4 {
            let batch = tokio::time::timeout(Duration::from_secs(2), rx.recv())
                .await
                .expect("heartbeat batches keep coming")
                .expect("channel open");
            seen.extend(batch);
        }

        assert!(seen.iter().filter(|n| n.as_str() == "a").count() >= 2);
        assert!(seen.iter().filter(|n| n.as_str() == "b").count() >= 2);

        token.cancel();
        task.await.unwrap();
    }
}
