//! # Deduplicating Work Queue
//!
//! Holds backend names waiting to be reconciled. The queue guarantees:
//!
//! - a name waiting in the queue is stored once, however often it is added;
//! - a name handed to a worker is not handed out again until the worker calls
//!   [`WorkQueue::done`]; adds in the meantime mark it dirty and it is queued
//!   again on `done`;
//! - after [`WorkQueue::shut_down`], new adds are dropped while items already
//!   queued are still handed out, and [`WorkQueue::get`] returns `None` once
//!   the queue is empty.
//!
//! ## Rust Concepts Used
//!
//! - `parking_lot::Mutex` for the short, never-awaited critical sections
//! - `tokio::sync::Notify` to park idle workers; the `Notified` future is
//!   enabled before the state is checked so no wakeup is lost
//! - `CancellationToken` to abandon delayed re-adds on shutdown

use metrics::{counter, gauge};
use parking_lot::Mutex;
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::controller::rate_limiter::ItemExponentialBackoff;

#[derive(Debug, Default)]
struct QueueState {
    queue: VecDeque<String>,
    /// Names that need processing, queued or not
    dirty: HashSet<String>,
    /// Names currently held by a worker
    processing: HashSet<String>,
    shutting_down: bool,
}

pub struct WorkQueue {
    name: String,
    state: Mutex<QueueState>,
    available: Notify,
    limiter: ItemExponentialBackoff,
    shutdown: CancellationToken,
}

impl WorkQueue {
    pub fn new(name: impl Into<String>, limiter: ItemExponentialBackoff) -> Self {
        Self {
            name: name.into(),
            state: Mutex::new(QueueState::default()),
            available: Notify::new(),
            limiter,
            shutdown: CancellationToken::new(),
        }
    }

    /// Queue `key` unless it is already waiting
    pub fn add(&self, key: &str) {
        {
            let mut state = self.state.lock();
            if state.shutting_down {
                debug!(queue = %self.name, key = %key, "Queue is shutting down, dropping item");
                return;
            }
            if !state.dirty.insert(key.to_string()) {
                return;
            }
            counter!("aggregator_workqueue_adds_total", "queue" => self.name.clone()).increment(1);
            if state.processing.contains(key) {
                // Re-queued by `done` once the current holder finishes.
                return;
            }
            state.queue.push_back(key.to_string());
            self.record_depth(state.queue.len());
        }
        self.available.notify_one();
    }

    /// Wait for the next item. `None` means the queue was shut down and drained.
    pub async fn get(&self) -> Option<String> {
        loop {
            let notified = self.available.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.state.lock();
                if let Some(key) = state.queue.pop_front() {
                    state.dirty.remove(&key);
                    state.processing.insert(key.clone());
                    self.record_depth(state.queue.len());
                    return Some(key);
                }
                if state.shutting_down {
                    return None;
                }
            }

            notified.await;
        }
    }

    /// Mark `key` as finished; it is queued again if it was added meanwhile
    pub fn done(&self, key: &str) {
        let requeued = {
            let mut state = self.state.lock();
            state.processing.remove(key);
            if state.dirty.contains(key) {
                state.queue.push_back(key.to_string());
                self.record_depth(state.queue.len());
                true
            } else {
                false
            }
        };
        if requeued {
            self.available.notify_one();
        }
    }

    /// Queue `key` once `delay` has passed
    pub fn add_after(self: &Arc<Self>, key: &str, delay: Duration) {
        if self.is_shutting_down() {
            debug!(queue = %self.name, key = %key, "Queue is shutting down, dropping delayed item");
            return;
        }
        if delay.is_zero() {
            self.add(key);
            return;
        }

        let queue = Arc::clone(self);
        let key = key.to_string();
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(delay) => queue.add(&key),
                _ = queue.shutdown.cancelled() => {
                    debug!(queue = %queue.name, key = %key, "Dropped delayed item on shutdown");
                }
            }
        });
    }

    /// Queue `key` after its per-item backoff and count the failure
    pub fn add_rate_limited(self: &Arc<Self>, key: &str) {
        counter!("aggregator_workqueue_retries_total", "queue" => self.name.clone()).increment(1);
        let delay = self.limiter.when(key);
        self.add_after(key, delay);
    }

    /// Reset the backoff of `key` after a success
    pub fn forget(&self, key: &str) {
        self.limiter.forget(key);
    }

    pub fn num_requeues(&self, key: &str) -> u32 {
        self.limiter.num_requeues(key)
    }

    /// Number of items waiting (not counting those being processed)
    pub fn len(&self) -> usize {
        self.state.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stop accepting items and wake idle workers so they can drain and exit
    pub fn shut_down(&self) {
        self.state.lock().shutting_down = true;
        self.shutdown.cancel();
        self.available.notify_waiters();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.state.lock().shutting_down
    }

    fn record_depth(&self, depth: usize) {
        gauge!("aggregator_workqueue_depth", "queue" => self.name.clone()).set(depth as f64);
    }
}
