//! A typed multi-producer, multi-consumer work queue with per-item
//! exponential backoff and drain-on-shutdown.
//!
//! Items are identified by address (`Arc` pointer), not by value: re-adding
//! an item that is already waiting coalesces with it, and an item re-added
//! while it is being processed is re-queued once its processing is marked
//! done. Consumers loop `get` / work / `done`, calling `forget` after a
//! success so the item's backoff schedule resets.

mod rate_limit;
pub use rate_limit::RateLimiter;

use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;

pub struct RateLimitingQueue<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for RateLimitingQueue<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

struct Inner<T> {
    state: Mutex<State<T>>,
    // Signals queue readiness and shutdown transitions to get()/drain waiters.
    notify: Notify,
}

struct State<T> {
    queue: VecDeque<Arc<T>>,
    dirty: HashSet<usize>,
    processing: HashSet<usize>,
    limiter: RateLimiter,
    shutting_down: bool,
}

impl<T: Send + Sync + 'static> RateLimitingQueue<T> {
    pub fn new() -> Self {
        Self::with_rate_limiter(RateLimiter::default())
    }

    pub fn with_rate_limiter(limiter: RateLimiter) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State {
                    queue: VecDeque::new(),
                    dirty: HashSet::new(),
                    processing: HashSet::new(),
                    limiter,
                    shutting_down: false,
                }),
                notify: Notify::new(),
            }),
        }
    }

    /// Schedule `item` after its rate-limited delay. Duplicate adds of the
    /// same item coalesce while it waits.
    pub fn add_rate_limited(&self, item: Arc<T>) {
        let delay = {
            let mut state = self.inner.state.lock().unwrap();
            if state.shutting_down {
                tracing::debug!("dropping add of item to a draining queue");
                return;
            }
            state.limiter.when(id_of(&item))
        };

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

    // Immediate add, honoring coalescing and shutdown.
    fn add(&self, item: Arc<T>) {
        let mut state = self.inner.state.lock().unwrap();
        if state.shutting_down {
            return;
        }
        let id = id_of(&item);
        if !state.dirty.insert(id) {
            return; // Already waiting in the queue.
        }
        if state.processing.contains(&id) {
            // Re-queued by done() once current processing completes.
            return;
        }
        state.queue.push_back(item);
        drop(state);
        self.inner.notify.notify_waiters();
    }

    /// Wait for the next ready item. Returns None once the queue is shut
    /// down and empty.
    pub async fn get(&self) -> Option<Arc<T>> {
        loop {
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.inner.state.lock().unwrap();
                if let Some(item) = state.queue.pop_front() {
                    let id = id_of(&item);
                    state.dirty.remove(&id);
                    state.processing.insert(id);
                    return Some(item);
                }
                if state.shutting_down {
                    return None;
                }
            }
            notified.await;
        }
    }

    /// Mark processing of `item` complete. If the item was re-added while
    /// processing, it returns to the queue now.
    pub fn done(&self, item: &Arc<T>) {
        let mut state = self.inner.state.lock().unwrap();
        let id = id_of(item);
        state.processing.remove(&id);
        if state.dirty.contains(&id) {
            state.queue.push_back(item.clone());
        }
        drop(state);
        self.inner.notify.notify_waiters();
    }

    /// Reset the item's backoff schedule after a success.
    pub fn forget(&self, item: &Arc<T>) {
        self.inner.state.lock().unwrap().limiter.forget(id_of(item));
    }

    /// Refuse new adds and wait until every queued and in-flight item has
    /// been processed and marked done.
    pub async fn shut_down_with_drain(&self) {
        {
            let mut state = self.inner.state.lock().unwrap();
            state.shutting_down = true;
        }
        self.inner.notify.notify_waiters();

        loop {
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let state = self.inner.state.lock().unwrap();
                if state.queue.is_empty() && state.processing.is_empty() {
                    return;
                }
            }
            notified.await;
        }
    }

    /// True once shutdown has begun.
    pub fn is_shutting_down(&self) -> bool {
        self.inner.state.lock().unwrap().shutting_down
    }

    /// Items currently queued (excluding those being processed).
    pub fn len(&self) -> usize {
        self.inner.state.lock().unwrap().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T: Send + Sync + 'static> Default for RateLimitingQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

fn id_of<T>(item: &Arc<T>) -> usize {
    Arc::as_ptr(item) as usize
}
