//! Cancellable scheduled tasks.
//!
//! Timers are tokio tasks wrapped in a handle that aborts them on cancel or
//! drop, so an owner going away always takes its pending timers with it.

use std::future::Future;
use std::hash::Hash;
use std::time::Duration;

use dashmap::DashMap;
use tokio::task::JoinHandle;

/// Handle to a spawned task; aborts the task when cancelled or dropped
#[derive(Debug)]
pub struct TaskHandle {
    handle: JoinHandle<()>,
}

impl TaskHandle {
    pub fn spawn<F>(future: F) -> Self
    where
        F: Future<Output = ()> + Send + 'static,
    {
        Self {
            handle: tokio::spawn(future),
        }
    }

    /// Run `f` once after `delay`
    pub fn after<F>(delay: Duration, f: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        Self::spawn(async move {
            tokio::time::sleep(delay).await;
            f();
        })
    }

    pub fn cancel(&self) {
        self.handle.abort();
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

impl Drop for TaskHandle {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// Coalesces repeated triggers per key into one delayed action.
///
/// Each `schedule` replaces the pending action for its key and restarts the
/// delay; `take` cancels the pending action and hands it back.
pub struct Debouncer<K, A>
where
    K: Eq + Hash,
{
    delay: Duration,
    pending: DashMap<K, (A, TaskHandle)>,
}

impl<K, A> Debouncer<K, A>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    A: Send + Sync + 'static,
{
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            pending: DashMap::new(),
        }
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }

    /// Replace the pending action for `key`. `fire` receives the key when the
    /// delay elapses and is expected to call `take` to claim the action. It
    /// must not await; spawn a task for async work.
    pub fn schedule<F>(&self, key: K, action: A, fire: F)
    where
        F: FnOnce(K) + Send + 'static,
    {
        let task_key = key.clone();
        let timer = TaskHandle::after(self.delay, move || fire(task_key));
        // dropping the previous entry aborts its timer
        self.pending.insert(key, (action, timer));
    }

    /// Remove and return the pending action for `key`, cancelling its timer.
    ///
    /// Safe to call from the `fire` callback: the abort only lands at the
    /// timer task's next await, and the callback runs after its last one.
    pub fn take(&self, key: &K) -> Option<A> {
        self.pending.remove(key).map(|(_, (action, _timer))| action)
    }

    /// Cancel the pending action for `key` without running it.
    pub fn cancel(&self, key: &K) -> bool {
        self.pending.remove(key).is_some()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }
}
