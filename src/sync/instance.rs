//! One live collaboration session per document.
//!
//! An `Instance` owns the current `CollabState` of a document together with
//! the users seen recently and the pulls waiting for new steps. All three
//! live behind a single mutex, so exactly one push wins a given version.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, error, warn};

use super::manager::ManagerConfig;
use super::schema::Schema;
use super::state::{CollabState, Events};
use super::timer::TaskHandle;
use super::{DocName, Fail, SyncResult, UserId};
use crate::storage::{Disk, Snapshot, SnapshotFn};

/// Why a parked pull was woken
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Wake {
    /// State or user count changed; re-query
    Changed,
    /// Instance is shutting down
    Aborted,
}

struct Waiter {
    id: u64,
    user_id: UserId,
    tx: oneshot::Sender<Wake>,
}

struct Inner<S: Schema> {
    state: CollabState<S::Doc, S::Step>,
    users: HashSet<UserId>,
    waiting: Vec<Waiter>,
    collecting: Option<TaskHandle>,
    closed: bool,
}

/// Document as returned by `get_document`
#[derive(Debug, Clone)]
pub struct DocumentView<D> {
    pub doc: D,
    pub version: u64,
    pub users: usize,
}

/// Events as returned by `pull_events`
#[derive(Debug, Clone)]
pub struct EventsView<T> {
    pub events: Events<T>,
    pub users: usize,
}

/// Live session for one document
pub struct Instance<S: Schema> {
    name: DocName,
    schema: Arc<S>,
    disk: Arc<dyn Disk>,
    user_wait_timeout: Duration,
    collect_users_timeout: Duration,
    inner: Mutex<Inner<S>>,
    last_active: Mutex<Instant>,
    next_waiter: AtomicU64,
    me: Weak<Instance<S>>,
}

impl<S: Schema> Instance<S> {
    pub fn new(
        name: impl Into<DocName>,
        doc: S::Doc,
        schema: Arc<S>,
        disk: Arc<dyn Disk>,
        config: &ManagerConfig,
    ) -> Arc<Self> {
        let name = name.into();
        Arc::new_cyclic(|me| Self {
            name,
            schema,
            disk,
            user_wait_timeout: config.user_wait_timeout,
            collect_users_timeout: config.collect_users_timeout,
            inner: Mutex::new(Inner {
                state: CollabState::new(doc),
                users: HashSet::new(),
                waiting: Vec::new(),
                collecting: None,
                closed: false,
            }),
            last_active: Mutex::new(Instant::now()),
            next_waiter: AtomicU64::new(0),
            me: me.clone(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn version(&self) -> u64 {
        self.inner.lock().state.version()
    }

    pub fn user_count(&self) -> usize {
        self.inner.lock().users.len()
    }

    pub fn waiting_count(&self) -> usize {
        self.inner.lock().waiting.len()
    }

    pub fn last_active(&self) -> Instant {
        *self.last_active.lock()
    }

    pub fn touch(&self) {
        *self.last_active.lock() = Instant::now();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }

    /// Current document, version and user count. Registers the caller.
    pub fn get_document(&self, user_id: &str) -> SyncResult<DocumentView<S::Doc>> {
        self.touch();
        self.register_user(user_id);

        let inner = self.inner.lock();
        if inner.closed {
            return Err(Fail::InvalidVersion);
        }
        Ok(DocumentView {
            doc: inner.state.doc().clone(),
            version: inner.state.version(),
            users: inner.users.len(),
        })
    }

    /// Apply `steps` made against `version` and wake every parked pull.
    pub fn push_events(
        &self,
        version: u64,
        steps: &[S::Step],
        client_id: &str,
    ) -> SyncResult<()> {
        self.touch();

        let waiters = {
            let mut inner = self.inner.lock();
            if inner.closed {
                return Err(Fail::InvalidVersion);
            }
            let next = inner
                .state
                .add_events(self.schema.as_ref(), version, steps, client_id)?;
            inner.state = next;
            std::mem::take(&mut inner.waiting)
        };

        debug!(
            "Accepted {} steps for {} from {}",
            steps.len(),
            self.name,
            client_id
        );
        resolve(waiters, Wake::Changed);

        if !steps.is_empty() {
            self.schedule_save();
        }
        Ok(())
    }

    /// Steps since `version`. Waits up to the user wait timeout when there
    /// are none, then answers with an empty list.
    pub async fn pull_events(
        &self,
        user_id: &str,
        version: u64,
    ) -> SyncResult<EventsView<S::Step>> {
        self.touch();
        self.register_user(user_id);

        let (id, rx) = {
            let mut inner = self.inner.lock();
            if inner.closed {
                return Err(Fail::InvalidVersion);
            }
            let events = inner.state.get_events(version)?;
            if !events.is_empty() {
                return Ok(EventsView {
                    events,
                    users: inner.users.len(),
                });
            }

            let (tx, rx) = oneshot::channel();
            let id = self.next_waiter.fetch_add(1, Ordering::Relaxed);
            inner.waiting.push(Waiter {
                id,
                user_id: user_id.to_string(),
                tx,
            });
            (id, rx)
        };

        // removes the waiter on timeout or when the caller goes away
        let _guard = WaiterGuard { instance: self, id };

        match tokio::time::timeout(self.user_wait_timeout, rx).await {
            Ok(Ok(Wake::Changed)) => {
                let inner = self.inner.lock();
                let events = inner.state.get_events(version)?;
                Ok(EventsView {
                    events,
                    users: inner.users.len(),
                })
            }
            Ok(Ok(Wake::Aborted)) | Ok(Err(_)) | Err(_) => Ok(self.empty_events(version)),
        }
    }

    /// Remember `user_id` and arm the collection sweep if it is not running.
    pub fn register_user(&self, user_id: &str) {
        let mut inner = self.inner.lock();
        if inner.closed {
            return;
        }
        inner.users.insert(user_id.to_string());

        if inner.collecting.is_none() {
            self.arm_collection(&mut inner);
        }
    }

    fn arm_collection(&self, inner: &mut Inner<S>) {
        let me = self.me.clone();
        inner.collecting = Some(TaskHandle::after(self.collect_users_timeout, move || {
            if let Some(instance) = me.upgrade() {
                instance.collect_users();
            }
        }));
    }

    /// Rebuild the user set from the pulls still waiting. Waiters are woken
    /// when the count changed so they can report it. The sweep keeps running
    /// until no users are left.
    fn collect_users(&self) {
        let waiters = {
            let mut inner = self.inner.lock();
            if inner.closed {
                return;
            }

            let before = inner.users.len();
            let users: HashSet<UserId> = inner
                .waiting
                .iter()
                .map(|w| w.user_id.clone())
                .collect();
            inner.users = users;

            if inner.users.is_empty() {
                inner.collecting = None;
            } else {
                self.arm_collection(&mut inner);
            }

            if inner.users.len() == before {
                return;
            }
            debug!(
                "User count for {} changed from {} to {}",
                self.name,
                before,
                inner.users.len()
            );
            std::mem::take(&mut inner.waiting)
        };
        resolve(waiters, Wake::Changed);
    }

    /// Current encoded snapshot, or `None` when encoding fails
    pub fn snapshot(&self) -> Option<Snapshot> {
        let (doc, version) = {
            let inner = self.inner.lock();
            (inner.state.doc().clone(), inner.state.version())
        };
        match self.schema.encode_doc(&doc) {
            Ok(doc) => Some(Snapshot { doc, version }),
            Err(e) => {
                warn!("Failed to encode document {}: {}", self.name, e);
                None
            }
        }
    }

    /// Hand the disk a lazy snapshot; it decides when to write.
    fn schedule_save(&self) {
        let me = self.me.clone();
        let snapshot: SnapshotFn = Arc::new(move || me.upgrade().and_then(|i| i.snapshot()));
        self.disk.update(&self.name, snapshot);
    }

    /// Close the instance and answer every parked pull with an empty
    /// result. Returns `false` if it was already closed.
    pub fn close(&self) -> bool {
        let waiters = {
            let mut inner = self.inner.lock();
            if inner.closed {
                return false;
            }
            inner.closed = true;
            inner.collecting = None;
            inner.users.clear();
            std::mem::take(&mut inner.waiting)
        };
        resolve(waiters, Wake::Aborted);
        true
    }

    /// Write the document through to disk immediately
    pub async fn flush(&self) {
        let Some(snapshot) = self.snapshot() else {
            return;
        };
        if let Err(e) = self.disk.flush(&self.name, snapshot).await {
            error!("Failed to flush document {}: {}", self.name, e);
        }
    }

    /// Close, then flush
    pub async fn shutdown(&self) {
        if self.close() {
            self.flush().await;
        }
    }

    fn empty_events(&self, version: u64) -> EventsView<S::Step> {
        let inner = self.inner.lock();
        EventsView {
            events: Events {
                version,
                steps: Vec::new(),
                client_ids: Vec::new(),
            },
            users: inner.users.len(),
        }
    }

    fn remove_waiter(&self, id: u64) {
        self.inner.lock().waiting.retain(|w| w.id != id);
    }
}

fn resolve(waiters: Vec<Waiter>, wake: Wake) {
    for waiter in waiters {
        let _ = waiter.tx.send(wake);
    }
}

struct WaiterGuard<'a, S: Schema> {
    instance: &'a Instance<S>,
    id: u64,
}

impl<S: Schema> Drop for WaiterGuard<'_, S> {
    fn drop(&mut self) {
        self.instance.remove_waiter(self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryDisk;
    use crate::sync::text::{TextSchema, TextStep};

    fn config() -> ManagerConfig {
        ManagerConfig::default()
            .with_user_wait_timeout(Duration::from_secs(60))
            .with_collect_users_timeout(Duration::from_secs(5))
    }

    fn instance(doc: &str) -> (Arc<MemoryDisk>, Arc<Instance<TextSchema>>) {
        let disk = Arc::new(MemoryDisk::new());
        let inst = Instance::new(
            "notes",
            doc.to_string(),
            Arc::new(TextSchema),
            disk.clone(),
            &config(),
        );
        (disk, inst)
    }

    #[tokio::test(start_paused = true)]
    async fn test_get_document_registers_user() {
        let (_disk, inst) = instance("hello world!");

        let view = inst.get_document("alice").unwrap();
        assert_eq!(view.doc, "hello world!");
        assert_eq!(view.version, 0);
        assert_eq!(view.users, 1);

        inst.get_document("alice").unwrap();
        assert_eq!(inst.user_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_push_wakes_parked_pull() {
        let (disk, inst) = instance("hello world!");

        let puller = inst.clone();
        let pull = tokio::spawn(async move { puller.pull_events("bob", 0).await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(inst.waiting_count(), 1);

        inst.push_events(0, &[TextStep::insert("X", 0)], "client-a")
            .unwrap();

        let view = pull.await.unwrap().unwrap();
        assert_eq!(view.events.version, 1);
        assert_eq!(view.events.steps, vec![TextStep::insert("X", 0)]);
        assert_eq!(view.events.client_ids, vec!["client-a".to_string()]);
        assert_eq!(inst.waiting_count(), 0);

        // the disk got a save hint with the new content
        assert_eq!(disk.update_count(), 1);
        assert_eq!(disk.get("notes").unwrap().doc, "Xhello world!");
    }

    #[tokio::test(start_paused = true)]
    async fn test_pull_with_history_returns_immediately() {
        let (_disk, inst) = instance("abc");
        inst.push_events(0, &[TextStep::insert("1", 0)], "a").unwrap();
        inst.push_events(1, &[TextStep::insert("2", 0)], "b").unwrap();

        let view = inst.pull_events("carol", 1).await.unwrap();
        assert_eq!(view.events.steps, vec![TextStep::insert("2", 0)]);
        assert_eq!(view.events.version, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pull_times_out_empty() {
        let (_disk, inst) = instance("abc");

        let puller = inst.clone();
        let pull = tokio::spawn(async move { puller.pull_events("bob", 0).await });

        tokio::time::sleep(Duration::from_secs(59)).await;
        assert!(!pull.is_finished());

        tokio::time::sleep(Duration::from_secs(2)).await;
        let view = pull.await.unwrap().unwrap();
        assert!(view.events.is_empty());
        assert_eq!(view.events.version, 0);
        assert_eq!(inst.waiting_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejected_push_leaves_waiters_parked() {
        let (disk, inst) = instance("abc");
        inst.push_events(0, &[TextStep::insert("x", 0)], "a").unwrap();

        let puller = inst.clone();
        let _pull = tokio::spawn(async move { puller.pull_events("bob", 1).await });
        tokio::time::sleep(Duration::from_millis(10)).await;

        let result = inst.push_events(0, &[TextStep::insert("y", 0)], "b");
        assert_eq!(result.unwrap_err(), Fail::OutdatedVersion);
        assert_eq!(inst.waiting_count(), 1);
        assert_eq!(inst.version(), 1);
        assert_eq!(disk.update_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_user_sweep_reports_new_count() {
        let (_disk, inst) = instance("abc");
        inst.get_document("alice").unwrap();

        let puller = inst.clone();
        let pull = tokio::spawn(async move { puller.pull_events("bob", 0).await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(inst.user_count(), 2);

        // alice is not waiting, so the sweep drops her and wakes bob
        tokio::time::sleep(Duration::from_secs(6)).await;
        let view = pull.await.unwrap().unwrap();
        assert!(view.events.is_empty());
        assert_eq!(view.users, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_user_sweep_forgets_departed_users() {
        let (_disk, inst) = instance("abc");

        let puller = inst.clone();
        let pull = tokio::spawn(async move { puller.pull_events("alice", 0).await });

        // alice stays parked across a sweep with an unchanged count
        tokio::time::sleep(Duration::from_secs(7)).await;
        assert_eq!(inst.user_count(), 1);
        assert!(!pull.is_finished());

        pull.abort();
        let _ = pull.await;
        assert_eq!(inst.waiting_count(), 0);

        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(inst.user_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_aborts_waiters_and_flushes() {
        let (disk, inst) = instance("abc");
        inst.push_events(0, &[TextStep::insert("!", 3)], "a").unwrap();

        let puller = inst.clone();
        let pull = tokio::spawn(async move { puller.pull_events("bob", 1).await });
        tokio::time::sleep(Duration::from_millis(10)).await;

        inst.shutdown().await;

        let view = pull.await.unwrap().unwrap();
        assert!(view.events.is_empty());
        assert_eq!(disk.flush_count(), 1);
        assert_eq!(disk.get("notes").unwrap().doc, "abc!");
        assert!(inst.is_closed());

        let late = inst.push_events(1, &[TextStep::insert("?", 0)], "a");
        assert_eq!(late.unwrap_err(), Fail::InvalidVersion);
    }
}
