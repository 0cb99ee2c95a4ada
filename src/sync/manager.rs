//! Request routing and instance lifecycle.
//!
//! The `Manager` resolves each request to the `Instance` of its document,
//! loading it from disk on first use. Retrieval goes through one fair async
//! mutex, so concurrent requests for an unseen document share one load.
//! Instances are evicted oldest-first above `max_instances` and swept when
//! idle.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use super::instance::Instance;
use super::protocol::{Request, Response};
use super::schema::Schema;
use super::timer::TaskHandle;
use super::{DocName, Fail, SyncResult};
use crate::storage::Disk;

/// Well-known bus address the manager listens on
pub const DEFAULT_ADDRESS: &str = "collab";

/// Configuration for the Manager
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// How long a pull waits for new steps before answering empty
    pub user_wait_timeout: Duration,
    /// Delay before the user set is rebuilt from waiting pulls
    pub collect_users_timeout: Duration,
    /// Period of the idle instance sweep
    pub instance_cleanup_timeout: Duration,
    /// Maximum number of live instances
    pub max_instances: usize,
    /// Bus address served besides the manager id
    pub address: String,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            user_wait_timeout: Duration::from_secs(60),
            collect_users_timeout: Duration::from_secs(5),
            instance_cleanup_timeout: Duration::from_secs(60),
            max_instances: 200,
            address: DEFAULT_ADDRESS.to_string(),
        }
    }
}

impl ManagerConfig {
    pub fn with_user_wait_timeout(mut self, timeout: Duration) -> Self {
        self.user_wait_timeout = timeout;
        self
    }

    pub fn with_collect_users_timeout(mut self, timeout: Duration) -> Self {
        self.collect_users_timeout = timeout;
        self
    }

    pub fn with_instance_cleanup_timeout(mut self, timeout: Duration) -> Self {
        self.instance_cleanup_timeout = timeout;
        self
    }

    pub fn with_max_instances(mut self, max: usize) -> Self {
        self.max_instances = max;
        self
    }

    pub fn with_address(mut self, address: impl Into<String>) -> Self {
        self.address = address.into();
        self
    }
}

/// Routes requests to per-document instances
pub struct Manager<S: Schema> {
    /// Random id for this manager's lifetime
    id: String,
    config: ManagerConfig,
    schema: Arc<S>,
    disk: Arc<dyn Disk>,
    instances: DashMap<DocName, Arc<Instance<S>>>,
    /// FIFO queue for instance retrieval
    creating: tokio::sync::Mutex<()>,
    destroyed: AtomicBool,
    started_at: Instant,
    shutdown_tx: broadcast::Sender<()>,
    cleanup_task: parking_lot::Mutex<Option<TaskHandle>>,
}

impl<S: Schema> Manager<S> {
    pub fn new(schema: S, disk: Arc<dyn Disk>, config: ManagerConfig) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            config,
            schema: Arc::new(schema),
            disk,
            instances: DashMap::new(),
            creating: tokio::sync::Mutex::new(()),
            destroyed: AtomicBool::new(false),
            started_at: Instant::now(),
            shutdown_tx,
            cleanup_task: parking_lot::Mutex::new(None),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn address(&self) -> &str {
        &self.config.address
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    pub fn schema(&self) -> &S {
        &self.schema
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::SeqCst)
    }

    /// Get a shutdown receiver
    pub fn shutdown_receiver(&self) -> broadcast::Receiver<()> {
        self.shutdown_tx.subscribe()
    }

    pub fn instance_count(&self) -> usize {
        self.instances.len()
    }

    /// Live instance for `doc_name`, if loaded
    pub fn get_instance(&self, doc_name: &str) -> Option<Arc<Instance<S>>> {
        self.instances.get(doc_name).map(|i| i.clone())
    }

    /// Handle one request end to end
    pub async fn handle_request(&self, request: Request) -> SyncResult<Response> {
        if self.is_destroyed() {
            return Err(Fail::ManagerDestroyed);
        }

        match request {
            Request::GetDocument { doc_name, user_id } => {
                let instance = self.instance(&doc_name).await?;
                let view = instance.get_document(&user_id)?;
                Ok(Response::Document {
                    doc: self.schema.encode_doc(&view.doc)?,
                    version: view.version,
                    users: view.users,
                    manager_id: self.id.clone(),
                })
            }
            Request::PullEvents {
                doc_name,
                user_id,
                version,
                manager_id,
            } => {
                self.check_manager(&manager_id)?;
                let instance = self.instance(&doc_name).await?;
                let view = instance.pull_events(&user_id, version).await?;
                let steps = view
                    .events
                    .steps
                    .iter()
                    .map(|step| self.schema.encode_step(step))
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(Response::Events {
                    version: view.events.version,
                    steps,
                    client_ids: view.events.client_ids,
                    users: view.users,
                })
            }
            Request::PushEvents {
                doc_name,
                version,
                steps,
                client_id,
                manager_id,
                ..
            } => {
                self.check_manager(&manager_id)?;
                let steps = steps
                    .iter()
                    .map(|s| self.schema.decode_step(s))
                    .collect::<Result<Vec<_>, _>>()?;
                let instance = self.instance(&doc_name).await?;
                instance.push_events(version, &steps, &client_id)?;
                Ok(Response::Pushed)
            }
        }
    }

    fn check_manager(&self, manager_id: &str) -> SyncResult<()> {
        if manager_id != self.id {
            return Err(Fail::IncorrectManager);
        }
        Ok(())
    }

    /// Live instance for `doc_name`, loading it from disk if needed.
    async fn instance(&self, doc_name: &str) -> SyncResult<Arc<Instance<S>>> {
        let _queue = self.creating.lock().await;
        if self.is_destroyed() {
            return Err(Fail::ManagerDestroyed);
        }

        if let Some(instance) = self.instances.get(doc_name) {
            return Ok(instance.clone());
        }

        let encoded = self
            .disk
            .load(doc_name)
            .await
            .map_err(|e| Fail::Storage(e.to_string()))?
            .ok_or_else(|| Fail::DocumentNotFound(doc_name.to_string()))?;
        let doc = self
            .schema
            .decode_doc(&encoded)
            .map_err(|e| Fail::Storage(format!("{}: {}", doc_name, e)))?;
        if self.is_destroyed() {
            return Err(Fail::ManagerDestroyed);
        }

        let instance = Instance::new(
            doc_name,
            doc,
            self.schema.clone(),
            self.disk.clone(),
            &self.config,
        );
        self.instances.insert(doc_name.to_string(), instance.clone());
        info!("Created instance: {}", doc_name);

        if self.instances.len() > self.config.max_instances {
            self.evict_oldest(doc_name).await;
        }

        Ok(instance)
    }

    /// Shut down the least recently active instance other than `keep`
    async fn evict_oldest(&self, keep: &str) {
        let oldest = self
            .instances
            .iter()
            .filter(|entry| entry.key() != keep)
            .min_by_key(|entry| entry.value().last_active())
            .map(|entry| entry.key().clone());

        if let Some(name) = oldest {
            if let Some((_, instance)) = self.instances.remove(&name) {
                info!("Evicting instance: {}", name);
                instance.shutdown().await;
            }
        }
    }

    /// Remove instances with no users, returning how many were removed
    pub async fn cleanup(&self) -> usize {
        let _queue = self.creating.lock().await;

        let idle: Vec<DocName> = self
            .instances
            .iter()
            .filter(|entry| entry.value().user_count() == 0)
            .map(|entry| entry.key().clone())
            .collect();

        let mut removed = 0;
        for name in idle {
            if let Some((_, instance)) = self
                .instances
                .remove_if(&name, |_, instance| instance.user_count() == 0)
            {
                instance.shutdown().await;
                info!("Removed idle instance: {}", name);
                removed += 1;
            }
        }
        removed
    }

    /// Start the idle instance sweep
    pub fn start_background_tasks(self: &Arc<Self>) {
        let manager = Arc::downgrade(self);
        // tokio intervals panic on a zero period
        let period = self
            .config
            .instance_cleanup_timeout
            .max(Duration::from_millis(1));
        let mut shutdown = self.shutdown_receiver();

        let task = TaskHandle::spawn(async move {
            let mut interval = tokio::time::interval(period);
            // the first tick completes immediately
            interval.tick().await;

            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        let Some(manager) = manager.upgrade() else {
                            break;
                        };
                        let removed = manager.cleanup().await;
                        if removed > 0 {
                            debug!("Cleaned up {} idle instances", removed);
                        }
                    }
                    _ = shutdown.recv() => {
                        info!("Cleanup task shutting down");
                        break;
                    }
                }
            }
        });

        *self.cleanup_task.lock() = Some(task);
    }

    /// Stop serving: every further request fails with `ManagerDestroyed`,
    /// parked pulls are answered and each instance is flushed.
    pub async fn destroy(&self) {
        if self.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self.shutdown_tx.send(());
        self.cleanup_task.lock().take();

        // answer parked pulls before waiting on loads or disk writes
        let mut closed = self.close_all();
        let _queue = self.creating.lock().await;
        closed.extend(self.close_all());
        for instance in closed {
            instance.flush().await;
        }

        if !self.instances.is_empty() {
            warn!("{} instances left after destroy", self.instances.len());
        }
        info!("Manager {} destroyed", self.id);
    }

    /// Remove and close every instance without flushing
    fn close_all(&self) -> Vec<Arc<Instance<S>>> {
        let names: Vec<DocName> = self.instances.iter().map(|e| e.key().clone()).collect();
        names
            .into_iter()
            .filter_map(|name| self.instances.remove(&name))
            .filter_map(|(_, instance)| instance.close().then_some(instance))
            .collect()
    }

    /// Get manager statistics
    pub fn stats(&self) -> ManagerStats {
        let mut stats = ManagerStats {
            manager_id: self.id.clone(),
            instances: self.instances.len(),
            users: 0,
            waiting: 0,
            uptime_seconds: self.started_at.elapsed().as_secs(),
        };
        for entry in self.instances.iter() {
            stats.users += entry.value().user_count();
            stats.waiting += entry.value().waiting_count();
        }
        stats
    }
}

/// Manager statistics
#[derive(Debug, Clone, Serialize)]
pub struct ManagerStats {
    pub manager_id: String,
    pub instances: usize,
    pub users: usize,
    pub waiting: usize,
    pub uptime_seconds: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryDisk;
    use crate::sync::text::{TextSchema, TextStep};
    use tokio_test::assert_ok;

    fn manager(disk: Arc<MemoryDisk>, config: ManagerConfig) -> Arc<Manager<TextSchema>> {
        Arc::new(Manager::new(TextSchema, disk, config))
    }

    fn get(doc: &str, user: &str) -> Request {
        Request::GetDocument {
            doc_name: doc.to_string(),
            user_id: user.to_string(),
        }
    }

    fn push(doc: &str, version: u64, step: &TextStep, client: &str, manager_id: &str) -> Request {
        Request::PushEvents {
            doc_name: doc.to_string(),
            user_id: client.to_string(),
            version,
            steps: vec![TextSchema.encode_step(step).unwrap()],
            client_id: client.to_string(),
            manager_id: manager_id.to_string(),
        }
    }

    fn pull(doc: &str, version: u64, user: &str, manager_id: &str) -> Request {
        Request::PullEvents {
            doc_name: doc.to_string(),
            user_id: user.to_string(),
            version,
            manager_id: manager_id.to_string(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_hello_world_round_trip() {
        let disk = Arc::new(MemoryDisk::new().with_doc("notes", "hello world!"));
        let mgr = manager(disk, ManagerConfig::default());

        let response = mgr.handle_request(get("notes", "A")).await.unwrap();
        let Response::Document {
            doc,
            version,
            manager_id,
            ..
        } = response
        else {
            panic!("Expected document");
        };
        assert_eq!(doc, "hello world!");
        assert_eq!(version, 0);
        assert_eq!(manager_id, mgr.id());

        let pushed = mgr
            .handle_request(push("notes", 0, &TextStep::insert("X", 0), "A", &manager_id))
            .await;
        assert_eq!(pushed, Ok(Response::Pushed));

        let events = mgr
            .handle_request(pull("notes", 0, "B", &manager_id))
            .await
            .unwrap();
        match events {
            Response::Events {
                version,
                steps,
                client_ids,
                ..
            } => {
                assert_eq!(version, 1);
                assert_eq!(steps.len(), 1);
                assert_eq!(
                    TextSchema.decode_step(&steps[0]).unwrap(),
                    TextStep::insert("X", 0)
                );
                assert_eq!(client_ids, vec!["A".to_string()]);
            }
            other => panic!("Unexpected response: {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_pushes_one_wins() {
        let disk = Arc::new(MemoryDisk::new().with_doc("notes", "abc"));
        let mgr = manager(disk, ManagerConfig::default());
        let id = mgr.id().to_string();

        let first = mgr
            .handle_request(push("notes", 0, &TextStep::insert("1", 0), "c1", &id))
            .await;
        let second = mgr
            .handle_request(push("notes", 0, &TextStep::insert("2", 0), "c2", &id))
            .await;

        assert_eq!(first, Ok(Response::Pushed));
        assert_eq!(second, Err(Fail::OutdatedVersion));
        assert_eq!(mgr.get_instance("notes").unwrap().version(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unknown_document() {
        let disk = Arc::new(MemoryDisk::new());
        let mgr = manager(disk.clone(), ManagerConfig::default());

        let result = mgr.handle_request(get("missing", "A")).await;
        assert_eq!(result, Err(Fail::DocumentNotFound("missing".to_string())));
        assert_eq!(mgr.instance_count(), 0);
        assert_eq!(disk.load_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_incorrect_manager_does_not_load() {
        let disk = Arc::new(MemoryDisk::new().with_doc("notes", "abc"));
        let mgr = manager(disk.clone(), ManagerConfig::default());

        let result = mgr.handle_request(pull("notes", 0, "A", "someone-else")).await;
        assert_eq!(result, Err(Fail::IncorrectManager));
        let result = mgr
            .handle_request(push("notes", 0, &TextStep::insert("x", 0), "A", "nope"))
            .await;
        assert_eq!(result, Err(Fail::IncorrectManager));

        assert_eq!(disk.load_count(), 0);
        assert_eq!(mgr.instance_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_first_requests_share_one_load() {
        let disk = Arc::new(MemoryDisk::new().with_doc("notes", "abc"));
        let mgr = manager(disk.clone(), ManagerConfig::default());

        let (a, b) = tokio::join!(
            mgr.handle_request(get("notes", "A")),
            mgr.handle_request(get("notes", "B"))
        );
        assert_ok!(a);
        assert_ok!(b);
        assert_eq!(disk.load_count(), 1);
        assert_eq!(mgr.get_instance("notes").unwrap().user_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_eviction_drops_least_recently_active() {
        let disk = Arc::new(
            MemoryDisk::new()
                .with_doc("a", "1")
                .with_doc("b", "2")
                .with_doc("c", "3"),
        );
        let mgr = manager(disk.clone(), ManagerConfig::default().with_max_instances(2));

        mgr.handle_request(get("a", "u")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        mgr.handle_request(get("b", "u")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        // touch "a" again so "b" becomes the oldest
        mgr.handle_request(get("a", "u")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        mgr.handle_request(get("c", "u")).await.unwrap();

        assert_eq!(mgr.instance_count(), 2);
        assert!(mgr.get_instance("a").is_some());
        assert!(mgr.get_instance("b").is_none());
        assert!(mgr.get_instance("c").is_some());
        assert_eq!(disk.flush_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_cleanup_reloads_from_disk() {
        let disk = Arc::new(MemoryDisk::new().with_doc("notes", "abc"));
        let config = ManagerConfig::default()
            .with_collect_users_timeout(Duration::from_secs(5))
            .with_instance_cleanup_timeout(Duration::from_secs(60));
        let mgr = manager(disk.clone(), config);
        mgr.start_background_tasks();

        let Response::Document { manager_id, .. } =
            mgr.handle_request(get("notes", "A")).await.unwrap()
        else {
            panic!("Expected document");
        };
        mgr.handle_request(push("notes", 0, &TextStep::insert("x", 0), "A", &manager_id))
            .await
            .unwrap();

        // the user sweep empties the user set, then the cleanup removes it
        tokio::time::sleep(Duration::from_secs(61)).await;
        assert_eq!(mgr.instance_count(), 0);
        assert_eq!(disk.get("notes").unwrap().doc, "xabc");

        // a later request loads a fresh instance at version 0
        let result = mgr.handle_request(pull("notes", 1, "A", &manager_id)).await;
        assert_eq!(result, Err(Fail::InvalidVersion));
        assert_eq!(disk.load_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_destroy_answers_waiters_and_flushes() {
        let disk = Arc::new(MemoryDisk::new().with_doc("notes", "abc"));
        let mgr = manager(disk.clone(), ManagerConfig::default());
        let id = mgr.id().to_string();

        let waiting = mgr.clone();
        let waiter_id = id.clone();
        let parked = tokio::spawn(async move {
            waiting.handle_request(pull("notes", 0, "B", &waiter_id)).await
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(mgr.stats().waiting, 1);

        mgr.destroy().await;

        match parked.await.unwrap() {
            Ok(Response::Events { steps, .. }) => assert!(steps.is_empty()),
            other => panic!("Unexpected response: {:?}", other),
        }
        assert_eq!(disk.flush_count(), 1);
        assert_eq!(
            mgr.handle_request(get("notes", "A")).await,
            Err(Fail::ManagerDestroyed)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_departed_user_lets_instance_be_cleaned_up() {
        let disk = Arc::new(MemoryDisk::new().with_doc("notes", "abc"));
        let config = ManagerConfig::default()
            .with_collect_users_timeout(Duration::from_secs(5))
            .with_instance_cleanup_timeout(Duration::from_secs(60));
        let mgr = manager(disk.clone(), config);
        mgr.start_background_tasks();
        let id = mgr.id().to_string();

        mgr.handle_request(get("notes", "alice")).await.unwrap();
        let waiting = mgr.clone();
        let parked = tokio::spawn(async move {
            waiting.handle_request(pull("notes", 0, "alice", &id)).await
        });

        // the sweep runs while alice is parked, then she disconnects
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(mgr.stats().users, 1);
        parked.abort();
        let _ = parked.await;

        tokio::time::sleep(Duration::from_secs(600)).await;
        assert_eq!(mgr.instance_count(), 0);
        assert_eq!(disk.load_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_cleanup_period_keeps_sweeping() {
        let disk = Arc::new(MemoryDisk::new().with_doc("notes", "abc"));
        let config = ManagerConfig::default()
            .with_collect_users_timeout(Duration::from_millis(5))
            .with_instance_cleanup_timeout(Duration::ZERO);
        let mgr = manager(disk, config);
        mgr.start_background_tasks();

        mgr.handle_request(get("notes", "alice")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(mgr.instance_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_destroy_does_not_wait_for_slow_load() {
        let disk = Arc::new(
            MemoryDisk::new()
                .with_doc("a", "abc")
                .with_doc("b", "def")
                .with_load_delay(Duration::from_secs(10)),
        );
        let mgr = manager(disk.clone(), ManagerConfig::default());
        let id = mgr.id().to_string();

        let waiting = mgr.clone();
        let parked = tokio::spawn(async move {
            waiting.handle_request(pull("a", 0, "alice", &id)).await
        });
        tokio::time::sleep(Duration::from_secs(11)).await;
        assert_eq!(mgr.stats().waiting, 1);

        let loading = mgr.clone();
        let slow = tokio::spawn(async move { loading.handle_request(get("b", "bob")).await });
        tokio::time::sleep(Duration::from_millis(10)).await;

        let destroying = mgr.clone();
        let destroy = tokio::spawn(async move { destroying.destroy().await });
        tokio::time::sleep(Duration::from_millis(10)).await;

        // the parked pull is answered while "b" is still loading
        assert!(parked.is_finished());
        assert!(!slow.is_finished());

        assert_eq!(slow.await.unwrap(), Err(Fail::ManagerDestroyed));
        destroy.await.unwrap();
        assert_eq!(mgr.instance_count(), 0);
        assert_eq!(disk.flush_count(), 1);
    }

    #[tokio::test]
    async fn test_stats() {
        let disk = Arc::new(MemoryDisk::new().with_doc("notes", "abc"));
        let mgr = manager(disk, ManagerConfig::default());
        mgr.handle_request(get("notes", "A")).await.unwrap();

        let stats = mgr.stats();
        assert_eq!(stats.instances, 1);
        assert_eq!(stats.users, 1);
        assert_eq!(stats.manager_id, mgr.id());
    }
}
