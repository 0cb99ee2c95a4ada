//! Client reconciliation loop.
//!
//! A [`Session`] keeps a local replica of one document converged with the
//! authority. A single actor task owns the replica; requests run as child
//! tasks that report back over a channel, so nothing else ever mutates it.
//!
//! - init: fetch the document and become ready
//! - pull: long-poll for new steps, confirm our own, rebase the rest
//! - push: send unconfirmed steps; acceptance shows up in the next pull
//!
//! Failed requests are classified into restart, re-pull, backoff or fatal.

mod recovery;
mod replica;

pub use recovery::{classify, Backoff, Recovery, INITIAL_BACKOFF, MAX_BACKOFF};
pub use replica::Replica;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, error, info, warn};

use crate::sync::manager::DEFAULT_ADDRESS;
use crate::sync::protocol::{Request, Response};
use crate::sync::timer::TaskHandle;
use crate::sync::{Fail, Schema, StepError, SyncResult};
use crate::transport::{wrap_request, Transport, DEFAULT_REQUEST_TIMEOUT};

/// Errors returned to callers of a session
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("Session is not ready")]
    NotReady,

    #[error("Step does not apply: {0}")]
    Step(#[from] StepError),

    #[error("Session closed")]
    Closed,
}

/// Configuration for a session
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub doc_name: String,
    pub user_id: String,
    /// Tags the steps this session pushes
    pub client_id: String,
    /// Bus address pongs are sent to
    pub address: String,
    /// Bus address of the manager
    pub server_address: String,
    /// Timeout for document fetches and pushes
    pub request_timeout: Duration,
    /// Timeout for pulls; must outlast the server's long-poll
    pub pull_timeout: Duration,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl SessionConfig {
    pub fn new(doc_name: impl Into<String>, user_id: impl Into<String>) -> Self {
        let client_id = uuid::Uuid::new_v4().to_string();
        Self {
            doc_name: doc_name.into(),
            user_id: user_id.into(),
            address: client_id.clone(),
            client_id,
            server_address: DEFAULT_ADDRESS.to_string(),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            pull_timeout: Duration::from_secs(70),
            initial_backoff: INITIAL_BACKOFF,
            max_backoff: MAX_BACKOFF,
        }
    }

    pub fn with_client_id(mut self, client_id: impl Into<String>) -> Self {
        self.client_id = client_id.into();
        self
    }

    pub fn with_address(mut self, address: impl Into<String>) -> Self {
        self.address = address.into();
        self
    }

    pub fn with_server_address(mut self, address: impl Into<String>) -> Self {
        self.server_address = address.into();
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_pull_timeout(mut self, timeout: Duration) -> Self {
        self.pull_timeout = timeout;
        self
    }

    pub fn with_backoff(mut self, initial: Duration, max: Duration) -> Self {
        self.initial_backoff = initial;
        self.max_backoff = max;
        self
    }
}

/// Editor selection, in document positions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Selection {
    pub anchor: usize,
    pub head: usize,
}

impl Selection {
    pub fn cursor(pos: usize) -> Self {
        Self {
            anchor: pos,
            head: pos,
        }
    }

    /// Whether both ends address a document of `len` positions
    pub fn fits(&self, len: usize) -> bool {
        self.anchor.max(self.head) <= len
    }
}

/// What observers see of a session
#[derive(Debug, Clone)]
pub struct View<D> {
    /// Document including unconfirmed local steps
    pub doc: Option<D>,
    pub version: u64,
    pub users: usize,
    pub ready: bool,
    pub unconfirmed: usize,
    pub selection: Option<Selection>,
}

impl<D> View<D> {
    fn empty() -> Self {
        Self {
            doc: None,
            version: 0,
            users: 0,
            ready: false,
            unconfirmed: 0,
            selection: None,
        }
    }
}

/// Lifecycle events
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// The document was fetched and edits are accepted
    Ready { version: u64 },
    /// The replica is being replaced after the given failure
    Restarted(Fail),
    /// The session stopped; call `restart` to try again
    Fatal(Fail),
}

enum Command<S: Schema> {
    Edit {
        step: S::Step,
        reply: oneshot::Sender<Result<(), ClientError>>,
    },
    Select(Option<Selection>),
    Restart,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Op {
    Init,
    Pull,
    Push,
}

enum Outcome {
    Init {
        epoch: u64,
        result: SyncResult<Response>,
    },
    Pull {
        epoch: u64,
        ticket: u64,
        result: SyncResult<Response>,
    },
    Push {
        epoch: u64,
        base: u64,
        result: SyncResult<Response>,
    },
    Retry {
        epoch: u64,
        op: Op,
    },
}

impl Outcome {
    fn epoch(&self) -> u64 {
        match self {
            Outcome::Init { epoch, .. }
            | Outcome::Pull { epoch, .. }
            | Outcome::Push { epoch, .. }
            | Outcome::Retry { epoch, .. } => *epoch,
        }
    }
}

fn unexpected(response: &Response) -> Fail {
    Fail::ApplyFailed(format!("Unexpected response: {:?}", response))
}

/// Handle to a running session. Dropping it stops the session.
pub struct Session<S: Schema> {
    client_id: String,
    commands: mpsc::UnboundedSender<Command<S>>,
    view: watch::Receiver<View<S::Doc>>,
    events: mpsc::UnboundedReceiver<SessionEvent>,
    _actor: TaskHandle,
}

impl<S: Schema> Session<S> {
    pub fn start(schema: S, transport: Arc<dyn Transport>, config: SessionConfig) -> Self {
        Self::start_with_selection(schema, transport, config, None)
    }

    /// Start a session, restoring `selection` once the document is loaded
    /// if it still fits.
    pub fn start_with_selection(
        schema: S,
        transport: Arc<dyn Transport>,
        config: SessionConfig,
        selection: Option<Selection>,
    ) -> Self {
        let (commands, commands_rx) = mpsc::unbounded_channel();
        let (outcomes, outcomes_rx) = mpsc::unbounded_channel();
        let (view_tx, view) = watch::channel(View::empty());
        let (events_tx, events) = mpsc::unbounded_channel();

        let client_id = config.client_id.clone();
        let backoff = Backoff::new(config.initial_backoff, config.max_backoff);
        let actor = Actor {
            schema,
            transport,
            config,
            replica: None,
            manager_id: None,
            users: 0,
            ready: false,
            parked: false,
            selection,
            epoch: 0,
            ticket: 0,
            init_task: None,
            pull_task: None,
            push_task: None,
            awaiting_confirm: false,
            retries: HashMap::new(),
            backoff,
            outcomes,
            view: view_tx,
            events: events_tx,
        };

        Self {
            client_id,
            commands,
            view,
            events,
            _actor: TaskHandle::spawn(actor.run(commands_rx, outcomes_rx)),
        }
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// Apply a local edit. Rejected with `NotReady` until the document is
    /// loaded and while the session restarts.
    pub async fn apply(&self, step: S::Step) -> Result<(), ClientError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::Edit { step, reply })
            .map_err(|_| ClientError::Closed)?;
        rx.await.map_err(|_| ClientError::Closed)?
    }

    pub fn select(&self, selection: Option<Selection>) -> Result<(), ClientError> {
        self.commands
            .send(Command::Select(selection))
            .map_err(|_| ClientError::Closed)
    }

    /// Fetch the document again, e.g. after a fatal failure
    pub fn restart(&self) -> Result<(), ClientError> {
        self.commands
            .send(Command::Restart)
            .map_err(|_| ClientError::Closed)
    }

    /// Current view
    pub fn view(&self) -> View<S::Doc> {
        self.view.borrow().clone()
    }

    /// Watch the view for changes
    pub fn watch(&self) -> watch::Receiver<View<S::Doc>> {
        self.view.clone()
    }

    pub async fn next_event(&mut self) -> Option<SessionEvent> {
        self.events.recv().await
    }
}

struct Actor<S: Schema> {
    schema: S,
    transport: Arc<dyn Transport>,
    config: SessionConfig,
    replica: Option<Replica<S>>,
    manager_id: Option<String>,
    users: usize,
    ready: bool,
    /// Set after a fatal failure until restarted
    parked: bool,
    selection: Option<Selection>,
    /// Bumped on every (re)init; outcomes from older epochs are ignored
    epoch: u64,
    /// Identifies the current pull
    ticket: u64,
    init_task: Option<TaskHandle>,
    pull_task: Option<TaskHandle>,
    push_task: Option<TaskHandle>,
    /// A push was accepted but its steps have not come back yet
    awaiting_confirm: bool,
    retries: HashMap<Op, TaskHandle>,
    backoff: Backoff,
    outcomes: mpsc::UnboundedSender<Outcome>,
    view: watch::Sender<View<S::Doc>>,
    events: mpsc::UnboundedSender<SessionEvent>,
}

impl<S: Schema> Actor<S> {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command<S>>,
        mut outcomes: mpsc::UnboundedReceiver<Outcome>,
    ) {
        self.init();

        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(command) => self.on_command(command),
                    None => break,
                },
                Some(outcome) = outcomes.recv() => self.on_outcome(outcome),
            }
        }
        debug!("Session {} for {} stopped", self.config.client_id, self.config.doc_name);
    }

    fn spawn_request<F>(&self, request: Request, timeout: Duration, done: F) -> TaskHandle
    where
        F: FnOnce(SyncResult<Response>) -> Outcome + Send + 'static,
    {
        let transport = self.transport.clone();
        let to = self.config.server_address.clone();
        let from = self.config.address.clone();
        let outcomes = self.outcomes.clone();

        TaskHandle::spawn(async move {
            let result = wrap_request(transport.as_ref(), request, &to, &from, timeout).await;
            let _ = outcomes.send(done(result));
        })
    }

    fn publish(&self) {
        let replica = self.replica.as_ref();
        self.view.send_replace(View {
            doc: replica.map(|r| r.doc().clone()),
            version: replica.map(|r| r.version()).unwrap_or(0),
            users: self.users,
            ready: self.ready,
            unconfirmed: replica.map(|r| r.unconfirmed().len()).unwrap_or(0),
            selection: self.selection,
        });
    }

    fn init(&mut self) {
        self.epoch += 1;
        self.ready = false;
        self.parked = false;
        self.awaiting_confirm = false;
        self.pull_task = None;
        self.push_task = None;
        self.retries.clear();
        self.publish();

        let epoch = self.epoch;
        let request = Request::GetDocument {
            doc_name: self.config.doc_name.clone(),
            user_id: self.config.user_id.clone(),
        };
        self.init_task = Some(self.spawn_request(
            request,
            self.config.request_timeout,
            move |result| Outcome::Init { epoch, result },
        ));
    }

    fn restart(&mut self, reason: Fail) {
        warn!("Restarting session for {}: {}", self.config.doc_name, reason);
        let _ = self.events.send(SessionEvent::Restarted(reason));
        self.init();
    }

    fn fatal(&mut self, fail: Fail) {
        error!("Session for {} stopped: {}", self.config.doc_name, fail);
        self.epoch += 1;
        self.ready = false;
        self.parked = true;
        self.init_task = None;
        self.pull_task = None;
        self.push_task = None;
        self.retries.clear();
        self.publish();
        let _ = self.events.send(SessionEvent::Fatal(fail));
    }

    fn recover(&mut self, op: Op, fail: Fail) {
        match classify(&fail) {
            Recovery::Restart => self.restart(fail),
            Recovery::Repull => self.pull(),
            Recovery::Backoff => {
                let delay = self.backoff.next_delay();
                warn!(
                    "{:?} for {} got no answer, retrying in {:?}",
                    op, self.config.doc_name, delay
                );
                let epoch = self.epoch;
                let outcomes = self.outcomes.clone();
                let timer = TaskHandle::after(delay, move || {
                    let _ = outcomes.send(Outcome::Retry { epoch, op });
                });
                self.retries.insert(op, timer);
            }
            Recovery::Fatal => self.fatal(fail),
        }
    }

    fn pull(&mut self) {
        let request = match (&self.replica, &self.manager_id) {
            (Some(replica), Some(manager_id)) if self.ready => Request::PullEvents {
                doc_name: self.config.doc_name.clone(),
                user_id: self.config.user_id.clone(),
                version: replica.version(),
                manager_id: manager_id.clone(),
            },
            _ => return,
        };

        self.ticket += 1;
        let (epoch, ticket) = (self.epoch, self.ticket);
        self.retries.remove(&Op::Pull);
        // replacing the handle aborts the pull in flight
        self.pull_task = Some(self.spawn_request(
            request,
            self.config.pull_timeout,
            move |result| Outcome::Pull {
                epoch,
                ticket,
                result,
            },
        ));
    }

    fn push(&mut self) {
        if !self.ready || self.push_task.is_some() || self.awaiting_confirm {
            return;
        }

        let encoded = match (&self.replica, &self.manager_id) {
            (Some(replica), Some(manager_id)) if !replica.unconfirmed().is_empty() => replica
                .unconfirmed()
                .iter()
                .map(|step| self.schema.encode_step(step))
                .collect::<Result<Vec<_>, _>>()
                .map(|steps| {
                    let request = Request::PushEvents {
                        doc_name: self.config.doc_name.clone(),
                        user_id: self.config.user_id.clone(),
                        version: replica.version(),
                        steps,
                        client_id: self.config.client_id.clone(),
                        manager_id: manager_id.clone(),
                    };
                    (request, replica.version())
                }),
            _ => return,
        };
        let (request, base) = match encoded {
            Ok(encoded) => encoded,
            Err(e) => return self.fatal(e.into()),
        };

        let epoch = self.epoch;
        self.retries.remove(&Op::Push);
        self.push_task = Some(self.spawn_request(
            request,
            self.config.request_timeout,
            move |result| Outcome::Push {
                epoch,
                base,
                result,
            },
        ));
    }

    fn on_command(&mut self, command: Command<S>) {
        match command {
            Command::Edit { step, reply } => {
                let result = self.edit(step);
                let _ = reply.send(result);
            }
            Command::Select(selection) => {
                let len = self.replica.as_ref().map(|r| self.schema.doc_len(r.doc()));
                self.selection = match (selection, len) {
                    (Some(selection), Some(len)) if selection.fits(len) => Some(selection),
                    _ => None,
                };
                self.publish();
            }
            Command::Restart => {
                info!("Restart requested for {}", self.config.doc_name);
                self.init();
            }
        }
    }

    fn edit(&mut self, step: S::Step) -> Result<(), ClientError> {
        if !self.ready {
            return Err(ClientError::NotReady);
        }
        let replica = self.replica.as_mut().ok_or(ClientError::NotReady)?;
        replica.apply_local(&self.schema, step)?;
        self.publish();
        self.push();
        Ok(())
    }

    fn on_outcome(&mut self, outcome: Outcome) {
        if self.parked || outcome.epoch() != self.epoch {
            return;
        }

        match outcome {
            Outcome::Init { result, .. } => {
                self.init_task = None;
                self.on_init(result);
            }
            Outcome::Pull { ticket, result, .. } => {
                if ticket != self.ticket {
                    return;
                }
                self.pull_task = None;
                self.on_pull(result);
            }
            Outcome::Push { base, result, .. } => {
                self.push_task = None;
                self.on_push(base, result);
            }
            Outcome::Retry { op, .. } => {
                self.retries.remove(&op);
                match op {
                    Op::Init => self.init(),
                    Op::Pull => self.pull(),
                    Op::Push => self.push(),
                }
            }
        }
    }

    fn on_init(&mut self, result: SyncResult<Response>) {
        let (doc, version, users, manager_id) = match result {
            Ok(Response::Document {
                doc,
                version,
                users,
                manager_id,
            }) => (doc, version, users, manager_id),
            Ok(other) => return self.fatal(unexpected(&other)),
            Err(fail) => return self.recover(Op::Init, fail),
        };
        let doc = match self.schema.decode_doc(&doc) {
            Ok(doc) => doc,
            Err(e) => return self.fatal(e.into()),
        };

        if let Some(old) = &self.replica {
            if !old.unconfirmed().is_empty() {
                warn!(
                    "Discarding {} unconfirmed steps for {}",
                    old.unconfirmed().len(),
                    self.config.doc_name
                );
            }
        }

        let len = self.schema.doc_len(&doc);
        if let Some(selection) = self.selection {
            if !selection.fits(len) {
                debug!("Dropping selection {:?} past end of document", selection);
                self.selection = None;
            }
        }

        self.replica = Some(Replica::new(doc, version));
        self.manager_id = Some(manager_id);
        self.users = users;
        self.ready = true;
        self.backoff.reset();
        info!(
            "Session for {} ready at version {}",
            self.config.doc_name, version
        );

        let _ = self.events.send(SessionEvent::Ready { version });
        self.publish();
        self.pull();
    }

    fn on_pull(&mut self, result: SyncResult<Response>) {
        let (version, steps, client_ids, users) = match result {
            Ok(Response::Events {
                version,
                steps,
                client_ids,
                users,
            }) => (version, steps, client_ids, users),
            Ok(other) => return self.fatal(unexpected(&other)),
            Err(fail) => return self.recover(Op::Pull, fail),
        };
        self.backoff.reset();
        self.users = users;

        if !steps.is_empty() {
            let decoded = steps
                .iter()
                .map(|s| self.schema.decode_step(s))
                .collect::<Result<Vec<_>, _>>();
            let steps = match decoded {
                Ok(steps) => steps,
                Err(e) => return self.fatal(e.into()),
            };

            let Some(replica) = self.replica.as_mut() else {
                return;
            };
            match replica.receive(
                &self.schema,
                version,
                &steps,
                &client_ids,
                &self.config.client_id,
            ) {
                Ok(confirmed) => debug!(
                    "Received {} steps for {} ({} ours), now at version {}",
                    steps.len(),
                    self.config.doc_name,
                    confirmed,
                    version
                ),
                Err(e) => return self.restart(e.into()),
            }
            self.awaiting_confirm = false;
        }

        self.publish();
        self.push();
        self.pull();
    }

    fn on_push(&mut self, base: u64, result: SyncResult<Response>) {
        match result {
            Ok(Response::Pushed) => {
                self.backoff.reset();
                // a pull may already have brought the steps back
                let current = self.replica.as_ref().map(|r| r.version());
                self.awaiting_confirm = current == Some(base);
                self.push();
            }
            Ok(other) => self.fatal(unexpected(&other)),
            // already rebased past the step that beat us
            Err(Fail::OutdatedVersion)
                if self.replica.as_ref().map(|r| r.version()) != Some(base) =>
            {
                self.push()
            }
            Err(fail) => self.recover(Op::Push, fail),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryDisk;
    use crate::sync::{Manager, ManagerConfig, TextSchema, TextStep};
    use crate::transport::{serve, LocalBus};

    fn server(bus: &LocalBus, disk: Arc<MemoryDisk>) -> (Arc<Manager<TextSchema>>, TaskHandle) {
        let manager = Arc::new(Manager::new(TextSchema, disk, ManagerConfig::default()));
        let handle = serve(manager.clone(), Arc::new(bus.clone()));
        (manager, handle)
    }

    fn session(bus: &LocalBus, user: &str) -> Session<TextSchema> {
        Session::start(
            TextSchema,
            Arc::new(bus.clone()),
            SessionConfig::new("notes", user),
        )
    }

    fn hello() -> Arc<MemoryDisk> {
        Arc::new(MemoryDisk::new().with_doc("notes", "hello world!"))
    }

    async fn wait_for<F>(session: &Session<TextSchema>, pred: F) -> View<String>
    where
        F: Fn(&View<String>) -> bool,
    {
        let mut rx = session.watch();
        let wait = async {
            loop {
                {
                    let view = rx.borrow_and_update();
                    if pred(&view) {
                        return view.clone();
                    }
                }
                rx.changed().await.expect("session stopped");
            }
        };
        tokio::time::timeout(Duration::from_secs(5), wait)
            .await
            .expect("view never matched")
    }

    #[tokio::test]
    async fn test_session_becomes_ready() {
        let bus = LocalBus::new();
        let (_manager, _server) = server(&bus, hello());
        let mut alice = session(&bus, "alice");

        assert_eq!(
            alice.next_event().await,
            Some(SessionEvent::Ready { version: 0 })
        );
        let view = alice.view();
        assert!(view.ready);
        assert_eq!(view.doc.as_deref(), Some("hello world!"));
        assert_eq!(view.users, 1);
    }

    #[tokio::test]
    async fn test_local_edit_is_confirmed() {
        let bus = LocalBus::new();
        let (manager, _server) = server(&bus, hello());
        let mut alice = session(&bus, "alice");
        alice.next_event().await;

        alice.apply(TextStep::insert("X", 0)).await.unwrap();
        assert_eq!(alice.view().doc.as_deref(), Some("Xhello world!"));

        let view = wait_for(&alice, |v| v.version == 1 && v.unconfirmed == 0).await;
        assert_eq!(view.doc.as_deref(), Some("Xhello world!"));
        assert_eq!(manager.get_instance("notes").unwrap().version(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_edits_converge() {
        let bus = LocalBus::new();
        let (_manager, _server) = server(&bus, hello());
        let mut alice = session(&bus, "alice");
        let mut bob = session(&bus, "bob");
        alice.next_event().await;
        bob.next_event().await;

        let (a, b) = tokio::join!(
            alice.apply(TextStep::insert("A", 0)),
            bob.apply(TextStep::insert("B", 12))
        );
        a.unwrap();
        b.unwrap();

        let settled = |v: &View<String>| v.version == 2 && v.unconfirmed == 0;
        let a_view = wait_for(&alice, settled).await;
        let b_view = wait_for(&bob, settled).await;

        assert_eq!(a_view.doc, b_view.doc);
        assert_eq!(a_view.doc.as_deref(), Some("Ahello world!B"));
    }

    #[tokio::test]
    async fn test_edits_rejected_until_ready() {
        let bus = LocalBus::new();
        let alice = session(&bus, "alice");

        let result = alice.apply(TextStep::insert("X", 0)).await;
        assert!(matches!(result, Err(ClientError::NotReady)));
        assert!(!alice.view().ready);
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_until_server_appears() {
        let bus = LocalBus::new();
        let mut alice = session(&bus, "alice");

        tokio::time::sleep(Duration::from_secs(3)).await;
        assert!(!alice.view().ready);

        let (_manager, _server) = server(&bus, hello());
        let event = tokio::time::timeout(Duration::from_secs(120), alice.next_event())
            .await
            .unwrap();
        assert_eq!(event, Some(SessionEvent::Ready { version: 0 }));
    }

    #[tokio::test]
    async fn test_restart_on_new_manager() {
        let bus = LocalBus::new();
        let disk = hello();
        let (first, first_server) = server(&bus, disk.clone());
        let mut alice = session(&bus, "alice");
        alice.next_event().await;

        alice.apply(TextStep::insert("X", 0)).await.unwrap();
        wait_for(&alice, |v| v.version == 1 && v.unconfirmed == 0).await;

        drop(first_server);
        while bus.subscriber_count("collab") > 0 {
            tokio::task::yield_now().await;
        }
        let (_second, _second_server) = server(&bus, disk.clone());

        // answers the parked pull; the next one reaches the new manager
        first.destroy().await;

        assert_eq!(
            alice.next_event().await,
            Some(SessionEvent::Restarted(Fail::IncorrectManager))
        );
        assert_eq!(
            alice.next_event().await,
            Some(SessionEvent::Ready { version: 0 })
        );
        assert_eq!(alice.view().doc.as_deref(), Some("Xhello world!"));
    }

    #[tokio::test]
    async fn test_destroyed_manager_is_fatal() {
        let bus = LocalBus::new();
        let (manager, _server) = server(&bus, hello());
        let mut alice = session(&bus, "alice");
        alice.next_event().await;

        manager.destroy().await;

        assert_eq!(
            alice.next_event().await,
            Some(SessionEvent::Fatal(Fail::ManagerDestroyed))
        );
        assert!(!alice.view().ready);
        let result = alice.apply(TextStep::insert("X", 0)).await;
        assert!(matches!(result, Err(ClientError::NotReady)));
    }

    #[tokio::test]
    async fn test_selection_is_restored_when_it_fits() {
        let bus = LocalBus::new();
        let (_manager, _server) = server(&bus, hello());

        let mut kept = Session::start_with_selection(
            TextSchema,
            Arc::new(bus.clone()),
            SessionConfig::new("notes", "alice"),
            Some(Selection { anchor: 2, head: 5 }),
        );
        kept.next_event().await;
        assert_eq!(kept.view().selection, Some(Selection { anchor: 2, head: 5 }));

        let mut dropped = Session::start_with_selection(
            TextSchema,
            Arc::new(bus.clone()),
            SessionConfig::new("notes", "bob"),
            Some(Selection::cursor(50)),
        );
        dropped.next_event().await;
        assert_eq!(dropped.view().selection, None);
    }
}
