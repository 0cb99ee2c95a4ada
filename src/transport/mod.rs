//! Request/response over a message bus.
//!
//! A [`Transport`] only knows how to deliver [`Message`]s to addresses.
//! Request/response is layered on top: [`wrap_request`] sends a ping and
//! waits for the pong carrying the same id, and [`serve`] answers pings
//! addressed to a manager.

mod local;
mod ws;

pub use local::LocalBus;
pub use ws::WsTransport;

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::sync::protocol::{
    Body, Message, MessageKind, ProtocolError, Request, Response, WireError,
};
use crate::sync::timer::TaskHandle;
use crate::sync::{Fail, Manager, Schema, SyncResult};

/// Default time to wait for a pong
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(1);

/// Notice broadcast when a manager stops accepting requests
pub const NOTICE_MANAGER_DESTROYED: &str = "manager-destroyed";

/// Transport errors
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("Transport closed")]
    Closed,

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("WebSocket error: {0}")]
    WebSocket(String),
}

/// Message delivery by address
pub trait Transport: Send + Sync + 'static {
    /// Deliver `message` to its `to` address, or to everyone when unset.
    fn transmit(&self, message: Message) -> Result<(), TransportError>;

    /// Receive messages addressed to `address` until the subscription is dropped.
    fn subscribe(&self, address: &str) -> Subscription;
}

/// Messages for one address. Unsubscribes when dropped.
pub struct Subscription {
    rx: mpsc::UnboundedReceiver<Message>,
    unsubscribe: Option<Box<dyn FnOnce() + Send>>,
}

impl Subscription {
    pub fn new<F>(rx: mpsc::UnboundedReceiver<Message>, unsubscribe: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        Self {
            rx,
            unsubscribe: Some(Box::new(unsubscribe)),
        }
    }

    pub async fn recv(&mut self) -> Option<Message> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<Message> {
        self.rx.try_recv().ok()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(unsubscribe) = self.unsubscribe.take() {
            unsubscribe();
        }
    }
}

/// Send `request` to `to` and wait for the matching pong on `from`.
///
/// Fails with `ManagerUnresponsive` when nothing arrives within `timeout`
/// or the transport is closed.
pub async fn wrap_request(
    transport: &dyn Transport,
    request: Request,
    to: &str,
    from: &str,
    timeout: Duration,
) -> SyncResult<Response> {
    let id = uuid::Uuid::new_v4().to_string();
    // subscribe first so a fast pong cannot be missed
    let mut replies = transport.subscribe(from);

    if let Err(e) = transport.transmit(Message::ping(id.as_str(), from, to, request)) {
        debug!("Failed to send request {}: {}", id, e);
        return Err(Fail::ManagerUnresponsive);
    }

    let wait = async {
        while let Some(message) = replies.recv().await {
            if message.kind != MessageKind::Pong || message.id != id {
                continue;
            }
            if let Body::Reply(reply) = message.body {
                return Some(reply);
            }
        }
        None
    };

    match tokio::time::timeout(timeout, wait).await {
        Ok(Some(reply)) => reply.map_err(Fail::from),
        Ok(None) | Err(_) => Err(Fail::ManagerUnresponsive),
    }
}

/// Answer pings addressed to the manager's service address or to its id.
///
/// Each request runs on its own task so a parked pull never blocks other
/// callers. Serving stops when the returned handle is dropped.
pub fn serve<S: Schema>(manager: Arc<Manager<S>>, transport: Arc<dyn Transport>) -> TaskHandle {
    let mut service = transport.subscribe(manager.address());
    let mut direct = transport.subscribe(manager.id());
    let mut shutdown = manager.shutdown_receiver();

    TaskHandle::spawn(async move {
        let mut announced = false;

        loop {
            let message = tokio::select! {
                Some(message) = service.recv() => message,
                Some(message) = direct.recv() => message,
                _ = shutdown.recv(), if !announced => {
                    announced = true;
                    let notice = Message::broadcast(manager.id(), NOTICE_MANAGER_DESTROYED);
                    if let Err(e) = transport.transmit(notice) {
                        warn!("Failed to announce shutdown: {}", e);
                    }
                    continue;
                }
                else => break,
            };

            if message.kind != MessageKind::Ping {
                continue;
            }
            let Body::Request(request) = message.body.clone() else {
                warn!("Ping {} from {} carries no request", message.id, message.from);
                continue;
            };

            let manager = manager.clone();
            let transport = transport.clone();
            tokio::spawn(async move {
                let kind = request.kind();
                let reply: Result<Response, WireError> =
                    manager.handle_request(request).await.map_err(WireError::from);
                if let Err(err) = &reply {
                    debug!("{} for {} failed: {}", kind, message.from, err.message);
                }
                let pong = Message::pong(&message, manager.id(), reply);
                if let Err(e) = transport.transmit(pong) {
                    warn!("Failed to answer {}: {}", message.from, e);
                }
            });
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryDisk;
    use crate::sync::{ManagerConfig, TextSchema};

    fn served_manager(bus: &LocalBus) -> (Arc<Manager<TextSchema>>, TaskHandle) {
        let disk = Arc::new(MemoryDisk::new().with_doc("notes", "hello world!"));
        let manager = Arc::new(Manager::new(TextSchema, disk, ManagerConfig::default()));
        let server = serve(manager.clone(), Arc::new(bus.clone()));
        (manager, server)
    }

    #[tokio::test]
    async fn test_request_round_trip() {
        let bus = LocalBus::new();
        let (manager, _server) = served_manager(&bus);

        let response = wrap_request(
            &bus,
            Request::GetDocument {
                doc_name: "notes".to_string(),
                user_id: "alice".to_string(),
            },
            "collab",
            "client-1",
            DEFAULT_REQUEST_TIMEOUT,
        )
        .await
        .unwrap();

        match response {
            Response::Document { doc, manager_id, .. } => {
                assert_eq!(doc, "hello world!");
                assert_eq!(manager_id, manager.id());
            }
            other => panic!("Unexpected response: {:?}", other),
        }
        // the reply subscription is gone
        assert_eq!(bus.subscriber_count("client-1"), 0);
    }

    #[tokio::test]
    async fn test_failure_crosses_the_bus() {
        let bus = LocalBus::new();
        let (manager, _server) = served_manager(&bus);

        let result = wrap_request(
            &bus,
            Request::GetDocument {
                doc_name: "missing".to_string(),
                user_id: "alice".to_string(),
            },
            manager.id(),
            "client-1",
            DEFAULT_REQUEST_TIMEOUT,
        )
        .await;
        assert_eq!(result, Err(Fail::DocumentNotFound("missing".to_string())));
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_listener_times_out() {
        let bus = LocalBus::new();

        let result = wrap_request(
            &bus,
            Request::GetDocument {
                doc_name: "notes".to_string(),
                user_id: "alice".to_string(),
            },
            "collab",
            "client-1",
            Duration::from_secs(1),
        )
        .await;
        assert_eq!(result, Err(Fail::ManagerUnresponsive));
        assert_eq!(bus.subscriber_count("client-1"), 0);
    }

    #[tokio::test]
    async fn test_destroy_is_announced() {
        let bus = LocalBus::new();
        let (manager, _server) = served_manager(&bus);
        let mut listener = bus.subscribe("observer");

        manager.destroy().await;

        let notice = listener.recv().await.unwrap();
        assert_eq!(notice.kind, MessageKind::Broadcast);
        assert_eq!(notice.body, Body::Notice(NOTICE_MANAGER_DESTROYED.to_string()));

        let result = wrap_request(
            &bus,
            Request::GetDocument {
                doc_name: "notes".to_string(),
                user_id: "alice".to_string(),
            },
            "collab",
            "client-1",
            DEFAULT_REQUEST_TIMEOUT,
        )
        .await;
        assert_eq!(result, Err(Fail::ManagerDestroyed));
    }
}
