//! In-process message bus.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::mpsc;

use super::{Subscription, Transport, TransportError};
use crate::sync::protocol::Message;

type Route = (u64, mpsc::UnboundedSender<Message>);

#[derive(Default)]
struct Routes {
    by_address: DashMap<String, Vec<Route>>,
    next_id: AtomicU64,
}

/// Delivers messages between tasks of one process.
///
/// Cloning is cheap; clones share the same routes.
#[derive(Clone, Default)]
pub struct LocalBus {
    routes: Arc<Routes>,
}

impl LocalBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live subscriptions for `address`
    pub fn subscriber_count(&self, address: &str) -> usize {
        self.routes
            .by_address
            .get(address)
            .map(|routes| routes.len())
            .unwrap_or(0)
    }
}

impl Transport for LocalBus {
    fn transmit(&self, message: Message) -> Result<(), TransportError> {
        match &message.to {
            Some(address) => {
                if let Some(routes) = self.routes.by_address.get(address) {
                    for (_, tx) in routes.iter() {
                        let _ = tx.send(message.clone());
                    }
                }
            }
            None => {
                for routes in self.routes.by_address.iter() {
                    for (_, tx) in routes.value().iter() {
                        let _ = tx.send(message.clone());
                    }
                }
            }
        }
        Ok(())
    }

    fn subscribe(&self, address: &str) -> Subscription {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.routes.next_id.fetch_add(1, Ordering::Relaxed);
        self.routes
            .by_address
            .entry(address.to_string())
            .or_default()
            .push((id, tx));

        let routes = Arc::downgrade(&self.routes);
        let address = address.to_string();
        Subscription::new(rx, move || {
            let Some(routes) = routes.upgrade() else {
                return;
            };
            if let Some(mut entry) = routes.by_address.get_mut(&address) {
                entry.retain(|(route_id, _)| *route_id != id);
            }
            routes.by_address.remove_if(&address, |_, entry| entry.is_empty());
        })
    }
}
