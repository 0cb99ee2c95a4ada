//! WebSocket transport for clients of the server's `/bus` bridge.
//!
//! The socket is bound to one bus address, given when connecting. Incoming
//! frames are dispatched to local subscriptions through an in-process bus.

use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tracing::{debug, info, warn};

use super::{LocalBus, Subscription, Transport, TransportError};
use crate::sync::protocol::{BusCodec, Message};
use crate::sync::timer::TaskHandle;

/// Client side of the `/bus` WebSocket bridge
pub struct WsTransport {
    address: String,
    inbound: LocalBus,
    outgoing: mpsc::UnboundedSender<Message>,
    _io: TaskHandle,
}

impl WsTransport {
    /// Connect to `url` (e.g. `ws://localhost:8080/bus`) as `address`.
    pub async fn connect(url: &str, address: &str) -> Result<Self, TransportError> {
        let url = format!("{}?address={}", url, address);
        let (stream, response) = connect_async(url.as_str())
            .await
            .map_err(|e| TransportError::WebSocket(e.to_string()))?;
        info!("Connected to {} ({})", url, response.status());

        let (mut write, mut read) = stream.split();
        let (outgoing, mut rx) = mpsc::unbounded_channel::<Message>();
        let inbound = LocalBus::new();
        let dispatch = inbound.clone();

        let io = TaskHandle::spawn(async move {
            loop {
                tokio::select! {
                    Some(message) = rx.recv() => {
                        let frame = match BusCodec::encode(&message) {
                            Ok(bytes) => WsMessage::Binary(bytes.to_vec()),
                            Err(e) => {
                                warn!("Dropping outgoing message {}: {}", message.id, e);
                                continue;
                            }
                        };
                        if write.send(frame).await.is_err() {
                            break;
                        }
                    }
                    frame = read.next() => {
                        let decoded = match frame {
                            Some(Ok(WsMessage::Binary(data))) => BusCodec::decode(&data),
                            Some(Ok(WsMessage::Text(text))) => BusCodec::decode_json(&text),
                            Some(Ok(WsMessage::Close(_))) | Some(Err(_)) | None => break,
                            Some(Ok(_)) => continue,
                        };
                        match decoded {
                            Ok(message) => {
                                let _ = dispatch.transmit(message);
                            }
                            Err(e) => warn!("Invalid frame from server: {}", e),
                        }
                    }
                }
            }
            debug!("WebSocket transport closed");
        });

        Ok(Self {
            address: address.to_string(),
            inbound,
            outgoing,
            _io: io,
        })
    }

    /// Address this socket receives messages for
    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn is_closed(&self) -> bool {
        self.outgoing.is_closed()
    }
}

impl Transport for WsTransport {
    fn transmit(&self, message: Message) -> Result<(), TransportError> {
        self.outgoing
            .send(message)
            .map_err(|_| TransportError::Closed)
    }

    fn subscribe(&self, address: &str) -> Subscription {
        if address != self.address {
            warn!(
                "Subscribing to {} on a socket bound to {}; nothing will arrive",
                address, self.address
            );
        }
        self.inbound.subscribe(address)
    }
}
