//! Wire protocol shared by the authority, the transports and the client.
//!
//! Requests and responses are carried inside bus [`Message`]s. A message can
//! be framed for binary WebSocket frames (bincode payload behind a 5-byte
//! header) or sent as JSON text. Failures cross the wire as an [`ErrorCode`]
//! plus message and are turned back into [`Fail`] on the receiving side.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use std::io::Cursor;

use super::{ClientId, DocName, Fail, UserId};

/// Protocol version for compatibility checking
pub const PROTOCOL_VERSION: u8 = 1;

/// Maximum message size (16MB)
pub const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

const HEADER_LEN: usize = 5;

/// Protocol errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum ProtocolError {
    #[error("Unknown message kind: 0x{0:02X}")]
    UnknownMessageKind(u8),

    #[error("Invalid message format: {0}")]
    InvalidFormat(String),

    #[error("Message too large: {0} bytes (max: {1})")]
    MessageTooLarge(usize, usize),

    #[error("Version mismatch: expected {0}, got {1}")]
    VersionMismatch(u8, u8),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl From<bincode::Error> for ProtocolError {
    fn from(err: bincode::Error) -> Self {
        ProtocolError::Serialization(err.to_string())
    }
}

impl From<serde_json::Error> for ProtocolError {
    fn from(err: serde_json::Error) -> Self {
        ProtocolError::Serialization(err.to_string())
    }
}

/// Requests handled by the manager
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Request {
    /// Fetch the full document and the manager id
    GetDocument { doc_name: DocName, user_id: UserId },

    /// Steps accepted since `version`; long-polls when there are none
    PullEvents {
        doc_name: DocName,
        user_id: UserId,
        version: u64,
        manager_id: String,
    },

    /// Submit encoded steps made against `version`
    PushEvents {
        doc_name: DocName,
        user_id: UserId,
        version: u64,
        steps: Vec<String>,
        client_id: ClientId,
        manager_id: String,
    },
}

impl Request {
    pub fn doc_name(&self) -> &str {
        match self {
            Request::GetDocument { doc_name, .. }
            | Request::PullEvents { doc_name, .. }
            | Request::PushEvents { doc_name, .. } => doc_name,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Request::GetDocument { .. } => "get_document",
            Request::PullEvents { .. } => "pull_events",
            Request::PushEvents { .. } => "push_events",
        }
    }
}

/// Successful responses
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Response {
    Document {
        doc: String,
        version: u64,
        users: usize,
        manager_id: String,
    },
    Events {
        version: u64,
        steps: Vec<String>,
        client_ids: Vec<ClientId>,
        users: usize,
    },
    Pushed,
}

/// Error codes carried on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u16)]
pub enum ErrorCode {
    Unknown = 0,
    InvalidVersion = 1,
    OutdatedVersion = 2,
    ApplyFailed = 3,
    HistoryNotAvailable = 4,
    IncorrectManager = 5,
    DocumentNotFound = 6,
    ManagerUnresponsive = 7,
    ManagerDestroyed = 8,
    Storage = 9,
}

/// A failure as it travels on the wire
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireError {
    pub code: ErrorCode,
    pub message: String,
}

impl From<&Fail> for ErrorCode {
    fn from(fail: &Fail) -> Self {
        match fail {
            Fail::InvalidVersion => ErrorCode::InvalidVersion,
            Fail::OutdatedVersion => ErrorCode::OutdatedVersion,
            Fail::ApplyFailed(_) => ErrorCode::ApplyFailed,
            Fail::HistoryNotAvailable => ErrorCode::HistoryNotAvailable,
            Fail::IncorrectManager => ErrorCode::IncorrectManager,
            Fail::DocumentNotFound(_) => ErrorCode::DocumentNotFound,
            Fail::ManagerUnresponsive => ErrorCode::ManagerUnresponsive,
            Fail::ManagerDestroyed => ErrorCode::ManagerDestroyed,
            Fail::Storage(_) => ErrorCode::Storage,
        }
    }
}

impl From<Fail> for WireError {
    fn from(fail: Fail) -> Self {
        let code = ErrorCode::from(&fail);
        let message = match fail {
            Fail::ApplyFailed(detail) | Fail::DocumentNotFound(detail) | Fail::Storage(detail) => {
                detail
            }
            other => other.to_string(),
        };
        WireError { code, message }
    }
}

impl From<WireError> for Fail {
    fn from(err: WireError) -> Self {
        match err.code {
            ErrorCode::InvalidVersion => Fail::InvalidVersion,
            ErrorCode::OutdatedVersion => Fail::OutdatedVersion,
            ErrorCode::ApplyFailed => Fail::ApplyFailed(err.message),
            ErrorCode::HistoryNotAvailable => Fail::HistoryNotAvailable,
            ErrorCode::IncorrectManager => Fail::IncorrectManager,
            ErrorCode::DocumentNotFound => Fail::DocumentNotFound(err.message),
            ErrorCode::ManagerUnresponsive => Fail::ManagerUnresponsive,
            ErrorCode::ManagerDestroyed => Fail::ManagerDestroyed,
            ErrorCode::Storage | ErrorCode::Unknown => Fail::Storage(err.message),
        }
    }
}

/// Bus message kinds
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageKind {
    Ping = 0x01,
    Pong = 0x02,
    Broadcast = 0x03,
}

impl TryFrom<u8> for MessageKind {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, <Self as TryFrom<u8>>::Error> {
        match value {
            0x01 => Ok(MessageKind::Ping),
            0x02 => Ok(MessageKind::Pong),
            0x03 => Ok(MessageKind::Broadcast),
            _ => Err(ProtocolError::UnknownMessageKind(value)),
        }
    }
}

/// Message payloads
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Body {
    Request(Request),
    Reply(Result<Response, WireError>),
    Notice(String),
}

/// A message on the bus. A pong carries the id of its ping and is addressed
/// to the ping's sender.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub from: String,
    pub to: Option<String>,
    pub kind: MessageKind,
    pub body: Body,
}

impl Message {
    pub fn ping(
        id: impl Into<String>,
        from: impl Into<String>,
        to: impl Into<String>,
        request: Request,
    ) -> Self {
        Self {
            id: id.into(),
            from: from.into(),
            to: Some(to.into()),
            kind: MessageKind::Ping,
            body: Body::Request(request),
        }
    }

    /// Reply to `ping`, sent from `from`
    pub fn pong(
        ping: &Message,
        from: impl Into<String>,
        reply: Result<Response, WireError>,
    ) -> Self {
        Self {
            id: ping.id.clone(),
            from: from.into(),
            to: Some(ping.from.clone()),
            kind: MessageKind::Pong,
            body: Body::Reply(reply),
        }
    }

    pub fn broadcast(from: impl Into<String>, notice: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            from: from.into(),
            to: None,
            kind: MessageKind::Broadcast,
            body: Body::Notice(notice.into()),
        }
    }
}

/// Codec for bus messages
pub struct BusCodec;

impl BusCodec {
    /// Encode a message into a binary frame
    pub fn encode(msg: &Message) -> Result<Bytes, ProtocolError> {
        let payload = bincode::serialize(msg)?;

        if payload.len() + HEADER_LEN > MAX_MESSAGE_SIZE {
            return Err(ProtocolError::MessageTooLarge(
                payload.len() + HEADER_LEN,
                MAX_MESSAGE_SIZE,
            ));
        }

        let mut buf = BytesMut::with_capacity(HEADER_LEN + payload.len());
        buf.put_u8(PROTOCOL_VERSION);
        buf.put_u8(msg.kind as u8);
        buf.put_u24(payload.len() as u32);
        buf.put_slice(&payload);

        Ok(buf.freeze())
    }

    /// Decode a binary frame
    pub fn decode(data: &[u8]) -> Result<Message, ProtocolError> {
        if data.len() < HEADER_LEN {
            return Err(ProtocolError::InvalidFormat(
                "Message too short".to_string(),
            ));
        }

        let mut cursor = Cursor::new(data);

        let version = cursor.get_u8();
        if version != PROTOCOL_VERSION {
            return Err(ProtocolError::VersionMismatch(PROTOCOL_VERSION, version));
        }

        let kind = MessageKind::try_from(cursor.get_u8())?;
        let payload_len = cursor.get_uint(3) as usize;

        if data.len() < HEADER_LEN + payload_len {
            return Err(ProtocolError::InvalidFormat(format!(
                "Expected {} bytes, got {}",
                HEADER_LEN + payload_len,
                data.len()
            )));
        }

        let payload = &data[HEADER_LEN..HEADER_LEN + payload_len];
        let msg: Message = bincode::deserialize(payload)?;

        if msg.kind != kind {
            return Err(ProtocolError::InvalidFormat(format!(
                "Header kind {:?} does not match payload kind {:?}",
                kind, msg.kind
            )));
        }

        Ok(msg)
    }

    pub fn encode_json(msg: &Message) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(msg)?)
    }

    pub fn decode_json(text: &str) -> Result<Message, ProtocolError> {
        Ok(serde_json::from_str(text)?)
    }
}

/// Extension trait for writing u24 values
trait BufMutExt {
    fn put_u24(&mut self, n: u32);
}

impl BufMutExt for BytesMut {
    fn put_u24(&mut self, n: u32) {
        self.put_u8((n >> 16) as u8);
        self.put_u8((n >> 8) as u8);
        self.put_u8(n as u8);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn push_request() -> Request {
        Request::PushEvents {
            doc_name: "notes".to_string(),
            user_id: "u1".to_string(),
            version: 4,
            steps: vec![r#"{"from":0,"to":0,"text":"X"}"#.to_string()],
            client_id: "c1".to_string(),
            manager_id: "m1".to_string(),
        }
    }

    #[test]
    fn test_binary_frame_carries_ping() {
        let msg = Message::ping("req-1", "client-a", "collab", push_request());

        let encoded = BusCodec::encode(&msg).unwrap();
        assert_eq!(encoded[0], PROTOCOL_VERSION);
        assert_eq!(encoded[1], MessageKind::Ping as u8);

        let decoded = BusCodec::decode(&encoded).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn test_pong_is_addressed_to_ping_sender() {
        let ping = Message::ping("req-7", "client-a", "collab", push_request());
        let pong = Message::pong(&ping, "manager-1", Ok(Response::Pushed));

        assert_eq!(pong.id, "req-7");
        assert_eq!(pong.to.as_deref(), Some("client-a"));
        assert_eq!(pong.kind, MessageKind::Pong);
    }

    #[test]
    fn test_json_frame_with_failure() {
        let ping = Message::ping("req-2", "client-a", "collab", push_request());
        let pong = Message::pong(&ping, "m1", Err(WireError::from(Fail::OutdatedVersion)));

        let text = BusCodec::encode_json(&pong).unwrap();
        let decoded = BusCodec::decode_json(&text).unwrap();
        match decoded.body {
            Body::Reply(Err(err)) => {
                assert_eq!(err.code, ErrorCode::OutdatedVersion);
                assert_eq!(Fail::from(err), Fail::OutdatedVersion);
            }
            other => panic!("Unexpected body: {:?}", other),
        }
    }

    #[test]
    fn test_fail_survives_the_wire() {
        for fail in [
            Fail::InvalidVersion,
            Fail::HistoryNotAvailable,
            Fail::IncorrectManager,
            Fail::ApplyFailed("bad step".to_string()),
            Fail::DocumentNotFound("notes".to_string()),
            Fail::ManagerDestroyed,
        ] {
            assert_eq!(Fail::from(WireError::from(fail.clone())), fail);
        }
    }

    #[test]
    fn test_version_mismatch() {
        let msg = Message::broadcast("m1", "shutting down");
        let mut bytes = BusCodec::encode(&msg).unwrap().to_vec();
        bytes[0] = 0xFF;

        let result = BusCodec::decode(&bytes);
        assert!(matches!(result, Err(ProtocolError::VersionMismatch(_, _))));
    }

    #[test]
    fn test_truncated_frame() {
        let msg = Message::broadcast("m1", "hello");
        let bytes = BusCodec::encode(&msg).unwrap();
        let result = BusCodec::decode(&bytes[..bytes.len() - 1]);
        assert!(matches!(result, Err(ProtocolError::InvalidFormat(_))));
        assert!(matches!(
            BusCodec::decode(&[1, 2]),
            Err(ProtocolError::InvalidFormat(_))
        ));
    }

    #[test]
    fn test_message_kind_conversion() {
        assert_eq!(MessageKind::try_from(0x01).unwrap(), MessageKind::Ping);
        assert_eq!(MessageKind::try_from(0x03).unwrap(), MessageKind::Broadcast);
        assert!(MessageKind::try_from(0xFF).is_err());
    }
}
