//! Socket.IO v5 framing over Engine.IO v4, text frames only.
//!
//! Every WebSocket text frame is one Engine.IO packet: a single type digit
//! followed by its payload. Engine.IO `message` packets carry one Socket.IO
//! packet:
//!
//! ```text
//! <type>[<attachments>-][<namespace>,][<ack id>][<json>]
//! 40/customerscreen,{"branchId":"12","key":"..."}
//! 42/customerscreen,["newOrder",{"id":1,...}]
//! ```
//!
//! Binary attachments are not used by the order channel and are rejected.

use serde::Deserialize;
use serde_json::Value;

use crate::error::{Result, ScreenError};

/// Namespace the order board subscribes to.
pub const NAMESPACE: &str = "/customerscreen";

/// Event carrying one order payload.
pub const NEW_ORDER_EVENT: &str = "newOrder";

// ---------------------------------------------------------------------------
// Engine.IO
// ---------------------------------------------------------------------------

/// Payload of the Engine.IO `open` packet.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OpenHandshake {
    pub sid: String,
    #[serde(default)]
    pub upgrades: Vec<String>,
    /// Milliseconds between server pings.
    pub ping_interval: u64,
    /// Milliseconds the server waits for a pong.
    pub ping_timeout: u64,
    #[serde(default)]
    pub max_payload: Option<u64>,
}

impl OpenHandshake {
    /// How long the link may stay silent before it is considered dead.
    pub fn heartbeat_window(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.ping_interval + self.ping_timeout)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnginePacket {
    Open(OpenHandshake),
    Close,
    Ping(String),
    Pong(String),
    Message(String),
    Upgrade,
    Noop,
}

impl EnginePacket {
    pub fn decode(frame: &str) -> Result<Self> {
        let mut chars = frame.chars();
        let kind = chars
            .next()
            .ok_or_else(|| ScreenError::Protocol("empty engine.io frame".into()))?;
        let body = chars.as_str();

        Ok(match kind {
            '0' => EnginePacket::Open(serde_json::from_str(body)?),
            '1' => EnginePacket::Close,
            '2' => EnginePacket::Ping(body.to_string()),
            '3' => EnginePacket::Pong(body.to_string()),
            '4' => EnginePacket::Message(body.to_string()),
            '5' => EnginePacket::Upgrade,
            '6' => EnginePacket::Noop,
            other => {
                return Err(ScreenError::Protocol(format!(
                    "unknown engine.io packet type '{other}'"
                )))
            }
        })
    }

    /// Encode a client-side packet. `Open` is server-only and encodes as a
    /// bare type digit.
    pub fn encode(&self) -> String {
        match self {
            EnginePacket::Open(_) => "0".to_string(),
            EnginePacket::Close => "1".to_string(),
            EnginePacket::Ping(data) => format!("2{data}"),
            EnginePacket::Pong(data) => format!("3{data}"),
            EnginePacket::Message(data) => format!("4{data}"),
            EnginePacket::Upgrade => "5".to_string(),
            EnginePacket::Noop => "6".to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// Socket.IO
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketPacketKind {
    Connect,
    Disconnect,
    Event,
    Ack,
    ConnectError,
    BinaryEvent,
    BinaryAck,
}

impl SocketPacketKind {
    fn from_digit(c: char) -> Option<Self> {
        Some(match c {
            '0' => SocketPacketKind::Connect,
            '1' => SocketPacketKind::Disconnect,
            '2' => SocketPacketKind::Event,
            '3' => SocketPacketKind::Ack,
            '4' => SocketPacketKind::ConnectError,
            '5' => SocketPacketKind::BinaryEvent,
            '6' => SocketPacketKind::BinaryAck,
            _ => return None,
        })
    }

    fn digit(self) -> char {
        match self {
            SocketPacketKind::Connect => '0',
            SocketPacketKind::Disconnect => '1',
            SocketPacketKind::Event => '2',
            SocketPacketKind::Ack => '3',
            SocketPacketKind::ConnectError => '4',
            SocketPacketKind::BinaryEvent => '5',
            SocketPacketKind::BinaryAck => '6',
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SocketPacket {
    pub kind: SocketPacketKind,
    pub namespace: String,
    pub ack_id: Option<u64>,
    pub data: Option<Value>,
}

impl SocketPacket {
    /// Namespace CONNECT carrying the connection-time credentials.
    pub fn connect(namespace: &str, auth: Option<Value>) -> Self {
        Self {
            kind: SocketPacketKind::Connect,
            namespace: namespace.to_string(),
            ack_id: None,
            data: auth,
        }
    }

    pub fn disconnect(namespace: &str) -> Self {
        Self {
            kind: SocketPacketKind::Disconnect,
            namespace: namespace.to_string(),
            ack_id: None,
            data: None,
        }
    }

    pub fn encode(&self) -> String {
        let mut out = String::new();
        out.push(self.kind.digit());
        if self.namespace != "/" && !self.namespace.is_empty() {
            out.push_str(&self.namespace);
            out.push(',');
        }
        if let Some(id) = self.ack_id {
            out.push_str(&id.to_string());
        }
        if let Some(data) = &self.data {
            out.push_str(&data.to_string());
        }
        out
    }

    pub fn decode(raw: &str) -> Result<Self> {
        let mut chars = raw.chars();
        let kind = chars
            .next()
            .and_then(SocketPacketKind::from_digit)
            .ok_or_else(|| ScreenError::Protocol(format!("bad socket.io packet: {raw:.40}")))?;
        let mut rest = chars.as_str();

        if matches!(
            kind,
            SocketPacketKind::BinaryEvent | SocketPacketKind::BinaryAck
        ) {
            return Err(ScreenError::Protocol(
                "binary socket.io packets are not supported".into(),
            ));
        }

        let namespace = if rest.starts_with('/') {
            match rest.find(',') {
                Some(end) => {
                    let ns = &rest[..end];
                    rest = &rest[end + 1..];
                    ns.to_string()
                }
                None => {
                    let ns = rest.to_string();
                    rest = "";
                    ns
                }
            }
        } else {
            "/".to_string()
        };

        let digits = rest.bytes().take_while(u8::is_ascii_digit).count();
        let ack_id = if digits > 0 {
            let id = rest[..digits]
                .parse::<u64>()
                .map_err(|e| ScreenError::Protocol(format!("bad ack id: {e}")))?;
            rest = &rest[digits..];
            Some(id)
        } else {
            None
        };

        let data = if rest.trim().is_empty() {
            None
        } else {
            Some(serde_json::from_str(rest)?)
        };

        Ok(Self {
            kind,
            namespace,
            ack_id,
            data,
        })
    }

    /// Event name and arguments, for `Event` packets shaped `["name", ...]`.
    pub fn event(&self) -> Option<(&str, &[Value])> {
        if self.kind != SocketPacketKind::Event {
            return None;
        }
        let items = self.data.as_ref()?.as_array()?;
        let (name, args) = items.split_first()?;
        Some((name.as_str()?, args))
    }

    /// Server-supplied reason on a `ConnectError` packet.
    pub fn error_message(&self) -> String {
        match &self.data {
            Some(Value::Object(obj)) => obj
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("connection refused")
                .to_string(),
            Some(Value::String(s)) => s.clone(),
            _ => "connection refused".to_string(),
        }
    }
}

/// Wrap a Socket.IO packet in an Engine.IO message frame.
pub fn message_frame(packet: &SocketPacket) -> String {
    EnginePacket::Message(packet.encode()).encode()
}
