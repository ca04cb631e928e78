//! Message definitions carried inside frames and over the hub.
//!
//! - [`Address`]: virtual `hostname:port` identity of a socket end
//! - [`HubMessage`]: signaling envelope routed by the hub
//! - [`SignalPayload`]: transport negotiation messages (offer/answer/reject)
//! - [`RequestHead`] / [`ResponseHead`]: JSON header frames of HTTP-over-frames
//! - [`Signal`]: fixed marker frames separating HTTP phases
//! - [`WebSocketFrame`]: tag-prefixed frames after an upgrade

use std::collections::BTreeMap;
use std::fmt;

use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

use crate::error::{ProtocolError, Result};

/// Virtual network identity. The hostname is a hub address, not an IP.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Address {
    pub hostname: String,
    pub port: u16,
}

impl Address {
    pub fn new(hostname: impl Into<String>, port: u16) -> Self {
        Self {
            hostname: hostname.into(),
            port,
        }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.hostname, self.port)
    }
}

// ---------------------------------------------------------------------------
// Hub signaling
// ---------------------------------------------------------------------------

/// Envelope routed by a hub to the endpoint named in `to`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HubMessage<T = serde_json::Value> {
    pub to: String,
    pub from: String,
    pub data: T,
}

impl HubMessage {
    /// Serialize to the JSON text carried by hub transports.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    /// Parse a hub message from JSON text.
    pub fn from_json(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }
}

/// Transport negotiation messages exchanged through the hub.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum SignalPayload {
    /// Request to open a channel to `port` on the receiving peer.
    Offer {
        connection: String,
        port: u16,
        #[serde(rename = "fromPort")]
        from_port: u16,
        #[serde(skip_serializing_if = "Option::is_none", default)]
        sdp: Option<String>,
    },
    /// The receiving peer accepted the offer.
    Answer {
        connection: String,
        #[serde(skip_serializing_if = "Option::is_none", default)]
        sdp: Option<String>,
    },
    /// The receiving peer refused the offer.
    Reject { connection: String, reason: String },
}

impl SignalPayload {
    /// Connection id the payload belongs to.
    pub fn connection(&self) -> &str {
        match self {
            SignalPayload::Offer { connection, .. }
            | SignalPayload::Answer { connection, .. }
            | SignalPayload::Reject { connection, .. } => connection,
        }
    }
}

// ---------------------------------------------------------------------------
// HTTP over frames
// ---------------------------------------------------------------------------

/// Header frame sent by the client: `{url, method, headers}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestHead {
    pub url: String,
    pub method: String,
    pub headers: BTreeMap<String, String>,
}

impl RequestHead {
    /// Decode a request header frame. Missing or mistyped fields are a
    /// protocol violation.
    pub fn from_frame(frame: &[u8]) -> Result<Self> {
        serde_json::from_slice(frame).map_err(|e| ProtocolError::MalformedHeader(e.to_string()))
    }

    /// Encode as a JSON header frame.
    pub fn to_frame(&self) -> Result<Bytes> {
        serde_json::to_vec(self)
            .map(Bytes::from)
            .map_err(|e| ProtocolError::Serialization(e.to_string()))
    }
}

/// Header frame sent by the server after the response signal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseHead {
    pub status: u16,
    #[serde(rename = "statusText")]
    pub status_text: String,
    pub headers: BTreeMap<String, String>,
}

impl ResponseHead {
    pub fn from_frame(frame: &[u8]) -> Result<Self> {
        serde_json::from_slice(frame).map_err(|e| ProtocolError::MalformedHeader(e.to_string()))
    }

    pub fn to_frame(&self) -> Result<Bytes> {
        serde_json::to_vec(self)
            .map(Bytes::from)
            .map_err(|e| ProtocolError::Serialization(e.to_string()))
    }
}

/// Marker frames of the HTTP-over-frames protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    /// Server -> client: a normal response follows.
    Response,
    /// Server -> client: the stream was upgraded to a WebSocket.
    Socket,
    /// Client -> server: end of the request body.
    RequestEnd,
}

impl Signal {
    pub const RESPONSE: &'static [u8] = b"---RESPONSE---";
    pub const SOCKET: &'static [u8] = b"---SOCKET---";
    pub const REQUEST_END: &'static [u8] = b"---REQUEST_END---";

    /// Wire bytes of this marker.
    pub fn as_bytes(self) -> &'static [u8] {
        match self {
            Signal::Response => Self::RESPONSE,
            Signal::Socket => Self::SOCKET,
            Signal::RequestEnd => Self::REQUEST_END,
        }
    }

    /// Recognise a frame that is exactly one of the markers.
    pub fn from_frame(frame: &[u8]) -> Option<Self> {
        match frame {
            f if f == Self::RESPONSE => Some(Signal::Response),
            f if f == Self::SOCKET => Some(Signal::Socket),
            f if f == Self::REQUEST_END => Some(Signal::RequestEnd),
            _ => None,
        }
    }

    pub fn to_frame(self) -> Bytes {
        Bytes::from_static(self.as_bytes())
    }
}

// ---------------------------------------------------------------------------
// WebSocket sub-protocol
// ---------------------------------------------------------------------------

/// Message type tag stored in the first byte of an upgraded frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum WebSocketOpcode {
    Text = 0,
    Binary = 1,
    Ping = 2,
    Pong = 3,
}

impl TryFrom<u8> for WebSocketOpcode {
    type Error = ProtocolError;

    fn try_from(tag: u8) -> Result<Self> {
        match tag {
            0 => Ok(WebSocketOpcode::Text),
            1 => Ok(WebSocketOpcode::Binary),
            2 => Ok(WebSocketOpcode::Ping),
            3 => Ok(WebSocketOpcode::Pong),
            other => Err(ProtocolError::InvalidWebSocketFrame(format!(
                "unknown websocket message tag {}",
                other
            ))),
        }
    }
}

/// One WebSocket message: tag byte followed by the payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WebSocketFrame {
    pub opcode: WebSocketOpcode,
    pub payload: Bytes,
}

impl WebSocketFrame {
    pub fn new(opcode: WebSocketOpcode, payload: impl Into<Bytes>) -> Self {
        Self {
            opcode,
            payload: payload.into(),
        }
    }

    pub fn encode(&self) -> Bytes {
        let mut out = BytesMut::with_capacity(1 + self.payload.len());
        out.put_u8(self.opcode as u8);
        out.put_slice(&self.payload);
        out.freeze()
    }

    pub fn decode(frame: &Bytes) -> Result<Self> {
        let Some(&tag) = frame.first() else {
            return Err(ProtocolError::InvalidWebSocketFrame(
                "empty websocket frame".to_string(),
            ));
        };
        Ok(Self {
            opcode: WebSocketOpcode::try_from(tag)?,
            payload: frame.slice(1..),
        })
    }
}
