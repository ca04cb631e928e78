//! WebSocket sub-protocol over an upgraded HTTP stream.
//!
//! Each frame starts with a one-byte tag (0 text, 1 binary, 2 ping, 3 pong)
//! followed by the payload. Pings are surfaced as events and never answered
//! automatically.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use protocol::error::{ProtocolError, Result};
use protocol::messages::{Address, WebSocketFrame, WebSocketOpcode};

use crate::frame::FrameDuplex;

/// A data message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Text(String),
    Binary(Bytes),
}

/// What `recv` yields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WebSocketEvent {
    Message(Message),
    Ping(Bytes),
    Pong(Bytes),
    /// The peer closed the stream.
    Close,
}

struct Inner {
    frames: Arc<FrameDuplex>,
    local: Address,
    remote: Address,
    closed: AtomicBool,
    close_seen: AtomicBool,
}

/// One end of an upgraded connection. Clones share the connection.
#[derive(Clone)]
pub struct WebSocket {
    inner: Arc<Inner>,
}

impl fmt::Debug for WebSocket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WebSocket")
            .field("local", &self.inner.local)
            .field("remote", &self.inner.remote)
            .finish()
    }
}

impl WebSocket {
    pub(crate) fn new(frames: Arc<FrameDuplex>, local: Address, remote: Address) -> Self {
        Self {
            inner: Arc::new(Inner {
                frames,
                local,
                remote,
                closed: AtomicBool::new(false),
                close_seen: AtomicBool::new(false),
            }),
        }
    }

    pub fn local(&self) -> &Address {
        &self.inner.local
    }

    pub fn remote(&self) -> &Address {
        &self.inner.remote
    }

    async fn send_frame(&self, opcode: WebSocketOpcode, payload: Bytes) -> Result<()> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(ProtocolError::SocketClosed(format!(
                "websocket {} -> {}",
                self.inner.local, self.inner.remote
            )));
        }
        self.inner
            .frames
            .write(WebSocketFrame::new(opcode, payload).encode())
            .await
    }

    pub async fn send(&self, message: Message) -> Result<()> {
        match message {
            Message::Text(text) => self.send_text(&text).await,
            Message::Binary(data) => self.send_binary(data).await,
        }
    }

    pub async fn send_text(&self, text: &str) -> Result<()> {
        self.send_frame(WebSocketOpcode::Text, Bytes::copy_from_slice(text.as_bytes()))
            .await
    }

    pub async fn send_binary(&self, data: impl Into<Bytes>) -> Result<()> {
        self.send_frame(WebSocketOpcode::Binary, data.into()).await
    }

    pub async fn ping(&self, payload: impl Into<Bytes>) -> Result<()> {
        self.send_frame(WebSocketOpcode::Ping, payload.into()).await
    }

    pub async fn pong(&self, payload: impl Into<Bytes>) -> Result<()> {
        self.send_frame(WebSocketOpcode::Pong, payload.into()).await
    }

    /// Next event. Yields [`WebSocketEvent::Close`] once when the stream
    /// ends, then `None`. A malformed frame closes the stream and is
    /// returned as an error.
    pub async fn recv(&self) -> Result<Option<WebSocketEvent>> {
        let frame = match self.inner.frames.read().await {
            Ok(Some(frame)) => frame,
            Ok(None) => {
                self.inner.closed.store(true, Ordering::SeqCst);
                if self.inner.close_seen.swap(true, Ordering::SeqCst) {
                    return Ok(None);
                }
                return Ok(Some(WebSocketEvent::Close));
            }
            Err(e) => {
                self.inner.closed.store(true, Ordering::SeqCst);
                return Err(e);
            }
        };

        match decode_event(&frame) {
            Ok(event) => Ok(Some(event)),
            Err(e) => {
                tracing::warn!(remote = %self.inner.remote, error = %e, "invalid websocket frame, closing");
                self.close().await?;
                Err(e)
            }
        }
    }

    /// Closes the stream. Idempotent.
    pub async fn close(&self) -> Result<()> {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.inner.frames.close().await
    }
}

fn decode_event(frame: &Bytes) -> Result<WebSocketEvent> {
    let WebSocketFrame { opcode, payload } = WebSocketFrame::decode(frame)?;
    Ok(match opcode {
        WebSocketOpcode::Text => {
            let text = String::from_utf8(payload.to_vec()).map_err(|e| {
                ProtocolError::Deserialization(format!("websocket text is not valid UTF-8: {}", e))
            })?;
            WebSocketEvent::Message(Message::Text(text))
        }
        WebSocketOpcode::Binary => WebSocketEvent::Message(Message::Binary(payload)),
        WebSocketOpcode::Ping => WebSocketEvent::Ping(payload),
        WebSocketOpcode::Pong => WebSocketEvent::Pong(payload),
    })
}
