//! Request and response bodies.

use std::fmt;
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use protocol::error::{ProtocolError, Result};
use protocol::messages::Signal;
use tokio::sync::mpsc;

use crate::frame::FrameDuplex;

enum BodyKind {
    Empty,
    Full(Option<Bytes>),
    Channel(mpsc::Receiver<Bytes>),
    /// Frames read from a connection. Request bodies end at the
    /// `REQUEST_END` marker, response bodies at end-of-stream.
    Frames {
        frames: Arc<FrameDuplex>,
        until_request_end: bool,
        done: bool,
    },
}

/// A body pulled chunk by chunk.
pub struct Body {
    kind: BodyKind,
}

impl fmt::Debug for Body {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match &self.kind {
            BodyKind::Empty => "empty",
            BodyKind::Full(_) => "full",
            BodyKind::Channel(_) => "channel",
            BodyKind::Frames { .. } => "frames",
        };
        f.debug_struct("Body").field("kind", &kind).finish()
    }
}

impl Default for Body {
    fn default() -> Self {
        Self::empty()
    }
}

impl Body {
    pub fn empty() -> Self {
        Self {
            kind: BodyKind::Empty,
        }
    }

    /// A body fed by the returned sender; it ends when the sender is dropped.
    pub fn channel(buffer: usize) -> (mpsc::Sender<Bytes>, Self) {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        (
            tx,
            Self {
                kind: BodyKind::Channel(rx),
            },
        )
    }

    pub(crate) fn request_frames(frames: Arc<FrameDuplex>) -> Self {
        Self {
            kind: BodyKind::Frames {
                frames,
                until_request_end: true,
                done: false,
            },
        }
    }

    pub(crate) fn response_frames(frames: Arc<FrameDuplex>) -> Self {
        Self {
            kind: BodyKind::Frames {
                frames,
                until_request_end: false,
                done: false,
            },
        }
    }

    /// Pulls the next chunk, `None` at the end of the body.
    pub async fn next_chunk(&mut self) -> Result<Option<Bytes>> {
        match &mut self.kind {
            BodyKind::Empty => Ok(None),
            BodyKind::Full(bytes) => Ok(bytes.take()),
            BodyKind::Channel(rx) => Ok(rx.recv().await),
            BodyKind::Frames {
                frames,
                until_request_end,
                done,
            } => {
                if *done {
                    return Ok(None);
                }
                match frames.read().await {
                    Ok(Some(frame)) => {
                        if *until_request_end && Signal::from_frame(&frame) == Some(Signal::RequestEnd) {
                            *done = true;
                            return Ok(None);
                        }
                        Ok(Some(frame))
                    }
                    Ok(None) => {
                        *done = true;
                        if *until_request_end {
                            return Err(ProtocolError::ConnectionClosed(
                                "stream ended before request body end".to_string(),
                            ));
                        }
                        Ok(None)
                    }
                    Err(e) => {
                        *done = true;
                        Err(e)
                    }
                }
            }
        }
    }

    /// Collects the whole body.
    pub async fn bytes(&mut self) -> Result<Bytes> {
        if let BodyKind::Full(bytes) = &mut self.kind {
            return Ok(bytes.take().unwrap_or_default());
        }
        let mut out = BytesMut::new();
        while let Some(chunk) = self.next_chunk().await? {
            out.extend_from_slice(&chunk);
        }
        Ok(out.freeze())
    }

    /// Collects the whole body as UTF-8 text.
    pub async fn text(&mut self) -> Result<String> {
        let bytes = self.bytes().await?;
        String::from_utf8(bytes.to_vec())
            .map_err(|e| ProtocolError::Deserialization(format!("body is not valid UTF-8: {}", e)))
    }
}

impl From<Bytes> for Body {
    fn from(bytes: Bytes) -> Self {
        Self {
            kind: BodyKind::Full(Some(bytes)),
        }
    }
}

impl From<Vec<u8>> for Body {
    fn from(bytes: Vec<u8>) -> Self {
        Bytes::from(bytes).into()
    }
}

impl From<String> for Body {
    fn from(text: String) -> Self {
        Bytes::from(text).into()
    }
}

impl From<&'static str> for Body {
    fn from(text: &'static str) -> Self {
        Bytes::from_static(text.as_bytes()).into()
    }
}
