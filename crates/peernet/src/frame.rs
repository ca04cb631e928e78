//! Reliable, ordered frame stream over a [`Duplex`] channel.
//!
//! [`FrameWriter`] turns each `write` into one ordinal-stamped frame and
//! [`FrameReader`] reassembles frames from arbitrarily split chunks, checking
//! that ordinals arrive in sequence. A gap or duplicate closes the channel:
//! the stream is dead after a protocol violation.

use std::sync::{Arc, Mutex as StdMutex, MutexGuard as StdMutexGuard, PoisonError};

use bytes::Bytes;
use futures_util::stream::{self, Stream};
use protocol::error::{ProtocolError, Result};
use protocol::framing::{FrameDecoder, FrameEncoder};

use crate::io::Duplex;
use crate::sync::Mutex;

/// Writes frames to a channel, one whole frame per call.
pub struct FrameWriter {
    channel: Arc<dyn Duplex>,
    lock: Mutex,
    encoder: StdMutex<FrameEncoder>,
}

impl FrameWriter {
    pub fn new(channel: Arc<dyn Duplex>) -> Self {
        Self {
            channel,
            lock: Mutex::new(),
            encoder: StdMutex::new(FrameEncoder::new()),
        }
    }

    fn encoder(&self) -> StdMutexGuard<'_, FrameEncoder> {
        self.encoder.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Ordinal the next frame will carry.
    pub fn ordinal(&self) -> u32 {
        self.encoder().ordinal()
    }

    /// Writes `payload` as a single frame. Concurrent calls never interleave.
    pub async fn write(&self, payload: impl AsRef<[u8]>) -> Result<()> {
        let _guard = self.lock.lock().await;
        let frame = self.encoder().encode(payload.as_ref())?;
        self.channel.write(frame).await?;
        self.encoder().advance();
        Ok(())
    }

    /// Closes the underlying channel once in-flight writes are done.
    pub async fn close(&self) -> Result<()> {
        let _guard = self.lock.lock().await;
        self.channel.close().await
    }
}

struct ReaderState {
    decoder: FrameDecoder,
    finished: bool,
}

/// Reads frames from a channel.
pub struct FrameReader {
    channel: Arc<dyn Duplex>,
    lock: Mutex,
    state: StdMutex<ReaderState>,
}

impl FrameReader {
    pub fn new(channel: Arc<dyn Duplex>) -> Self {
        Self {
            channel,
            lock: Mutex::new(),
            state: StdMutex::new(ReaderState {
                decoder: FrameDecoder::new(),
                finished: false,
            }),
        }
    }

    fn state(&self) -> StdMutexGuard<'_, ReaderState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Reads the next frame payload.
    ///
    /// Returns `Ok(None)` once the channel reached end-of-stream, and on
    /// every call after that. A protocol violation closes the channel and is
    /// returned once; the reader is finished afterwards.
    pub async fn read(&self) -> Result<Option<Bytes>> {
        let _guard = self.lock.lock().await;

        loop {
            let next = {
                let mut state = self.state();
                if state.finished {
                    return Ok(None);
                }
                state.decoder.next_frame()
            };

            match next {
                Ok(Some(frame)) => return Ok(Some(frame)),
                Ok(None) => {}
                Err(e) => {
                    self.state().finished = true;
                    tracing::warn!(error = %e, "frame protocol violation, closing channel");
                    if let Err(close_err) = self.channel.close().await {
                        tracing::debug!(error = %close_err, "failed to close channel");
                    }
                    return Err(e);
                }
            }

            let chunk = match self.channel.read().await {
                Ok(chunk) => chunk,
                Err(e) => {
                    self.state().finished = true;
                    return Err(e);
                }
            };

            let mut state = self.state();
            match chunk {
                Some(chunk) => state.decoder.push(&chunk),
                None => {
                    state.finished = true;
                    let partial = state.decoder.buffered();
                    if partial > 0 {
                        return Err(ProtocolError::ConnectionClosed(format!(
                            "channel closed mid-frame with {} bytes buffered",
                            partial
                        )));
                    }
                    return Ok(None);
                }
            }
        }
    }

    /// Stream view equivalent to calling [`FrameReader::read`] repeatedly.
    /// Ends after end-of-stream or after yielding an error.
    pub fn stream(&self) -> impl Stream<Item = Result<Bytes>> + Send + '_ {
        stream::unfold(self, |reader| async move {
            match reader.read().await {
                Ok(Some(frame)) => Some((Ok(frame), reader)),
                Ok(None) => None,
                Err(e) => Some((Err(e), reader)),
            }
        })
    }
}

/// A frame reader and writer sharing one channel.
pub struct FrameDuplex {
    reader: FrameReader,
    writer: FrameWriter,
}

impl FrameDuplex {
    pub fn new(channel: Arc<dyn Duplex>) -> Self {
        Self {
            reader: FrameReader::new(channel.clone()),
            writer: FrameWriter::new(channel),
        }
    }

    pub async fn read(&self) -> Result<Option<Bytes>> {
        self.reader.read().await
    }

    pub async fn write(&self, payload: impl AsRef<[u8]>) -> Result<()> {
        self.writer.write(payload).await
    }

    pub async fn close(&self) -> Result<()> {
        self.writer.close().await
    }

    pub fn stream(&self) -> impl Stream<Item = Result<Bytes>> + Send + '_ {
        self.reader.stream()
    }

    pub fn reader(&self) -> &FrameReader {
        &self.reader
    }

    pub fn writer(&self) -> &FrameWriter {
        &self.writer
    }
}
