//! The message channel contract every layer is built on.
//!
//! A [`Duplex`] is a bidirectional, message-oriented channel: `read` yields
//! the next chunk or `None` once the channel reached end-of-stream, `write`
//! sends one chunk, `close` tears the channel down. Chunk boundaries carry no
//! meaning; the frame layer restores message boundaries on top.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use futures_util::future::BoxFuture;
use protocol::error::{ProtocolError, Result};

use crate::sync::Queue;

/// A bidirectional byte-chunk channel.
pub trait Duplex: Send + Sync {
    /// Reads the next chunk. `Ok(None)` means end-of-stream.
    fn read(&self) -> BoxFuture<'_, Result<Option<Bytes>>>;

    /// Writes one chunk.
    fn write(&self, chunk: Bytes) -> BoxFuture<'_, Result<()>>;

    /// Closes the channel in both directions.
    fn close(&self) -> BoxFuture<'_, Result<()>>;
}

/// One end of an in-process channel created by [`pipe`].
pub struct PipeEnd {
    incoming: Queue<Option<Bytes>>,
    outgoing: Queue<Option<Bytes>>,
    closed: Arc<AtomicBool>,
    eof: AtomicBool,
    max_message_size: Option<usize>,
}

/// Creates a connected pair of in-process channel ends.
///
/// With `max_message_size`, each write is delivered as chunks of at most
/// that many bytes, the way a message-size-limited transport would.
pub fn pipe(max_message_size: Option<usize>) -> (PipeEnd, PipeEnd) {
    let a_to_b = Queue::new();
    let b_to_a = Queue::new();
    let closed = Arc::new(AtomicBool::new(false));

    let a = PipeEnd {
        incoming: b_to_a.clone(),
        outgoing: a_to_b.clone(),
        closed: closed.clone(),
        eof: AtomicBool::new(false),
        max_message_size,
    };
    let b = PipeEnd {
        incoming: a_to_b,
        outgoing: b_to_a,
        closed,
        eof: AtomicBool::new(false),
        max_message_size,
    };
    (a, b)
}

impl PipeEnd {
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl Duplex for PipeEnd {
    fn read(&self) -> BoxFuture<'_, Result<Option<Bytes>>> {
        Box::pin(async move {
            if self.eof.load(Ordering::SeqCst) {
                return Ok(None);
            }
            match self.incoming.dequeue().await {
                Some(chunk) => Ok(Some(chunk)),
                None => {
                    self.eof.store(true, Ordering::SeqCst);
                    Ok(None)
                }
            }
        })
    }

    fn write(&self, chunk: Bytes) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            if self.is_closed() {
                return Err(ProtocolError::ConnectionClosed("pipe closed".to_string()));
            }
            match self.max_message_size {
                Some(limit) if limit > 0 && chunk.len() > limit => {
                    let mut rest = chunk;
                    while !rest.is_empty() {
                        let piece = rest.split_to(limit.min(rest.len()));
                        self.outgoing.enqueue(Some(piece));
                    }
                }
                _ => self.outgoing.enqueue(Some(chunk)),
            }
            Ok(())
        })
    }

    fn close(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            if !self.closed.swap(true, Ordering::SeqCst) {
                self.outgoing.enqueue(None);
                self.incoming.enqueue(None);
            }
            Ok(())
        })
    }
}
