//! Ordinal frame codec.
//!
//! # Frame Format
//!
//! Each frame consists of:
//! - 4 bytes: ordinal (big-endian), zero-based and per direction
//! - 4 bytes: payload length (big-endian)
//! - N bytes: payload
//!
//! The ordinal turns reordering or duplication in the underlying channel into
//! an immediate, fatal error: a decoder only accepts the ordinal it expects
//! next. There is no resynchronisation.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{ProtocolError, Result};

/// Frame header size: 4 (ordinal) + 4 (length) = 8 bytes.
pub const FRAME_HEADER_SIZE: usize = 8;

/// Maximum payload size of a single frame (16 MB).
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Parsed frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    /// Sequence number of this frame within its direction.
    pub ordinal: u32,
    /// Number of payload bytes following the header.
    pub length: u32,
}

impl FrameHeader {
    /// Serialize the header into its 8-byte wire form.
    pub fn encode(&self) -> [u8; FRAME_HEADER_SIZE] {
        let mut out = [0u8; FRAME_HEADER_SIZE];
        out[0..4].copy_from_slice(&self.ordinal.to_be_bytes());
        out[4..8].copy_from_slice(&self.length.to_be_bytes());
        out
    }

    /// Parse a header from the start of `data`.
    ///
    /// Returns `None` if fewer than [`FRAME_HEADER_SIZE`] bytes are available.
    pub fn decode(data: &[u8]) -> Option<Self> {
        if data.len() < FRAME_HEADER_SIZE {
            return None;
        }
        let ordinal = u32::from_be_bytes([data[0], data[1], data[2], data[3]]);
        let length = u32::from_be_bytes([data[4], data[5], data[6], data[7]]);
        Some(Self { ordinal, length })
    }
}

/// Encode a single frame with an explicit ordinal.
pub fn encode_frame(ordinal: u32, payload: &[u8]) -> Result<Bytes> {
    if payload.len() > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge {
            size: payload.len(),
            max: MAX_FRAME_SIZE,
        });
    }

    let header = FrameHeader {
        ordinal,
        length: payload.len() as u32,
    };

    let mut output = BytesMut::with_capacity(FRAME_HEADER_SIZE + payload.len());
    output.put_slice(&header.encode());
    output.put_slice(payload);
    Ok(output.freeze())
}

/// Outbound half of the codec: stamps successive ordinals.
///
/// The ordinal only moves forward through [`FrameEncoder::advance`], which
/// the caller invokes once the encoded frame was accepted by the channel.
#[derive(Debug, Clone, Default)]
pub struct FrameEncoder {
    next_ordinal: u32,
}

impl FrameEncoder {
    /// Create an encoder starting at ordinal 0.
    pub fn new() -> Self {
        Self::default()
    }

    /// Ordinal the next encoded frame will carry.
    pub fn ordinal(&self) -> u32 {
        self.next_ordinal
    }

    /// Encode `payload` with the current ordinal.
    pub fn encode(&self, payload: &[u8]) -> Result<Bytes> {
        encode_frame(self.next_ordinal, payload)
    }

    /// Commit the current ordinal.
    pub fn advance(&mut self) {
        self.next_ordinal = self.next_ordinal.wrapping_add(1);
    }
}

/// Inbound half of the codec: an accumulator validating ordinals.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buffer: BytesMut,
    expected_ordinal: u32,
    pending: Option<FrameHeader>,
}

impl FrameDecoder {
    /// Create a decoder expecting ordinal 0.
    pub fn new() -> Self {
        Self::default()
    }

    /// Ordinal the next accepted frame must carry.
    pub fn expected_ordinal(&self) -> u32 {
        self.expected_ordinal
    }

    /// Number of bytes buffered but not yet yielded, including a parsed
    /// header still waiting for its payload.
    pub fn buffered(&self) -> usize {
        let header = if self.pending.is_some() {
            FRAME_HEADER_SIZE
        } else {
            0
        };
        self.buffer.len() + header
    }

    /// Append bytes read from the channel.
    pub fn push(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Try to take the next complete frame payload out of the buffer.
    ///
    /// Returns `Ok(None)` while more bytes are needed. A header whose ordinal
    /// differs from the expected one, or whose length exceeds
    /// [`MAX_FRAME_SIZE`], is an error and nothing is yielded for it.
    pub fn next_frame(&mut self) -> Result<Option<Bytes>> {
        let header = match self.pending {
            Some(header) => header,
            None => {
                let Some(header) = FrameHeader::decode(&self.buffer) else {
                    return Ok(None);
                };

                if header.ordinal != self.expected_ordinal {
                    return Err(ProtocolError::OrdinalMismatch {
                        expected: self.expected_ordinal,
                        got: header.ordinal,
                    });
                }

                if header.length as usize > MAX_FRAME_SIZE {
                    return Err(ProtocolError::FrameTooLarge {
                        size: header.length as usize,
                        max: MAX_FRAME_SIZE,
                    });
                }

                self.buffer.advance(FRAME_HEADER_SIZE);
                self.pending = Some(header);
                header
            }
        };

        let length = header.length as usize;
        if self.buffer.len() < length {
            return Ok(None);
        }

        let payload = self.buffer.split_to(length).freeze();
        self.pending = None;
        self.expected_ordinal = self.expected_ordinal.wrapping_add(1);
        Ok(Some(payload))
    }
}
