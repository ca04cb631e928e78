//! # peernet Protocol Library
//!
//! Wire definitions for the peernet virtual networking stack. Everything in
//! this crate is synchronous and runtime-free; the async layers live in the
//! `peernet` crate.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │     HTTP-over-frames / WebSocket        │  JSON heads, signal markers
//! ├─────────────────────────────────────────┤
//! │              Framing                    │  ordinal + length prefixed
//! ├─────────────────────────────────────────┤
//! │   Peer transport channel (WebRTC/mem)   │  negotiated via hub messages
//! └─────────────────────────────────────────┘
//! ```
//!
//! ## Example Usage
//!
//! ```rust
//! use protocol::{FrameDecoder, FrameEncoder};
//!
//! let mut encoder = FrameEncoder::new();
//! let wire = encoder.encode(b"hello").unwrap();
//! encoder.advance();
//!
//! let mut decoder = FrameDecoder::new();
//! decoder.push(&wire);
//! assert_eq!(decoder.next_frame().unwrap().unwrap(), &b"hello"[..]);
//! ```
//!
//! ## Modules
//!
//! - [`framing`]: Ordinal frame encoder and decoder
//! - [`messages`]: Addresses, hub envelopes, HTTP heads, WebSocket frames
//! - [`error`]: Error types

pub mod error;
pub mod framing;
pub mod messages;

pub use error::{ProtocolError, Result};
pub use framing::{
    encode_frame, FrameDecoder, FrameEncoder, FrameHeader, FRAME_HEADER_SIZE, MAX_FRAME_SIZE,
};
pub use messages::{
    Address, HubMessage, RequestHead, ResponseHead, Signal, SignalPayload, WebSocketFrame,
    WebSocketOpcode,
};
