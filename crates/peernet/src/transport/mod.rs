//! Peer transports: open reliable ordered byte channels between hub
//! addresses, negotiated through hub messages.
//!
//! - [`MemoryTransport`]: in-process pipes, signaling still over the hub
//! - [`WebRtcTransport`]: WebRTC data channels

mod memory;
pub mod signaling;
mod webrtc;

use std::sync::Arc;

use futures_util::future::BoxFuture;
use protocol::error::Result;
use protocol::messages::Address;

use crate::io::Duplex;

pub use memory::{MemorySwitch, MemoryTransport};
pub use signaling::{IncomingOffer, Signaling};
pub use self::webrtc::WebRtcTransport;

/// An opened channel and the peer it leads to.
#[derive(Clone)]
pub struct TransportChannel {
    pub channel: Arc<dyn Duplex>,
    /// Hub address and port of the peer end.
    pub remote: Address,
}

impl std::fmt::Debug for TransportChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportChannel")
            .field("remote", &self.remote)
            .finish_non_exhaustive()
    }
}

/// Channel substrate consumed by the net module.
pub trait Transport: Send + Sync {
    /// Binds `port` on this endpoint. Fails with `AddressInUse` if already
    /// bound on this transport.
    fn listen(&self, port: u16) -> Result<Box<dyn TransportListener>>;

    /// Opens a channel to `port` on the endpoint at hub address `hostname`,
    /// announcing `local_port` as the originating port.
    fn connect(&self, hostname: &str, port: u16, local_port: u16)
        -> BoxFuture<'_, Result<TransportChannel>>;
}

/// A bound port yielding accepted channels.
pub trait TransportListener: Send + Sync {
    /// Next accepted channel, `None` once closed.
    fn accept(&self) -> BoxFuture<'_, Option<TransportChannel>>;

    /// Unbinds the port. Idempotent.
    fn close(&self);
}
