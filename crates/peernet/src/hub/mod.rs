//! Signaling hub: delivers small JSON messages between endpoints by address.
//!
//! The hub only carries transport negotiation traffic. Delivery is
//! best-effort: `send` never waits for, or reports, delivery.
//!
//! - [`LocalHub`]: in-process broadcast bus, for tests and single-process use
//! - [`RemoteHub`]: WebSocket client of a [`crate::relay::RelayServer`]

mod local;
mod remote;

use std::sync::{Arc, RwLock};

use protocol::error::Result;
use protocol::messages::HubMessage;
use serde::{Deserialize, Serialize};

pub use local::{HubBus, LocalHub};
pub use remote::{ConnectionState, RemoteHub, RemoteHubConfig};

/// Callback invoked once per inbound message addressed to this endpoint.
pub type HubCallback = Box<dyn Fn(HubMessage) + Send + Sync>;

/// ICE server entry handed to peer transports.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServer {
    pub urls: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

impl IceServer {
    pub fn stun(url: impl Into<String>) -> Self {
        Self {
            urls: vec![url.into()],
            username: None,
            credential: None,
        }
    }
}

/// Transport configuration shared through the hub.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HubConfiguration {
    #[serde(default)]
    pub ice_servers: Vec<IceServer>,
}

/// A signaling endpoint.
pub trait Hub: Send + Sync {
    /// This endpoint's identity, stable for the hub's lifetime.
    fn address(&self) -> &str;

    fn configuration(&self) -> &HubConfiguration;

    /// Sends `data` to the endpoint at `to`. Fails only once disposed.
    fn send(&self, to: &str, data: serde_json::Value) -> Result<()>;

    /// Registers a callback for inbound messages. Several may be registered.
    fn receive(&self, callback: HubCallback);

    /// Stops delivery and releases resources. Idempotent.
    fn dispose(&self);
}

/// Registered inbound callbacks, shared by hub implementations.
#[derive(Default)]
pub(crate) struct Receivers {
    callbacks: RwLock<Vec<Arc<HubCallback>>>,
}

impl Receivers {
    pub(crate) fn register(&self, callback: HubCallback) {
        self.callbacks
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push(Arc::new(callback));
    }

    pub(crate) fn dispatch(&self, message: HubMessage) {
        let callbacks: Vec<_> = self
            .callbacks
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone();
        for callback in callbacks {
            callback(message.clone());
        }
    }

    pub(crate) fn clear(&self) {
        self.callbacks
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clear();
    }
}
