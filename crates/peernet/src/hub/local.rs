//! In-process hub over a broadcast channel.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use protocol::error::{ProtocolError, Result};
use protocol::messages::HubMessage;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::{Hub, HubCallback, HubConfiguration, Receivers};

const BUS_CAPACITY: usize = 1024;

/// Shared broadcast medium connecting [`LocalHub`]s of one process.
///
/// Every hub sees every message and keeps those addressed to it.
#[derive(Clone)]
pub struct HubBus {
    name: String,
    tx: broadcast::Sender<String>,
}

impl Default for HubBus {
    fn default() -> Self {
        Self::new()
    }
}

impl HubBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(BUS_CAPACITY);
        Self {
            name: format!("peernet-hub-{}", Uuid::new_v4()),
            tx,
        }
    }

    /// Generated channel name identifying this bus.
    pub fn name(&self) -> &str {
        &self.name
    }

    fn publish(&self, text: String) {
        // Err only means no hub is subscribed right now.
        let _ = self.tx.send(text);
    }
}

/// Hub endpoint attached to a [`HubBus`].
pub struct LocalHub {
    address: String,
    configuration: HubConfiguration,
    bus: HubBus,
    receivers: Arc<Receivers>,
    disposed: AtomicBool,
    shutdown: CancellationToken,
}

impl LocalHub {
    /// Attaches a new endpoint with a fresh address to `bus`.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(bus: &HubBus, configuration: HubConfiguration) -> Self {
        let address = Uuid::new_v4().to_string();
        let receivers = Arc::new(Receivers::default());
        let shutdown = CancellationToken::new();

        let mut rx = bus.tx.subscribe();
        {
            let address = address.clone();
            let receivers = receivers.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                loop {
                    let text = tokio::select! {
                        _ = shutdown.cancelled() => break,
                        received = rx.recv() => match received {
                            Ok(text) => text,
                            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                                tracing::warn!(address = %address, skipped, "hub receiver lagged");
                                continue;
                            }
                            Err(broadcast::error::RecvError::Closed) => break,
                        },
                    };

                    match HubMessage::from_json(&text) {
                        Ok(message) if message.to == address => receivers.dispatch(message),
                        Ok(_) => {}
                        Err(e) => tracing::debug!(error = %e, "ignoring malformed hub message"),
                    }
                }
                tracing::debug!(address = %address, "local hub receive loop stopped");
            });
        }

        tracing::debug!(address = %address, bus = %bus.name(), "local hub attached");
        Self {
            address,
            configuration,
            bus: bus.clone(),
            receivers,
            disposed: AtomicBool::new(false),
            shutdown,
        }
    }
}

impl Hub for LocalHub {
    fn address(&self) -> &str {
        &self.address
    }

    fn configuration(&self) -> &HubConfiguration {
        &self.configuration
    }

    fn send(&self, to: &str, data: serde_json::Value) -> Result<()> {
        if self.disposed.load(Ordering::SeqCst) {
            return Err(ProtocolError::Disposed("hub"));
        }
        let message = HubMessage {
            to: to.to_string(),
            from: self.address.clone(),
            data,
        };
        self.bus.publish(message.to_json()?);
        Ok(())
    }

    fn receive(&self, callback: HubCallback) {
        self.receivers.register(callback);
    }

    fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.shutdown.cancel();
        self.receivers.clear();
    }
}

impl Drop for LocalHub {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}
