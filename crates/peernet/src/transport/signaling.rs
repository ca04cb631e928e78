//! Offer/answer dispatch over the hub, shared by every transport.
//!
//! An offer is routed to the listener bound on its port; with nothing bound
//! the offer is answered with a reject. Answers and rejects settle the
//! pending connect that issued the offer.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use protocol::error::{ProtocolError, Result};
use protocol::messages::{HubMessage, SignalPayload};
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

use super::{TransportChannel, TransportListener};
use crate::hub::Hub;
use crate::sync::Deferred;

/// An offer received for a bound port.
#[derive(Debug, Clone)]
pub struct IncomingOffer {
    pub connection: String,
    /// Hub address of the offering peer.
    pub from: String,
    pub from_port: u16,
    pub port: u16,
    pub sdp: Option<String>,
}

/// Routes negotiation messages between the hub and transports.
///
/// One dispatcher should exist per hub; each one answers every offer
/// addressed to the hub.
pub struct Signaling {
    hub: Arc<dyn Hub>,
    listeners: DashMap<u16, mpsc::UnboundedSender<IncomingOffer>>,
    pending: DashMap<String, Deferred<Option<String>>>,
}

impl Signaling {
    pub fn new(hub: Arc<dyn Hub>) -> Arc<Self> {
        let signaling = Arc::new(Self {
            hub: hub.clone(),
            listeners: DashMap::new(),
            pending: DashMap::new(),
        });

        let weak: Weak<Self> = Arc::downgrade(&signaling);
        hub.receive(Box::new(move |message| {
            if let Some(signaling) = weak.upgrade() {
                signaling.handle(message);
            }
        }));

        signaling
    }

    pub fn hub(&self) -> &Arc<dyn Hub> {
        &self.hub
    }

    /// Claims `port` and returns the stream of offers addressed to it.
    pub fn bind(&self, port: u16) -> Result<mpsc::UnboundedReceiver<IncomingOffer>> {
        match self.listeners.entry(port) {
            Entry::Occupied(_) => Err(ProtocolError::AddressInUse { port }),
            Entry::Vacant(slot) => {
                let (tx, rx) = mpsc::unbounded_channel();
                slot.insert(tx);
                tracing::debug!(port, "port bound");
                Ok(rx)
            }
        }
    }

    pub fn unbind(&self, port: u16) {
        if self.listeners.remove(&port).is_some() {
            tracing::debug!(port, "port unbound");
        }
    }

    pub fn is_bound(&self, port: u16) -> bool {
        self.listeners.contains_key(&port)
    }

    /// Sends an offer and waits for the peer's answer.
    ///
    /// Resolves with the answer's session description. A reject fails with
    /// `ConnectionRefused`. There is no timeout; callers race this against
    /// their own deadline.
    pub async fn negotiate(
        &self,
        to: &str,
        port: u16,
        from_port: u16,
        connection: &str,
        sdp: Option<String>,
    ) -> Result<Option<String>> {
        let answer = Deferred::new();
        self.pending.insert(connection.to_string(), answer.clone());
        let _pending = PendingOffer {
            pending: &self.pending,
            connection,
        };

        let offer = SignalPayload::Offer {
            connection: connection.to_string(),
            port,
            from_port,
            sdp,
        };
        self.hub.send(to, serde_json::to_value(&offer)?)?;
        tracing::debug!(to = %to, port, connection = %connection, "offer sent");

        answer.wait().await.map_err(|e| match e {
            ProtocolError::Rejected(reason) => ProtocolError::ConnectionRefused(reason),
            other => other,
        })
    }

    /// Accepts `offer`, optionally carrying a session description.
    pub fn answer(&self, offer: &IncomingOffer, sdp: Option<String>) -> Result<()> {
        let answer = SignalPayload::Answer {
            connection: offer.connection.clone(),
            sdp,
        };
        self.hub.send(&offer.from, serde_json::to_value(&answer)?)
    }

    /// Refuses an offer.
    pub fn reject(&self, to: &str, connection: &str, reason: impl Into<String>) -> Result<()> {
        let reject = SignalPayload::Reject {
            connection: connection.to_string(),
            reason: reason.into(),
        };
        self.hub.send(to, serde_json::to_value(&reject)?)
    }

    fn handle(&self, message: HubMessage) {
        let payload: SignalPayload = match serde_json::from_value(message.data) {
            Ok(payload) => payload,
            Err(e) => {
                tracing::debug!(from = %message.from, error = %e, "ignoring non-signaling hub message");
                return;
            }
        };

        match payload {
            SignalPayload::Offer {
                connection,
                port,
                from_port,
                sdp,
            } => {
                let offer = IncomingOffer {
                    connection,
                    from: message.from,
                    from_port,
                    port,
                    sdp,
                };
                let delivered = match self.listeners.get(&port) {
                    Some(listener) => listener.send(offer.clone()).is_ok(),
                    None => false,
                };
                if !delivered {
                    tracing::debug!(port, from = %offer.from, "rejecting offer for unbound port");
                    let reason = format!("nothing is listening on port {}", port);
                    if let Err(e) = self.reject(&offer.from, &offer.connection, reason) {
                        tracing::warn!(error = %e, "failed to send reject");
                    }
                }
            }
            SignalPayload::Answer { connection, sdp } => match self.pending.get(&connection) {
                Some(pending) => {
                    pending.resolve(sdp);
                }
                None => tracing::debug!(connection = %connection, "answer for unknown connection"),
            },
            SignalPayload::Reject { connection, reason } => match self.pending.get(&connection) {
                Some(pending) => {
                    pending.reject(reason);
                }
                None => tracing::debug!(connection = %connection, "reject for unknown connection"),
            },
        }
    }
}

/// Removes a pending offer when its connect finishes or is abandoned.
struct PendingOffer<'a> {
    pending: &'a DashMap<String, Deferred<Option<String>>>,
    connection: &'a str,
}

impl Drop for PendingOffer<'_> {
    fn drop(&mut self) {
        self.pending.remove(self.connection);
    }
}

/// Listener turning offers for one port into accepted channels.
///
/// Each offer is negotiated on its own task; a failed negotiation is
/// answered with a reject.
pub(crate) struct OfferListener {
    port: u16,
    signaling: Arc<Signaling>,
    accepted: Mutex<mpsc::UnboundedReceiver<TransportChannel>>,
    closed: AtomicBool,
    shutdown: CancellationToken,
}

impl OfferListener {
    pub(crate) fn bind<F, Fut>(signaling: &Arc<Signaling>, port: u16, negotiate: F) -> Result<Self>
    where
        F: Fn(IncomingOffer) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<TransportChannel>> + Send + 'static,
    {
        let mut offers = signaling.bind(port)?;
        let (accepted_tx, accepted_rx) = mpsc::unbounded_channel();
        let shutdown = CancellationToken::new();

        {
            let signaling = signaling.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                loop {
                    let offer = tokio::select! {
                        _ = shutdown.cancelled() => break,
                        offer = offers.recv() => match offer {
                            Some(offer) => offer,
                            None => break,
                        },
                    };

                    let negotiation = negotiate(offer.clone());
                    let signaling = signaling.clone();
                    let accepted_tx = accepted_tx.clone();
                    tokio::spawn(async move {
                        match negotiation.await {
                            Ok(channel) => {
                                if let Err(mpsc::error::SendError(channel)) = accepted_tx.send(channel) {
                                    let _ = channel.channel.close().await;
                                }
                            }
                            Err(e) => {
                                tracing::warn!(port = offer.port, from = %offer.from, error = %e, "failed to accept offer");
                                let _ = signaling.reject(&offer.from, &offer.connection, e.to_string());
                            }
                        }
                    });
                }
                tracing::debug!(port, "offer listener stopped");
            });
        }

        Ok(Self {
            port,
            signaling: signaling.clone(),
            accepted: Mutex::new(accepted_rx),
            closed: AtomicBool::new(false),
            shutdown,
        })
    }
}

impl TransportListener for OfferListener {
    fn accept(&self) -> futures_util::future::BoxFuture<'_, Option<TransportChannel>> {
        Box::pin(async move {
            let mut accepted = tokio::select! {
                _ = self.shutdown.cancelled() => return None,
                accepted = self.accepted.lock() => accepted,
            };
            tokio::select! {
                _ = self.shutdown.cancelled() => None,
                channel = accepted.recv() => channel,
            }
        })
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.shutdown.cancel();
        self.signaling.unbind(self.port);
    }
}

impl Drop for OfferListener {
    fn drop(&mut self) {
        self.close();
    }
}
