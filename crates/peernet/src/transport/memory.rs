//! In-process transport. Negotiation goes through the hub like any other
//! transport; the channel itself is a [`pipe`] handed over through a
//! [`MemorySwitch`] shared by every transport of the process.

use std::sync::Arc;

use dashmap::DashMap;
use futures_util::future::BoxFuture;
use protocol::error::{ProtocolError, Result};
use protocol::messages::Address;
use uuid::Uuid;

use super::signaling::{IncomingOffer, OfferListener, Signaling};
use super::{Transport, TransportChannel, TransportListener};
use crate::hub::Hub;
use crate::io::{pipe, PipeEnd};

/// Hand-over point for pipe ends awaiting the answering side.
#[derive(Clone, Default)]
pub struct MemorySwitch {
    pending: Arc<DashMap<String, PipeEnd>>,
}

impl MemorySwitch {
    pub fn new() -> Self {
        Self::default()
    }

    fn park(&self, connection: &str, end: PipeEnd) {
        self.pending.insert(connection.to_string(), end);
    }

    fn take(&self, connection: &str) -> Option<PipeEnd> {
        self.pending.remove(connection).map(|(_, end)| end)
    }

    /// Number of pipe ends not yet claimed.
    pub fn pending(&self) -> usize {
        self.pending.len()
    }
}

/// Drops a parked pipe end unless the connect completed.
struct ParkedEnd<'a> {
    switch: &'a MemorySwitch,
    connection: &'a str,
}

impl Drop for ParkedEnd<'_> {
    fn drop(&mut self) {
        self.switch.take(self.connection);
    }
}

/// Transport opening in-process pipes between hubs of one process.
pub struct MemoryTransport {
    signaling: Arc<Signaling>,
    switch: MemorySwitch,
    max_message_size: Option<usize>,
}

impl MemoryTransport {
    pub fn new(hub: Arc<dyn Hub>, switch: MemorySwitch) -> Self {
        Self {
            signaling: Signaling::new(hub),
            switch,
            max_message_size: None,
        }
    }

    /// Splits every channel write into chunks of at most `size` bytes.
    pub fn with_max_message_size(mut self, size: usize) -> Self {
        self.max_message_size = Some(size);
        self
    }

    pub fn signaling(&self) -> &Arc<Signaling> {
        &self.signaling
    }
}

impl Transport for MemoryTransport {
    fn listen(&self, port: u16) -> Result<Box<dyn TransportListener>> {
        let switch = self.switch.clone();
        let signaling = self.signaling.clone();

        let listener = OfferListener::bind(&self.signaling, port, move |offer| {
            accept_offer(switch.clone(), signaling.clone(), offer)
        })?;

        Ok(Box::new(listener))
    }

    fn connect(
        &self,
        hostname: &str,
        port: u16,
        local_port: u16,
    ) -> BoxFuture<'_, Result<TransportChannel>> {
        let hostname = hostname.to_string();
        Box::pin(async move {
            let connection = Uuid::new_v4().to_string();
            let (local, remote) = pipe(self.max_message_size);
            self.switch.park(&connection, remote);
            let _parked = ParkedEnd {
                switch: &self.switch,
                connection: &connection,
            };

            self.signaling
                .negotiate(&hostname, port, local_port, &connection, None)
                .await?;

            tracing::debug!(to = %hostname, port, connection = %connection, "memory channel open");
            Ok(TransportChannel {
                channel: Arc::new(local),
                remote: Address::new(hostname, port),
            })
        })
    }
}

async fn accept_offer(
    switch: MemorySwitch,
    signaling: Arc<Signaling>,
    offer: IncomingOffer,
) -> Result<TransportChannel> {
    let end = switch.take(&offer.connection).ok_or_else(|| {
        ProtocolError::ConnectionRefused(format!(
            "no pending channel for connection {}",
            offer.connection
        ))
    })?;
    signaling.answer(&offer, None)?;
    Ok(TransportChannel {
        channel: Arc::new(end),
        remote: Address::new(offer.from, offer.from_port),
    })
}
