//! Rendezvous relay: the server side of [`crate::hub::RemoteHub`].
//!
//! Peers connect over WebSocket to `/hub/{address}`. Every text message a
//! peer sends is parsed as a [`HubMessage`] and forwarded unchanged to the
//! peer registered under its `to` address. Unroutable messages are dropped.

use std::net::SocketAddr;
use std::sync::Arc;

use dashmap::DashMap;
use futures_util::{SinkExt, StreamExt};
use protocol::error::{ProtocolError, Result};
use protocol::messages::HubMessage;
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_util::sync::CancellationToken;

const HUB_PATH_PREFIX: &str = "/hub/";

type PeerMap = Arc<DashMap<String, mpsc::UnboundedSender<String>>>;

/// WebSocket relay routing hub messages between connected peers.
pub struct RelayServer {
    listener: TcpListener,
    peers: PeerMap,
    shutdown: CancellationToken,
}

impl RelayServer {
    /// Binds the relay to `addr`.
    pub async fn bind(addr: impl ToSocketAddrs) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self {
            listener,
            peers: Arc::new(DashMap::new()),
            shutdown: CancellationToken::new(),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Base URL hubs should use to reach this relay.
    pub fn url(&self) -> Result<String> {
        Ok(format!("ws://{}", self.local_addr()?))
    }

    /// Number of currently connected peers.
    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    /// Accepts peers until [`RelayServer::shutdown`] is called.
    pub async fn run(&self) -> Result<()> {
        tracing::info!(addr = ?self.listener.local_addr().ok(), "relay listening");

        loop {
            let (stream, peer_addr) = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                accepted = self.listener.accept() => match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        tracing::warn!(error = %e, "failed to accept relay connection");
                        continue;
                    }
                },
            };

            let peers = self.peers.clone();
            let shutdown = self.shutdown.clone();
            tokio::spawn(async move {
                if let Err(e) = serve_peer(stream, peers, shutdown).await {
                    tracing::debug!(peer = %peer_addr, error = %e, "relay peer ended with error");
                }
            });
        }

        tracing::info!("relay stopped");
        Ok(())
    }

    /// Stops accepting and disconnects every peer.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }
}

async fn serve_peer(stream: TcpStream, peers: PeerMap, shutdown: CancellationToken) -> Result<()> {
    let mut path = None;
    let ws = tokio_tungstenite::accept_hdr_async(
        stream,
        |request: &Request, response: Response| -> std::result::Result<Response, ErrorResponse> {
            match request.uri().path().strip_prefix(HUB_PATH_PREFIX) {
                Some(address) if !address.is_empty() && !address.contains('/') => {
                    path = Some(address.to_string());
                    Ok(response)
                }
                _ => {
                    let mut error = ErrorResponse::new(Some("expected /hub/{address}".to_string()));
                    *error.status_mut() = StatusCode::NOT_FOUND;
                    Err(error)
                }
            }
        },
    )
    .await
    .map_err(|e| ProtocolError::Transport(format!("websocket handshake failed: {}", e)))?;

    let address = path.ok_or_else(|| ProtocolError::MalformedHeader("missing hub address".to_string()))?;
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    if peers.insert(address.clone(), tx.clone()).is_some() {
        tracing::info!(address = %address, "peer reconnected, replacing previous connection");
    } else {
        tracing::info!(address = %address, "peer connected");
    }

    let (mut ws_sink, mut ws_stream) = ws.split();
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                let _ = ws_sink.send(WsMessage::Close(None)).await;
                break;
            }
            Some(text) = rx.recv() => {
                if let Err(e) = ws_sink.send(WsMessage::Text(text)).await {
                    tracing::debug!(address = %address, error = %e, "failed to forward to peer");
                    break;
                }
            }
            received = ws_stream.next() => match received {
                Some(Ok(WsMessage::Text(text))) => route(&peers, &address, text),
                Some(Ok(WsMessage::Close(_))) | None => break,
                Some(Err(e)) => {
                    tracing::debug!(address = %address, error = %e, "peer receive error");
                    break;
                }
                // Pings are answered by tungstenite itself.
                Some(Ok(_)) => {}
            },
        }
    }

    peers.remove_if(&address, |_, registered| registered.same_channel(&tx));
    tracing::info!(address = %address, "peer disconnected");
    Ok(())
}

fn route(peers: &PeerMap, from: &str, text: String) {
    let to = match HubMessage::from_json(&text) {
        Ok(message) => message.to,
        Err(e) => {
            tracing::debug!(from = %from, error = %e, "dropping malformed hub message");
            return;
        }
    };

    match peers.get(&to) {
        Some(peer) => {
            if peer.send(text).is_err() {
                tracing::debug!(to = %to, "destination peer is closing");
            }
        }
        None => tracing::debug!(from = %from, to = %to, "no route for hub message"),
    }
}
