//! Hub client connected to a rendezvous relay over WebSocket.
//!
//! The client connects to `{server_url}/hub/{address}` and exchanges
//! [`HubMessage`] JSON text frames. Outgoing messages queue while the
//! connection is down. The connection is re-established with exponential
//! backoff and kept alive with ping heartbeats.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::{SinkExt, StreamExt};
use protocol::error::{ProtocolError, Result};
use protocol::messages::HubMessage;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::{
    connect_async,
    tungstenite::{Error as WsError, Message as WsMessage},
    MaybeTlsStream, WebSocketStream,
};
use tokio_util::sync::CancellationToken;
use url::Url;
use uuid::Uuid;

use super::{Hub, HubCallback, HubConfiguration, Receivers};

/// Default reconnection settings.
const INITIAL_BACKOFF_MS: u64 = 100;
const MAX_BACKOFF_MS: u64 = 30_000;
const BACKOFF_MULTIPLIER: f64 = 2.0;

/// Connection state of a [`RemoteHub`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Not connected and not trying to.
    Disconnected,
    /// Attempting to connect.
    Connecting,
    /// Connected and ready.
    Connected,
    /// Waiting to retry after a disconnect.
    Reconnecting,
}

/// Configuration for [`RemoteHub`].
#[derive(Debug, Clone)]
pub struct RemoteHubConfig {
    /// Base WebSocket URL of the relay, without the `/hub/...` path.
    pub server_url: String,
    /// Initial backoff duration for reconnection.
    pub initial_backoff: Duration,
    /// Maximum backoff duration for reconnection.
    pub max_backoff: Duration,
    /// Multiplier for exponential backoff.
    pub backoff_multiplier: f64,
    /// Whether to automatically reconnect on disconnect.
    pub auto_reconnect: bool,
    /// Interval between heartbeat pings.
    pub heartbeat_interval: Duration,
    /// Timeout for heartbeat pong response.
    pub heartbeat_timeout: Duration,
}

impl Default for RemoteHubConfig {
    fn default() -> Self {
        Self {
            server_url: crate::config::DEFAULT_HUB_URL.to_string(),
            initial_backoff: Duration::from_millis(INITIAL_BACKOFF_MS),
            max_backoff: Duration::from_millis(MAX_BACKOFF_MS),
            backoff_multiplier: BACKOFF_MULTIPLIER,
            auto_reconnect: true,
            heartbeat_interval: Duration::from_secs(30),
            heartbeat_timeout: Duration::from_secs(10),
        }
    }
}

impl RemoteHubConfig {
    /// Creates a new configuration with the specified server URL.
    pub fn new(server_url: impl Into<String>) -> Self {
        Self {
            server_url: server_url.into(),
            ..Default::default()
        }
    }

    /// Sets whether to automatically reconnect on disconnect.
    pub fn with_auto_reconnect(mut self, auto_reconnect: bool) -> Self {
        self.auto_reconnect = auto_reconnect;
        self
    }

    /// Sets the initial backoff duration.
    pub fn with_initial_backoff(mut self, duration: Duration) -> Self {
        self.initial_backoff = duration;
        self
    }

    /// Sets the maximum backoff duration.
    pub fn with_max_backoff(mut self, duration: Duration) -> Self {
        self.max_backoff = duration;
        self
    }
}

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// WebSocket-backed hub endpoint.
pub struct RemoteHub {
    address: String,
    configuration: HubConfiguration,
    config: RemoteHubConfig,
    receivers: Receivers,
    outgoing_tx: mpsc::UnboundedSender<String>,
    state_tx: watch::Sender<ConnectionState>,
    disposed: AtomicBool,
    shutdown: CancellationToken,
}

impl RemoteHub {
    /// Creates a hub with a fresh address and starts connecting in the
    /// background.
    ///
    /// Fails if the relay URL is invalid. Must be called from within a tokio
    /// runtime.
    pub fn connect(config: RemoteHubConfig, configuration: HubConfiguration) -> Result<Arc<Self>> {
        let address = Uuid::new_v4().to_string();
        let hub_url = build_hub_url(&config.server_url, &address)?;

        let (outgoing_tx, outgoing_rx) = mpsc::unbounded_channel();
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);

        let hub = Arc::new(Self {
            address,
            configuration,
            config,
            receivers: Receivers::default(),
            outgoing_tx,
            state_tx,
            disposed: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
        });

        tokio::spawn(hub.clone().run_connection_loop(hub_url, outgoing_rx));
        Ok(hub)
    }

    /// Returns the current connection state.
    pub fn state(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    /// Waits until the relay connection is established.
    pub async fn wait_connected(&self) -> Result<()> {
        let mut state_rx = self.state_tx.subscribe();
        tokio::select! {
            _ = self.shutdown.cancelled() => Err(ProtocolError::Disposed("hub")),
            result = state_rx.wait_for(|state| *state == ConnectionState::Connected) => result
                .map(|_| ())
                .map_err(|_| ProtocolError::Disposed("hub")),
        }
    }

    fn set_state(&self, new_state: ConnectionState) {
        let changed = self.state_tx.send_if_modified(|state| {
            if *state == new_state {
                return false;
            }
            *state = new_state;
            true
        });
        if changed {
            tracing::debug!(state = ?new_state, "hub connection state changed");
        }
    }

    fn handle_text(&self, text: &str) {
        match HubMessage::from_json(text) {
            Ok(message) if message.to == self.address => self.receivers.dispatch(message),
            Ok(message) => {
                tracing::debug!(to = %message.to, "dropping hub message for another address")
            }
            Err(e) => tracing::warn!(error = %e, "failed to parse hub message"),
        }
    }

    /// Runs the connection loop with reconnection support.
    async fn run_connection_loop(
        self: Arc<Self>,
        hub_url: String,
        mut outgoing_rx: mpsc::UnboundedReceiver<String>,
    ) {
        let mut backoff = self.config.initial_backoff;

        loop {
            if self.shutdown.is_cancelled() {
                break;
            }

            self.set_state(ConnectionState::Connecting);

            match connect_internal(&hub_url).await {
                Ok(ws) => {
                    backoff = self.config.initial_backoff;
                    self.set_state(ConnectionState::Connected);
                    tracing::info!(address = %self.address, "connected to hub relay");

                    self.pump(ws, &mut outgoing_rx).await;
                }
                Err(e) => {
                    tracing::error!(error = %e, "hub relay connection failed");
                }
            }

            if !self.config.auto_reconnect || self.shutdown.is_cancelled() {
                break;
            }

            self.set_state(ConnectionState::Reconnecting);
            tracing::info!("reconnecting to hub relay in {:?}", backoff);
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = tokio::time::sleep(backoff) => {}
            }

            // Apply exponential backoff
            backoff = std::cmp::min(
                Duration::from_secs_f64(backoff.as_secs_f64() * self.config.backoff_multiplier),
                self.config.max_backoff,
            );
        }

        self.set_state(ConnectionState::Disconnected);
    }

    /// Moves messages between the socket and the hub until the connection
    /// drops, the heartbeat times out, or the hub is disposed.
    async fn pump(&self, ws: WsStream, outgoing_rx: &mut mpsc::UnboundedReceiver<String>) {
        let (mut ws_sink, mut ws_stream) = ws.split();

        let mut heartbeat = tokio::time::interval(self.config.heartbeat_interval);
        // Skip the first immediate tick
        heartbeat.tick().await;
        let mut last_pong = Instant::now();

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    let _ = ws_sink.send(WsMessage::Close(None)).await;
                    break;
                }
                _ = heartbeat.tick() => {
                    if last_pong.elapsed() > self.config.heartbeat_timeout + self.config.heartbeat_interval {
                        tracing::warn!("hub heartbeat timeout, reconnecting");
                        break;
                    }
                    if let Err(e) = ws_sink.send(WsMessage::Ping(Vec::new())).await {
                        tracing::error!(error = %e, "failed to send ping");
                        break;
                    }
                    tracing::debug!("sent heartbeat ping");
                }
                Some(text) = outgoing_rx.recv() => {
                    if let Err(e) = ws_sink.send(WsMessage::Text(text)).await {
                        tracing::error!(error = %e, "failed to send hub message");
                        break;
                    }
                }
                received = ws_stream.next() => match received {
                    Some(Ok(WsMessage::Text(text))) => self.handle_text(&text),
                    Some(Ok(WsMessage::Pong(_))) => {
                        last_pong = Instant::now();
                        tracing::debug!("received heartbeat pong");
                    }
                    Some(Ok(WsMessage::Close(_))) | None => {
                        tracing::info!("hub relay closed connection");
                        break;
                    }
                    Some(Err(e)) => {
                        tracing::warn!(error = %e, "hub relay receive error");
                        break;
                    }
                    // Ignore ping/binary messages
                    Some(Ok(_)) => {}
                },
            }
        }
    }
}

/// Builds the WebSocket URL for an address.
fn build_hub_url(server_url: &str, address: &str) -> Result<String> {
    let base = server_url.trim_end_matches('/');
    let ws_url = format!("{}/hub/{}", base, address);
    Url::parse(&ws_url)
        .map_err(|e| ProtocolError::InvalidUrl(format!("invalid hub URL {}: {}", ws_url, e)))?;
    Ok(ws_url)
}

async fn connect_internal(ws_url: &str) -> Result<WsStream> {
    tracing::info!("connecting to hub relay: {}", ws_url);

    let (ws, _) = connect_async(ws_url).await.map_err(|e| match e {
        WsError::Io(io_err) => ProtocolError::from(io_err),
        _ => ProtocolError::ConnectionClosed(format!("WebSocket connection failed: {}", e)),
    })?;
    Ok(ws)
}

impl Hub for RemoteHub {
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
        self.outgoing_tx
            .send(message.to_json()?)
            .map_err(|_| ProtocolError::Disposed("hub"))
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
