//! WebRTC data channel transport.
//!
//! Connect creates a peer connection configured with the hub's ICE servers
//! and one ordered data channel labelled `peernet:{port}`, gathers ICE
//! candidates (no trickle), and sends the complete offer over the hub. The
//! listening side answers offers for its port the same way.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures_util::future::BoxFuture;
use protocol::error::{ProtocolError, Result};
use protocol::messages::Address;
use tokio::sync::oneshot;
use uuid::Uuid;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::setting_engine::SettingEngine;
use webrtc::api::{APIBuilder, API};
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_gatherer_state::RTCIceGathererState;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;

use super::signaling::{IncomingOffer, OfferListener, Signaling};
use super::{Transport, TransportChannel, TransportListener};
use crate::hub::{Hub, IceServer};
use crate::io::Duplex;
use crate::sync::{Deferred, Queue};

/// Largest message written to a data channel in one send.
const MAX_MESSAGE_SIZE: usize = 16 * 1024;

/// Upper bound on ICE gathering before proceeding with what was found.
const ICE_GATHERING_TIMEOUT: Duration = Duration::from_secs(10);

/// Upper bound on the answering side waiting for the offerer's channel.
const CHANNEL_OPEN_TIMEOUT: Duration = Duration::from_secs(30);

/// Upper bound on waiting for sent data to be acknowledged before closing.
const CLOSE_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

const DRAIN_POLL_INTERVAL: Duration = Duration::from_millis(10);

const CHANNEL_LABEL_PREFIX: &str = "peernet:";

impl From<&IceServer> for RTCIceServer {
    fn from(server: &IceServer) -> Self {
        RTCIceServer {
            urls: server.urls.clone(),
            username: server.username.clone().unwrap_or_default(),
            credential: server.credential.clone().unwrap_or_default(),
            ..Default::default()
        }
    }
}

fn negotiation_error(what: &str) -> impl FnOnce(webrtc::Error) -> ProtocolError + '_ {
    move |e| ProtocolError::NegotiationFailed(format!("failed to {}: {}", what, e))
}

/// Closes a peer connection from a spawned task. Used where no `.await` is
/// possible.
fn close_in_background(peer_connection: Arc<RTCPeerConnection>) {
    if let Ok(runtime) = tokio::runtime::Handle::try_current() {
        runtime.spawn(async move {
            if let Err(e) = peer_connection.close().await {
                tracing::debug!(error = %e, "failed to close peer connection");
            }
        });
    }
}

/// Closes the peer connection unless negotiation completed.
struct PendingConnection {
    peer_connection: Option<Arc<RTCPeerConnection>>,
}

impl PendingConnection {
    fn new(peer_connection: &Arc<RTCPeerConnection>) -> Self {
        Self {
            peer_connection: Some(peer_connection.clone()),
        }
    }

    fn complete(mut self) {
        self.peer_connection = None;
    }
}

impl Drop for PendingConnection {
    fn drop(&mut self) {
        if let Some(peer_connection) = self.peer_connection.take() {
            tracing::debug!("abandoning peer connection");
            close_in_background(peer_connection);
        }
    }
}

/// Registers the connection state handler. The returned deferred is
/// rejected once the connection fails or closes.
fn watch_connection_state(peer_connection: &RTCPeerConnection) -> Deferred<()> {
    let lost = Deferred::new();
    let handler_lost = lost.clone();
    peer_connection.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
        tracing::debug!("peer connection state changed: {}", state);
        if matches!(state, RTCPeerConnectionState::Failed | RTCPeerConnectionState::Closed) {
            handler_lost.reject(format!("peer connection {}", state));
        }
        Box::pin(async {})
    }));
    lost
}

/// Runs `operation` unless the connection is lost first.
async fn unless_lost<T>(lost: &Deferred<()>, operation: impl Future<Output = Result<T>>) -> Result<T> {
    tokio::select! {
        result = operation => result,
        outcome = lost.wait() => Err(ProtocolError::NegotiationFailed(match outcome {
            Err(e) => e.to_string(),
            Ok(()) => "peer connection lost".to_string(),
        })),
    }
}

/// A data channel with its peer connection, exposed as a [`Duplex`].
///
/// Dropping the last handle closes the peer connection.
struct DataChannelDuplex {
    peer_connection: Arc<RTCPeerConnection>,
    channel: Arc<RTCDataChannel>,
    incoming: Queue<Option<Bytes>>,
    opened: Deferred<()>,
    eof: AtomicBool,
    closed: AtomicBool,
}

impl DataChannelDuplex {
    fn new(
        peer_connection: Arc<RTCPeerConnection>,
        channel: Arc<RTCDataChannel>,
        lost: Deferred<()>,
    ) -> Arc<Self> {
        let duplex = Arc::new(Self {
            peer_connection,
            channel: channel.clone(),
            incoming: Queue::new(),
            opened: Deferred::new(),
            eof: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        });

        let incoming = duplex.incoming.clone();
        channel.on_message(Box::new(move |msg: DataChannelMessage| {
            incoming.enqueue(Some(msg.data));
            Box::pin(async {})
        }));

        let incoming = duplex.incoming.clone();
        let opened = duplex.opened.clone();
        channel.on_close(Box::new(move || {
            opened.reject("data channel closed before opening");
            incoming.enqueue(None);
            Box::pin(async {})
        }));

        let opened = duplex.opened.clone();
        channel.on_open(Box::new(move || {
            opened.resolve(());
            Box::pin(async {})
        }));
        if channel.ready_state() == RTCDataChannelState::Open {
            duplex.opened.resolve(());
        }

        // A failed connection ends the stream even when the channel never
        // reports closing.
        let incoming = duplex.incoming.clone();
        let opened = duplex.opened.clone();
        tokio::spawn(async move {
            let _ = lost.wait().await;
            opened.reject("peer connection lost before opening");
            incoming.enqueue(None);
        });

        duplex
    }

    async fn wait_open(&self) -> Result<()> {
        self.opened
            .wait()
            .await
            .map_err(|e| ProtocolError::NegotiationFailed(e.to_string()))
    }

    /// Waits until the remote acknowledged everything sent, within
    /// [`CLOSE_DRAIN_TIMEOUT`].
    async fn drain(&self) {
        let drained = tokio::time::timeout(CLOSE_DRAIN_TIMEOUT, async {
            while self.channel.buffered_amount().await > 0 {
                tokio::time::sleep(DRAIN_POLL_INTERVAL).await;
            }
        })
        .await;
        if drained.is_err() {
            tracing::debug!(label = %self.channel.label(), "closing with unacknowledged data");
        }
    }
}

impl Duplex for DataChannelDuplex {
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
            if self.closed.load(Ordering::SeqCst) {
                return Err(ProtocolError::ConnectionClosed("data channel closed".to_string()));
            }
            let mut rest = chunk;
            while !rest.is_empty() {
                let piece = rest.split_to(MAX_MESSAGE_SIZE.min(rest.len()));
                self.channel
                    .send(&piece)
                    .await
                    .map_err(|e| ProtocolError::Transport(format!("failed to send: {}", e)))?;
            }
            Ok(())
        })
    }

    fn close(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            if self.closed.swap(true, Ordering::SeqCst) {
                return Ok(());
            }
            self.incoming.enqueue(None);
            if self.channel.ready_state() == RTCDataChannelState::Open {
                self.drain().await;
            }
            if let Err(e) = self.channel.close().await {
                tracing::debug!(error = %e, "failed to close data channel");
            }
            self.peer_connection.close().await.map_err(|e| {
                ProtocolError::ConnectionClosed(format!("failed to close connection: {}", e))
            })
        })
    }
}

impl Drop for DataChannelDuplex {
    fn drop(&mut self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            close_in_background(self.peer_connection.clone());
        }
    }
}

/// Transport opening WebRTC data channels between hub addresses.
pub struct WebRtcTransport {
    signaling: Arc<Signaling>,
    api: Arc<API>,
}

impl WebRtcTransport {
    pub fn new(hub: Arc<dyn Hub>) -> Result<Self> {
        Self::with_setting_engine(hub, SettingEngine::default())
    }

    /// Builds the transport with custom ICE and networking settings.
    pub fn with_setting_engine(hub: Arc<dyn Hub>, setting_engine: SettingEngine) -> Result<Self> {
        // Create a MediaEngine (required even for data-only connections)
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(negotiation_error("register codecs"))?;

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)
            .map_err(negotiation_error("register interceptors"))?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .with_setting_engine(setting_engine)
            .build();

        Ok(Self {
            signaling: Signaling::new(hub),
            api: Arc::new(api),
        })
    }

    pub fn signaling(&self) -> &Arc<Signaling> {
        &self.signaling
    }

    async fn open(&self, hostname: String, port: u16, local_port: u16) -> Result<TransportChannel> {
        let peer_connection = new_peer_connection(&self.api, self.signaling.hub().as_ref()).await?;
        let pending = PendingConnection::new(&peer_connection);
        let lost = watch_connection_state(&peer_connection);

        let options = RTCDataChannelInit {
            ordered: Some(true),
            ..Default::default()
        };
        let channel = peer_connection
            .create_data_channel(&format!("{}{}", CHANNEL_LABEL_PREFIX, port), Some(options))
            .await
            .map_err(negotiation_error("create data channel"))?;
        let duplex = DataChannelDuplex::new(peer_connection.clone(), channel, lost.clone());

        let offer = peer_connection
            .create_offer(None)
            .await
            .map_err(negotiation_error("create offer"))?;
        let local = set_local_and_gather(&peer_connection, offer).await?;

        let connection = Uuid::new_v4().to_string();
        let answer = self
            .signaling
            .negotiate(&hostname, port, local_port, &connection, Some(local.sdp))
            .await?
            .ok_or_else(|| ProtocolError::NegotiationFailed("answer carries no sdp".to_string()))?;

        let answer = RTCSessionDescription::answer(answer).map_err(negotiation_error("parse answer"))?;
        peer_connection
            .set_remote_description(answer)
            .await
            .map_err(negotiation_error("set remote description"))?;

        unless_lost(&lost, duplex.wait_open()).await?;
        pending.complete();
        tracing::debug!(to = %hostname, port, connection = %connection, "data channel open");
        Ok(TransportChannel {
            channel: duplex,
            remote: Address::new(hostname, port),
        })
    }
}

async fn new_peer_connection(api: &API, hub: &dyn Hub) -> Result<Arc<RTCPeerConnection>> {
    let configuration = RTCConfiguration {
        ice_servers: hub
            .configuration()
            .ice_servers
            .iter()
            .map(RTCIceServer::from)
            .collect(),
        ..Default::default()
    };
    let peer_connection = api
        .new_peer_connection(configuration)
        .await
        .map_err(negotiation_error("create peer connection"))?;
    Ok(Arc::new(peer_connection))
}

/// Applies the local description and waits for ICE gathering to complete,
/// returning the description with every candidate included.
async fn set_local_and_gather(
    peer_connection: &RTCPeerConnection,
    description: RTCSessionDescription,
) -> Result<RTCSessionDescription> {
    let gathered = Deferred::new();
    {
        let gathered = gathered.clone();
        peer_connection.on_ice_gathering_state_change(Box::new(move |state: RTCIceGathererState| {
            if state == RTCIceGathererState::Complete {
                gathered.resolve(());
            }
            Box::pin(async {})
        }));
    }

    peer_connection
        .set_local_description(description)
        .await
        .map_err(negotiation_error("set local description"))?;

    if tokio::time::timeout(ICE_GATHERING_TIMEOUT, gathered.wait())
        .await
        .is_err()
    {
        tracing::warn!("ICE gathering timeout, proceeding with current candidates");
    }

    peer_connection
        .local_description()
        .await
        .ok_or_else(|| ProtocolError::NegotiationFailed("no local description available".into()))
}

async fn answer_offer(
    api: Arc<API>,
    signaling: Arc<Signaling>,
    offer: IncomingOffer,
) -> Result<TransportChannel> {
    let sdp = offer
        .sdp
        .clone()
        .ok_or_else(|| ProtocolError::NegotiationFailed("offer carries no sdp".to_string()))?;
    let peer_connection = new_peer_connection(&api, signaling.hub().as_ref()).await?;
    let pending = PendingConnection::new(&peer_connection);
    let lost = watch_connection_state(&peer_connection);

    // The handler hands over the channel once and keeps no strong reference
    // to the connection.
    let (incoming_tx, incoming_rx) = oneshot::channel::<Arc<DataChannelDuplex>>();
    {
        let mut incoming_tx = Some(incoming_tx);
        let weak = Arc::downgrade(&peer_connection);
        let lost = lost.clone();
        let expected = format!("{}{}", CHANNEL_LABEL_PREFIX, offer.port);
        peer_connection.on_data_channel(Box::new(move |channel: Arc<RTCDataChannel>| {
            if channel.label() != expected {
                tracing::warn!(label = %channel.label(), "unexpected data channel");
            } else if let Some(peer_connection) = weak.upgrade() {
                if let Some(sender) = incoming_tx.take() {
                    let _ = sender.send(DataChannelDuplex::new(peer_connection, channel, lost.clone()));
                }
            }
            Box::pin(async {})
        }));
    }

    let remote = RTCSessionDescription::offer(sdp).map_err(negotiation_error("parse offer"))?;
    peer_connection
        .set_remote_description(remote)
        .await
        .map_err(negotiation_error("set remote description"))?;
    let answer = peer_connection
        .create_answer(None)
        .await
        .map_err(negotiation_error("create answer"))?;
    let local = set_local_and_gather(&peer_connection, answer).await?;
    signaling.answer(&offer, Some(local.sdp))?;

    let opened = async {
        let duplex = incoming_rx.await.map_err(|_| {
            ProtocolError::NegotiationFailed("peer connection closed before channel arrived".to_string())
        })?;
        duplex.wait_open().await?;
        Ok::<_, ProtocolError>(duplex)
    };
    let duplex = tokio::time::timeout(CHANNEL_OPEN_TIMEOUT, unless_lost(&lost, opened))
        .await
        .map_err(|_| {
            ProtocolError::Timeout(format!(
                "data channel from {}:{} did not open within {:?}",
                offer.from, offer.from_port, CHANNEL_OPEN_TIMEOUT
            ))
        })??;

    pending.complete();
    tracing::debug!(from = %offer.from, port = offer.port, "data channel accepted");
    Ok(TransportChannel {
        channel: duplex,
        remote: Address::new(offer.from, offer.from_port),
    })
}

impl Transport for WebRtcTransport {
    fn listen(&self, port: u16) -> Result<Box<dyn TransportListener>> {
        let api = self.api.clone();
        let signaling = self.signaling.clone();
        let listener = OfferListener::bind(&self.signaling, port, move |offer| {
            answer_offer(api.clone(), signaling.clone(), offer)
        })?;
        Ok(Box::new(listener))
    }

    fn connect(
        &self,
        hostname: &str,
        port: u16,
        local_port: u16,
    ) -> BoxFuture<'_, Result<TransportChannel>> {
        Box::pin(self.open(hostname.to_string(), port, local_port))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::{HttpConfig, HttpModule, RequestInit, Response};
    use crate::hub::{HubBus, HubConfiguration, LocalHub};
    use crate::net::{ListenOptions, NetConfig, NetModule};

    const TEST_TIMEOUT: Duration = Duration::from_secs(60);

    /// A transport on `bus` that gathers loopback host candidates only.
    fn loopback_transport(bus: &HubBus) -> (Arc<dyn Hub>, WebRtcTransport) {
        let hub: Arc<dyn Hub> = Arc::new(LocalHub::new(bus, HubConfiguration::default()));
        let mut settings = SettingEngine::default();
        settings.set_include_loopback_candidate(true);
        let transport = WebRtcTransport::with_setting_engine(hub.clone(), settings).unwrap();
        (hub, transport)
    }

    #[test]
    fn test_ice_server_conversion() {
        let server = IceServer {
            urls: vec!["turn:turn.example.com:3478".to_string()],
            username: Some("user".to_string()),
            credential: Some("pass".to_string()),
        };
        let rtc = RTCIceServer::from(&server);
        assert_eq!(rtc.urls, server.urls);
        assert_eq!(rtc.username, "user");
        assert_eq!(rtc.credential, "pass");

        let stun = RTCIceServer::from(&IceServer::stun("stun:stun.example.com:3478"));
        assert!(stun.username.is_empty());
    }

    #[tokio::test]
    async fn test_create_transport_and_bind() {
        let bus = HubBus::new();
        let hub: Arc<dyn Hub> = Arc::new(LocalHub::new(&bus, HubConfiguration::default()));
        let transport = WebRtcTransport::new(hub).unwrap();

        let listener = transport.listen(443).unwrap();
        assert!(matches!(
            transport.listen(443),
            Err(ProtocolError::AddressInUse { port: 443 })
        ));
        listener.close();
        assert!(!transport.signaling().is_bound(443));
    }

    #[tokio::test]
    async fn test_offer_without_sdp_is_refused() {
        let bus = HubBus::new();
        let server_hub: Arc<dyn Hub> = Arc::new(LocalHub::new(&bus, HubConfiguration::default()));
        let client_hub: Arc<dyn Hub> = Arc::new(LocalHub::new(&bus, HubConfiguration::default()));
        let server = WebRtcTransport::new(server_hub.clone()).unwrap();
        let client = Signaling::new(client_hub);

        let _listener = server.listen(5000).unwrap();
        let result = tokio::time::timeout(
            Duration::from_secs(5),
            client.negotiate(server_hub.address(), 5000, 49152, "no-sdp", None),
        )
        .await
        .unwrap();
        assert!(matches!(result, Err(ProtocolError::ConnectionRefused(_))));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_channel_splits_writes_and_reports_close() {
        let bus = HubBus::new();
        let (server_hub, server) = loopback_transport(&bus);
        let (_client_hub, client) = loopback_transport(&bus);
        let listener = server.listen(6000).unwrap();

        let opened = tokio::time::timeout(TEST_TIMEOUT, client.connect(server_hub.address(), 6000, 49152))
            .await
            .unwrap()
            .unwrap();
        let accepted = tokio::time::timeout(TEST_TIMEOUT, listener.accept())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(opened.remote, Address::new(server_hub.address(), 6000));
        assert_eq!(accepted.remote.port, 49152);

        let payload: Vec<u8> = (0..40_000u32).map(|i| (i % 251) as u8).collect();
        opened.channel.write(Bytes::from(payload.clone())).await.unwrap();

        let mut received = Vec::new();
        let mut sizes = Vec::new();
        while received.len() < payload.len() {
            let chunk = accepted.channel.read().await.unwrap().unwrap();
            sizes.push(chunk.len());
            received.extend_from_slice(&chunk);
        }
        assert_eq!(received, payload);
        assert_eq!(sizes, vec![MAX_MESSAGE_SIZE, MAX_MESSAGE_SIZE, 40_000 - 2 * MAX_MESSAGE_SIZE]);

        opened.channel.close().await.unwrap();
        opened.channel.close().await.unwrap();
        let end = tokio::time::timeout(TEST_TIMEOUT, accepted.channel.read())
            .await
            .unwrap()
            .unwrap();
        assert!(end.is_none());
        assert!(accepted.channel.read().await.unwrap().is_none());
        assert!(opened.channel.write(Bytes::from_static(b"late")).await.is_err());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_http_echo_over_data_channels() {
        let bus = HubBus::new();
        let endpoint = |(hub, transport): (Arc<dyn Hub>, WebRtcTransport)| {
            let net = Arc::new(NetModule::new(hub, Arc::new(transport), NetConfig::default()));
            HttpModule::new(net, HttpConfig::default())
        };
        let server = endpoint(loopback_transport(&bus));
        let client = endpoint(loopback_transport(&bus));

        let _listener = server
            .listen(ListenOptions::new(7000), |mut request, _| async move {
                let body = request.body.bytes().await?;
                Ok(Response::new(body))
            })
            .unwrap();

        let payload: Vec<u8> = (0..256_000u32).map(|i| (i.wrapping_mul(31) % 256) as u8).collect();
        let url = format!("http://{}:7000/echo", server.net().address());
        let mut response = tokio::time::timeout(TEST_TIMEOUT, client.fetch(&url, RequestInit::post(payload.clone())))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(response.status, 200);

        let body = tokio::time::timeout(TEST_TIMEOUT, response.bytes())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(body.as_ref(), payload.as_slice());
    }

    #[tokio::test]
    async fn test_abandoned_negotiation_closes_peer_connection() {
        let bus = HubBus::new();
        let (hub, transport) = loopback_transport(&bus);
        let peer_connection = new_peer_connection(&transport.api, hub.as_ref()).await.unwrap();
        let lost = watch_connection_state(&peer_connection);

        drop(PendingConnection::new(&peer_connection));

        let outcome = tokio::time::timeout(Duration::from_secs(5), lost.wait())
            .await
            .unwrap();
        assert!(matches!(outcome, Err(ProtocolError::Rejected(_))));
        assert_eq!(peer_connection.connection_state(), RTCPeerConnectionState::Closed);
    }

    #[tokio::test]
    async fn test_completed_negotiation_keeps_connection() {
        let bus = HubBus::new();
        let (hub, transport) = loopback_transport(&bus);
        let peer_connection = new_peer_connection(&transport.api, hub.as_ref()).await.unwrap();

        PendingConnection::new(&peer_connection).complete();
        tokio::task::yield_now().await;
        assert_ne!(peer_connection.connection_state(), RTCPeerConnectionState::Closed);
        peer_connection.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_lost_connection_fails_pending_wait() {
        let lost = Deferred::new();
        let waiting = {
            let lost = lost.clone();
            tokio::spawn(async move { unless_lost(&lost, std::future::pending::<Result<()>>()).await })
        };

        lost.reject("peer connection failed");
        let result = tokio::time::timeout(Duration::from_secs(5), waiting)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(result, Err(ProtocolError::NegotiationFailed(_))));
    }
}
