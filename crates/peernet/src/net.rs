//! Virtual sockets addressed by `(hub address, port)`.
//!
//! [`NetModule`] binds listeners and opens connections through a
//! [`Transport`]; every channel is wrapped in a [`NetSocket`] carrying its
//! local and remote [`Address`].

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures_util::future::BoxFuture;
use protocol::error::{ProtocolError, Result};
use protocol::messages::Address;
use tokio_util::sync::CancellationToken;

use crate::hub::Hub;
use crate::io::Duplex;
use crate::sync::Mutex;
use crate::transport::{Transport, TransportListener};

/// Hostname that always means this endpoint.
pub const LOCALHOST: &str = "localhost";

/// Default ephemeral port range start (IANA dynamic ports).
pub const DEFAULT_EPHEMERAL_PORT_START: u16 = 49152;

/// Default timeout for transport negotiation.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Runtime settings of the net module.
#[derive(Debug, Clone)]
pub struct NetConfig {
    /// How long `connect` waits for the peer before failing with `Timeout`.
    pub connect_timeout: Duration,
    /// First port handed out to outgoing connections.
    pub ephemeral_port_start: u16,
}

impl Default for NetConfig {
    fn default() -> Self {
        Self {
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            ephemeral_port_start: DEFAULT_EPHEMERAL_PORT_START,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListenOptions {
    pub port: u16,
}

impl ListenOptions {
    pub fn new(port: u16) -> Self {
        Self { port }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectOptions {
    /// Hub address of the peer; `None`, `"localhost"` and `"127.0.0.1"`
    /// mean this endpoint.
    pub hostname: Option<String>,
    pub port: u16,
}

impl ConnectOptions {
    pub fn new(port: u16) -> Self {
        Self {
            hostname: None,
            port,
        }
    }

    pub fn with_hostname(mut self, hostname: impl Into<String>) -> Self {
        self.hostname = Some(hostname.into());
        self
    }
}

/// Entry point for virtual sockets.
pub struct NetModule {
    hub: Arc<dyn Hub>,
    transport: Arc<dyn Transport>,
    config: NetConfig,
    next_port: AtomicU16,
}

impl NetModule {
    pub fn new(hub: Arc<dyn Hub>, transport: Arc<dyn Transport>, config: NetConfig) -> Self {
        let next_port = AtomicU16::new(config.ephemeral_port_start);
        Self {
            hub,
            transport,
            config,
            next_port,
        }
    }

    pub fn hub(&self) -> &Arc<dyn Hub> {
        &self.hub
    }

    /// This endpoint's hub address.
    pub fn address(&self) -> &str {
        self.hub.address()
    }

    pub fn config(&self) -> &NetConfig {
        &self.config
    }

    /// Binds `options.port` and calls `accept` with every inbound socket.
    ///
    /// Binding is synchronous: a port already bound fails immediately with
    /// `AddressInUse`.
    pub fn listen<F>(&self, options: ListenOptions, accept: F) -> Result<NetListener>
    where
        F: Fn(NetSocket) + Send + Sync + 'static,
    {
        let listener: Arc<dyn TransportListener> = Arc::from(self.transport.listen(options.port)?);
        let local = Address::new(self.address(), options.port);
        let shutdown = CancellationToken::new();

        {
            let listener = listener.clone();
            let local = local.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                loop {
                    let accepted = tokio::select! {
                        _ = shutdown.cancelled() => break,
                        accepted = listener.accept() => accepted,
                    };
                    let Some(accepted) = accepted else {
                        break;
                    };
                    tracing::debug!(local = %local, remote = %accepted.remote, "accepted connection");
                    accept(NetSocket::new(accepted.channel, local.clone(), accepted.remote));
                }
                tracing::debug!(local = %local, "accept loop stopped");
            });
        }

        tracing::info!(local = %local, "listening");
        Ok(NetListener {
            local,
            listener,
            disposed: AtomicBool::new(false),
            shutdown,
        })
    }

    /// Opens a socket to `options.hostname:options.port`.
    pub async fn connect(&self, options: ConnectOptions) -> Result<NetSocket> {
        let hostname = self.resolve(options.hostname.as_deref());
        let local_port = self.allocate_port();
        let target = Address::new(hostname, options.port);

        tracing::debug!(target = %target, local_port, "connecting");
        let channel = tokio::time::timeout(
            self.config.connect_timeout,
            self.transport
                .connect(&target.hostname, target.port, local_port),
        )
        .await
        .map_err(|_| {
            ProtocolError::Timeout(format!(
                "connecting to {} after {:?}",
                target, self.config.connect_timeout
            ))
        })??;

        Ok(NetSocket::new(
            channel.channel,
            Address::new(self.address(), local_port),
            channel.remote,
        ))
    }

    fn resolve(&self, hostname: Option<&str>) -> String {
        match hostname {
            None | Some(LOCALHOST) | Some("127.0.0.1") => self.address().to_string(),
            Some(hostname) => hostname.to_string(),
        }
    }

    fn allocate_port(&self) -> u16 {
        let start = self.config.ephemeral_port_start;
        self.next_port
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |port| {
                Some(if port == u16::MAX { start } else { port + 1 })
            })
            .unwrap_or(start)
    }
}

/// A bound port. Dropping the listener disposes it.
pub struct NetListener {
    local: Address,
    listener: Arc<dyn TransportListener>,
    disposed: AtomicBool,
    shutdown: CancellationToken,
}

impl NetListener {
    pub fn local(&self) -> &Address {
        &self.local
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    /// Stops accepting and releases the port. Sockets already accepted are
    /// left open. Idempotent.
    pub fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.shutdown.cancel();
        self.listener.close();
        tracing::info!(local = %self.local, "listener disposed");
    }
}

impl Drop for NetListener {
    fn drop(&mut self) {
        self.dispose();
    }
}

struct SocketInner {
    channel: Arc<dyn Duplex>,
    local: Address,
    remote: Address,
    read_lock: Mutex,
    write_lock: Mutex,
    closed: AtomicBool,
}

/// A connected virtual socket. Clones share the same connection.
#[derive(Clone)]
pub struct NetSocket {
    inner: Arc<SocketInner>,
}

impl fmt::Debug for NetSocket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NetSocket")
            .field("local", &self.inner.local)
            .field("remote", &self.inner.remote)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl NetSocket {
    pub fn new(channel: Arc<dyn Duplex>, local: Address, remote: Address) -> Self {
        Self {
            inner: Arc::new(SocketInner {
                channel,
                local,
                remote,
                read_lock: Mutex::new(),
                write_lock: Mutex::new(),
                closed: AtomicBool::new(false),
            }),
        }
    }

    pub fn local(&self) -> &Address {
        &self.inner.local
    }

    pub fn remote(&self) -> &Address {
        &self.inner.remote
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(ProtocolError::SocketClosed(format!(
                "{} -> {}",
                self.inner.local, self.inner.remote
            )));
        }
        Ok(())
    }

    /// Reads the next chunk; `None` once the peer closed.
    pub async fn read(&self) -> Result<Option<Bytes>> {
        self.ensure_open()?;
        let _guard = self.inner.read_lock.lock().await;
        self.ensure_open()?;
        self.inner.channel.read().await
    }

    pub async fn write(&self, chunk: Bytes) -> Result<()> {
        self.ensure_open()?;
        let _guard = self.inner.write_lock.lock().await;
        self.ensure_open()?;
        self.inner.channel.write(chunk).await
    }

    /// Closes the connection. Idempotent.
    pub async fn close(&self) -> Result<()> {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        tracing::debug!(local = %self.inner.local, remote = %self.inner.remote, "socket closed");
        self.inner.channel.close().await
    }
}

impl Duplex for NetSocket {
    fn read(&self) -> BoxFuture<'_, Result<Option<Bytes>>> {
        Box::pin(NetSocket::read(self))
    }

    fn write(&self, chunk: Bytes) -> BoxFuture<'_, Result<()>> {
        Box::pin(NetSocket::write(self, chunk))
    }

    fn close(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(NetSocket::close(self))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hub::{HubBus, HubConfiguration, LocalHub};
    use crate::transport::{MemorySwitch, MemoryTransport};
    use tokio::sync::mpsc;

    fn net(bus: &HubBus, switch: &MemorySwitch, config: NetConfig) -> NetModule {
        let hub: Arc<dyn Hub> = Arc::new(LocalHub::new(bus, HubConfiguration::default()));
        let transport = Arc::new(MemoryTransport::new(hub.clone(), switch.clone()));
        NetModule::new(hub, transport, config)
    }

    fn accepted() -> (
        impl Fn(NetSocket) + Send + Sync + 'static,
        mpsc::UnboundedReceiver<NetSocket>,
    ) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            move |socket| {
                let _ = tx.send(socket);
            },
            rx,
        )
    }

    #[tokio::test]
    async fn test_connect_to_self_via_localhost() {
        let net = net(&HubBus::new(), &MemorySwitch::new(), NetConfig::default());
        let (accept, mut sockets) = accepted();
        let _listener = net.listen(ListenOptions::new(3000), accept).unwrap();

        let client = net.connect(ConnectOptions::new(3000)).await.unwrap();
        let server = sockets.recv().await.unwrap();

        assert_eq!(client.remote(), &Address::new(net.address(), 3000));
        assert_eq!(client.local().hostname, net.address());
        assert_eq!(client.local().port, DEFAULT_EPHEMERAL_PORT_START);
        assert_eq!(server.local(), &Address::new(net.address(), 3000));
        assert_eq!(server.remote(), client.local());

        client.write(Bytes::from_static(b"hi")).await.unwrap();
        assert_eq!(server.read().await.unwrap().unwrap(), &b"hi"[..]);
    }

    #[tokio::test]
    async fn test_ephemeral_ports_increment() {
        let net = net(&HubBus::new(), &MemorySwitch::new(), NetConfig::default());
        let (accept, _sockets) = accepted();
        let _listener = net.listen(ListenOptions::new(3001), accept).unwrap();

        let first = net
            .connect(ConnectOptions::new(3001).with_hostname("127.0.0.1"))
            .await
            .unwrap();
        let second = net
            .connect(ConnectOptions::new(3001).with_hostname(LOCALHOST))
            .await
            .unwrap();
        assert_eq!(second.local().port, first.local().port + 1);
    }

    #[tokio::test]
    async fn test_listen_twice_fails_synchronously() {
        let net = net(&HubBus::new(), &MemorySwitch::new(), NetConfig::default());
        let (accept, _sockets) = accepted();
        let _listener = net.listen(ListenOptions::new(4000), accept).unwrap();

        let (accept, _sockets) = accepted();
        assert!(matches!(
            net.listen(ListenOptions::new(4000), accept),
            Err(ProtocolError::AddressInUse { port: 4000 })
        ));
    }

    #[tokio::test]
    async fn test_dispose_is_idempotent_and_keeps_accepted_sockets() {
        let net = net(&HubBus::new(), &MemorySwitch::new(), NetConfig::default());
        let (accept, mut sockets) = accepted();
        let listener = net.listen(ListenOptions::new(4100), accept).unwrap();

        let client = net.connect(ConnectOptions::new(4100)).await.unwrap();
        let server = sockets.recv().await.unwrap();

        listener.dispose();
        listener.dispose();
        assert!(listener.is_disposed());

        client.write(Bytes::from_static(b"still open")).await.unwrap();
        assert_eq!(server.read().await.unwrap().unwrap(), &b"still open"[..]);

        let refused = net.connect(ConnectOptions::new(4100)).await;
        assert!(matches!(refused, Err(ProtocolError::ConnectionRefused(_))));
    }

    #[tokio::test]
    async fn test_connect_times_out_without_answer() {
        let config = NetConfig {
            connect_timeout: Duration::from_millis(50),
            ..Default::default()
        };
        let net = net(&HubBus::new(), &MemorySwitch::new(), config);

        // Nobody owns this address, so no answer or reject ever arrives.
        let result = net
            .connect(ConnectOptions::new(80).with_hostname("unknown-peer"))
            .await;
        assert!(matches!(result, Err(ProtocolError::Timeout(_))));
    }

    #[tokio::test]
    async fn test_socket_close_semantics() {
        let net = net(&HubBus::new(), &MemorySwitch::new(), NetConfig::default());
        let (accept, mut sockets) = accepted();
        let _listener = net.listen(ListenOptions::new(4200), accept).unwrap();

        let client = net.connect(ConnectOptions::new(4200)).await.unwrap();
        let server = sockets.recv().await.unwrap();

        client.close().await.unwrap();
        client.close().await.unwrap();
        assert!(client.is_closed());
        assert!(matches!(
            client.write(Bytes::from_static(b"x")).await,
            Err(ProtocolError::SocketClosed(_))
        ));
        assert!(matches!(
            client.read().await,
            Err(ProtocolError::SocketClosed(_))
        ));

        // The peer sees end-of-stream.
        assert!(server.read().await.unwrap().is_none());
    }
}
