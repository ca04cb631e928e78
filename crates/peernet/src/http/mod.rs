//! HTTP over frames.
//!
//! A request is one JSON header frame `{url, method, headers}`, followed for
//! body methods by body frames and the `---REQUEST_END---` marker. The server
//! answers with `---RESPONSE---`, a JSON `{status, statusText, headers}`
//! frame and body frames, then closes; or with `---SOCKET---` after which the
//! stream carries the WebSocket sub-protocol.

mod body;
mod types;
mod websocket;

use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures_util::FutureExt;
use protocol::error::{ProtocolError, Result};
use protocol::messages::{RequestHead, ResponseHead, Signal};
use url::Url;

use crate::frame::FrameDuplex;
use crate::net::{ConnectOptions, ListenOptions, NetListener, NetModule, NetSocket};
use crate::sync::Semaphore;

pub use body::Body;
pub use types::{reason_phrase, ConnectionInfo, Headers, Request, RequestInit, Response};
pub use websocket::{Message, WebSocket, WebSocketEvent};

use types::{method_has_body, UpgradeSlot};

/// Port used when a URL names none.
pub const DEFAULT_PORT: u16 = 80;

/// Default bound on connections served at once per listener.
pub const DEFAULT_MAX_CONCURRENT_CONNECTIONS: usize = 64;

#[derive(Debug, Clone)]
pub struct HttpConfig {
    /// Connections one listener serves concurrently; others wait.
    pub max_concurrent_connections: usize,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            max_concurrent_connections: DEFAULT_MAX_CONCURRENT_CONNECTIONS,
        }
    }
}

/// HTTP client and server on top of a [`NetModule`].
pub struct HttpModule {
    net: Arc<NetModule>,
    config: HttpConfig,
}

/// A bound HTTP port. Dropping it disposes the underlying listener.
pub struct HttpListener {
    listener: NetListener,
}

impl HttpListener {
    pub fn local(&self) -> &protocol::messages::Address {
        self.listener.local()
    }

    pub fn is_disposed(&self) -> bool {
        self.listener.is_disposed()
    }

    /// Idempotent.
    pub fn dispose(&self) {
        self.listener.dispose();
    }
}

impl HttpModule {
    pub fn new(net: Arc<NetModule>, config: HttpConfig) -> Self {
        Self { net, config }
    }

    pub fn net(&self) -> &Arc<NetModule> {
        &self.net
    }

    /// Serves requests on `options.port` with `handler`.
    ///
    /// A handler error or panic becomes a `500 Internal Server Error`
    /// response carrying the error text. A request with a malformed header frame is
    /// dropped by closing the stream without a response.
    pub fn listen<H, Fut>(&self, options: ListenOptions, handler: H) -> Result<HttpListener>
    where
        H: Fn(Request, ConnectionInfo) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Response>> + Send + 'static,
    {
        let semaphore = Semaphore::new(self.config.max_concurrent_connections)?;
        let handler = Arc::new(handler);

        let listener = self.net.listen(options, move |socket| {
            let handler = handler.clone();
            let semaphore = semaphore.clone();
            tokio::spawn(async move {
                let _permit = semaphore.lock().await;
                let local = socket.local().clone();
                let remote = socket.remote().clone();
                let served = AssertUnwindSafe(serve_connection(socket.clone(), handler.as_ref()))
                    .catch_unwind()
                    .await;
                match served {
                    Ok(Ok(())) => return,
                    Ok(Err(e)) if e.is_protocol_violation() => {
                        tracing::warn!(local = %local, remote = %remote, error = %e, "dropping request");
                    }
                    Ok(Err(e)) => {
                        tracing::debug!(local = %local, remote = %remote, error = %e, "connection ended with error");
                    }
                    Err(panic) => {
                        let message = panic_message(panic.as_ref());
                        tracing::error!(local = %local, remote = %remote, panic = %message, "connection task panicked");
                    }
                }
                let _ = socket.close().await;
            });
        })?;

        Ok(HttpListener { listener })
    }

    /// Marks `request` for a WebSocket upgrade and returns the `101`
    /// response the handler should return. Once the handler returns,
    /// `callback` receives the server end of the WebSocket.
    pub fn upgrade<F, Fut>(&self, request: &Request, callback: F) -> Response
    where
        F: FnOnce(WebSocket) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        request
            .upgrade
            .set(Box::new(move |websocket| Box::pin(callback(websocket))));
        Response::switching_protocols(None)
    }

    /// Sends a request to `url` (`http://{hub address}[:port]/path`).
    ///
    /// An upgraded response has status `101` and a populated
    /// [`Response::websocket`].
    pub async fn fetch(&self, url: &str, init: RequestInit) -> Result<Response> {
        let target = Url::parse(url).map_err(|e| ProtocolError::InvalidUrl(format!("{}: {}", url, e)))?;
        let host = target
            .host_str()
            .ok_or_else(|| ProtocolError::InvalidUrl(format!("{}: missing host", url)))?;
        let port = target.port().unwrap_or(DEFAULT_PORT);

        let socket = self
            .net
            .connect(ConnectOptions::new(port).with_hostname(host))
            .await?;

        match exchange(socket.clone(), target.as_str(), init).await {
            Ok(response) => Ok(response),
            Err(e) => {
                let _ = socket.close().await;
                Err(e)
            }
        }
    }

    /// Fetches `url` expecting an upgrade and returns the client WebSocket.
    pub async fn websocket(&self, url: &str) -> Result<WebSocket> {
        let response = self
            .fetch(url, RequestInit::get().with_header("upgrade", "websocket"))
            .await?;
        let status = response.status;
        response.into_websocket().ok_or_else(|| {
            ProtocolError::UnexpectedSignal(format!("expected websocket upgrade, got status {}", status))
        })
    }
}

async fn serve_connection<H, Fut>(socket: NetSocket, handler: &H) -> Result<()>
where
    H: Fn(Request, ConnectionInfo) -> Fut,
    Fut: Future<Output = anyhow::Result<Response>>,
{
    let frames = Arc::new(FrameDuplex::new(Arc::new(socket.clone())));

    let Some(head) = frames.read().await? else {
        tracing::debug!(remote = %socket.remote(), "connection closed before request header");
        return Ok(());
    };
    let head = RequestHead::from_frame(&head)?;
    tracing::debug!(method = %head.method, url = %head.url, remote = %socket.remote(), "request");

    let body = if method_has_body(&head.method) {
        Body::request_frames(frames.clone())
    } else {
        Body::empty()
    };
    let upgrade = UpgradeSlot::default();
    let request = Request {
        url: head.url,
        method: head.method,
        headers: head.headers.into(),
        body,
        upgrade: upgrade.clone(),
    };
    let info = ConnectionInfo {
        local: socket.local().clone(),
        remote: socket.remote().clone(),
    };

    // A panicking handler is answered like a failing one. Either way a
    // registered upgrade is discarded.
    let outcome = AssertUnwindSafe(async move { handler(request, info).await })
        .catch_unwind()
        .await;
    let (response, upgrade) = match outcome {
        Ok(Ok(response)) => (response, upgrade.take()),
        Ok(Err(e)) => {
            tracing::warn!(remote = %socket.remote(), error = %e, "request handler failed");
            (Response::with_status(500).with_body(e.to_string()), None)
        }
        Err(panic) => {
            let message = panic_message(panic.as_ref());
            tracing::error!(remote = %socket.remote(), panic = %message, "request handler panicked");
            let body = format!("request handler panicked: {}", message);
            (Response::with_status(500).with_body(body), None)
        }
    };

    if let Some(callback) = upgrade {
        frames.write(Signal::Socket.to_frame()).await?;
        let websocket = WebSocket::new(frames, socket.local().clone(), socket.remote().clone());
        callback(websocket).await;
        return Ok(());
    }

    frames.write(Signal::Response.to_frame()).await?;
    let Response {
        status,
        status_text,
        headers,
        mut body,
        ..
    } = response;
    let head = ResponseHead {
        status,
        status_text,
        headers: headers.into_wire(),
    };
    frames.write(head.to_frame()?).await?;
    while let Some(chunk) = body.next_chunk().await? {
        frames.write(&chunk).await?;
    }
    frames.close().await
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

async fn exchange(socket: NetSocket, url: &str, init: RequestInit) -> Result<Response> {
    let frames = Arc::new(FrameDuplex::new(Arc::new(socket.clone())));
    let RequestInit {
        method,
        headers,
        mut body,
    } = init;

    let has_body = method_has_body(&method);
    let head = RequestHead {
        url: url.to_string(),
        method,
        headers: headers.into_wire(),
    };
    frames.write(head.to_frame()?).await?;

    if has_body {
        while let Some(chunk) = body.next_chunk().await? {
            frames.write(&chunk).await?;
        }
        frames.write(Signal::RequestEnd.to_frame()).await?;
    }

    let signal = frames
        .read()
        .await?
        .ok_or_else(|| ProtocolError::ConnectionClosed("stream closed before response".to_string()))?;

    match Signal::from_frame(&signal) {
        Some(Signal::Response) => {
            let head = frames.read().await?.ok_or_else(|| {
                ProtocolError::ConnectionClosed("stream closed before response header".to_string())
            })?;
            let head = ResponseHead::from_frame(&head)?;
            Ok(Response {
                status: head.status,
                status_text: head.status_text,
                headers: head.headers.into(),
                body: Body::response_frames(frames),
                websocket: None,
            })
        }
        Some(Signal::Socket) => {
            let websocket = WebSocket::new(frames, socket.local().clone(), socket.remote().clone());
            Ok(Response::switching_protocols(Some(websocket)))
        }
        _ => Err(ProtocolError::UnexpectedSignal(
            String::from_utf8_lossy(&signal).into_owned(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hub::{Hub, HubBus, HubConfiguration, LocalHub};
    use crate::net::NetConfig;
    use crate::transport::{MemorySwitch, MemoryTransport};

    fn http(bus: &HubBus, switch: &MemorySwitch) -> HttpModule {
        let hub: Arc<dyn Hub> = Arc::new(LocalHub::new(bus, HubConfiguration::default()));
        let transport = Arc::new(MemoryTransport::new(hub.clone(), switch.clone()));
        let net = Arc::new(NetModule::new(hub, transport, NetConfig::default()));
        HttpModule::new(net, HttpConfig::default())
    }

    #[tokio::test]
    async fn test_get_with_headers() {
        let http = http(&HubBus::new(), &MemorySwitch::new());
        let _listener = http
            .listen(ListenOptions::new(8000), |request, info| async move {
                assert_eq!(request.method, "GET");
                assert_eq!(info.local.port, 8000);
                let trace = request.headers.get("x-trace").unwrap_or("none").to_string();
                Ok(Response::text(format!("{} {}", request.url, trace)).with_header("X-Reply", "yes"))
            })
            .unwrap();

        let url = format!("http://{}:8000/path?q=1", http.net().address());
        let mut response = http
            .fetch(&url, RequestInit::get().with_header("X-Trace", "t1"))
            .await
            .unwrap();
        assert_eq!(response.status, 200);
        assert_eq!(response.headers.get("x-reply"), Some("yes"));
        assert_eq!(response.text_body().await.unwrap(), format!("{} t1", url));
    }

    #[tokio::test]
    async fn test_default_port_is_80() {
        let http = http(&HubBus::new(), &MemorySwitch::new());
        let _listener = http
            .listen(ListenOptions::new(DEFAULT_PORT), |_, _| async { Ok(Response::text("port 80")) })
            .unwrap();

        let mut response = http
            .fetch(&format!("http://{}/", http.net().address()), RequestInit::get())
            .await
            .unwrap();
        assert_eq!(response.text_body().await.unwrap(), "port 80");
    }

    #[tokio::test]
    async fn test_invalid_url() {
        let http = http(&HubBus::new(), &MemorySwitch::new());
        assert!(matches!(
            http.fetch("not a url", RequestInit::get()).await,
            Err(ProtocolError::InvalidUrl(_))
        ));
    }

    #[tokio::test]
    async fn test_zero_concurrency_is_rejected() {
        let bus = HubBus::new();
        let hub: Arc<dyn Hub> = Arc::new(LocalHub::new(&bus, HubConfiguration::default()));
        let transport = Arc::new(MemoryTransport::new(hub.clone(), MemorySwitch::new()));
        let net = Arc::new(NetModule::new(hub, transport, NetConfig::default()));
        let http = HttpModule::new(
            net,
            HttpConfig {
                max_concurrent_connections: 0,
            },
        );

        assert!(matches!(
            http.listen(ListenOptions::new(1), |_, _| async { Ok(Response::text("")) }),
            Err(ProtocolError::InvalidConcurrency(0))
        ));
    }

    #[tokio::test]
    async fn test_websocket_requires_upgrade() {
        let http = http(&HubBus::new(), &MemorySwitch::new());
        let _listener = http
            .listen(ListenOptions::new(8001), |_, _| async { Ok(Response::text("plain")) })
            .unwrap();

        let result = http
            .websocket(&format!("http://{}:8001/", http.net().address()))
            .await;
        assert!(matches!(result, Err(ProtocolError::UnexpectedSignal(_))));
    }
}
