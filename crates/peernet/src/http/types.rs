//! Request, response and header types.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Mutex as StdMutex, PoisonError};

use futures_util::future::BoxFuture;
use protocol::error::Result;
use protocol::messages::Address;

use super::body::Body;
use super::websocket::WebSocket;

/// Case-insensitive header map; names are stored lowercase.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers(BTreeMap<String, String>);

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.0.get(&name.to_ascii_lowercase()).map(String::as_str)
    }

    pub fn insert(&mut self, name: impl AsRef<str>, value: impl Into<String>) -> Option<String> {
        self.0.insert(name.as_ref().to_ascii_lowercase(), value.into())
    }

    pub fn remove(&mut self, name: &str) -> Option<String> {
        self.0.remove(&name.to_ascii_lowercase())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.0.contains_key(&name.to_ascii_lowercase())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub(crate) fn into_wire(self) -> BTreeMap<String, String> {
        self.0
    }
}

impl From<BTreeMap<String, String>> for Headers {
    fn from(map: BTreeMap<String, String>) -> Self {
        map.into_iter().collect()
    }
}

impl<K: AsRef<str>, V: Into<String>> FromIterator<(K, V)> for Headers {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut headers = Headers::new();
        for (name, value) in iter {
            headers.insert(name, value);
        }
        headers
    }
}

/// Addresses of both ends of the connection a request arrived on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionInfo {
    pub local: Address,
    pub remote: Address,
}

pub(crate) type UpgradeCallback = Box<dyn FnOnce(WebSocket) -> BoxFuture<'static, ()> + Send>;

/// Where `HttpModule::upgrade` leaves the WebSocket callback for the
/// connection serving the request.
#[derive(Clone, Default)]
pub(crate) struct UpgradeSlot(Arc<StdMutex<Option<UpgradeCallback>>>);

impl UpgradeSlot {
    pub(crate) fn set(&self, callback: UpgradeCallback) {
        *self.0.lock().unwrap_or_else(PoisonError::into_inner) = Some(callback);
    }

    pub(crate) fn take(&self) -> Option<UpgradeCallback> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner).take()
    }
}

/// An inbound request as seen by a handler.
pub struct Request {
    pub url: String,
    pub method: String,
    pub headers: Headers,
    pub body: Body,
    pub(crate) upgrade: UpgradeSlot,
}

impl fmt::Debug for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Request")
            .field("url", &self.url)
            .field("method", &self.method)
            .field("headers", &self.headers)
            .finish_non_exhaustive()
    }
}

impl Request {
    pub async fn text(&mut self) -> Result<String> {
        self.body.text().await
    }
}

/// Options of an outgoing request.
#[derive(Debug)]
pub struct RequestInit {
    pub method: String,
    pub headers: Headers,
    pub body: Body,
}

impl Default for RequestInit {
    fn default() -> Self {
        Self {
            method: "GET".to_string(),
            headers: Headers::new(),
            body: Body::empty(),
        }
    }
}

impl RequestInit {
    pub fn get() -> Self {
        Self::default()
    }

    pub fn post(body: impl Into<Body>) -> Self {
        Self {
            method: "POST".to_string(),
            body: body.into(),
            ..Default::default()
        }
    }

    pub fn with_method(mut self, method: impl Into<String>) -> Self {
        self.method = method.into();
        self
    }

    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.insert(name, value);
        self
    }
}

/// Whether requests with this method carry a body.
pub(crate) fn method_has_body(method: &str) -> bool {
    !(method.eq_ignore_ascii_case("GET") || method.eq_ignore_ascii_case("HEAD"))
}

/// Reason phrase for common status codes.
pub fn reason_phrase(status: u16) -> &'static str {
    match status {
        101 => "Switching Protocols",
        200 => "OK",
        201 => "Created",
        204 => "No Content",
        301 => "Moved Permanently",
        302 => "Found",
        304 => "Not Modified",
        400 => "Bad Request",
        401 => "Unauthorized",
        403 => "Forbidden",
        404 => "Not Found",
        405 => "Method Not Allowed",
        409 => "Conflict",
        500 => "Internal Server Error",
        501 => "Not Implemented",
        502 => "Bad Gateway",
        503 => "Service Unavailable",
        _ => "",
    }
}

/// A response produced by a handler or received by `fetch`.
pub struct Response {
    pub status: u16,
    pub status_text: String,
    pub headers: Headers,
    pub body: Body,
    pub(crate) websocket: Option<WebSocket>,
}

impl fmt::Debug for Response {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Response")
            .field("status", &self.status)
            .field("status_text", &self.status_text)
            .field("headers", &self.headers)
            .field("websocket", &self.websocket.is_some())
            .finish_non_exhaustive()
    }
}

impl Response {
    /// `200 OK` with the given body.
    pub fn new(body: impl Into<Body>) -> Self {
        Self {
            status: 200,
            status_text: reason_phrase(200).to_string(),
            headers: Headers::new(),
            body: body.into(),
            websocket: None,
        }
    }

    /// `200 OK` with a plain text body.
    pub fn text(text: impl Into<String>) -> Self {
        let mut response = Self::new(text.into());
        response
            .headers
            .insert("content-type", "text/plain; charset=utf-8");
        response
    }

    /// Empty response with `status` and its reason phrase.
    pub fn with_status(status: u16) -> Self {
        Self {
            status,
            status_text: reason_phrase(status).to_string(),
            ..Self::new(Body::empty())
        }
    }

    pub fn with_body(mut self, body: impl Into<Body>) -> Self {
        self.body = body.into();
        self
    }

    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.insert(name, value);
        self
    }

    pub(crate) fn switching_protocols(websocket: Option<WebSocket>) -> Self {
        Self {
            websocket,
            ..Self::with_status(101)
        }
    }

    pub fn ok(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// The client WebSocket of an upgraded `fetch`.
    pub fn websocket(&self) -> Option<&WebSocket> {
        self.websocket.as_ref()
    }

    pub fn into_websocket(self) -> Option<WebSocket> {
        self.websocket
    }

    pub async fn bytes(&mut self) -> Result<bytes::Bytes> {
        self.body.bytes().await
    }

    pub async fn text_body(&mut self) -> Result<String> {
        self.body.text().await
    }
}
