//! End-to-end tests for the peernet stack.
//!
//! These tests verify complete flows over the in-memory transport:
//! - HTTP request/response, bodies and concurrency limits
//! - WebSocket upgrade and echo
//! - Connection failures (refused, timeout, malformed requests)
//! - Remote hubs routed through an in-process relay

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use peernet::frame::FrameDuplex;
use peernet::http::{
    Body, HttpConfig, HttpModule, Message, RequestInit, Response, WebSocketEvent,
};
use peernet::hub::{Hub, HubBus, HubConfiguration, LocalHub, RemoteHub, RemoteHubConfig};
use peernet::net::{ConnectOptions, ListenOptions, NetConfig, NetModule};
use peernet::relay::RelayServer;
use peernet::transport::{MemorySwitch, MemoryTransport};
use protocol::messages::Signal;
use protocol::ProtocolError;
use rand::Rng;

/// One endpoint attached to a shared bus and switch.
fn endpoint(bus: &HubBus, switch: &MemorySwitch) -> Arc<HttpModule> {
    endpoint_with(bus, switch, NetConfig::default(), HttpConfig::default(), None)
}

fn endpoint_with(
    bus: &HubBus,
    switch: &MemorySwitch,
    net_config: NetConfig,
    http_config: HttpConfig,
    max_message_size: Option<usize>,
) -> Arc<HttpModule> {
    let hub: Arc<dyn Hub> = Arc::new(LocalHub::new(bus, HubConfiguration::default()));
    let mut transport = MemoryTransport::new(hub.clone(), switch.clone());
    if let Some(size) = max_message_size {
        transport = transport.with_max_message_size(size);
    }
    let net = Arc::new(NetModule::new(hub, Arc::new(transport), net_config));
    Arc::new(HttpModule::new(net, http_config))
}

fn random_payload(len: usize) -> Vec<u8> {
    let mut payload = vec![0u8; len];
    rand::thread_rng().fill(&mut payload[..]);
    payload
}

fn echo_listener(http: &HttpModule, port: u16) -> peernet::http::HttpListener {
    http.listen(ListenOptions::new(port), |mut request, _| async move {
        let body = request.body.bytes().await?;
        Ok(Response::new(body).with_header("x-method", request.method.clone()))
    })
    .unwrap()
}

// =============================================================================
// HTTP Tests
// =============================================================================

#[tokio::test]
async fn test_hello_on_localhost() {
    let http = endpoint(&HubBus::new(), &MemorySwitch::new());
    let _listener = http
        .listen(ListenOptions::new(5000), |_, _| async { Ok(Response::text("Hello")) })
        .unwrap();

    let mut response = http
        .fetch("http://localhost:5000/", RequestInit::get())
        .await
        .unwrap();

    assert_eq!(response.status, 200);
    assert_eq!(response.status_text, "OK");
    assert_eq!(response.text_body().await.unwrap(), "Hello");
}

#[tokio::test]
async fn test_fetch_between_endpoints() {
    let bus = HubBus::new();
    let switch = MemorySwitch::new();
    let server = endpoint(&bus, &switch);
    let client = endpoint(&bus, &switch);

    let _listener = server
        .listen(ListenOptions::new(8080), |_, info| async move {
            Ok(Response::text(format!("hello {}", info.remote.hostname)))
        })
        .unwrap();

    let url = format!("http://{}:8080/", server.net().address());
    let mut response = client.fetch(&url, RequestInit::get()).await.unwrap();
    assert_eq!(
        response.text_body().await.unwrap(),
        format!("hello {}", client.net().address())
    );
}

#[tokio::test]
async fn test_echo_large_random_body() {
    let bus = HubBus::new();
    let switch = MemorySwitch::new();
    let server = endpoint(&bus, &switch);
    let client = endpoint(&bus, &switch);
    let _listener = echo_listener(&server, 7000);

    let payload = random_payload(256_000);
    let url = format!("http://{}:7000/echo", server.net().address());
    let mut response = client
        .fetch(&url, RequestInit::post(payload.clone()))
        .await
        .unwrap();

    assert_eq!(response.headers.get("x-method"), Some("POST"));
    assert_eq!(response.bytes().await.unwrap().as_ref(), payload.as_slice());
}

#[tokio::test]
async fn test_echo_over_fragmenting_transport() {
    let bus = HubBus::new();
    let switch = MemorySwitch::new();
    let server = endpoint_with(&bus, &switch, NetConfig::default(), HttpConfig::default(), Some(7));
    let client = endpoint_with(&bus, &switch, NetConfig::default(), HttpConfig::default(), Some(7));
    let _listener = echo_listener(&server, 7001);

    let payload = random_payload(10_000);
    let url = format!("http://{}:7001/", server.net().address());
    let mut response = client
        .fetch(&url, RequestInit::post(payload.clone()).with_method("PUT"))
        .await
        .unwrap();

    assert_eq!(response.headers.get("x-method"), Some("PUT"));
    assert_eq!(response.bytes().await.unwrap().as_ref(), payload.as_slice());
}

#[tokio::test]
async fn test_streamed_request_body() {
    let http = endpoint(&HubBus::new(), &MemorySwitch::new());
    let _listener = echo_listener(&http, 7002);

    let (tx, body) = Body::channel(4);
    tokio::spawn(async move {
        for part in ["one ", "two ", "three"] {
            tx.send(bytes::Bytes::from_static(part.as_bytes())).await.unwrap();
        }
    });

    let mut init = RequestInit::post(Body::empty());
    init.body = body;
    let mut response = http.fetch("http://localhost:7002/", init).await.unwrap();
    assert_eq!(response.text_body().await.unwrap(), "one two three");
}

#[tokio::test]
async fn test_handler_error_returns_500() {
    let http = endpoint(&HubBus::new(), &MemorySwitch::new());
    let _listener = http
        .listen(ListenOptions::new(9000), |_, _| async {
            Err::<Response, _>(anyhow::anyhow!("database unavailable"))
        })
        .unwrap();

    let mut response = http
        .fetch("http://localhost:9000/", RequestInit::get())
        .await
        .unwrap();
    assert_eq!(response.status, 500);
    assert_eq!(response.status_text, "Internal Server Error");
    assert!(response.text_body().await.unwrap().contains("database unavailable"));
}

#[tokio::test]
async fn test_handler_panic_returns_500() {
    let http = endpoint(&HubBus::new(), &MemorySwitch::new());
    let _listener = http
        .listen(ListenOptions::new(9001), |request, _| async move {
            if request.url.ends_with("/boom") {
                panic!("handler bug");
            }
            Ok(Response::text("fine"))
        })
        .unwrap();

    let mut response = tokio::time::timeout(
        Duration::from_secs(5),
        http.fetch("http://localhost:9001/boom", RequestInit::get()),
    )
    .await
    .expect("fetch should not hang after a handler panic")
    .unwrap();
    assert_eq!(response.status, 500);
    assert!(response.text_body().await.unwrap().contains("handler bug"));

    // The listener keeps serving.
    let mut response = http
        .fetch("http://localhost:9001/ok", RequestInit::get())
        .await
        .unwrap();
    assert_eq!(response.text_body().await.unwrap(), "fine");
}

#[tokio::test]
async fn test_failed_handler_discards_upgrade() {
    let http = endpoint(&HubBus::new(), &MemorySwitch::new());
    let upgraded = Arc::new(AtomicUsize::new(0));
    let _listener = {
        let server_http = http.clone();
        let upgraded = upgraded.clone();
        http.listen(ListenOptions::new(9002), move |request, _| {
            let server_http = server_http.clone();
            let upgraded = upgraded.clone();
            async move {
                let _ = server_http.upgrade(&request, move |_socket| async move {
                    upgraded.fetch_add(1, Ordering::SeqCst);
                });
                Err::<Response, _>(anyhow::anyhow!("upgrade refused"))
            }
        })
        .unwrap()
    };

    let mut response = http
        .fetch("http://localhost:9002/ws", RequestInit::get())
        .await
        .unwrap();
    assert_eq!(response.status, 500);
    assert!(response.websocket().is_none());
    assert!(response.text_body().await.unwrap().contains("upgrade refused"));
    assert_eq!(upgraded.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_listener_dispose_twice() {
    let http = endpoint(&HubBus::new(), &MemorySwitch::new());
    let listener = http
        .listen(ListenOptions::new(6000), |_, _| async { Ok(Response::text("up")) })
        .unwrap();

    listener.dispose();
    listener.dispose();
    assert!(listener.is_disposed());

    let result = http.fetch("http://localhost:6000/", RequestInit::get()).await;
    assert!(matches!(result, Err(ProtocolError::ConnectionRefused(_))));

    // The port can be bound again.
    let _again = http
        .listen(ListenOptions::new(6000), |_, _| async { Ok(Response::text("again")) })
        .unwrap();
    let mut response = http
        .fetch("http://localhost:6000/", RequestInit::get())
        .await
        .unwrap();
    assert_eq!(response.text_body().await.unwrap(), "again");
}

#[tokio::test]
async fn test_listen_conflict() {
    let http = endpoint(&HubBus::new(), &MemorySwitch::new());
    let _listener = http
        .listen(ListenOptions::new(6001), |_, _| async { Ok(Response::text("")) })
        .unwrap();

    let second = http.listen(ListenOptions::new(6001), |_, _| async { Ok(Response::text("")) });
    assert!(matches!(second, Err(ProtocolError::AddressInUse { port: 6001 })));
}

#[tokio::test]
async fn test_concurrency_limit() {
    let http = endpoint_with(
        &HubBus::new(),
        &MemorySwitch::new(),
        NetConfig::default(),
        HttpConfig {
            max_concurrent_connections: 1,
        },
        None,
    );
    let active = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));

    let _listener = {
        let active = active.clone();
        let peak = peak.clone();
        http.listen(ListenOptions::new(6002), move |_, _| {
            let active = active.clone();
            let peak = peak.clone();
            async move {
                let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(20)).await;
                active.fetch_sub(1, Ordering::SeqCst);
                Ok(Response::text("done"))
            }
        })
        .unwrap()
    };

    let mut tasks = Vec::new();
    for _ in 0..4 {
        let http = http.clone();
        tasks.push(tokio::spawn(async move {
            let mut response = http
                .fetch("http://localhost:6002/", RequestInit::get())
                .await
                .unwrap();
            response.text_body().await.unwrap()
        }));
    }
    for task in tasks {
        assert_eq!(task.await.unwrap(), "done");
    }
    assert_eq!(peak.load(Ordering::SeqCst), 1);
}

// =============================================================================
// Protocol Violation Tests
// =============================================================================

#[tokio::test]
async fn test_malformed_request_header_closes_stream() {
    let http = endpoint(&HubBus::new(), &MemorySwitch::new());
    let _listener = http
        .listen(ListenOptions::new(4000), |_, _| async { Ok(Response::text("never")) })
        .unwrap();

    let socket = http.net().connect(ConnectOptions::new(4000)).await.unwrap();
    let frames = FrameDuplex::new(Arc::new(socket));
    frames.write(br#"{"url": 42, "method": "GET"}"#).await.unwrap();

    let reply = tokio::time::timeout(Duration::from_secs(5), frames.read())
        .await
        .unwrap()
        .unwrap();
    assert!(reply.is_none());
}

#[tokio::test]
async fn test_unexpected_signal_from_server() {
    let bus = HubBus::new();
    let switch = MemorySwitch::new();
    let http = endpoint(&bus, &switch);

    // A raw net listener that answers with something other than a signal.
    let _listener = http
        .net()
        .listen(ListenOptions::new(4001), |socket| {
            tokio::spawn(async move {
                let frames = FrameDuplex::new(Arc::new(socket));
                let _head = frames.read().await;
                let _ = frames.write(b"---NOT_A_SIGNAL---").await;
            });
        })
        .unwrap();

    let result = http.fetch("http://localhost:4001/", RequestInit::get()).await;
    assert!(matches!(result, Err(ProtocolError::UnexpectedSignal(_))));
}

#[tokio::test]
async fn test_get_sends_no_request_end() {
    let http = endpoint(&HubBus::new(), &MemorySwitch::new());
    let (seen_tx, mut seen_rx) = tokio::sync::mpsc::unbounded_channel();

    let _listener = http
        .net()
        .listen(ListenOptions::new(4002), move |socket| {
            let seen_tx = seen_tx.clone();
            tokio::spawn(async move {
                let frames = FrameDuplex::new(Arc::new(socket));
                let head = frames.read().await.unwrap().unwrap();
                // The client waits for the response; anything it sent after
                // the header would be readable now.
                let extra = tokio::time::timeout(Duration::from_millis(50), frames.read()).await;
                seen_tx.send((head, extra.is_err())).unwrap();
                frames.write(Signal::Response.to_frame()).await.unwrap();
                frames
                    .write(br#"{"status": 204, "statusText": "No Content", "headers": {}}"#)
                    .await
                    .unwrap();
                frames.close().await.unwrap();
            });
        })
        .unwrap();

    let mut response = http
        .fetch("http://localhost:4002/x", RequestInit::get())
        .await
        .unwrap();
    assert_eq!(response.status, 204);
    assert!(response.bytes().await.unwrap().is_empty());

    let (head, nothing_else) = seen_rx.recv().await.unwrap();
    let head: serde_json::Value = serde_json::from_slice(&head).unwrap();
    assert_eq!(head["method"], "GET");
    assert_eq!(head["url"], "http://localhost:4002/x");
    assert!(nothing_else);
}

// =============================================================================
// WebSocket Tests
// =============================================================================

#[tokio::test]
async fn test_websocket_echo() {
    let bus = HubBus::new();
    let switch = MemorySwitch::new();
    let server = endpoint(&bus, &switch);
    let client = endpoint(&bus, &switch);

    let _listener = {
        let server_http = server.clone();
        server
            .listen(ListenOptions::new(3000), move |request, _| {
                let server_http = server_http.clone();
                async move {
                    Ok(server_http.upgrade(&request, |socket| async move {
                        while let Ok(Some(event)) = socket.recv().await {
                            match event {
                                WebSocketEvent::Message(message) => {
                                    if socket.send(message).await.is_err() {
                                        break;
                                    }
                                }
                                WebSocketEvent::Ping(payload) => {
                                    let _ = socket.pong(payload).await;
                                }
                                WebSocketEvent::Pong(_) => {}
                                WebSocketEvent::Close => break,
                            }
                        }
                    }))
                }
            })
            .unwrap()
    };

    let url = format!("http://{}:3000/ws", server.net().address());
    let socket = client.websocket(&url).await.unwrap();
    assert_eq!(socket.remote().hostname, server.net().address());

    socket.send_text("hello").await.unwrap();
    assert_eq!(
        socket.recv().await.unwrap(),
        Some(WebSocketEvent::Message(Message::Text("hello".to_string())))
    );

    socket.send_binary(vec![0u8, 1, 2, 255]).await.unwrap();
    assert_eq!(
        socket.recv().await.unwrap(),
        Some(WebSocketEvent::Message(Message::Binary(bytes::Bytes::from_static(&[
            0, 1, 2, 255
        ]))))
    );

    socket.ping(&b"are you there"[..]).await.unwrap();
    assert_eq!(
        socket.recv().await.unwrap(),
        Some(WebSocketEvent::Pong(bytes::Bytes::from_static(b"are you there")))
    );

    socket.close().await.unwrap();
}

#[tokio::test]
async fn test_fetch_upgrade_exposes_websocket() {
    let http = endpoint(&HubBus::new(), &MemorySwitch::new());
    let _listener = {
        let server_http = http.clone();
        http.listen(ListenOptions::new(3001), move |request, _| {
            let server_http = server_http.clone();
            async move {
                Ok(server_http.upgrade(&request, |socket| async move {
                    let _ = socket.send_text("welcome").await;
                    let _ = socket.close().await;
                }))
            }
        })
        .unwrap()
    };

    let response = http
        .fetch("http://localhost:3001/", RequestInit::get())
        .await
        .unwrap();
    assert_eq!(response.status, 101);
    let socket = response.into_websocket().unwrap();
    assert_eq!(
        socket.recv().await.unwrap(),
        Some(WebSocketEvent::Message(Message::Text("welcome".to_string())))
    );
    assert_eq!(socket.recv().await.unwrap(), Some(WebSocketEvent::Close));
    assert_eq!(socket.recv().await.unwrap(), None);
}

// =============================================================================
// Connection Failure Tests
// =============================================================================

#[tokio::test]
async fn test_connect_refused_on_unbound_port() {
    let http = endpoint(&HubBus::new(), &MemorySwitch::new());
    let result = http.fetch("http://localhost:1234/", RequestInit::get()).await;
    assert!(matches!(result, Err(ProtocolError::ConnectionRefused(_))));
}

#[tokio::test]
async fn test_connect_timeout_to_unknown_peer() {
    let switch = MemorySwitch::new();
    let http = endpoint_with(
        &HubBus::new(),
        &switch,
        NetConfig {
            connect_timeout: Duration::from_millis(100),
            ..NetConfig::default()
        },
        HttpConfig::default(),
        None,
    );

    let result = http
        .fetch("http://nobody-home:80/", RequestInit::get())
        .await;
    assert!(matches!(result, Err(ProtocolError::Timeout(_))));
    assert_eq!(switch.pending(), 0);
}

// =============================================================================
// Remote Hub Tests
// =============================================================================

#[tokio::test]
async fn test_fetch_through_relay() {
    let relay = Arc::new(RelayServer::bind("127.0.0.1:0").await.unwrap());
    let url = relay.url().unwrap();
    let server_task = {
        let relay = relay.clone();
        tokio::spawn(async move { relay.run().await })
    };

    let switch = MemorySwitch::new();
    let mut modules = Vec::new();
    for _ in 0..2 {
        let hub = RemoteHub::connect(RemoteHubConfig::new(url.clone()), HubConfiguration::default())
            .unwrap();
        tokio::time::timeout(Duration::from_secs(5), hub.wait_connected())
            .await
            .unwrap()
            .unwrap();
        let hub: Arc<dyn Hub> = hub;
        let transport = Arc::new(MemoryTransport::new(hub.clone(), switch.clone()));
        let net = Arc::new(NetModule::new(hub, transport, NetConfig::default()));
        modules.push(HttpModule::new(net, HttpConfig::default()));
    }
    let client = modules.pop().unwrap();
    let server = modules.pop().unwrap();

    let _listener = server
        .listen(ListenOptions::new(5000), |_, _| async { Ok(Response::text("via relay")) })
        .unwrap();

    let target = format!("http://{}:5000/", server.net().address());
    let mut response = client.fetch(&target, RequestInit::get()).await.unwrap();
    assert_eq!(response.text_body().await.unwrap(), "via relay");

    client.net().hub().dispose();
    server.net().hub().dispose();
    relay.shutdown();
    server_task.await.unwrap().unwrap();
}
