//! # peernet
//!
//! Virtual sockets, HTTP and WebSocket between endpoints that can only reach
//! each other through peer-to-peer data channels.
//!
//! ## Layers
//!
//! ```text
//! ┌──────────────────────────────────────────────────────┐
//! │  http    fetch / listen / upgrade, WebSocket         │
//! ├──────────────────────────────────────────────────────┤
//! │  frame   ordinal + length framing over a Duplex      │
//! ├──────────────────────────────────────────────────────┤
//! │  net     NetModule: listen / connect by (addr, port) │
//! ├──────────────────────────────────────────────────────┤
//! │  transport  WebRTC data channels | in-memory pipes   │
//! ├──────────────────────────────────────────────────────┤
//! │  hub     signaling: LocalHub | RemoteHub <-> relay   │
//! └──────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use peernet::http::{HttpConfig, HttpModule, RequestInit, Response};
//! use peernet::hub::{Hub, HubBus, HubConfiguration, LocalHub};
//! use peernet::net::{ListenOptions, NetConfig, NetModule};
//! use peernet::transport::{MemorySwitch, MemoryTransport};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let hub: Arc<dyn Hub> = Arc::new(LocalHub::new(&HubBus::new(), HubConfiguration::default()));
//!     let transport = Arc::new(MemoryTransport::new(hub.clone(), MemorySwitch::new()));
//!     let net = Arc::new(NetModule::new(hub, transport, NetConfig::default()));
//!     let http = HttpModule::new(net, HttpConfig::default());
//!
//!     let _listener = http.listen(ListenOptions::new(5000), |_, _| async {
//!         Ok(Response::text("Hello"))
//!     })?;
//!
//!     let mut response = http.fetch("http://localhost:5000/", RequestInit::get()).await?;
//!     println!("{}", response.text_body().await?);
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod frame;
pub mod http;
pub mod hub;
pub mod io;
pub mod net;
pub mod relay;
pub mod sync;
pub mod transport;

pub use config::Config;
pub use frame::{FrameDuplex, FrameReader, FrameWriter};
pub use http::{HttpModule, Request, Response, WebSocket};
pub use hub::{Hub, HubBus, LocalHub, RemoteHub};
pub use io::Duplex;
pub use net::{NetModule, NetSocket};
pub use protocol::{ProtocolError, Result};
pub use relay::RelayServer;
pub use transport::{MemoryTransport, Transport, WebRtcTransport};
