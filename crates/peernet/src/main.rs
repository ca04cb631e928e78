//! peernet CLI
//!
//! Runs the rendezvous relay, serves HTTP on a virtual port, or fetches a
//! virtual URL from another endpoint.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use peernet::config::{Config, HubKind};
use peernet::http::{Body, HttpModule, RequestInit, Response};
use peernet::hub::{Hub, HubBus, LocalHub, RemoteHub};
use peernet::net::{ListenOptions, NetModule};
use peernet::relay::RelayServer;
use peernet::transport::{MemorySwitch, MemoryTransport, Transport, WebRtcTransport};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// peernet - HTTP and WebSocket over peer-to-peer data channels.
#[derive(Parser, Debug)]
#[command(name = "peernet")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Run the rendezvous relay server
    Relay {
        /// Socket address to bind (overrides relay.bind)
        #[arg(long)]
        bind: Option<String>,
    },

    /// Serve HTTP on a virtual port until interrupted
    Serve {
        /// Virtual port to listen on
        #[arg(long, short, default_value = "80")]
        port: u16,

        /// Fixed response body
        #[arg(long, default_value = "Hello")]
        body: String,

        /// Answer every request with its own body
        #[arg(long, conflicts_with = "body")]
        echo: bool,
    },

    /// Fetch a virtual URL and print the response body
    Fetch {
        /// URL of the form http://<address>[:port]/path
        url: String,

        /// Request method
        #[arg(long, short = 'X', default_value = "GET")]
        method: String,

        /// Request body
        #[arg(long, short)]
        data: Option<String>,

        /// Print status and headers to stderr
        #[arg(long, short = 'i')]
        include: bool,
    },

    /// Print a fresh hub address
    Address,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = if let Some(config_path) = &cli.config {
        Config::load(config_path)?
    } else {
        Config::load_default()?
    };
    config.apply_env_overrides();
    if cli.verbose {
        config.log.level = "debug".to_string();
    }
    config.validate()?;

    let _log_guard = init_tracing(&config)?;
    tracing::debug!(?config, "configuration loaded");

    match cli.command {
        Commands::Relay { bind } => {
            let bind = bind.unwrap_or_else(|| config.relay.bind.clone());
            run_relay(&bind).await?;
        }
        Commands::Serve { port, body, echo } => {
            let http = build_stack(&config)?;
            run_serve(&http, port, body, echo).await?;
            http.net().hub().dispose();
        }
        Commands::Fetch {
            url,
            method,
            data,
            include,
        } => {
            let http = build_stack(&config)?;
            let result = run_fetch(&http, &url, method, data, include).await;
            http.net().hub().dispose();
            result?;
        }
        Commands::Address => {
            let hub = build_hub(&config)?;
            println!("{}", hub.address());
            hub.dispose();
        }
    }

    Ok(())
}

/// Console logging filtered by the configured level, plus a file writer when
/// `log.file` is set. The returned guard flushes the file on drop.
fn init_tracing(config: &Config) -> anyhow::Result<Option<WorkerGuard>> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log.level.to_lowercase()));
    let console = tracing_subscriber::fmt::layer().with_writer(std::io::stderr);

    let Some(path) = &config.log.file else {
        tracing_subscriber::registry().with(filter).with(console).init();
        return Ok(None);
    };

    let directory = path
        .parent()
        .filter(|dir| !dir.as_os_str().is_empty())
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."));
    let file_name = path
        .file_name()
        .with_context(|| format!("log file has no file name: {}", path.display()))?;
    std::fs::create_dir_all(&directory)
        .with_context(|| format!("Failed to create log directory: {}", directory.display()))?;

    let (writer, guard) =
        tracing_appender::non_blocking(tracing_appender::rolling::never(directory, file_name));
    tracing_subscriber::registry()
        .with(filter)
        .with(console)
        .with(tracing_subscriber::fmt::layer().with_ansi(false).with_writer(writer))
        .init();
    Ok(Some(guard))
}

fn build_hub(config: &Config) -> anyhow::Result<Arc<dyn Hub>> {
    let hub: Arc<dyn Hub> = match config.hub.kind {
        HubKind::Local => Arc::new(LocalHub::new(&HubBus::new(), config.hub_configuration())),
        HubKind::Remote => RemoteHub::connect(config.remote_hub_config(), config.hub_configuration())
            .context("Failed to start remote hub")?,
    };
    Ok(hub)
}

fn build_stack(config: &Config) -> anyhow::Result<HttpModule> {
    let hub = build_hub(config)?;
    let transport: Arc<dyn Transport> = match config.hub.kind {
        HubKind::Local => Arc::new(MemoryTransport::new(hub.clone(), MemorySwitch::new())),
        HubKind::Remote => {
            Arc::new(WebRtcTransport::new(hub.clone()).context("Failed to create WebRTC transport")?)
        }
    };
    let net = Arc::new(NetModule::new(hub, transport, config.net_config()));
    Ok(HttpModule::new(net, config.http_config()))
}

async fn run_relay(bind: &str) -> anyhow::Result<()> {
    let relay = Arc::new(
        RelayServer::bind(bind)
            .await
            .with_context(|| format!("Failed to bind relay on {}", bind))?,
    );
    println!("{}", relay.url()?);

    let server = {
        let relay = relay.clone();
        tokio::spawn(async move { relay.run().await })
    };

    wait_for_shutdown_signal().await;
    relay.shutdown();
    server.await.context("relay task panicked")??;
    Ok(())
}

async fn run_serve(http: &HttpModule, port: u16, body: String, echo: bool) -> anyhow::Result<()> {
    let listener = http.listen(ListenOptions::new(port), move |mut request, info| {
        let body = body.clone();
        async move {
            tracing::info!(method = %request.method, url = %request.url, remote = %info.remote, "request");
            if echo {
                let payload = request.body.bytes().await?;
                Ok(Response::new(payload))
            } else {
                Ok(Response::text(body))
            }
        }
    })?;

    println!("http://{}", listener.local());
    wait_for_shutdown_signal().await;
    listener.dispose();
    Ok(())
}

async fn run_fetch(
    http: &HttpModule,
    url: &str,
    method: String,
    data: Option<String>,
    include: bool,
) -> anyhow::Result<()> {
    let mut init = RequestInit::get().with_method(method);
    if let Some(data) = data {
        init.body = Body::from(data);
    }

    let mut response = http
        .fetch(url, init)
        .await
        .with_context(|| format!("Failed to fetch {}", url))?;
    if include {
        eprintln!("{} {}", response.status, response.status_text);
        for (name, value) in response.headers.iter() {
            eprintln!("{}: {}", name, value);
        }
    }

    let body = response.bytes().await?;
    print!("{}", String::from_utf8_lossy(&body));
    if !response.ok() {
        anyhow::bail!("request failed with status {}", response.status);
    }
    Ok(())
}

/// Wait for Ctrl-C.
async fn wait_for_shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for shutdown signal");
    }
    tracing::info!("received shutdown signal");
}
