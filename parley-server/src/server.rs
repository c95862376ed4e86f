//! Server assembly and listeners.
//!
//! `Server::run` wires the subsystems together, binds the HTTP and
//! replication listeners and blocks until ctrl-c, then closes everything in
//! dependency order. `Server::start` does the same on ephemeral ports for
//! tests and hands back the bound addresses.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

use crate::auth::{Keys, PeerAuth};
use crate::channels::Channels;
use crate::config::ServerConfig;
use crate::engine::EventHandler;
use crate::error::StartupError;
use crate::http;
use crate::message::Message;
use crate::now_ms;
use crate::replication::PeerLinks;
use crate::stats::Statistics;

const STATS_DUMP_INTERVAL: Duration = Duration::from_secs(60);

/// Shared handles to every subsystem, held by the HTTP layer and the
/// replication listener.
pub struct App {
    pub config: Arc<ServerConfig>,
    pub keys: Arc<Keys>,
    pub stats: Arc<Statistics>,
    pub engine: Arc<EventHandler>,
    pub peers: Arc<PeerLinks>,
    pub channels: Arc<Channels>,
}

impl App {
    /// Close every subsystem in dependency order: no new channel work, then
    /// flush outbound links, then drain the job queue.
    pub async fn close(&self) {
        self.channels.close().await;
        self.peers.close().await;
        self.engine.close().await;
    }
}

pub struct Server {
    config: ServerConfig,
}

impl Server {
    pub fn new(config: ServerConfig) -> Self {
        Self { config }
    }

    fn build_app(&self) -> Result<Arc<App>, StartupError> {
        self.config.validate()?;
        let config = Arc::new(self.config.clone());
        let keys = Arc::new(Keys::new(&config.magic_number));
        let stats = Arc::new(Statistics::new());
        let engine = EventHandler::new(config.event_workers, Arc::clone(&stats));
        let peers = Arc::new(PeerLinks::new(&config, Arc::clone(&keys))?);
        let channels = Arc::new(Channels::new(
            Arc::clone(&config),
            Arc::clone(&engine),
            Arc::clone(&peers),
        ));
        Ok(Arc::new(App {
            config,
            keys,
            stats,
            engine,
            peers,
            channels,
        }))
    }

    async fn bind(addr: &str) -> Result<TcpListener, StartupError> {
        TcpListener::bind(addr)
            .await
            .map_err(|source| StartupError::Bind {
                addr: addr.to_string(),
                source,
            })
    }

    /// Run the server, blocking until ctrl-c.
    pub async fn run(self) -> Result<()> {
        let app = self.build_app()?;

        let http_listener = Self::bind(&app.config.listen_addr).await?;
        tracing::info!("HTTP listener on {}", app.config.listen_addr);

        let replication_addr = app.config.effective_replication_addr()?;
        let replication_listener = Self::bind(&replication_addr.to_string()).await?;
        tracing::info!("Replication listener on {replication_addr}");

        let accept_task = tokio::spawn(accept_peers(Arc::clone(&app), replication_listener));
        let stats_task = tokio::spawn(dump_stats(Arc::clone(&app)));

        let router = http::router(Arc::clone(&app));
        axum::serve(
            http_listener,
            router.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutdown requested");
        })
        .await?;

        accept_task.abort();
        stats_task.abort();
        app.close().await;
        Ok(())
    }

    /// Start the server on its configured (usually ephemeral) ports and
    /// return the bound addresses, the shared state and the HTTP task
    /// handle (for testing).
    pub async fn start(self) -> Result<(SocketAddr, SocketAddr, Arc<App>, JoinHandle<()>)> {
        let app = self.build_app()?;

        let http_listener = Self::bind(&app.config.listen_addr).await?;
        let http_addr = http_listener.local_addr()?;

        let replication_addr = app.config.effective_replication_addr()?;
        let replication_listener = Self::bind(&replication_addr.to_string()).await?;
        let replication_addr = replication_listener.local_addr()?;
        tracing::info!("HTTP on {http_addr}, replication on {replication_addr}");

        tokio::spawn(accept_peers(Arc::clone(&app), replication_listener));

        let router = http::router(Arc::clone(&app));
        let handle = tokio::spawn(async move {
            if let Err(error) = axum::serve(
                http_listener,
                router.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .await
            {
                tracing::error!(%error, "http serve failed");
            }
        });

        Ok((http_addr, replication_addr, app, handle))
    }
}

async fn dump_stats(app: Arc<App>) {
    loop {
        tokio::time::sleep(STATS_DUMP_INTERVAL).await;
        app.stats.dump();
    }
}

/// Accept loop for the replication listener. Connections are only accepted
/// from configured peer addresses.
async fn accept_peers(app: Arc<App>, listener: TcpListener) {
    loop {
        let (stream, addr) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(error) => {
                tracing::error!(%error, "replication accept failed");
                continue;
            }
        };
        if !peer_ip_allowed(&app.config, &addr) {
            tracing::warn!(peer = %addr, "rejected connection from unknown address");
            continue;
        }
        let app = Arc::clone(&app);
        tokio::spawn(async move {
            if let Err(error) = handle_peer(app, stream, addr).await {
                tracing::warn!(peer = %addr, %error, "replication connection error");
            }
        });
    }
}

fn peer_ip_allowed(config: &ServerConfig, addr: &SocketAddr) -> bool {
    config
        .peers
        .iter()
        .filter_map(|peer| peer.parse::<SocketAddr>().ok())
        .any(|peer| peer.ip() == addr.ip())
}

/// One inbound replication connection: an auth line, then message lines
/// applied as engine jobs.
async fn handle_peer(app: Arc<App>, stream: TcpStream, addr: SocketAddr) -> std::io::Result<()> {
    let mut lines = BufReader::new(stream).lines();

    let Some(auth_line) = lines.next_line().await? else {
        return Ok(());
    };
    match app
        .keys
        .verify_peer_auth(&auth_line, app.config.auth_skew_ms as i64)
    {
        PeerAuth::Accepted => {
            tracing::info!(peer = %addr, "replication peer authenticated");
        }
        PeerAuth::BadSignature => {
            // Probably a magic number mismatch somewhere in the cluster.
            // Keep the link alive so the cluster stays connected while the
            // operator sorts it out.
            tracing::warn!(peer = %addr, "peer auth signature mismatch, continuing");
        }
        PeerAuth::SkewTooLarge(skew) => {
            tracing::warn!(peer = %addr, skew, "peer clock skew too large, closing");
            return Ok(());
        }
        PeerAuth::Malformed => {
            tracing::warn!(peer = %addr, "malformed peer auth line, closing");
            return Ok(());
        }
    }

    while let Some(line) = lines.next_line().await? {
        let keys = Arc::clone(&app.keys);
        let channels = Arc::clone(&app.channels);
        app.engine.add_event(Box::new(move || {
            match Message::parse_wire(&line, now_ms(), &keys) {
                Ok(message) => channels.get(&message.channel).message(message, true),
                Err(error) => tracing::warn!(%error, "bad replication line"),
            }
        }));
    }
    tracing::info!(peer = %addr, "replication peer disconnected");
    Ok(())
}
