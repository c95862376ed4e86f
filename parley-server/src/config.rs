//! Server configuration via command-line flags and environment variables.

use clap::Parser;

use crate::error::StartupError;

/// Long-poll chat/presence server with inter-server replication.
#[derive(Parser, Debug, Clone)]
#[command(name = "parley-server", version)]
pub struct ServerConfig {
    /// Address for the HTTP request listener.
    #[arg(long, default_value = "127.0.0.1:8070")]
    pub listen_addr: String,

    /// Address for the inter-server replication listener.
    /// Defaults to the listen address with the port incremented by one.
    #[arg(long)]
    pub replication_addr: Option<String>,

    /// Peer server replication address (host:port). Repeatable.
    /// Every peer opens its own outbound link to every other peer.
    #[arg(long = "peer")]
    pub peers: Vec<String>,

    /// Shared secret used for capability keys, user masking and
    /// replication link authentication. Must match across the cluster.
    #[arg(long, env = "PARLEY_MAGIC")]
    pub magic_number: String,

    /// Number of worker tasks serving the job queue.
    #[arg(long, default_value_t = 4)]
    pub event_workers: usize,

    /// How long a long-poll request waits for messages before returning
    /// an empty response (milliseconds).
    #[arg(long, default_value_t = 60_000)]
    pub wait_timeout_ms: u64,

    /// Inactivity period after which a locally-connected user is assumed
    /// to have left the channel (milliseconds).
    #[arg(long, default_value_t = 20_000)]
    pub present_timeout_ms: u64,

    /// Retention window for channel message history (milliseconds).
    #[arg(long, default_value_t = 4 * 3_600_000)]
    pub history_time_ms: u64,

    /// Interval between channel cleanup sweeps (milliseconds).
    #[arg(long, default_value_t = 30_000)]
    pub cleanup_interval_ms: u64,

    /// Minimum recommended poll delay (milliseconds).
    #[arg(long, default_value_t = 2_000)]
    pub min_poll_ms: u64,

    /// Maximum recommended poll delay (milliseconds).
    #[arg(long, default_value_t = 10_000)]
    pub max_poll_ms: u64,

    /// Elapsed time since the last message at which the recommended poll
    /// delay reaches its maximum (milliseconds).
    #[arg(long, default_value_t = 60_000)]
    pub poll_scale_ms: u64,

    /// Maximum number of outbound messages buffered per peer link while
    /// the peer is unreachable. Oldest messages are dropped on overflow.
    #[arg(long, default_value_t = 1_000)]
    pub transfer_limit: usize,

    /// Delay before flushing a peer link's write buffer (milliseconds).
    #[arg(long, default_value_t = 300)]
    pub flush_delay_ms: u64,

    /// Delay between reconnection attempts to a failed peer (milliseconds).
    #[arg(long, default_value_t = 60_000)]
    pub retry_delay_ms: u64,

    /// Maximum clock skew tolerated on replication auth lines (milliseconds).
    #[arg(long, default_value_t = 5_000)]
    pub auth_skew_ms: u64,

    /// Maximum age of a capability key before it is rejected (milliseconds).
    #[arg(long, default_value_t = 3_600_000)]
    pub key_expiry_ms: u64,

    /// Write chat transcripts to the log.
    #[arg(long)]
    pub log_chat: bool,
}

impl ServerConfig {
    /// Validate the configuration; called once before anything binds.
    pub fn validate(&self) -> Result<(), StartupError> {
        if self.magic_number.is_empty() {
            return Err(StartupError::Config(
                "magic number must not be empty".into(),
            ));
        }
        if self.event_workers == 0 {
            return Err(StartupError::Config(
                "event-workers must be at least 1".into(),
            ));
        }
        if self.min_poll_ms > self.max_poll_ms {
            return Err(StartupError::Config(
                "min-poll-ms must not exceed max-poll-ms".into(),
            ));
        }
        if self.poll_scale_ms == 0 {
            return Err(StartupError::Config(
                "poll-scale-ms must be positive".into(),
            ));
        }
        self.listen_addr
            .parse::<std::net::SocketAddr>()
            .map_err(|e| StartupError::Config(format!("bad listen-addr: {e}")))?;
        if let Some(ref addr) = self.replication_addr {
            addr.parse::<std::net::SocketAddr>()
                .map_err(|e| StartupError::Config(format!("bad replication-addr: {e}")))?;
        }
        for peer in &self.peers {
            peer.parse::<std::net::SocketAddr>()
                .map_err(|e| StartupError::Config(format!("bad peer address {peer}: {e}")))?;
        }
        Ok(())
    }

    /// Effective replication listener address.
    pub fn effective_replication_addr(&self) -> Result<std::net::SocketAddr, StartupError> {
        if let Some(ref addr) = self.replication_addr {
            return addr
                .parse()
                .map_err(|e| StartupError::Config(format!("bad replication-addr: {e}")));
        }
        let mut addr: std::net::SocketAddr = self
            .listen_addr
            .parse()
            .map_err(|e| StartupError::Config(format!("bad listen-addr: {e}")))?;
        let port = addr.port().checked_add(1).ok_or_else(|| {
            StartupError::Config(
                "listen-addr port leaves no room for a replication port; \
                 set replication-addr explicitly"
                    .into(),
            )
        })?;
        addr.set_port(port);
        Ok(addr)
    }

    /// A configuration suitable for tests: ephemeral ports, no peers.
    pub fn for_testing(magic: &str) -> Self {
        Self {
            listen_addr: "127.0.0.1:0".into(),
            replication_addr: Some("127.0.0.1:0".into()),
            peers: Vec::new(),
            magic_number: magic.into(),
            event_workers: 2,
            wait_timeout_ms: 60_000,
            present_timeout_ms: 20_000,
            history_time_ms: 4 * 3_600_000,
            cleanup_interval_ms: 30_000,
            min_poll_ms: 2_000,
            max_poll_ms: 10_000,
            poll_scale_ms: 60_000,
            transfer_limit: 1_000,
            flush_delay_ms: 300,
            retry_delay_ms: 60_000,
            auth_skew_ms: 5_000,
            key_expiry_ms: 3_600_000,
            log_chat: false,
        }
    }
}
