//! Outbound replication links.
//!
//! Every server holds one persistent outbound TCP connection per peer.
//! Messages are queued per link as pre-serialized lines; a link task drains
//! its queue onto the socket, batching flushes, and reconnects with a fixed
//! delay after any failure. Queues are bounded: when a peer stays down long
//! enough, the oldest lines are dropped and the peer catches up from live
//! traffic once it returns.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::auth::Keys;
use crate::config::ServerConfig;
use crate::message::Message;

struct LinkShared {
    addr: SocketAddr,
    queue: Mutex<VecDeque<String>>,
    notify: Notify,
    closing: AtomicBool,
    transfer_limit: usize,
}

struct PeerLink {
    shared: Arc<LinkShared>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl PeerLink {
    fn new(addr: SocketAddr, config: &ServerConfig, keys: Arc<Keys>) -> Self {
        let shared = Arc::new(LinkShared {
            addr,
            queue: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            closing: AtomicBool::new(false),
            transfer_limit: config.transfer_limit,
        });
        let task = {
            let shared = Arc::clone(&shared);
            let flush_delay = Duration::from_millis(config.flush_delay_ms);
            let retry_delay = Duration::from_millis(config.retry_delay_ms);
            tokio::spawn(async move { link_loop(shared, keys, flush_delay, retry_delay).await })
        };
        Self {
            shared,
            task: Mutex::new(Some(task)),
        }
    }

    fn enqueue(&self, line: String) {
        {
            let mut queue = self.shared.queue.lock();
            if queue.len() >= self.shared.transfer_limit {
                queue.pop_front();
                tracing::warn!(peer = %self.shared.addr, "transfer queue full, dropping oldest");
            }
            queue.push_back(line);
        }
        self.shared.notify.notify_one();
    }

    async fn close(&self) {
        self.shared.closing.store(true, Ordering::SeqCst);
        self.shared.notify.notify_one();
        let task = self.task.lock().take();
        if let Some(handle) = task {
            let _ = handle.await;
        }
    }
}

/// The set of outbound links to every peer in the cluster.
pub struct PeerLinks {
    links: Vec<PeerLink>,
}

impl PeerLinks {
    pub fn new(config: &ServerConfig, keys: Arc<Keys>) -> Result<Self, crate::error::StartupError> {
        let mut links = Vec::with_capacity(config.peers.len());
        for peer in &config.peers {
            let addr: SocketAddr = peer.parse().map_err(|e| {
                crate::error::StartupError::Config(format!("bad peer address {peer}: {e}"))
            })?;
            links.push(PeerLink::new(addr, config, Arc::clone(&keys)));
        }
        Ok(Self { links })
    }

    /// A link set with no peers, for single-server deployments and tests.
    pub fn empty() -> Self {
        Self { links: Vec::new() }
    }

    /// Queue a message for delivery to every peer. Messages with no wire
    /// form are ignored.
    pub fn send_message(&self, message: &Message) {
        if self.links.is_empty() {
            return;
        }
        let Some(line) = message.wire_format() else {
            return;
        };
        for link in &self.links {
            link.enqueue(line.clone());
        }
    }

    pub async fn close(&self) {
        for link in &self.links {
            link.close().await;
        }
    }
}

async fn link_loop(
    shared: Arc<LinkShared>,
    keys: Arc<Keys>,
    flush_delay: Duration,
    retry_delay: Duration,
) {
    let mut last_attempt: Option<Instant> = None;
    loop {
        if shared.closing.load(Ordering::SeqCst) {
            return;
        }

        // Fixed-rate retry: sleep out the remainder of the retry interval
        // since the last failed attempt, not a full interval.
        if let Some(at) = last_attempt {
            let elapsed = at.elapsed();
            if elapsed < retry_delay {
                tokio::select! {
                    _ = tokio::time::sleep(retry_delay - elapsed) => {}
                    _ = shared.notify.notified() => {
                        if shared.closing.load(Ordering::SeqCst) {
                            return;
                        }
                        // Woken by new traffic; keep waiting out the delay.
                        continue;
                    }
                }
            }
        }
        last_attempt = Some(Instant::now());

        let mut stream = match TcpStream::connect(shared.addr).await {
            Ok(stream) => stream,
            Err(error) => {
                tracing::warn!(peer = %shared.addr, %error, "connect failed");
                continue;
            }
        };
        let auth = format!("{}\n", keys.peer_auth_line());
        if let Err(error) = stream.write_all(auth.as_bytes()).await {
            tracing::warn!(peer = %shared.addr, %error, "auth write failed");
            continue;
        }
        tracing::info!(peer = %shared.addr, "replication link up");

        if run_link(&shared, &mut stream, flush_delay).await.is_none() {
            return;
        }
        tracing::warn!(peer = %shared.addr, "replication link down");
    }
}

/// Drain the queue onto a connected socket until it fails or we are closed.
/// Returns `None` on shutdown, `Some(())` on connection failure.
async fn run_link(
    shared: &LinkShared,
    stream: &mut TcpStream,
    flush_delay: Duration,
) -> Option<()> {
    let mut unflushed = false;
    loop {
        if shared.closing.load(Ordering::SeqCst) {
            if unflushed {
                let _ = stream.flush().await;
            }
            return None;
        }

        let line = shared.queue.lock().pop_front();
        match line {
            Some(line) => {
                if let Err(error) = stream.write_all(format!("{line}\n").as_bytes()).await {
                    tracing::warn!(peer = %shared.addr, %error, "write failed");
                    // Do not lose the line; retry it on the next connection.
                    shared.queue.lock().push_front(line);
                    return Some(());
                }
                unflushed = true;
            }
            None => {
                if unflushed {
                    // Batch: hold the flush briefly in case more lines follow.
                    tokio::select! {
                        _ = shared.notify.notified() => continue,
                        _ = tokio::time::sleep(flush_delay) => {}
                    }
                    if let Err(error) = stream.flush().await {
                        tracing::warn!(peer = %shared.addr, %error, "flush failed");
                        return Some(());
                    }
                    unflushed = false;
                } else {
                    shared.notify.notified().await;
                }
            }
        }
    }
}
