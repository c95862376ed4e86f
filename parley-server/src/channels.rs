//! Channel registry.
//!
//! Channels are created on first reference and evicted by a background
//! sweep once their cleanup pass reports no messages, listeners or bans
//! left.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::task::JoinHandle;

use crate::channel::Channel;
use crate::config::ServerConfig;
use crate::engine::EventHandler;
use crate::now_ms;
use crate::replication::PeerLinks;

pub struct Channels {
    map: Arc<Mutex<HashMap<String, Arc<Channel>>>>,
    config: Arc<ServerConfig>,
    engine: Arc<EventHandler>,
    peers: Arc<PeerLinks>,
    close_notify: Arc<Notify>,
    sweep_task: Mutex<Option<JoinHandle<()>>>,
}

impl Channels {
    pub fn new(
        config: Arc<ServerConfig>,
        engine: Arc<EventHandler>,
        peers: Arc<PeerLinks>,
    ) -> Self {
        let map: Arc<Mutex<HashMap<String, Arc<Channel>>>> = Arc::default();
        let close_notify = Arc::new(Notify::new());
        let sweep_task = {
            let map = Arc::clone(&map);
            let close_notify = Arc::clone(&close_notify);
            let interval = Duration::from_millis(config.cleanup_interval_ms);
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = close_notify.notified() => return,
                        _ = tokio::time::sleep(interval) => {}
                    }
                    sweep(&map);
                }
            })
        };
        Self {
            map,
            config,
            engine,
            peers,
            close_notify,
            sweep_task: Mutex::new(Some(sweep_task)),
        }
    }

    /// Look up a channel, creating it if this is the first reference.
    pub fn get(&self, name: &str) -> Arc<Channel> {
        let mut map = self.map.lock();
        if let Some(channel) = map.get(name) {
            return Arc::clone(channel);
        }
        tracing::debug!(channel = %name, "creating channel");
        let channel = Channel::new(
            name,
            Arc::clone(&self.config),
            Arc::clone(&self.engine),
            Arc::clone(&self.peers),
        );
        map.insert(name.to_string(), Arc::clone(&channel));
        channel
    }

    pub async fn close(&self) {
        self.close_notify.notify_one();
        let task = self.sweep_task.lock().take();
        if let Some(handle) = task {
            let _ = handle.await;
        }
    }
}

fn sweep(map: &Mutex<HashMap<String, Arc<Channel>>>) {
    let channels: Vec<Arc<Channel>> = map.lock().values().cloned().collect();
    let now = now_ms();
    let mut evicted = 0usize;
    for channel in &channels {
        if channel.cleanup(now) {
            map.lock().remove(channel.name());
            evicted += 1;
        }
    }
    tracing::debug!(
        open = channels.len() - evicted,
        evicted,
        "channel cleanup sweep"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stats::Statistics;

    fn registry() -> Channels {
        let config = Arc::new(ServerConfig::for_testing("secret"));
        let engine = EventHandler::new(2, Arc::new(Statistics::new()));
        Channels::new(config, engine, Arc::new(PeerLinks::empty()))
    }

    #[tokio::test]
    async fn get_creates_once() {
        let channels = registry();
        let a = channels.get("lobby");
        let b = channels.get("lobby");
        assert!(Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &channels.get("other")));
        channels.close().await;
    }

    #[tokio::test]
    async fn sweep_evicts_empty_channels() {
        let channels = registry();
        channels.get("empty");
        sweep(&channels.map);
        assert!(channels.map.lock().is_empty());
        channels.close().await;
    }
}
