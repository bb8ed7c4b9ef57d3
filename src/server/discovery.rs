//! Discovery registry announcements
//!
//! A listening node periodically writes where it can be reached into an
//! external key-value registry:
//!
//! ```text
//! streamer.3       = streamer.3:5555
//! streamer.node.3  = 10.0.0.7:5555     (only when NODE_ADDR is set)
//! ```

use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::Result;

/// Prefix used by streaming servers
pub const STREAMER_PREFIX: &str = "streamer";

/// Prefix used by trigger listeners
pub const RECORDER_PREFIX: &str = "recorder";

/// Environment variable holding the externally reachable node address
pub const NODE_ADDR_VAR: &str = "NODE_ADDR";

/// Writes announcements into a discovery registry
#[async_trait]
pub trait Announcer: Send + Sync {
    async fn announce(&self, key: &str, value: &str) -> Result<()>;
}

/// What to announce and how often
#[derive(Debug, Clone)]
pub struct DiscoveryConfig {
    /// Numeric stream identifier
    pub stream_id: u32,

    /// Externally reachable address of this node
    pub node_addr: Option<String>,

    /// Key prefix (`streamer` or `recorder`)
    pub prefix: String,

    /// Time between announcements
    pub interval: Duration,
}

impl DiscoveryConfig {
    pub fn new(prefix: impl Into<String>, stream_id: u32) -> Self {
        Self {
            stream_id,
            node_addr: None,
            prefix: prefix.into(),
            interval: Duration::from_secs(10),
        }
    }

    /// Read the identifier from `id_var` and the node address from `NODE_ADDR`
    ///
    /// A missing or non-numeric identifier reads as 0.
    pub fn from_env(prefix: impl Into<String>, id_var: &str) -> Self {
        let stream_id = std::env::var(id_var)
            .ok()
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(0);
        let node_addr = std::env::var(NODE_ADDR_VAR)
            .ok()
            .filter(|v| !v.trim().is_empty());
        Self {
            node_addr,
            ..Self::new(prefix, stream_id)
        }
    }

    pub fn node_addr(mut self, addr: impl Into<String>) -> Self {
        self.node_addr = Some(addr.into());
        self
    }

    pub fn interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Key-value pairs announced for a listener on `port`
    pub fn entries(&self, port: u16) -> Vec<(String, String)> {
        let name = format!("{}.{}", self.prefix, self.stream_id);
        let mut entries = vec![(name.clone(), format!("{}:{}", name, port))];
        if let Some(ref node) = self.node_addr {
            entries.push((
                format!("{}.node.{}", self.prefix, self.stream_id),
                format!("{}:{}", node, port),
            ));
        }
        entries
    }
}

/// Announce every `config.interval` until `cancel` fires
pub fn spawn_announcer(
    config: DiscoveryConfig,
    announcer: std::sync::Arc<dyn Announcer>,
    port: u16,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    if config.node_addr.is_none() {
        tracing::warn!(prefix = %config.prefix, "NODE_ADDR not set, node will not be reachable from outside");
    }

    tokio::spawn(async move {
        let entries = config.entries(port);
        let mut ticker = tokio::time::interval(config.interval);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            for (key, value) in &entries {
                if let Err(e) = announcer.announce(key, value).await {
                    tracing::warn!(key = %key, error = %e, "Discovery announcement failed");
                }
            }
        }
        tracing::debug!(prefix = %config.prefix, id = config.stream_id, "Announcer stopped");
    })
}

#[cfg(feature = "redis")]
pub use self::redis_backend::RedisAnnouncer;

#[cfg(feature = "redis")]
mod redis_backend {
    use async_trait::async_trait;

    use super::Announcer;
    use crate::error::{Error, Result};

    /// Announces into a Redis server with plain `SET`
    pub struct RedisAnnouncer {
        client: redis::Client,
    }

    impl RedisAnnouncer {
        /// `url` like `redis://redis_streaming:6379`
        pub fn new(url: &str) -> Result<Self> {
            let client = redis::Client::open(url)
                .map_err(|e| Error::Configuration(format!("invalid redis url {}: {}", url, e)))?;
            Ok(Self { client })
        }
    }

    #[async_trait]
    impl Announcer for RedisAnnouncer {
        async fn announce(&self, key: &str, value: &str) -> Result<()> {
            use redis::AsyncCommands;

            let mut conn = self
                .client
                .get_multiplexed_async_connection()
                .await
                .map_err(|e| Error::Connection(e.to_string()))?;
            conn.set::<_, _, ()>(key, value)
                .await
                .map_err(|e| Error::Connection(e.to_string()))?;
            Ok(())
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::{Arc, Mutex};

    /// Keeps announcements in memory
    #[derive(Default)]
    pub(crate) struct MemoryAnnouncer {
        pub(crate) entries: Mutex<HashMap<String, String>>,
        pub(crate) writes: Mutex<usize>,
    }

    #[async_trait]
    impl Announcer for MemoryAnnouncer {
        async fn announce(&self, key: &str, value: &str) -> Result<()> {
            self.entries
                .lock()
                .unwrap()
                .insert(key.to_string(), value.to_string());
            *self.writes.lock().unwrap() += 1;
            Ok(())
        }
    }

    #[test]
    fn test_entries_with_and_without_node() {
        let config = DiscoveryConfig::new(STREAMER_PREFIX, 3);
        assert_eq!(
            config.entries(5555),
            vec![("streamer.3".to_string(), "streamer.3:5555".to_string())]
        );

        let config = config.node_addr("10.0.0.7");
        assert_eq!(
            config.entries(5555)[1],
            ("streamer.node.3".to_string(), "10.0.0.7:5555".to_string())
        );
    }

    #[tokio::test]
    async fn test_announces_until_cancelled() {
        let announcer = Arc::new(MemoryAnnouncer::default());
        let cancel = CancellationToken::new();
        let config = DiscoveryConfig::new(RECORDER_PREFIX, 1)
            .node_addr("node-a")
            .interval(Duration::from_millis(10));

        let handle = spawn_announcer(config, announcer.clone(), 5556, cancel.clone());
        tokio::time::sleep(Duration::from_millis(35)).await;
        cancel.cancel();
        handle.await.unwrap();

        let entries = announcer.entries.lock().unwrap();
        assert_eq!(entries.get("recorder.1").unwrap(), "recorder.1:5556");
        assert_eq!(entries.get("recorder.node.1").unwrap(), "node-a:5556");
        assert!(*announcer.writes.lock().unwrap() >= 4);
    }
}
