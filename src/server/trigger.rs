//! Network trigger listener
//!
//! A bare TCP connect to the trigger port is a one-shot remote notification:
//! the connection is closed immediately, the handler is triggered, and after
//! `detrigger_delay` it is detriggered and the listener re-arms. Connections
//! arriving while triggered are ignored.

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use super::discovery::{spawn_announcer, Announcer, DiscoveryConfig};
use crate::error::{Error, Result};
use crate::protocol::constants::DEFAULT_TRIGGER_PORT;

/// Reacts to remote triggers
#[async_trait]
pub trait TriggerHandler: Send + Sync + 'static {
    async fn trigger(&self);

    async fn detrigger(&self);
}

/// Trigger listener options
#[derive(Debug, Clone)]
pub struct TriggerConfig {
    /// Address to bind to
    pub bind_addr: SocketAddr,

    /// Time between trigger and detrigger
    pub detrigger_delay: Duration,

    /// Periodic self-announcement, if any
    pub discovery: Option<DiscoveryConfig>,
}

impl Default for TriggerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from((Ipv4Addr::UNSPECIFIED, DEFAULT_TRIGGER_PORT)),
            detrigger_delay: Duration::from_secs(5),
            discovery: None,
        }
    }
}

impl TriggerConfig {
    pub fn bind(mut self, addr: SocketAddr) -> Self {
        self.bind_addr = addr;
        self
    }

    pub fn detrigger_delay(mut self, delay: Duration) -> Self {
        self.detrigger_delay = delay;
        self
    }

    pub fn discovery(mut self, discovery: DiscoveryConfig) -> Self {
        self.discovery = Some(discovery);
        self
    }
}

/// Listens for trigger connections
pub struct TriggerServer<H: TriggerHandler> {
    config: TriggerConfig,
    handler: Arc<H>,
    listener: Mutex<Option<TcpListener>>,
    local_addr: SocketAddr,
    triggered: Arc<AtomicBool>,
    cancel: CancellationToken,
    announcer: Option<Arc<dyn Announcer>>,
}

impl<H: TriggerHandler> TriggerServer<H> {
    pub async fn bind(config: TriggerConfig, handler: H) -> Result<Self> {
        let listener = TcpListener::bind(config.bind_addr).await?;
        let local_addr = listener.local_addr()?;
        Ok(Self {
            config,
            handler: Arc::new(handler),
            listener: Mutex::new(Some(listener)),
            local_addr,
            triggered: Arc::new(AtomicBool::new(false)),
            cancel: CancellationToken::new(),
            announcer: None,
        })
    }

    pub fn with_announcer(mut self, announcer: Arc<dyn Announcer>) -> Self {
        self.announcer = Some(announcer);
        self
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn handler(&self) -> &Arc<H> {
        &self.handler
    }

    /// Whether a trigger is currently in progress
    pub fn is_triggered(&self) -> bool {
        self.triggered.load(Ordering::SeqCst)
    }

    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    /// Run until `shutdown`; an in-progress trigger is detriggered first
    pub async fn run(&self) -> Result<()> {
        let listener = self
            .listener
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or_else(|| Error::Configuration("trigger server is already running".to_string()))?;
        tracing::info!(addr = %self.local_addr, "Trigger server listening");

        let announcer = match (&self.config.discovery, &self.announcer) {
            (Some(discovery), Some(announcer)) => Some(spawn_announcer(
                discovery.clone(),
                Arc::clone(announcer),
                self.local_addr.port(),
                self.cancel.child_token(),
            )),
            _ => None,
        };

        let tracker = TaskTracker::new();
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok((socket, peer)) => {
                        drop(socket);
                        if self.triggered.swap(true, Ordering::SeqCst) {
                            tracing::debug!(peer = %peer, "Already triggered, ignoring");
                            continue;
                        }
                        tracing::info!(peer = %peer, "Triggered");
                        tracker.spawn(self.trigger_cycle());
                    }
                    Err(e) => tracing::error!(error = %e, "Failed to accept connection"),
                },
            }
        }

        tracker.close();
        tracker.wait().await;
        if let Some(announcer) = announcer {
            let _ = announcer.await;
        }
        tracing::info!(addr = %self.local_addr, "Trigger server stopped");
        Ok(())
    }

    fn trigger_cycle(&self) -> impl std::future::Future<Output = ()> + Send + 'static {
        let handler = Arc::clone(&self.handler);
        let triggered = Arc::clone(&self.triggered);
        let cancel = self.cancel.clone();
        let delay = self.config.detrigger_delay;

        async move {
            handler.trigger().await;
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = cancel.cancelled() => {}
            }
            handler.detrigger().await;
            triggered.store(false, Ordering::SeqCst);
            tracing::info!("Detriggered");
        }
    }
}
