//! Channel pool implementation

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use bytes::Bytes;
use tokio::sync::Mutex as AsyncMutex;

use super::config::PoolConfig;
use super::key::{StreamKey, StreamOptions};
use crate::device::{CaptureDevice, Channel};
use crate::error::{Error, Result};
use crate::session::{SessionConfig, StreamSession};
use crate::sink::Sink;

/// One hand-out of a channel to a session
#[derive(Debug)]
struct Lease {
    key: StreamKey,
    ticket: u64,
}

/// The still channel and the number of guards holding it
#[derive(Debug, Clone, Copy)]
struct StillLease {
    channel: Channel,
    holders: usize,
}

#[derive(Debug, Default)]
struct PoolState {
    free: VecDeque<Channel>,
    sessions: HashMap<StreamKey, Arc<StreamSession>>,
    channels: HashMap<Channel, Lease>,
    still: Option<StillLease>,
    next_ticket: u64,
}

/// Owner of the device's encode channels
///
/// Equivalent requests share one [`StreamSession`]; a channel goes back to
/// the free list when its session stops. All bookkeeping sits behind one
/// mutex that is never held across an await.
pub struct ChannelPool {
    config: PoolConfig,
    state: Mutex<PoolState>,
    capture_lock: AsyncMutex<()>,
}

/// Reservation of the still-capture channel, returned on drop
pub struct StillCapture {
    pool: Arc<ChannelPool>,
    channel: Channel,
}

impl StillCapture {
    pub fn channel(&self) -> Channel {
        self.channel
    }
}

impl Drop for StillCapture {
    fn drop(&mut self) {
        self.pool.release_still(self.channel);
    }
}

impl ChannelPool {
    pub fn new(config: PoolConfig) -> Arc<Self> {
        let state = PoolState {
            free: (0..config.channels).map(Channel).collect(),
            ..PoolState::default()
        };
        Arc::new(Self {
            config,
            state: Mutex::new(state),
            capture_lock: AsyncMutex::new(()),
        })
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    fn state(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Return the live session for `key`, or build one on a free channel
    ///
    /// `factory` runs under the pool lock and must not call back into the
    /// pool. Fails with [`Error::ResourceExhausted`] when no channel is free.
    pub fn acquire<F>(self: &Arc<Self>, key: &StreamKey, factory: F) -> Result<Arc<StreamSession>>
    where
        F: FnOnce(Channel) -> Result<Arc<StreamSession>>,
    {
        let mut state = self.state();

        if let Some(existing) = state.sessions.get(key) {
            if !existing.is_stopped() {
                tracing::debug!(stream = %key, channel = %existing.channel(), "Joining existing session");
                return Ok(Arc::clone(existing));
            }
            // stopped without releasing; reclaim its channel now
            let channel = existing.channel();
            state.sessions.remove(key);
            if state.channels.remove(&channel).is_some() {
                state.free.push_back(channel);
                tracing::debug!(stream = %key, channel = %channel, "Reclaimed channel of stopped session");
            }
        }

        let channel = state.free.pop_front().ok_or_else(|| {
            Error::ResourceExhausted(format!("no free channel for stream {}", key))
        })?;

        let session = match factory(channel) {
            Ok(session) => session,
            Err(e) => {
                state.free.push_front(channel);
                return Err(e);
            }
        };

        let ticket = state.next_ticket;
        state.next_ticket += 1;
        let pool = Arc::downgrade(self);
        session.on_release(move |channel| {
            if let Some(pool) = pool.upgrade() {
                pool.release_lease(channel, ticket);
            }
        });

        state.sessions.insert(key.clone(), Arc::clone(&session));
        state.channels.insert(
            channel,
            Lease {
                key: key.clone(),
                ticket,
            },
        );

        tracing::info!(
            stream = %key,
            channel = %channel,
            available = state.free.len(),
            "Channel acquired"
        );
        Ok(session)
    }

    /// Return the live session for `config`, creating it if needed
    pub fn open(
        self: &Arc<Self>,
        config: SessionConfig,
        device: Arc<dyn CaptureDevice>,
    ) -> Result<Arc<StreamSession>> {
        let key = config.key(device.native_resolution());
        self.acquire(&key, move |channel| Ok(StreamSession::new(channel, config, device)))
    }

    /// Give `channel` back to the free list
    ///
    /// Called when a session stops. A channel that is not currently handed out
    /// is ignored.
    pub fn release(&self, channel: Channel) {
        let mut state = self.state();
        if let Some(lease) = state.channels.remove(&channel) {
            state.sessions.remove(&lease.key);
            state.free.push_back(channel);
            tracing::info!(stream = %lease.key, channel = %channel, available = state.free.len(), "Channel released");
        } else if state.still.is_some_and(|still| still.channel == channel) {
            state.still = None;
            state.free.push_back(channel);
            tracing::debug!(channel = %channel, "Still channel released");
        }
    }

    // Only the hand-out identified by `ticket` may free the channel; a session
    // that stopped after its channel was reclaimed and re-issued is ignored.
    fn release_lease(&self, channel: Channel, ticket: u64) {
        let mut state = self.state();
        if !state
            .channels
            .get(&channel)
            .is_some_and(|lease| lease.ticket == ticket)
        {
            return;
        }
        if let Some(lease) = state.channels.remove(&channel) {
            state.sessions.remove(&lease.key);
            state.free.push_back(channel);
            tracing::info!(stream = %lease.key, channel = %channel, available = state.free.len(), "Channel released");
        }
    }

    // The last guard out returns the still channel.
    fn release_still(&self, channel: Channel) {
        let mut state = self.state();
        let Some(mut still) = state.still.filter(|still| still.channel == channel) else {
            return;
        };
        still.holders = still.holders.saturating_sub(1);
        if still.holders > 0 {
            state.still = Some(still);
            return;
        }
        state.still = None;
        state.free.push_back(channel);
        tracing::debug!(channel = %channel, "Still channel released");
    }

    /// Session currently serving `key`
    pub fn session(&self, key: &StreamKey) -> Option<Arc<StreamSession>> {
        self.state().sessions.get(key).cloned()
    }

    pub fn session_count(&self) -> usize {
        self.state().sessions.len()
    }

    /// Number of free channels
    pub fn available(&self) -> usize {
        self.state().free.len()
    }

    /// Reserve the still-capture channel
    ///
    /// Guards share one channel, which returns to the free list when the last
    /// of them is dropped.
    pub fn reserve_still(self: &Arc<Self>) -> Result<StillCapture> {
        let mut state = self.state();
        let channel = match state.still.as_mut() {
            Some(still) => {
                still.holders += 1;
                still.channel
            }
            None => {
                let channel = state.free.pop_front().ok_or_else(|| {
                    Error::ResourceExhausted("no free channel for still capture".to_string())
                })?;
                state.still = Some(StillLease {
                    channel,
                    holders: 1,
                });
                channel
            }
        };
        Ok(StillCapture {
            pool: Arc::clone(self),
            channel,
        })
    }

    /// Capture one image on the still channel and write it to `sink`
    ///
    /// Captures are serialized; the channel is returned as soon as the image
    /// is taken. Returns the sink's answer.
    pub async fn capture_still(
        self: &Arc<Self>,
        device: Arc<dyn CaptureDevice>,
        sink: &dyn Sink,
        format: &str,
        options: &StreamOptions,
    ) -> Result<bool> {
        let image = self.capture_image(device, format, options).await?;
        sink.write(image).await
    }

    async fn capture_image(
        self: &Arc<Self>,
        device: Arc<dyn CaptureDevice>,
        format: &str,
        options: &StreamOptions,
    ) -> Result<Bytes> {
        let _serial = self.capture_lock.lock().await;
        let reservation = self.reserve_still()?;
        let channel = reservation.channel();
        let format = format.to_string();
        let options = options.clone();

        let image = tokio::task::spawn_blocking(move || device.capture_once(&format, channel, &options))
            .await
            .map_err(|e| Error::Device(format!("still capture on channel {} failed: {}", channel, e)))??;
        drop(reservation);

        tracing::debug!(channel = %channel, bytes = image.len(), "Still captured");
        Ok(image)
    }

    /// Stop every live session
    pub async fn shutdown(&self) {
        let sessions: Vec<_> = self.state().sessions.values().cloned().collect();
        for session in sessions {
            session.stop().await;
        }
        tracing::info!(available = self.available(), "Channel pool shut down");
    }
}

impl std::fmt::Debug for ChannelPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state();
        f.debug_struct("ChannelPool")
            .field("channels", &self.config.channels)
            .field("free", &state.free.len())
            .field("sessions", &state.sessions.len())
            .finish()
    }
}
