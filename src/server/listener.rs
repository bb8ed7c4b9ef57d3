//! Streaming server listener
//!
//! Handles the TCP accept loop, negotiation, and attaching each accepted
//! connection to a shared session.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::io::AsyncReadExt;
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use super::config::ServerConfig;
use super::discovery::{spawn_announcer, Announcer};
use crate::device::CaptureDevice;
use crate::error::{Error, Result};
use crate::media::is_split_format;
use crate::pool::{ChannelPool, StreamKey};
use crate::protocol::{read_request, write_rejection, StreamRequest};
use crate::session::{SessionConfig, StreamSession};
use crate::sink::{InboundSocketSink, Sink, SinkId};

// Attempts at attaching to a session that stops between lookup and attach
const ATTACH_ATTEMPTS: usize = 3;

#[derive(Default)]
struct ServerState {
    sessions: HashMap<StreamKey, Arc<StreamSession>>,
    connections: HashMap<SocketAddr, StreamKey>,
}

struct Shared {
    config: ServerConfig,
    pool: Arc<ChannelPool>,
    device: Arc<dyn CaptureDevice>,
    state: Mutex<ServerState>,
    cancel: CancellationToken,
    tracker: TaskTracker,
}

/// Serves shared streams to TCP clients
///
/// Each client sends a negotiation payload; clients asking for the same
/// stream key share one session.
pub struct StreamServer {
    shared: Arc<Shared>,
    listener: Mutex<Option<TcpListener>>,
    local_addr: SocketAddr,
    announcer: Option<Arc<dyn Announcer>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl StreamServer {
    /// Bind the listening socket
    pub async fn bind(
        config: ServerConfig,
        pool: Arc<ChannelPool>,
        device: Arc<dyn CaptureDevice>,
    ) -> Result<Self> {
        let listener = TcpListener::bind(config.bind_addr).await?;
        let local_addr = listener.local_addr()?;

        Ok(Self {
            shared: Arc::new(Shared {
                config,
                pool,
                device,
                state: Mutex::new(ServerState::default()),
                cancel: CancellationToken::new(),
                tracker: TaskTracker::new(),
            }),
            listener: Mutex::new(Some(listener)),
            local_addr,
            announcer: None,
        })
    }

    /// Announce into `announcer` while running, if discovery is configured
    pub fn with_announcer(mut self, announcer: Arc<dyn Announcer>) -> Self {
        self.announcer = Some(announcer);
        self
    }

    /// Address actually bound
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn config(&self) -> &ServerConfig {
        &self.shared.config
    }

    /// Number of distinct streams currently served
    pub fn stream_count(&self) -> usize {
        let mut state = lock(&self.shared.state);
        state.sessions.retain(|_, session| !session.is_stopped());
        state.sessions.len()
    }

    /// Number of attached clients
    pub fn client_count(&self) -> usize {
        lock(&self.shared.state).connections.len()
    }

    /// Ask a running server to stop
    pub fn shutdown(&self) {
        self.shared.cancel.cancel();
    }

    /// Token cancelled when the server shuts down
    pub fn cancel_token(&self) -> CancellationToken {
        self.shared.cancel.clone()
    }

    /// Run the server
    ///
    /// This method returns once `shutdown` is called, after every client has
    /// been detached and every session it started has stopped.
    pub async fn run(&self) -> Result<()> {
        let listener = lock(&self.listener)
            .take()
            .ok_or_else(|| Error::Configuration("server is already running".to_string()))?;
        tracing::info!(addr = %self.local_addr, "Stream server listening");

        let announcer = match (&self.shared.config.discovery, &self.announcer) {
            (Some(discovery), Some(announcer)) => Some(spawn_announcer(
                discovery.clone(),
                Arc::clone(announcer),
                self.local_addr.port(),
                self.shared.cancel.child_token(),
            )),
            _ => None,
        };

        loop {
            tokio::select! {
                _ = self.shared.cancel.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok((socket, peer_addr)) => self.handle_connection(socket, peer_addr),
                    Err(e) => tracing::error!(error = %e, "Failed to accept connection"),
                },
            }
        }
        drop(listener);

        tracing::info!(addr = %self.local_addr, "Stream server shutting down");
        self.shared.tracker.close();
        self.shared.tracker.wait().await;

        let sessions: Vec<_> = lock(&self.shared.state)
            .sessions
            .drain()
            .map(|(_, session)| session)
            .collect();
        for session in sessions {
            session.stop().await;
        }
        if let Some(announcer) = announcer {
            let _ = announcer.await;
        }
        Ok(())
    }

    /// Run the server with graceful shutdown
    pub async fn run_until<F>(&self, shutdown: F) -> Result<()>
    where
        F: std::future::Future<Output = ()>,
    {
        let cancel = self.shared.cancel.clone();
        let trigger = async move {
            shutdown.await;
            tracing::info!("Shutdown signal received");
            cancel.cancel();
        };
        let (result, _) = tokio::join!(self.run(), async {
            tokio::select! {
                _ = trigger => {}
                _ = self.shared.cancel.cancelled() => {}
            }
        });
        result
    }

    fn handle_connection(&self, socket: TcpStream, peer_addr: SocketAddr) {
        tracing::debug!(peer = %peer_addr, "New connection");

        if self.shared.config.tcp_nodelay {
            if let Err(e) = socket.set_nodelay(true) {
                tracing::error!(error = %e, "Failed to configure socket");
                return;
            }
        }

        let shared = Arc::clone(&self.shared);
        self.shared.tracker.spawn(async move {
            if let Err(e) = shared.serve_client(socket, peer_addr).await {
                tracing::debug!(peer = %peer_addr, error = %e, "Connection error");
            }
            tracing::debug!(peer = %peer_addr, "Connection closed");
        });
    }
}

impl Shared {
    async fn serve_client(self: Arc<Self>, socket: TcpStream, peer: SocketAddr) -> Result<()> {
        let (mut reader, mut writer) = socket.into_split();

        let request = tokio::select! {
            _ = self.cancel.cancelled() => return Ok(()),
            read = tokio::time::timeout(self.config.handshake_timeout, read_request(&mut reader)) => {
                read.map_err(|_| Error::Timeout("negotiation payload"))??
            }
        };

        let session = match self.prepare_session(&request) {
            Ok(session) => session,
            Err(e) => {
                tracing::warn!(peer = %peer, format = %request.format, reason = %e, "Request rejected");
                write_rejection(&mut writer).await?;
                return Ok(());
            }
        };

        let closed = self.cancel.child_token();
        let sink: Arc<dyn Sink> = {
            let shared = Arc::downgrade(&self);
            let closed = closed.clone();
            Arc::new(
                InboundSocketSink::new(peer, writer)
                    .write_timeout(self.config.write_timeout)
                    .end_of_stream(self.config.prepend_size)
                    .on_close(move |peer| {
                        closed.cancel();
                        if let Some(shared) = shared.upgrade() {
                            shared.forget(peer);
                        }
                    }),
            )
        };

        let session = match self.attach(session, &request, peer, Arc::clone(&sink)) {
            Ok(session) => session,
            Err(e) => {
                self.forget(peer);
                return Err(e);
            }
        };
        tracing::info!(
            peer = %peer,
            stream = %session.key(),
            clients = session.sink_count(),
            "Client attached"
        );

        watch_disconnect(&mut reader, &closed).await;

        session.remove_sink(&SinkId::from(peer));
        sink.close().await;
        tracing::info!(peer = %peer, stream = %session.key(), "Client detached");
        Ok(())
    }

    fn session_config(&self, request: &StreamRequest) -> SessionConfig {
        let native = self.device.native_resolution();
        let format = if request.format.is_empty() {
            self.config.default_format.clone()
        } else {
            request.format.clone()
        };

        let mut options = self.config.recording_options.clone();
        options.extend(request.encoder_options());
        let default_resize = options.remove("resize");
        let resize = request.resize.as_ref().or(default_resize.as_ref());
        // raw formats go out as the encoder writes them
        let split = self.config.split_frames && is_split_format(&format);

        SessionConfig::new(format)
            .options(options)
            .resize(resize, native)
            .split_frames(split)
            .prepend_size(self.config.prepend_size)
            .stop_when_idle(true)
    }

    /// Find or create a running session for `request`
    fn prepare_session(&self, request: &StreamRequest) -> Result<Arc<StreamSession>> {
        let config = self.session_config(request);
        let key = config.key(self.device.native_resolution());

        let session = {
            let mut state = lock(&self.state);
            state.sessions.retain(|_, session| !session.is_stopped());

            match state.sessions.get(&key) {
                Some(session) => Arc::clone(session),
                None => {
                    let limit = self.config.max_streams;
                    if limit > 0 && state.sessions.len() >= limit {
                        return Err(Error::ResourceExhausted(format!(
                            "distinct stream limit of {} reached",
                            limit
                        )));
                    }
                    let session = self.pool.open(config, Arc::clone(&self.device))?;
                    state.sessions.insert(key, Arc::clone(&session));
                    session
                }
            }
        };

        if let Err(e) = session.start() {
            // nobody else can be attached to a session that never started
            if session.sink_count() == 0 {
                lock(&self.state).sessions.remove(session.key());
                let stopping = Arc::clone(&session);
                tokio::spawn(async move { stopping.stop().await });
            }
            return Err(e);
        }
        Ok(session)
    }

    fn attach(
        &self,
        mut session: Arc<StreamSession>,
        request: &StreamRequest,
        peer: SocketAddr,
        sink: Arc<dyn Sink>,
    ) -> Result<Arc<StreamSession>> {
        for _ in 0..ATTACH_ATTEMPTS {
            {
                let mut state = lock(&self.state);
                state.connections.insert(peer, session.key().clone());
            }
            match session.add_sink(peer, Arc::clone(&sink)) {
                Ok(()) => return Ok(session),
                Err(Error::SessionStopped) => {
                    // last client left while this one negotiated
                    session = self.prepare_session(request)?;
                }
                Err(e) => return Err(e),
            }
        }
        Err(Error::SessionStopped)
    }

    fn forget(&self, peer: SocketAddr) {
        let mut state = lock(&self.state);
        if let Some(key) = state.connections.remove(&peer) {
            let idle = state
                .sessions
                .get(&key)
                .map_or(false, |session| session.is_stopped());
            if idle {
                state.sessions.remove(&key);
            }
        }
    }
}

// Clients send nothing after negotiating; any read result other than data
// means the peer went away.
async fn watch_disconnect(reader: &mut OwnedReadHalf, closed: &CancellationToken) {
    let mut scratch = [0u8; 256];
    loop {
        tokio::select! {
            _ = closed.cancelled() => break,
            read = reader.read(&mut scratch) => match read {
                Ok(0) | Err(_) => break,
                Ok(_) => continue,
            },
        }
    }
}
