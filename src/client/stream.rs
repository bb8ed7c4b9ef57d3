//! Stream client
//!
//! Consumes frames from a remote stream server, either by connecting out and
//! negotiating (`fetch_stream`) or by accepting one incoming connection that
//! pushes size-prepended frames (`serve_stream_receiver`). Each stream id gets
//! a reader task that keeps the latest frame and optionally fans frames out to
//! local sinks.

use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use bytes::Bytes;
use tokio::io::AsyncRead;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::config::ClientConfig;
use crate::distributor::{Distributor, DistributorConfig};
use crate::error::{Error, Result};
use crate::protocol::framing::read_chunk;
use crate::protocol::{read_frame, write_request, StreamRequest};
use crate::sink::{Sink, SinkId};

type Outputs = Arc<Mutex<Option<Arc<Distributor>>>>;

struct StreamHandle {
    cancel: CancellationToken,
    task: JoinHandle<()>,
    frames: watch::Receiver<Option<Bytes>>,
    outputs: Outputs,
    port: Option<u16>,
}

impl StreamHandle {
    fn is_active(&self) -> bool {
        !self.task.is_finished()
    }
}

/// How a reader task pulls frames off its socket
#[derive(Debug, Clone, Copy)]
enum Framing {
    SizePrepended(u32),
    Chunked(usize),
}

impl Framing {
    async fn next<R: AsyncRead + Unpin>(self, reader: &mut R) -> Result<Option<Bytes>> {
        match self {
            Framing::SizePrepended(max) => read_frame(reader, max).await,
            Framing::Chunked(size) => read_chunk(reader, size).await,
        }
    }
}

/// Client for remote stream servers
///
/// # Example
/// ```no_run
/// use std::time::Duration;
/// use camshare::client::{ClientConfig, StreamClient};
/// use camshare::protocol::StreamRequest;
///
/// # async fn example() -> camshare::error::Result<()> {
/// let client = StreamClient::new(ClientConfig::new("camera.local"));
/// client.fetch_stream("front", StreamRequest::new("mjpeg")).await?;
///
/// if let Some(frame) = client.get_next_frame("front", Duration::from_secs(1)).await? {
///     println!("{} bytes", frame.len());
/// }
/// client.shutdown().await;
/// # Ok(())
/// # }
/// ```
pub struct StreamClient {
    config: ClientConfig,
    streams: Mutex<HashMap<String, StreamHandle>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl StreamClient {
    pub fn new(config: ClientConfig) -> Self {
        Self {
            config,
            streams: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    fn framing(&self) -> Framing {
        if self.config.size_prepended {
            Framing::SizePrepended(self.config.max_frame_size)
        } else {
            Framing::Chunked(self.config.chunk_size)
        }
    }

    /// Fail if `id` still has a running reader; a finished one is discarded
    fn ensure_free(&self, id: &str) -> Result<()> {
        let mut streams = lock(&self.streams);
        match streams.get(id) {
            Some(handle) if handle.is_active() => Err(Error::StreamActive(id.to_string())),
            Some(_) => {
                streams.remove(id);
                Ok(())
            }
            None => Ok(()),
        }
    }

    /// Connect to the server, negotiate `request` and read frames under `id`
    pub async fn fetch_stream(&self, id: &str, request: StreamRequest) -> Result<()> {
        self.ensure_free(id)?;

        let addr = format!("{}:{}", self.config.host, self.config.stream_port);
        let mut socket = tokio::time::timeout(self.config.connect_timeout, TcpStream::connect(&addr))
            .await
            .map_err(|_| Error::Timeout("stream server connection"))?
            .map_err(|e| Error::Connection(format!("{}: {}", addr, e)))?;
        socket.set_nodelay(true)?;
        write_request(&mut socket, &request).await?;
        tracing::info!(stream = %id, addr = %addr, format = %request.format, "Fetching stream");

        self.register(id, None, |cancel, frames, outputs| {
            read_loop(id.to_string(), socket, self.framing(), frames, outputs, cancel)
        })
    }

    /// Accept one connection on `port` that pushes size-prepended frames
    ///
    /// Returns the bound port, so `0` picks an ephemeral one.
    pub async fn serve_stream_receiver(&self, id: &str, port: u16) -> Result<u16> {
        self.ensure_free(id)?;

        let listener = TcpListener::bind(SocketAddr::from((Ipv4Addr::UNSPECIFIED, port))).await?;
        let port = listener.local_addr()?.port();
        tracing::info!(stream = %id, port, "Waiting for stream sender");

        let framing = Framing::SizePrepended(self.config.max_frame_size);
        let stream_id = id.to_string();
        self.register(id, Some(port), move |cancel, frames, outputs| async move {
            let socket = tokio::select! {
                _ = cancel.cancelled() => return,
                accepted = listener.accept() => match accepted {
                    Ok((socket, peer)) => {
                        tracing::info!(stream = %stream_id, peer = %peer, "Stream sender connected");
                        socket
                    }
                    Err(e) => {
                        tracing::error!(stream = %stream_id, error = %e, "Failed to accept stream sender");
                        return;
                    }
                },
            };
            drop(listener);
            read_loop(stream_id, socket, framing, frames, outputs, cancel).await
        })?;
        Ok(port)
    }

    fn register<F, Fut>(&self, id: &str, port: Option<u16>, reader: F) -> Result<()>
    where
        F: FnOnce(CancellationToken, watch::Sender<Option<Bytes>>, Outputs) -> Fut,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        let mut streams = lock(&self.streams);
        if streams.get(id).is_some_and(StreamHandle::is_active) {
            return Err(Error::StreamActive(id.to_string()));
        }

        let cancel = CancellationToken::new();
        let (tx, frames) = watch::channel(None);
        let outputs: Outputs = Arc::new(Mutex::new(None));
        let task = tokio::spawn(reader(cancel.clone(), tx, Arc::clone(&outputs)));

        streams.insert(
            id.to_string(),
            StreamHandle {
                cancel,
                task,
                frames,
                outputs,
                port,
            },
        );
        Ok(())
    }

    /// Whether `id` has a reader that is still receiving
    pub fn is_active(&self, id: &str) -> bool {
        lock(&self.streams).get(id).is_some_and(StreamHandle::is_active)
    }

    /// Port a receiver stream is listening on
    pub fn receiver_port(&self, id: &str) -> Option<u16> {
        lock(&self.streams).get(id).and_then(|h| h.port)
    }

    /// Most recent frame received under `id`
    pub fn latest_frame(&self, id: &str) -> Result<Option<Bytes>> {
        let streams = lock(&self.streams);
        let handle = streams
            .get(id)
            .ok_or_else(|| Error::UnknownStream(id.to_string()))?;
        let frame = handle.frames.borrow().clone();
        Ok(frame)
    }

    /// Wait up to `timeout` for a frame newer than the call
    ///
    /// Returns `None` on timeout or once the stream has ended.
    pub async fn get_next_frame(&self, id: &str, timeout: Duration) -> Result<Option<Bytes>> {
        let mut frames = {
            let streams = lock(&self.streams);
            streams
                .get(id)
                .ok_or_else(|| Error::UnknownStream(id.to_string()))?
                .frames
                .clone()
        };
        let _ = frames.borrow_and_update();

        match tokio::time::timeout(timeout, frames.changed()).await {
            Ok(Ok(())) => Ok(frames.borrow_and_update().clone()),
            Ok(Err(_)) | Err(_) => Ok(None),
        }
    }

    /// Forward every frame of `id` to `sink` as well
    pub fn write_stream_into(
        &self,
        id: &str,
        sink_id: impl Into<SinkId>,
        sink: Arc<dyn Sink>,
    ) -> Result<()> {
        let outputs = {
            let streams = lock(&self.streams);
            let handle = streams
                .get(id)
                .ok_or_else(|| Error::UnknownStream(id.to_string()))?;
            Arc::clone(&handle.outputs)
        };

        let mut outputs = lock(&outputs);
        let distributor = outputs.get_or_insert_with(|| {
            let distributor = Distributor::new(DistributorConfig::default().label(id));
            distributor.start();
            distributor
        });
        distributor.add_sink(sink_id, sink);
        Ok(())
    }

    /// Stop forwarding `id` to `sink_id`; the sink is returned unclosed
    pub async fn remove_sink_from_stream(
        &self,
        id: &str,
        sink_id: &SinkId,
    ) -> Result<Option<Arc<dyn Sink>>> {
        let outputs = {
            let streams = lock(&self.streams);
            let handle = streams
                .get(id)
                .ok_or_else(|| Error::UnknownStream(id.to_string()))?;
            Arc::clone(&handle.outputs)
        };

        let (removed, idle) = {
            let mut outputs = lock(&outputs);
            let Some(distributor) = outputs.as_ref() else {
                return Ok(None);
            };
            let removed = distributor.remove_sink(sink_id);
            let idle = if distributor.sink_count() == 0 {
                outputs.take()
            } else {
                None
            };
            (removed, idle)
        };

        if let Some(distributor) = idle {
            distributor.stop();
            distributor.shutdown().await;
        }
        Ok(removed)
    }

    /// Stop the reader for `id` and close its sinks
    ///
    /// Returns whether a stream was registered under `id`.
    pub async fn stop_stream(&self, id: &str) -> bool {
        let Some(handle) = lock(&self.streams).remove(id) else {
            return false;
        };

        handle.cancel.cancel();
        if let Err(e) = handle.task.await {
            tracing::error!(stream = %id, error = %e, "Stream reader panicked");
        }
        let distributor = lock(&handle.outputs).take();
        if let Some(distributor) = distributor {
            distributor.stop();
            distributor.shutdown().await;
        }
        tracing::info!(stream = %id, "Stream stopped");
        true
    }

    /// Stop every stream
    pub async fn shutdown(&self) {
        let ids: Vec<String> = lock(&self.streams).keys().cloned().collect();
        for id in ids {
            self.stop_stream(&id).await;
        }
    }

    /// Notify the trigger listener on the configured trigger port
    pub async fn trigger(&self) -> Result<()> {
        self.trigger_port(self.config.trigger_port).await
    }

    /// Notify a trigger listener on `port` of the configured host
    pub async fn trigger_port(&self, port: u16) -> Result<()> {
        let addr = format!("{}:{}", self.config.host, port);
        let socket = tokio::time::timeout(self.config.connect_timeout, TcpStream::connect(&addr))
            .await
            .map_err(|_| Error::Timeout("trigger connection"))?
            .map_err(|e| Error::Connection(format!("{}: {}", addr, e)))?;
        drop(socket);
        tracing::debug!(addr = %addr, "Trigger sent");
        Ok(())
    }
}

impl std::fmt::Debug for StreamClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamClient")
            .field("host", &self.config.host)
            .field("streams", &lock(&self.streams).len())
            .finish()
    }
}

async fn read_loop(
    id: String,
    mut socket: TcpStream,
    framing: Framing,
    frames: watch::Sender<Option<Bytes>>,
    outputs: Outputs,
    cancel: CancellationToken,
) {
    let mut received = 0u64;
    loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => break,
            next = framing.next(&mut socket) => next,
        };

        match next {
            Ok(Some(frame)) => {
                received += 1;
                if let Some(distributor) = lock(&outputs).as_ref() {
                    distributor.write(frame.clone());
                }
                frames.send_replace(Some(frame));
            }
            Ok(None) => {
                tracing::info!(stream = %id, frames = received, "Stream ended by server");
                break;
            }
            Err(e) => {
                tracing::warn!(stream = %id, error = %e, "Stream read failed");
                break;
            }
        }
    }
    tracing::debug!(stream = %id, frames = received, "Stream reader finished");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::mock::MockDevice;
    use crate::device::Channel;
    use crate::media::format::JPEG_SOI;
    use crate::pool::{ChannelPool, PoolConfig};
    use crate::protocol::{read_request, size_prefixed, write_length};
    use crate::server::{ServerConfig, StreamServer};
    use crate::sink::CallbackSink;
    use tokio::io::AsyncWriteExt;

    async fn eventually<F: Fn() -> bool>(check: F) {
        for _ in 0..200 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached");
    }

    fn jpeg(body: &[u8]) -> Vec<u8> {
        [&JPEG_SOI[..], body].concat()
    }

    fn local(port: u16) -> ClientConfig {
        ClientConfig::new("127.0.0.1").stream_port(port)
    }

    #[tokio::test]
    async fn test_fetch_from_stream_server() {
        let device = Arc::new(MockDevice::new());
        let pool = ChannelPool::new(PoolConfig::default());
        let config = ServerConfig::default().bind("127.0.0.1:0".parse().unwrap());
        let server = Arc::new(
            StreamServer::bind(config, Arc::clone(&pool), device.clone())
                .await
                .unwrap(),
        );
        let runner = Arc::clone(&server);
        let task = tokio::spawn(async move { runner.run().await });

        let client = Arc::new(StreamClient::new(local(server.local_addr().port())));
        client
            .fetch_stream("cam", StreamRequest::new("mjpeg"))
            .await
            .unwrap();
        eventually(|| server.client_count() == 1).await;

        let waiter = Arc::clone(&client);
        let next = tokio::spawn(async move {
            waiter.get_next_frame("cam", Duration::from_secs(2)).await
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        device.push(Channel(0), &jpeg(b"a"));
        device.push(Channel(0), &jpeg(b"b"));

        let frame = next.await.unwrap().unwrap().unwrap();
        assert_eq!(frame, jpeg(b"a"));
        assert_eq!(client.latest_frame("cam").unwrap().unwrap(), jpeg(b"a"));
        assert!(client.is_active("cam"));

        assert!(client.stop_stream("cam").await);
        assert!(matches!(
            client.get_next_frame("cam", Duration::from_millis(10)).await,
            Err(Error::UnknownStream(_))
        ));
        assert!(!client.stop_stream("cam").await);

        // the server notices the disconnect and frees the channel
        eventually(|| pool.available() == 4).await;
        server.shutdown();
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_duplicate_fetch_is_rejected_until_finished() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = tokio::spawn(async move {
            let (mut first, _) = listener.accept().await.unwrap();
            let request = read_request(&mut first).await.unwrap();
            assert_eq!(request.format, "mjpeg");
            let (mut second, _) = listener.accept().await.unwrap();
            read_request(&mut second).await.unwrap();
            // end the first stream with a rejection
            write_length(&mut first, 0).await.unwrap();
            (first, second)
        });

        let client = StreamClient::new(local(port));
        client
            .fetch_stream("cam", StreamRequest::new("mjpeg"))
            .await
            .unwrap();
        // the first reader stays active until the server answers
        assert!(matches!(
            client.fetch_stream("cam", StreamRequest::new("mjpeg")).await,
            Err(Error::StreamActive(_))
        ));
        client
            .fetch_stream("other", StreamRequest::new("mjpeg"))
            .await
            .unwrap();

        let _sockets = server.await.unwrap();
        eventually(|| !client.is_active("cam")).await;
        assert_eq!(
            client
                .get_next_frame("cam", Duration::from_millis(10))
                .await
                .unwrap(),
            None
        );
        client.shutdown().await;
        assert!(!client.is_active("other"));
    }

    #[tokio::test]
    async fn test_chunked_stream() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let (ready_tx, ready_rx) = tokio::sync::oneshot::channel::<()>();
        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            read_request(&mut socket).await.unwrap();
            ready_rx.await.unwrap();
            socket.write_all(b"abcdefgh").await.unwrap();
            socket
        });

        let client = Arc::new(StreamClient::new(local(port).chunked(4)));
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        client
            .fetch_stream("raw", StreamRequest::new("h264"))
            .await
            .unwrap();
        client
            .write_stream_into(
                "raw",
                "collector",
                Arc::new(CallbackSink::new(move |frame| tx.send(frame).is_ok())),
            )
            .unwrap();
        ready_tx.send(()).unwrap();

        assert_eq!(rx.recv().await.unwrap(), Bytes::from_static(b"abcd"));
        assert_eq!(rx.recv().await.unwrap(), Bytes::from_static(b"efgh"));
        drop(server.await.unwrap());
        client.shutdown().await;
    }

    #[tokio::test]
    async fn test_receiver_fans_out_to_sinks() {
        let client = Arc::new(StreamClient::new(ClientConfig::new("127.0.0.1")));
        let port = client.serve_stream_receiver("push", 0).await.unwrap();
        assert_ne!(port, 0);
        assert_eq!(client.receiver_port("push"), Some(port));
        assert!(matches!(
            client.serve_stream_receiver("push", 0).await,
            Err(Error::StreamActive(_))
        ));

        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        client
            .write_stream_into(
                "push",
                "collector",
                Arc::new(CallbackSink::new(move |frame| tx.send(frame).is_ok())),
            )
            .unwrap();

        let mut sender = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        sender.write_all(&size_prefixed(b"one")).await.unwrap();
        sender.write_all(&size_prefixed(b"two")).await.unwrap();

        assert_eq!(rx.recv().await.unwrap(), Bytes::from_static(b"one"));
        assert_eq!(rx.recv().await.unwrap(), Bytes::from_static(b"two"));

        let removed = client
            .remove_sink_from_stream("push", &SinkId::new("collector"))
            .await
            .unwrap();
        assert!(removed.is_some());

        write_length(&mut sender, 0).await.unwrap();
        eventually(|| !client.is_active("push")).await;
        assert_eq!(
            client.latest_frame("push").unwrap().unwrap(),
            Bytes::from_static(b"two")
        );

        // a finished receiver can be replaced under the same id
        client.serve_stream_receiver("push", 0).await.unwrap();
        client.shutdown().await;
    }

    #[tokio::test]
    async fn test_unknown_stream() {
        let client = StreamClient::new(ClientConfig::new("127.0.0.1"));

        assert!(matches!(client.latest_frame("nope"), Err(Error::UnknownStream(_))));
        assert!(matches!(
            client.write_stream_into(
                "nope",
                "sink",
                Arc::new(CallbackSink::new(|_| true))
            ),
            Err(Error::UnknownStream(_))
        ));
        assert!(matches!(
            client
                .remove_sink_from_stream("nope", &SinkId::new("sink"))
                .await,
            Err(Error::UnknownStream(_))
        ));
    }

    #[tokio::test]
    async fn test_trigger_connects_and_closes() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let client = StreamClient::new(ClientConfig::new("127.0.0.1").trigger_port(port));

        client.trigger().await.unwrap();
        let (mut socket, _) = listener.accept().await.unwrap();
        let mut buf = [0u8; 1];
        let read = tokio::io::AsyncReadExt::read(&mut socket, &mut buf)
            .await
            .unwrap();
        assert_eq!(read, 0);
    }
}
