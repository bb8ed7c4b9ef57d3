//! Shared encode session
//!
//! A session binds one device channel to one stream key. Every consumer of
//! that key is a sink on the session's distributor; the device encodes once
//! no matter how many sinks are attached.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use bytes::Bytes;

use super::config::SessionConfig;
use super::state::SessionPhase;
use crate::device::{CaptureDevice, Channel, EncoderOutput, Resolution};
use crate::distributor::{Distributor, DistributorConfig};
use crate::error::{Error, Result};
use crate::media::FrameAssembler;
use crate::pool::StreamKey;
use crate::sink::{Sink, SinkId};

type ReleaseHook = Box<dyn FnOnce(Channel) + Send>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// One running (or idle) encode shared by every sink with the same key
pub struct StreamSession {
    channel: Channel,
    key: StreamKey,
    config: SessionConfig,
    native: Resolution,
    device: Arc<dyn CaptureDevice>,
    distributor: Arc<Distributor>,
    assembler: Option<Arc<FrameAssembler>>,
    phase: Mutex<SessionPhase>,
    release: Mutex<Option<ReleaseHook>>,
}

impl StreamSession {
    /// Bind a new idle session to `channel`
    pub fn new(
        channel: Channel,
        config: SessionConfig,
        device: Arc<dyn CaptureDevice>,
    ) -> Arc<Self> {
        let native = device.native_resolution();
        let key = config.key(native);
        let distributor = Distributor::new(
            DistributorConfig::default()
                .workers(config.workers)
                .label(format!("ch{}", channel)),
        );
        let assembler = config.split_frames.then(|| {
            Arc::new(
                FrameAssembler::new(&config.format)
                    .with_output(Arc::clone(&distributor))
                    .prepend_size(config.prepend_size),
            )
        });

        Arc::new_cyclic(|weak: &Weak<StreamSession>| {
            if config.stop_when_idle {
                let weak = weak.clone();
                distributor.set_on_remove(Arc::new(move |_: &SinkId, remaining: usize| {
                    if remaining > 0 {
                        return;
                    }
                    if let Some(session) = weak.upgrade() {
                        session.stop_detached();
                    }
                }));
            }

            Self {
                channel,
                key,
                config,
                native,
                device,
                distributor,
                assembler,
                phase: Mutex::new(SessionPhase::Idle),
                release: Mutex::new(None),
            }
        })
    }

    /// Install the callback run exactly once when the session stops
    pub fn on_release<F>(&self, hook: F)
    where
        F: FnOnce(Channel) + Send + 'static,
    {
        *lock(&self.release) = Some(Box::new(hook));
    }

    pub fn channel(&self) -> Channel {
        self.channel
    }

    pub fn key(&self) -> &StreamKey {
        &self.key
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn resolution(&self) -> Resolution {
        self.config.effective_resolution(self.native)
    }

    pub fn phase(&self) -> SessionPhase {
        *lock(&self.phase)
    }

    pub fn is_running(&self) -> bool {
        self.phase().is_running()
    }

    pub fn is_stopped(&self) -> bool {
        self.phase().is_terminal()
    }

    pub fn distributor(&self) -> &Arc<Distributor> {
        &self.distributor
    }

    pub fn sink_count(&self) -> usize {
        self.distributor.sink_count()
    }

    /// Begin encoding into this session's sinks
    ///
    /// Does nothing when already running. Must be called within a tokio
    /// runtime.
    pub fn start(&self) -> Result<()> {
        let mut phase = lock(&self.phase);
        match *phase {
            SessionPhase::Running => return Ok(()),
            SessionPhase::Stopped => return Err(Error::SessionStopped),
            SessionPhase::Idle => {}
        }

        self.distributor.start();
        let resolution = self.resolution();
        let resize = (resolution != self.native).then_some(resolution);
        self.device.start_encoding(
            self.encoder_output(),
            &self.config.format,
            resize,
            self.channel,
            &self.config.options,
        )?;
        *phase = SessionPhase::Running;

        tracing::info!(
            stream = %self.key,
            channel = %self.channel,
            format = %self.config.format,
            resolution = %resolution,
            "Session started"
        );
        Ok(())
    }

    /// Stop encoding, release the channel, and close every sink
    ///
    /// A partially assembled frame is completed and written to the sinks
    /// before they close. Safe to call any number of times.
    pub async fn stop(&self) {
        self.halt();
        self.distributor.shutdown().await;
    }

    /// Attach a sink; frames produced from now on reach it
    pub fn add_sink(&self, id: impl Into<SinkId>, sink: Arc<dyn Sink>) -> Result<()> {
        if self.is_stopped() {
            return Err(Error::SessionStopped);
        }
        self.distributor.add_sink(id, sink);
        Ok(())
    }

    /// Detach a sink without closing it
    ///
    /// Removing the last sink stops the session unless `stop_when_idle` is
    /// off.
    pub fn remove_sink(&self, id: &SinkId) -> Option<Arc<dyn Sink>> {
        self.distributor.remove_sink(id)
    }

    /// Add sinks without interrupting the running encode
    ///
    /// Frames already queued are not delivered to the new sinks.
    pub async fn rebind(&self, sinks: Vec<(SinkId, Arc<dyn Sink>)>) -> Result<()> {
        if self.is_stopped() {
            return Err(Error::SessionStopped);
        }
        for (id, sink) in sinks {
            self.distributor.prepare_sink(id, sink);
        }
        if self.is_running() {
            self.device.split_output(self.encoder_output(), self.channel)?;
        }
        self.distributor.rebind(self.config.rebind_timeout).await?;

        tracing::debug!(stream = %self.key, sinks = self.sink_count(), "Session rebound");
        Ok(())
    }

    /// Keep encoding for `duration`, surfacing device errors
    pub async fn wait(&self, duration: Duration) -> Result<()> {
        let device = Arc::clone(&self.device);
        let channel = self.channel;
        tokio::task::spawn_blocking(move || device.wait_duration(duration, channel))
            .await
            .map_err(|e| Error::Device(format!("wait on channel {} failed: {}", channel, e)))?
    }

    /// Most recent complete frame, for split sessions
    pub fn latest_frame(&self) -> Option<Bytes> {
        self.assembler.as_ref().and_then(|a| a.latest_frame())
    }

    /// Wait for the next complete frame, for split sessions
    pub async fn next_frame(&self, timeout: Duration) -> Option<Bytes> {
        match &self.assembler {
            Some(assembler) => assembler.next_frame(timeout).await,
            None => None,
        }
    }

    fn encoder_output(&self) -> EncoderOutput {
        match &self.assembler {
            Some(assembler) => EncoderOutput::assembled(Arc::clone(assembler)),
            None => EncoderOutput::direct(Arc::clone(&self.distributor)),
        }
    }

    /// Synchronous half of `stop`: the distributor is stopped but not yet
    /// drained. Returns false when already stopped.
    fn halt(&self) -> bool {
        let previous = std::mem::replace(&mut *lock(&self.phase), SessionPhase::Stopped);
        if previous.is_terminal() {
            return false;
        }

        if previous.is_running() {
            if let Err(e) = self.device.stop_encoding(self.channel) {
                tracing::warn!(stream = %self.key, channel = %self.channel, error = %e, "Device stop failed");
            }
            if let Some(assembler) = &self.assembler {
                assembler.finish();
            }
        }

        let release = lock(&self.release).take();
        if let Some(release) = release {
            release(self.channel);
        }
        self.distributor.stop();

        tracing::info!(stream = %self.key, channel = %self.channel, "Session stopped");
        true
    }

    // Runs from the distributor's removal hook, possibly inside its own
    // delivery loop, so the drain is handed to a separate task.
    fn stop_detached(&self) {
        if !self.halt() {
            return;
        }
        let distributor = Arc::clone(&self.distributor);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move { distributor.shutdown().await });
            }
            Err(_) => tracing::debug!(stream = %self.key, "No runtime to drain distributor"),
        }
    }
}

impl std::fmt::Debug for StreamSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamSession")
            .field("channel", &self.channel)
            .field("key", &self.key)
            .field("phase", &self.phase())
            .field("sinks", &self.sink_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::mock::{Call, MockDevice};
    use crate::media::format::JPEG_SOI;
    use crate::sink::CallbackSink;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::mpsc;
    use tokio_test::{assert_err, assert_ok};

    fn session(device: &Arc<MockDevice>, config: SessionConfig) -> Arc<StreamSession> {
        StreamSession::new(Channel(1), config, Arc::clone(device) as Arc<dyn CaptureDevice>)
    }

    fn release_counter(session: &StreamSession) -> Arc<AtomicUsize> {
        let count = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&count);
        session.on_release(move |channel| {
            assert_eq!(channel, Channel(1));
            counter.fetch_add(1, Ordering::SeqCst);
        });
        count
    }

    fn channel_sink() -> (Arc<dyn Sink>, mpsc::UnboundedReceiver<Bytes>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(CallbackSink::new(move |f| tx.send(f).is_ok())), rx)
    }

    async fn recv(rx: &mut mpsc::UnboundedReceiver<Bytes>) -> Bytes {
        tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("frame not delivered")
            .expect("sink dropped")
    }

    fn jpeg(body: &[u8]) -> Vec<u8> {
        [&JPEG_SOI[..], body].concat()
    }

    #[tokio::test]
    async fn test_release_runs_once_without_start() {
        let device = Arc::new(MockDevice::new());
        let session = session(&device, SessionConfig::new("h264"));
        let released = release_counter(&session);

        session.stop().await;
        session.stop().await;

        assert_eq!(released.load(Ordering::SeqCst), 1);
        assert_eq!(device.stop_count(Channel(1)), 0);
        assert!(matches!(session.start(), Err(Error::SessionStopped)));
    }

    #[tokio::test]
    async fn test_start_is_idempotent_and_stop_halts_device() {
        let device = Arc::new(MockDevice::new());
        let session = session(&device, SessionConfig::new("h264"));
        let released = release_counter(&session);

        assert_ok!(session.start());
        assert_ok!(session.start());
        assert!(session.is_running());
        assert_eq!(
            device.calls(),
            vec![Call::Start {
                channel: Channel(1),
                format: "h264".into(),
                resize: None,
            }]
        );

        session.stop().await;
        session.stop().await;
        assert_eq!(device.stop_count(Channel(1)), 1);
        assert_eq!(released.load(Ordering::SeqCst), 1);
        assert_eq!(session.phase(), SessionPhase::Stopped);
    }

    #[tokio::test]
    async fn test_non_native_resolution_is_passed_as_resize() {
        let device = Arc::new(MockDevice::new());
        let config = SessionConfig::new("mjpeg").resolution(Resolution::new(640, 480));
        let session = session(&device, config);
        assert_ok!(session.start());

        assert!(device.calls().contains(&Call::Start {
            channel: Channel(1),
            format: "mjpeg".into(),
            resize: Some(Resolution::new(640, 480)),
        }));
        session.stop().await;
    }

    #[tokio::test]
    async fn test_device_rejection_leaves_session_idle() {
        let device = Arc::new(MockDevice::rejecting("vp9"));
        let session = session(&device, SessionConfig::new("vp9"));
        let released = release_counter(&session);

        assert!(matches!(session.start(), Err(Error::Configuration(_))));
        assert_eq!(session.phase(), SessionPhase::Idle);

        session.stop().await;
        assert_eq!(released.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_split_frames_reach_every_sink() {
        let device = Arc::new(MockDevice::new());
        let session = session(&device, SessionConfig::new("mjpeg"));
        let (a, mut rx_a) = channel_sink();
        let (b, mut rx_b) = channel_sink();
        assert_ok!(session.add_sink("a", a));
        assert_ok!(session.add_sink("b", b));
        assert_ok!(session.start());

        device.push(Channel(1), &jpeg(b"one"));
        device.push(Channel(1), &jpeg(b"two"));
        device.push(Channel(1), &jpeg(b"three"));

        for rx in [&mut rx_a, &mut rx_b] {
            assert_eq!(recv(rx).await, jpeg(b"one"));
            assert_eq!(recv(rx).await, jpeg(b"two"));
        }
        assert_eq!(session.latest_frame().unwrap(), jpeg(b"two"));
        session.stop().await;
    }

    #[tokio::test]
    async fn test_stop_delivers_pending_frame() {
        let device = Arc::new(MockDevice::new());
        let session = session(&device, SessionConfig::new("mjpeg"));
        let (sink, mut rx) = channel_sink();
        assert_ok!(session.add_sink("a", sink));
        assert_ok!(session.start());

        device.push(Channel(1), &jpeg(b"one"));
        device.push(Channel(1), &jpeg(b"two"));
        assert_eq!(recv(&mut rx).await, jpeg(b"one"));

        session.stop().await;
        assert_eq!(rx.try_recv().unwrap(), jpeg(b"two"));
        assert_eq!(session.latest_frame().unwrap(), jpeg(b"two"));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_prepend_size_frames_distributed_sinks() {
        let device = Arc::new(MockDevice::new());
        let session = session(&device, SessionConfig::new("mjpeg").prepend_size(true));
        let (sink, mut rx) = channel_sink();
        assert_ok!(session.add_sink("framed", sink));
        assert_ok!(session.start());

        device.push(Channel(1), &jpeg(b"x"));
        device.push(Channel(1), &jpeg(b"y"));

        let frame = recv(&mut rx).await;
        assert_eq!(&frame[..4], &3u32.to_le_bytes());
        assert_eq!(&frame[4..], &jpeg(b"x")[..]);
        session.stop().await;
    }

    #[tokio::test]
    async fn test_unsplit_session_forwards_raw_chunks() {
        let device = Arc::new(MockDevice::new());
        let session = session(&device, SessionConfig::new("yuv").split_frames(false));
        let (sink, mut rx) = channel_sink();
        assert_ok!(session.add_sink("raw", sink));
        assert_ok!(session.start());

        device.push(Channel(1), b"chunk");
        assert_eq!(recv(&mut rx).await, &b"chunk"[..]);
        assert!(session.latest_frame().is_none());
        session.stop().await;
    }

    #[tokio::test]
    async fn test_last_sink_removal_stops_session() {
        let device = Arc::new(MockDevice::new());
        let session = session(&device, SessionConfig::new("h264"));
        let released = release_counter(&session);
        let (a, _rx_a) = channel_sink();
        let (b, _rx_b) = channel_sink();
        assert_ok!(session.add_sink("a", a));
        assert_ok!(session.add_sink("b", b));
        assert_ok!(session.start());

        assert!(session.remove_sink(&SinkId::new("a")).is_some());
        assert!(session.is_running());

        assert!(session.remove_sink(&SinkId::new("b")).is_some());
        assert!(session.is_stopped());
        assert_eq!(released.load(Ordering::SeqCst), 1);
        assert_eq!(device.stop_count(Channel(1)), 1);

        let (late, _rx) = channel_sink();
        assert_err!(session.add_sink("late", late));
    }

    #[tokio::test]
    async fn test_idle_removal_kept_when_disabled() {
        let device = Arc::new(MockDevice::new());
        let session = session(&device, SessionConfig::new("h264").stop_when_idle(false));
        let (a, _rx) = channel_sink();
        assert_ok!(session.add_sink("a", a));
        assert_ok!(session.start());

        session.remove_sink(&SinkId::new("a"));
        assert!(session.is_running());
        session.stop().await;
    }

    #[tokio::test]
    async fn test_rebind_adds_sinks_without_restart() {
        let device = Arc::new(MockDevice::new());
        let session = session(&device, SessionConfig::new("mjpeg"));
        let (first, mut rx_first) = channel_sink();
        assert_ok!(session.add_sink("first", first));
        assert_ok!(session.start());

        device.push(Channel(1), &jpeg(b"1"));
        device.push(Channel(1), &jpeg(b"2"));
        assert_eq!(recv(&mut rx_first).await, jpeg(b"1"));

        let (second, mut rx_second) = channel_sink();
        assert_ok!(session.rebind(vec![(SinkId::new("second"), second)]).await);
        assert_eq!(session.sink_count(), 2);

        device.push(Channel(1), &jpeg(b"3"));
        assert_eq!(recv(&mut rx_first).await, jpeg(b"2"));
        assert_eq!(recv(&mut rx_second).await, jpeg(b"2"));

        let calls = device.calls();
        assert_eq!(calls.iter().filter(|c| matches!(c, Call::Start { .. })).count(), 1);
        assert!(calls.contains(&Call::Split(Channel(1))));
        session.stop().await;
    }

    #[tokio::test]
    async fn test_next_frame_waits_for_completion() {
        let device = Arc::new(MockDevice::new());
        let session = session(&device, SessionConfig::new("mjpeg"));
        let (sink, _rx) = channel_sink();
        assert_ok!(session.add_sink("s", sink));
        assert_ok!(session.start());

        assert!(session.next_frame(Duration::from_millis(20)).await.is_none());

        let waiter = {
            let session = Arc::clone(&session);
            tokio::spawn(async move { session.next_frame(Duration::from_secs(2)).await })
        };
        tokio::task::yield_now().await;
        device.push(Channel(1), &jpeg(b"a"));
        device.push(Channel(1), &jpeg(b"b"));
        assert_eq!(waiter.await.unwrap().unwrap(), jpeg(b"a"));

        assert_ok!(session.wait(Duration::from_millis(1)).await);
        session.stop().await;
    }
}
