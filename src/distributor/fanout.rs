//! Distributor implementation

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::config::DistributorConfig;
use crate::error::{Error, Result};
use crate::sink::{Sink, SinkId};
use crate::stats::{DeliverySnapshot, DeliveryStats};

/// Called after a sink leaves the live set, with the number still attached
pub type RemoveHook = Arc<dyn Fn(&SinkId, usize) + Send + Sync>;

type SinkMap = HashMap<SinkId, Arc<dyn Sink>>;

enum Item {
    Frame(Bytes),
    /// Merge staged sinks, then answer
    Rebind(oneshot::Sender<()>),
}

/// Asynchronous fan-out from one producer to many named sinks
///
/// Frames are taken off the queue one at a time. Each frame is written to
/// every live sink concurrently, and the next frame is not dequeued until all
/// of those writes finished, so each sink sees frames in production order.
pub struct Distributor {
    config: DistributorConfig,
    sinks: Mutex<SinkMap>,
    staged: Mutex<Vec<(SinkId, Arc<dyn Sink>)>>,
    tx: mpsc::UnboundedSender<Item>,
    rx: Mutex<Option<mpsc::UnboundedReceiver<Item>>>,
    last: Mutex<Option<Bytes>>,
    writable: AtomicBool,
    cancel: CancellationToken,
    workers: Arc<Semaphore>,
    on_remove: Mutex<Option<RemoveHook>>,
    task: Mutex<Option<JoinHandle<()>>>,
    stats: DeliveryStats,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn same_sink(a: &Arc<dyn Sink>, b: &Arc<dyn Sink>) -> bool {
    std::ptr::eq(Arc::as_ptr(a) as *const (), Arc::as_ptr(b) as *const ())
}

impl Distributor {
    pub fn new(config: DistributorConfig) -> Arc<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        let workers = Arc::new(Semaphore::new(config.workers.max(1)));
        Arc::new(Self {
            config,
            sinks: Mutex::new(HashMap::new()),
            staged: Mutex::new(Vec::new()),
            tx,
            rx: Mutex::new(Some(rx)),
            last: Mutex::new(None),
            writable: AtomicBool::new(false),
            cancel: CancellationToken::new(),
            workers,
            on_remove: Mutex::new(None),
            task: Mutex::new(None),
            stats: DeliveryStats::new(),
        })
    }

    pub fn config(&self) -> &DistributorConfig {
        &self.config
    }

    /// Spawn the delivery loop
    ///
    /// Must be called within a tokio runtime. Calling it again, or after
    /// `stop`, does nothing.
    pub fn start(self: &Arc<Self>) {
        if self.cancel.is_cancelled() {
            return;
        }
        let Some(rx) = lock(&self.rx).take() else {
            return;
        };

        self.writable.store(true, Ordering::SeqCst);
        let this = Arc::clone(self);
        let handle = tokio::spawn(async move { this.run(rx).await });
        *lock(&self.task) = Some(handle);

        tracing::debug!(distributor = %self.config.label, workers = self.config.workers, "Delivery loop started");
    }

    /// Whether `write` currently accepts frames
    pub fn is_writable(&self) -> bool {
        self.writable.load(Ordering::SeqCst)
    }

    /// Enqueue a frame and return immediately
    ///
    /// Frames written before `start` or after `stop` are dropped.
    pub fn write(&self, frame: Bytes) {
        if !self.is_writable() {
            return;
        }
        if self.tx.send(Item::Frame(frame)).is_ok() {
            self.stats.frame_accepted();
        }
    }

    /// Stop with `frame` as the final frame
    ///
    /// Frames still queued are dropped; `frame` goes to every live sink once
    /// the deliveries in flight have finished, before `shutdown` closes them.
    pub fn write_last(&self, frame: Bytes) {
        if !self.is_writable() {
            return;
        }
        *lock(&self.last) = Some(frame);
        self.stats.frame_accepted();
        self.stop();
    }

    /// Attach a sink to the live set, returning the one it replaced
    pub fn add_sink(&self, id: impl Into<SinkId>, sink: Arc<dyn Sink>) -> Option<Arc<dyn Sink>> {
        let id = id.into();
        let (replaced, count) = {
            let mut sinks = lock(&self.sinks);
            let replaced = sinks.insert(id.clone(), sink);
            (replaced, sinks.len())
        };
        tracing::debug!(distributor = %self.config.label, sink = %id, sinks = count, "Sink added");
        replaced
    }

    /// Detach a sink without closing it
    ///
    /// Runs the removal hook when the sink was present.
    pub fn remove_sink(&self, id: &SinkId) -> Option<Arc<dyn Sink>> {
        self.detach(id, None)
    }

    pub fn has_sink(&self, id: &SinkId) -> bool {
        lock(&self.sinks).contains_key(id)
    }

    pub fn sink_count(&self) -> usize {
        lock(&self.sinks).len()
    }

    pub fn sink_ids(&self) -> Vec<SinkId> {
        lock(&self.sinks).keys().cloned().collect()
    }

    /// Install the hook run after every removal from the live set
    pub fn set_on_remove(&self, hook: RemoveHook) {
        *lock(&self.on_remove) = Some(hook);
    }

    /// Stage a sink for the next rebind
    pub fn prepare_sink(&self, id: impl Into<SinkId>, sink: Arc<dyn Sink>) {
        lock(&self.staged).push((id.into(), sink));
    }

    /// Merge staged sinks in step with the frame queue
    ///
    /// The merge happens when the delivery loop reaches the rebind marker, so
    /// every frame enqueued before this call goes to the old sink set and
    /// every frame enqueued after it also reaches the staged sinks. Waits up
    /// to `timeout` for the loop to get there.
    pub async fn rebind(&self, timeout: Duration) -> Result<()> {
        let (done_tx, done_rx) = oneshot::channel();
        if !self.is_writable() || self.tx.send(Item::Rebind(done_tx)).is_err() {
            // no loop to order against
            self.merge_staged().await;
            return Ok(());
        }

        match tokio::time::timeout(timeout, done_rx).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(Error::SessionStopped),
            Err(_) => Err(Error::Timeout("rebind")),
        }
    }

    /// Delivery counters
    pub fn stats(&self) -> DeliverySnapshot {
        self.stats.snapshot()
    }

    /// Refuse new frames and let the loop exit after its current frame
    pub fn stop(&self) {
        self.writable.store(false, Ordering::SeqCst);
        self.cancel.cancel();
    }

    pub fn is_stopped(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Stop, wait for in-flight deliveries, then close every sink
    ///
    /// Safe to call more than once. Must not be awaited from a sink's own
    /// `write`.
    pub async fn shutdown(&self) {
        self.stop();

        let task = lock(&self.task).take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                tracing::warn!(distributor = %self.config.label, error = %e, "Delivery loop ended abnormally");
            }
        }
        let last = lock(&self.last).take();
        if let Some(frame) = last {
            self.deliver(frame).await;
        }
        self.workers.close();

        let sinks: Vec<_> = lock(&self.sinks).drain().map(|(_, sink)| sink).collect();
        let staged: Vec<_> = lock(&self.staged).drain(..).map(|(_, sink)| sink).collect();
        let closed = sinks.len() + staged.len();
        for sink in sinks.into_iter().chain(staged) {
            sink.close().await;
        }

        if closed > 0 {
            tracing::debug!(distributor = %self.config.label, closed, "Distributor shut down");
        }
    }

    async fn run(self: Arc<Self>, mut rx: mpsc::UnboundedReceiver<Item>) {
        loop {
            let item = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                item = rx.recv() => match item {
                    Some(item) => item,
                    None => break,
                },
            };

            match item {
                Item::Frame(frame) => self.deliver(frame).await,
                Item::Rebind(done) => {
                    self.merge_staged().await;
                    let _ = done.send(());
                }
            }
        }
        tracing::debug!(distributor = %self.config.label, "Delivery loop exited");
    }

    async fn deliver(&self, frame: Bytes) {
        let sinks: Vec<(SinkId, Arc<dyn Sink>)> = lock(&self.sinks)
            .iter()
            .map(|(id, sink)| (id.clone(), Arc::clone(sink)))
            .collect();
        if sinks.is_empty() {
            return;
        }
        self.stats.frame_dispatched();

        let mut pending = Vec::with_capacity(sinks.len());
        for (id, sink) in sinks {
            let Ok(permit) = Arc::clone(&self.workers).acquire_owned().await else {
                // pool closed by shutdown
                break;
            };
            let frame = frame.clone();
            let writer = Arc::clone(&sink);
            let handle = tokio::spawn(async move {
                let _permit = permit;
                writer.write(frame).await
            });
            pending.push((id, sink, handle));
        }

        for (id, sink, handle) in pending {
            let reason = match handle.await {
                Ok(Ok(true)) => {
                    self.stats.delivered();
                    continue;
                }
                Ok(Ok(false)) => "sink declined frame".to_string(),
                Ok(Err(e)) => e.to_string(),
                Err(e) => format!("delivery task failed: {}", e),
            };

            self.stats.delivery_failed();
            tracing::warn!(distributor = %self.config.label, sink = %id, reason = %reason, "Removing sink");
            if let Some(removed) = self.detach(&id, Some(&sink)) {
                removed.close().await;
            }
        }
    }

    async fn merge_staged(&self) {
        let staged: Vec<_> = lock(&self.staged).drain(..).collect();
        if staged.is_empty() {
            return;
        }

        let mut replaced = Vec::new();
        let count = {
            let mut sinks = lock(&self.sinks);
            for (id, sink) in staged {
                if let Some(old) = sinks.insert(id, Arc::clone(&sink)) {
                    if !same_sink(&old, &sink) {
                        replaced.push(old);
                    }
                }
            }
            sinks.len()
        };
        for old in replaced {
            old.close().await;
        }

        tracing::debug!(distributor = %self.config.label, sinks = count, "Staged sinks merged");
    }

    /// Remove `id`, but only if it still maps to `expected` when one is given
    fn detach(&self, id: &SinkId, expected: Option<&Arc<dyn Sink>>) -> Option<Arc<dyn Sink>> {
        let (removed, remaining) = {
            let mut sinks = lock(&self.sinks);
            let current = sinks.get(id)?;
            if let Some(expected) = expected {
                if !same_sink(current, expected) {
                    return None;
                }
            }
            let removed = sinks.remove(id);
            (removed, sinks.len())
        };

        self.stats.sink_removed();
        tracing::debug!(distributor = %self.config.label, sink = %id, remaining, "Sink removed");

        let hook = lock(&self.on_remove).clone();
        if let Some(hook) = hook {
            hook(id, remaining);
        }
        removed
    }
}

impl std::fmt::Debug for Distributor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Distributor")
            .field("label", &self.config.label)
            .field("sinks", &self.sink_count())
            .field("writable", &self.is_writable())
            .finish()
    }
}
