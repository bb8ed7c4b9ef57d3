//! Frame assembly
//!
//! Encoders for MJPEG and H.264 emit a continuous byte stream in which each
//! new frame begins with a known marker. The assembler accumulates chunks and
//! cuts a frame whenever a chunk starts with that marker:
//!
//! ```text
//!  chunk:   "A"     FFD8 "B"     FFD8 "C"
//!  buffer:  [A]  -> [FFD8 B]  -> [FFD8 C]
//!  emitted:         "A"          "FFD8 B"      ("FFD8 C" pending)
//! ```
//!
//! For formats without a marker, any non-empty buffer completes on the next
//! chunk or on flush.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tokio::sync::watch;

use super::format::boundary_marker;
use crate::distributor::Distributor;
use crate::protocol::framing::size_prefixed;

/// Splits encoder output into discrete frames
pub struct FrameAssembler {
    marker: Option<&'static [u8]>,
    prepend_size: bool,
    buffer: Mutex<BytesMut>,
    latest: watch::Sender<Option<Bytes>>,
    output: Option<Arc<Distributor>>,
    completed: AtomicU64,
}

impl FrameAssembler {
    /// Create an assembler for `format` that only keeps the latest frame
    pub fn new(format: &str) -> Self {
        let (latest, _) = watch::channel(None);
        Self {
            marker: boundary_marker(format),
            prepend_size: false,
            buffer: Mutex::new(BytesMut::with_capacity(64 * 1024)),
            latest,
            output: None,
            completed: AtomicU64::new(0),
        }
    }

    /// Forward each completed frame into `distributor`
    pub fn with_output(mut self, distributor: Arc<Distributor>) -> Self {
        self.output = Some(distributor);
        self
    }

    /// Prefix forwarded frames with their 4-byte little-endian length
    pub fn prepend_size(mut self, enabled: bool) -> Self {
        self.prepend_size = enabled;
        self
    }

    /// Boundary marker in use, if any
    pub fn marker(&self) -> Option<&'static [u8]> {
        self.marker
    }

    /// Accept a chunk of encoder output
    pub fn write(&self, chunk: &[u8]) {
        let mut buffer = self.buffer.lock().unwrap_or_else(PoisonError::into_inner);
        if self.is_boundary(&buffer, chunk) {
            let frame = buffer.split().freeze();
            self.publish(frame, false);
        }
        buffer.extend_from_slice(chunk);
    }

    /// Emit whatever is buffered as a final frame
    pub fn flush(&self) {
        let mut buffer = self.buffer.lock().unwrap_or_else(PoisonError::into_inner);
        if !buffer.is_empty() {
            let frame = buffer.split().freeze();
            self.publish(frame, false);
        }
    }

    /// Emit whatever is buffered as the output's last frame
    ///
    /// The output distributor stops accepting frames afterwards.
    pub fn finish(&self) {
        let mut buffer = self.buffer.lock().unwrap_or_else(PoisonError::into_inner);
        if !buffer.is_empty() {
            let frame = buffer.split().freeze();
            self.publish(frame, true);
        }
    }

    /// Most recently completed frame
    pub fn latest_frame(&self) -> Option<Bytes> {
        self.latest.borrow().clone()
    }

    /// Number of frames completed so far
    pub fn frames_completed(&self) -> u64 {
        self.completed.load(Ordering::Relaxed)
    }

    /// Wait up to `timeout` for the next frame to complete
    ///
    /// Only frames completed after the call are returned; a frame that was
    /// already observed is never handed out again.
    pub async fn next_frame(&self, timeout: Duration) -> Option<Bytes> {
        let mut rx = self.latest.subscribe();
        let _ = rx.borrow_and_update();
        match tokio::time::timeout(timeout, rx.changed()).await {
            Ok(Ok(())) => rx.borrow_and_update().clone(),
            _ => None,
        }
    }

    fn is_boundary(&self, buffer: &BytesMut, chunk: &[u8]) -> bool {
        if buffer.is_empty() {
            return false;
        }
        match self.marker {
            Some(marker) => chunk.starts_with(marker),
            None => true,
        }
    }

    // Called with the buffer lock held so frames leave in production order.
    fn publish(&self, frame: Bytes, last: bool) {
        self.completed.fetch_add(1, Ordering::Relaxed);
        if let Some(ref output) = self.output {
            let outgoing = if self.prepend_size {
                size_prefixed(&frame)
            } else {
                frame.clone()
            };
            if last {
                output.write_last(outgoing);
            } else {
                output.write(outgoing);
            }
        }
        self.latest.send_replace(Some(frame));
    }
}

impl std::fmt::Debug for FrameAssembler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameAssembler")
            .field("marker", &self.marker)
            .field("prepend_size", &self.prepend_size)
            .field("completed", &self.frames_completed())
            .finish()
    }
}
