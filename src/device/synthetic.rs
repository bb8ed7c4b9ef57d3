//! Test-pattern capture device
//!
//! Produces numbered frames on a background thread per channel, prefixed with
//! the boundary marker of the requested format. Useful for demos and for
//! exercising the full pipeline without camera hardware.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use bytes::{BufMut, Bytes, BytesMut};

use super::{CaptureDevice, Channel, EncoderOutput, Resolution};
use crate::error::{Error, Result};
use crate::media::boundary_marker;
use crate::pool::StreamOptions;

/// Formats the synthetic encoder accepts
const SUPPORTED_FORMATS: &[&str] = &["h264", "mjpeg", "jpeg", "yuv", "rgb", "bgr"];

struct Worker {
    output: Arc<Mutex<EncoderOutput>>,
    stop: Arc<AtomicBool>,
}

/// Capture device that synthesizes frames
pub struct SyntheticDevice {
    native: Resolution,
    frame_interval: Duration,
    payload_size: usize,
    workers: Mutex<HashMap<Channel, Worker>>,
}

impl SyntheticDevice {
    /// Create a device producing 25 frames per second at `native`
    pub fn new(native: Resolution) -> Self {
        Self {
            native,
            frame_interval: Duration::from_millis(40),
            payload_size: 1024,
            workers: Mutex::new(HashMap::new()),
        }
    }

    /// Set the delay between frames
    pub fn frame_interval(mut self, interval: Duration) -> Self {
        self.frame_interval = interval;
        self
    }

    /// Set the number of payload bytes following each frame header
    pub fn payload_size(mut self, size: usize) -> Self {
        self.payload_size = size;
        self
    }

    /// Number of channels currently encoding
    pub fn active_channels(&self) -> usize {
        self.workers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    fn render(format: &str, seq: u64, payload_size: usize) -> (Bytes, Bytes) {
        let mut head = BytesMut::with_capacity(32);
        if let Some(marker) = boundary_marker(format) {
            head.put_slice(marker);
        }
        head.put_slice(format!("frame {:08}", seq).as_bytes());

        let mut tail = BytesMut::with_capacity(payload_size);
        tail.put_bytes((seq % 251) as u8 + 1, payload_size);
        (head.freeze(), tail.freeze())
    }
}

impl CaptureDevice for SyntheticDevice {
    fn native_resolution(&self) -> Resolution {
        self.native
    }

    fn start_encoding(
        &self,
        output: EncoderOutput,
        format: &str,
        _resize: Option<Resolution>,
        channel: Channel,
        _options: &StreamOptions,
    ) -> Result<()> {
        if !SUPPORTED_FORMATS.contains(&format) {
            return Err(Error::Configuration(format!("unsupported format {:?}", format)));
        }

        let mut workers = self.workers.lock().unwrap_or_else(PoisonError::into_inner);
        if workers.contains_key(&channel) {
            return Err(Error::Device(format!("channel {} already encoding", channel)));
        }

        let shared_output = Arc::new(Mutex::new(output));
        let stop = Arc::new(AtomicBool::new(false));
        let worker_output = Arc::clone(&shared_output);
        let worker_stop = Arc::clone(&stop);
        let format = format.to_string();
        let interval = self.frame_interval;
        let payload_size = self.payload_size;

        thread::Builder::new()
            .name(format!("synthetic-encoder-{}", channel))
            .spawn(move || {
                let mut seq = 0u64;
                while !worker_stop.load(Ordering::Acquire) {
                    let (head, tail) = Self::render(&format, seq, payload_size);
                    {
                        let output = worker_output.lock().unwrap_or_else(PoisonError::into_inner);
                        output.write(&head);
                        output.write(&tail);
                    }
                    seq += 1;
                    thread::sleep(interval);
                }
            })?;

        workers.insert(
            channel,
            Worker {
                output: shared_output,
                stop,
            },
        );
        tracing::debug!(channel = %channel, "Synthetic encoder started");
        Ok(())
    }

    fn stop_encoding(&self, channel: Channel) -> Result<()> {
        let worker = self
            .workers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&channel);
        match worker {
            Some(worker) => {
                worker.stop.store(true, Ordering::Release);
                Ok(())
            }
            None => Err(Error::Device(format!("channel {} is not encoding", channel))),
        }
    }

    fn split_output(&self, output: EncoderOutput, channel: Channel) -> Result<()> {
        let workers = self.workers.lock().unwrap_or_else(PoisonError::into_inner);
        let worker = workers
            .get(&channel)
            .ok_or_else(|| Error::Device(format!("channel {} is not encoding", channel)))?;
        *worker.output.lock().unwrap_or_else(PoisonError::into_inner) = output;
        Ok(())
    }

    fn wait_duration(&self, duration: Duration, channel: Channel) -> Result<()> {
        let deadline = Instant::now() + duration;
        while Instant::now() < deadline {
            let stopped = self
                .workers
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .get(&channel)
                .map_or(true, |w| w.stop.load(Ordering::Acquire));
            if stopped {
                return Err(Error::Device(format!("channel {} stopped while waiting", channel)));
            }
            thread::sleep(
                self.frame_interval
                    .min(deadline.saturating_duration_since(Instant::now())),
            );
        }
        Ok(())
    }

    fn capture_once(
        &self,
        format: &str,
        _channel: Channel,
        _options: &StreamOptions,
    ) -> Result<Bytes> {
        let (head, tail) = Self::render(format, 0, self.payload_size);
        let mut image = BytesMut::with_capacity(head.len() + tail.len());
        image.put_slice(&head);
        image.put_slice(&tail);
        Ok(image.freeze())
    }
}

impl Drop for SyntheticDevice {
    fn drop(&mut self) {
        let workers = self.workers.get_mut().unwrap_or_else(PoisonError::into_inner);
        for worker in workers.values() {
            worker.stop.store(true, Ordering::Release);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_uses_format_marker() {
        let (head, tail) = SyntheticDevice::render("mjpeg", 3, 16);
        assert!(head.starts_with(&[0xFF, 0xD8]));
        assert!(head.ends_with(b"frame 00000003"));
        assert_eq!(tail.len(), 16);

        let (head, _) = SyntheticDevice::render("yuv", 0, 0);
        assert!(head.starts_with(b"frame"));
    }

    #[test]
    fn test_stop_unknown_channel_fails() {
        let device = SyntheticDevice::new(Resolution::new(640, 480));
        assert!(device.stop_encoding(Channel(0)).is_err());
        assert_eq!(device.active_channels(), 0);
    }

    #[test]
    fn test_capture_once_returns_image() {
        let device = SyntheticDevice::new(Resolution::new(640, 480)).payload_size(8);
        let image = device
            .capture_once("mjpeg", Channel(0), &StreamOptions::new())
            .unwrap();
        assert!(image.starts_with(&[0xFF, 0xD8]));
        assert_eq!(image.len(), 2 + "frame 00000000".len() + 8);
    }
}
