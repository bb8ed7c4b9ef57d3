//! Recording device for unit tests
//!
//! Keeps the output handed to `start_encoding` so tests can push encoder
//! chunks by hand, and records every call made against it.

use std::collections::HashMap;
use std::sync::{mpsc, Mutex};
use std::time::Duration;

use bytes::Bytes;

use super::{CaptureDevice, Channel, EncoderOutput, Resolution};
use crate::error::{Error, Result};
use crate::pool::StreamOptions;

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Call {
    Start {
        channel: Channel,
        format: String,
        resize: Option<Resolution>,
    },
    Stop(Channel),
    Split(Channel),
    Capture(Channel),
}

#[derive(Default)]
pub(crate) struct MockDevice {
    outputs: Mutex<HashMap<Channel, EncoderOutput>>,
    calls: Mutex<Vec<Call>>,
    reject_formats: Vec<String>,
    stop_gate: Mutex<Option<mpsc::Receiver<()>>>,
}

impl MockDevice {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn rejecting(format: &str) -> Self {
        Self {
            reject_formats: vec![format.to_string()],
            ..Self::default()
        }
    }

    /// The first `stop_encoding` blocks until the returned sender fires
    pub(crate) fn gated_stop() -> (Self, mpsc::Sender<()>) {
        let (tx, rx) = mpsc::channel();
        let device = Self {
            stop_gate: Mutex::new(Some(rx)),
            ..Self::default()
        };
        (device, tx)
    }

    /// Feed a chunk as if the encoder on `channel` produced it
    pub(crate) fn push(&self, channel: Channel, chunk: &[u8]) {
        if let Some(output) = self.outputs.lock().unwrap().get(&channel) {
            output.write(chunk);
        }
    }

    pub(crate) fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub(crate) fn stop_count(&self, channel: Channel) -> usize {
        self.calls()
            .iter()
            .filter(|c| **c == Call::Stop(channel))
            .count()
    }

    pub(crate) fn is_encoding(&self, channel: Channel) -> bool {
        self.outputs.lock().unwrap().contains_key(&channel)
    }
}

impl CaptureDevice for MockDevice {
    fn native_resolution(&self) -> Resolution {
        Resolution::new(1280, 720)
    }

    fn start_encoding(
        &self,
        output: EncoderOutput,
        format: &str,
        resize: Option<Resolution>,
        channel: Channel,
        _options: &StreamOptions,
    ) -> Result<()> {
        if self.reject_formats.iter().any(|f| f == format) {
            return Err(Error::Configuration(format!("rejected {}", format)));
        }
        self.calls.lock().unwrap().push(Call::Start {
            channel,
            format: format.to_string(),
            resize,
        });
        self.outputs.lock().unwrap().insert(channel, output);
        Ok(())
    }

    fn stop_encoding(&self, channel: Channel) -> Result<()> {
        let gate = self.stop_gate.lock().unwrap().take();
        if let Some(gate) = gate {
            let _ = gate.recv();
        }
        self.calls.lock().unwrap().push(Call::Stop(channel));
        self.outputs.lock().unwrap().remove(&channel);
        Ok(())
    }

    fn split_output(&self, output: EncoderOutput, channel: Channel) -> Result<()> {
        self.calls.lock().unwrap().push(Call::Split(channel));
        self.outputs.lock().unwrap().insert(channel, output);
        Ok(())
    }

    fn wait_duration(&self, _duration: Duration, _channel: Channel) -> Result<()> {
        Ok(())
    }

    fn capture_once(
        &self,
        format: &str,
        channel: Channel,
        _options: &StreamOptions,
    ) -> Result<Bytes> {
        self.calls.lock().unwrap().push(Call::Capture(channel));
        Ok(Bytes::from(format!("still:{}", format)))
    }
}
