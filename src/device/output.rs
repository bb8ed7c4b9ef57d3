//! Sink handed to the device driver for encoded bytes

use std::sync::Arc;

use bytes::Bytes;

use crate::distributor::Distributor;
use crate::media::FrameAssembler;

/// Where a session's encoder output goes
///
/// Cloning is cheap. `write` enqueues and returns immediately, so the driver is
/// never slowed down by slow consumers.
#[derive(Clone)]
pub struct EncoderOutput {
    route: Route,
}

#[derive(Clone)]
enum Route {
    /// Raw chunks straight into the fan-out
    Direct(Arc<Distributor>),
    /// Chunks are split into frames first
    Assembled(Arc<FrameAssembler>),
}

impl EncoderOutput {
    /// Output that forwards every chunk unchanged
    pub fn direct(distributor: Arc<Distributor>) -> Self {
        Self {
            route: Route::Direct(distributor),
        }
    }

    /// Output that feeds a frame assembler
    pub fn assembled(assembler: Arc<FrameAssembler>) -> Self {
        Self {
            route: Route::Assembled(assembler),
        }
    }

    /// Accept a chunk of encoder output
    pub fn write(&self, chunk: &[u8]) {
        match &self.route {
            Route::Direct(distributor) => distributor.write(Bytes::copy_from_slice(chunk)),
            Route::Assembled(assembler) => assembler.write(chunk),
        }
    }

    /// Signal that the encoder has no more data for the current frame
    pub fn flush(&self) {
        if let Route::Assembled(assembler) = &self.route {
            assembler.flush();
        }
    }
}

impl std::fmt::Debug for EncoderOutput {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let route = match self.route {
            Route::Direct(_) => "direct",
            Route::Assembled(_) => "assembled",
        };
        f.debug_struct("EncoderOutput").field("route", &route).finish()
    }
}
