//! Sink that hands frames to a closure

use std::fmt;

use async_trait::async_trait;
use bytes::Bytes;

use super::Sink;
use crate::error::Result;

/// Hands every frame to a closure
///
/// The closure returns `false` to be detached.
pub struct CallbackSink<F> {
    callback: F,
}

impl<F> CallbackSink<F>
where
    F: Fn(Bytes) -> bool + Send + Sync,
{
    pub fn new(callback: F) -> Self {
        Self { callback }
    }
}

impl<F> fmt::Debug for CallbackSink<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallbackSink").finish_non_exhaustive()
    }
}

#[async_trait]
impl<F> Sink for CallbackSink<F>
where
    F: Fn(Bytes) -> bool + Send + Sync,
{
    async fn write(&self, frame: Bytes) -> Result<bool> {
        Ok((self.callback)(frame))
    }
}
