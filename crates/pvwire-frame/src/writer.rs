use std::io::{ErrorKind, Write};

use pvwire_transport::PvaStream;
use tracing::trace;

use crate::codec::FrameConfig;
use crate::error::{transport_to_frame_error, FrameError, Result};
use crate::wire::hex_dump;

/// Writes encoded messages to any `Write` stream in bounded batches.
///
/// Large single writes hurt latency for other traffic on the same socket,
/// so each `write` call carries at most `batch_limit` bytes.
pub struct FrameWriter<T> {
    inner: T,
    batch_limit: usize,
}

impl<T: Write> FrameWriter<T> {
    /// Create a writer with the given batch limit. A zero limit is raised
    /// to one byte.
    pub fn new(inner: T, batch_limit: usize) -> Self {
        Self {
            inner,
            batch_limit: batch_limit.max(1),
        }
    }

    /// Change the batch limit, e.g. after the peer reported its buffer size.
    pub fn set_batch_limit(&mut self, batch_limit: usize) {
        self.batch_limit = batch_limit.max(1);
    }

    pub fn batch_limit(&self) -> usize {
        self.batch_limit
    }

    /// Write all of `data` in batches, then flush.
    pub fn write_batched(&mut self, data: &[u8]) -> Result<()> {
        trace!(size = data.len(), "sending\n{}", hex_dump(data));
        for batch in data.chunks(self.batch_limit) {
            self.write_fully(batch)?;
        }
        self.flush()
    }

    fn write_fully(&mut self, batch: &[u8]) -> Result<()> {
        let mut offset = 0usize;
        while offset < batch.len() {
            match self.inner.write(&batch[offset..]) {
                Ok(0) => return Err(FrameError::ConnectionClosed),
                Ok(n) => offset += n,
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) if err.kind() == ErrorKind::WouldBlock => continue,
                Err(err) => return Err(FrameError::Io(err)),
            }
        }
        Ok(())
    }

    /// Flush the underlying stream.
    pub fn flush(&mut self) -> Result<()> {
        loop {
            match self.inner.flush() {
                Ok(()) => return Ok(()),
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) if err.kind() == ErrorKind::WouldBlock => continue,
                Err(err) => return Err(FrameError::Io(err)),
            }
        }
    }

    /// Borrow the underlying stream.
    pub fn get_ref(&self) -> &T {
        &self.inner
    }

    /// Mutably borrow the underlying stream.
    pub fn get_mut(&mut self) -> &mut T {
        &mut self.inner
    }

    /// Consume the writer and return the inner stream.
    pub fn into_inner(self) -> T {
        self.inner
    }
}

impl FrameWriter<PvaStream> {
    /// Create a frame writer for a `PvaStream` and apply the write timeout
    /// from config.
    pub fn with_config_pva(inner: PvaStream, batch_limit: usize, config: &FrameConfig) -> Result<Self> {
        inner
            .set_write_timeout(config.write_timeout)
            .map_err(transport_to_frame_error)?;
        Ok(Self::new(inner, batch_limit))
    }
}
