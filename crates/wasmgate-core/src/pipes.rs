use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use wasmtime_wasi::p2::{OutputStream, Pollable, StdoutStream, StreamError, StreamResult};

use crate::cancel::{CancelHandle, CancelReason};

/// Captures guest stdout/stderr up to a hard byte quota.
///
/// Writes past the quota keep the allowed prefix, fire the cancellation
/// handle, and fail — a runaway guest gets truncated output and an epoch
/// trap, never unbounded host memory.
#[derive(Clone)]
pub struct CappedPipe {
    buf: Arc<Mutex<Vec<u8>>>,
    limit: usize,
    cancel: CancelHandle,
}

impl CappedPipe {
    pub fn new(limit: usize, cancel: CancelHandle) -> Self {
        Self {
            buf: Arc::new(Mutex::new(Vec::new())),
            limit,
            cancel,
        }
    }

    pub fn contents(&self) -> Vec<u8> {
        self.buf.lock().clone()
    }
}

impl OutputStream for CappedPipe {
    fn write(&mut self, bytes: Bytes) -> StreamResult<()> {
        let mut buf = self.buf.lock();
        if buf.len() + bytes.len() > self.limit {
            let allowed = self.limit - buf.len();
            buf.extend_from_slice(&bytes[..allowed]);
            drop(buf);
            self.cancel.fire(CancelReason::OutputQuota);
            return Err(StreamError::LastOperationFailed(anyhow::anyhow!(
                "output quota exceeded (max {} bytes)",
                self.limit
            )));
        }
        buf.extend_from_slice(&bytes);
        Ok(())
    }

    fn flush(&mut self) -> StreamResult<()> {
        Ok(())
    }

    fn check_write(&mut self) -> StreamResult<usize> {
        Ok(64 * 1024)
    }
}

#[async_trait::async_trait]
impl Pollable for CappedPipe {
    async fn ready(&mut self) {}
}

impl StdoutStream for CappedPipe {
    fn stream(&self) -> Box<dyn OutputStream> {
        Box::new(self.clone())
    }

    fn isatty(&self) -> bool {
        false
    }
}
