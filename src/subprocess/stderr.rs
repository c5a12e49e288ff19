//! Draining and capturing a subprocess's stderr

use std::sync::{Arc, Mutex};

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::task::JoinHandle;

use super::split::{SeparatorSet, StreamSplitter};

/// Shared buffer of raw stderr bytes for the command currently in flight.
#[derive(Debug, Clone, Default)]
pub struct StderrCapture {
    bytes: Arc<Mutex<Vec<u8>>>,
}

impl StderrCapture {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&self, chunk: &[u8]) {
        self.bytes
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .extend_from_slice(chunk);
    }

    pub fn snapshot(&self) -> Vec<u8> {
        self.bytes.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn take(&self) -> Vec<u8> {
        std::mem::take(&mut *self.bytes.lock().unwrap_or_else(|e| e.into_inner()))
    }

    pub fn clear(&self) {
        self.bytes.lock().unwrap_or_else(|e| e.into_inner()).clear();
    }

    /// Start a per-command capture scope. The buffer is cleared now and again
    /// when the guard drops.
    pub fn scope(&self) -> CaptureScope {
        self.clear();
        CaptureScope {
            capture: self.clone(),
        }
    }
}

pub struct CaptureScope {
    capture: StderrCapture,
}

impl CaptureScope {
    pub fn bytes(&self) -> Vec<u8> {
        self.capture.snapshot()
    }
}

impl Drop for CaptureScope {
    fn drop(&mut self) {
        self.capture.clear();
    }
}

/// Read `reader` to EOF, logging each complete line and appending the raw
/// bytes to `capture`.
pub fn drain_stderr<R>(reader: R, label: String, capture: StderrCapture) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut reader = reader;
        let mut splitter = StreamSplitter::new(SeparatorSet::line_endings());
        let mut buf = vec![0u8; 4096];

        loop {
            match reader.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => {
                    capture.append(&buf[..n]);
                    splitter.push(&buf[..n]);
                    for record in splitter.drain_records() {
                        tracing::debug!(target: "toolbridge::stderr", "{label}: {}", record.text);
                    }
                }
                Err(e) => {
                    tracing::debug!("{label}: stderr read failed: {e}");
                    break;
                }
            }
        }

        splitter.end();
        for record in splitter.drain_records() {
            tracing::debug!(target: "toolbridge::stderr", "{label}: {}", record.text);
        }
    })
}
