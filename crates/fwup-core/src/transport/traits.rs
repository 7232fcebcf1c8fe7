//! Serial transport layer abstraction.
//!
//! Defines the `Transport` trait for the byte-oriented duplex link to the
//! module, allowing different implementations (serialport, mock, etc.).

use std::time::{Duration, Instant};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Failed to open {port}: {message}")]
    OpenFailed { port: String, message: String },

    #[error("Transport is closed")]
    Closed,

    #[error("Device disconnected")]
    Disconnected,

    #[error("Timeout after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("Serial port error: {0}")]
    Serial(#[from] serialport::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl TransportError {
    pub fn timeout(timeout: Duration) -> Self {
        TransportError::Timeout {
            timeout_ms: timeout.as_millis() as u64,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, TransportError::Timeout { .. })
    }
}

/// Abstract serial transport interface.
///
/// A transport is owned by exactly one update session at a time. All reads
/// block for at most the given timeout.
pub trait Transport: Send {
    /// Write all bytes and flush them to the line.
    fn send(&mut self, data: &[u8]) -> Result<(), TransportError>;

    /// Read whatever arrives, up to `max_len` bytes.
    ///
    /// Returns `TransportError::Timeout` when nothing arrived in `timeout`.
    fn receive(&mut self, max_len: usize, timeout: Duration) -> Result<Vec<u8>, TransportError>;

    /// Discard bytes already received but not yet read.
    fn clear_input(&mut self) -> Result<(), TransportError>;

    /// Release the underlying port. Further calls fail with `Closed`.
    fn close(&mut self);

    /// Port name, for logs.
    fn name(&self) -> &str;

    /// Read until `len` bytes arrived or `timeout` elapsed.
    ///
    /// A short buffer is returned when the line went quiet after some bytes;
    /// `Timeout` only when nothing arrived at all.
    fn receive_exact(&mut self, len: usize, timeout: Duration) -> Result<Vec<u8>, TransportError> {
        let deadline = Instant::now() + timeout;
        let mut buf = Vec::with_capacity(len);

        while buf.len() < len {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match self.receive(len - buf.len(), remaining) {
                Ok(chunk) => buf.extend_from_slice(&chunk),
                Err(TransportError::Timeout { .. }) => break,
                Err(e) => return Err(e),
            }
            if Instant::now() >= deadline {
                break;
            }
        }

        if buf.is_empty() && len > 0 {
            return Err(TransportError::timeout(timeout));
        }
        Ok(buf)
    }
}

impl<T: Transport + ?Sized> Transport for Box<T> {
    fn send(&mut self, data: &[u8]) -> Result<(), TransportError> {
        (**self).send(data)
    }

    fn receive(&mut self, max_len: usize, timeout: Duration) -> Result<Vec<u8>, TransportError> {
        (**self).receive(max_len, timeout)
    }

    fn clear_input(&mut self) -> Result<(), TransportError> {
        (**self).clear_input()
    }

    fn close(&mut self) {
        (**self).close()
    }

    fn name(&self) -> &str {
        (**self).name()
    }
}
