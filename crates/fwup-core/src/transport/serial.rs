//! serialport-based transport implementation.

use std::io::{ErrorKind, Read, Write};
use std::time::Duration;

use serialport::{ClearBuffer, SerialPort};
use tracing::{debug, info, instrument};

use super::traits::{Transport, TransportError};

/// Timeout used until a read sets its own.
const DEFAULT_TIMEOUT: Duration = Duration::from_millis(50);

/// Serial port transport.
pub struct SerialTransport {
    port: Option<Box<dyn SerialPort>>,
    name: String,
}

impl SerialTransport {
    /// Open `port` at `baud_rate`, 8N1, no flow control.
    #[instrument(level = "info")]
    pub fn open(port: &str, baud_rate: u32) -> Result<Self, TransportError> {
        let handle = serialport::new(port, baud_rate)
            .timeout(DEFAULT_TIMEOUT)
            .open()
            .map_err(|e| TransportError::OpenFailed {
                port: port.to_string(),
                message: e.to_string(),
            })?;

        info!(port = %port, baud = baud_rate, "Serial port opened");

        Ok(Self {
            port: Some(handle),
            name: port.to_string(),
        })
    }

    fn port_mut(&mut self) -> Result<&mut Box<dyn SerialPort>, TransportError> {
        self.port.as_mut().ok_or(TransportError::Closed)
    }
}

impl Transport for SerialTransport {
    #[instrument(skip(self, data), fields(len = data.len()))]
    fn send(&mut self, data: &[u8]) -> Result<(), TransportError> {
        let port = self.port_mut()?;
        port.write_all(data)?;
        port.flush()?;
        debug!(bytes_written = data.len(), "Write complete");
        Ok(())
    }

    fn receive(&mut self, max_len: usize, timeout: Duration) -> Result<Vec<u8>, TransportError> {
        let port = self.port_mut()?;
        // A zero timeout would make the port block forever on some platforms.
        port.set_timeout(timeout.max(Duration::from_millis(1)))?;

        let mut buf = vec![0u8; max_len];
        match port.read(&mut buf) {
            Ok(0) => Err(TransportError::timeout(timeout)),
            Ok(n) => {
                buf.truncate(n);
                debug!(bytes_read = n, "Read complete");
                Ok(buf)
            }
            Err(e) if e.kind() == ErrorKind::TimedOut || e.kind() == ErrorKind::WouldBlock => {
                Err(TransportError::timeout(timeout))
            }
            Err(e) if e.kind() == ErrorKind::BrokenPipe => Err(TransportError::Disconnected),
            Err(e) => Err(e.into()),
        }
    }

    fn clear_input(&mut self) -> Result<(), TransportError> {
        self.port_mut()?.clear(ClearBuffer::Input)?;
        Ok(())
    }

    fn close(&mut self) {
        if self.port.take().is_some() {
            info!(port = %self.name, "Serial port closed");
        }
    }

    fn name(&self) -> &str {
        &self.name
    }
}

impl Drop for SerialTransport {
    fn drop(&mut self) {
        self.close();
    }
}
