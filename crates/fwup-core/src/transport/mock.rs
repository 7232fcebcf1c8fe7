//! Mock serial transport for testing.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use super::traits::{Transport, TransportError};

#[derive(Debug)]
enum Scripted {
    Bytes(Vec<u8>),
    /// Rest of a chunk a short read left behind; sits in the input buffer.
    Unread(Vec<u8>),
    Silence,
}

/// Mock transport for unit testing session logic.
///
/// Reads are served from a script of queued device output; every write is
/// captured. A read that finds silence sleeps for its timeout, like a real
/// port would. Clones share the same script and log, so a test can keep a
/// handle after moving the transport into a session.
#[derive(Clone)]
pub struct MockTransport {
    /// Queued device output, consumed in order.
    script: Arc<Mutex<VecDeque<Scripted>>>,
    /// Captured writes.
    write_log: Arc<Mutex<Vec<Vec<u8>>>>,
    /// Whether the line is "connected".
    connected: Arc<Mutex<bool>>,
    /// Set once `close()` was called.
    closed: Arc<Mutex<bool>>,
    /// Number of `clear_input()` calls.
    clears: Arc<Mutex<usize>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self {
            script: Arc::new(Mutex::new(VecDeque::new())),
            write_log: Arc::new(Mutex::new(Vec::new())),
            connected: Arc::new(Mutex::new(true)),
            closed: Arc::new(Mutex::new(false)),
            clears: Arc::new(Mutex::new(0)),
        }
    }

    /// Queue bytes the device will "send" next.
    pub fn queue_bytes(&self, bytes: &[u8]) {
        self.script
            .lock()
            .unwrap()
            .push_back(Scripted::Bytes(bytes.to_vec()));
    }

    /// Queue one read that times out.
    pub fn queue_silence(&self) {
        self.script.lock().unwrap().push_back(Scripted::Silence);
    }

    /// Get all captured writes.
    pub fn get_writes(&self) -> Vec<Vec<u8>> {
        self.write_log.lock().unwrap().clone()
    }

    /// Number of scripted reads not consumed yet.
    pub fn pending(&self) -> usize {
        self.script.lock().unwrap().len()
    }

    /// Simulate device disconnect.
    pub fn disconnect(&self) {
        *self.connected.lock().unwrap() = false;
    }

    /// Simulate device reconnect.
    pub fn reconnect(&self) {
        *self.connected.lock().unwrap() = true;
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.lock().unwrap()
    }

    pub fn clear_count(&self) -> usize {
        *self.clears.lock().unwrap()
    }

    fn check_open(&self) -> Result<(), TransportError> {
        if *self.closed.lock().unwrap() {
            return Err(TransportError::Closed);
        }
        if !*self.connected.lock().unwrap() {
            return Err(TransportError::Disconnected);
        }
        Ok(())
    }
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl Transport for MockTransport {
    fn send(&mut self, data: &[u8]) -> Result<(), TransportError> {
        self.check_open()?;
        self.write_log.lock().unwrap().push(data.to_vec());
        Ok(())
    }

    fn receive(&mut self, max_len: usize, timeout: Duration) -> Result<Vec<u8>, TransportError> {
        self.check_open()?;
        let mut script = self.script.lock().unwrap();
        match script.pop_front() {
            Some(Scripted::Bytes(mut bytes)) | Some(Scripted::Unread(mut bytes)) => {
                if bytes.len() > max_len {
                    let rest = bytes.split_off(max_len);
                    script.push_front(Scripted::Unread(rest));
                }
                Ok(bytes)
            }
            Some(Scripted::Silence) | None => {
                drop(script);
                std::thread::sleep(timeout);
                Err(TransportError::timeout(timeout))
            }
        }
    }

    fn clear_input(&mut self) -> Result<(), TransportError> {
        self.check_open()?;
        *self.clears.lock().unwrap() += 1;
        let mut script = self.script.lock().unwrap();
        while matches!(script.front(), Some(Scripted::Unread(_))) {
            script.pop_front();
        }
        Ok(())
    }

    fn close(&mut self) {
        *self.closed.lock().unwrap() = true;
    }

    fn name(&self) -> &str {
        "mock"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const T: Duration = Duration::from_millis(10);

    #[test]
    fn test_mock_script_order() {
        let mut mock = MockTransport::new();
        mock.queue_bytes(b"ABCD");
        mock.queue_silence();
        mock.queue_bytes(b"EF");

        assert_eq!(mock.receive(16, T).unwrap(), b"ABCD");
        assert!(mock.receive(16, T).unwrap_err().is_timeout());
        assert_eq!(mock.receive(16, T).unwrap(), b"EF");
        // Script is empty now
        assert!(mock.receive(16, T).is_err());
    }

    #[test]
    fn test_mock_partial_reads() {
        let mut mock = MockTransport::new();
        mock.queue_bytes(b"HelloWorld");

        assert_eq!(mock.receive(5, T).unwrap(), b"Hello");
        assert_eq!(mock.receive_exact(5, T).unwrap(), b"World");
        assert!(mock.receive_exact(4, T).unwrap_err().is_timeout());
    }

    #[test]
    fn test_receive_exact_short() {
        let mut mock = MockTransport::new();
        mock.queue_bytes(b"AB");
        mock.queue_silence();
        assert_eq!(mock.receive_exact(4, T).unwrap(), b"AB");
    }

    #[test]
    fn test_mock_write_capture() {
        let mut mock = MockTransport::new();
        let handle = mock.clone();
        mock.send(b"Hello").unwrap();
        mock.send(b"World").unwrap();

        let writes = handle.get_writes();
        assert_eq!(writes.len(), 2);
        assert_eq!(writes[0], b"Hello");
        assert_eq!(writes[1], b"World");
    }

    #[test]
    fn test_mock_disconnect_and_close() {
        let mut mock = MockTransport::new();
        mock.disconnect();
        assert!(matches!(mock.send(b"test"), Err(TransportError::Disconnected)));
        mock.reconnect();
        assert!(mock.send(b"test").is_ok());

        mock.close();
        assert!(mock.is_closed());
        assert!(matches!(mock.send(b"test"), Err(TransportError::Closed)));
    }

    #[test]
    fn test_clear_input_drops_unread_remainder() {
        let mut mock = MockTransport::new();
        mock.queue_bytes(b"HEADtail");
        mock.queue_bytes(b"NEXT");

        assert_eq!(mock.receive(4, T).unwrap(), b"HEAD");
        mock.clear_input().unwrap();
        assert_eq!(mock.clear_count(), 1);
        // Queued output that had not arrived yet survives the clear.
        assert_eq!(mock.receive(16, T).unwrap(), b"NEXT");
    }

    #[test]
    fn test_silence_waits_for_timeout() {
        let mut mock = MockTransport::new();
        let start = std::time::Instant::now();
        assert!(mock.receive(16, T).unwrap_err().is_timeout());
        assert!(start.elapsed() >= T);
    }
}
