//! Device response parsing.
//!
//! Every updater answer is a frame whose payload echoes the class and
//! message id, followed by a u16 status word and, for the end-of-transfer
//! message, a u32 report. Anything that does not check out byte for byte is
//! surfaced as [`DeviceResponse::Malformed`]; no recovery is attempted.

use std::fmt;

use byteorder::{BigEndian, ByteOrder};
use crc::{Algorithm, Crc};

use super::constants::*;

/// Reason carried by a negative acknowledgement: the raw status word.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NackReason(pub u16);

impl fmt::Display for NackReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "status 0x{:04X}", self.0)
    }
}

/// Parsed answer of the updater to one command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceResponse {
    /// Command accepted. `report` holds the trailing word when present.
    Ack { report: Option<u32> },
    /// Well-formed frame with a non-zero status.
    Nack(NackReason),
    /// Nothing arrived within the response timeout.
    Timeout,
    /// Bytes arrived but did not form a valid response.
    Malformed,
}

impl DeviceResponse {
    pub fn is_ack(&self) -> bool {
        matches!(self, DeviceResponse::Ack { .. })
    }
}

impl fmt::Display for DeviceResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceResponse::Ack { report: None } => write!(f, "ACK"),
            DeviceResponse::Ack { report: Some(r) } => write!(f, "ACK (report 0x{:08X})", r),
            DeviceResponse::Nack(reason) => write!(f, "NACK ({})", reason),
            DeviceResponse::Timeout => write!(f, "timeout"),
            DeviceResponse::Malformed => write!(f, "malformed response"),
        }
    }
}

/// Total length of a response frame whose header declares `payload_len`.
pub fn response_frame_len(payload_len: usize) -> usize {
    payload_len + FRAME_OVERHEAD
}

/// Decode a complete response frame for the given class and message id.
pub fn decode_response(
    algorithm: &'static Algorithm<u32>,
    class_id: u8,
    msg_id: u8,
    bytes: &[u8],
) -> DeviceResponse {
    if bytes.len() < FRAME_PREFIX_LEN + FRAME_SUFFIX_LEN {
        return DeviceResponse::Malformed;
    }
    if bytes[0] != FRAME_HEADER || bytes[bytes.len() - 1] != FRAME_TAIL {
        return DeviceResponse::Malformed;
    }

    let payload_len = BigEndian::read_u16(&bytes[3..5]) as usize;
    if payload_len != RESPONSE_PAYLOAD_SIZE && payload_len != REPORT_PAYLOAD_SIZE {
        return DeviceResponse::Malformed;
    }
    if bytes.len() != response_frame_len(payload_len) {
        return DeviceResponse::Malformed;
    }

    let crc_start = FRAME_PREFIX_LEN + payload_len;
    let expected_crc = BigEndian::read_u32(&bytes[crc_start..crc_start + 4]);
    let actual_crc = Crc::<u32>::new(algorithm).checksum(&bytes[1..crc_start]);
    if expected_crc != actual_crc {
        return DeviceResponse::Malformed;
    }

    // Envelope and echoed ids must both name the command we sent.
    let payload = &bytes[FRAME_PREFIX_LEN..crc_start];
    if bytes[1] != class_id || bytes[2] != msg_id {
        return DeviceResponse::Malformed;
    }
    if payload[0] != class_id || payload[1] != msg_id {
        return DeviceResponse::Malformed;
    }

    let status = BigEndian::read_u16(&payload[2..4]);
    if status != STATUS_OK {
        return DeviceResponse::Nack(NackReason(status));
    }

    let report = (payload_len == REPORT_PAYLOAD_SIZE).then(|| BigEndian::read_u32(&payload[4..8]));
    DeviceResponse::Ack { report }
}

/// Build a response frame as the updater would send it.
///
/// Used by the mock transport and tests to script device behaviour.
pub fn encode_response(
    algorithm: &'static Algorithm<u32>,
    class_id: u8,
    msg_id: u8,
    status: u16,
    report: Option<u32>,
) -> Vec<u8> {
    let mut payload = vec![class_id, msg_id];
    payload.extend_from_slice(&status.to_be_bytes());
    if let Some(r) = report {
        payload.extend_from_slice(&r.to_be_bytes());
    }

    let mut buf = Vec::with_capacity(payload.len() + FRAME_OVERHEAD);
    buf.push(FRAME_HEADER);
    buf.push(class_id);
    buf.push(msg_id);
    buf.extend_from_slice(&(payload.len() as u16).to_be_bytes());
    buf.extend_from_slice(&payload);
    let crc = Crc::<u32>::new(algorithm).checksum(&buf[1..]);
    buf.extend_from_slice(&crc.to_be_bytes());
    buf.push(FRAME_TAIL);
    buf
}
