//! Minimal FusionEngine message codec.
//!
//! Only what the reboot controller needs: encoding a `ResetRequest` and
//! picking `CommandResponse` messages out of the byte stream the running
//! application produces.
//!
//! Header layout (24 bytes, little-endian):
//!
//! ```text
//! 0  sync '.' '1'      2  reserved u16     4  crc u32
//! 8  protocol ver u8   9  message ver u8  10  message type u16
//! 12 sequence u32     16  payload size    20  source id u32
//! ```
//!
//! The CRC covers everything from byte 8 to the end of the payload.

use byteorder::{ByteOrder, LittleEndian};
use crc::{CRC_32_ISO_HDLC, Crc};
use tracing::trace;

use crate::protocol::constants::*;

const FE_CRC: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

/// Largest payload accepted by the decoder before it assumes a false sync.
const MAX_PAYLOAD: usize = 64 * 1024;

/// One decoded FusionEngine message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeMessage {
    pub message_type: u16,
    pub message_version: u8,
    pub sequence: u32,
    pub payload: Vec<u8>,
}

/// Payload of a `CommandResponse` message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandResponse {
    /// Sequence number of the command being answered.
    pub source_sequence: u32,
    /// Response code, `FE_RESPONSE_OK` on success.
    pub response: u8,
}

impl CommandResponse {
    pub fn from_message(msg: &FeMessage) -> Option<Self> {
        if msg.message_type != FE_MSG_COMMAND_RESPONSE || msg.payload.len() < 5 {
            return None;
        }
        Some(Self {
            source_sequence: LittleEndian::read_u32(&msg.payload[0..4]),
            response: msg.payload[4],
        })
    }

    pub fn is_ok(&self) -> bool {
        self.response == FE_RESPONSE_OK
    }
}

/// Encode a complete FusionEngine message.
pub fn encode_message(message_type: u16, message_version: u8, sequence: u32, payload: &[u8]) -> Vec<u8> {
    let mut buf = vec![0u8; FE_HEADER_SIZE + payload.len()];
    buf[0] = FE_SYNC0;
    buf[1] = FE_SYNC1;
    buf[8] = FE_PROTOCOL_VERSION;
    buf[9] = message_version;
    LittleEndian::write_u16(&mut buf[10..12], message_type);
    LittleEndian::write_u32(&mut buf[12..16], sequence);
    LittleEndian::write_u32(&mut buf[16..20], payload.len() as u32);
    buf[FE_HEADER_SIZE..].copy_from_slice(payload);

    let crc = FE_CRC.checksum(&buf[FE_CRC_START..]);
    LittleEndian::write_u32(&mut buf[4..8], crc);
    buf
}

/// `ResetRequest` with the given reset mask.
pub fn reset_request(sequence: u32, reset_mask: u32) -> Vec<u8> {
    let mut payload = [0u8; 4];
    LittleEndian::write_u32(&mut payload, reset_mask);
    encode_message(FE_MSG_RESET_REQUEST, 0, sequence, &payload)
}

/// `CommandResponse` as the application sends it.
pub fn command_response(sequence: u32, source_sequence: u32, response: u8) -> Vec<u8> {
    let mut payload = [0u8; 8];
    LittleEndian::write_u32(&mut payload[0..4], source_sequence);
    payload[4] = response;
    encode_message(FE_MSG_COMMAND_RESPONSE, 0, sequence, &payload)
}

/// Streaming decoder; tolerates arbitrary chunking and garbage between
/// messages.
#[derive(Debug, Default)]
pub struct FeDecoder {
    buf: Vec<u8>,
}

impl FeDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `data` and return every complete, CRC-valid message.
    pub fn feed(&mut self, data: &[u8]) -> Vec<FeMessage> {
        self.buf.extend_from_slice(data);
        let mut out = Vec::new();

        loop {
            // Drop everything before the next sync pair.
            match self.buf.windows(2).position(|w| w == [FE_SYNC0, FE_SYNC1]) {
                Some(0) => {}
                Some(pos) => {
                    self.buf.drain(..pos);
                }
                None => {
                    // Keep a trailing first sync byte; its partner may follow.
                    let keep = usize::from(self.buf.last() == Some(&FE_SYNC0));
                    let cut = self.buf.len() - keep;
                    self.buf.drain(..cut);
                    break;
                }
            }

            if self.buf.len() < FE_HEADER_SIZE {
                break;
            }

            let payload_len = LittleEndian::read_u32(&self.buf[16..20]) as usize;
            if payload_len > MAX_PAYLOAD {
                self.buf.drain(..1);
                continue;
            }
            let total = FE_HEADER_SIZE + payload_len;
            if self.buf.len() < total {
                break;
            }

            let expected = LittleEndian::read_u32(&self.buf[4..8]);
            let actual = FE_CRC.checksum(&self.buf[FE_CRC_START..total]);
            if expected != actual {
                trace!(expected, actual, "FusionEngine CRC mismatch, resyncing");
                self.buf.drain(..1);
                continue;
            }

            let frame: Vec<u8> = self.buf.drain(..total).collect();
            out.push(FeMessage {
                message_type: LittleEndian::read_u16(&frame[10..12]),
                message_version: frame[9],
                sequence: LittleEndian::read_u32(&frame[12..16]),
                payload: frame[FE_HEADER_SIZE..].to_vec(),
            });
        }

        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reset_request_layout() {
        let msg = reset_request(7, RESET_REBOOT_NAVIGATION_PROCESSOR);
        assert_eq!(msg.len(), FE_HEADER_SIZE + 4);
        assert_eq!(&msg[0..2], &[0x2E, 0x31]);
        assert_eq!(msg[8], FE_PROTOCOL_VERSION);
        assert_eq!(LittleEndian::read_u16(&msg[10..12]), FE_MSG_RESET_REQUEST);
        assert_eq!(LittleEndian::read_u32(&msg[12..16]), 7);
        assert_eq!(&msg[24..28], &[0x00, 0x00, 0x00, 0x01]);
    }

    #[test]
    fn test_decoder_with_noise_and_chunking() {
        let response = command_response(3, 9, FE_RESPONSE_OK);
        let mut stream = b"$GPGGA,garbage.\r\n".to_vec();
        stream.extend_from_slice(&response);

        let mut decoder = FeDecoder::new();
        let mut messages = Vec::new();
        for chunk in stream.chunks(5) {
            messages.extend(decoder.feed(chunk));
        }

        assert_eq!(messages.len(), 1);
        let cmd = CommandResponse::from_message(&messages[0]).unwrap();
        assert_eq!(cmd.source_sequence, 9);
        assert!(cmd.is_ok());
    }

    #[test]
    fn test_decoder_rejects_bad_crc() {
        let mut response = command_response(1, 1, FE_RESPONSE_OK);
        response[FE_HEADER_SIZE] ^= 0xFF;
        let good = command_response(2, 2, 3);
        response.extend_from_slice(&good);

        let messages = FeDecoder::new().feed(&response);
        assert_eq!(messages.len(), 1);
        let cmd = CommandResponse::from_message(&messages[0]).unwrap();
        assert_eq!(cmd.source_sequence, 2);
        assert!(!cmd.is_ok());
    }

    #[test]
    fn test_other_messages_are_not_responses() {
        let msg = FeDecoder::new().feed(&reset_request(1, RESET_PROBE));
        assert_eq!(msg.len(), 1);
        assert!(CommandResponse::from_message(&msg[0]).is_none());
    }
}
