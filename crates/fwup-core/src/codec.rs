//! Framing codec bound to one protocol variant.
//!
//! Turns images and setup commands into frames and reads device responses
//! off a transport. Everything variant-specific (class id, block size,
//! checksum) comes from the [`ProtocolVariant`] it was built with.

use std::time::Duration;

use byteorder::{BigEndian, ByteOrder};
use tracing::trace;

use crate::payload::{FirmwareImage, PacketStream};
use crate::protocol::constants::*;
use crate::protocol::frame::{self, FrameError, encode_frame};
use crate::protocol::{DeviceResponse, ProtocolVariant, decode_response};
use crate::transport::{Transport, TransportError};

#[derive(Debug, Clone, Copy)]
pub struct FramingCodec {
    variant: ProtocolVariant,
}

impl FramingCodec {
    pub fn new(variant: ProtocolVariant) -> Self {
        Self { variant }
    }

    pub fn variant(&self) -> &ProtocolVariant {
        &self.variant
    }

    /// Lazy packet sequence over the image.
    pub fn encode<'a>(&self, image: &'a FirmwareImage) -> PacketStream<'a> {
        PacketStream::new(image.data(), self.variant)
    }

    /// Frame a command for this variant's class.
    pub fn command(&self, msg_id: u8, payload: &[u8]) -> Result<Vec<u8>, FrameError> {
        encode_frame(self.variant.checksum, self.variant.class_id, msg_id, payload)
    }

    pub fn firmware_address(&self) -> Result<Vec<u8>, FrameError> {
        self.command(MSG_ID_FIRMWARE_ADDRESS, &frame::firmware_address_payload())
    }

    pub fn firmware_info(&self, image: &FirmwareImage) -> Result<Vec<u8>, FrameError> {
        let payload = frame::firmware_info_payload(
            &self.variant.layout,
            image.len() as u32,
            image.integrity(),
        );
        self.command(MSG_ID_FIRMWARE_INFO, &payload)
    }

    pub fn start_upgrade(&self) -> Result<Vec<u8>, FrameError> {
        self.command(MSG_ID_START_UPGRADE, &[])
    }

    pub fn end_transfer(&self, packet_count: u32) -> Result<Vec<u8>, FrameError> {
        self.command(MSG_ID_END_TRANSFER, &frame::end_transfer_payload(packet_count))
    }

    /// Parse a complete response frame to `msg_id`.
    pub fn decode(&self, msg_id: u8, bytes: &[u8]) -> DeviceResponse {
        decode_response(self.variant.checksum, self.variant.class_id, msg_id, bytes)
    }

    /// Read one response frame to `msg_id` from the transport.
    ///
    /// Silence maps to `Timeout`, a partial or implausible frame to
    /// `Malformed`. Only transport failures other than a timeout are errors.
    pub fn read_response<T: Transport + ?Sized>(
        &self,
        transport: &mut T,
        msg_id: u8,
        timeout: Duration,
    ) -> Result<DeviceResponse, TransportError> {
        let head = match transport.receive_exact(FRAME_PREFIX_LEN, timeout) {
            Ok(bytes) => bytes,
            Err(e) if e.is_timeout() => return Ok(DeviceResponse::Timeout),
            Err(e) => return Err(e),
        };
        if head.len() < FRAME_PREFIX_LEN || head[0] != FRAME_HEADER {
            trace!(bytes = ?head, "Bad response header");
            return Ok(DeviceResponse::Malformed);
        }

        let payload_len = BigEndian::read_u16(&head[3..5]) as usize;
        if payload_len > REPORT_PAYLOAD_SIZE {
            return Ok(DeviceResponse::Malformed);
        }

        let rest_len = payload_len + FRAME_SUFFIX_LEN;
        let rest = match transport.receive_exact(rest_len, timeout) {
            Ok(bytes) => bytes,
            Err(e) if e.is_timeout() => return Ok(DeviceResponse::Malformed),
            Err(e) => return Err(e),
        };

        let mut frame = head;
        frame.extend_from_slice(&rest);
        Ok(self.decode(msg_id, &frame))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{Component, NackReason, encode_response};
    use crate::transport::MockTransport;

    const T: Duration = Duration::from_millis(10);

    fn codec() -> FramingCodec {
        FramingCodec::new(ProtocolVariant::APPLICATION)
    }

    fn ack_bytes(msg_id: u8) -> Vec<u8> {
        encode_response(&crc::CRC_32_ISO_HDLC, CLASS_APP, msg_id, STATUS_OK, None)
    }

    #[test]
    fn test_encode_counts() {
        let image = FirmwareImage::raw(vec![0u8; 1024], Component::Application);
        let codec = FramingCodec::new(ProtocolVariant::APPLICATION.with_block_size(256).unwrap());
        let packets: Vec<_> = codec.encode(&image).collect();
        assert_eq!(packets.len(), 4);
        assert_eq!(packets[0].sequence, 0);
        assert_eq!(packets[3].sequence, 3);
    }

    #[test]
    fn test_decode_ack_roundtrip() {
        let bytes = ack_bytes(MSG_ID_SEND_FIRMWARE);
        assert_eq!(
            codec().decode(MSG_ID_SEND_FIRMWARE, &bytes),
            DeviceResponse::Ack { report: None }
        );
    }

    #[test]
    fn test_read_response_variants() {
        let codec = codec();
        let mut mock = MockTransport::new();

        mock.queue_bytes(&ack_bytes(MSG_ID_START_UPGRADE));
        mock.queue_silence();
        mock.queue_bytes(&encode_response(
            &crc::CRC_32_ISO_HDLC,
            CLASS_APP,
            MSG_ID_START_UPGRADE,
            2,
            None,
        ));
        mock.queue_bytes(b"\x00garbage");

        let read = |mock: &mut MockTransport| {
            codec
                .read_response(mock, MSG_ID_START_UPGRADE, T)
                .unwrap()
        };
        assert!(read(&mut mock).is_ack());
        assert_eq!(read(&mut mock), DeviceResponse::Timeout);
        assert_eq!(read(&mut mock), DeviceResponse::Nack(NackReason(2)));
        assert_eq!(read(&mut mock), DeviceResponse::Malformed);
    }

    #[test]
    fn test_read_response_truncated_is_malformed() {
        let codec = codec();
        let mut mock = MockTransport::new();
        let bytes = ack_bytes(MSG_ID_SEND_FIRMWARE);
        mock.queue_bytes(&bytes[..9]);

        assert_eq!(
            codec.read_response(&mut mock, MSG_ID_SEND_FIRMWARE, T).unwrap(),
            DeviceResponse::Malformed
        );
    }

    #[test]
    fn test_read_response_propagates_io_errors() {
        let codec = codec();
        let mut mock = MockTransport::new();
        mock.disconnect();
        assert!(matches!(
            codec.read_response(&mut mock, MSG_ID_SEND_FIRMWARE, T),
            Err(TransportError::Disconnected)
        ));
    }

    #[test]
    fn test_setup_frames_use_variant_class() {
        let codec = FramingCodec::new(ProtocolVariant::GNSS);
        let image = FirmwareImage::raw(vec![1, 2, 3], Component::Gnss);
        let info = codec.firmware_info(&image).unwrap();
        assert_eq!(info[1], CLASS_GNSS);
        assert_eq!(info[2], MSG_ID_FIRMWARE_INFO);
        assert_eq!(&info[5..9], &3u32.to_be_bytes());
        assert_eq!(&info[9..13], &image.integrity().to_be_bytes());
    }
}
