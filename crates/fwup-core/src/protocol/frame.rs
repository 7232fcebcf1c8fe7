//! Frame envelope and the setup message payloads of the updater protocol.

use byteorder::{BigEndian, WriteBytesExt};
use crc::{Algorithm, Crc};
use thiserror::Error;

use super::constants::*;

#[derive(Error, Debug)]
pub enum FrameError {
    #[error("Payload too large: {len} bytes, maximum {max}")]
    PayloadTooLarge { len: usize, max: usize },
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Build a complete frame: `AA | class | msg | len | payload | crc | 55`.
///
/// The CRC is computed here on every call over class, message id, length
/// and payload.
pub fn encode_frame(
    algorithm: &'static Algorithm<u32>,
    class_id: u8,
    msg_id: u8,
    payload: &[u8],
) -> Result<Vec<u8>, FrameError> {
    let len = u16::try_from(payload.len()).map_err(|_| FrameError::PayloadTooLarge {
        len: payload.len(),
        max: u16::MAX as usize,
    })?;

    let mut buf = Vec::with_capacity(payload.len() + FRAME_OVERHEAD);
    buf.push(FRAME_HEADER);
    buf.push(class_id);
    buf.push(msg_id);
    buf.write_u16::<BigEndian>(len)?;
    buf.extend_from_slice(payload);

    let crc = Crc::<u32>::new(algorithm).checksum(&buf[1..]);
    buf.write_u32::<BigEndian>(crc)?;
    buf.push(FRAME_TAIL);
    Ok(buf)
}

/// Integrity value the updater expects for an image: CRC over
/// `le_u32(len) || data`.
pub fn image_crc(algorithm: &'static Algorithm<u32>, data: &[u8]) -> u32 {
    let crc = Crc::<u32>::new(algorithm);
    let mut digest = crc.digest();
    digest.update(&(data.len() as u32).to_le_bytes());
    digest.update(data);
    digest.finalize()
}

/// Firmware address payload. The updater only accepts zero here.
pub fn firmware_address_payload() -> [u8; 4] {
    [0u8; 4]
}

/// Flash layout carried in the firmware info message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlashLayout {
    /// Application processor: single offset.
    Application { offset: u32 },
    /// GNSS receiver: base address, header size, code offset, code size.
    Gnss {
        base: u32,
        header_size: u32,
        code_offset: u32,
        code_size: u32,
    },
}

/// Firmware info payload (size, image CRC and flash layout).
///
/// Application: `>IIIB3x`, GNSS: `>IIIIIIBBB5x`.
pub fn firmware_info_payload(layout: &FlashLayout, size: u32, crc: u32) -> Vec<u8> {
    let mut buf = Vec::with_capacity(32);
    buf.extend_from_slice(&size.to_be_bytes());
    buf.extend_from_slice(&crc.to_be_bytes());
    match *layout {
        FlashLayout::Application { offset } => {
            buf.extend_from_slice(&offset.to_be_bytes());
            buf.push(0x01);
            buf.extend_from_slice(&[0u8; 3]);
        }
        FlashLayout::Gnss {
            base,
            header_size,
            code_offset,
            code_size,
        } => {
            buf.extend_from_slice(&base.to_be_bytes());
            buf.extend_from_slice(&header_size.to_be_bytes());
            buf.extend_from_slice(&code_offset.to_be_bytes());
            buf.extend_from_slice(&code_size.to_be_bytes());
            buf.extend_from_slice(&[0x01, 0x00, 0x00]);
            buf.extend_from_slice(&[0u8; 5]);
        }
    }
    buf
}

/// End-of-transfer payload: number of packets the host sent.
pub fn end_transfer_payload(packet_count: u32) -> [u8; 4] {
    packet_count.to_be_bytes()
}

/// Encode a sync word as it goes on the wire.
pub fn sync_bytes(word: u32) -> [u8; 4] {
    word.to_le_bytes()
}
