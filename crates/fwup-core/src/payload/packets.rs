//! Lazy packetisation of a firmware image.

use std::borrow::Cow;

use crate::protocol::constants::MSG_ID_SEND_FIRMWARE;
use crate::protocol::frame::{FrameError, encode_frame};
use crate::protocol::{BlockPadding, ProtocolVariant};

/// One block of the image with its sequence number.
///
/// The frame checksum is not stored; [`Packet::to_frame`] computes it every
/// time, so a resent packet always carries a fresh checksum.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet<'a> {
    pub sequence: u32,
    pub payload: Cow<'a, [u8]>,
}

impl Packet<'_> {
    /// Encode as a send-firmware frame: `seq:u32 BE || block`.
    pub fn to_frame(&self, variant: &ProtocolVariant) -> Result<Vec<u8>, FrameError> {
        let mut body = Vec::with_capacity(4 + self.payload.len());
        body.extend_from_slice(&self.sequence.to_be_bytes());
        body.extend_from_slice(&self.payload);
        encode_frame(variant.checksum, variant.class_id, MSG_ID_SEND_FIRMWARE, &body)
    }
}

/// Restartable packet sequence over borrowed image data.
///
/// Blocks are cut on demand: [`PacketStream::packet`] returns any block
/// without producing the ones before it, and iteration can be rewound.
#[derive(Debug, Clone)]
pub struct PacketStream<'a> {
    data: &'a [u8],
    variant: ProtocolVariant,
    next: usize,
}

impl<'a> PacketStream<'a> {
    pub fn new(data: &'a [u8], variant: ProtocolVariant) -> Self {
        Self {
            data,
            variant,
            next: 0,
        }
    }

    /// Number of packets: ceil(len / block_size).
    pub fn total(&self) -> usize {
        self.data.len().div_ceil(self.variant.block_size.get())
    }

    /// Packet at `index`, or `None` past the end.
    pub fn packet(&self, index: usize) -> Option<Packet<'a>> {
        let block = self.variant.block_size.get();
        let start = index.checked_mul(block)?;
        if start >= self.data.len() {
            return None;
        }
        let end = (start + block).min(self.data.len());
        let chunk = &self.data[start..end];

        let payload = match self.variant.padding {
            BlockPadding::ZeroFill if chunk.len() < block => {
                let mut padded = chunk.to_vec();
                padded.resize(block, 0);
                Cow::Owned(padded)
            }
            _ => Cow::Borrowed(chunk),
        };

        Some(Packet {
            sequence: self.variant.sequence_origin + index as u32,
            payload,
        })
    }

    /// Index of the next packet the iterator will yield.
    pub fn position(&self) -> usize {
        self.next
    }

    /// Move the iterator to `index`.
    pub fn seek(&mut self, index: usize) {
        self.next = index;
    }

    /// Rewind to the first packet.
    pub fn rewind(&mut self) {
        self.next = 0;
    }
}

impl<'a> Iterator for PacketStream<'a> {
    type Item = Packet<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        let packet = self.packet(self.next)?;
        self.next += 1;
        Some(packet)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.total().saturating_sub(self.next);
        (remaining, Some(remaining))
    }
}

impl ExactSizeIterator for PacketStream<'_> {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{FRAME_OVERHEAD, ProtocolVariant};

    #[test]
    fn test_packet_count_and_sequence() {
        for (size, block) in [(1024usize, 256usize), (1025, 256), (1, 256), (5120 * 3 + 7, 5120)] {
            let data = vec![0xA5u8; size];
            let variant = ProtocolVariant::APPLICATION.with_block_size(block).unwrap();
            let packets: Vec<_> = PacketStream::new(&data, variant).collect();

            assert_eq!(packets.len(), size.div_ceil(block));
            for (i, p) in packets.iter().enumerate() {
                assert_eq!(p.sequence, variant.sequence_origin + i as u32);
            }
            let total: usize = packets.iter().map(|p| p.payload.len()).sum();
            assert_eq!(total, size);
        }
    }

    #[test]
    fn test_sequence_starts_at_origin() {
        let mut variant = ProtocolVariant::GNSS.with_block_size(16).unwrap();
        variant.sequence_origin = 100;
        let data = vec![0u8; 40];
        let seqs: Vec<u32> = PacketStream::new(&data, variant).map(|p| p.sequence).collect();
        assert_eq!(seqs, vec![100, 101, 102]);
    }

    #[test]
    fn test_zero_fill_final_block() {
        let mut variant = ProtocolVariant::APPLICATION.with_block_size(8).unwrap();
        variant.padding = BlockPadding::ZeroFill;
        let data = [1u8, 2, 3, 4, 5, 6, 7, 8, 9, 10];
        let stream = PacketStream::new(&data, variant);
        let last = stream.packet(1).unwrap();
        assert_eq!(&last.payload[..], &[9, 10, 0, 0, 0, 0, 0, 0]);
    }

    #[test]
    fn test_random_access_and_rewind() {
        let data: Vec<u8> = (0..=255u8).cycle().take(1000).collect();
        let variant = ProtocolVariant::APPLICATION.with_block_size(100).unwrap();
        let mut stream = PacketStream::new(&data, variant);

        let p7 = stream.packet(7).unwrap();
        assert_eq!(&p7.payload[..], &data[700..800]);
        assert!(stream.packet(10).is_none());

        stream.seek(9);
        assert_eq!(stream.next().unwrap().sequence, 9);
        assert!(stream.next().is_none());
        stream.rewind();
        assert_eq!(stream.total(), 10);
        assert_eq!(stream.len(), 10);
        assert_eq!(stream.count(), 10);
    }

    #[test]
    fn test_frame_checksum_recomputed() {
        let data = vec![0x11u8; 32];
        let variant = ProtocolVariant::APPLICATION.with_block_size(16).unwrap();
        let stream = PacketStream::new(&data, variant);
        let packet = stream.packet(1).unwrap();

        let a = packet.to_frame(&variant).unwrap();
        assert_eq!(a.len(), FRAME_OVERHEAD + 4 + 16);
        assert_eq!(&a[5..9], &1u32.to_be_bytes());

        let mut altered = packet.clone();
        altered.payload.to_mut()[0] = 0x22;
        let b = altered.to_frame(&variant).unwrap();
        assert_ne!(a[a.len() - 5..a.len() - 1], b[b.len() - 5..b.len() - 1]);
    }
}
