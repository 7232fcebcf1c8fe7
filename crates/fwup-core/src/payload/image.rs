//! Firmware image held in memory for one update.

use std::fmt;

use crc::CRC_32_ISO_HDLC;

use crate::protocol::frame::image_crc;
use crate::protocol::{Component, ProtocolVariant};

/// Where the image bytes came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageFormat {
    /// Plain binary for one component.
    Raw,
    /// Extracted from a `.p1fw` package (zip archive or directory).
    Packaged,
}

impl fmt::Display for ImageFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ImageFormat::Raw => write!(f, "raw"),
            ImageFormat::Packaged => write!(f, "packaged"),
        }
    }
}

/// Immutable firmware payload with its target component.
///
/// `integrity` is computed once at construction with the checksum of the
/// component's protocol variant and is what the device must report back
/// after the transfer.
pub struct FirmwareImage {
    data: Vec<u8>,
    component: Component,
    version: Option<String>,
    format: ImageFormat,
    integrity: u32,
}

impl FirmwareImage {
    pub fn new(
        data: Vec<u8>,
        component: Component,
        version: Option<String>,
        format: ImageFormat,
    ) -> Self {
        let algorithm = ProtocolVariant::for_component(component)
            .map(|v| v.checksum)
            .unwrap_or(&CRC_32_ISO_HDLC);
        let integrity = image_crc(algorithm, &data);
        Self {
            data,
            component,
            version,
            format,
            integrity,
        }
    }

    /// Raw image from bytes.
    pub fn raw(data: Vec<u8>, component: Component) -> Self {
        Self::new(data, component, None, ImageFormat::Raw)
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn component(&self) -> Component {
        self.component
    }

    pub fn version(&self) -> Option<&str> {
        self.version.as_deref()
    }

    pub fn format(&self) -> ImageFormat {
        self.format
    }

    pub fn integrity(&self) -> u32 {
        self.integrity
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

impl fmt::Debug for FirmwareImage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FirmwareImage")
            .field("component", &self.component)
            .field("version", &self.version)
            .field("format", &self.format)
            .field("len", &self.data.len())
            .field("integrity", &format_args!("0x{:08X}", self.integrity))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_integrity_matches_updater_crc() {
        let image = FirmwareImage::raw(vec![0x5A; 1000], Component::Gnss);
        assert_eq!(image.integrity(), image_crc(&CRC_32_ISO_HDLC, &[0x5A; 1000]));
        assert_eq!(image.len(), 1000);
        assert_eq!(image.format(), ImageFormat::Raw);
        assert!(image.version().is_none());
    }
}
