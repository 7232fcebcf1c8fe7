//! Per-component protocol parameters.

use std::fmt;
use std::num::NonZeroUsize;
use std::str::FromStr;

use crc::{Algorithm, CRC_32_ISO_HDLC};
use serde::{Deserialize, Serialize};

use super::constants::*;
use super::frame::FlashLayout;

/// Independently updatable firmware part of the module.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Component {
    /// STM32 bootloader, flashed by an external tool.
    Bootloader,
    /// Application (FusionEngine) firmware.
    #[serde(alias = "app")]
    Application,
    /// GNSS receiver firmware.
    Gnss,
}

impl fmt::Display for Component {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Component::Bootloader => write!(f, "bootloader"),
            Component::Application => write!(f, "application"),
            Component::Gnss => write!(f, "gnss"),
        }
    }
}

impl FromStr for Component {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "bootloader" | "boot" => Ok(Component::Bootloader),
            "application" | "app" => Ok(Component::Application),
            "gnss" => Ok(Component::Gnss),
            other => Err(format!("unknown component '{}'", other)),
        }
    }
}

/// How the final, short block of an image is carried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockPadding {
    /// Sent short; the frame length field tells the device its size.
    LengthTagged,
    /// Filled with zeros up to the block size.
    ZeroFill,
}

const DEFAULT_BLOCK_SIZE: NonZeroUsize = match NonZeroUsize::new(PACKET_SIZE) {
    Some(size) => size,
    None => panic!("PACKET_SIZE must not be zero"),
};

/// Framing, checksum and block-size parameters of one update protocol.
#[derive(Debug, Clone, Copy)]
pub struct ProtocolVariant {
    pub component: Component,
    pub class_id: u8,
    pub block_size: NonZeroUsize,
    pub sequence_origin: u32,
    pub padding: BlockPadding,
    pub checksum: &'static Algorithm<u32>,
    pub layout: FlashLayout,
}

impl ProtocolVariant {
    pub const APPLICATION: ProtocolVariant = ProtocolVariant {
        component: Component::Application,
        class_id: CLASS_APP,
        block_size: DEFAULT_BLOCK_SIZE,
        sequence_origin: 0,
        padding: BlockPadding::LengthTagged,
        checksum: &CRC_32_ISO_HDLC,
        layout: FlashLayout::Application {
            offset: APP_FLASH_OFFSET,
        },
    };

    pub const GNSS: ProtocolVariant = ProtocolVariant {
        component: Component::Gnss,
        class_id: CLASS_GNSS,
        block_size: DEFAULT_BLOCK_SIZE,
        sequence_origin: 0,
        padding: BlockPadding::LengthTagged,
        checksum: &CRC_32_ISO_HDLC,
        layout: FlashLayout::Gnss {
            base: GNSS_BASE_ADDRESS,
            header_size: GNSS_HEADER_SIZE,
            code_offset: GNSS_CODE_OFFSET,
            code_size: GNSS_CODE_SIZE,
        },
    };

    /// Variant for a component, if the serial updater handles it.
    ///
    /// The bootloader is not reachable through the updater; it is flashed
    /// by an external tool.
    pub fn for_component(component: Component) -> Option<ProtocolVariant> {
        match component {
            Component::Application => Some(Self::APPLICATION),
            Component::Gnss => Some(Self::GNSS),
            Component::Bootloader => None,
        }
    }

    /// Same variant with a different block size; `None` for zero.
    pub fn with_block_size(mut self, block_size: usize) -> Option<Self> {
        self.block_size = NonZeroUsize::new(block_size)?;
        Some(self)
    }
}
