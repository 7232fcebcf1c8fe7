//! Protocol module - LG69T updater and FusionEngine definitions.

pub mod constants;
pub mod frame;
pub mod response;
pub mod variant;

pub use constants::*;
pub use frame::{FlashLayout, FrameError, encode_frame, image_crc};
pub use response::{DeviceResponse, NackReason, decode_response, encode_response};
pub use variant::{BlockPadding, Component, ProtocolVariant};
