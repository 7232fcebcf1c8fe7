//! Payload handling module.
//!
//! Holds firmware images and cuts them into protocol packets.

pub mod image;
pub mod packets;

pub use image::{FirmwareImage, ImageFormat};
pub use packets::{Packet, PacketStream};
