//! Protocol constants for the LG69T serial updater and the FusionEngine
//! command channel of the application firmware.

// ============================================================================
// Sync handshake (Host <-> Updater, little-endian words)
// ============================================================================

/// First host sync word, repeated until the updater answers.
pub const SYNC_WORD1: u32 = 0x514C_1309;
/// Updater answer to `SYNC_WORD1`.
pub const RSP_WORD1: u32 = 0xAAFC_3A4D;
/// Second host sync word, sent once `RSP_WORD1` was seen.
pub const SYNC_WORD2: u32 = 0x1203_A504;
/// Updater answer to `SYNC_WORD2`; completes the handshake.
pub const RSP_WORD2: u32 = 0x55FD_5BA0;

// ============================================================================
// Frame envelope
// ============================================================================

/// Leading sentinel of every frame.
pub const FRAME_HEADER: u8 = 0xAA;
/// Trailing sentinel of every frame.
pub const FRAME_TAIL: u8 = 0x55;

/// Header bytes before the payload: sentinel, class, msg id, u16 length.
pub const FRAME_PREFIX_LEN: usize = 5;
/// Bytes after the payload: u32 CRC and tail sentinel.
pub const FRAME_SUFFIX_LEN: usize = 5;
/// Total framing overhead around a payload.
pub const FRAME_OVERHEAD: usize = FRAME_PREFIX_LEN + FRAME_SUFFIX_LEN;

// ============================================================================
// Class ids (one per updatable processor)
// ============================================================================

pub const CLASS_GNSS: u8 = 0x01;
pub const CLASS_APP: u8 = 0x02;

// ============================================================================
// Message ids
// ============================================================================

pub const MSG_ID_FIRMWARE_ADDRESS: u8 = 0x01;
pub const MSG_ID_FIRMWARE_INFO: u8 = 0x02;
pub const MSG_ID_START_UPGRADE: u8 = 0x03;
pub const MSG_ID_SEND_FIRMWARE: u8 = 0x04;
pub const MSG_ID_END_TRANSFER: u8 = 0x05;

// ============================================================================
// Responses (Updater -> Host)
// ============================================================================

/// Payload length of a plain command acknowledgement.
pub const RESPONSE_PAYLOAD_SIZE: usize = 4;
/// Payload length of a response carrying a trailing u32 report.
pub const REPORT_PAYLOAD_SIZE: usize = 8;
/// Status word meaning success.
pub const STATUS_OK: u16 = 0;

// ============================================================================
// Sizes and flash layout
// ============================================================================

/// Firmware block carried by one send-firmware message (5 KiB).
pub const PACKET_SIZE: usize = 1024 * 5;

/// Application flash offset. The manual says 0, but the STM32 bootloader
/// occupies the first 128 KiB.
pub const APP_FLASH_OFFSET: u32 = 0x2_0000;

/// Flash address of the STM32 bootloader for the external flashing tool.
pub const BOOTLOADER_FLASH_ADDRESS: u32 = 0x0800_0000;

/// GNSS receiver layout sent with the firmware info message.
pub const GNSS_BASE_ADDRESS: u32 = 0x1000_0000;
pub const GNSS_HEADER_SIZE: u32 = 0x0000_0400;
pub const GNSS_CODE_OFFSET: u32 = 0x0018_0000;
pub const GNSS_CODE_SIZE: u32 = 0x0008_0000;

/// Default serial link speed of the updater.
pub const DEFAULT_BAUD: u32 = 460_800;

// ============================================================================
// FusionEngine (application command channel, little-endian)
// ============================================================================

pub const FE_SYNC0: u8 = 0x2E; // '.'
pub const FE_SYNC1: u8 = 0x31; // '1'
pub const FE_PROTOCOL_VERSION: u8 = 2;
pub const FE_HEADER_SIZE: usize = 24;
/// Offset of the first byte covered by the header CRC.
pub const FE_CRC_START: usize = 8;

pub const FE_MSG_COMMAND_RESPONSE: u16 = 13000;
pub const FE_MSG_RESET_REQUEST: u16 = 13002;

/// Reset mask asking the navigation processor to reboot into its updater.
pub const RESET_REBOOT_NAVIGATION_PROCESSOR: u32 = 0x0100_0000;
/// Reset mask with no bits set; only asks the application to answer.
pub const RESET_PROBE: u32 = 0;

/// `CommandResponse` code for an accepted command.
pub const FE_RESPONSE_OK: u8 = 0;
