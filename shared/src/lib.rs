#![no_std]

//! Wire protocol constants shared between the host driver and the expander
//! board firmware.
//!
//! Frame layout, protocol version 1 (all multi-byte integers little endian):
//!
//! ```text
//! "LSE" | version | channel count | payload len (u32)
//!       | { channel id | chipset | pixel count (u16) | pixels }*
//!       | fletcher-16 (u16) | terminator
//! ```
//!
//! The checksum covers everything from the version byte to the end of the
//! last channel block. A board that sees a bad checksum or a missing
//! terminator drops the frame and hunts for the next magic.

pub const FRAME_MAGIC: &[u8; 3] = b"LSE";
pub const PROTOCOL_VERSION: u8 = 1;
pub const FRAME_TERMINATOR: u8 = 0xFE;

/// Magic, version, channel count and payload length.
pub const FRAME_HEADER_LEN: usize = FRAME_MAGIC.len() + 1 + 1 + 4;
/// Channel id, chipset code and pixel count.
pub const CHANNEL_HEADER_LEN: usize = 1 + 1 + 2;
/// Checksum and terminator.
pub const FRAME_TRAILER_LEN: usize = 2 + 1;

/// The expander drives eight connectors.
pub const MAX_CHANNELS: usize = 8;
/// Keeps a fully populated board above 30 frames per second at 2 Mbaud.
pub const MAX_PIXELS_PER_CHANNEL: usize = 1024;
pub const BYTES_PER_PIXEL: usize = 3;

pub const MAX_PAYLOAD_LEN: usize = MAX_CHANNELS * (CHANNEL_HEADER_LEN + MAX_PIXELS_PER_CHANNEL * BYTES_PER_PIXEL);
pub const MAX_FRAME_LEN: usize = FRAME_HEADER_LEN + MAX_PAYLOAD_LEN + FRAME_TRAILER_LEN;

pub const DEFAULT_BAUD_RATE: u32 = 2_000_000;
pub const MAX_BAUD_RATE: u32 = 4_000_000;

pub const CHIPSET_WS2811: u8 = 0;
pub const CHIPSET_WS2812: u8 = 1;
pub const CHIPSET_SK6812: u8 = 2;
pub const CHIPSET_WS2813: u8 = 3;

pub const DEVICE_MESSAGE_TYPE_LEN: usize = 1;

pub const DEVICE_ERROR_MESSAGE: &[u8; DEVICE_MESSAGE_TYPE_LEN] = b"e";
pub const DEVICE_OK_MESSAGE: &[u8; DEVICE_MESSAGE_TYPE_LEN] = b"k";
