//! Wire frame encoding, see [`led_serial_expander_shared`] for the layout.

use led_serial_expander_shared::{
	BYTES_PER_PIXEL,
	CHANNEL_HEADER_LEN,
	FRAME_HEADER_LEN,
	FRAME_MAGIC,
	FRAME_TERMINATOR,
	FRAME_TRAILER_LEN,
	PROTOCOL_VERSION,
};

use crate::{EncodeError, Registry};

/// One encoded frame, ready to hand to a transport.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct WireFrame {
	bytes:    Vec<u8>,
	channels: usize,
}

impl WireFrame {
	pub fn as_bytes(&self) -> &[u8] {
		&self.bytes
	}

	pub fn len(&self) -> usize {
		self.bytes.len()
	}

	/// An empty frame comes from a registry without channels and is never sent.
	pub fn is_empty(&self) -> bool {
		self.bytes.is_empty()
	}

	pub fn channel_count(&self) -> usize {
		self.channels
	}
}

impl AsRef<[u8]> for WireFrame {
	fn as_ref(&self) -> &[u8] {
		&self.bytes
	}
}

pub fn check_len(buffer: &[u8], registry: &Registry) -> Result<(), EncodeError> {
	let expected = registry.total_bytes();
	if buffer.len() != expected {
		return Err(EncodeError::LengthMismatch {
			expected,
			actual: buffer.len(),
		});
	}
	Ok(())
}

/// Packs a flat RGB buffer into a frame.
///
/// `buffer` holds every channel back to back in ascending channel id, each
/// pixel as R, G, B. Bytes are reordered per channel to the strip's declared
/// color order. Anything but the exact registry length is rejected.
pub fn encode(buffer: &[u8], registry: &Registry) -> Result<WireFrame, EncodeError> {
	check_len(buffer, registry)?;

	if registry.is_empty() {
		return Ok(WireFrame::default());
	}

	let payload_len = registry.len() * CHANNEL_HEADER_LEN + registry.total_bytes();
	let mut bytes = Vec::with_capacity(FRAME_HEADER_LEN + payload_len + FRAME_TRAILER_LEN);

	bytes.extend_from_slice(FRAME_MAGIC);
	bytes.push(PROTOCOL_VERSION);
	bytes.push(registry.len() as u8);
	bytes.extend_from_slice(&(payload_len as u32).to_le_bytes());

	let mut rest = buffer;
	for strip in registry {
		let (pixels, tail) = rest.split_at(strip.byte_len());
		rest = tail;

		bytes.push(strip.channel);
		bytes.push(strip.chipset.code());
		bytes.extend_from_slice(&(strip.size as u16).to_le_bytes());

		for pixel in pixels.chunks_exact(BYTES_PER_PIXEL) {
			bytes.extend_from_slice(&strip.order.apply([pixel[0], pixel[1], pixel[2]]));
		}
	}
	debug_assert!(rest.is_empty());

	let checksum = fletcher16(&bytes[FRAME_MAGIC.len()..]);
	bytes.extend_from_slice(&checksum.to_le_bytes());
	bytes.push(FRAME_TERMINATOR);

	Ok(WireFrame {
		bytes,
		channels: registry.len(),
	})
}

/// Fletcher-16 with both sums reduced modulo 255, low byte is the first sum.
pub fn fletcher16(data: &[u8]) -> u16 {
	let mut sum1: u16 = 0;
	let mut sum2: u16 = 0;

	for &byte in data {
		sum1 = (sum1 + u16::from(byte)) % 255;
		sum2 = (sum2 + sum1) % 255;
	}

	(sum2 << 8) | sum1
}
