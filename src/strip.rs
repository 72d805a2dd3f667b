use std::{collections::BTreeMap, fmt, str::FromStr};

use led_serial_expander_shared::{
	BYTES_PER_PIXEL,
	CHIPSET_SK6812,
	CHIPSET_WS2811,
	CHIPSET_WS2812,
	CHIPSET_WS2813,
	MAX_CHANNELS,
	MAX_PIXELS_PER_CHANNEL,
};

use crate::ValidationError;

/// Byte order the LEDs on a channel expect, named from first to last byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(try_from = "String", into = "String"))]
pub enum ColorOrder {
	#[default]
	Rgb,
	Rbg,
	Grb,
	Gbr,
	Brg,
	Bgr,
}

impl ColorOrder {
	pub const ALL: [ColorOrder; 6] = [
		ColorOrder::Rgb,
		ColorOrder::Rbg,
		ColorOrder::Grb,
		ColorOrder::Gbr,
		ColorOrder::Brg,
		ColorOrder::Bgr,
	];

	/// For each output byte, the index of the canonical R, G, B component it takes.
	pub const fn indices(self) -> [usize; BYTES_PER_PIXEL] {
		match self {
			ColorOrder::Rgb => [0, 1, 2],
			ColorOrder::Rbg => [0, 2, 1],
			ColorOrder::Grb => [1, 0, 2],
			ColorOrder::Gbr => [1, 2, 0],
			ColorOrder::Brg => [2, 0, 1],
			ColorOrder::Bgr => [2, 1, 0],
		}
	}

	/// Reorders one canonical RGB pixel into this order.
	#[inline]
	pub fn apply(self, rgb: [u8; BYTES_PER_PIXEL]) -> [u8; BYTES_PER_PIXEL] {
		let [a, b, c] = self.indices();
		[rgb[a], rgb[b], rgb[c]]
	}

	/// Turns a pixel in this order back into canonical RGB.
	#[inline]
	pub fn revert(self, ordered: [u8; BYTES_PER_PIXEL]) -> [u8; BYTES_PER_PIXEL] {
		let mut rgb = [0u8; BYTES_PER_PIXEL];
		for (slot, &component) in self.indices().iter().enumerate() {
			rgb[component] = ordered[slot];
		}
		rgb
	}

	pub const fn as_str(self) -> &'static str {
		match self {
			ColorOrder::Rgb => "RGB",
			ColorOrder::Rbg => "RBG",
			ColorOrder::Grb => "GRB",
			ColorOrder::Gbr => "GBR",
			ColorOrder::Brg => "BRG",
			ColorOrder::Bgr => "BGR",
		}
	}
}

impl FromStr for ColorOrder {
	type Err = ValidationError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		ColorOrder::ALL
			.into_iter()
			.find(|order| order.as_str().eq_ignore_ascii_case(s.trim()))
			.ok_or_else(|| ValidationError::InvalidOrder(s.to_string()))
	}
}

impl TryFrom<String> for ColorOrder {
	type Error = ValidationError;

	fn try_from(s: String) -> Result<Self, Self::Error> {
		s.parse()
	}
}

impl From<ColorOrder> for String {
	fn from(order: ColorOrder) -> Self {
		order.as_str().to_string()
	}
}

impl fmt::Display for ColorOrder {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

/// LED chipset a channel is wired to. Only the board's output timing depends
/// on it, the host just forwards the code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(try_from = "u8", into = "u8"))]
#[repr(u8)]
pub enum ChipsetType {
	/// 400 kHz WS2811 drivers.
	Ws2811 = CHIPSET_WS2811,
	#[default]
	Ws2812 = CHIPSET_WS2812,
	Sk6812 = CHIPSET_SK6812,
	Ws2813 = CHIPSET_WS2813,
}

impl ChipsetType {
	pub const fn code(self) -> u8 {
		self as u8
	}
}

impl TryFrom<u8> for ChipsetType {
	type Error = ValidationError;

	fn try_from(code: u8) -> Result<Self, Self::Error> {
		match code {
			CHIPSET_WS2811 => Ok(ChipsetType::Ws2811),
			CHIPSET_WS2812 => Ok(ChipsetType::Ws2812),
			CHIPSET_SK6812 => Ok(ChipsetType::Sk6812),
			CHIPSET_WS2813 => Ok(ChipsetType::Ws2813),
			_ => Err(ValidationError::InvalidType(code)),
		}
	}
}

impl From<ChipsetType> for u8 {
	fn from(chipset: ChipsetType) -> Self {
		chipset.code()
	}
}

/// Everything about a channel except its id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct StripSettings {
	pub size:    usize,
	#[cfg_attr(feature = "serde", serde(default))]
	pub order:   ColorOrder,
	#[cfg_attr(feature = "serde", serde(default, rename = "type"))]
	pub chipset: ChipsetType,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct StripConfig {
	pub channel: u8,
	pub size:    usize,
	#[cfg_attr(feature = "serde", serde(default))]
	pub order:   ColorOrder,
	#[cfg_attr(feature = "serde", serde(default, rename = "type"))]
	pub chipset: ChipsetType,
}

impl StripConfig {
	pub fn new(channel: u8, size: usize, order: ColorOrder, chipset: ChipsetType) -> Self {
		Self {
			channel,
			size,
			order,
			chipset,
		}
	}

	pub fn byte_len(&self) -> usize {
		self.size * BYTES_PER_PIXEL
	}

	fn validate(&self) -> Result<(), ValidationError> {
		if usize::from(self.channel) >= MAX_CHANNELS {
			return Err(ValidationError::InvalidChannel {
				channel: self.channel,
				max:     MAX_CHANNELS,
			});
		}
		if self.size == 0 || self.size > MAX_PIXELS_PER_CHANNEL {
			return Err(ValidationError::InvalidSize {
				channel: self.channel,
				size:    self.size,
				max:     MAX_PIXELS_PER_CHANNEL,
			});
		}
		Ok(())
	}
}

/// Validated, immutable set of channels.
///
/// Channels are kept in ascending id order. That order is also how a flat
/// pixel buffer is split: the first `3 * size` bytes belong to the lowest
/// channel id, the next block to the second lowest, and so on.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Registry {
	strips:       Vec<StripConfig>,
	total_pixels: usize,
}

impl Registry {
	pub fn new(strips: impl IntoIterator<Item = StripConfig>) -> Result<Self, ValidationError> {
		let mut by_channel = BTreeMap::new();
		for strip in strips {
			strip.validate()?;
			if by_channel.insert(strip.channel, strip).is_some() {
				return Err(ValidationError::DuplicateChannel(strip.channel));
			}
		}

		let strips: Vec<_> = by_channel.into_values().collect();
		let total_pixels = strips.iter().map(|s| s.size).sum();

		Ok(Self { strips, total_pixels })
	}

	pub fn from_map(map: BTreeMap<u8, StripSettings>) -> Result<Self, ValidationError> {
		Self::new(
			map.into_iter()
				.map(|(channel, s)| StripConfig::new(channel, s.size, s.order, s.chipset)),
		)
	}

	pub fn iter(&self) -> impl ExactSizeIterator<Item = &StripConfig> + '_ {
		self.strips.iter()
	}

	pub fn get(&self, channel: u8) -> Option<&StripConfig> {
		self.strips
			.binary_search_by_key(&channel, |s| s.channel)
			.ok()
			.map(|idx| &self.strips[idx])
	}

	pub fn len(&self) -> usize {
		self.strips.len()
	}

	pub fn is_empty(&self) -> bool {
		self.strips.is_empty()
	}

	pub fn total_pixels(&self) -> usize {
		self.total_pixels
	}

	/// Exact length a pixel buffer must have.
	pub fn total_bytes(&self) -> usize {
		self.total_pixels * BYTES_PER_PIXEL
	}
}

impl TryFrom<Vec<StripConfig>> for Registry {
	type Error = ValidationError;

	fn try_from(strips: Vec<StripConfig>) -> Result<Self, Self::Error> {
		Self::new(strips)
	}
}

impl<'a> IntoIterator for &'a Registry {
	type IntoIter = std::slice::Iter<'a, StripConfig>;
	type Item = &'a StripConfig;

	fn into_iter(self) -> Self::IntoIter {
		self.strips.iter()
	}
}
