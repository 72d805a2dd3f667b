//! Two 30 pixel RBG strips on channels 0 and 1 with sparks scrolling along.
//!
//! `cargo run --example blocking -- /dev/ttyACM0`

use color_eyre::eyre::{eyre, Result};
use led_serial_expander::{ChipsetType, ColorOrder, Driver, Options, StripConfig};
use tracing_subscriber::EnvFilter;

const PALETTE: [[u8; 3]; 3] = [[0, 0, 150], [150, 0, 0], [0, 150, 0]];

fn main() -> Result<()> {
	color_eyre::install()?;
	tracing_subscriber::fmt()
		.with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
		.init();

	let device = std::env::args().nth(1).ok_or_else(|| eyre!("usage: blocking <serial device>"))?;

	let strips = [
		StripConfig::new(0, 30, ColorOrder::Rbg, ChipsetType::Ws2812),
		StripConfig::new(1, 30, ColorOrder::Rbg, ChipsetType::Ws2812),
	];
	let mut display = Driver::open(&device, strips, Options::default().max_fps(60.0).fps_reporting(true))?;

	let mut data = vec![0u8; display.registry().total_bytes()];
	let mut seed = 0x2545_f491_u32;

	loop {
		// scroll by one pixel, the buffer handed to the driver is always full length
		data.copy_within(3.., 0);
		seed ^= seed << 13;
		seed ^= seed >> 17;
		seed ^= seed << 5;
		let pick = (seed % 90) as usize;
		let tail = data.len() - 3;
		data[tail..].copy_from_slice(PALETTE.get(pick).unwrap_or(&[0, 0, 0]));

		display.write(&data)?;
	}
}
