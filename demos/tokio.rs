//! A single strip on channel 0 fading through red, green and blue.
//!
//! `cargo run --example tokio --features tokio -- /dev/ttyACM0 144`

use color_eyre::eyre::{eyre, Result};
use led_serial_expander::{tokio::Driver, ChipsetType, ColorOrder, Options, StripConfig};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
	color_eyre::install()?;
	tracing_subscriber::fmt()
		.with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
		.init();

	let mut args = std::env::args().skip(1);
	let device = args.next().ok_or_else(|| eyre!("usage: tokio <serial device> [pixels]"))?;
	let pixels = args.next().map(|n| n.parse()).transpose()?.unwrap_or(60);

	let strips = [StripConfig::new(0, pixels, ColorOrder::Grb, ChipsetType::Ws2812)];
	let mut display = Driver::open(&device, strips, Options::default().max_fps(100.0).fps_reporting(true))?;

	let mut data = vec![0u8; display.registry().total_bytes()];
	for step in 0u32.. {
		let phase = (step % 768) as usize;
		let (channel, level) = (phase / 256, (phase % 256) as u8);
		for pixel in data.chunks_exact_mut(3) {
			pixel.fill(0);
			pixel[channel] = level;
		}

		tokio::select! {
			res = display.write(&data) => {
				res?;
			}
			_ = tokio::signal::ctrl_c() => break,
		}
	}

	display.close().await;

	Ok(())
}
