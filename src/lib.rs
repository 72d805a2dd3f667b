//! Host side driver for LED serial expander boards.
//!
//! The board exposes several strip connectors behind one serial link. A
//! [`Driver`] takes one flat RGB buffer for the whole display, splits it by
//! channel (ascending channel id), reorders each pixel to the strip's color
//! order, frames it and pushes it down the link no faster than configured.
//!
//! ```no_run
//! use led_serial_expander::{ChipsetType, ColorOrder, Driver, Options, StripConfig};
//!
//! let strips = [
//! 	StripConfig::new(0, 30, ColorOrder::Rbg, ChipsetType::Ws2812),
//! 	StripConfig::new(1, 30, ColorOrder::Rbg, ChipsetType::Ws2812),
//! ];
//! let mut display = Driver::open("/dev/ttyACM0", strips, Options::default().max_fps(60.0))?;
//! display.write(&[0u8; 60 * 3])?;
//! display.close();
//! # Ok::<(), led_serial_expander::DriverError>(())
//! ```

#[cfg(feature = "timings")]
use std::time::Duration;

use led_serial_expander_shared::{DEVICE_ERROR_MESSAGE, DEVICE_MESSAGE_TYPE_LEN, DEVICE_OK_MESSAGE};
use tracing::{debug, info, warn};

pub mod error;
pub mod frame;
pub mod options;
pub mod pacing;
pub mod strip;
#[cfg(feature = "tokio")]
pub mod tokio;
pub mod transport;

pub use error::{ConfigError, ConnectError, DriverError, EncodeError, IoError, Result, StateError, ValidationError};
pub use frame::{encode, WireFrame};
pub use led_serial_expander_shared as protocol;
pub use options::Options;
pub use pacing::{Clock, ManualClock, PacingController, SystemClock};
pub use strip::{ChipsetType, ColorOrder, Registry, StripConfig, StripSettings};
pub use transport::{Ack, Fault, LinkTransport, MemoryTransport, SerialTransport};

/// Per frame timings, returned by `write` with the `timings` feature.
#[cfg(feature = "timings")]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FrameTiming {
	/// Time spent waiting for the pacing slot.
	pub pacing:   Duration,
	/// Encoding, writing and (if enabled) waiting for the acknowledgement.
	pub transmit: Duration,
}

#[cfg(feature = "timings")]
pub type WriteResult = FrameTiming;
#[cfg(not(feature = "timings"))]
pub type WriteResult = ();

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
	Ready,
	/// The link broke. Writes fail until [`Driver::reconnect`] succeeds.
	Degraded,
	Closed,
}

pub(crate) fn check_ack(response: &[u8]) -> Result<(), IoError> {
	match response {
		[] => Err(IoError::Timeout),
		r if r == DEVICE_OK_MESSAGE => Ok(()),
		r if r == DEVICE_ERROR_MESSAGE => Err(IoError::Rejected),
		r => Err(IoError::UnexpectedResponse(r.to_vec())),
	}
}

pub struct Driver<T: LinkTransport = SerialTransport, C: Clock = SystemClock> {
	registry:  Registry,
	options:   Options,
	pacing:    PacingController,
	clock:     C,
	transport: T,
	state:     State,

	/// Bytes still owed to the board from a frame that was cut short.
	resync:    usize,
}

impl Driver {
	/// Validate the strips and options, then open the serial device.
	pub fn open(
		serial_device: &str,
		strips: impl IntoIterator<Item = StripConfig>,
		options: Options,
	) -> Result<Self> {
		let registry = Registry::new(strips)?;
		options.min_interval()?;

		let transport = SerialTransport::open(serial_device, options.baud, options.write_timeout)?;

		Self::with_transport(transport, registry, options)
	}
}

impl<T: LinkTransport> Driver<T> {
	/// Wrap an already open link.
	pub fn with_transport(transport: T, registry: Registry, options: Options) -> Result<Self> {
		Self::with_clock(transport, registry, options, SystemClock)
	}
}

impl<T: LinkTransport, C: Clock> Driver<T, C> {
	pub fn with_clock(transport: T, registry: Registry, options: Options, clock: C) -> Result<Self> {
		let pacing = PacingController::new(options.min_interval()?, options.fps_reporting);

		info!(
			"driving {} channels, {} pixels, pacing {:?}",
			registry.len(),
			registry.total_pixels(),
			pacing.min_interval()
		);

		Ok(Self {
			registry,
			options,
			pacing,
			clock,
			transport,
			state: State::Ready,
			resync: 0,
		})
	}

	pub fn registry(&self) -> &Registry {
		&self.registry
	}

	pub fn options(&self) -> &Options {
		&self.options
	}

	pub fn state(&self) -> State {
		self.state
	}

	pub fn achieved_fps(&self) -> Option<f64> {
		self.pacing.achieved_fps()
	}

	/// Send one frame. `leds` is every channel's RGB bytes back to back in
	/// ascending channel id and must be exactly [`Registry::total_bytes`]
	/// long.
	///
	/// Either the whole frame is handed to the link or nothing is: a bad
	/// buffer is rejected before pacing or any I/O happens.
	pub fn write(&mut self, leds: &[u8]) -> Result<WriteResult> {
		if self.state != State::Ready {
			return Err(StateError::NotReady(self.state).into());
		}
		frame::check_len(leds, &self.registry)?;

		if self.registry.is_empty() {
			return Ok(Default::default());
		}

		self.settle_resync()?;

		#[cfg(feature = "timings")]
		let pacing = self.pacing.gate(&self.clock);
		#[cfg(not(feature = "timings"))]
		self.pacing.gate(&self.clock);

		// leftovers from an earlier frame must not pass for this frame's answer
		self.transport.clear_input().map_err(|e| self.degrade_on(e))?;

		#[cfg(feature = "timings")]
		let transmit_start = self.clock.now();

		let frame = frame::encode(leds, &self.registry)?;
		self.transmit(frame.as_bytes())?;
		self.await_ack()?;

		debug!("sent {} byte frame", frame.len());

		#[cfg(feature = "timings")]
		return Ok(FrameTiming {
			pacing,
			transmit: self.clock.now() - transmit_start,
		});

		#[cfg(not(feature = "timings"))]
		Ok(())
	}

	/// Reopen the link after it broke. Any frame cut short before the
	/// disconnect is padded out ahead of the next one.
	pub fn reconnect(&mut self) -> Result<()> {
		if self.state == State::Closed {
			return Err(StateError::NotReady(self.state).into());
		}

		self.transport.reopen()?;
		self.state = State::Ready;
		info!("reconnected");

		Ok(())
	}

	/// Release the link. Calling it again does nothing.
	pub fn close(&mut self) {
		if self.state == State::Closed {
			return;
		}

		self.transport.close();
		self.state = State::Closed;
		info!("driver closed");
	}

	/// Finish a frame the board only got part of with zero bytes. The board
	/// parses by length, so the zeros complete the broken frame and the last
	/// one lands where the terminator belongs, which makes it drop the frame.
	fn settle_resync(&mut self) -> Result<(), IoError> {
		if self.resync == 0 {
			return Ok(());
		}

		warn!("padding out {} bytes of an interrupted frame", self.resync);
		let padding = vec![0u8; self.resync];
		self.transmit(&padding)
	}

	fn transmit(&mut self, bytes: &[u8]) -> Result<(), IoError> {
		match self.transport.write(bytes) {
			Ok(ack) => {
				debug_assert_eq!(ack.written, bytes.len());
				self.resync = 0;
			}
			Err(e) => {
				if let Some(unsent) = e.unsent() {
					warn!("frame cut short, {} of {} bytes not sent: {}", unsent, bytes.len(), e);
					self.resync = unsent;
				}
				return Err(self.degrade_on(e));
			}
		}

		self.transport.flush().map_err(|e| self.degrade_on(e))
	}

	fn await_ack(&mut self) -> Result<(), IoError> {
		let Some(timeout) = self.options.ack_timeout else {
			return Ok(());
		};

		let mut response = [0u8; DEVICE_MESSAGE_TYPE_LEN];
		let n = self
			.transport
			.read_response(&mut response, timeout)
			.map_err(|e| self.degrade_on(e))?;

		check_ack(&response[..n])
	}

	fn degrade_on(&mut self, e: IoError) -> IoError {
		if e.is_disconnect() && self.state == State::Ready {
			warn!("serial link lost: {}", e);
			self.state = State::Degraded;
		}
		e
	}
}

impl<T: LinkTransport, C: Clock> Drop for Driver<T, C> {
	fn drop(&mut self) {
		self.close();
	}
}
