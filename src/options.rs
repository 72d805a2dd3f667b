use std::time::Duration;

use led_serial_expander_shared::DEFAULT_BAUD_RATE;

use crate::ConfigError;

/// Pacing may be given both ways as long as they agree this closely.
const PACING_TOLERANCE: Duration = Duration::from_millis(1);

#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct Options {
	pub baud:             u32,
	/// Upper bound on frames per second.
	pub max_fps:          Option<f32>,
	/// Minimum time between the start of two frames.
	pub inter_frame_wait: Option<Duration>,
	/// Log the achieved frame rate once a second.
	pub fps_reporting:    bool,
	/// How long a frame write may block before it counts as timed out.
	pub write_timeout:    Duration,
	/// Wait this long for the board to acknowledge each frame. No
	/// acknowledgement is expected when unset.
	pub ack_timeout:      Option<Duration>,
}

impl Default for Options {
	fn default() -> Self {
		Self {
			baud:             DEFAULT_BAUD_RATE,
			max_fps:          None,
			inter_frame_wait: None,
			fps_reporting:    false,
			write_timeout:    Duration::from_millis(100),
			ack_timeout:      None,
		}
	}
}

impl Options {
	pub fn baud(mut self, baud: u32) -> Self {
		self.baud = baud;
		self
	}

	pub fn max_fps(mut self, fps: f32) -> Self {
		self.max_fps = Some(fps);
		self
	}

	pub fn inter_frame_wait(mut self, wait: Duration) -> Self {
		self.inter_frame_wait = Some(wait);
		self
	}

	pub fn fps_reporting(mut self, enabled: bool) -> Self {
		self.fps_reporting = enabled;
		self
	}

	pub fn write_timeout(mut self, timeout: Duration) -> Self {
		self.write_timeout = timeout;
		self
	}

	pub fn ack_timeout(mut self, timeout: Duration) -> Self {
		self.ack_timeout = Some(timeout);
		self
	}

	/// Checks the options and works out the minimum interval between frames.
	pub fn min_interval(&self) -> Result<Option<Duration>, ConfigError> {
		if self.write_timeout.is_zero() {
			return Err(ConfigError::ZeroWriteTimeout);
		}
		if self.inter_frame_wait.is_some_and(|wait| wait.is_zero()) {
			return Err(ConfigError::ZeroInterFrameWait);
		}

		let implied = match self.max_fps {
			Some(fps) if !fps.is_finite() || fps <= 0.0 => return Err(ConfigError::InvalidFps(fps)),
			// rounded up so the ceiling is never exceeded
			Some(fps) => Some(Duration::from_nanos((1e9 / f64::from(fps)).ceil() as u64)),
			None => None,
		};

		match (implied, self.inter_frame_wait) {
			(Some(implied), Some(wait)) => {
				let diff = if implied > wait { implied - wait } else { wait - implied };
				if diff > PACING_TOLERANCE {
					return Err(ConfigError::ContradictoryPacing {
						max_fps: self.max_fps.unwrap_or_default(),
						implied,
						inter_frame_wait: wait,
					});
				}
				Ok(Some(wait))
			}
			(implied, wait) => Ok(wait.or(implied)),
		}
	}
}
