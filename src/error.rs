use std::time::Duration;

use thiserror::Error;

pub type Result<T, E = DriverError> = std::result::Result<T, E>;

/// A strip description the board cannot drive.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
	#[error("channel {channel}: size {size} is outside 1..={max}")]
	InvalidSize { channel: u8, size: usize, max: usize },
	#[error("invalid color order {0:?} (expected a permutation of R, G and B)")]
	InvalidOrder(String),
	#[error("unknown chipset type {0}")]
	InvalidType(u8),
	#[error("channel {0} is configured more than once")]
	DuplicateChannel(u8),
	#[error("channel {channel} is beyond the board's {max} channels")]
	InvalidChannel { channel: u8, max: usize },
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
	#[error(transparent)]
	Strip(#[from] ValidationError),
	#[error("max_fps must be a positive finite number, got {0}")]
	InvalidFps(f32),
	#[error("inter_frame_wait must not be zero")]
	ZeroInterFrameWait,
	#[error("max_fps {max_fps} implies {implied:?} between frames, but inter_frame_wait is {inter_frame_wait:?}")]
	ContradictoryPacing {
		max_fps:          f32,
		implied:          Duration,
		inter_frame_wait: Duration,
	},
	#[error("write_timeout must not be zero")]
	ZeroWriteTimeout,
}

#[derive(Debug, Error)]
pub enum ConnectError {
	#[error("serial device \"{0}\" not found")]
	DeviceNotFound(String),
	#[error("permission denied opening \"{0}\"")]
	PermissionDenied(String),
	#[error("unsupported baud rate {0}")]
	UnsupportedBaud(u32),
	#[error("opening \"{endpoint}\": {source}")]
	Other {
		endpoint: String,
		#[source]
		source:   std::io::Error,
	},
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EncodeError {
	#[error("pixel buffer is {actual} bytes, the configured strips need {expected}")]
	LengthMismatch { expected: usize, actual: usize },
}

#[derive(Debug, Error)]
pub enum IoError {
	#[error("serial write timed out")]
	Timeout,
	#[error("serial link is gone: {0}")]
	BrokenPipe(#[source] std::io::Error),
	#[error("short write: {accepted} of {attempted} bytes accepted")]
	ShortWrite { attempted: usize, accepted: usize },
	/// The link failed after taking part of the buffer.
	#[error("write failed after {accepted} of {attempted} bytes")]
	Partial {
		attempted: usize,
		accepted:  usize,
		#[source]
		source:    Box<IoError>,
	},
	#[error("board rejected the frame")]
	Rejected,
	#[error("unexpected response from board: {0:?}")]
	UnexpectedResponse(Vec<u8>),
	#[error(transparent)]
	Other(std::io::Error),
}

impl IoError {
	/// Whether the link must be reopened before another frame can go out.
	pub fn is_disconnect(&self) -> bool {
		match self {
			IoError::BrokenPipe(_) => true,
			IoError::Partial { source, .. } => source.is_disconnect(),
			_ => false,
		}
	}

	/// Bytes the board still expects when a write got only part of the way.
	pub fn unsent(&self) -> Option<usize> {
		match self {
			IoError::ShortWrite { attempted, accepted } | IoError::Partial { attempted, accepted, .. } => {
				Some(attempted - accepted)
			}
			_ => None,
		}
	}
}

impl From<std::io::Error> for IoError {
	fn from(e: std::io::Error) -> Self {
		use std::io::ErrorKind;

		match e.kind() {
			ErrorKind::TimedOut | ErrorKind::WouldBlock => IoError::Timeout,
			ErrorKind::BrokenPipe
			| ErrorKind::ConnectionReset
			| ErrorKind::ConnectionAborted
			| ErrorKind::NotConnected
			| ErrorKind::UnexpectedEof
			| ErrorKind::NotFound => IoError::BrokenPipe(e),
			_ => IoError::Other(e),
		}
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum StateError {
	#[error("driver is not ready (state: {0:?})")]
	NotReady(crate::State),
}

#[derive(Debug, Error)]
pub enum DriverError {
	#[error(transparent)]
	Config(#[from] ConfigError),
	#[error(transparent)]
	Connect(#[from] ConnectError),
	#[error(transparent)]
	Encode(#[from] EncodeError),
	#[error(transparent)]
	Io(#[from] IoError),
	#[error(transparent)]
	State(#[from] StateError),
}

impl From<ValidationError> for DriverError {
	fn from(e: ValidationError) -> Self {
		DriverError::Config(e.into())
	}
}

#[cfg(test)]
mod tests {
	use std::io;

	use super::*;

	#[test]
	fn io_error_kinds_map_to_taxonomy() {
		assert!(matches!(IoError::from(io::Error::from(io::ErrorKind::TimedOut)), IoError::Timeout));
		assert!(IoError::from(io::Error::from(io::ErrorKind::BrokenPipe)).is_disconnect());
		assert!(IoError::from(io::Error::from(io::ErrorKind::NotFound)).is_disconnect());
		assert!(matches!(
			IoError::from(io::Error::from(io::ErrorKind::InvalidInput)),
			IoError::Other(_)
		));
	}

	#[test]
	fn partial_write_keeps_count_and_cause() {
		let framing = IoError::Partial {
			attempted: 20,
			accepted:  5,
			source:    Box::new(io::Error::new(io::ErrorKind::Other, "framing error").into()),
		};
		assert_eq!(framing.unsent(), Some(15));
		assert!(!framing.is_disconnect());

		let unplugged = IoError::Partial {
			attempted: 20,
			accepted:  5,
			source:    Box::new(io::Error::from(io::ErrorKind::BrokenPipe).into()),
		};
		assert!(unplugged.is_disconnect());
		assert_eq!(IoError::ShortWrite { attempted: 8, accepted: 3 }.unsent(), Some(5));
		assert_eq!(IoError::Timeout.unsent(), None);
	}

	#[test]
	fn validation_error_wraps_into_config() {
		let err: DriverError = ValidationError::DuplicateChannel(3).into();
		assert!(matches!(
			err,
			DriverError::Config(ConfigError::Strip(ValidationError::DuplicateChannel(3)))
		));
		assert_eq!(err.to_string(), "channel 3 is configured more than once");
	}
}
