//! Byte stream links to the expander board.

use std::{
	collections::VecDeque,
	io::{self, Read, Write},
	sync::{Arc, Mutex, MutexGuard},
	time::Duration,
};

use led_serial_expander_shared::{FRAME_MAGIC, MAX_BAUD_RATE};
use serialport::{ClearBuffer, DataBits, FlowControl, Parity, SerialPort, StopBits};
use tracing::{debug, info};

use crate::{ConnectError, IoError};

/// How many bytes of a write the link accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ack {
	pub written: usize,
}

pub trait LinkTransport {
	/// Write the whole buffer, blocking until the link took every byte or the
	/// write timeout hit. A partial write is reported as
	/// [`IoError::ShortWrite`] (or [`IoError::Partial`] when the link failed
	/// midway) and never resumed here.
	fn write(&mut self, data: &[u8]) -> Result<Ack, IoError>;

	fn flush(&mut self) -> Result<(), IoError>;

	/// Read whatever the board answered, waiting at most `timeout`.
	/// Returns 0 when nothing arrived.
	fn read_response(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize, IoError>;

	/// Drop everything received but not read yet.
	fn clear_input(&mut self) -> Result<(), IoError>;

	/// Reopen the link with its original parameters after a disconnect.
	fn reopen(&mut self) -> Result<(), ConnectError>;

	fn close(&mut self);
}

impl<T: LinkTransport + ?Sized> LinkTransport for Box<T> {
	fn write(&mut self, data: &[u8]) -> Result<Ack, IoError> {
		(**self).write(data)
	}

	fn flush(&mut self) -> Result<(), IoError> {
		(**self).flush()
	}

	fn read_response(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize, IoError> {
		(**self).read_response(buf, timeout)
	}

	fn clear_input(&mut self) -> Result<(), IoError> {
		(**self).clear_input()
	}

	fn reopen(&mut self) -> Result<(), ConnectError> {
		(**self).reopen()
	}

	fn close(&mut self) {
		(**self).close()
	}
}

pub(crate) fn check_baud(baud: u32) -> Result<(), ConnectError> {
	if baud == 0 || baud > MAX_BAUD_RATE {
		return Err(ConnectError::UnsupportedBaud(baud));
	}
	Ok(())
}

pub(crate) fn map_open_error(endpoint: &str, baud: u32, e: serialport::Error) -> ConnectError {
	match e.kind {
		serialport::ErrorKind::NoDevice => ConnectError::DeviceNotFound(endpoint.to_string()),
		serialport::ErrorKind::InvalidInput => ConnectError::UnsupportedBaud(baud),
		serialport::ErrorKind::Io(io::ErrorKind::NotFound) => ConnectError::DeviceNotFound(endpoint.to_string()),
		serialport::ErrorKind::Io(io::ErrorKind::PermissionDenied) => {
			ConnectError::PermissionDenied(endpoint.to_string())
		}
		serialport::ErrorKind::Io(kind) => ConnectError::Other {
			endpoint: endpoint.to_string(),
			source:   io::Error::new(kind, e.description),
		},
		serialport::ErrorKind::Unknown => ConnectError::Other {
			endpoint: endpoint.to_string(),
			source:   io::Error::new(io::ErrorKind::Other, e.description),
		},
	}
}

/// Write `data` in as many chunks as the stream wants, stopping at the first
/// timeout or zero-length write. An error after some bytes went out keeps
/// the count.
pub(crate) fn write_frame(stream: &mut impl Write, data: &[u8]) -> Result<Ack, IoError> {
	let mut accepted = 0;

	while accepted < data.len() {
		match stream.write(&data[accepted..]) {
			Ok(0) => break,
			Ok(n) => accepted += n,
			Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
			Err(e) if accepted > 0 && matches!(e.kind(), io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock) => break,
			Err(e) if accepted > 0 => {
				return Err(IoError::Partial {
					attempted: data.len(),
					accepted,
					source: Box::new(e.into()),
				})
			}
			Err(e) => return Err(e.into()),
		}
	}

	if accepted < data.len() {
		return Err(IoError::ShortWrite {
			attempted: data.len(),
			accepted,
		});
	}

	Ok(Ack { written: accepted })
}

/// Serial port link, 8N1 without hardware flow control.
pub struct SerialTransport {
	endpoint:      String,
	baud:          u32,
	write_timeout: Duration,
	port:          Option<Box<dyn SerialPort>>,
}

impl SerialTransport {
	pub fn open(endpoint: &str, baud: u32, write_timeout: Duration) -> Result<Self, ConnectError> {
		check_baud(baud)?;

		let mut transport = Self {
			endpoint: endpoint.to_string(),
			baud,
			write_timeout,
			port: None,
		};
		transport.reopen()?;

		Ok(transport)
	}

	pub fn endpoint(&self) -> &str {
		&self.endpoint
	}

	pub fn baud(&self) -> u32 {
		self.baud
	}

	fn port(&mut self) -> Result<&mut Box<dyn SerialPort>, IoError> {
		self.port
			.as_mut()
			.ok_or_else(|| IoError::BrokenPipe(io::Error::from(io::ErrorKind::NotConnected)))
	}
}

impl LinkTransport for SerialTransport {
	fn write(&mut self, data: &[u8]) -> Result<Ack, IoError> {
		write_frame(self.port()?, data)
	}

	fn flush(&mut self) -> Result<(), IoError> {
		self.port()?.flush()?;
		Ok(())
	}

	fn read_response(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize, IoError> {
		let write_timeout = self.write_timeout;
		let port = self.port()?;

		port.set_timeout(timeout).map_err(io::Error::from)?;
		let res = match port.read(buf) {
			Ok(n) => Ok(n),
			Err(e) if e.kind() == io::ErrorKind::TimedOut => Ok(0),
			Err(e) => Err(e.into()),
		};
		port.set_timeout(write_timeout).map_err(io::Error::from)?;

		res
	}

	fn clear_input(&mut self) -> Result<(), IoError> {
		let port = self.port()?;

		let stale = port.bytes_to_read().map_err(io::Error::from)?;
		if stale > 0 {
			debug!("discarding {} unread bytes", stale);
		}
		port.clear(ClearBuffer::Input).map_err(io::Error::from)?;

		Ok(())
	}

	fn reopen(&mut self) -> Result<(), ConnectError> {
		self.port = None;

		let port = serialport::new(&self.endpoint, self.baud)
			.data_bits(DataBits::Eight)
			.parity(Parity::None)
			.stop_bits(StopBits::One)
			.flow_control(FlowControl::None)
			.timeout(self.write_timeout)
			.open()
			.map_err(|e| map_open_error(&self.endpoint, self.baud, e))?;

		info!("opened {} at {} baud", self.endpoint, self.baud);
		self.port = Some(port);

		Ok(())
	}

	fn close(&mut self) {
		if let Some(mut port) = self.port.take() {
			if let Err(e) = port.flush() {
				debug!("flush on close of {} failed: {}", self.endpoint, e);
			}
			info!("closed {}", self.endpoint);
		}
	}
}

/// What a scripted [`MemoryTransport`] does on its next write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
	Timeout,
	/// Accept only this many bytes.
	ShortWrite(usize),
	/// Accept this many bytes, then fail with a framing error.
	FailAfter(usize),
	BrokenPipe,
}

#[derive(Debug, Default)]
struct MemoryState {
	writes:    Vec<Vec<u8>>,
	faults:    VecDeque<Fault>,
	/// Answers the board gives to the next complete frames.
	replies:   VecDeque<Vec<u8>>,
	/// Bytes that arrived and have not been read.
	input:     VecDeque<Vec<u8>>,
	connected: bool,
	closes:    usize,
	reopens:   usize,
}

/// In-memory link for tests and dry runs.
///
/// Clones share state, so a test can keep one handle while the driver owns
/// the other.
#[derive(Debug, Clone)]
pub struct MemoryTransport {
	state: Arc<Mutex<MemoryState>>,
}

impl Default for MemoryTransport {
	fn default() -> Self {
		Self::new()
	}
}

impl MemoryTransport {
	pub fn new() -> Self {
		Self {
			state: Arc::new(Mutex::new(MemoryState {
				connected: true,
				..Default::default()
			})),
		}
	}

	fn state(&self) -> MutexGuard<'_, MemoryState> {
		self.state.lock().unwrap_or_else(|e| e.into_inner())
	}

	/// Every write call that reached the link, including partial ones.
	pub fn writes(&self) -> Vec<Vec<u8>> {
		self.state().writes.clone()
	}

	/// All bytes the link accepted, in order.
	pub fn bytes(&self) -> Vec<u8> {
		self.state().writes.concat()
	}

	pub fn fail_next(&self, fault: Fault) {
		self.state().faults.push_back(fault);
	}

	/// Answer the next complete frame with `response`.
	pub fn respond(&self, response: &[u8]) {
		self.state().replies.push_back(response.to_vec());
	}

	/// Bytes that show up without a frame asking for them, like an answer
	/// that missed its deadline.
	pub fn push_input(&self, bytes: &[u8]) {
		self.state().input.push_back(bytes.to_vec());
	}

	pub fn is_connected(&self) -> bool {
		self.state().connected
	}

	pub fn close_count(&self) -> usize {
		self.state().closes
	}

	pub fn reopen_count(&self) -> usize {
		self.state().reopens
	}
}

impl LinkTransport for MemoryTransport {
	fn write(&mut self, data: &[u8]) -> Result<Ack, IoError> {
		let mut state = self.state();
		if !state.connected {
			return Err(IoError::BrokenPipe(io::Error::from(io::ErrorKind::NotConnected)));
		}

		match state.faults.pop_front() {
			None => {
				state.writes.push(data.to_vec());
				if data.starts_with(FRAME_MAGIC) {
					if let Some(reply) = state.replies.pop_front() {
						state.input.push_back(reply);
					}
				}
				Ok(Ack { written: data.len() })
			}
			Some(Fault::Timeout) => Err(IoError::Timeout),
			Some(Fault::ShortWrite(accepted)) => {
				let accepted = accepted.min(data.len());
				state.writes.push(data[..accepted].to_vec());
				Err(IoError::ShortWrite {
					attempted: data.len(),
					accepted,
				})
			}
			Some(Fault::FailAfter(accepted)) => {
				let accepted = accepted.min(data.len());
				state.writes.push(data[..accepted].to_vec());
				let cause = IoError::from(io::Error::new(io::ErrorKind::Other, "framing error"));
				if accepted == 0 {
					return Err(cause);
				}
				Err(IoError::Partial {
					attempted: data.len(),
					accepted,
					source: Box::new(cause),
				})
			}
			Some(Fault::BrokenPipe) => {
				state.connected = false;
				Err(IoError::BrokenPipe(io::Error::from(io::ErrorKind::BrokenPipe)))
			}
		}
	}

	fn flush(&mut self) -> Result<(), IoError> {
		Ok(())
	}

	fn read_response(&mut self, buf: &mut [u8], _timeout: Duration) -> Result<usize, IoError> {
		let Some(response) = self.state().input.pop_front() else {
			return Ok(0);
		};
		let n = response.len().min(buf.len());
		buf[..n].copy_from_slice(&response[..n]);
		Ok(n)
	}

	fn clear_input(&mut self) -> Result<(), IoError> {
		self.state().input.clear();
		Ok(())
	}

	fn reopen(&mut self) -> Result<(), ConnectError> {
		let mut state = self.state();
		state.connected = true;
		state.reopens += 1;
		Ok(())
	}

	fn close(&mut self) {
		let mut state = self.state();
		state.connected = false;
		state.closes += 1;
	}
}
