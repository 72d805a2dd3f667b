use std::{io, time::Duration};

use tokio::{
	io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
	time::{self, Instant},
};
use tokio_serial::{DataBits, FlowControl, Parity, SerialPortBuilderExt, SerialStream, StopBits};
use tracing::{debug, info, warn};

use crate::{
	check_ack,
	frame,
	transport::{check_baud, map_open_error},
	ConnectError,
	IoError,
	Options,
	PacingController,
	Registry,
	Result,
	State,
	StateError,
	StripConfig,
	WriteResult,
};

/// A frame that has been started on the link but not finished.
#[derive(Debug, Clone, Copy)]
struct InFlight {
	len:     usize,
	written: usize,
}

/// Async version of [`crate::Driver`], generic over the byte stream.
///
/// Dropping a pending [`Driver::write`] is fine: if part of the frame already
/// went out, the rest is padded with zeros before the next frame so the
/// board discards the broken one and the next frame starts clean.
pub struct Driver<S = SerialStream> {
	registry: Registry,
	options:  Options,
	pacing:   PacingController,
	stream:   Option<S>,
	state:    State,
	endpoint: Option<String>,

	in_flight: Option<InFlight>,
}

fn open_stream(serial_device: &str, options: &Options) -> Result<SerialStream, ConnectError> {
	check_baud(options.baud)?;

	let stream = tokio_serial::new(serial_device, options.baud)
		.data_bits(DataBits::Eight)
		.parity(Parity::None)
		.stop_bits(StopBits::One)
		.flow_control(FlowControl::None)
		.timeout(options.write_timeout)
		.open_native_async()
		.map_err(|e| map_open_error(serial_device, options.baud, e))?;

	info!("opened {} at {} baud", serial_device, options.baud);

	Ok(stream)
}

impl Driver<SerialStream> {
	/// Validate the strips and options, then open the serial device.
	///
	/// Must be called from within a tokio runtime.
	pub fn open(
		serial_device: &str,
		strips: impl IntoIterator<Item = StripConfig>,
		options: Options,
	) -> Result<Self> {
		let registry = Registry::new(strips)?;
		options.min_interval()?;

		let stream = open_stream(serial_device, &options)?;

		let mut driver = Self::with_stream(stream, registry, options)?;
		driver.endpoint = Some(serial_device.to_string());

		Ok(driver)
	}

	/// Reopen the serial device after the link broke.
	pub fn reconnect(&mut self) -> Result<()> {
		let Some(endpoint) = self.endpoint.clone() else {
			return Err(StateError::NotReady(self.state).into());
		};
		let stream = open_stream(&endpoint, &self.options)?;

		self.reconnect_with(stream)
	}
}

impl<S: AsyncRead + AsyncWrite + Unpin> Driver<S> {
	pub fn with_stream(stream: S, registry: Registry, options: Options) -> Result<Self> {
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
			stream: Some(stream),
			state: State::Ready,
			endpoint: None,

			in_flight: None,
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

	/// Replace a broken link with a fresh stream.
	pub fn reconnect_with(&mut self, stream: S) -> Result<()> {
		if self.state == State::Closed {
			return Err(StateError::NotReady(self.state).into());
		}

		self.stream = Some(stream);
		self.state = State::Ready;
		info!("reconnected");

		Ok(())
	}

	/// Send all bytes to the board, the length must be the configured
	/// [`Registry::total_bytes`].
	pub async fn write(&mut self, leds: &[u8]) -> Result<WriteResult> {
		if self.state != State::Ready {
			return Err(StateError::NotReady(self.state).into());
		}
		frame::check_len(leds, &self.registry)?;

		if self.registry.is_empty() {
			return Ok(Default::default());
		}

		self.settle_in_flight().await?;

		#[cfg(feature = "timings")]
		let pacing_start = Instant::now();

		let delay = self.pacing.delay(Instant::now().into_std());
		if !delay.is_zero() {
			time::sleep(delay).await;
		}
		self.pacing.record_start(Instant::now().into_std());

		self.drain_input().await?;

		#[cfg(feature = "timings")]
		let transmit_start = Instant::now();

		let frame = frame::encode(leds, &self.registry)?;
		self.transmit(frame.as_bytes()).await?;
		self.await_ack().await?;

		debug!("sent {} byte frame", frame.len());

		#[cfg(feature = "timings")]
		return Ok(crate::FrameTiming {
			pacing:   transmit_start - pacing_start,
			transmit: transmit_start.elapsed(),
		});

		#[cfg(not(feature = "timings"))]
		Ok(())
	}

	/// Shut the stream down. Calling it again does nothing.
	pub async fn close(&mut self) {
		if self.state == State::Closed {
			return;
		}

		if let Some(mut stream) = self.stream.take() {
			if let Err(e) = stream.shutdown().await {
				debug!("shutdown on close failed: {}", e);
			}
		}
		self.state = State::Closed;
		info!("driver closed");
	}

	async fn settle_in_flight(&mut self) -> Result<(), IoError> {
		let Some(in_flight) = self.in_flight.take() else {
			return Ok(());
		};
		if in_flight.written == 0 {
			return Ok(());
		}

		let owed = in_flight.len - in_flight.written;
		warn!("padding out {} bytes of an interrupted frame", owed);
		self.transmit(&vec![0u8; owed]).await
	}

	/// Throw away whatever the board sent that nobody read, such as an answer
	/// that came in after its deadline or after its write was dropped.
	async fn drain_input(&mut self) -> Result<(), IoError> {
		let Some(stream) = self.stream.as_mut() else {
			return Err(IoError::BrokenPipe(io::ErrorKind::NotConnected.into()));
		};

		let mut scratch = [0u8; 64];
		let mut stale = 0;
		let res = loop {
			match time::timeout(Duration::ZERO, stream.read(&mut scratch)).await {
				Err(_) => break Ok(()),
				Ok(Ok(0)) => break Err(IoError::BrokenPipe(io::ErrorKind::UnexpectedEof.into())),
				Ok(Ok(n)) => stale += n,
				Ok(Err(e)) => match IoError::from(e) {
					IoError::Timeout => break Ok(()),
					e => break Err(e),
				},
			}
		};
		if stale > 0 {
			debug!("discarded {} unread bytes", stale);
		}

		res.map_err(|e| self.degrade_on(e))
	}

	async fn transmit(&mut self, bytes: &[u8]) -> Result<(), IoError> {
		let deadline = Instant::now() + self.options.write_timeout;
		let Some(stream) = self.stream.as_mut() else {
			return Err(IoError::BrokenPipe(io::ErrorKind::NotConnected.into()));
		};

		// updated after every chunk so a dropped future leaves an exact count
		let in_flight = self.in_flight.insert(InFlight {
			len:     bytes.len(),
			written: 0,
		});

		let mut failure = None;
		while in_flight.written < in_flight.len {
			match time::timeout_at(deadline, stream.write(&bytes[in_flight.written..])).await {
				Err(_) | Ok(Ok(0)) => break,
				Ok(Ok(n)) => in_flight.written += n,
				Ok(Err(e)) if e.kind() == io::ErrorKind::Interrupted => continue,
				Ok(Err(e)) => {
					failure = Some(IoError::from(e));
					break;
				}
			}
		}

		let InFlight { len, written } = *in_flight;
		let res = if let Some(e) = failure {
			if written == 0 {
				self.in_flight = None;
				Err(e)
			} else {
				warn!("write failed after {} of {} bytes: {}", written, len, e);
				Err(IoError::Partial {
					attempted: len,
					accepted:  written,
					source:    Box::new(e),
				})
			}
		} else if written == 0 {
			self.in_flight = None;
			Err(IoError::Timeout)
		} else if written < len {
			warn!("short write, {} of {} bytes accepted", written, len);
			Err(IoError::ShortWrite {
				attempted: len,
				accepted:  written,
			})
		} else {
			self.in_flight = None;
			match time::timeout_at(deadline, stream.flush()).await {
				Ok(res) => res.map_err(IoError::from),
				Err(_) => Err(IoError::Timeout),
			}
		};

		res.map_err(|e| self.degrade_on(e))
	}

	async fn await_ack(&mut self) -> Result<(), IoError> {
		let Some(timeout) = self.options.ack_timeout else {
			return Ok(());
		};
		let Some(stream) = self.stream.as_mut() else {
			return Err(IoError::BrokenPipe(io::ErrorKind::NotConnected.into()));
		};

		let mut response = [0u8; crate::protocol::DEVICE_MESSAGE_TYPE_LEN];
		let n = match time::timeout(timeout, stream.read(&mut response)).await {
			Err(_) => 0,
			Ok(Ok(0)) => {
				return Err(self.degrade_on(IoError::BrokenPipe(io::ErrorKind::UnexpectedEof.into())));
			}
			Ok(Ok(n)) => n,
			Ok(Err(e)) => return Err(self.degrade_on(e.into())),
		};

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

#[cfg(test)]
mod tests {
	use std::time::Duration;

	use std::{
		pin::Pin,
		sync::{Arc, Mutex},
		task::{Context, Poll},
	};

	use tokio::io::{duplex, DuplexStream, ReadBuf};

	use super::*;
	use crate::{frame::tests::parse, ChipsetType, ColorOrder, DriverError};

	fn registry(pixels: usize) -> Registry {
		Registry::new([StripConfig::new(0, pixels, ColorOrder::Grb, ChipsetType::Ws2812)]).unwrap()
	}

	/// Reads everything the driver sends until it shuts the stream down.
	fn board(mut side: DuplexStream) -> tokio::task::JoinHandle<Vec<u8>> {
		tokio::spawn(async move {
			let mut received = Vec::new();
			side.read_to_end(&mut received).await.unwrap();
			received
		})
	}

	/// Takes `good` bytes, fails one write with a framing error, then takes
	/// everything. Never has anything to read.
	struct Flaky {
		sent: Arc<Mutex<Vec<u8>>>,
		good: Option<usize>,
	}

	impl AsyncRead for Flaky {
		fn poll_read(self: Pin<&mut Self>, _: &mut Context<'_>, _: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
			Poll::Pending
		}
	}

	impl AsyncWrite for Flaky {
		fn poll_write(self: Pin<&mut Self>, _: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
			let this = self.get_mut();
			let mut sent = this.sent.lock().unwrap();
			let n = match this.good {
				Some(good) if sent.len() >= good => {
					this.good = None;
					return Poll::Ready(Err(io::Error::new(io::ErrorKind::Other, "framing error")));
				}
				Some(good) => buf.len().min(good - sent.len()),
				None => buf.len(),
			};
			sent.extend_from_slice(&buf[..n]);
			Poll::Ready(Ok(n))
		}

		fn poll_flush(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<io::Result<()>> {
			Poll::Ready(Ok(()))
		}

		fn poll_shutdown(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<io::Result<()>> {
			Poll::Ready(Ok(()))
		}
	}

	#[tokio::test(start_paused = true)]
	async fn test_write_and_close() {
		let (link, board_side) = duplex(256);
		let board = board(board_side);

		let mut driver = Driver::with_stream(link, registry(1), Options::default()).unwrap();
		driver.write(&[10, 20, 30]).await.unwrap();
		driver.close().await;
		driver.close().await;

		let received = board.await.unwrap();
		assert_eq!(parse(&received)[0].pixels, [20, 10, 30]);
		assert!(matches!(
			driver.write(&[10, 20, 30]).await,
			Err(DriverError::State(StateError::NotReady(State::Closed)))
		));
	}

	#[tokio::test(start_paused = true)]
	async fn test_length_mismatch_sends_nothing() {
		let (link, board_side) = duplex(256);
		let board = board(board_side);

		let mut driver = Driver::with_stream(link, registry(2), Options::default()).unwrap();
		assert!(matches!(
			driver.write(&[0; 5]).await,
			Err(DriverError::Encode(crate::EncodeError::LengthMismatch { expected: 6, actual: 5 }))
		));
		driver.close().await;

		assert!(board.await.unwrap().is_empty());
	}

	#[tokio::test(start_paused = true)]
	async fn test_pacing_lower_bound() {
		let (link, board_side) = duplex(4096);
		let board = board(board_side);

		let mut driver = Driver::with_stream(link, registry(3), Options::default().max_fps(50.0)).unwrap();
		let start = Instant::now();
		for _ in 0..5 {
			driver.write(&[0; 9]).await.unwrap();
		}
		assert!(start.elapsed() >= Duration::from_millis(20 * 4));

		driver.close().await;
		board.await.unwrap();
	}

	#[tokio::test(start_paused = true)]
	async fn test_stalled_link_is_short_write() {
		let (link, _board_side) = duplex(16);

		let mut driver = Driver::with_stream(link, registry(10), Options::default()).unwrap();
		let err = driver.write(&[1; 30]).await.unwrap_err();
		assert!(matches!(
			err,
			DriverError::Io(IoError::ShortWrite {
				attempted: 46,
				accepted:  16,
			})
		));
		assert_eq!(driver.state(), State::Ready);
	}

	#[tokio::test(start_paused = true)]
	async fn test_cancelled_write_is_padded_out() {
		let (link, mut board_side) = duplex(16);

		let mut driver = Driver::with_stream(link, registry(10), Options::default()).unwrap();
		let cancelled = time::timeout(Duration::from_millis(5), driver.write(&[1; 30])).await;
		assert!(cancelled.is_err());

		let mut partial = [0u8; 16];
		board_side.read_exact(&mut partial).await.unwrap();
		let board = board(board_side);

		driver.write(&[2; 30]).await.unwrap();
		driver.close().await;

		let received = board.await.unwrap();
		assert_eq!(&received[..30], &[0u8; 30][..]);
		assert_eq!(parse(&received[30..])[0].pixels, [2; 30]);
	}

	#[tokio::test(start_paused = true)]
	async fn test_link_error_mid_frame_is_padded_out() {
		let sent = Arc::new(Mutex::new(Vec::new()));
		let link = Flaky {
			sent: sent.clone(),
			good: Some(16),
		};

		let mut driver = Driver::with_stream(link, registry(10), Options::default()).unwrap();
		assert!(matches!(
			driver.write(&[1; 30]).await,
			Err(DriverError::Io(IoError::Partial {
				attempted: 46,
				accepted:  16,
				..
			}))
		));
		assert_eq!(driver.state(), State::Ready);

		driver.write(&[2; 30]).await.unwrap();
		let sent = sent.lock().unwrap();
		assert_eq!(&sent[16..46], &[0u8; 30][..]);
		assert_eq!(parse(&sent[46..])[0].pixels, [2; 30]);
	}

	#[tokio::test(start_paused = true)]
	async fn test_acknowledged_frames() {
		let (link, mut board_side) = duplex(256);

		let mut driver = Driver::with_stream(
			link,
			registry(1),
			Options::default().ack_timeout(Duration::from_millis(10)),
		)
		.unwrap();
		let frame_len = frame::encode(&[0; 3], driver.registry()).unwrap().len();

		let board = tokio::spawn(async move {
			let mut frame = vec![0u8; frame_len];
			for reply in [&b"k"[..], &b"e"[..], &b""[..]] {
				board_side.read_exact(&mut frame).await.unwrap();
				board_side.write_all(reply).await.unwrap();
			}
			board_side
		});

		driver.write(&[1, 2, 3]).await.unwrap();
		assert!(matches!(driver.write(&[1, 2, 3]).await, Err(DriverError::Io(IoError::Rejected))));
		assert!(matches!(driver.write(&[1, 2, 3]).await, Err(DriverError::Io(IoError::Timeout))));

		board.await.unwrap();
	}

	#[tokio::test(start_paused = true)]
	async fn test_late_acknowledgement_is_discarded() {
		let (link, mut board_side) = duplex(256);

		let mut driver = Driver::with_stream(
			link,
			registry(1),
			Options::default().ack_timeout(Duration::from_millis(10)),
		)
		.unwrap();
		let mut frame = vec![0u8; frame::encode(&[0; 3], driver.registry()).unwrap().len()];

		assert!(matches!(driver.write(&[1, 2, 3]).await, Err(DriverError::Io(IoError::Timeout))));
		board_side.read_exact(&mut frame).await.unwrap();
		board_side.write_all(b"k").await.unwrap();

		let board = tokio::spawn(async move {
			board_side.read_exact(&mut frame).await.unwrap();
			board_side.write_all(b"e").await.unwrap();
			board_side
		});
		assert!(matches!(driver.write(&[4, 5, 6]).await, Err(DriverError::Io(IoError::Rejected))));

		board.await.unwrap();
	}

	#[tokio::test(start_paused = true)]
	async fn test_disconnect_and_reconnect() {
		let (link, board_side) = duplex(256);
		drop(board_side);

		let mut driver = Driver::with_stream(link, registry(1), Options::default()).unwrap();
		assert!(matches!(
			driver.write(&[1, 2, 3]).await,
			Err(DriverError::Io(IoError::BrokenPipe(_)))
		));
		assert_eq!(driver.state(), State::Degraded);
		assert!(matches!(
			driver.write(&[1, 2, 3]).await,
			Err(DriverError::State(StateError::NotReady(State::Degraded)))
		));

		let (link, board_side) = duplex(256);
		let board = board(board_side);
		driver.reconnect_with(link).unwrap();
		driver.write(&[1, 2, 3]).await.unwrap();
		driver.close().await;

		assert_eq!(parse(&board.await.unwrap())[0].pixels, [2, 1, 3]);
	}
}
