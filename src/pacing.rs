//! Frame rate limiting.
//!
//! A microcontroller that receives frames faster than it can clock them out
//! to the strips overruns its receive buffer, so the driver never starts a
//! frame sooner than `min_interval` after the previous one started.

use std::{
	sync::{Arc, Mutex},
	thread,
	time::{Duration, Instant},
};

use tracing::info;

pub const FPS_REPORT_WINDOW: Duration = Duration::from_secs(1);

pub trait Clock {
	fn now(&self) -> Instant;

	fn sleep(&self, duration: Duration);
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
	fn now(&self) -> Instant {
		Instant::now()
	}

	fn sleep(&self, duration: Duration) {
		thread::sleep(duration)
	}
}

/// Clock that only moves when told to. Sleeping advances it instantly.
#[derive(Debug, Clone)]
pub struct ManualClock {
	now: Arc<Mutex<Instant>>,
}

impl Default for ManualClock {
	fn default() -> Self {
		Self::new()
	}
}

impl ManualClock {
	pub fn new() -> Self {
		Self {
			now: Arc::new(Mutex::new(Instant::now())),
		}
	}

	pub fn advance(&self, duration: Duration) {
		let mut now = self.now.lock().unwrap_or_else(|e| e.into_inner());
		*now += duration;
	}
}

impl Clock for ManualClock {
	fn now(&self) -> Instant {
		*self.now.lock().unwrap_or_else(|e| e.into_inner())
	}

	fn sleep(&self, duration: Duration) {
		self.advance(duration)
	}
}

#[derive(Debug)]
struct FpsCounter {
	window_start: Option<Instant>,
	frames:       u32,
	achieved:     Option<f64>,
}

impl FpsCounter {
	fn new() -> Self {
		Self {
			window_start: None,
			frames:       0,
			achieved:     None,
		}
	}

	fn tick(&mut self, now: Instant) {
		let start = *self.window_start.get_or_insert(now);
		self.frames += 1;

		let elapsed = now.saturating_duration_since(start);
		if elapsed >= FPS_REPORT_WINDOW {
			// the frame that closes the window opens the next one
			let fps = f64::from(self.frames - 1) / elapsed.as_secs_f64();
			info!("{:.1} fps", fps);
			self.achieved = Some(fps);
			self.window_start = Some(now);
			self.frames = 1;
		}
	}
}

#[derive(Debug)]
pub struct PacingController {
	min_interval: Option<Duration>,
	last_start:   Option<Instant>,
	fps:          Option<FpsCounter>,
}

impl PacingController {
	pub fn new(min_interval: Option<Duration>, fps_reporting: bool) -> Self {
		Self {
			min_interval,
			last_start: None,
			fps: fps_reporting.then(FpsCounter::new),
		}
	}

	pub fn unlimited() -> Self {
		Self::new(None, false)
	}

	pub fn min_interval(&self) -> Option<Duration> {
		self.min_interval
	}

	/// How long a frame starting at `now` still has to wait.
	pub fn delay(&self, now: Instant) -> Duration {
		match (self.min_interval, self.last_start) {
			(Some(interval), Some(last)) => (last + interval).saturating_duration_since(now),
			_ => Duration::ZERO,
		}
	}

	/// Note that a frame started transmitting at `now`.
	pub fn record_start(&mut self, now: Instant) {
		self.last_start = Some(now);
		if let Some(fps) = &mut self.fps {
			fps.tick(now);
		}
	}

	/// Block until the next frame may go out, then claim the slot for it.
	/// Returns how long the caller was held back.
	pub fn gate(&mut self, clock: &impl Clock) -> Duration {
		let delay = self.delay(clock.now());
		if !delay.is_zero() {
			clock.sleep(delay);
		}
		self.record_start(clock.now());
		delay
	}

	/// Frames per second over the last completed report window. `None` until
	/// a window completed or when reporting is off.
	pub fn achieved_fps(&self) -> Option<f64> {
		self.fps.as_ref().and_then(|fps| fps.achieved)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_unlimited_never_waits() {
		let clock = ManualClock::new();
		let start = clock.now();
		let mut pacing = PacingController::unlimited();
		for _ in 0..100 {
			assert_eq!(pacing.gate(&clock), Duration::ZERO);
		}
		assert_eq!(clock.now(), start);
	}

	#[test]
	fn test_lower_bound() {
		let clock = ManualClock::new();
		let start = clock.now();
		let mut pacing = PacingController::new(Some(Duration::from_millis(20)), false);

		for _ in 0..10 {
			pacing.gate(&clock);
		}
		assert!(clock.now() - start >= Duration::from_millis(20 * 9));
	}

	#[test]
	fn test_elapsed_time_counts_against_interval() {
		let clock = ManualClock::new();
		let mut pacing = PacingController::new(Some(Duration::from_millis(20)), false);

		pacing.gate(&clock);
		clock.advance(Duration::from_millis(15));
		assert_eq!(pacing.gate(&clock), Duration::from_millis(5));
		clock.advance(Duration::from_millis(50));
		assert_eq!(pacing.gate(&clock), Duration::ZERO);
	}

	#[test]
	fn test_fps_report() {
		let clock = ManualClock::new();
		let mut pacing = PacingController::new(Some(Duration::from_millis(40)), true);

		assert_eq!(pacing.achieved_fps(), None);
		for _ in 0..=25 {
			pacing.gate(&clock);
		}
		let fps = pacing.achieved_fps().unwrap();
		assert!((fps - 25.0).abs() < 0.01, "{fps}");
	}

	#[test]
	fn test_reporting_does_not_change_timing() {
		let quiet_clock = ManualClock::new();
		let loud_clock = ManualClock::new();
		let mut quiet = PacingController::new(Some(Duration::from_millis(7)), false);
		let mut loud = PacingController::new(Some(Duration::from_millis(7)), true);

		for _ in 0..300 {
			assert_eq!(quiet.gate(&quiet_clock), loud.gate(&loud_clock));
		}
		assert_eq!(quiet.achieved_fps(), None);
	}
}
