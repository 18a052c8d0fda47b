use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// Turns a monotonically increasing counter into a per-second rate.
#[derive(Debug, Default, Clone)]
pub struct RateWindow {
    last: Option<(u64, Instant)>,
}

impl RateWindow {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a sample and returns the rate since the previous one.
    ///
    /// Yields `None` for the first sample, for samples taken at the same
    /// instant, and when the counter went backwards (a reset).
    pub fn observe(&mut self, value: u64, at: Instant) -> Option<f64> {
        let (previous, previous_at) = self.last.replace((value, at))?;
        let elapsed = at.saturating_duration_since(previous_at).as_secs_f64();
        if elapsed <= 0.0 || value < previous {
            return None;
        }
        Some((value - previous) as f64 / elapsed)
    }
}

pub fn bytes_per_sec_to_kbps(bytes_per_sec: f64) -> f64 {
    bytes_per_sec * 8.0 / 1024.0
}

/// Counts presented frames when the transport reports no decode counter.
#[derive(Debug, Clone)]
pub struct FrameTicker {
    window: Duration,
    ticks: Arc<Mutex<VecDeque<Instant>>>,
}

impl FrameTicker {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            ticks: Arc::new(Mutex::new(VecDeque::new())),
        }
    }

    pub fn tick(&self) {
        self.tick_at(Instant::now());
    }

    pub fn tick_at(&self, at: Instant) {
        let mut ticks = self.ticks.lock();
        ticks.push_back(at);
        Self::prune(&mut ticks, at, self.window);
    }

    /// Average frames per second over the window, `None` before any frame
    /// or when the window is empty.
    pub fn fps_at(&self, now: Instant) -> Option<f64> {
        if self.window.is_zero() {
            return None;
        }
        let mut ticks = self.ticks.lock();
        Self::prune(&mut ticks, now, self.window);
        if ticks.is_empty() {
            return None;
        }
        Some(ticks.len() as f64 / self.window.as_secs_f64())
    }

    fn prune(ticks: &mut VecDeque<Instant>, now: Instant, window: Duration) {
        while let Some(front) = ticks.front() {
            if now.saturating_duration_since(*front) > window {
                ticks.pop_front();
            } else {
                break;
            }
        }
    }
}
