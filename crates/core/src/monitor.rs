use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::broadcast::FrameListener;
use crate::error::Result;
use crate::frame::Frame;

struct Window {
    count: u64,
    started: Option<Instant>,
}

/// Counts frames and derives the rate since the last reset.
///
/// The measurement window opens on the first frame (or on
/// [`reset`](Self::reset)), so connection setup time does not drag the
/// first reading down.
pub struct RateMonitor {
    window: Mutex<Window>,
}

impl RateMonitor {
    pub fn new() -> Self {
        Self {
            window: Mutex::new(Window {
                count: 0,
                started: None,
            }),
        }
    }

    pub fn count(&self) -> u64 {
        self.window.lock().count
    }

    pub fn elapsed(&self) -> Duration {
        self.window
            .lock()
            .started
            .map_or(Duration::ZERO, |started| started.elapsed())
    }

    /// Frames per second over the current window; 0 before any time passed.
    pub fn fps(&self) -> f64 {
        let window = self.window.lock();
        let elapsed = window
            .started
            .map_or(0.0, |started| started.elapsed().as_secs_f64());
        if elapsed > 0.0 {
            window.count as f64 / elapsed
        } else {
            0.0
        }
    }

    /// Zero the counter and open a new window now.
    pub fn reset(&self) {
        let mut window = self.window.lock();
        window.count = 0;
        window.started = Some(Instant::now());
    }
}

impl Default for RateMonitor {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameListener for RateMonitor {
    fn on_frame(&self, _frame: &Frame) -> Result<()> {
        let mut window = self.window.lock();
        window.started.get_or_insert_with(Instant::now);
        window.count += 1;
        Ok(())
    }
}
