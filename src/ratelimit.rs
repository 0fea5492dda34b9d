use std::time::{Duration, Instant};

/// Per-process transfer pacer. The host's configured rate is divided among
/// its active transfers by the dispatcher (`trl_per_process`); each worker
/// paces its own stream so the average never exceeds its share.
///
/// Pacing is delay-based: after each chunk the elapsed wall time is compared
/// with the time the bytes should have taken and the difference is slept
/// away.
pub struct Pacer {
    /// bytes per second; 0 = unlimited.
    rate: u64,
    sent: u64,
    started: Instant,
}

impl Pacer {
    pub fn new(rate_bytes_per_sec: u64) -> Self {
        Self { rate: rate_bytes_per_sec, sent: 0, started: Instant::now() }
    }

    pub fn is_unlimited(&self) -> bool {
        self.rate == 0
    }

    /// Account `n` sent bytes and block until the average rate is back under
    /// the configured share.
    pub fn consume(&mut self, n: u64) {
        self.sent = self.sent.saturating_add(n);
        if let Some(d) = self.delay_needed(Instant::now()) {
            std::thread::sleep(d);
        }
    }

    fn delay_needed(&self, now: Instant) -> Option<Duration> {
        if self.rate == 0 {
            return None;
        }
        let should_have_taken = Duration::from_secs_f64(self.sent as f64 / self.rate as f64);
        let elapsed = now.duration_since(self.started);
        if should_have_taken > elapsed { Some(should_have_taken - elapsed) } else { None }
    }

    /// Fresh window for the next file; counters restart so a long pause
    /// between files is not credited against future chunks.
    pub fn reset(&mut self) {
        self.sent = 0;
        self.started = Instant::now();
    }
}
