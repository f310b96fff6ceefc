//! Session timer with a `MM:SS` display.

use std::time::Duration;
use tokio::time::Instant;

pub const ZERO_DISPLAY: &str = "00:00";

#[derive(Debug, Clone)]
pub struct SessionTimer {
    started_at: Option<Instant>,
    running: bool,
    /// Last elapsed value captured by `tick` or `stop`.
    elapsed: Duration,
    display: String,
}

impl Default for SessionTimer {
    fn default() -> Self {
        Self {
            started_at: None,
            running: false,
            elapsed: Duration::ZERO,
            display: ZERO_DISPLAY.to_string(),
        }
    }
}

impl SessionTimer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Restart from zero.
    pub fn start(&mut self) {
        self.started_at = Some(Instant::now());
        self.running = true;
        self.elapsed = Duration::ZERO;
        self.display = ZERO_DISPLAY.to_string();
    }

    /// Refresh the display from the wall clock. Does nothing once stopped.
    pub fn tick(&mut self) {
        if !self.running {
            return;
        }
        if let Some(started_at) = self.started_at {
            self.elapsed = started_at.elapsed();
            self.display = format_elapsed(self.elapsed);
        }
    }

    /// Freeze the current display. The value stays until `reset`.
    pub fn stop(&mut self) {
        self.tick();
        self.running = false;
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    pub fn display(&self) -> &str {
        &self.display
    }

    pub fn elapsed(&self) -> Duration {
        self.elapsed
    }

    pub fn elapsed_secs(&self) -> u64 {
        self.elapsed.as_secs()
    }
}

/// Zero-padded `minutes:seconds`.
pub fn format_elapsed(elapsed: Duration) -> String {
    let secs = elapsed.as_secs();
    format!("{:02}:{:02}", secs / 60, secs % 60)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_elapsed() {
        assert_eq!(format_elapsed(Duration::ZERO), "00:00");
        assert_eq!(format_elapsed(Duration::from_millis(59_999)), "00:59");
        assert_eq!(format_elapsed(Duration::from_secs(61)), "01:01");
        assert_eq!(format_elapsed(Duration::from_secs(100 * 60 + 5)), "100:05");
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_freezes_display() {
        let mut timer = SessionTimer::new();
        timer.start();
        tokio::time::advance(Duration::from_secs(75)).await;
        timer.tick();
        assert_eq!(timer.display(), "01:15");

        timer.stop();
        tokio::time::advance(Duration::from_secs(30)).await;
        timer.tick();
        assert_eq!(timer.display(), "01:15");
        assert_eq!(timer.elapsed_secs(), 75);
        assert!(!timer.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset_clears() {
        let mut timer = SessionTimer::new();
        timer.start();
        tokio::time::advance(Duration::from_secs(5)).await;
        timer.stop();
        timer.reset();
        assert_eq!(timer.display(), ZERO_DISPLAY);
        assert_eq!(timer.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_restarts_from_zero() {
        let mut timer = SessionTimer::new();
        timer.start();
        tokio::time::advance(Duration::from_secs(10)).await;
        timer.stop();
        timer.start();
        assert_eq!(timer.display(), ZERO_DISPLAY);
        tokio::time::advance(Duration::from_secs(2)).await;
        timer.tick();
        assert_eq!(timer.display(), "00:02");
    }
}
