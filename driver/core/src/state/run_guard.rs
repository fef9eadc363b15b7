//! Run-command suppression
//!
//! While a GO/CONT/RUN command is starting, a "stopped" notification can
//! still be in flight from before the command reached the engine. For a short
//! window after the run flag is raised, such notifications are dropped.

use std::time::Duration;

use tokio::time::Instant;

/// Masks stale "stopped" run-state events for a fixed window
#[derive(Debug, Clone)]
pub struct RunStateGuard {
    window: Duration,
    suppressed_until: Option<Instant>,
}

impl RunStateGuard {
    /// Create a guard with the given window
    #[must_use]
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            suppressed_until: None,
        }
    }

    /// Start masking "stopped" events from `now`
    pub fn open(&mut self, now: Instant) {
        self.suppressed_until = Some(now + self.window);
    }

    /// Stop masking
    pub fn clear(&mut self) {
        self.suppressed_until = None;
    }

    /// Whether a "stopped" event at `now` would be dropped
    #[must_use]
    pub fn is_suppressing(&self, now: Instant) -> bool {
        self.suppressed_until.is_some_and(|until| now < until)
    }

    /// Decide whether a run-state event should reach the snapshot
    ///
    /// "Running" always passes and ends the window. "Stopped" is dropped
    /// inside the window; the first one after it closes the window.
    pub fn accepts(&mut self, running: bool, now: Instant) -> bool {
        if running {
            self.clear();
            return true;
        }
        if self.is_suppressing(now) {
            return false;
        }
        self.clear();
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stopped_dropped_inside_window() {
        let start = Instant::now();
        let mut guard = RunStateGuard::new(Duration::from_millis(250));
        guard.open(start);

        assert!(!guard.accepts(false, start + Duration::from_millis(10)));
        assert!(!guard.accepts(false, start + Duration::from_millis(249)));
        assert!(guard.accepts(false, start + Duration::from_millis(250)));
        assert!(!guard.is_suppressing(start + Duration::from_millis(10)));
    }

    #[test]
    fn test_running_closes_window() {
        let start = Instant::now();
        let mut guard = RunStateGuard::new(Duration::from_millis(250));
        guard.open(start);

        assert!(guard.accepts(true, start));
        assert!(guard.accepts(false, start + Duration::from_millis(1)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_window_expires_with_clock() {
        let mut guard = RunStateGuard::new(Duration::from_millis(250));
        guard.open(Instant::now());

        tokio::time::advance(Duration::from_millis(200)).await;
        assert!(!guard.accepts(false, Instant::now()));

        tokio::time::advance(Duration::from_millis(50)).await;
        assert!(guard.accepts(false, Instant::now()));
    }

    #[test]
    fn test_idle_guard_accepts_everything() {
        let now = Instant::now();
        let mut guard = RunStateGuard::new(Duration::from_millis(250));
        assert!(guard.accepts(false, now));
        assert!(guard.accepts(true, now));
    }
}
