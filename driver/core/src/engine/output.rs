//! Engine Output Routing
//!
//! The engine writes to two channels (normal and error). Both land here and
//! are multiplexed into a single stream that goes either to the live
//! subscriber or, while a command is executing, into the capture slot.
//!
//! The capture slot holds at most one capture. Opening a second one while the
//! first is still open is a contract violation and panics: commands execute
//! strictly one at a time.

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;

/// Which engine channel a piece of text came from
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OutputStream {
    /// Normal output
    Stdout,
    /// Error output
    Stderr,
}

/// Receiver for live output lines
pub type LiveSink = Arc<dyn Fn(&str) + Send + Sync>;

#[derive(Debug, Default)]
struct Capture {
    streaming: bool,
    lines: Vec<String>,
}

#[derive(Default)]
struct RouterState {
    capture: Option<Capture>,
    live: Option<LiveSink>,
}

/// Shared router between the engine (writer) and the driver (capture/live)
#[derive(Clone, Default)]
pub struct OutputRouter {
    inner: Arc<Mutex<RouterState>>,
}

impl fmt::Debug for OutputRouter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.lock();
        f.debug_struct("OutputRouter")
            .field("capturing", &state.capture.is_some())
            .field("has_live_sink", &state.live.is_some())
            .finish()
    }
}

impl OutputRouter {
    /// Create a router with no live sink
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Install or remove the live subscriber
    pub fn set_live_sink(&self, sink: Option<LiveSink>) {
        self.inner.lock().live = sink;
    }

    /// Engine-side entry point: route one line of output
    pub fn emit(&self, stream: OutputStream, text: &str) {
        let line = text.strip_suffix('\n').unwrap_or(text);
        let forward = {
            let mut state = self.inner.lock();
            match state.capture.as_mut() {
                Some(capture) => {
                    capture.lines.push(line.to_string());
                    if capture.streaming {
                        state.live.clone()
                    } else {
                        None
                    }
                }
                None => state.live.clone(),
            }
        };
        if stream == OutputStream::Stderr {
            tracing::trace!(line, "engine stderr");
        }
        if let Some(sink) = forward {
            sink(line);
        }
    }

    /// Send a line straight to the live subscriber, bypassing any capture
    pub fn emit_live(&self, text: &str) {
        let sink = self.inner.lock().live.clone();
        if let Some(sink) = sink {
            sink(text);
        }
    }

    /// Whether a capture is currently open
    #[must_use]
    pub fn is_capturing(&self) -> bool {
        self.inner.lock().capture.is_some()
    }

    /// Open the capture slot
    ///
    /// # Panics
    ///
    /// Panics if a capture is already open.
    #[must_use = "dropping the guard closes the capture immediately"]
    pub fn begin_capture(&self, streaming: bool) -> CaptureGuard {
        let mut state = self.inner.lock();
        assert!(
            state.capture.is_none(),
            "output capture is single-slot: a command started while another was still executing"
        );
        state.capture = Some(Capture {
            streaming,
            lines: Vec::new(),
        });
        CaptureGuard {
            router: self.clone(),
            open: true,
        }
    }
}

/// Holds the capture slot; releases it on [`finish`](Self::finish) or drop
#[derive(Debug)]
pub struct CaptureGuard {
    router: OutputRouter,
    open: bool,
}

impl CaptureGuard {
    /// Close the capture and take the captured lines
    #[must_use]
    pub fn finish(mut self) -> Vec<String> {
        self.open = false;
        self.router
            .inner
            .lock()
            .capture
            .take()
            .map(|c| c.lines)
            .unwrap_or_default()
    }
}

impl Drop for CaptureGuard {
    fn drop(&mut self) {
        if self.open {
            self.router.inner.lock().capture = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn collecting_sink() -> (LiveSink, Arc<Mutex<Vec<String>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = Arc::clone(&seen);
        let sink: LiveSink = Arc::new(move |line: &str| seen_clone.lock().push(line.to_string()));
        (sink, seen)
    }

    #[test]
    fn test_uncaptured_output_goes_live() {
        let router = OutputRouter::new();
        let (sink, seen) = collecting_sink();
        router.set_live_sink(Some(sink));

        router.emit(OutputStream::Stdout, "hello\n");
        router.emit(OutputStream::Stderr, "oops");

        assert_eq!(*seen.lock(), vec!["hello".to_string(), "oops".to_string()]);
    }

    #[test]
    fn test_buffered_capture_hides_output() {
        let router = OutputRouter::new();
        let (sink, seen) = collecting_sink();
        router.set_live_sink(Some(sink));

        let guard = router.begin_capture(false);
        router.emit(OutputStream::Stdout, "AR:\t1000");
        let lines = guard.finish();

        assert_eq!(lines, vec!["AR:\t1000".to_string()]);
        assert!(seen.lock().is_empty());
        assert!(!router.is_capturing());
    }

    #[test]
    fn test_streaming_capture_forwards_and_buffers() {
        let router = OutputRouter::new();
        let (sink, seen) = collecting_sink();
        router.set_live_sink(Some(sink));

        let guard = router.begin_capture(true);
        router.emit(OutputStream::Stdout, "line 1");
        let lines = guard.finish();

        assert_eq!(lines, vec!["line 1".to_string()]);
        assert_eq!(*seen.lock(), vec!["line 1".to_string()]);
    }

    #[test]
    fn test_dropped_guard_releases_slot() {
        let router = OutputRouter::new();
        {
            let _guard = router.begin_capture(false);
            assert!(router.is_capturing());
        }
        assert!(!router.is_capturing());
        let _again = router.begin_capture(false);
    }

    #[test]
    #[should_panic(expected = "single-slot")]
    fn test_nested_capture_panics() {
        let router = OutputRouter::new();
        let _outer = router.begin_capture(false);
        let _inner = router.begin_capture(false);
    }
}
