//! Transfer progress events.
//!
//! Events are monotonically non-decreasing in `bytes_done` and throttled so
//! a fast transfer does not flood the consumer; the final event is always
//! emitted.

use std::sync::Arc;
use std::time::{Duration, Instant};

/// Which way bytes are moving.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    /// Local file to server
    Upload,
    /// Server to local file
    Download,
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Upload => write!(f, "upload"),
            Self::Download => write!(f, "download"),
        }
    }
}

/// One progress observation.
#[derive(Debug, Clone)]
pub struct ProgressEvent {
    /// Operation direction
    pub operation: Operation,
    /// Remote path
    pub path: String,
    /// Bytes finished so far (includes any resume offset)
    pub bytes_done: u64,
    /// Total bytes in the file
    pub total_bytes: u64,
    /// Time since the operation started
    pub elapsed: Duration,
}

/// Consumer callback.
pub type ProgressFn = dyn Fn(ProgressEvent) + Send + Sync;

/// Minimum spacing between intermediate events
const EMIT_INTERVAL: Duration = Duration::from_millis(100);

/// Per-operation emitter enforcing monotonicity and throttling.
pub(crate) struct ProgressReporter {
    callback: Option<Arc<ProgressFn>>,
    operation: Operation,
    path: String,
    total_bytes: u64,
    started: Instant,
    last_emit: Option<Instant>,
    high_water: u64,
}

impl ProgressReporter {
    pub(crate) fn new(
        operation: Operation,
        path: &str,
        total_bytes: u64,
        callback: Option<Arc<ProgressFn>>,
    ) -> Self {
        Self {
            callback,
            operation,
            path: path.to_string(),
            total_bytes,
            started: Instant::now(),
            last_emit: None,
            high_water: 0,
        }
    }

    /// Report progress; dropped when inside the throttle window.
    pub(crate) fn update(&mut self, bytes_done: u64) {
        let bytes_done = bytes_done.max(self.high_water);
        self.high_water = bytes_done;

        if let Some(last) = self.last_emit {
            if last.elapsed() < EMIT_INTERVAL {
                return;
            }
        }
        self.emit(bytes_done);
    }

    /// Report the final state; always emitted.
    pub(crate) fn finish(&mut self, bytes_done: u64) {
        let bytes_done = bytes_done.max(self.high_water);
        self.high_water = bytes_done;
        self.emit(bytes_done);
    }

    fn emit(&mut self, bytes_done: u64) {
        self.last_emit = Some(Instant::now());
        if let Some(callback) = &self.callback {
            callback(ProgressEvent {
                operation: self.operation,
                path: self.path.clone(),
                bytes_done,
                total_bytes: self.total_bytes,
                elapsed: self.started.elapsed(),
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn collector() -> (Arc<Mutex<Vec<ProgressEvent>>>, Arc<ProgressFn>) {
        let events: Arc<Mutex<Vec<ProgressEvent>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        let callback: Arc<ProgressFn> =
            Arc::new(move |event| sink.lock().unwrap().push(event));
        (events, callback)
    }

    #[test]
    fn events_are_monotonic() {
        let (events, callback) = collector();
        let mut reporter =
            ProgressReporter::new(Operation::Upload, "a.bin", 1000, Some(callback));

        reporter.update(100);
        // A regression in reported bytes must not go backwards.
        reporter.finish(50);
        reporter.finish(500);

        let seen = events.lock().unwrap();
        let mut prev = 0;
        for event in seen.iter() {
            assert!(event.bytes_done >= prev);
            prev = event.bytes_done;
        }
        assert_eq!(seen.last().unwrap().bytes_done, 500);
    }

    #[test]
    fn updates_are_throttled() {
        let (events, callback) = collector();
        let mut reporter =
            ProgressReporter::new(Operation::Download, "a.bin", 10_000, Some(callback));

        for i in 0..100 {
            reporter.update(i * 100);
        }

        // Back-to-back updates collapse into the first one.
        assert_eq!(events.lock().unwrap().len(), 1);
    }

    #[test]
    fn finish_always_emits() {
        let (events, callback) = collector();
        let mut reporter =
            ProgressReporter::new(Operation::Download, "a.bin", 100, Some(callback));

        reporter.update(10);
        reporter.finish(100);

        let seen = events.lock().unwrap();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen.last().unwrap().bytes_done, 100);
    }

    #[test]
    fn no_callback_is_fine() {
        let mut reporter = ProgressReporter::new(Operation::Upload, "a.bin", 100, None);
        reporter.update(10);
        reporter.finish(100);
    }
}
