//! Rate-limited progress reporting

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Progress callback (bytes_done, bytes_total)
pub type ProgressFn = Arc<dyn Fn(u64, u64) + Send + Sync>;

/// Wraps a [`ProgressFn`] so that it sees `0` first and `total` last, with
/// intermediate values at least `interval` apart and never decreasing.
pub struct ThrottledProgress {
    sink: Option<ProgressFn>,
    total: u64,
    interval: Duration,
    state: Mutex<State>,
}

struct State {
    done: u64,
    last_emit: Option<Instant>,
    finished: bool,
}

impl ThrottledProgress {
    pub fn new(sink: Option<ProgressFn>, total: u64, interval: Duration) -> Self {
        Self {
            sink,
            total,
            interval,
            state: Mutex::new(State {
                done: 0,
                last_emit: None,
                finished: false,
            }),
        }
    }

    pub fn total(&self) -> u64 {
        self.total
    }

    /// Emit the initial 0.
    pub fn start(&self) {
        let mut state = self.lock();
        state.last_emit = Some(Instant::now());
        self.emit(0);
    }

    /// Record `delta` more bytes done; emits only if the interval has elapsed.
    pub fn advance(&self, delta: u64) {
        let mut state = self.lock();
        if state.finished {
            return;
        }
        state.done = state.done.saturating_add(delta).min(self.total);
        let due = state
            .last_emit
            .map(|t| t.elapsed() >= self.interval)
            .unwrap_or(true);
        if due && state.done < self.total {
            state.last_emit = Some(Instant::now());
            self.emit(state.done);
        }
    }

    /// Emit `total`. Later calls are no-ops.
    pub fn finish(&self) {
        let mut state = self.lock();
        if state.finished {
            return;
        }
        state.finished = true;
        state.done = self.total;
        self.emit(self.total);
    }

    fn emit(&self, done: u64) {
        if let Some(sink) = &self.sink {
            sink(done, self.total);
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
