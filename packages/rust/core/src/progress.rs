//! Progress notifications and inter-unit pacing.

use std::time::Duration;

use tokio::sync::watch;

use crate::runner::StopSignal;

/// Receives `(current group, percent)` updates from the runner.
///
/// An empty group key means no unit is in flight. Percent is in `[0, 100]`
/// and never decreases within one run.
pub trait ProgressObserver: Send + Sync {
    fn on_progress(&self, current_group: &str, percent: f64);
}

/// No-op observer for headless/test usage.
pub struct SilentProgress;

impl ProgressObserver for SilentProgress {
    fn on_progress(&self, _current_group: &str, _percent: f64) {}
}

/// Latest progress value, as published by [`WatchProgress`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProgressSnapshot {
    pub current_group: String,
    pub percent: f64,
}

/// Publishes the most recent progress on a `watch` channel so a
/// presentation layer can poll or await changes.
pub struct WatchProgress {
    tx: watch::Sender<ProgressSnapshot>,
}

impl WatchProgress {
    pub fn new() -> (Self, watch::Receiver<ProgressSnapshot>) {
        let (tx, rx) = watch::channel(ProgressSnapshot::default());
        (Self { tx }, rx)
    }
}

impl ProgressObserver for WatchProgress {
    fn on_progress(&self, current_group: &str, percent: f64) {
        // No receivers left is fine; the run does not depend on observers.
        let _ = self.tx.send(ProgressSnapshot {
            current_group: current_group.to_string(),
            percent,
        });
    }
}

/// Percentage of `done` out of `total`; an empty job counts as complete.
pub fn percent(done: usize, total: usize) -> f64 {
    if total == 0 {
        return 100.0;
    }
    done as f64 / total as f64 * 100.0
}

/// Fixed delay between units. The only backpressure on the executor.
#[derive(Debug, Clone, Copy)]
pub struct Pacer {
    interval: Duration,
}

impl Pacer {
    pub fn new(interval: Duration) -> Self {
        Self { interval }
    }

    /// Sleep for the interval, returning early if a stop is requested.
    pub async fn wait(&self, stop: &StopSignal) {
        if self.interval.is_zero() {
            return;
        }
        tokio::select! {
            _ = tokio::time::sleep(self.interval) => {}
            _ = stop.stopped() => {}
        }
    }
}
