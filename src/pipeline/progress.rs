//! Background progress monitor for acquisition runs.
//!
//! Periodically logs how many images were mined, curated and annotated and
//! how close the dataset is to its target, so long runs against a slow
//! rate tier can be followed without reading every stage log line.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::task::JoinHandle;

/// Snapshot of the counters at a point in time.
#[derive(Debug, Clone)]
pub struct ProgressSnapshot {
    /// Unique candidates returned by discovery.
    pub mined: usize,
    /// Candidates accepted by verification.
    pub curated: usize,
    /// Items that came back from annotation with at least one region.
    pub annotated: usize,
    /// Items whose annotation failed after all attempts.
    pub failed: usize,
    /// Items stored in the dataset.
    pub accepted: usize,
    /// Wall-clock elapsed time since the monitor started.
    pub elapsed: Duration,
}

/// Shared atomic counters for run progress.
///
/// Cloned into stages and workers and incremented via `fetch_add`.
#[derive(Debug, Clone)]
pub struct ProgressCounters {
    pub mined: Arc<AtomicUsize>,
    pub curated: Arc<AtomicUsize>,
    pub annotated: Arc<AtomicUsize>,
    pub failed: Arc<AtomicUsize>,
    pub accepted: Arc<AtomicUsize>,
}

impl Default for ProgressCounters {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressCounters {
    /// Create a new set of zeroed progress counters.
    pub fn new() -> Self {
        Self {
            mined: Arc::new(AtomicUsize::new(0)),
            curated: Arc::new(AtomicUsize::new(0)),
            annotated: Arc::new(AtomicUsize::new(0)),
            failed: Arc::new(AtomicUsize::new(0)),
            accepted: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn add_mined(&self, n: usize) {
        self.mined.fetch_add(n, Ordering::Relaxed);
    }

    pub fn add_curated(&self, n: usize) {
        self.curated.fetch_add(n, Ordering::Relaxed);
    }

    pub fn add_annotated(&self, n: usize) {
        self.annotated.fetch_add(n, Ordering::Relaxed);
    }

    pub fn add_failed(&self, n: usize) {
        self.failed.fetch_add(n, Ordering::Relaxed);
    }

    /// Records the dataset size; it only ever grows.
    pub fn set_accepted(&self, n: usize) {
        self.accepted.fetch_max(n, Ordering::Relaxed);
    }

    /// Take a snapshot of the current counter values.
    pub fn snapshot(&self, start: Instant) -> ProgressSnapshot {
        ProgressSnapshot {
            mined: self.mined.load(Ordering::Relaxed),
            curated: self.curated.load(Ordering::Relaxed),
            annotated: self.annotated.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            accepted: self.accepted.load(Ordering::Relaxed),
            elapsed: start.elapsed(),
        }
    }
}

/// A background task that periodically logs run progress.
///
/// Call [`ProgressMonitor::stop`] to end it; dropping it also stops it at
/// the next tick.
pub struct ProgressMonitor {
    stop_flag: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl ProgressMonitor {
    /// Start a monitor that logs every `interval`.
    ///
    /// # Arguments
    ///
    /// * `counters` - Shared counters incremented by the stages
    /// * `target` - Dataset size the run aims for (progress percentage)
    /// * `interval` - How often to emit progress logs
    pub fn start(counters: ProgressCounters, target: usize, interval: Duration) -> Self {
        let stop_flag = Arc::new(AtomicBool::new(false));
        let flag = stop_flag.clone();
        let start = Instant::now();

        let handle = tokio::spawn(async move {
            let mut tick = tokio::time::interval(interval);
            tick.tick().await; // skip the immediate first tick

            loop {
                tick.tick().await;
                if flag.load(Ordering::Relaxed) {
                    break;
                }

                let snap = counters.snapshot(start);
                let pct = if target > 0 {
                    (snap.accepted as f64 / target as f64 * 100.0).min(100.0)
                } else {
                    0.0
                };
                let elapsed_secs = snap.elapsed.as_secs_f64();
                let accepted_per_min = if elapsed_secs > 0.0 {
                    snap.accepted as f64 / elapsed_secs * 60.0
                } else {
                    0.0
                };

                tracing::info!(
                    mined = snap.mined,
                    curated = snap.curated,
                    annotated = snap.annotated,
                    failed = snap.failed,
                    accepted = snap.accepted,
                    target = target,
                    progress_pct = format!("{:.1}%", pct),
                    elapsed_secs = snap.elapsed.as_secs(),
                    accepted_per_min = format!("{:.2}", accepted_per_min),
                    "Pipeline progress"
                );
            }
        });

        Self {
            stop_flag,
            handle: Some(handle),
        }
    }

    /// Signal the monitor to stop and wait for it to finish.
    pub async fn stop(mut self) {
        self.stop_flag.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            handle.abort();
            let _ = handle.await;
        }
    }
}

impl Drop for ProgressMonitor {
    fn drop(&mut self) {
        self.stop_flag.store(true, Ordering::Relaxed);
    }
}
