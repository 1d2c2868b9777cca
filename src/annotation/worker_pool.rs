//! Bounded-concurrency annotation pool.
//!
//! A fixed number of workers pull [`AnnotationTask`]s from a shared queue and
//! push finished results into a single collector channel. Only the collector
//! touches the dataset, so the capacity check and the insert happen in one
//! place and concurrent completions can never overshoot the target.
//!
//! # Features
//!
//! - Configurable number of workers
//! - Per-item retry with linear backoff; retries use stricter wording
//! - Per-attempt timeout
//! - Cancellation through a [`CancellationToken`]; a full dataset or a fatal
//!   error stops the remaining work
//! - Pool statistics tracking

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::annotation::annotator::{AnnotationTask, ItemAnnotator};
use crate::annotation::types::AnnotationResult;
use crate::dataset::{CandidateItem, Dataset, MergeOutcome};
use crate::error::{AnnotationError, CapabilityError};
use crate::metrics::MetricsCollector;
use crate::pipeline::progress::ProgressCounters;
use crate::resilience::{ErrorCategory, ErrorClassifier, RetryPolicy, Stage, StructuredError};

/// Configuration for the annotation pool.
#[derive(Debug, Clone)]
pub struct AnnotationPoolConfig {
    /// Number of concurrent workers.
    pub num_workers: usize,
    /// Attempts per item, first one included.
    pub max_attempts: u32,
    /// Base of the linear backoff between attempts.
    pub backoff_base: Duration,
    /// Maximum time allowed for a single attempt.
    pub attempt_timeout: Duration,
}

impl Default for AnnotationPoolConfig {
    fn default() -> Self {
        Self {
            num_workers: 3,
            max_attempts: 3,
            backoff_base: Duration::from_secs(1),
            attempt_timeout: Duration::from_secs(300), // 5 minutes, covers refinement rounds
        }
    }
}

impl AnnotationPoolConfig {
    /// Creates a configuration with the specified number of workers.
    pub fn new(num_workers: usize) -> Self {
        Self {
            num_workers: num_workers.max(1),
            ..Default::default()
        }
    }

    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }

    pub fn with_backoff_base(mut self, base: Duration) -> Self {
        self.backoff_base = base;
        self
    }

    pub fn with_attempt_timeout(mut self, timeout: Duration) -> Self {
        self.attempt_timeout = timeout;
        self
    }

    fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::per_item(self.max_attempts, self.backoff_base)
    }
}

/// Statistics about the pool.
#[derive(Debug, Clone, Default)]
pub struct PoolStats {
    /// Total number of workers in the pool.
    pub num_workers: usize,
    /// Workers currently annotating an item.
    pub active_workers: usize,
    /// Items that produced a result.
    pub items_completed: u64,
    /// Items that failed after all attempts.
    pub items_failed: u64,
    /// Average time per item, retries included.
    pub average_item_duration: Duration,
}

impl PoolStats {
    /// Returns the total number of items processed (completed + failed).
    pub fn total_processed(&self) -> u64 {
        self.items_completed + self.items_failed
    }

    /// Returns the success rate as a percentage.
    pub fn success_rate(&self) -> f64 {
        let total = self.total_processed();
        if total == 0 {
            return 0.0;
        }
        (self.items_completed as f64 / total as f64) * 100.0
    }
}

/// Shared state for tracking pool statistics.
struct SharedPoolStats {
    items_completed: AtomicU64,
    items_failed: AtomicU64,
    total_duration_ms: AtomicU64,
    active_workers: AtomicU64,
}

impl SharedPoolStats {
    fn new() -> Self {
        Self {
            items_completed: AtomicU64::new(0),
            items_failed: AtomicU64::new(0),
            total_duration_ms: AtomicU64::new(0),
            active_workers: AtomicU64::new(0),
        }
    }

    fn record_completion(&self, duration: Duration) {
        self.items_completed.fetch_add(1, Ordering::SeqCst);
        self.total_duration_ms
            .fetch_add(duration.as_millis() as u64, Ordering::SeqCst);
    }

    fn record_failure(&self, duration: Duration) {
        self.items_failed.fetch_add(1, Ordering::SeqCst);
        self.total_duration_ms
            .fetch_add(duration.as_millis() as u64, Ordering::SeqCst);
    }

    fn increment_active(&self) {
        self.active_workers.fetch_add(1, Ordering::SeqCst);
    }

    fn decrement_active(&self) {
        self.active_workers.fetch_sub(1, Ordering::SeqCst);
    }

    fn to_pool_stats(&self, num_workers: usize) -> PoolStats {
        let completed = self.items_completed.load(Ordering::SeqCst);
        let failed = self.items_failed.load(Ordering::SeqCst);
        let total_duration_ms = self.total_duration_ms.load(Ordering::SeqCst);
        let active = self.active_workers.load(Ordering::SeqCst);

        let total_items = completed + failed;
        let average_duration = if total_items > 0 {
            Duration::from_millis(total_duration_ms / total_items)
        } else {
            Duration::ZERO
        };

        PoolStats {
            num_workers,
            active_workers: active as usize,
            items_completed: completed,
            items_failed: failed,
            average_item_duration: average_duration,
        }
    }
}

/// What one call to the pool produced.
#[derive(Debug, Default)]
pub struct PoolOutcome {
    /// Results keyed by item, filled by [`AnnotationWorkerPool::annotate_all`].
    pub results: BTreeMap<String, AnnotationResult>,
    /// Results stored (new keys only).
    pub merged: usize,
    /// Results that arrived after the dataset was full.
    pub discarded: usize,
    /// Items that failed after all attempts, with the last error.
    pub failed: Vec<(String, StructuredError)>,
    /// First fatal error; the pool stopped when it was seen.
    pub fatal: Option<StructuredError>,
    /// The caller's token fired before the pool finished.
    pub cancelled: bool,
}

/// A finished item as reported by a worker.
struct WorkerReport {
    key: String,
    worker_index: usize,
    result: Result<AnnotationResult, StructuredError>,
}

/// Fixed-width pool of annotation workers.
pub struct AnnotationWorkerPool {
    config: AnnotationPoolConfig,
    annotator: Arc<dyn ItemAnnotator>,
    stats: Arc<SharedPoolStats>,
    metrics: Option<Arc<MetricsCollector>>,
    progress: Option<ProgressCounters>,
}

impl AnnotationWorkerPool {
    pub fn new(config: AnnotationPoolConfig, annotator: Arc<dyn ItemAnnotator>) -> Self {
        Self {
            config,
            annotator,
            stats: Arc::new(SharedPoolStats::new()),
            metrics: None,
            progress: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<MetricsCollector>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn with_progress(mut self, progress: ProgressCounters) -> Self {
        self.progress = Some(progress);
        self
    }

    /// Returns cumulative statistics over every call to this pool.
    pub fn stats(&self) -> PoolStats {
        self.stats.to_pool_stats(self.config.num_workers)
    }

    pub fn config(&self) -> &AnnotationPoolConfig {
        &self.config
    }

    /// Annotates every item and returns the results keyed by item.
    ///
    /// Results are gathered in completion order. Submitting the same key
    /// twice keeps the last completed result.
    pub async fn annotate_all(
        &self,
        items: Vec<CandidateItem>,
        objects: &[String],
        cancel: &CancellationToken,
    ) -> PoolOutcome {
        let mut dataset = Dataset::unbounded();
        let mut outcome = self.annotate_into(items, objects, &mut dataset, cancel).await;
        outcome.results = dataset.into_entries();
        outcome
    }

    /// Annotates items and merges each result into `dataset` as it arrives.
    ///
    /// Once the dataset is full the remaining work is cancelled and any
    /// result still in flight is discarded.
    pub async fn annotate_into(
        &self,
        items: Vec<CandidateItem>,
        objects: &[String],
        dataset: &mut Dataset,
        cancel: &CancellationToken,
    ) -> PoolOutcome {
        let mut outcome = PoolOutcome::default();
        if items.is_empty() {
            return outcome;
        }
        if cancel.is_cancelled() {
            outcome.cancelled = true;
            return outcome;
        }

        let pool_cancel = cancel.child_token();
        let objects: Arc<[String]> = objects.iter().cloned().collect();
        let num_workers = self.config.num_workers.max(1).min(items.len());

        let (task_tx, task_rx) = mpsc::channel(items.len());
        for (task_index, item) in items.into_iter().enumerate() {
            let task = AnnotationTask {
                item,
                objects: Arc::clone(&objects),
                task_index,
                worker_index: 0,
            };
            if task_tx.send(task).await.is_err() {
                break;
            }
        }
        drop(task_tx);

        let tasks = Arc::new(Mutex::new(task_rx));
        let (report_tx, mut report_rx) = mpsc::unbounded_channel();
        let mut handles: Vec<JoinHandle<()>> = Vec::with_capacity(num_workers);

        for index in 0..num_workers {
            let worker = Worker {
                index,
                tasks: Arc::clone(&tasks),
                reports: report_tx.clone(),
                annotator: Arc::clone(&self.annotator),
                retry: self.config.retry_policy(),
                attempt_timeout: self.config.attempt_timeout,
                cancel: pool_cancel.clone(),
                stats: Arc::clone(&self.stats),
            };
            handles.push(tokio::spawn(worker.run()));
        }
        drop(report_tx);

        debug!(num_workers = num_workers, "Annotation pool started");

        while let Some(report) = report_rx.recv().await {
            match report.result {
                Ok(result) => self.merge(result, dataset, &pool_cancel, &mut outcome),
                Err(err) if err.is_cancelled() => {
                    debug!(item = %report.key, "Annotation cancelled");
                }
                Err(err) => {
                    warn!(
                        item = %report.key,
                        worker = report.worker_index,
                        category = %err.category,
                        error = %err.message,
                        "Item annotation failed"
                    );
                    if let Some(metrics) = &self.metrics {
                        metrics.record_error(&err);
                        metrics.record_annotation(false);
                    }
                    if let Some(progress) = &self.progress {
                        progress.add_failed(1);
                    }
                    if err.is_fatal() && outcome.fatal.is_none() {
                        err.log();
                        outcome.fatal = Some(err.clone());
                        pool_cancel.cancel();
                    }
                    outcome.failed.push((report.key, err));
                }
            }
        }

        for result in futures::future::join_all(handles).await {
            if let Err(e) = result {
                error!(error = %e, "Annotation worker panicked");
            }
        }

        outcome.cancelled = cancel.is_cancelled();
        info!(
            merged = outcome.merged,
            failed = outcome.failed.len(),
            discarded = outcome.discarded,
            collected = dataset.len(),
            "Annotation pool finished"
        );
        outcome
    }

    fn merge(
        &self,
        result: AnnotationResult,
        dataset: &mut Dataset,
        pool_cancel: &CancellationToken,
        outcome: &mut PoolOutcome,
    ) {
        let key = result.key.clone();
        match dataset.offer(result) {
            MergeOutcome::Inserted { collected } => {
                outcome.merged += 1;
                if let Some(metrics) = &self.metrics {
                    metrics.record_annotation(true);
                }
                if let Some(progress) = &self.progress {
                    progress.add_annotated(1);
                    progress.set_accepted(collected);
                }
                debug!(item = %key, collected = collected, "Result merged");
                if dataset.is_full() {
                    pool_cancel.cancel();
                }
            }
            MergeOutcome::Replaced => {
                debug!(item = %key, "Result replaced an earlier one for the same item");
            }
            MergeOutcome::Full => {
                outcome.discarded += 1;
                debug!(item = %key, "Dataset full, result discarded");
            }
            MergeOutcome::Rejected => {
                let err = StructuredError::new(
                    Stage::Annotation,
                    ErrorCategory::Validation,
                    "Result carried no valid region",
                )
                .with_detail("item", &key);
                outcome.failed.push((key, err));
            }
        }
    }
}

/// A single worker pulling tasks until the queue is empty or the pool is
/// cancelled.
struct Worker {
    index: usize,
    tasks: Arc<Mutex<mpsc::Receiver<AnnotationTask>>>,
    reports: mpsc::UnboundedSender<WorkerReport>,
    annotator: Arc<dyn ItemAnnotator>,
    retry: RetryPolicy,
    attempt_timeout: Duration,
    cancel: CancellationToken,
    stats: Arc<SharedPoolStats>,
}

impl Worker {
    async fn run(self) {
        loop {
            let next = {
                let mut tasks = self.tasks.lock().await;
                tokio::select! {
                    _ = self.cancel.cancelled() => None,
                    task = tasks.recv() => task,
                }
            };
            let Some(mut task) = next else {
                break;
            };
            task.worker_index = self.index;

            self.stats.increment_active();
            let started = Instant::now();
            let key = task.item.key.clone();
            debug!(worker = self.index, item = %key, "Annotating item");

            let result = self.process(&task).await;
            match &result {
                Ok(_) => self.stats.record_completion(started.elapsed()),
                Err(err) if err.is_cancelled() => {}
                Err(_) => self.stats.record_failure(started.elapsed()),
            }
            self.stats.decrement_active();

            let report = WorkerReport {
                key,
                worker_index: self.index,
                result,
            };
            if self.reports.send(report).is_err() {
                break;
            }
        }
        debug!(worker = self.index, "Worker stopped");
    }

    async fn process(&self, task: &AnnotationTask) -> Result<AnnotationResult, StructuredError> {
        let annotator = &self.annotator;
        let attempt_timeout = self.attempt_timeout;

        self.retry
            .run(Stage::Annotation, &self.cancel, |attempt| async move {
                if attempt > 0 {
                    debug!(item = %task.item.key, attempt = attempt + 1, "Retrying item");
                }
                match tokio::time::timeout(attempt_timeout, annotator.annotate(task, attempt)).await
                {
                    Ok(result) => result,
                    Err(_) => Err(AnnotationError::Capability(CapabilityError::Timeout(format!(
                        "attempt exceeded {}s",
                        attempt_timeout.as_secs()
                    )))),
                }
            })
            .await
            .map_err(|e| {
                ErrorClassifier::classify(Stage::Annotation, &e)
                    .with_detail("item", &task.item.key)
                    .with_detail("worker", self.index)
            })
    }
}
