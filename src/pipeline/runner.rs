//! End-to-end run: wire the collaborators, drive the loop, export.

use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::curation::ConceptVerifier;
use crate::discovery::{GoogleImageSearch, HttpImageFetcher, ImageFetcher, ImageMiner, ImageSearch};
use crate::diversity::DuplicateIndex;
use crate::export::{CocoExporter, ExportSummary};
use crate::metrics::MetricsSummary;
use crate::pipeline::byod::run_byod;
use crate::pipeline::config::{ConfigError, PipelineMode};
use crate::pipeline::context::PipelineContext;
use crate::pipeline::controller::{ControllerSettings, PipelineController};
use crate::pipeline::progress::ProgressMonitor;
use crate::pipeline::stages::PoolAnnotationStage;
use crate::pipeline::state::{PipelineOutcome, PipelineState, RunStatus};
use crate::resilience::{Classify, ErrorClassifier, Stage, StructuredError};

/// Everything a finished run reports.
#[derive(Debug)]
pub struct RunReport {
    pub run_id: Uuid,
    pub mode: PipelineMode,
    pub started_at: DateTime<Utc>,
    pub outcome: PipelineOutcome,
    pub export: Option<ExportSummary>,
    pub export_error: Option<StructuredError>,
    pub metrics: MetricsSummary,
}

impl RunReport {
    /// Whether the process should exit successfully.
    pub fn is_success(&self) -> bool {
        self.outcome.is_success() && self.export_error.is_none()
    }

    /// Multi-line text for the terminal.
    pub fn render(&self) -> String {
        let mut out = format!("Run {} ({})\n", self.run_id, self.mode);
        out.push_str(&format!("  {}\n", self.outcome.summary_line()));
        let totals = &self.outcome.totals;
        out.push_str(&format!(
            "  mined {} | curated {} | annotated {} | failed {} | discarded {}\n",
            totals.mined, totals.curated, totals.annotated, totals.failed, totals.discarded
        ));
        match (&self.export, &self.export_error) {
            (Some(export), _) => out.push_str(&format!(
                "  exported {} images, {} annotations, {} categories to {}\n",
                export.image_count,
                export.annotation_count,
                export.category_count,
                export.dataset_dir.display()
            )),
            (None, Some(err)) => out.push_str(&format!("  export failed: {}\n", err)),
            (None, None) => out.push_str("  nothing exported\n"),
        }
        out
    }
}

/// Builds and runs one pipeline from a [`PipelineContext`].
///
/// Search and download collaborators default to the Custom Search API and
/// plain HTTP; tests and embedders can swap them.
pub struct PipelineRunner {
    ctx: PipelineContext,
    search: Option<Arc<dyn ImageSearch>>,
    fetcher: Option<Arc<dyn ImageFetcher>>,
}

impl PipelineRunner {
    pub fn new(ctx: PipelineContext) -> Self {
        Self {
            ctx,
            search: None,
            fetcher: None,
        }
    }

    pub fn with_search(mut self, search: Arc<dyn ImageSearch>) -> Self {
        self.search = Some(search);
        self
    }

    pub fn with_fetcher(mut self, fetcher: Arc<dyn ImageFetcher>) -> Self {
        self.fetcher = Some(fetcher);
        self
    }

    pub fn context(&self) -> &PipelineContext {
        &self.ctx
    }

    /// Runs the configured mode, then exports whatever was collected.
    pub async fn run(&self) -> RunReport {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let config = &self.ctx.config;
        let mode = config.pipeline.mode;

        info!(
            run_id = %run_id,
            mode = %mode,
            query = ?config.query(),
            count = config.pipeline.count,
            quality_loop = config.quality_loop.enabled,
            "Run started"
        );

        let interval = config.advanced.progress_interval_secs;
        let monitor = (interval > 0).then(|| {
            ProgressMonitor::start(
                self.ctx.progress.clone(),
                config.pipeline.count,
                Duration::from_secs(interval),
            )
        });
        let outcome = match mode {
            PipelineMode::Standard => self.run_standard().await,
            PipelineMode::Byod => match config.pipeline.image_dir.as_deref() {
                Some(dir) => run_byod(&self.ctx, dir, &config.objects()).await,
                None => setup_failure(ConfigError::ValidationFailed(
                    "pipeline.image_dir is required in byod mode".to_string(),
                )),
            },
        };
        if let Some(monitor) = monitor {
            monitor.stop().await;
        }

        let (export, export_error) = self.export(&outcome);
        if let Some(err) = &export_error {
            self.ctx.metrics.record_error(err);
        }

        info!(run_id = %run_id, "{}", outcome.summary_line());
        RunReport {
            run_id,
            mode,
            started_at,
            metrics: self.ctx.metrics.summary(),
            outcome,
            export,
            export_error,
        }
    }

    async fn run_standard(&self) -> PipelineOutcome {
        let config = &self.ctx.config;
        let Some(search_query) = config.search_query().map(str::to_string) else {
            return setup_failure(ConfigError::ValidationFailed(
                "pipeline.query is required in standard mode".to_string(),
            ));
        };

        let search: Arc<dyn ImageSearch> = match &self.search {
            Some(search) => Arc::clone(search),
            None => match GoogleImageSearch::from_env() {
                Ok(search) => Arc::new(search),
                Err(e) => return setup_failure(e),
            },
        };
        let fetcher: Arc<dyn ImageFetcher> = match &self.fetcher {
            Some(fetcher) => Arc::clone(fetcher),
            None => match HttpImageFetcher::new() {
                Ok(fetcher) if config.discovery.save_raw => {
                    Arc::new(fetcher.with_raw_dir(&config.pipeline.raw_dir))
                }
                Ok(fetcher) => Arc::new(fetcher),
                Err(e) => return setup_failure(e),
            },
        };

        let miner = ImageMiner::new(
            search_query.clone(),
            search,
            fetcher,
            Arc::clone(&self.ctx.limiter),
            DuplicateIndex::new(config.discovery.dedup_threshold),
        )
        .with_max_pages_per_call(config.discovery.max_pages_per_call)
        .with_metrics(Arc::clone(&self.ctx.metrics))
        .with_progress(self.ctx.progress.clone());

        let verifier = ConceptVerifier::new(Arc::clone(&self.ctx.model), search_query)
            .with_metrics(Arc::clone(&self.ctx.metrics))
            .with_progress(self.ctx.progress.clone());

        let annotation = PoolAnnotationStage::new(self.ctx.annotation_pool(), config.objects());

        let settings = ControllerSettings::new(config.pipeline.count)
            .with_max_iterations(config.advanced.max_pipeline_loops)
            .with_empty_backoff(config.empty_backoff());

        let mut controller = PipelineController::new(
            settings,
            Box::new(miner),
            Box::new(verifier),
            Box::new(annotation),
        )
        .with_metrics(Arc::clone(&self.ctx.metrics))
        .with_progress(self.ctx.progress.clone());

        controller.run(&self.ctx.cancel).await
    }

    /// Exports a non-empty dataset, whatever the status.
    fn export(&self, outcome: &PipelineOutcome) -> (Option<ExportSummary>, Option<StructuredError>) {
        if outcome.dataset.is_empty() {
            return (None, None);
        }

        let config = &self.ctx.config;
        let name = match config.pipeline.mode {
            PipelineMode::Byod => config
                .pipeline
                .image_dir
                .as_deref()
                .and_then(Path::file_name)
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| "byod".to_string()),
            PipelineMode::Standard => config.search_query().unwrap_or("dataset").to_string(),
        };

        let started = Instant::now();
        let exporter = CocoExporter::new(&config.pipeline.output_dir);
        let result = exporter.export(&outcome.dataset, &name, &config.objects());
        self.ctx.metrics.record_stage(Stage::Export, started.elapsed());

        match result {
            Ok(summary) => {
                if !summary.missing_images.is_empty() {
                    warn!(missing = summary.missing_images.len(), "Some images were not copied");
                }
                info!(
                    path = %summary.annotations_path.display(),
                    images = summary.image_count,
                    annotations = summary.annotation_count,
                    "Dataset exported"
                );
                (Some(summary), None)
            }
            Err(e) => {
                let err = ErrorClassifier::classify(Stage::Export, &e);
                error!(error = %err, "Export failed");
                (None, Some(err))
            }
        }
    }
}

/// Outcome of a run that could not be wired up.
fn setup_failure<E>(error: E) -> PipelineOutcome
where
    E: Classify + std::fmt::Display,
{
    let err = ErrorClassifier::classify(Stage::Pipeline, &error);
    err.log();
    PipelineOutcome::from_state(PipelineState::new(0), RunStatus::Failed, Some(err), Duration::ZERO)
}
