//! CLI command definitions for foundry.
//!
//! `run` collects a dataset from the web, `byod` annotates a local folder.
//! Both share the quality, concurrency and output options. `visualize`
//! draws the boxes of an exported dataset onto its images.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::export::visualize_dataset;
use crate::llm::{GeminiClient, GuardedModel, VisionModel};
use crate::pipeline::{
    PipelineConfig, PipelineContext, PipelineMode, PipelineRunner, RequestPlanner,
};
use crate::quality::ValidationMethod;
use crate::resilience::{RateLimiter, RateTier};

/// Default configuration file, read when present.
const DEFAULT_CONFIG_FILE: &str = "config.yaml";

/// Image dataset builder: discover, verify, annotate and export.
#[derive(Parser, Debug)]
#[command(name = "foundry")]
#[command(about = "Build labeled image datasets with a vision model")]
#[command(version)]
#[command(
    long_about = "foundry searches the web for images of a concept, keeps the ones a vision model confirms, \
annotates them with bounding boxes and exports a COCO dataset of exactly the requested size.\n\n\
Example usage:\n  foundry run --query \"dog, cat\" --count 20 --enable-quality-loop\n  foundry byod --dir ./photos --query \"car\""
)]
pub struct Cli {
    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// Log level (trace, debug, info, warn, error). Defaults to
    /// `advanced.log_level` from the config file, then `info`.
    #[arg(short, long, global = true)]
    pub log_level: Option<String>,
}

impl Cli {
    fn common(&self) -> Option<&CommonArgs> {
        match &self.command {
            Commands::Run(args) => Some(&args.common),
            Commands::Byod(args) => Some(&args.common),
            Commands::Visualize(_) => None,
        }
    }

    /// Log filter for the subscriber: `--log-level`, else the config
    /// file's `advanced.log_level`, else `info`.
    pub fn log_filter(&self) -> String {
        if let Some(level) = &self.log_level {
            return level.clone();
        }
        let defaults = CommonArgs::default();
        load_config(self.common().unwrap_or(&defaults))
            .map(|config| config.advanced.log_level)
            .unwrap_or_else(|_| "info".to_string())
    }
}

/// Available CLI subcommands.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Collect a dataset from web image search.
    Run(RunArgs),

    /// Annotate the images of a local folder.
    Byod(ByodArgs),

    /// Draw the boxes of an exported dataset onto its images.
    Visualize(VisualizeArgs),
}

/// Options shared by every run mode.
#[derive(Args, Debug, Clone, Default)]
pub struct CommonArgs {
    /// YAML configuration file.
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Enable the annotate/validate refinement loop.
    #[arg(long)]
    pub enable_quality_loop: bool,

    /// Maximum refinement rounds per item.
    #[arg(long)]
    pub quality_iterations: Option<u32>,

    /// Validation method: coordinate, visual or hybrid.
    #[arg(long)]
    pub validation_method: Option<ValidationMethod>,

    /// Number of annotation workers.
    #[arg(short, long)]
    pub workers: Option<usize>,

    /// Rate limit tier: free or paid.
    #[arg(long)]
    pub tier: Option<RateTier>,

    /// Output directory for exported datasets.
    #[arg(short, long)]
    pub output: Option<PathBuf>,

    /// Print the metrics summary after the run.
    #[arg(long)]
    pub show_metrics: bool,

    /// Disable metrics collection.
    #[arg(long, conflicts_with = "show_metrics")]
    pub no_metrics: bool,
}

/// Arguments for `run`.
#[derive(Args, Debug, Clone, Default)]
pub struct RunArgs {
    /// Objects to annotate, comma-separated.
    #[arg(short, long)]
    pub query: Option<String>,

    /// Search phrase, when it differs from the objects.
    #[arg(long)]
    pub search_query: Option<String>,

    /// Exact number of images wanted.
    #[arg(short = 'n', long)]
    pub count: Option<usize>,

    /// Free-form request; planned into query, search phrase and count.
    #[arg(short, long)]
    pub request: Option<String>,

    #[command(flatten)]
    pub common: CommonArgs,
}

/// Arguments for `byod`.
#[derive(Args, Debug, Clone)]
pub struct ByodArgs {
    /// Folder of .jpg/.jpeg/.png images.
    #[arg(short, long)]
    pub dir: PathBuf,

    /// Objects to annotate, comma-separated.
    #[arg(short, long)]
    pub query: String,

    #[command(flatten)]
    pub common: CommonArgs,
}

/// Arguments for `visualize`.
#[derive(Args, Debug, Clone)]
pub struct VisualizeArgs {
    /// Exported dataset directory holding `annotations.json` and `images/`.
    #[arg(short, long)]
    pub dataset: PathBuf,

    /// Where overlays are written. Defaults to `<dataset>/visualized`.
    #[arg(short, long)]
    pub output: Option<PathBuf>,
}

impl VisualizeArgs {
    pub fn output_dir(&self) -> PathBuf {
        self.output
            .clone()
            .unwrap_or_else(|| self.dataset.join("visualized"))
    }
}

/// Parse CLI arguments without running the command.
///
/// Use this when you need access to CLI options (like log level) before
/// running the command.
pub fn parse_cli() -> Cli {
    Cli::parse()
}

/// Run the CLI by parsing arguments and executing the command.
pub async fn run() -> anyhow::Result<()> {
    run_with_cli(parse_cli()).await
}

/// Run the CLI with the parsed arguments.
pub async fn run_with_cli(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Commands::Run(args) => {
            let request = args.request.clone();
            let explicit_count = args.count.is_some();
            run_pipeline(
                &args.common,
                |config| apply_run_args(config, &args),
                request,
                explicit_count,
            )
            .await
        }
        Commands::Byod(args) => {
            run_pipeline(&args.common, |config| apply_byod_args(config, &args), None, false).await
        }
        Commands::Visualize(args) => run_visualize(args).await,
    }
}

async fn run_visualize(args: VisualizeArgs) -> anyhow::Result<()> {
    let dataset = args.dataset.clone();
    let output = args.output_dir();
    let summary = tokio::task::spawn_blocking(move || visualize_dataset(&dataset, &output))
        .await
        .context("visualization task panicked")?
        .with_context(|| format!("visualizing {}", args.dataset.display()))?;

    println!(
        "Rendered {} image(s) into {}",
        summary.rendered.len(),
        summary.output_dir.display()
    );
    if !summary.missing.is_empty() {
        println!("Missing images: {}", summary.missing.join(", "));
    }
    if !summary.failed.is_empty() {
        println!("Failed to render: {}", summary.failed.join(", "));
    }
    Ok(())
}

/// Loads the configuration: explicit file, else `config.yaml` when present.
fn load_config(common: &CommonArgs) -> anyhow::Result<PipelineConfig> {
    let path = common
        .config
        .clone()
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE));
    let explicit = common.config.is_some();
    if !explicit && !path.exists() {
        let mut config = PipelineConfig::new();
        config.apply_env_overrides()?;
        return Ok(config);
    }
    PipelineConfig::load(Some(&path)).with_context(|| format!("loading {}", path.display()))
}

/// Applies the shared flags on top of file and environment values.
pub fn apply_common_args(config: &mut PipelineConfig, common: &CommonArgs) {
    if common.enable_quality_loop {
        config.quality_loop.enabled = true;
    }
    if let Some(iterations) = common.quality_iterations {
        config.quality_loop.max_iterations = iterations;
    }
    if let Some(method) = common.validation_method {
        config.quality_loop.validation_method = method;
    }
    if let Some(workers) = common.workers {
        config.annotation.num_workers = workers;
    }
    if let Some(tier) = common.tier {
        config.rate_limit.tier = tier;
    }
    if let Some(output) = &common.output {
        config.pipeline.output_dir = output.clone();
    }
    if common.show_metrics {
        config.metrics.show_summary = true;
    }
    if common.no_metrics {
        config.metrics.enabled = false;
        config.metrics.show_summary = false;
    }
}

/// Applies `run` flags.
pub fn apply_run_args(config: &mut PipelineConfig, args: &RunArgs) {
    apply_common_args(config, &args.common);
    if let Some(query) = &args.query {
        config.pipeline.query = Some(query.clone());
    }
    if let Some(search_query) = &args.search_query {
        config.pipeline.search_query = Some(search_query.clone());
    }
    if let Some(count) = args.count {
        config.pipeline.count = count;
    }
    if let Some(request) = &args.request {
        config.pipeline.request = Some(request.clone());
    }
}

/// Applies `byod` flags.
pub fn apply_byod_args(config: &mut PipelineConfig, args: &ByodArgs) {
    apply_common_args(config, &args.common);
    config.pipeline.query = Some(args.query.clone());
    config.pipeline.mode = PipelineMode::Byod;
    config.pipeline.image_dir = Some(args.dir.clone());
}

async fn run_pipeline<F>(
    common: &CommonArgs,
    apply: F,
    request: Option<String>,
    explicit_count: bool,
) -> anyhow::Result<()>
where
    F: FnOnce(&mut PipelineConfig),
{
    let mut config = load_config(common)?;
    apply(&mut config);

    let cancel = CancellationToken::new();
    let raw_model: Arc<dyn VisionModel> =
        Arc::new(GeminiClient::from_env().context("creating the vision model client")?);
    let limiter = Arc::new(RateLimiter::new(config.rate_limit.requests_per_minute()));

    let request = match config.pipeline.mode {
        PipelineMode::Standard => request.or_else(|| config.pipeline.request.clone()),
        PipelineMode::Byod => None,
    };
    if let Some(request) = request.filter(|r| !r.trim().is_empty()) {
        let planning_model =
            GuardedModel::new(Arc::clone(&raw_model), Arc::clone(&limiter), cancel.clone());
        let plan = RequestPlanner::new(Arc::new(planning_model))
            .plan(&request)
            .await;
        plan.apply_to(&mut config, explicit_count);
    }

    config.validate()?;

    let signal_cancel = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, finishing with what has been collected");
            signal_cancel.cancel();
        }
    });

    let show_summary = config.metrics.show_summary;
    let ctx = PipelineContext::with_limiter(config, raw_model, limiter, cancel);
    let runner = PipelineRunner::new(ctx);
    let report = runner.run().await;

    println!("{}", report.render());
    if show_summary {
        println!("{}", report.metrics.render());
    }

    if report.is_success() {
        info!(run_id = %report.run_id, "Run succeeded");
        Ok(())
    } else {
        anyhow::bail!("run ended with status {}", report.outcome.status)
    }
}
