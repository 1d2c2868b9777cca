//! Pipeline orchestration: the stage loop and everything around it.
//!
//! # Architecture
//!
//! - **Config**: layered YAML/env configuration ([`PipelineConfig`])
//! - **Context**: the per-run collaborators every stage shares
//!   ([`PipelineContext`])
//! - **Stages**: the discovery, verification and annotation seams
//! - **Controller**: the loop that drives the stages until the target count
//!   is reached ([`PipelineController`])
//! - **Runner**: wires the production collaborators, runs the configured
//!   mode and exports the result ([`PipelineRunner`])
//!
//! # Pipeline Flow
//!
//! 1. **Mining**: discover at most `needed` unique candidates
//! 2. **Curating**: keep at most `needed` candidates showing the concept
//! 3. **Annotating**: annotate them in parallel, merging into the capped
//!    dataset as results arrive
//! 4. **Loop**: repeat until the dataset is full or a stop condition fires
//!
//! # Example
//!
//! ```rust,ignore
//! use foundry::llm::GeminiClient;
//! use foundry::pipeline::{PipelineConfig, PipelineContext, PipelineRunner};
//!
//! let config = PipelineConfig::load(Some(Path::new("config.yaml")))?
//!     .with_query("dog, cat")
//!     .with_count(20);
//! config.validate()?;
//!
//! let ctx = PipelineContext::new(config, Arc::new(GeminiClient::from_env()?), cancel);
//! let report = PipelineRunner::new(ctx).run().await;
//! println!("{}", report.render());
//! ```

pub mod byod;
pub mod config;
pub mod context;
pub mod controller;
pub mod planner;
pub mod progress;
pub mod runner;
pub mod stages;
pub mod state;

pub use byod::{list_images, load_folder, load_local, run_byod, IMAGE_EXTENSIONS};
pub use config::{ConfigError, PipelineConfig, PipelineMode};
pub use context::PipelineContext;
pub use controller::{ControllerSettings, PipelineController, MAX_EMPTY_DISCOVERIES};
pub use planner::{DatasetPlan, RequestPlanner};
pub use progress::{ProgressCounters, ProgressMonitor, ProgressSnapshot};
pub use runner::{PipelineRunner, RunReport};
pub use stages::{AnnotationStage, DiscoveryStage, PoolAnnotationStage, VerificationStage};
pub use state::{Phase, PipelineOutcome, PipelineState, RunStatus, StageTotals};
