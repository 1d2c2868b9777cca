//! Run metrics.
//!
//! Every run builds its own [`MetricsCollector`] and passes it to the stages
//! through the run context; nothing is global.
//!
//! # Example
//!
//! ```
//! use foundry::metrics::MetricsCollector;
//!
//! let metrics = MetricsCollector::new(true);
//! metrics.record_verification(4, 1);
//!
//! let summary = metrics.summary();
//! assert_eq!(summary.verified, 4);
//! assert!(metrics.export_text().contains("foundry_items_total"));
//! ```

pub mod collector;
pub mod prometheus;

pub use collector::{MetricsCollector, MetricsSummary, StageTiming};
pub use prometheus::PipelineMetrics;
