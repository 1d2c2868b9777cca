//! Run-scoped metric recording.
//!
//! `MetricsCollector` is the only metrics type stages see. It feeds the
//! Prometheus families in [`super::prometheus`] and keeps a plain summary
//! for the end-of-run report. Recording never fails: if the registry cannot
//! be built the collector keeps the summary only.

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use serde::Serialize;

use super::prometheus::PipelineMetrics;
use crate::quality::Verdict;
use crate::resilience::{ErrorCategory, Stage, StructuredError};

/// Wall time spent in one stage across the run.
#[derive(Debug, Clone, Default, Serialize)]
pub struct StageTiming {
    pub runs: u64,
    pub total_secs: f64,
}

impl StageTiming {
    pub fn average_secs(&self) -> f64 {
        if self.runs == 0 {
            0.0
        } else {
            self.total_secs / self.runs as f64
        }
    }
}

/// Totals for the end-of-run report.
#[derive(Debug, Clone, Default, Serialize)]
pub struct MetricsSummary {
    pub mined: u64,
    pub duplicates: u64,
    pub download_failures: u64,
    pub verified: u64,
    pub rejected: u64,
    pub annotated: u64,
    pub annotation_failures: u64,
    pub refined_items: u64,
    pub refinement_rounds: u64,
    pub refinement_approved: u64,
    pub capability_calls: u64,
    pub capability_failures: u64,
    pub errors_by_category: BTreeMap<String, u64>,
    pub errors_by_stage: BTreeMap<String, u64>,
    pub stage_timings: BTreeMap<String, StageTiming>,
}

impl MetricsSummary {
    /// Share of verified candidates among all candidates checked, in percent.
    pub fn curation_success_rate(&self) -> f64 {
        percentage(self.verified, self.verified + self.rejected)
    }

    /// Share of annotated items among all items attempted, in percent.
    pub fn annotation_success_rate(&self) -> f64 {
        percentage(self.annotated, self.annotated + self.annotation_failures)
    }

    pub fn total_errors(&self) -> u64 {
        self.errors_by_category.values().sum()
    }

    /// Multi-line human readable report.
    pub fn render(&self) -> String {
        let mut out = String::new();
        out.push_str("Pipeline metrics\n");
        out.push_str(&format!(
            "  discovery:    {} mined, {} duplicates, {} download failures\n",
            self.mined, self.duplicates, self.download_failures
        ));
        out.push_str(&format!(
            "  verification: {} verified, {} rejected ({:.1}% success)\n",
            self.verified,
            self.rejected,
            self.curation_success_rate()
        ));
        out.push_str(&format!(
            "  annotation:   {} annotated, {} failed ({:.1}% success)\n",
            self.annotated,
            self.annotation_failures,
            self.annotation_success_rate()
        ));
        if self.refined_items > 0 {
            out.push_str(&format!(
                "  refinement:   {} items, {} rounds, {} approved\n",
                self.refined_items, self.refinement_rounds, self.refinement_approved
            ));
        }
        out.push_str(&format!(
            "  capability:   {} calls, {} failed\n",
            self.capability_calls, self.capability_failures
        ));
        for (stage, timing) in &self.stage_timings {
            out.push_str(&format!(
                "  {:<13} {} runs, avg {:.2}s\n",
                format!("{}:", stage),
                timing.runs,
                timing.average_secs()
            ));
        }
        if !self.errors_by_category.is_empty() {
            let errors: Vec<String> = self
                .errors_by_category
                .iter()
                .map(|(category, n)| format!("{}={}", category, n))
                .collect();
            out.push_str(&format!("  errors:       {}\n", errors.join(", ")));
        }
        out
    }
}

fn percentage(part: u64, total: u64) -> f64 {
    if total == 0 {
        0.0
    } else {
        part as f64 / total as f64 * 100.0
    }
}

/// Records run metrics into a private registry and a summary.
pub struct MetricsCollector {
    enabled: bool,
    prometheus: Option<PipelineMetrics>,
    summary: Mutex<MetricsSummary>,
}

impl std::fmt::Debug for MetricsCollector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetricsCollector")
            .field("enabled", &self.enabled)
            .field("prometheus", &self.prometheus.is_some())
            .finish()
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new(true)
    }
}

impl MetricsCollector {
    /// A disabled collector records nothing.
    pub fn new(enabled: bool) -> Self {
        let prometheus = if enabled {
            match PipelineMetrics::new() {
                Ok(metrics) => Some(metrics),
                Err(e) => {
                    tracing::warn!(error = %e, "Prometheus registry unavailable, keeping summary only");
                    None
                }
            }
        } else {
            None
        };

        Self {
            enabled,
            prometheus,
            summary: Mutex::new(MetricsSummary::default()),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    fn state(&self) -> MutexGuard<'_, MetricsSummary> {
        match self.summary.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn count_items(&self, stage: Stage, outcome: &str, n: u64) {
        if n == 0 {
            return;
        }
        if let Some(prom) = &self.prometheus {
            prom.items_total
                .with_label_values(&[stage.as_str(), outcome])
                .inc_by(n as f64);
        }
    }

    /// One vision capability attempt; `error` is `None` on success.
    pub fn record_capability_call(&self, error: Option<ErrorCategory>) {
        if !self.enabled {
            return;
        }
        let outcome = error.map(|c| c.as_str()).unwrap_or("ok");
        if let Some(prom) = &self.prometheus {
            prom.capability_calls_total.with_label_values(&[outcome]).inc();
        }
        let mut state = self.state();
        state.capability_calls += 1;
        if error.is_some() {
            state.capability_failures += 1;
        }
    }

    pub fn record_stage(&self, stage: Stage, duration: Duration) {
        if !self.enabled {
            return;
        }
        let secs = duration.as_secs_f64();
        if let Some(prom) = &self.prometheus {
            prom.stage_duration
                .with_label_values(&[stage.as_str()])
                .observe(secs);
        }
        let mut state = self.state();
        let timing = state
            .stage_timings
            .entry(stage.as_str().to_string())
            .or_default();
        timing.runs += 1;
        timing.total_secs += secs;
    }

    pub fn record_discovery(&self, accepted: usize, duplicates: usize, failed: usize) {
        if !self.enabled {
            return;
        }
        self.count_items(Stage::Discovery, "accepted", accepted as u64);
        self.count_items(Stage::Discovery, "duplicate", duplicates as u64);
        self.count_items(Stage::Discovery, "failed", failed as u64);
        let mut state = self.state();
        state.mined += accepted as u64;
        state.duplicates += duplicates as u64;
        state.download_failures += failed as u64;
    }

    pub fn record_verification(&self, accepted: usize, rejected: usize) {
        if !self.enabled {
            return;
        }
        self.count_items(Stage::Verification, "accepted", accepted as u64);
        self.count_items(Stage::Verification, "rejected", rejected as u64);
        let mut state = self.state();
        state.verified += accepted as u64;
        state.rejected += rejected as u64;
    }

    pub fn record_annotation(&self, succeeded: bool) {
        if !self.enabled {
            return;
        }
        let outcome = if succeeded { "accepted" } else { "failed" };
        self.count_items(Stage::Annotation, outcome, 1);
        let mut state = self.state();
        if succeeded {
            state.annotated += 1;
        } else {
            state.annotation_failures += 1;
        }
    }

    /// One round of the refinement loop.
    pub fn record_refinement_round(&self, verdict: Verdict) {
        if !self.enabled {
            return;
        }
        if let Some(prom) = &self.prometheus {
            prom.refinement_rounds_total
                .with_label_values(&[verdict.as_str()])
                .inc();
        }
        self.state().refinement_rounds += 1;
    }

    /// One item leaving the refinement loop.
    pub fn record_refined_item(&self, approved: bool) {
        if !self.enabled {
            return;
        }
        let mut state = self.state();
        state.refined_items += 1;
        if approved {
            state.refinement_approved += 1;
        }
    }

    pub fn record_error(&self, error: &StructuredError) {
        if !self.enabled {
            return;
        }
        if let Some(prom) = &self.prometheus {
            prom.errors_total
                .with_label_values(&[error.stage.as_str(), error.category.as_str()])
                .inc();
        }
        let mut state = self.state();
        *state
            .errors_by_category
            .entry(error.category.as_str().to_string())
            .or_insert(0) += 1;
        *state
            .errors_by_stage
            .entry(error.stage.as_str().to_string())
            .or_insert(0) += 1;
    }

    pub fn summary(&self) -> MetricsSummary {
        self.state().clone()
    }

    /// Prometheus text exposition of this run's registry.
    pub fn export_text(&self) -> String {
        match &self.prometheus {
            Some(prom) => prom.export_text(),
            None => "# Metrics disabled\n".to_string(),
        }
    }
}
