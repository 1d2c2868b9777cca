//! Prometheus metric families for one pipeline run.
//!
//! Each run owns its own [`Registry`]; nothing is registered process-wide,
//! so two runs (or two tests) never share counters.

use prometheus::{CounterVec, Encoder, HistogramOpts, HistogramVec, Opts, Registry, TextEncoder};

/// Registered metric families.
#[derive(Clone)]
pub struct PipelineMetrics {
    registry: Registry,
    /// Items leaving a stage, labeled by stage and outcome.
    pub items_total: CounterVec,
    /// Vision capability calls, labeled by outcome (`ok` or error category).
    pub capability_calls_total: CounterVec,
    /// Classified errors, labeled by stage and category.
    pub errors_total: CounterVec,
    /// Refinement rounds, labeled by verdict.
    pub refinement_rounds_total: CounterVec,
    /// Stage wall time in seconds, labeled by stage.
    pub stage_duration: HistogramVec,
}

impl PipelineMetrics {
    /// Creates and registers every metric family.
    ///
    /// # Errors
    ///
    /// Returns a `prometheus::Error` if a metric definition is invalid.
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let items_total = CounterVec::new(
            Opts::new("foundry_items_total", "Items processed per stage"),
            &["stage", "outcome"],
        )?;

        let capability_calls_total = CounterVec::new(
            Opts::new(
                "foundry_capability_calls_total",
                "Vision capability calls by outcome",
            ),
            &["outcome"],
        )?;

        let errors_total = CounterVec::new(
            Opts::new("foundry_errors_total", "Classified errors by stage and category"),
            &["stage", "category"],
        )?;

        let refinement_rounds_total = CounterVec::new(
            Opts::new(
                "foundry_refinement_rounds_total",
                "Quality refinement rounds by verdict",
            ),
            &["verdict"],
        )?;

        let stage_duration = HistogramVec::new(
            HistogramOpts::new("foundry_stage_duration_seconds", "Stage wall time in seconds")
                .buckets(vec![0.1, 0.5, 1.0, 5.0, 15.0, 60.0, 300.0, 900.0]),
            &["stage"],
        )?;

        registry.register(Box::new(items_total.clone()))?;
        registry.register(Box::new(capability_calls_total.clone()))?;
        registry.register(Box::new(errors_total.clone()))?;
        registry.register(Box::new(refinement_rounds_total.clone()))?;
        registry.register(Box::new(stage_duration.clone()))?;

        Ok(Self {
            registry,
            items_total,
            capability_calls_total,
            errors_total,
            refinement_rounds_total,
            stage_duration,
        })
    }

    /// Encodes every family in the Prometheus text exposition format.
    pub fn export_text(&self) -> String {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();

        let mut buffer = Vec::new();
        if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
            return format!("# Error encoding metrics: {}\n", e);
        }

        String::from_utf8(buffer)
            .unwrap_or_else(|e| format!("# Error converting metrics to UTF-8: {}\n", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registries_are_independent() {
        let first = PipelineMetrics::new().expect("metrics should register");
        let second = PipelineMetrics::new().expect("a second registry should not conflict");

        first
            .items_total
            .with_label_values(&["discovery", "accepted"])
            .inc_by(3.0);

        let text = first.export_text();
        let line = text
            .lines()
            .find(|l| l.starts_with("foundry_items_total{"))
            .expect("sample line present");
        assert!(line.contains("stage=\"discovery\""));
        assert!(line.contains("outcome=\"accepted\""));
        assert!(line.ends_with(" 3"));
        assert!(!second.export_text().contains("outcome=\"accepted\""));
    }
}
