//! Pipeline configuration.
//!
//! Values are layered: built-in defaults, then an optional YAML file, then
//! `FOUNDRY_*` environment variables, then CLI flags (applied by the CLI).
//! Every section is `#[serde(default)]`, so a file only needs the keys it
//! changes.
//!
//! ```yaml
//! pipeline:
//!   query: "dog, cat"
//!   count: 20
//! quality_loop:
//!   enabled: true
//!   validation_method: hybrid
//! rate_limit:
//!   tier: paid
//! ```

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::annotation::{parse_objects, AnnotationPoolConfig};
use crate::quality::{RefinementConfig, RetentionPolicy, ValidationMethod};
use crate::resilience::{Classify, ErrorCategory, RateTier};

/// Errors that can occur during configuration operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A required environment variable is missing.
    #[error("Missing environment variable: {0}")]
    MissingEnvVar(String),

    /// A value could not be parsed.
    #[error("Invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    /// Configuration validation failed.
    #[error("Configuration validation failed: {0}")]
    ValidationFailed(String),

    /// The YAML file could not be parsed.
    #[error("Invalid YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// IO error while reading configuration.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Classify for ConfigError {
    fn category(&self) -> ErrorCategory {
        match self {
            ConfigError::Io(_) => ErrorCategory::Filesystem,
            _ => ErrorCategory::Configuration,
        }
    }
}

/// How items enter the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineMode {
    /// Discover, verify, annotate, repeated until the target is reached.
    #[default]
    Standard,
    /// Annotate the images of a local folder.
    Byod,
}

impl fmt::Display for PipelineMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PipelineMode::Standard => f.write_str("standard"),
            PipelineMode::Byod => f.write_str("byod"),
        }
    }
}

impl FromStr for PipelineMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "standard" => Ok(PipelineMode::Standard),
            "byod" => Ok(PipelineMode::Byod),
            other => Err(format!("unknown mode '{}', expected standard or byod", other)),
        }
    }
}

/// What to collect and where to put it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineSection {
    /// Objects to annotate, comma-separated.
    pub query: Option<String>,
    /// Search phrase; falls back to `query`.
    pub search_query: Option<String>,
    /// Free-form request handed to the planner.
    pub request: Option<String>,
    /// Exact number of items wanted.
    pub count: usize,
    pub mode: PipelineMode,
    /// Source folder for BYOD runs.
    pub image_dir: Option<PathBuf>,
    pub output_dir: PathBuf,
    /// Where raw downloads go when `discovery.save_raw` is set.
    pub raw_dir: PathBuf,
}

impl Default for PipelineSection {
    fn default() -> Self {
        Self {
            query: None,
            search_query: None,
            request: None,
            count: 5,
            mode: PipelineMode::Standard,
            image_dir: None,
            output_dir: PathBuf::from("data/output"),
            raw_dir: PathBuf::from("data/raw"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QualityLoopSection {
    pub enabled: bool,
    pub max_iterations: u32,
    pub validation_method: ValidationMethod,
    pub retention: RetentionPolicy,
}

impl Default for QualityLoopSection {
    fn default() -> Self {
        let defaults = RefinementConfig::default();
        Self {
            enabled: false,
            max_iterations: defaults.max_iterations,
            validation_method: ValidationMethod::Coordinate,
            retention: defaults.retention,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnnotationSection {
    pub num_workers: usize,
    pub max_attempts: u32,
    /// Base of the linear per-item backoff.
    pub backoff_secs: u64,
    pub attempt_timeout_secs: u64,
}

impl Default for AnnotationSection {
    fn default() -> Self {
        let defaults = AnnotationPoolConfig::default();
        Self {
            num_workers: defaults.num_workers,
            max_attempts: defaults.max_attempts,
            backoff_secs: defaults.backoff_base.as_secs(),
            attempt_timeout_secs: defaults.attempt_timeout.as_secs(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitSection {
    pub tier: RateTier,
    /// Overrides the tier's rate.
    pub requests_per_minute: Option<u32>,
}

impl RateLimitSection {
    pub fn requests_per_minute(&self) -> u32 {
        self.requests_per_minute
            .unwrap_or_else(|| self.tier.requests_per_minute())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoverySection {
    /// Candidates closer than this many bits to an accepted one are dropped.
    pub dedup_threshold: u32,
    pub max_pages_per_call: usize,
    /// Base wait after an empty discovery, multiplied by the streak length.
    pub empty_backoff_secs: u64,
    pub save_raw: bool,
}

impl Default for DiscoverySection {
    fn default() -> Self {
        Self {
            dedup_threshold: 5,
            max_pages_per_call: 3,
            empty_backoff_secs: 2,
            save_raw: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsSection {
    pub enabled: bool,
    /// Print the summary at the end of the run.
    pub show_summary: bool,
}

impl Default for MetricsSection {
    fn default() -> Self {
        Self {
            enabled: true,
            show_summary: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdvancedSection {
    /// Safety bound on controller iterations.
    pub max_pipeline_loops: u32,
    pub log_level: String,
    /// Seconds between progress lines; 0 disables them.
    pub progress_interval_secs: u64,
}

impl Default for AdvancedSection {
    fn default() -> Self {
        Self {
            max_pipeline_loops: 5,
            log_level: "info".to_string(),
            progress_interval_secs: 30,
        }
    }
}

/// Complete run configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub pipeline: PipelineSection,
    pub quality_loop: QualityLoopSection,
    pub annotation: AnnotationSection,
    pub rate_limit: RateLimitSection,
    pub discovery: DiscoverySection,
    pub metrics: MetricsSection,
    pub advanced: AdvancedSection,
}

impl PipelineConfig {
    /// Creates a new configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses a YAML document; missing keys keep their defaults.
    pub fn from_yaml_str(text: &str) -> Result<Self, ConfigError> {
        if text.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_str(text)?)
    }

    /// Reads a YAML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path.as_ref())?;
        Self::from_yaml_str(&text)
    }

    /// Defaults or `path`, then the process environment.
    ///
    /// A missing file is not an error: the defaults are used and a warning
    /// is logged.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) if path.exists() => {
                let config = Self::from_file(path)?;
                tracing::info!(path = %path.display(), "Loaded configuration");
                config
            }
            Some(path) => {
                tracing::warn!(path = %path.display(), "Config file not found, using defaults");
                Self::default()
            }
            None => Self::default(),
        };
        config.apply_env_overrides()?;
        Ok(config)
    }

    /// Applies overrides from the process environment.
    ///
    /// # Environment Variables
    ///
    /// - `FOUNDRY_COUNT`: target item count
    /// - `FOUNDRY_WORKERS`: annotation pool width
    /// - `FOUNDRY_TIER`: `free` or `paid`
    /// - `FOUNDRY_MAX_LOOPS`: controller iteration bound
    /// - `FOUNDRY_QUALITY_LOOP`: enable the refinement loop
    pub fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        self.apply_overrides_from(|key| std::env::var(key).ok())
    }

    /// Same as [`apply_env_overrides`](Self::apply_env_overrides) with an
    /// explicit variable source.
    pub fn apply_overrides_from<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(val) = lookup("FOUNDRY_COUNT") {
            self.pipeline.count = parse_env_value(&val, "FOUNDRY_COUNT")?;
        }
        if let Some(val) = lookup("FOUNDRY_WORKERS") {
            self.annotation.num_workers = parse_env_value(&val, "FOUNDRY_WORKERS")?;
        }
        if let Some(val) = lookup("FOUNDRY_TIER") {
            self.rate_limit.tier = val.parse().map_err(|message| ConfigError::InvalidValue {
                key: "FOUNDRY_TIER".to_string(),
                message,
            })?;
        }
        if let Some(val) = lookup("FOUNDRY_MAX_LOOPS") {
            self.advanced.max_pipeline_loops = parse_env_value(&val, "FOUNDRY_MAX_LOOPS")?;
        }
        if let Some(val) = lookup("FOUNDRY_QUALITY_LOOP") {
            self.quality_loop.enabled = parse_env_bool(&val, "FOUNDRY_QUALITY_LOOP")?;
        }
        Ok(())
    }

    /// Validates the configuration values.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationFailed` naming the first bad key.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let fail = |msg: &str| Err(ConfigError::ValidationFailed(msg.to_string()));

        if self.pipeline.count == 0 {
            return fail("pipeline.count must be greater than 0");
        }
        match self.pipeline.mode {
            PipelineMode::Standard => {
                if self.query().is_none() && self.pipeline.request.is_none() {
                    return fail("pipeline.query is required in standard mode");
                }
            }
            PipelineMode::Byod => {
                if self.pipeline.image_dir.is_none() {
                    return fail("pipeline.image_dir is required in byod mode");
                }
                if self.query().is_none() {
                    return fail("pipeline.query is required in byod mode");
                }
            }
        }

        if self.quality_loop.max_iterations == 0 || self.quality_loop.max_iterations > 10 {
            return fail("quality_loop.max_iterations must be between 1 and 10");
        }

        if self.annotation.num_workers == 0 || self.annotation.num_workers > 64 {
            return fail("annotation.num_workers must be between 1 and 64");
        }
        if self.annotation.max_attempts == 0 {
            return fail("annotation.max_attempts must be greater than 0");
        }
        if self.annotation.attempt_timeout_secs == 0 {
            return fail("annotation.attempt_timeout_secs must be greater than 0");
        }

        if self.rate_limit.requests_per_minute == Some(0) {
            return fail("rate_limit.requests_per_minute must be greater than 0");
        }

        if self.discovery.dedup_threshold > 64 {
            return fail("discovery.dedup_threshold must be at most 64");
        }
        if self.discovery.max_pages_per_call == 0 {
            return fail("discovery.max_pages_per_call must be greater than 0");
        }

        if self.advanced.max_pipeline_loops == 0 {
            return fail("advanced.max_pipeline_loops must be greater than 0");
        }

        Ok(())
    }

    /// Trimmed annotation query, if set.
    pub fn query(&self) -> Option<&str> {
        self.pipeline
            .query
            .as_deref()
            .map(str::trim)
            .filter(|q| !q.is_empty())
    }

    /// Search phrase, falling back to the annotation query.
    pub fn search_query(&self) -> Option<&str> {
        self.pipeline
            .search_query
            .as_deref()
            .map(str::trim)
            .filter(|q| !q.is_empty())
            .or_else(|| self.query())
    }

    /// Object names parsed from the query.
    pub fn objects(&self) -> Vec<String> {
        self.query().map(parse_objects).unwrap_or_default()
    }

    pub fn pool_config(&self) -> AnnotationPoolConfig {
        AnnotationPoolConfig::new(self.annotation.num_workers)
            .with_max_attempts(self.annotation.max_attempts)
            .with_backoff_base(Duration::from_secs(self.annotation.backoff_secs))
            .with_attempt_timeout(Duration::from_secs(self.annotation.attempt_timeout_secs))
    }

    pub fn refinement_config(&self) -> RefinementConfig {
        RefinementConfig {
            max_iterations: self.quality_loop.max_iterations,
            retention: self.quality_loop.retention,
        }
    }

    pub fn empty_backoff(&self) -> Duration {
        Duration::from_secs(self.discovery.empty_backoff_secs)
    }

    /// Builder method to set the query.
    pub fn with_query(mut self, query: impl Into<String>) -> Self {
        self.pipeline.query = Some(query.into());
        self
    }

    /// Builder method to set the target count.
    pub fn with_count(mut self, count: usize) -> Self {
        self.pipeline.count = count;
        self
    }

    /// Builder method to set the pool width.
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.annotation.num_workers = workers;
        self
    }

    /// Builder method to switch to BYOD mode on `dir`.
    pub fn with_image_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.pipeline.mode = PipelineMode::Byod;
        self.pipeline.image_dir = Some(dir.into());
        self
    }

    /// Builder method to enable the quality loop.
    pub fn with_quality_loop(mut self, method: ValidationMethod, iterations: u32) -> Self {
        self.quality_loop.enabled = true;
        self.quality_loop.validation_method = method;
        self.quality_loop.max_iterations = iterations;
        self
    }
}

/// Parse an environment variable value into a type.
fn parse_env_value<T: FromStr>(value: &str, key: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        message: format!("could not parse '{}'", value),
    })
}

/// Parse an environment variable as a boolean.
fn parse_env_bool(value: &str, key: &str) -> Result<bool, ConfigError> {
    match value.trim().to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("expected boolean value, got '{}'", value),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn valid() -> PipelineConfig {
        PipelineConfig::new().with_query("dog")
    }

    #[test]
    fn test_default_config() {
        let config = PipelineConfig::default();
        assert_eq!(config.pipeline.count, 5);
        assert_eq!(config.pipeline.mode, PipelineMode::Standard);
        assert!(!config.quality_loop.enabled);
        assert_eq!(config.annotation.num_workers, 3);
        assert_eq!(config.annotation.max_attempts, 3);
        assert_eq!(config.rate_limit.requests_per_minute(), 15);
        assert_eq!(config.discovery.dedup_threshold, 5);
        assert_eq!(config.advanced.max_pipeline_loops, 5);
        assert!(config.metrics.enabled);
    }

    #[test]
    fn test_partial_yaml_keeps_defaults() {
        let yaml = r#"
pipeline:
  query: "dog, cat"
  count: 12
quality_loop:
  enabled: true
  validation_method: hybrid
  retention: best_verdict
rate_limit:
  tier: paid
"#;
        let config = PipelineConfig::from_yaml_str(yaml).expect("parse");
        assert_eq!(config.pipeline.count, 12);
        assert_eq!(config.objects(), vec!["dog".to_string(), "cat".to_string()]);
        assert!(config.quality_loop.enabled);
        assert_eq!(config.quality_loop.validation_method, ValidationMethod::Hybrid);
        assert_eq!(config.quality_loop.retention, RetentionPolicy::BestVerdict);
        assert_eq!(config.rate_limit.requests_per_minute(), 1000);
        // untouched sections
        assert_eq!(config.annotation.num_workers, 3);
        assert_eq!(config.pipeline.output_dir, PathBuf::from("data/output"));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_empty_yaml_is_default() {
        assert_eq!(
            PipelineConfig::from_yaml_str("  \n").expect("empty"),
            PipelineConfig::default()
        );
    }

    #[test]
    fn test_bad_yaml_value() {
        let err = PipelineConfig::from_yaml_str("pipeline:\n  count: many\n").unwrap_err();
        assert!(matches!(err, ConfigError::Yaml(_)));
        assert_eq!(err.category(), ErrorCategory::Configuration);
    }

    #[test]
    fn test_from_file_and_missing_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("foundry.yaml");
        std::fs::write(&path, "pipeline:\n  count: 7\n").expect("write");
        assert_eq!(PipelineConfig::from_file(&path).expect("file").pipeline.count, 7);

        let err = PipelineConfig::from_file(dir.path().join("missing.yaml")).unwrap_err();
        assert!(matches!(err, ConfigError::Io(_)));
    }

    #[test]
    fn test_env_overrides() {
        let vars: HashMap<&str, &str> = [
            ("FOUNDRY_COUNT", "9"),
            ("FOUNDRY_WORKERS", "6"),
            ("FOUNDRY_TIER", "PAID"),
            ("FOUNDRY_MAX_LOOPS", "12"),
            ("FOUNDRY_QUALITY_LOOP", "yes"),
        ]
        .into_iter()
        .collect();

        let mut config = valid();
        config
            .apply_overrides_from(|k| vars.get(k).map(|v| v.to_string()))
            .expect("overrides");

        assert_eq!(config.pipeline.count, 9);
        assert_eq!(config.annotation.num_workers, 6);
        assert_eq!(config.rate_limit.tier, RateTier::Paid);
        assert_eq!(config.advanced.max_pipeline_loops, 12);
        assert!(config.quality_loop.enabled);
    }

    #[test]
    fn test_env_override_rejects_garbage() {
        let mut config = valid();
        let err = config
            .apply_overrides_from(|k| (k == "FOUNDRY_COUNT").then(|| "lots".to_string()))
            .unwrap_err();
        assert!(err.to_string().contains("FOUNDRY_COUNT"));

        let err = config
            .apply_overrides_from(|k| (k == "FOUNDRY_TIER").then(|| "gold".to_string()))
            .unwrap_err();
        assert!(err.to_string().contains("gold"));
    }

    #[test]
    fn test_validation_rejects_zero_values() {
        let cases: Vec<(PipelineConfig, &str)> = vec![
            (valid().with_count(0), "pipeline.count"),
            (valid().with_workers(0), "annotation.num_workers"),
            (
                valid().with_quality_loop(ValidationMethod::Visual, 0),
                "quality_loop.max_iterations",
            ),
            (
                {
                    let mut c = valid();
                    c.advanced.max_pipeline_loops = 0;
                    c
                },
                "advanced.max_pipeline_loops",
            ),
            (
                {
                    let mut c = valid();
                    c.rate_limit.requests_per_minute = Some(0);
                    c
                },
                "rate_limit.requests_per_minute",
            ),
            (
                {
                    let mut c = valid();
                    c.discovery.dedup_threshold = 65;
                    c
                },
                "discovery.dedup_threshold",
            ),
        ];

        for (config, key) in cases {
            let err = config.validate().unwrap_err();
            assert!(err.to_string().contains(key), "{} not in {}", key, err);
        }
    }

    #[test]
    fn test_validation_mode_requirements() {
        let err = PipelineConfig::new().validate().unwrap_err();
        assert!(err.to_string().contains("pipeline.query"));

        let mut planned = PipelineConfig::new();
        planned.pipeline.request = Some("20 photos of foxes".to_string());
        assert!(planned.validate().is_ok());

        let mut byod = valid();
        byod.pipeline.mode = PipelineMode::Byod;
        assert!(byod.validate().unwrap_err().to_string().contains("image_dir"));
        assert!(valid().with_image_dir("/tmp/imgs").validate().is_ok());
    }

    #[test]
    fn test_search_query_falls_back_to_query() {
        let mut config = valid();
        assert_eq!(config.search_query(), Some("dog"));
        config.pipeline.search_query = Some("  dogs in the park ".to_string());
        assert_eq!(config.search_query(), Some("dogs in the park"));
        assert_eq!(config.query(), Some("dog"));
    }

    #[test]
    fn test_derived_configs() {
        let mut config = valid();
        config.annotation.backoff_secs = 2;
        config.quality_loop.retention = RetentionPolicy::BestVerdict;

        let pool = config.pool_config();
        assert_eq!(pool.num_workers, 3);
        assert_eq!(pool.backoff_base, Duration::from_secs(2));

        let refinement = config.refinement_config();
        assert_eq!(refinement.retention, RetentionPolicy::BestVerdict);
    }

    #[test]
    fn test_parse_env_bool() {
        assert!(parse_env_bool("TRUE", "test").unwrap());
        assert!(parse_env_bool("on", "test").unwrap());
        assert!(!parse_env_bool("0", "test").unwrap());
        assert!(parse_env_bool("maybe", "test").is_err());
    }
}
