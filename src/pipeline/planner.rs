//! Turns a free-form request into a dataset plan.

use std::path::PathBuf;
use std::sync::Arc;

use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::annotation::parse_objects;
use crate::llm::{InferenceRequest, VisionModel};
use crate::pipeline::config::{PipelineConfig, PipelineMode};
use crate::prompts::{build_planning_prompt, PLANNER_SYSTEM_PROMPT};
use crate::utils::parse_lenient;

/// Count used when the request names none.
pub const DEFAULT_COUNT: usize = 5;

/// What to collect, decided from a request.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DatasetPlan {
    pub mode: PipelineMode,
    pub search_query: String,
    pub annotation_objects: Vec<String>,
    pub count: usize,
    pub image_dir: Option<PathBuf>,
    pub reasoning: String,
}

impl DatasetPlan {
    /// Plan derived from the request text alone.
    ///
    /// The first integer in the request is the count; the whole request is
    /// the search query.
    pub fn heuristic(request: &str) -> Self {
        let request = request.trim();
        Self {
            mode: PipelineMode::Standard,
            search_query: request.to_string(),
            annotation_objects: parse_objects(request),
            count: first_integer(request).unwrap_or(DEFAULT_COUNT),
            image_dir: None,
            reasoning: "heuristic fallback".to_string(),
        }
    }

    /// Writes the plan into `config`, leaving explicitly set values alone.
    pub fn apply_to(&self, config: &mut PipelineConfig, keep_count: bool) {
        config.pipeline.mode = self.mode;
        if config.query().is_none() {
            config.pipeline.query = Some(self.annotation_objects.join(", "));
        }
        if config.pipeline.search_query.is_none() {
            config.pipeline.search_query = Some(self.search_query.clone());
        }
        if !keep_count {
            config.pipeline.count = self.count;
        }
        if self.mode == PipelineMode::Byod && config.pipeline.image_dir.is_none() {
            config.pipeline.image_dir = self.image_dir.clone();
        }
    }
}

fn first_integer(text: &str) -> Option<usize> {
    let re = Regex::new(r"\d+").ok()?;
    re.find(text)
        .and_then(|m| m.as_str().parse::<usize>().ok())
        .filter(|n| *n > 0)
}

/// Plan fields as the model returns them. Everything is optional.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawPlan {
    mode: Option<String>,
    search_query: Option<String>,
    annotation_objects: Vec<String>,
    count: Option<serde_json::Value>,
    image_dir: Option<String>,
    reasoning: Option<String>,
}

impl RawPlan {
    fn into_plan(self, request: &str) -> DatasetPlan {
        let fallback = DatasetPlan::heuristic(request);

        let search_query = self
            .search_query
            .map(|q| q.trim().to_string())
            .filter(|q| !q.is_empty())
            .unwrap_or(fallback.search_query);

        let mut objects: Vec<String> = Vec::new();
        for name in self.annotation_objects {
            objects.extend(parse_objects(&name));
        }
        objects.dedup_by(|a, b| a.eq_ignore_ascii_case(b));
        if objects.is_empty() {
            objects = parse_objects(&search_query);
        }

        let count = match self.count {
            Some(serde_json::Value::Number(n)) => n.as_u64().map(|n| n as usize),
            Some(serde_json::Value::String(s)) => first_integer(&s),
            _ => None,
        }
        .filter(|n| *n > 0)
        .unwrap_or(fallback.count);

        let image_dir = self
            .image_dir
            .map(|d| d.trim().to_string())
            .filter(|d| !d.is_empty())
            .map(PathBuf::from);

        let mut mode = self
            .mode
            .and_then(|m| m.parse().ok())
            .unwrap_or(PipelineMode::Standard);
        if mode == PipelineMode::Byod && image_dir.is_none() {
            mode = PipelineMode::Standard;
        }

        DatasetPlan {
            mode,
            search_query,
            annotation_objects: objects,
            count,
            image_dir,
            reasoning: self.reasoning.unwrap_or_default(),
        }
    }
}

/// Asks the text capability to plan a request.
pub struct RequestPlanner {
    model: Arc<dyn VisionModel>,
}

impl RequestPlanner {
    pub fn new(model: Arc<dyn VisionModel>) -> Self {
        Self { model }
    }

    /// Never fails: capability or parse failures fall back to
    /// [`DatasetPlan::heuristic`].
    pub async fn plan(&self, request: &str) -> DatasetPlan {
        let prompt = InferenceRequest::new(build_planning_prompt(request))
            .with_system_instruction(PLANNER_SYSTEM_PROMPT)
            .with_temperature(0.2);

        let text = match self.model.infer(prompt).await {
            Ok(text) => text,
            Err(e) => {
                warn!(error = %e, "Planner call failed, using heuristic plan");
                return DatasetPlan::heuristic(request);
            }
        };

        match parse_lenient::<RawPlan>(&text) {
            Ok(raw) => {
                let plan = raw.into_plan(request);
                info!(
                    mode = %plan.mode,
                    search_query = %plan.search_query,
                    objects = ?plan.annotation_objects,
                    count = plan.count,
                    "Request planned"
                );
                plan
            }
            Err(e) => {
                debug!(response = %text, "Unparsable plan");
                warn!(error = %e, "Planner response unparsable, using heuristic plan");
                DatasetPlan::heuristic(request)
            }
        }
    }
}
