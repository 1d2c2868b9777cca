//! Request planning prompt.

/// System instruction for the request planner.
pub const PLANNER_SYSTEM_PROMPT: &str = r#"You plan image dataset collection jobs.

Given a user request, decide:
- mode: "standard" to search the web for new images, or "byod" when the user points at a local folder of images
- search_query: the web search phrase that finds good candidate images
- annotation_objects: the object names to draw bounding boxes around
- count: how many images the dataset needs (default 5)
- image_dir: the local folder for byod mode, otherwise null

Respond with a single JSON object and nothing else."#;

pub fn build_planning_prompt(request: &str) -> String {
    format!(
        r#"## REQUEST

{request}

## OUTPUT

Return ONLY a JSON object:
{{"mode": "standard" or "byod", "search_query": "...", "annotation_objects": ["..."], "count": number, "image_dir": null or "path", "reasoning": "one sentence"}}"#
    )
}
