//! Annotation review prompts.
//!
//! The reviewer answers with a verdict object:
//! `{"status": "APPROVED" | "NEEDS_IMPROVEMENT", "feedback": "...", "issues": [...]}`.

/// System instruction shared by both review methods.
pub const VALIDATOR_SYSTEM_PROMPT: &str = r#"You are a meticulous reviewer of object detection annotations.

You judge whether bounding boxes are complete, tightly fitted and free of false positives.
Be specific in your feedback: name the boxes or regions that need to change and how.
Respond with a single JSON object and nothing else."#;

const RESPONSE_FORMAT: &str = r#"Return JSON: {"status": "APPROVED" or "NEEDS_IMPROVEMENT", "feedback": "...", "issues": [...]}"#;

/// Review from the raw image plus the box list.
pub fn build_coordinate_prompt(query: &str, box_count: usize, boxes_json: &str) -> String {
    format!(
        r#"Validate these bounding box annotations for '{query}':
Number of boxes: {box_count}
Bounding boxes: {boxes_json}

Check for:
1. Completeness: Are all objects detected?
2. Accuracy: Are boxes properly fitted?
3. Correctness: No false positives?

{RESPONSE_FORMAT}"#
    )
}

/// Review from an image with the boxes drawn on it.
pub fn build_visual_prompt(query: &str, box_count: usize) -> String {
    format!(
        r#"This image shows bounding box annotations for '{query}'.
The RED BOXES show the detected objects.
Number of boxes: {box_count}

Evaluate the annotations:
1. Are all instances of the object detected?
2. Do the boxes properly cover the entire object?
3. Are there any false positives (boxes on wrong objects)?

{RESPONSE_FORMAT}"#
    )
}
