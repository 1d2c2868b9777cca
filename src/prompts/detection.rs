//! Bounding box detection prompts.
//!
//! Retries use a stricter form that spells out the schema and shows an
//! example, since the usual cause of a failed first attempt is prose or a
//! malformed array around otherwise correct boxes.

const OUTPUT_FORMAT: &str = r#"Output ONLY valid JSON with double quotes: [{"label": "object_name", "bbox": [ymin, xmin, ymax, xmax]}]. Use normalized coordinates (0-1000 range). No explanations, just JSON."#;

const STRICT_FORMAT: &str = r#"Return ONLY a JSON array of objects. Each object must have 'label' and 'bbox' keys. Format: [{"label": "object_name", "bbox": [ymin, xmin, ymax, xmax]}]. Use normalized coordinates (0-1000). Example: [{"label": "dog", "bbox": [100, 200, 300, 400]}]. Return ONLY the JSON array, no other text."#;

const REFINEMENT_FORMAT: &str = r#"Output ONLY valid JSON: [{"label": "object_name", "bbox": [ymin, xmin, ymax, xmax]}]. Use normalized coordinates (0-1000 range)."#;

fn target_phrase(objects: &[String]) -> String {
    match objects {
        [] => "the main objects".to_string(),
        [single] => single.clone(),
        many => format!("these objects: {}", many.join(", ")),
    }
}

/// Builds the detection request for `objects`.
///
/// `strict` selects the retry wording.
pub fn build_detection_prompt(objects: &[String], strict: bool) -> String {
    let target = target_phrase(objects);
    let separate = if objects.len() > 1 {
        " Detect and label each object separately."
    } else {
        ""
    };

    if strict {
        format!("Find ALL instances of {target} in this image.{separate} {STRICT_FORMAT}")
    } else {
        format!(
            "Return bounding boxes for ALL instances of {target} in this image.{separate} {OUTPUT_FORMAT}"
        )
    }
}

/// Builds a refinement round request, carrying the previous round's
/// feedback when there is any.
pub fn build_refinement_prompt(query: &str, feedback: Option<&str>) -> String {
    match feedback.map(str::trim).filter(|f| !f.is_empty()) {
        Some(feedback) => format!(
            "Annotate ALL instances of '{query}' in this image. Previous feedback: {feedback} \
             Improve the annotations based on this feedback. {REFINEMENT_FORMAT}"
        ),
        None => format!("Annotate ALL instances of '{query}' in this image. {REFINEMENT_FORMAT}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn objects(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_single_object_prompt() {
        let prompt = build_detection_prompt(&objects(&["dog"]), false);
        assert!(prompt.starts_with("Return bounding boxes for ALL instances of dog"));
        assert!(prompt.contains("0-1000"));
        assert!(!prompt.contains("separately"));
    }

    #[test]
    fn test_multi_object_prompt() {
        let prompt = build_detection_prompt(&objects(&["dog", "cat"]), false);
        assert!(prompt.contains("these objects: dog, cat"));
        assert!(prompt.contains("Detect and label each object separately."));
    }

    #[test]
    fn test_strict_prompt_has_example() {
        let prompt = build_detection_prompt(&objects(&["car"]), true);
        assert!(prompt.starts_with("Find ALL instances of car"));
        assert!(prompt.contains("Example:"));
        assert!(prompt.contains("Return ONLY the JSON array"));
    }

    #[test]
    fn test_refinement_prompt_feedback() {
        let first = build_refinement_prompt("dog", None);
        assert!(!first.contains("Previous feedback"));

        let blank = build_refinement_prompt("dog", Some("   "));
        assert_eq!(blank, first);

        let next = build_refinement_prompt("dog", Some("Box 2 is too loose"));
        assert!(next.contains("Previous feedback: Box 2 is too loose"));
        assert!(next.contains("Improve the annotations"));
    }
}
