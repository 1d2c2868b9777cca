//! Concept verification prompt.

/// System instruction for the curation model.
pub const CURATOR_SYSTEM_PROMPT: &str = r#"You filter candidate images for a dataset.
You will be given one image and a description of what the dataset needs.
Decide whether the image clearly contains the described object.
Answer strictly with YES or NO."#;

/// Asks whether the attached image shows `query`.
///
/// The answer is accepted when its upper-cased text contains `YES`.
pub fn build_verification_prompt(query: &str) -> String {
    format!(
        "Does this image contain {}? Answer strictly with YES or NO.",
        query.trim()
    )
}
