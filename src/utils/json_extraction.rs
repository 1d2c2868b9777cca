//! JSON extraction utilities for parsing model responses.
//!
//! Model output is free text that is *supposed* to contain JSON. In practice
//! it arrives wrapped in markdown fences, with Python-style single quotes,
//! trailing commas, or surrounded by explanations. The helpers here undo
//! those one at a time so callers can layer them from cheapest to most
//! invasive.
//!
//! # Example
//!
//! ```
//! use foundry::utils::json_extraction::{normalize_quotes, remove_trailing_commas};
//!
//! let raw = "[{'label': 'dog', 'bbox': [1,2,3,4],}]";
//! let fixed = remove_trailing_commas(&normalize_quotes(raw));
//! let value: serde_json::Value = serde_json::from_str(&fixed).unwrap();
//! assert_eq!(value[0]["label"], "dog");
//! ```

use regex::Regex;
use serde::de::DeserializeOwned;
use std::sync::OnceLock;
use thiserror::Error;

/// Error type for JSON extraction failures
#[derive(Debug, Clone, Error, PartialEq)]
pub enum JsonExtractionError {
    #[error("No JSON content found in response. Content starts with: '{content_preview}'")]
    NotFound { content_preview: String },

    #[error("JSON found but could not be decoded: {0}")]
    Invalid(String),
}

impl JsonExtractionError {
    fn not_found(content: &str) -> Self {
        JsonExtractionError::NotFound {
            content_preview: content.chars().take(50).collect(),
        }
    }
}

fn fence_regex() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"```(?:[A-Za-z0-9_+-]+)?[ \t]*\r?\n?([\s\S]*?)\r?\n?```").ok())
        .as_ref()
}

fn trailing_comma_regex() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r",(\s*[}\]])").ok()).as_ref()
}

/// Finds the index of the `}` closing the first `{` in `s`.
pub fn find_matching_brace(s: &str) -> Option<usize> {
    find_matching_delimiter(s, '{', '}')
}

/// Finds the index of the `]` closing the first `[` in `s`.
pub fn find_matching_bracket(s: &str) -> Option<usize> {
    find_matching_delimiter(s, '[', ']')
}

fn find_matching_delimiter(s: &str, open: char, close: char) -> Option<usize> {
    let mut depth = 0i32;
    let mut in_string = false;
    let mut escape_next = false;

    for (i, c) in s.char_indices() {
        if escape_next {
            escape_next = false;
            continue;
        }

        match c {
            '\\' if in_string => {
                escape_next = true;
            }
            '"' => {
                in_string = !in_string;
            }
            c if c == open && !in_string => {
                depth += 1;
            }
            c if c == close && !in_string => {
                depth -= 1;
                if depth == 0 {
                    return Some(i);
                }
                if depth < 0 {
                    return None;
                }
            }
            _ => {}
        }
    }

    None
}

/// Returns the contents of the first fenced code block, any language tag.
pub fn extract_code_block(content: &str) -> Option<String> {
    let caps = fence_regex()?.captures(content)?;
    let inner = caps.get(1)?.as_str().trim();
    if inner.is_empty() {
        None
    } else {
        Some(inner.to_string())
    }
}

/// Rewrites single-quoted strings as double-quoted ones and folds typographic
/// quotes to ASCII.
///
/// Apostrophes inside double-quoted strings are left alone; double quotes
/// inside single-quoted strings are escaped.
pub fn normalize_quotes(s: &str) -> String {
    #[derive(Clone, Copy, PartialEq)]
    enum State {
        Code,
        Double,
        Single,
    }

    let mut out = String::with_capacity(s.len());
    let mut state = State::Code;
    let mut escape_next = false;

    for c in s.chars() {
        let c = match c {
            '\u{201C}' | '\u{201D}' => '"',
            '\u{2018}' | '\u{2019}' if state != State::Double => '\'',
            other => other,
        };

        if escape_next {
            escape_next = false;
            out.push(c);
            continue;
        }

        match (state, c) {
            (State::Double | State::Single, '\\') => {
                escape_next = true;
                out.push(c);
            }
            (State::Code, '"') => {
                state = State::Double;
                out.push('"');
            }
            (State::Code, '\'') => {
                state = State::Single;
                out.push('"');
            }
            (State::Double, '"') | (State::Single, '\'') => {
                state = State::Code;
                out.push('"');
            }
            (State::Single, '"') => out.push_str("\\\""),
            _ => out.push(c),
        }
    }

    out
}

/// Drops commas directly before a closing `}` or `]`.
pub fn remove_trailing_commas(s: &str) -> String {
    match trailing_comma_regex() {
        Some(re) => re.replace_all(s, "$1").into_owned(),
        None => s.to_string(),
    }
}

/// Every balanced `[...]` substring, in order of their opening bracket.
pub fn array_candidates(content: &str) -> Vec<&str> {
    content
        .char_indices()
        .filter(|(_, c)| *c == '[')
        .filter_map(|(start, _)| {
            find_matching_bracket(&content[start..]).map(|end| &content[start..=start + end])
        })
        .collect()
}

/// The first balanced `{...}` substring.
pub fn extract_first_object(content: &str) -> Option<&str> {
    let start = content.find('{')?;
    let end = find_matching_brace(&content[start..])?;
    Some(&content[start..=start + end])
}

/// Decodes a JSON value out of free text, trying progressively more
/// invasive repairs: direct parse, fenced block, quote/comma repair, then
/// the first embedded object or array.
pub fn parse_lenient<T: DeserializeOwned>(content: &str) -> Result<T, JsonExtractionError> {
    let trimmed = content.trim();
    if trimmed.is_empty() {
        return Err(JsonExtractionError::not_found(content));
    }

    if let Ok(value) = serde_json::from_str(trimmed) {
        return Ok(value);
    }

    let body = extract_code_block(trimmed).unwrap_or_else(|| trimmed.to_string());
    if let Ok(value) = serde_json::from_str(&body) {
        return Ok(value);
    }

    let repaired = remove_trailing_commas(&normalize_quotes(&body));
    if let Ok(value) = serde_json::from_str(&repaired) {
        return Ok(value);
    }

    // Repair each embedded candidate on its own so apostrophes in the
    // surrounding prose cannot open a bogus string.
    let mut last_error = None;
    let embedded = extract_first_object(&body)
        .into_iter()
        .chain(array_candidates(&body));
    for candidate in embedded {
        if let Ok(value) = serde_json::from_str(candidate) {
            return Ok(value);
        }
        match serde_json::from_str(&remove_trailing_commas(&normalize_quotes(candidate))) {
            Ok(value) => return Ok(value),
            Err(e) => last_error = Some(e.to_string()),
        }
    }

    Err(match last_error {
        Some(e) => JsonExtractionError::Invalid(e),
        None => JsonExtractionError::not_found(content),
    })
}

/// Lower-cased, underscore-separated name safe for directories.
pub fn slugify(s: &str) -> String {
    let slug: String = s
        .trim()
        .to_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect();
    let collapsed = slug
        .split('_')
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>()
        .join("_");
    if collapsed.is_empty() {
        "dataset".to_string()
    } else {
        collapsed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;

    #[test]
    fn test_find_matching_brace_nested() {
        let s = r#"{"a": {"b": "}"}} tail"#;
        assert_eq!(find_matching_brace(s), Some(16));
    }

    #[test]
    fn test_find_matching_bracket_ignores_strings() {
        let s = r#"["]", [1, 2]] extra"#;
        assert_eq!(find_matching_bracket(s), Some(12));
        assert_eq!(find_matching_bracket("[1, 2"), None);
    }

    #[test]
    fn test_extract_code_block_with_language() {
        let content = "Here you go:\n```json\n[{\"label\": \"cat\"}]\n```\nDone.";
        assert_eq!(
            extract_code_block(content).as_deref(),
            Some("[{\"label\": \"cat\"}]")
        );
    }

    #[test]
    fn test_extract_code_block_without_language() {
        let content = "```\n{\"status\": \"APPROVED\"}\n```";
        assert_eq!(
            extract_code_block(content).as_deref(),
            Some("{\"status\": \"APPROVED\"}")
        );
        assert_eq!(extract_code_block("no fences"), None);
    }

    #[test]
    fn test_normalize_quotes_single_to_double() {
        assert_eq!(
            normalize_quotes("{'label': 'dog'}"),
            "{\"label\": \"dog\"}"
        );
    }

    #[test]
    fn test_normalize_quotes_keeps_apostrophes_in_double_strings() {
        let s = r#"{"label": "person's hat"}"#;
        assert_eq!(normalize_quotes(s), s);
    }

    #[test]
    fn test_normalize_quotes_escapes_inner_double() {
        assert_eq!(normalize_quotes(r#"['a "b" c']"#), r#"["a \"b\" c"]"#);
    }

    #[test]
    fn test_normalize_smart_quotes() {
        assert_eq!(
            normalize_quotes("{\u{201C}label\u{201D}: \u{201C}dog\u{201D}}"),
            "{\"label\": \"dog\"}"
        );
    }

    #[test]
    fn test_remove_trailing_commas() {
        assert_eq!(remove_trailing_commas("[1, 2, ]"), "[1, 2 ]");
        assert_eq!(remove_trailing_commas("{\"a\": 1,\n}"), "{\"a\": 1\n}");
        assert_eq!(remove_trailing_commas("[1, 2]"), "[1, 2]");
    }

    #[test]
    fn test_array_candidates_in_prose() {
        let content = "Boxes: [[1, 2, 3, 4]] and also [5]";
        assert_eq!(array_candidates(content), vec!["[[1, 2, 3, 4]]", "[1, 2, 3, 4]", "[5]"]);
    }

    #[test]
    fn test_parse_lenient_layers() {
        let direct: Value = parse_lenient(r#"{"a": 1}"#).expect("direct");
        assert_eq!(direct["a"], 1);

        let fenced: Value = parse_lenient("```json\n{\"a\": 2}\n```").expect("fenced");
        assert_eq!(fenced["a"], 2);

        let python: Value = parse_lenient("{'a': 3,}").expect("repaired");
        assert_eq!(python["a"], 3);

        let prose: Value =
            parse_lenient("Sure! The verdict is {\"status\": \"APPROVED\"} as requested.")
                .expect("embedded");
        assert_eq!(prose["status"], "APPROVED");

        let apostrophe: Value =
            parse_lenient("Here's my verdict: {'status': 'NEEDS_IMPROVEMENT',} thanks")
                .expect("embedded python dict");
        assert_eq!(apostrophe["status"], "NEEDS_IMPROVEMENT");
    }

    #[test]
    fn test_parse_lenient_not_found() {
        let err = parse_lenient::<Value>("nothing here").expect_err("no json");
        assert!(matches!(err, JsonExtractionError::NotFound { .. }));
        assert!(parse_lenient::<Value>("   ").is_err());
    }

    #[test]
    fn test_slugify() {
        assert_eq!(slugify("Red Cars, parked!"), "red_cars_parked");
        assert_eq!(slugify("  "), "dataset");
    }
}
