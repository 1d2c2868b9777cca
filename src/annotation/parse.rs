//! Recovery of box records from model text.
//!
//! The detection capability is asked for a JSON list of
//! `{"label": ..., "bbox": [ymin, xmin, ymax, xmax]}` records but may answer
//! with fences, Python literals, prose or half-broken JSON. Recovery is
//! layered from cheapest to most invasive and stops at the first layer that
//! yields a record list:
//!
//! 1. direct parse
//! 2. fenced code block
//! 3. quote normalization and trailing-comma removal
//! 4. first balanced array substring, repaired
//! 5. coordinate quadruples and labels matched straight from the text
//!
//! Each record is then validated on its own; invalid ones are dropped and
//! counted, valid ones kept. A valid record has exactly four JSON numbers in
//! `[0, 1000]` with `ymin < ymax` and `xmin < xmax`; quoted numbers do not
//! count.

use std::sync::OnceLock;

use regex::Regex;
use serde_json::Value;

use crate::error::AnnotationError;
use crate::utils::json_extraction::{
    array_candidates, extract_code_block, normalize_quotes, remove_trailing_commas,
};

use super::types::{NormalizedBox, RegionAnnotation};

/// Keys under which a wrapper object may hold the record list.
const LIST_KEYS: [&str; 5] = ["annotations", "objects", "boxes", "detections", "results"];

/// Keys a record may use for its box.
const BOX_KEYS: [&str; 3] = ["bbox", "box_2d", "box"];

/// Which recovery layer produced the records.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RepairStage {
    Direct,
    CodeFence,
    Normalized,
    Extracted,
    Reconstructed,
}

/// Validated regions plus the number of records that failed validation.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedRegions {
    pub regions: Vec<RegionAnnotation>,
    pub dropped: usize,
    pub stage: RepairStage,
}

/// Parses `text` into validated regions.
///
/// Records without a label get `default_label`.
///
/// # Errors
///
/// `AnnotationError::Unparsable` when no layer finds any record and
/// `AnnotationError::NoValidRegions` when records were found but none
/// survived validation.
pub fn parse_regions(text: &str, default_label: &str) -> Result<ParsedRegions, AnnotationError> {
    let (records, stage) = recover_records(text).ok_or_else(|| {
        AnnotationError::Unparsable(text.chars().take(80).collect::<String>())
    })?;

    let total = records.len();
    let regions: Vec<RegionAnnotation> = records
        .iter()
        .filter_map(|record| validate_record(record, default_label))
        .collect();
    let dropped = total - regions.len();

    if regions.is_empty() {
        return Err(AnnotationError::NoValidRegions { dropped });
    }
    Ok(ParsedRegions {
        regions,
        dropped,
        stage,
    })
}

fn recover_records(text: &str) -> Option<(Vec<Value>, RepairStage)> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return None;
    }

    if let Some(records) = records_from_str(trimmed) {
        return Some((records, RepairStage::Direct));
    }

    let fenced = extract_code_block(trimmed);
    if let Some(records) = fenced.as_deref().and_then(records_from_str) {
        return Some((records, RepairStage::CodeFence));
    }

    let body = fenced.as_deref().unwrap_or(trimmed);
    let repaired = remove_trailing_commas(&normalize_quotes(body));
    if let Some(records) = records_from_str(&repaired) {
        return Some((records, RepairStage::Normalized));
    }

    // A lone quadruple inside prose is more likely a stray coordinate than a
    // record list; leave those to reconstruction so labels get paired.
    for candidate in array_candidates(body) {
        let found = record_list_from_str(candidate).or_else(|| {
            record_list_from_str(&remove_trailing_commas(&normalize_quotes(candidate)))
        });
        if let Some(records) = found {
            return Some((records, RepairStage::Extracted));
        }
    }

    reconstruct_records(body).map(|records| (records, RepairStage::Reconstructed))
}

fn records_from_str(s: &str) -> Option<Vec<Value>> {
    let value: Value = serde_json::from_str(s).ok()?;
    records_from_value(value)
}

fn record_list_from_str(s: &str) -> Option<Vec<Value>> {
    match serde_json::from_str::<Value>(s).ok()? {
        Value::Array(items) if is_quadruple(&items) => None,
        value => records_from_value(value),
    }
}

/// Accepts a list of records, a list of bare quadruples, a wrapper object
/// holding such a list, or a single record object.
fn records_from_value(value: Value) -> Option<Vec<Value>> {
    match value {
        Value::Array(items) if !items.is_empty() => {
            if is_quadruple(&items) {
                // a single bare box: [ymin, xmin, ymax, xmax]
                Some(vec![Value::Array(items)])
            } else if items.iter().all(|v| v.is_object() || v.is_array()) {
                Some(items)
            } else {
                None
            }
        }
        Value::Object(mut map) => {
            for key in LIST_KEYS {
                if let Some(Value::Array(items)) = map.remove(key) {
                    return records_from_value(Value::Array(items));
                }
            }
            if BOX_KEYS.iter().any(|k| map.contains_key(*k)) {
                Some(vec![Value::Object(map)])
            } else {
                None
            }
        }
        _ => None,
    }
}

fn is_quadruple(items: &[Value]) -> bool {
    items.len() == 4 && items.iter().all(|v| v.is_number())
}

fn validate_record(record: &Value, default_label: &str) -> Option<RegionAnnotation> {
    let (label, coords) = match record {
        Value::Array(items) => (None, items.as_slice()),
        Value::Object(map) => {
            let coords = BOX_KEYS
                .iter()
                .find_map(|k| map.get(*k))
                .and_then(Value::as_array)?;
            let label = map
                .get("label")
                .and_then(Value::as_str)
                .map(str::trim)
                .filter(|l| !l.is_empty());
            (label, coords.as_slice())
        }
        _ => return None,
    };

    if coords.len() != 4 {
        return None;
    }
    let numbers: Vec<f64> = coords.iter().map(coordinate).collect::<Option<_>>()?;
    let bbox = NormalizedBox::from_slice(&numbers)?;

    Some(RegionAnnotation::new(label.unwrap_or(default_label), bbox))
}

fn coordinate(value: &Value) -> Option<f64> {
    value.as_f64()
}

fn quad_regex() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| {
        let num = r"\s*(-?\d+(?:\.\d+)?)\s*";
        Regex::new(&format!(r"\[{num},{num},{num},{num}\]")).ok()
    })
    .as_ref()
}

fn label_regex() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r#"(?i)["']?label["']?\s*:\s*["']([^"']*)["']"#).ok())
        .as_ref()
}

/// Last resort: pairs every coordinate quadruple with the nearest label
/// that precedes it in the text, if any.
fn reconstruct_records(text: &str) -> Option<Vec<Value>> {
    let quads: Vec<(usize, Vec<f64>)> = quad_regex()?
        .captures_iter(text)
        .filter_map(|caps| {
            let start = caps.get(0)?.start();
            let quad = (1..=4)
                .map(|i| caps.get(i).and_then(|m| m.as_str().parse::<f64>().ok()))
                .collect::<Option<Vec<f64>>>()?;
            Some((start, quad))
        })
        .collect();
    if quads.is_empty() {
        return None;
    }

    // (offset, label) in text order
    let labels: Vec<(usize, String)> = label_regex()
        .map(|re| {
            re.captures_iter(text)
                .filter_map(|caps| {
                    let whole = caps.get(0)?;
                    let label = caps.get(1)?.as_str().trim().to_string();
                    Some((whole.start(), label))
                })
                .collect()
        })
        .unwrap_or_default();

    Some(
        quads
            .into_iter()
            .map(|(start, quad)| {
                let mut record = serde_json::Map::new();
                let label = labels
                    .iter()
                    .take_while(|(offset, _)| *offset < start)
                    .last()
                    .map(|(_, label)| label)
                    .filter(|l| !l.is_empty());
                if let Some(label) = label {
                    record.insert("label".to_string(), Value::String(label.clone()));
                }
                record.insert("bbox".to_string(), serde_json::json!(quad));
                Value::Object(record)
            })
            .collect(),
    )
}
