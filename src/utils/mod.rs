//! Shared utility functions for foundry.
//!
//! This module provides common utilities used across multiple modules,
//! including lenient JSON extraction from model responses.

pub mod json_extraction;

pub use json_extraction::{
    array_candidates, extract_code_block, extract_first_object, find_matching_brace,
    find_matching_bracket, normalize_quotes, parse_lenient, remove_trailing_commas, slugify,
    JsonExtractionError,
};
