//! Curation: deciding which discovered candidates show the target concept.

pub mod verifier;

pub use verifier::{is_match, ConceptVerifier};
