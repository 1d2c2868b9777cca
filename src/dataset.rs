//! Items flowing through the pipeline and the capped dataset they end in.

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::Serialize;

use crate::annotation::AnnotationResult;
use crate::diversity::Fingerprint;
use crate::llm::ImagePayload;

/// A decoded, fingerprinted image produced by discovery (or loaded from a
/// local folder in BYOD mode).
#[derive(Debug, Clone)]
pub struct CandidateItem {
    /// Stable identity: content digest plus extension.
    pub key: String,
    /// Where the image came from (URL or path).
    pub source: String,
    pub image: ImagePayload,
    pub width: u32,
    pub height: u32,
    pub fingerprint: Fingerprint,
    /// Local copy, when one was written.
    pub path: Option<PathBuf>,
}

/// Answer of the verification capability for one candidate.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VerificationVerdict {
    pub matched: bool,
    /// Raw answer text.
    pub answer: String,
}

/// A candidate that verification accepted.
#[derive(Debug, Clone)]
pub struct VerifiedItem {
    pub item: CandidateItem,
    pub verdict: VerificationVerdict,
}

impl VerifiedItem {
    pub fn key(&self) -> &str {
        &self.item.key
    }
}

impl From<VerifiedItem> for CandidateItem {
    fn from(verified: VerifiedItem) -> Self {
        verified.item
    }
}

/// What happened to a result offered to the dataset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    /// New key stored; `collected` is the size after insertion.
    Inserted { collected: usize },
    /// Key already present; content replaced, count unchanged.
    Replaced,
    /// Dataset already at target; result discarded.
    Full,
    /// Result carried no valid region and was refused.
    Rejected,
}

/// Annotated items keyed by item identity, never larger than `target`.
#[derive(Debug, Clone, Default)]
pub struct Dataset {
    target: usize,
    entries: BTreeMap<String, AnnotationResult>,
}

impl Dataset {
    pub fn new(target: usize) -> Self {
        Self {
            target,
            entries: BTreeMap::new(),
        }
    }

    /// A dataset with no cap, for BYOD runs.
    pub fn unbounded() -> Self {
        Self::new(usize::MAX)
    }

    pub fn target(&self) -> usize {
        self.target
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.entries.len() >= self.target
    }

    pub fn remaining(&self) -> usize {
        self.target.saturating_sub(self.entries.len())
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    /// Checks the cap and inserts in one step.
    ///
    /// Re-offering a key that is already stored replaces its content without
    /// changing the count, so repeated submissions are idempotent.
    pub fn offer(&mut self, result: AnnotationResult) -> MergeOutcome {
        if !result.is_valid() {
            return MergeOutcome::Rejected;
        }
        if let Some(existing) = self.entries.get_mut(&result.key) {
            *existing = result;
            return MergeOutcome::Replaced;
        }
        if self.is_full() {
            return MergeOutcome::Full;
        }
        self.entries.insert(result.key.clone(), result);
        MergeOutcome::Inserted {
            collected: self.entries.len(),
        }
    }

    pub fn get(&self, key: &str) -> Option<&AnnotationResult> {
        self.entries.get(key)
    }

    /// Entries ordered by key.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &AnnotationResult)> {
        self.entries.iter()
    }

    pub fn values(&self) -> impl Iterator<Item = &AnnotationResult> {
        self.entries.values()
    }

    pub fn into_entries(self) -> BTreeMap<String, AnnotationResult> {
        self.entries
    }

    /// Total regions across all items.
    pub fn region_count(&self) -> usize {
        self.entries.values().map(|r| r.regions.len()).sum()
    }
}
