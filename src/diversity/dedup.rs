//! Duplicate index over accepted fingerprints.
//!
//! A candidate is a near-duplicate when its Hamming distance to any accepted
//! fingerprint is strictly below the threshold. Lookup is a linear scan,
//! which is fine for the tens to low hundreds of items a run collects and
//! would need an index structure (BK-tree, multi-index hashing) at thousands.

use super::phash::Fingerprint;

/// Default Hamming threshold below which two fingerprints are duplicates.
pub const DEFAULT_HAMMING_THRESHOLD: u32 = 5;

/// Why [`DuplicateIndex::try_accept`] rejected a fingerprint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DuplicateMatch {
    /// The accepted fingerprint that was too close.
    pub existing: Fingerprint,
    /// Distance between the two.
    pub distance: u32,
}

/// Fingerprints of every accepted item in a run.
///
/// Owned exclusively by the discovery stage. [`try_accept`](Self::try_accept)
/// combines the lookup and the insert behind one `&mut self` borrow so the
/// invariant "no two accepted fingerprints are closer than the threshold"
/// holds even if the index is later shared behind a lock.
#[derive(Debug, Clone)]
pub struct DuplicateIndex {
    threshold: u32,
    accepted: Vec<Fingerprint>,
    rejected: usize,
}

impl Default for DuplicateIndex {
    fn default() -> Self {
        Self::new(DEFAULT_HAMMING_THRESHOLD)
    }
}

impl DuplicateIndex {
    /// Creates an empty index.
    ///
    /// # Arguments
    ///
    /// * `threshold` - Distances strictly below this are duplicates.
    pub fn new(threshold: u32) -> Self {
        Self {
            threshold,
            accepted: Vec::new(),
            rejected: 0,
        }
    }

    pub fn threshold(&self) -> u32 {
        self.threshold
    }

    pub fn len(&self) -> usize {
        self.accepted.len()
    }

    pub fn is_empty(&self) -> bool {
        self.accepted.is_empty()
    }

    /// Number of candidates turned away so far.
    pub fn rejected(&self) -> usize {
        self.rejected
    }

    /// Closest accepted fingerprint within the threshold, if any.
    pub fn find_duplicate(&self, fingerprint: &Fingerprint) -> Option<DuplicateMatch> {
        self.accepted
            .iter()
            .map(|existing| DuplicateMatch {
                existing: *existing,
                distance: existing.hamming(fingerprint),
            })
            .filter(|m| m.distance < self.threshold)
            .min_by_key(|m| m.distance)
    }

    pub fn is_duplicate(&self, fingerprint: &Fingerprint) -> bool {
        self.find_duplicate(fingerprint).is_some()
    }

    /// Checks and inserts in one step.
    pub fn try_accept(&mut self, fingerprint: Fingerprint) -> Result<(), DuplicateMatch> {
        if let Some(found) = self.find_duplicate(&fingerprint) {
            self.rejected += 1;
            return Err(found);
        }
        self.accepted.push(fingerprint);
        Ok(())
    }

    /// Fraction of offered candidates that were rejected.
    pub fn rejection_rate(&self) -> f64 {
        let offered = self.accepted.len() + self.rejected;
        if offered == 0 {
            return 0.0;
        }
        self.rejected as f64 / offered as f64
    }

    pub fn fingerprints(&self) -> &[Fingerprint] {
        &self.accepted
    }
}

/// Builder for [`DuplicateIndex`].
#[derive(Debug, Clone)]
pub struct DuplicateIndexBuilder {
    threshold: u32,
    seed: Vec<Fingerprint>,
}

impl Default for DuplicateIndexBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl DuplicateIndexBuilder {
    pub fn new() -> Self {
        Self {
            threshold: DEFAULT_HAMMING_THRESHOLD,
            seed: Vec::new(),
        }
    }

    pub fn threshold(mut self, threshold: u32) -> Self {
        self.threshold = threshold;
        self
    }

    /// Pre-loads fingerprints of items that already exist (for example a
    /// local folder the new images must not repeat). Seeds that collide
    /// with earlier seeds are skipped.
    pub fn seed(mut self, fingerprints: impl IntoIterator<Item = Fingerprint>) -> Self {
        self.seed.extend(fingerprints);
        self
    }

    pub fn build(self) -> DuplicateIndex {
        let mut index = DuplicateIndex::new(self.threshold);
        for fp in self.seed {
            let _ = index.try_accept(fp);
        }
        index.rejected = 0;
        index
    }
}
