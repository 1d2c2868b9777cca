//! Near-duplicate rejection for discovered images.
//!
//! Search results for the same query often contain the same picture at
//! different sizes, crops or compression levels. Two pieces keep those out
//! of the dataset:
//!
//! 1. **Fingerprints** ([`phash`]) - 64-bit DCT perceptual hashes that stay
//!    stable under resizing and recompression
//! 2. **Duplicate index** ([`dedup`]) - the set of accepted fingerprints with
//!    an atomic `try_accept` gate
//!
//! # Usage
//!
//! ```rust,ignore
//! use foundry::diversity::{DuplicateIndex, Fingerprint};
//!
//! let mut index = DuplicateIndex::default();
//! let fp = Fingerprint::from_image(&image);
//! if index.try_accept(fp).is_ok() {
//!     // keep the candidate
//! }
//! ```

pub mod dedup;
pub mod phash;

pub use dedup::{DuplicateIndex, DuplicateIndexBuilder, DuplicateMatch, DEFAULT_HAMMING_THRESHOLD};
pub use phash::Fingerprint;
