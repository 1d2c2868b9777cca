//! Candidate discovery.
//!
//! - [`search`]: the [`ImageSearch`] seam and the Google Custom Search binding
//! - [`fetch`]: the [`ImageFetcher`] seam, HTTP download, decode and keying
//! - [`miner`]: [`ImageMiner`], the discovery stage combining both with the
//!   run's duplicate index

pub mod fetch;
pub mod miner;
pub mod search;

pub use fetch::{content_key, decode_candidate, HttpImageFetcher, ImageFetcher};
pub use miner::{DiscoveryStats, ImageMiner, DEFAULT_MAX_PAGES_PER_CALL};
pub use search::{GoogleImageSearch, ImageSearch, SearchPage};
