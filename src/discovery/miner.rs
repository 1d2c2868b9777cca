//! Discovery stage: search, download, deduplicate.

use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::dataset::CandidateItem;
use crate::discovery::fetch::ImageFetcher;
use crate::discovery::search::ImageSearch;
use crate::diversity::DuplicateIndex;
use crate::metrics::MetricsCollector;
use crate::pipeline::progress::ProgressCounters;
use crate::pipeline::stages::DiscoveryStage;
use crate::resilience::{ErrorClassifier, RateLimiter, Stage, StructuredError};

/// Searches per [`discover`](DiscoveryStage::discover) call by default.
pub const DEFAULT_MAX_PAGES_PER_CALL: usize = 3;

/// Counts from the most recent discovery call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DiscoveryStats {
    pub searches: usize,
    pub urls: usize,
    pub accepted: usize,
    pub duplicates: usize,
    pub failed: usize,
}

/// Pages through search results and keeps the unique, decodable images.
///
/// Owns the run's [`DuplicateIndex`] and the search cursor. The cursor only
/// moves forward, so repeated calls page through new results.
pub struct ImageMiner {
    query: String,
    search: Arc<dyn ImageSearch>,
    fetcher: Arc<dyn ImageFetcher>,
    limiter: Arc<RateLimiter>,
    index: DuplicateIndex,
    cursor: u32,
    max_pages_per_call: usize,
    last_stats: DiscoveryStats,
    metrics: Option<Arc<MetricsCollector>>,
    progress: Option<ProgressCounters>,
}

impl ImageMiner {
    pub fn new(
        query: impl Into<String>,
        search: Arc<dyn ImageSearch>,
        fetcher: Arc<dyn ImageFetcher>,
        limiter: Arc<RateLimiter>,
        index: DuplicateIndex,
    ) -> Self {
        Self {
            query: query.into(),
            search,
            fetcher,
            limiter,
            index,
            cursor: 1,
            max_pages_per_call: DEFAULT_MAX_PAGES_PER_CALL,
            last_stats: DiscoveryStats::default(),
            metrics: None,
            progress: None,
        }
    }

    pub fn with_max_pages_per_call(mut self, pages: usize) -> Self {
        self.max_pages_per_call = pages.max(1);
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<MetricsCollector>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn with_progress(mut self, progress: ProgressCounters) -> Self {
        self.progress = Some(progress);
        self
    }

    /// 1-based start index of the next search.
    pub fn cursor(&self) -> u32 {
        self.cursor
    }

    pub fn index(&self) -> &DuplicateIndex {
        &self.index
    }

    pub fn last_stats(&self) -> DiscoveryStats {
        self.last_stats
    }

    fn record_error(&self, err: &StructuredError) {
        if let Some(metrics) = &self.metrics {
            metrics.record_error(err);
        }
    }

    fn finish(&mut self, stats: DiscoveryStats) {
        self.last_stats = stats;
        if let Some(metrics) = &self.metrics {
            metrics.record_discovery(stats.accepted, stats.duplicates, stats.failed);
        }
        if let Some(progress) = &self.progress {
            progress.add_mined(stats.accepted);
        }
    }
}

#[async_trait]
impl DiscoveryStage for ImageMiner {
    async fn discover(
        &mut self,
        needed: usize,
        cancel: &CancellationToken,
    ) -> Result<Vec<CandidateItem>, StructuredError> {
        let mut accepted: Vec<CandidateItem> = Vec::new();
        let mut stats = DiscoveryStats::default();

        info!(query = %self.query, needed, start = self.cursor, "Mining images");

        while accepted.len() < needed && stats.searches < self.max_pages_per_call {
            if cancel.is_cancelled() || self.limiter.acquire(cancel).await.is_err() {
                self.finish(stats);
                return Err(StructuredError::cancelled(Stage::Discovery));
            }

            let remaining = needed - accepted.len();
            stats.searches += 1;
            let page = match self.search.search(&self.query, remaining, self.cursor).await {
                Ok(page) => page,
                Err(e) if e.is_hard() => {
                    let err = ErrorClassifier::classify(Stage::Discovery, &e)
                        .with_detail("start", self.cursor);
                    err.log();
                    self.record_error(&err);
                    self.finish(stats);
                    return Err(err);
                }
                Err(e) => {
                    let err = ErrorClassifier::classify(Stage::Discovery, &e)
                        .with_detail("start", self.cursor);
                    warn!(start = self.cursor, error = %e, "Search failed, ending this discovery pass");
                    self.record_error(&err);
                    break;
                }
            };

            let returned = page.urls.len() as u32;
            self.cursor = if page.next_start > self.cursor {
                page.next_start
            } else {
                self.cursor + returned
            };
            stats.urls += page.urls.len();

            if page.urls.is_empty() {
                debug!(start = self.cursor, "Search returned no results");
                break;
            }

            for url in page.urls {
                if accepted.len() >= needed {
                    break;
                }
                if cancel.is_cancelled() {
                    self.finish(stats);
                    return Err(StructuredError::cancelled(Stage::Discovery));
                }

                let item = match self.fetcher.fetch(&url).await {
                    Ok(item) => item,
                    Err(e) => {
                        stats.failed += 1;
                        debug!(url = %url, error = %e, "Download failed");
                        self.record_error(&ErrorClassifier::classify(Stage::Discovery, &e));
                        continue;
                    }
                };

                match self.index.try_accept(item.fingerprint) {
                    Ok(()) => {
                        debug!(item = %item.key, "Candidate accepted");
                        stats.accepted += 1;
                        accepted.push(item);
                    }
                    Err(dup) => {
                        stats.duplicates += 1;
                        debug!(
                            url = %url,
                            distance = dup.distance,
                            "Near-duplicate rejected"
                        );
                    }
                }
            }
        }

        info!(
            accepted = stats.accepted,
            duplicates = stats.duplicates,
            failed = stats.failed,
            next_start = self.cursor,
            "Mining finished"
        );
        self.finish(stats);
        Ok(accepted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diversity::{DuplicateIndexBuilder, Fingerprint};
    use crate::discovery::search::SearchPage;
    use crate::error::{FetchError, SearchError};
    use crate::llm::ImagePayload;
    use std::collections::HashMap;
    use std::sync::Mutex;

    /// Serves URLs `u{n}` from a fixed list, 1-based like the real API.
    struct ListSearch {
        total: u32,
        calls: Mutex<Vec<(usize, u32)>>,
        error: Option<fn() -> SearchError>,
    }

    impl ListSearch {
        fn new(total: u32) -> Self {
            Self {
                total,
                calls: Mutex::new(Vec::new()),
                error: None,
            }
        }
    }

    #[async_trait]
    impl ImageSearch for ListSearch {
        async fn search(
            &self,
            _query: &str,
            count: usize,
            start: u32,
        ) -> Result<SearchPage, SearchError> {
            self.calls.lock().unwrap().push((count, start));
            if let Some(error) = self.error {
                return Err(error());
            }
            let end = (start + count.min(10) as u32).min(self.total + 1);
            let urls: Vec<String> = (start..end).map(|n| format!("u{n}")).collect();
            Ok(SearchPage {
                next_start: start + urls.len() as u32,
                urls,
            })
        }
    }

    /// Maps URLs to fingerprints; unknown URLs fail to download.
    struct MapFetcher {
        prints: HashMap<String, u64>,
    }

    #[async_trait]
    impl ImageFetcher for MapFetcher {
        async fn fetch(&self, url: &str) -> Result<CandidateItem, FetchError> {
            let print = self.prints.get(url).ok_or_else(|| FetchError::Status {
                url: url.to_string(),
                status: 404,
            })?;
            Ok(CandidateItem {
                key: format!("{url}.jpg"),
                source: url.to_string(),
                image: ImagePayload::jpeg(vec![0]),
                width: 10,
                height: 10,
                fingerprint: Fingerprint(*print),
                path: None,
            })
        }
    }

    fn unauthorized() -> SearchError {
        SearchError::Unauthorized("bad key".to_string())
    }

    fn connection_reset() -> SearchError {
        SearchError::RequestFailed("reset".to_string())
    }

    /// Fingerprints far apart from each other: one distinct byte each.
    fn distinct(n: u32) -> u64 {
        0xFFu64 << ((n % 8) * 8)
    }

    fn miner(search: Arc<ListSearch>, prints: HashMap<String, u64>) -> ImageMiner {
        ImageMiner::new(
            "fox",
            search,
            Arc::new(MapFetcher { prints }),
            Arc::new(RateLimiter::new(60_000)),
            DuplicateIndexBuilder::new().threshold(5).build(),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_returns_at_most_needed_and_pages_forward() {
        let search = Arc::new(ListSearch::new(50));
        let prints = (1..=8).map(|n| (format!("u{n}"), distinct(n))).collect();
        let mut miner = miner(Arc::clone(&search), prints);
        let cancel = CancellationToken::new();

        let first = miner.discover(3, &cancel).await.expect("discover");
        assert_eq!(first.len(), 3);
        assert_eq!(miner.cursor(), 4);

        let second = miner.discover(2, &cancel).await.expect("discover");
        let keys: Vec<_> = second.iter().map(|i| i.key.as_str()).collect();
        assert_eq!(keys, vec!["u4.jpg", "u5.jpg"]);

        let calls = search.calls.lock().unwrap().clone();
        assert_eq!(calls, vec![(3, 1), (2, 4)]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_duplicates_and_failures_are_local() {
        let search = Arc::new(ListSearch::new(50));
        let mut prints: HashMap<String, u64> = HashMap::new();
        prints.insert("u1".to_string(), 0);
        prints.insert("u2".to_string(), 0b11); // distance 2 from u1
        // u3 missing -> download failure
        prints.insert("u4".to_string(), u64::MAX);
        let mut miner = miner(search, prints);

        let items = miner.discover(2, &CancellationToken::new()).await.expect("discover");
        let keys: Vec<_> = items.iter().map(|i| i.key.as_str()).collect();
        assert_eq!(keys, vec!["u1.jpg", "u4.jpg"]);

        let stats = miner.last_stats();
        assert_eq!(stats.duplicates, 1);
        assert_eq!(stats.failed, 1);
        assert_eq!(miner.index().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_search_returns_empty() {
        let search = Arc::new(ListSearch::new(0));
        let mut miner = miner(search, HashMap::new());
        let items = miner.discover(5, &CancellationToken::new()).await.expect("discover");
        assert!(items.is_empty());
        assert_eq!(miner.cursor(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_hard_search_error_is_returned() {
        let mut search = ListSearch::new(10);
        search.error = Some(unauthorized);
        let mut miner = miner(Arc::new(search), HashMap::new());

        let err = miner.discover(5, &CancellationToken::new()).await.unwrap_err();
        assert_eq!(err.stage, Stage::Discovery);
        assert!(err.is_fatal());
    }

    #[tokio::test(start_paused = true)]
    async fn test_soft_search_error_ends_pass() {
        let mut search = ListSearch::new(10);
        search.error = Some(connection_reset);
        let mut miner = miner(Arc::new(search), HashMap::new());

        let items = miner.discover(5, &CancellationToken::new()).await.expect("soft");
        assert!(items.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_page_limit_per_call() {
        let search = Arc::new(ListSearch::new(100));
        // every URL is a duplicate of the first
        let prints = (1..=100).map(|n| (format!("u{n}"), 0u64)).collect();
        let mut miner = miner(Arc::clone(&search), prints).with_max_pages_per_call(2);

        let items = miner.discover(10, &CancellationToken::new()).await.expect("discover");
        assert_eq!(items.len(), 1);
        assert_eq!(search.calls.lock().unwrap().len(), 2);
        assert_eq!(miner.cursor(), 20);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_before_search() {
        let search = Arc::new(ListSearch::new(10));
        let mut miner = miner(Arc::clone(&search), HashMap::new());
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = miner.discover(3, &cancel).await.unwrap_err();
        assert!(err.is_cancelled());
        assert!(search.calls.lock().unwrap().is_empty());
    }
}
