//! End-to-end pipeline scenarios driven through the public API with
//! scripted collaborators.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use foundry::annotation::{
    parse_regions, AnnotationPoolConfig, AnnotationTask, AnnotationWorkerPool, DetectionAnnotator,
    NormalizedBox,
};
use foundry::curation::ConceptVerifier;
use foundry::dataset::{CandidateItem, Dataset};
use foundry::diversity::{DuplicateIndex, Fingerprint};
use foundry::llm::{ImagePayload, InferenceRequest, VisionModel};
use foundry::pipeline::{
    ControllerSettings, DiscoveryStage, PipelineController, PoolAnnotationStage, RunStatus,
};
use foundry::quality::{
    QualityRefinementLoop, QualityValidator, RefinementConfig, RetentionPolicy, ValidationMethod,
    Verdict,
};
use foundry::resilience::{RateLimiter, StructuredError};
use foundry::utils::parse_lenient;
use foundry::CapabilityError;

// ============================================================================
// Collaborators
// ============================================================================

fn candidate(n: u8) -> CandidateItem {
    CandidateItem {
        key: format!("img{n:03}.jpg"),
        source: format!("https://img.test/{n}"),
        image: ImagePayload::jpeg(vec![n]),
        width: 200,
        height: 100,
        fingerprint: Fingerprint(u64::from(n)),
        path: None,
    }
}

/// Returns scripted batches; item tags keep counting across calls.
struct BatchDiscovery {
    batches: VecDeque<usize>,
    next: u8,
    requested: Arc<Mutex<Vec<usize>>>,
}

impl BatchDiscovery {
    fn new(batches: &[usize]) -> (Self, Arc<Mutex<Vec<usize>>>) {
        let requested = Arc::new(Mutex::new(Vec::new()));
        (
            Self {
                batches: batches.iter().copied().collect(),
                next: 0,
                requested: Arc::clone(&requested),
            },
            requested,
        )
    }
}

#[async_trait]
impl DiscoveryStage for BatchDiscovery {
    async fn discover(
        &mut self,
        needed: usize,
        _cancel: &CancellationToken,
    ) -> Result<Vec<CandidateItem>, StructuredError> {
        self.requested.lock().unwrap().push(needed);
        let n = self.batches.pop_front().unwrap_or(0);
        let items = (0..n).map(|i| candidate(self.next + i as u8)).collect();
        self.next += n as u8;
        Ok(items)
    }
}

/// Verification says YES for even image tags; detection returns one box.
/// Tracks how many detection calls are in flight at once.
#[derive(Default)]
struct EvenModel {
    in_flight: AtomicUsize,
    peak: AtomicUsize,
    delay: Duration,
}

#[async_trait]
impl VisionModel for EvenModel {
    async fn infer(&self, request: InferenceRequest) -> Result<String, CapabilityError> {
        let tag = request.image.as_ref().map(|i| i.bytes[0]).unwrap_or(0);
        if request.prompt.contains("YES or NO") {
            return Ok(if tag % 2 == 0 { "YES" } else { "NO" }.to_string());
        }

        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        Ok(format!(
            r#"[{{"label": "dog", "box_2d": [{}, 100, 900, 800]}}]"#,
            u32::from(tag) * 2
        ))
    }
}

fn pool(model: Arc<dyn VisionModel>, width: usize) -> AnnotationWorkerPool {
    let config = AnnotationPoolConfig::new(width).with_backoff_base(Duration::from_millis(1));
    AnnotationWorkerPool::new(config, Arc::new(DetectionAnnotator::new(model)))
}

fn objects() -> Vec<String> {
    vec!["dog".to_string()]
}

// ============================================================================
// Controller scenarios
// ============================================================================

#[tokio::test]
async fn test_target_reached_in_two_iterations() {
    let model = Arc::new(EvenModel::default());
    let (discovery, requested) = BatchDiscovery::new(&[8, 2]);
    let verifier = ConceptVerifier::new(model.clone(), "dog");
    let annotation = PoolAnnotationStage::new(pool(model.clone(), 3), objects());

    let mut controller = PipelineController::new(
        ControllerSettings::new(5).with_max_iterations(10),
        Box::new(discovery),
        Box::new(verifier),
        Box::new(annotation),
    );
    let outcome = controller.run(&CancellationToken::new()).await;

    // iteration 1: tags 0..8, evens 0,2,4,6 verified; iteration 2: tags 8,9
    assert_eq!(outcome.status, RunStatus::Done);
    assert_eq!(outcome.iterations, 2);
    assert_eq!(outcome.collected, 5);
    assert_eq!(*requested.lock().unwrap(), vec![5, 1]);
    assert_eq!(outcome.totals.mined, 10);
    assert_eq!(outcome.totals.curated, 5);
    assert_eq!(outcome.totals.annotated, 5);
    assert!(outcome.dataset.contains("img008.jpg"));
}

#[tokio::test(start_paused = true)]
async fn test_two_empty_discoveries_end_failed_empty() {
    let model = Arc::new(EvenModel::default());
    let (discovery, requested) = BatchDiscovery::new(&[0, 0, 8]);
    let mut controller = PipelineController::new(
        ControllerSettings::new(5).with_empty_backoff(Duration::from_secs(2)),
        Box::new(discovery),
        Box::new(ConceptVerifier::new(model.clone(), "dog")),
        Box::new(PoolAnnotationStage::new(pool(model, 3), objects())),
    );

    let outcome = controller.run(&CancellationToken::new()).await;
    assert_eq!(outcome.status, RunStatus::FailedEmpty);
    assert_eq!(outcome.collected, 0);
    assert_eq!(requested.lock().unwrap().len(), 2);
    assert!(outcome.dataset.is_empty());
}

#[tokio::test]
async fn test_dataset_never_exceeds_target() {
    let model = Arc::new(EvenModel::default());
    // six of the twelve tags pass verification; the cap keeps three
    let (discovery, _) = BatchDiscovery::new(&[12]);
    let verifier = ConceptVerifier::new(model.clone(), "dog");
    let mut controller = PipelineController::new(
        ControllerSettings::new(3),
        Box::new(discovery),
        Box::new(verifier),
        Box::new(PoolAnnotationStage::new(pool(model, 3), objects())),
    );

    let outcome = controller.run(&CancellationToken::new()).await;
    assert_eq!(outcome.status, RunStatus::Done);
    assert_eq!(outcome.dataset.len(), 3);
    assert_eq!(outcome.totals.curated, 3);
}

// ============================================================================
// Worker pool
// ============================================================================

#[tokio::test]
async fn test_pool_annotates_six_items_with_width_three() {
    let model = Arc::new(EvenModel {
        delay: Duration::from_millis(30),
        ..Default::default()
    });
    let pool = pool(model.clone(), 3);
    let items: Vec<CandidateItem> = (0..6).map(candidate).collect();

    let outcome = pool
        .annotate_all(items, &objects(), &CancellationToken::new())
        .await;

    assert_eq!(outcome.results.len(), 6);
    assert!(outcome.failed.is_empty());
    assert!(model.peak.load(Ordering::SeqCst) <= 3);
    for n in 0..6u8 {
        let result = &outcome.results[&format!("img{n:03}.jpg")];
        assert_eq!(result.regions.len(), 1);
        assert_eq!(result.regions[0].bbox.ymin, f64::from(n) * 2.0);
    }
}

#[tokio::test]
async fn test_concurrent_merge_stops_at_cap() {
    let model = Arc::new(EvenModel {
        delay: Duration::from_millis(5),
        ..Default::default()
    });
    let pool = pool(model, 4);
    let mut dataset = Dataset::new(2);

    let outcome = pool
        .annotate_into(
            (0..8).map(candidate).collect(),
            &objects(),
            &mut dataset,
            &CancellationToken::new(),
        )
        .await;

    assert_eq!(dataset.len(), 2);
    assert_eq!(outcome.merged, 2);
    assert!(!outcome.cancelled);
}

// ============================================================================
// Parsing, conversion, dedup, rate limiting, refinement
// ============================================================================

#[test]
fn test_single_quoted_trailing_comma_repair() {
    let text = "[{'label': 'dog', 'bbox': [1,2,3,4],}]";

    let parsed = parse_regions(text, "unknown").expect("parse");
    assert_eq!(parsed.regions.len(), 1);
    assert_eq!(parsed.regions[0].label, "dog");
    assert_eq!(parsed.regions[0].bbox.to_array(), [1.0, 2.0, 3.0, 4.0]);

    let value: serde_json::Value = parse_lenient(text).expect("lenient");
    assert_eq!(value[0]["bbox"], serde_json::json!([1, 2, 3, 4]));
}

#[test]
fn test_pixel_conversion_is_pure() {
    let bbox = NormalizedBox::new(125.0, 250.0, 875.0, 750.0).expect("box");
    let first = bbox.to_pixel(1920, 1080);
    let second = bbox.to_pixel(1920, 1080);
    assert_eq!(first, second);
    assert_eq!(first.to_coco(), [480.0, 135.0, 960.0, 810.0]);
    assert_eq!(first.area(), 960.0 * 810.0);
}

#[test]
fn test_accepted_fingerprints_stay_apart() {
    let mut index = DuplicateIndex::new(5);
    let mut state: u64 = 0x9E37_79B9_7F4A_7C15;
    for _ in 0..500 {
        state = state
            .wrapping_mul(6364136223846793005)
            .wrapping_add(1442695040888963407);
        // sparse masks make near-duplicates common
        let _ = index.try_accept(Fingerprint(state & 0x0000_00FF_0000_0FFF));
    }

    let accepted = index.fingerprints();
    assert!(accepted.len() > 1);
    assert!(index.rejected() > 0);
    for (i, a) in accepted.iter().enumerate() {
        for b in &accepted[i + 1..] {
            assert!(a.hamming(b) >= 5);
        }
    }
}

#[tokio::test(start_paused = true)]
async fn test_rate_limiter_grants_within_window() {
    let limiter = Arc::new(RateLimiter::new(120)); // 2 per second
    let cancel = CancellationToken::new();
    let window = Duration::from_secs(10);
    let start = tokio::time::Instant::now();

    let mut handles = Vec::new();
    for _ in 0..4 {
        let limiter = Arc::clone(&limiter);
        let cancel = cancel.clone();
        handles.push(tokio::spawn(async move {
            let mut granted = 0u32;
            while limiter.acquire(&cancel).await.is_ok() {
                if start.elapsed() > window {
                    break;
                }
                granted += 1;
            }
            granted
        }));
    }

    tokio::time::sleep(window + Duration::from_secs(1)).await;
    cancel.cancel();

    let mut total = 0;
    for handle in handles {
        total += handle.await.expect("join");
    }
    assert!(total <= 10 * 2 + 1, "granted {total}");
    assert!(total >= 10);
}

/// Refinement prompts get boxes; reviews always ask for more work.
struct NeverSatisfied {
    rounds: AtomicUsize,
}

#[async_trait]
impl VisionModel for NeverSatisfied {
    async fn infer(&self, request: InferenceRequest) -> Result<String, CapabilityError> {
        if request.prompt.starts_with("Annotate ALL") {
            self.rounds.fetch_add(1, Ordering::SeqCst);
            Ok(r#"[{"label": "dog", "bbox": [10, 10, 500, 500]}]"#.to_string())
        } else {
            Ok(r#"{"status": "NEEDS_IMPROVEMENT", "feedback": "tighter", "issues": ["loose"]}"#
                .to_string())
        }
    }
}

#[tokio::test]
async fn test_quality_loop_terminates_within_bound() {
    let model = Arc::new(NeverSatisfied {
        rounds: AtomicUsize::new(0),
    });
    let validator = QualityValidator::new(model.clone(), ValidationMethod::Coordinate);
    let refinement = QualityRefinementLoop::new(
        model.clone(),
        validator,
        RefinementConfig {
            max_iterations: 4,
            retention: RetentionPolicy::Latest,
        },
    );

    let task = AnnotationTask {
        item: candidate(1),
        objects: vec!["dog".to_string()].into(),
        task_index: 0,
        worker_index: 0,
    };
    let outcome = refinement.refine(&task).await.expect("refine");

    assert_eq!(model.rounds.load(Ordering::SeqCst), 4);
    assert_eq!(outcome.trace.len(), 4);
    let summary = outcome.result.refinement.as_ref().expect("summary");
    assert_eq!(summary.final_status, Verdict::NeedsImprovement);
    assert_eq!(
        summary.final_status,
        outcome.trace.last().expect("last").verdict
    );
    assert_eq!(summary.selected_iteration, Some(4));
}
