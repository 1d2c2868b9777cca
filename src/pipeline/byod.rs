//! Bring-your-own-data runs: annotate a local folder instead of searching.

use std::path::{Path, PathBuf};
use std::time::Instant;

use tracing::{info, warn};
use walkdir::WalkDir;

use crate::dataset::CandidateItem;
use crate::diversity::Fingerprint;
use crate::error::FetchError;
use crate::llm::ImagePayload;
use crate::pipeline::context::PipelineContext;
use crate::pipeline::state::{Phase, PipelineOutcome, PipelineState, RunStatus};
use crate::resilience::{ErrorClassifier, Stage};

/// Extensions picked up from the folder, compared case-insensitively.
pub const IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png"];

/// Lists the images directly inside `dir`, sorted by path.
pub fn list_images(dir: &Path) -> Result<Vec<PathBuf>, FetchError> {
    if !dir.is_dir() {
        return Err(FetchError::Io(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("not a directory: {}", dir.display()),
        )));
    }

    let mut images = Vec::new();
    for entry in WalkDir::new(dir).min_depth(1).max_depth(1).follow_links(true) {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                warn!(error = %e, "Cannot read directory entry");
                continue;
            }
        };
        if entry.file_type().is_file() && has_image_extension(entry.path()) {
            images.push(entry.into_path());
        }
    }
    images.sort();
    Ok(images)
}

fn has_image_extension(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| IMAGE_EXTENSIONS.iter().any(|known| ext.eq_ignore_ascii_case(known)))
}

/// Reads and decodes one local image.
///
/// The item is keyed by its file name and keeps the original bytes.
pub fn load_local(path: &Path) -> Result<CandidateItem, FetchError> {
    let source = path.display().to_string();
    let bytes = std::fs::read(path)?;
    let decoded = image::load_from_memory(&bytes).map_err(|e| FetchError::Decode {
        url: source.clone(),
        reason: e.to_string(),
    })?;

    let key = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| source.clone());
    let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("jpg");

    Ok(CandidateItem {
        key,
        source,
        width: decoded.width(),
        height: decoded.height(),
        fingerprint: Fingerprint::from_image(&decoded),
        image: ImagePayload::new(bytes, ImagePayload::mime_for_extension(ext)),
        path: Some(path.to_path_buf()),
    })
}

/// Loads every readable image in `dir`; unreadable files are skipped.
pub async fn load_folder(dir: &Path) -> Result<Vec<CandidateItem>, FetchError> {
    let paths = list_images(dir)?;
    let items = tokio::task::spawn_blocking(move || {
        paths
            .iter()
            .filter_map(|path| match load_local(path) {
                Ok(item) => Some(item),
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Skipping unreadable image");
                    None
                }
            })
            .collect::<Vec<_>>()
    })
    .await
    .map_err(|e| FetchError::Io(std::io::Error::other(e)))?;
    Ok(items)
}

/// Annotates every image in `dir` through the run's worker pool.
///
/// The target is the number of images loaded; an empty folder ends as
/// `FAILED_EMPTY`.
pub async fn run_byod(ctx: &PipelineContext, dir: &Path, objects: &[String]) -> PipelineOutcome {
    let started = Instant::now();

    let items = match load_folder(dir).await {
        Ok(items) => items,
        Err(e) => {
            let err = ErrorClassifier::classify(Stage::Discovery, &e)
                .with_detail("dir", dir.display());
            err.log();
            ctx.metrics.record_error(&err);
            let status = if err.is_fatal() {
                RunStatus::Failed
            } else {
                RunStatus::FailedEmpty
            };
            return PipelineOutcome::from_state(
                PipelineState::new(0),
                status,
                Some(err),
                started.elapsed(),
            );
        }
    };

    let loaded = items.len();
    let mut state = PipelineState::new(loaded);
    info!(dir = %dir.display(), images = loaded, "Loaded local images");

    if loaded == 0 {
        warn!(dir = %dir.display(), "No images found");
        state.enter(Phase::Finished);
        return PipelineOutcome::from_state(state, RunStatus::FailedEmpty, None, started.elapsed());
    }

    state.iteration = 1;
    state.totals.mined = loaded;
    state.totals.curated = loaded;
    ctx.progress.add_mined(loaded);

    state.enter(Phase::Annotating);
    let timer = Instant::now();
    let pool = ctx.annotation_pool();
    let outcome = pool
        .annotate_into(items, objects, &mut state.dataset, &ctx.cancel)
        .await;
    ctx.metrics.record_stage(Stage::Annotation, timer.elapsed());

    state.totals.annotated = outcome.merged;
    state.totals.failed = outcome.failed.len();
    state.totals.discarded = outcome.discarded;
    state.enter(Phase::Finished);

    let (status, error) = if let Some(fatal) = outcome.fatal {
        (RunStatus::Failed, Some(fatal))
    } else if outcome.cancelled {
        (RunStatus::Cancelled, None)
    } else {
        (RunStatus::stopped(state.collected(), state.target()), None)
    };

    let elapsed = started.elapsed();
    ctx.metrics.record_stage(Stage::Pipeline, elapsed);
    PipelineOutcome::from_state(state, status, error, elapsed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CapabilityError;
    use crate::llm::{InferenceRequest, VisionModel};
    use crate::pipeline::config::PipelineConfig;
    use async_trait::async_trait;
    use image::{Rgb, RgbImage};
    use std::sync::Arc;
    use tokio_util::sync::CancellationToken;

    struct BoxModel;

    #[async_trait]
    impl VisionModel for BoxModel {
        async fn infer(&self, _request: InferenceRequest) -> Result<String, CapabilityError> {
            Ok(r#"[{"label": "dog", "box_2d": [100, 100, 600, 600]}]"#.to_string())
        }
    }

    fn write_png(dir: &Path, name: &str, shade: u8) {
        let img = RgbImage::from_fn(32, 24, |x, _| Rgb([shade, (x * 8) as u8, 0]));
        img.save(dir.join(name)).expect("write png");
    }

    fn context(dir: &Path) -> PipelineContext {
        let mut config = PipelineConfig::new().with_query("dog").with_image_dir(dir);
        config.rate_limit.requests_per_minute = Some(60_000);
        PipelineContext::new(config, Arc::new(BoxModel), CancellationToken::new())
    }

    #[test]
    fn test_list_images_filters_and_sorts() {
        let dir = tempfile::tempdir().expect("tempdir");
        write_png(dir.path(), "b.png", 10);
        write_png(dir.path(), "a.PNG", 20);
        std::fs::write(dir.path().join("notes.txt"), "hello").expect("write");
        std::fs::create_dir(dir.path().join("nested")).expect("mkdir");
        write_png(&dir.path().join("nested"), "c.png", 30);

        let names: Vec<_> = list_images(dir.path())
            .expect("list")
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["a.PNG", "b.png"]);
    }

    #[test]
    fn test_list_images_missing_dir() {
        let err = list_images(Path::new("/definitely/not/here")).unwrap_err();
        assert!(matches!(err, FetchError::Io(_)));
    }

    #[test]
    fn test_load_local_keeps_bytes() {
        let dir = tempfile::tempdir().expect("tempdir");
        write_png(dir.path(), "shot.png", 50);

        let item = load_local(&dir.path().join("shot.png")).expect("load");
        assert_eq!(item.key, "shot.png");
        assert_eq!((item.width, item.height), (32, 24));
        assert_eq!(item.image.mime_type, "image/png");
        assert_eq!(
            item.image.bytes.as_slice(),
            std::fs::read(dir.path().join("shot.png")).expect("read").as_slice()
        );
        assert!(item.path.is_some());
    }

    #[test]
    fn test_load_local_rejects_corrupt_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::write(dir.path().join("broken.jpg"), b"not an image").expect("write");
        let err = load_local(&dir.path().join("broken.jpg")).unwrap_err();
        assert!(matches!(err, FetchError::Decode { .. }));
    }

    #[tokio::test]
    async fn test_run_byod_annotates_every_image() {
        let dir = tempfile::tempdir().expect("tempdir");
        write_png(dir.path(), "one.png", 10);
        write_png(dir.path(), "two.png", 200);
        std::fs::write(dir.path().join("broken.jpg"), b"junk").expect("write");

        let ctx = context(dir.path());
        let outcome = run_byod(&ctx, dir.path(), &["dog".to_string()]).await;

        assert_eq!(outcome.status, RunStatus::Done);
        assert_eq!(outcome.target, 2);
        assert_eq!(outcome.collected, 2);
        assert!(outcome.dataset.contains("one.png"));
        assert!(outcome.dataset.contains("two.png"));
    }

    #[tokio::test]
    async fn test_run_byod_empty_folder() {
        let dir = tempfile::tempdir().expect("tempdir");
        let ctx = context(dir.path());
        let outcome = run_byod(&ctx, dir.path(), &["dog".to_string()]).await;

        assert_eq!(outcome.status, RunStatus::FailedEmpty);
        assert_eq!(outcome.collected, 0);
        assert!(outcome.error.is_none());
    }
}
