//! COCO dataset export.
//!
//! Writes a finished [`Dataset`] to
//! `<output_dir>/<slug>_<timestamp>/annotations.json` with the images copied
//! next to it under `images/`.

use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::annotation::AnnotationResult;
use crate::dataset::Dataset;
use crate::error::ExportError;
use crate::utils::slugify;

// ============================================================================
// COCO document
// ============================================================================

/// Top-level `annotations.json` document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CocoDocument {
    pub images: Vec<CocoImage>,
    pub annotations: Vec<CocoAnnotation>,
    pub categories: Vec<CocoCategory>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CocoImage {
    pub id: u64,
    pub file_name: String,
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CocoAnnotation {
    pub id: u64,
    pub image_id: u64,
    pub category_id: u64,
    /// Pixel box `[x, y, w, h]`.
    pub bbox: [f64; 4],
    pub area: f64,
    pub iscrowd: u8,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CocoCategory {
    pub id: u64,
    pub name: String,
    pub supercategory: String,
}

/// Assigns 1-based category ids: requested objects first, then labels seen
/// in the data in first-seen order. Names are matched trimmed and
/// lower-cased.
#[derive(Debug, Default)]
struct CategoryTable {
    ids: HashMap<String, u64>,
    categories: Vec<CocoCategory>,
}

impl CategoryTable {
    fn new(requested: &[String]) -> Self {
        let mut table = Self::default();
        for name in requested {
            table.id_for(name);
        }
        table
    }

    fn id_for(&mut self, name: &str) -> u64 {
        let display = name.trim();
        let norm = display.to_lowercase();
        if let Some(id) = self.ids.get(&norm) {
            return *id;
        }
        let id = self.categories.len() as u64 + 1;
        self.ids.insert(norm, id);
        self.categories.push(CocoCategory {
            id,
            name: display.to_string(),
            supercategory: "object".to_string(),
        });
        id
    }
}

/// Builds the COCO document for `entries`, in iteration order.
pub fn build_document<'a>(
    entries: impl IntoIterator<Item = &'a AnnotationResult>,
    objects: &[String],
) -> CocoDocument {
    let mut categories = CategoryTable::new(objects);
    let mut doc = CocoDocument::default();
    let mut next_annotation = 1u64;

    for (index, result) in entries.into_iter().enumerate() {
        let image_id = index as u64 + 1;
        doc.images.push(CocoImage {
            id: image_id,
            file_name: result.key.clone(),
            width: result.width,
            height: result.height,
        });

        for region in &result.regions {
            if !region.bbox.is_valid() {
                warn!(
                    item = %result.key,
                    label = %region.label,
                    bbox = ?region.bbox.to_array(),
                    "Skipping malformed box"
                );
                continue;
            }
            let pixel = region.bbox.to_pixel(result.width, result.height);
            doc.annotations.push(CocoAnnotation {
                id: next_annotation,
                image_id,
                category_id: categories.id_for(&region.label),
                bbox: pixel.to_coco(),
                area: pixel.area(),
                iscrowd: 0,
            });
            next_annotation += 1;
        }
    }

    doc.categories = categories.categories;
    doc
}

// ============================================================================
// Exporter
// ============================================================================

/// Paths and counts of one export.
#[derive(Debug, Clone, Serialize)]
pub struct ExportSummary {
    /// Directory holding the export.
    pub dataset_dir: PathBuf,
    /// Path to `annotations.json`.
    pub annotations_path: PathBuf,
    pub image_count: usize,
    pub annotation_count: usize,
    pub category_count: usize,
    /// Items whose image bytes were unavailable.
    pub missing_images: Vec<String>,
    pub exported_at: DateTime<Utc>,
}

/// Writes datasets in COCO format.
#[derive(Debug, Clone)]
pub struct CocoExporter {
    output_dir: PathBuf,
}

impl CocoExporter {
    pub fn new(output_dir: impl Into<PathBuf>) -> Self {
        Self {
            output_dir: output_dir.into(),
        }
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    /// Exports every entry of `dataset` under a fresh
    /// `<slug(name)>_<timestamp>` directory.
    pub fn export(
        &self,
        dataset: &Dataset,
        name: &str,
        objects: &[String],
    ) -> Result<ExportSummary, ExportError> {
        if dataset.is_empty() {
            return Err(ExportError::Empty);
        }

        let exported_at = Utc::now();
        let dir_name = format!("{}_{}", slugify(name), exported_at.format("%Y%m%d_%H%M%S"));
        self.export_to(&self.output_dir.join(dir_name), dataset, objects, exported_at)
    }

    /// Exports into exactly `dataset_dir`.
    pub fn export_to(
        &self,
        dataset_dir: &Path,
        dataset: &Dataset,
        objects: &[String],
        exported_at: DateTime<Utc>,
    ) -> Result<ExportSummary, ExportError> {
        if dataset.is_empty() {
            return Err(ExportError::Empty);
        }

        let images_dir = dataset_dir.join("images");
        fs::create_dir_all(&images_dir)?;

        let mut missing_images = Vec::new();
        for result in dataset.values() {
            if !write_image(result, &images_dir.join(&result.key))? {
                tracing::warn!(item = %result.key, "No image bytes available, skipping copy");
                missing_images.push(result.key.clone());
            }
        }

        let doc = build_document(dataset.values(), objects);
        let annotations_path = dataset_dir.join("annotations.json");
        let file = File::create(&annotations_path)?;
        let mut writer = BufWriter::new(file);
        serde_json::to_writer_pretty(&mut writer, &doc)?;
        writer.flush()?;

        tracing::info!(
            path = %annotations_path.display(),
            images = doc.images.len(),
            annotations = doc.annotations.len(),
            categories = doc.categories.len(),
            "Exported COCO dataset"
        );

        Ok(ExportSummary {
            dataset_dir: dataset_dir.to_path_buf(),
            annotations_path,
            image_count: doc.images.len(),
            annotation_count: doc.annotations.len(),
            category_count: doc.categories.len(),
            missing_images,
            exported_at,
        })
    }
}

/// Writes the item's image, from memory or by copying its local source.
/// Returns `false` when neither is available.
fn write_image(result: &AnnotationResult, target: &Path) -> Result<bool, ExportError> {
    if let Some(image) = &result.image {
        fs::write(target, image.bytes.as_slice())?;
        return Ok(true);
    }
    let source = Path::new(&result.source);
    if !result.source.is_empty() && source.is_file() {
        fs::copy(source, target)?;
        return Ok(true);
    }
    Ok(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::annotation::{NormalizedBox, RegionAnnotation};
    use crate::llm::ImagePayload;

    fn region(label: &str, coords: [f64; 4]) -> RegionAnnotation {
        RegionAnnotation::new(
            label,
            NormalizedBox::from_slice(&coords).expect("valid box"),
        )
    }

    fn result(key: &str, regions: Vec<RegionAnnotation>) -> AnnotationResult {
        AnnotationResult::new(key, regions, 200, 100)
            .with_image(ImagePayload::jpeg(format!("bytes-{key}").into_bytes()))
    }

    fn objects(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_pixel_boxes_and_area() {
        let entries = [result("a.jpg", vec![region("dog", [100.0, 250.0, 600.0, 750.0])])];
        let doc = build_document(entries.iter(), &objects(&["dog"]));

        let ann = &doc.annotations[0];
        // x = 0.25*200, y = 0.1*100, w = 0.5*200, h = 0.5*100
        assert_eq!(ann.bbox, [50.0, 10.0, 100.0, 50.0]);
        assert_eq!(ann.area, 5000.0);
        assert_eq!(ann.iscrowd, 0);
        assert_eq!(ann.image_id, 1);
    }

    #[test]
    fn test_inverted_box_is_not_exported() {
        let inverted = RegionAnnotation::new(
            "dog",
            NormalizedBox {
                ymin: 900.0,
                xmin: 800.0,
                ymax: 100.0,
                xmax: 200.0,
            },
        );
        let entries = [result(
            "a.jpg",
            vec![inverted, region("dog", [100.0, 250.0, 600.0, 750.0])],
        )];
        let doc = build_document(entries.iter(), &objects(&["dog"]));

        assert_eq!(doc.annotations.len(), 1);
        let ann = &doc.annotations[0];
        assert_eq!(ann.bbox, [50.0, 10.0, 100.0, 50.0]);
        assert!(ann.bbox[2] > 0.0 && ann.bbox[3] > 0.0);
        assert_eq!(ann.id, 1);
    }

    #[test]
    fn test_inverted_model_box_never_reaches_export() {
        let parsed = crate::annotation::parse_regions(
            r#"[{"label":"dog","bbox":[900,800,100,200]}, {"label":"dog","bbox":[100,250,600,750]}]"#,
            "dog",
        )
        .expect("one valid box");
        let entries = [AnnotationResult::new("a.jpg", parsed.regions, 200, 100)];
        let doc = build_document(entries.iter(), &objects(&["dog"]));

        assert_eq!(doc.annotations.len(), 1);
        assert!(doc.annotations.iter().all(|a| a.bbox[2] > 0.0 && a.bbox[3] > 0.0));
    }

    #[test]
    fn test_category_ids_requested_first() {
        let entries = [
            result("a.jpg", vec![region("Cat ", [0.0, 0.0, 10.0, 10.0])]),
            result(
                "b.jpg",
                vec![
                    region("bird", [0.0, 0.0, 10.0, 10.0]),
                    region("dog", [0.0, 0.0, 10.0, 10.0]),
                ],
            ),
        ];
        let doc = build_document(entries.iter(), &objects(&["dog", "cat"]));

        let names: Vec<_> = doc.categories.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["dog", "cat", "bird"]);
        let ids: Vec<_> = doc.annotations.iter().map(|a| a.category_id).collect();
        assert_eq!(ids, vec![2, 3, 1]);
        let annotation_ids: Vec<_> = doc.annotations.iter().map(|a| a.id).collect();
        assert_eq!(annotation_ids, vec![1, 2, 3]);
    }

    #[test]
    fn test_export_writes_files() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut dataset = Dataset::new(5);
        dataset.offer(result("b.jpg", vec![region("dog", [0.0, 0.0, 500.0, 500.0])]));
        dataset.offer(result("a.jpg", vec![region("dog", [0.0, 0.0, 1000.0, 1000.0])]));

        let exporter = CocoExporter::new(dir.path());
        let summary = exporter
            .export(&dataset, "Dogs in Parks", &objects(&["dog"]))
            .expect("export");

        assert_eq!(summary.image_count, 2);
        assert_eq!(summary.annotation_count, 2);
        assert_eq!(summary.category_count, 1);
        assert!(summary.missing_images.is_empty());
        assert!(summary
            .dataset_dir
            .file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|n| n.starts_with("dogs_in_parks_")));

        let written = fs::read(summary.dataset_dir.join("images").join("a.jpg")).expect("image");
        assert_eq!(written, b"bytes-a.jpg");

        let text = fs::read_to_string(&summary.annotations_path).expect("json");
        let doc: CocoDocument = serde_json::from_str(&text).expect("parse");
        // ordered by key
        assert_eq!(doc.images[0].file_name, "a.jpg");
        assert_eq!(doc.images[1].file_name, "b.jpg");
    }

    #[test]
    fn test_export_copies_local_source() {
        let dir = tempfile::tempdir().expect("tempdir");
        let source = dir.path().join("local.png");
        fs::write(&source, b"png-bytes").expect("write source");

        let mut dataset = Dataset::unbounded();
        dataset.offer(
            AnnotationResult::new("local.png", vec![region("cat", [0.0, 0.0, 10.0, 10.0])], 10, 10)
                .with_source(source.display().to_string()),
        );
        dataset.offer(AnnotationResult::new(
            "gone.png",
            vec![region("cat", [0.0, 0.0, 10.0, 10.0])],
            10,
            10,
        ));

        let out = dir.path().join("out");
        let summary = CocoExporter::new(&out)
            .export_to(&out.join("run"), &dataset, &[], Utc::now())
            .expect("export");

        let copied = fs::read(out.join("run").join("images").join("local.png")).expect("copy");
        assert_eq!(copied, b"png-bytes");
        assert_eq!(summary.missing_images, vec!["gone.png".to_string()]);
    }

    #[test]
    fn test_empty_dataset_is_rejected() {
        let dir = tempfile::tempdir().expect("tempdir");
        let err = CocoExporter::new(dir.path())
            .export(&Dataset::new(3), "dogs", &[])
            .unwrap_err();
        assert!(matches!(err, ExportError::Empty));
    }
}
