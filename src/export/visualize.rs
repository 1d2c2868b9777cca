//! Draws exported COCO boxes back onto their images for inspection.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::{info, warn};

use crate::annotation::{PixelBox, RegionAnnotation};
use crate::error::ExportError;
use crate::quality::render_overlay;

use super::coco::{CocoDocument, CocoImage};

/// Outcome of one visualization pass.
#[derive(Debug, Clone, Default, Serialize)]
pub struct VisualizeSummary {
    pub output_dir: PathBuf,
    /// Written overlay files, in image order.
    pub rendered: Vec<PathBuf>,
    /// Images listed in the document but absent from `images/`.
    pub missing: Vec<String>,
    /// Images that could not be decoded or written.
    pub failed: Vec<String>,
}

/// Reads `<dataset_dir>/annotations.json` and writes one
/// `vis_<stem>.png` per annotated image into `output_dir`.
///
/// Images come from `<dataset_dir>/images/`. Per-image problems are logged
/// and recorded in the summary; only an unreadable document or an
/// uncreatable output directory fails the whole call.
pub fn visualize_dataset(
    dataset_dir: &Path,
    output_dir: &Path,
) -> Result<VisualizeSummary, ExportError> {
    let annotations_path = dataset_dir.join("annotations.json");
    if !annotations_path.is_file() {
        return Err(ExportError::MissingAnnotations(annotations_path));
    }
    let doc: CocoDocument = serde_json::from_str(&fs::read_to_string(&annotations_path)?)?;
    fs::create_dir_all(output_dir)?;

    let mut boxes: BTreeMap<u64, Vec<[f64; 4]>> = BTreeMap::new();
    for ann in &doc.annotations {
        boxes.entry(ann.image_id).or_default().push(ann.bbox);
    }
    let names: BTreeMap<u64, &str> = doc
        .categories
        .iter()
        .map(|c| (c.id, c.name.as_str()))
        .collect();
    let labels: BTreeMap<u64, Vec<&str>> =
        doc.annotations
            .iter()
            .fold(BTreeMap::new(), |mut acc: BTreeMap<u64, Vec<&str>>, ann| {
                let name = names.get(&ann.category_id).copied().unwrap_or("object");
                acc.entry(ann.image_id).or_default().push(name);
                acc
            });

    let mut summary = VisualizeSummary {
        output_dir: output_dir.to_path_buf(),
        ..Default::default()
    };
    let images_dir = dataset_dir.join("images");

    for image in &doc.images {
        let Some(image_boxes) = boxes.get(&image.id) else {
            continue;
        };
        let source = images_dir.join(&image.file_name);
        let bytes = match fs::read(&source) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(image = %image.file_name, error = %e, "Image not found");
                summary.missing.push(image.file_name.clone());
                continue;
            }
        };

        let image_labels = labels.get(&image.id).map(Vec::as_slice).unwrap_or(&[]);
        let regions = to_regions(image, image_boxes, image_labels);
        let target = output_dir.join(overlay_name(&image.file_name));
        let written = render_overlay(&bytes, &regions)
            .map_err(|e| e.to_string())
            .and_then(|png| fs::write(&target, png).map_err(|e| e.to_string()));
        match written {
            Ok(()) => summary.rendered.push(target),
            Err(e) => {
                warn!(image = %image.file_name, error = %e, "Cannot render overlay");
                summary.failed.push(image.file_name.clone());
            }
        }
    }

    info!(
        output = %output_dir.display(),
        rendered = summary.rendered.len(),
        missing = summary.missing.len(),
        failed = summary.failed.len(),
        "Visualization finished"
    );
    Ok(summary)
}

/// Pixel boxes of one image as regions; boxes that do not map back to a
/// valid normalized box are skipped.
fn to_regions(image: &CocoImage, boxes: &[[f64; 4]], labels: &[&str]) -> Vec<RegionAnnotation> {
    boxes
        .iter()
        .enumerate()
        .filter_map(|(i, bbox)| {
            let normalized = PixelBox::from_coco(*bbox).to_normalized(image.width, image.height)?;
            let label = labels.get(i).copied().unwrap_or("object");
            Some(RegionAnnotation::new(label, normalized))
        })
        .collect()
}

fn overlay_name(file_name: &str) -> String {
    let stem = Path::new(file_name)
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| file_name.to_string());
    format!("vis_{stem}.png")
}
