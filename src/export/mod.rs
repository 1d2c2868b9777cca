//! Dataset export.
//!
//! Finished datasets are written in COCO format: one `annotations.json`
//! with pixel-space boxes plus a copy of every image. [`visualize`] draws
//! an exported dataset's boxes back onto its images.

pub mod coco;
pub mod visualize;

pub use coco::{
    build_document, CocoAnnotation, CocoCategory, CocoDocument, CocoExporter, CocoImage,
    ExportSummary,
};
pub use visualize::{visualize_dataset, VisualizeSummary};
