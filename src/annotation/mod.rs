//! Per-item box annotation.
//!
//! - [`types`]: normalized boxes, regions and per-item results
//! - [`parse`]: layered recovery of box records from free-form model text
//! - [`annotator`]: the [`ItemAnnotator`] seam and the single-call detector
//! - [`worker_pool`]: bounded-concurrency pool with per-item retry

pub mod annotator;
pub mod parse;
pub mod types;
pub mod worker_pool;

pub use annotator::{parse_objects, AnnotationTask, DetectionAnnotator, ItemAnnotator};
pub use parse::{parse_regions, ParsedRegions, RepairStage};
pub use types::{AnnotationResult, NormalizedBox, PixelBox, RegionAnnotation, COORD_MAX};
pub use worker_pool::{AnnotationPoolConfig, AnnotationWorkerPool, PoolOutcome, PoolStats};
