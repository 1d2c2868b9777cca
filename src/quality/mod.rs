//! Annotation quality review and iterative refinement.
//!
//! - [`validator`]: coordinate, visual and hybrid review producing a
//!   [`Verdict`] with feedback
//! - [`overlay`]: red box overlays for visual review
//! - [`refinement`]: the per-item refine/review loop, usable wherever an
//!   [`ItemAnnotator`](crate::annotation::ItemAnnotator) is expected

pub mod overlay;
pub mod refinement;
pub mod validator;

pub use overlay::render_overlay;
pub use refinement::{
    QualityRefinementLoop, RefinementConfig, RefinementOutcome, RefinementSummary,
    RefinementTrace, RetentionPolicy, TraceEntry,
};
pub use validator::{QualityValidator, ValidationMethod, ValidationReport, Verdict};
