//! Prompts sent to the vision capability.
//!
//! Every stage phrases its request here so wording changes stay in one place:
//!
//! - [`verification`] - yes/no concept check used by curation
//! - [`detection`] - bounding box requests, standard and strict retry forms
//! - [`validation`] - coordinate and visual review of a candidate annotation
//! - [`planning`] - turning a free-form request into a dataset plan
//!
//! # Usage
//!
//! ```
//! use foundry::prompts::{build_detection_prompt, build_verification_prompt};
//!
//! let verify = build_verification_prompt("a red car");
//! assert!(verify.contains("YES or NO"));
//!
//! let objects = vec!["dog".to_string(), "cat".to_string()];
//! let detect = build_detection_prompt(&objects, false);
//! assert!(detect.contains("dog, cat"));
//! ```

pub mod detection;
pub mod planning;
pub mod validation;
pub mod verification;

pub use detection::{build_detection_prompt, build_refinement_prompt};
pub use planning::{build_planning_prompt, PLANNER_SYSTEM_PROMPT};
pub use validation::{build_coordinate_prompt, build_visual_prompt, VALIDATOR_SYSTEM_PROMPT};
pub use verification::{build_verification_prompt, CURATOR_SYSTEM_PROMPT};
