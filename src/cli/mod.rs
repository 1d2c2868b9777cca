//! Command-line interface for foundry.
//!
//! Provides the `run`, `byod` and `visualize` commands and the flag layering on top of
//! the YAML and environment configuration.

mod commands;

pub use commands::{
    apply_byod_args, apply_common_args, apply_run_args, parse_cli, run, run_with_cli, ByodArgs,
    Cli, Commands, CommonArgs, RunArgs, VisualizeArgs,
};
