//! Tooling & Integration Layer
//!
//! Command-line access to bundle directories for operators and scripts.

pub mod cli;

pub use cli::{Cli, CliContext, Commands};
