//! Netchecks library
//!
//! This library provides the core functionality for the netchecks operator
//! and the `netcheck` probe CLI. It can be used both by the binaries and
//! by integration tests.

pub mod checks;
pub mod cli;
pub mod config;
pub mod context;
pub mod kube;
pub mod models;
pub mod operator;
pub mod runner;
pub mod validation;

// Re-export commonly used types for convenience
pub use models::{NetworkAssertion, NetworkAssertionSpec, OutputDocument, ResultRecord, Status};
pub use runner::{RunError, RunOptions, evaluate_result, run_from_config};
