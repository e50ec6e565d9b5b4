//! Workflow Definition Module
//!
//! Data structures and utilities for defining, parsing, and validating
//! task graphs.
//!
//! # Structure
//!
//! - [`model`]: Core data structures (Step, Workflow)
//! - [`parser`]: YAML loading and dependency derivation
//! - [`wildcards`]: Template steps expanded per wildcard value
//! - [`placeholders`]: Command template rendering
//! - [`validator`]: Validation rules and topological ordering
//! - [`planner`]: Execution planning and scheduling
//! - [`state`]: Resume state persistence

pub mod model;
pub mod parser;
pub mod placeholders;
pub mod planner;
pub mod state;
pub mod validator;
pub mod wildcards;

pub use model::{Step, Workflow};
pub use parser::{load_workflow, parse_workflow, save_workflow};
pub use planner::{ExecutionPlanner, StepStatus};
pub use state::WorkflowState;
pub use validator::{validate_workflow, ValidationError};
pub use wildcards::{
    expand_workflow_wildcards, extract_wildcard_values, generate_pattern, has_wildcards,
};
