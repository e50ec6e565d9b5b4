//! rulegraph - Minimal Workflow Execution Engine
//!
//! Runs declarative task graphs written in YAML. Steps are connected either
//! explicitly (`previous`/`next`) or implicitly by matching one step's
//! outputs to another's inputs, then executed in dependency order with a
//! bounded number of parallel jobs. Steps whose outputs are newer than
//! their inputs are skipped.
//!
//! # Architecture
//!
//! - [`workflow`]: Data structures, parsing, wildcards and planning
//! - [`execution`]: Execution engine with parallel scheduling
//! - [`monitoring`]: Resource usage tracking and execution timeline
//! - [`config`]: Run options
//! - [`error`]: Error types
//!
//! # Example
//!
//! ```rust,no_run
//! use rulegraph::execution::Engine;
//! use rulegraph::load_workflow;
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let workflow = load_workflow("workflow.yaml")?;
//!
//!     let mut engine = Engine::new(workflow);
//!     engine.set_workflow_path("workflow.yaml");
//!     engine.set_max_parallel(4);
//!     engine.set_working_dir("/data/analysis");
//!
//!     engine.run()?;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod error;
pub mod execution;
pub mod monitoring;
pub mod workflow;

pub use config::RunConfig;
pub use error::{Result, StepError, WorkflowError};
pub use execution::{Engine, RunSummary};
pub use workflow::model::{Step, Workflow};
pub use workflow::parser::{load_workflow, parse_workflow};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Application name
pub const APP_NAME: &str = "rulegraph";
