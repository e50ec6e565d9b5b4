//! Workflow Execution Module
//!
//! Runs workflow steps: parallel scheduling, freshness checks, retries,
//! and pause/resume functionality.
//!
//! # Architecture
//!
//! - [`engine`]: Main execution engine orchestrating workflow runs
//! - [`step`]: Individual step execution logic
//! - [`retry`]: Per-step retry policies

pub mod engine;
pub mod retry;
pub mod step;

pub use engine::{Engine, RunSummary};
pub use retry::{RetryPolicy, RetryStrategy};
pub use step::{execute_step, execute_with_retry, StepContext, StepReport};
