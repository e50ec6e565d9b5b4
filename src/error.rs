//! Error Types
//!
//! Typed errors for loading, validating, and running workflows.

use std::path::PathBuf;

use thiserror::Error;

use crate::workflow::placeholders::PlaceholderError;
use crate::workflow::validator::ValidationError;

/// Convenience alias used throughout the library.
pub type Result<T> = std::result::Result<T, WorkflowError>;

/// Errors raised while loading, planning, or running a workflow.
#[derive(Debug, Error)]
pub enum WorkflowError {
    #[error("I/O error on '{}': {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse workflow YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("failed to encode or decode JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("workflow is invalid:\n{}", format_validation(.0))]
    Validation(Vec<ValidationError>),

    #[error("dependency error: {0}")]
    Dependency(String),

    #[error("wildcard error: {0}")]
    Wildcard(String),

    #[error("unknown target '{0}' (not a step id or declared output)")]
    UnknownTarget(String),

    #[error("scheduler stalled with {0} pending steps and nothing runnable")]
    Stalled(usize),

    #[error("{} step(s) failed: {}", failed.len(), failed.join(", "))]
    StepsFailed { failed: Vec<String>, blocked: Vec<String> },

    #[error("internal error: {0}")]
    Internal(String),
}

impl WorkflowError {
    /// Wraps an I/O error together with the path it concerns.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

fn format_validation(errors: &[ValidationError]) -> String {
    errors
        .iter()
        .map(|e| format!("  - {}", e))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Errors raised while executing a single step.
#[derive(Debug, Error)]
pub enum StepError {
    #[error("step '{step}': {source}")]
    Placeholder {
        step: String,
        #[source]
        source: PlaceholderError,
    },

    #[error("step '{step}': failed to launch '{program}': {source}")]
    Spawn {
        step: String,
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("step '{step}': I/O error on '{}': {source}", path.display())]
    Io {
        step: String,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("step '{step}' exited with {}{}", describe_code(*code), describe_stderr(stderr))]
    Exit {
        step: String,
        code: Option<i32>,
        stderr: String,
    },

    #[error("step '{step}' finished but did not produce: {}", missing.join(", "))]
    MissingOutput { step: String, missing: Vec<String> },

    #[error("step '{0}' has neither a command nor a script")]
    NoAction(String),

    #[error("step '{step}': failed to encode script context: {source}")]
    Context {
        step: String,
        #[source]
        source: serde_json::Error,
    },
}

impl StepError {
    /// Whether another attempt could succeed. Template and definition
    /// problems fail the same way every time.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            StepError::Spawn { .. }
                | StepError::Io { .. }
                | StepError::Exit { .. }
                | StepError::MissingOutput { .. }
        )
    }
}

fn describe_code(code: Option<i32>) -> String {
    match code {
        Some(code) => format!("exit code {}", code),
        None => "a signal".to_string(),
    }
}

fn describe_stderr(stderr: &str) -> String {
    let stderr = stderr.trim();
    if stderr.is_empty() {
        String::new()
    } else {
        format!(": {}", stderr)
    }
}
