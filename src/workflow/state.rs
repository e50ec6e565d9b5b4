//! Workflow State Persistence
//!
//! Records completed and failed steps so an interrupted or failed run can
//! resume where it stopped. State lives in
//! `{state_dir}/{workflow_stem}.state.json` and is removed once a run
//! finishes successfully.

use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use log::{debug, info};
use serde::{Deserialize, Serialize};

use crate::error::{Result, WorkflowError};

/// Persistent progress of one workflow.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct WorkflowState {
    /// Path to the workflow file this state belongs to
    pub workflow_path: String,

    pub completed_steps: BTreeSet<String>,

    pub failed_steps: BTreeSet<String>,

    pub updated_at: DateTime<Utc>,
}

impl WorkflowState {
    pub fn new(workflow_path: impl Into<String>) -> Self {
        Self {
            workflow_path: workflow_path.into(),
            completed_steps: BTreeSet::new(),
            failed_steps: BTreeSet::new(),
            updated_at: Utc::now(),
        }
    }

    /// Location of the state file for `workflow_path` inside `state_dir`.
    pub fn state_file_path(state_dir: &Path, workflow_path: &str) -> PathBuf {
        let stem = Path::new(workflow_path)
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("workflow");

        state_dir.join(format!("{}.state.json", stem))
    }

    /// Loads previously saved state.
    pub fn load(state_dir: &Path, workflow_path: &str) -> Result<Self> {
        let state_file = Self::state_file_path(state_dir, workflow_path);

        let content =
            fs::read_to_string(&state_file).map_err(|e| WorkflowError::io(&state_file, e))?;
        let state: WorkflowState = serde_json::from_str(&content)?;

        info!(
            "Loaded workflow state from {} ({} completed steps)",
            state_file.display(),
            state.completed_steps.len()
        );
        Ok(state)
    }

    /// Writes the state, creating `state_dir` when needed.
    pub fn save(&self, state_dir: &Path) -> Result<()> {
        fs::create_dir_all(state_dir).map_err(|e| WorkflowError::io(state_dir, e))?;

        let state_file = Self::state_file_path(state_dir, &self.workflow_path);
        let json = serde_json::to_string_pretty(self)?;
        fs::write(&state_file, json).map_err(|e| WorkflowError::io(&state_file, e))?;

        debug!("Saved workflow state to {}", state_file.display());
        Ok(())
    }

    /// Removes the state file if there is one.
    pub fn delete(&self, state_dir: &Path) -> Result<()> {
        let state_file = Self::state_file_path(state_dir, &self.workflow_path);
        if state_file.exists() {
            fs::remove_file(&state_file).map_err(|e| WorkflowError::io(&state_file, e))?;
            info!("Deleted state file: {}", state_file.display());
        }
        Ok(())
    }

    pub fn mark_completed(&mut self, step_id: &str) {
        self.completed_steps.insert(step_id.to_string());
        self.failed_steps.remove(step_id);
        self.updated_at = Utc::now();
    }

    pub fn mark_failed(&mut self, step_id: &str) {
        self.completed_steps.remove(step_id);
        self.failed_steps.insert(step_id.to_string());
        self.updated_at = Utc::now();
    }

    /// True if this state carries progress from an earlier run.
    pub fn is_resume(&self) -> bool {
        !self.completed_steps.is_empty() || !self.failed_steps.is_empty()
    }

    pub fn clear(&mut self) {
        self.completed_steps.clear();
        self.failed_steps.clear();
        self.updated_at = Utc::now();
    }
}
