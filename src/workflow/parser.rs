//! Workflow Parser
//!
//! Loads workflow definitions from YAML. Dependencies are either given
//! explicitly through `previous`/`next`, or derived from input/output file
//! matching when no step declares any.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::Path;

use log::{debug, info, warn};

use crate::error::{Result, WorkflowError};

use super::model::Workflow;
use super::validator::validate_workflow;
use super::wildcards::expand_workflow_wildcards;

/// Loads, expands and validates a workflow from a YAML file.
///
/// # Example
///
/// ```rust,no_run
/// use rulegraph::workflow::load_workflow;
///
/// fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let workflow = load_workflow("workflow.yaml")?;
///     println!("Loaded {} steps", workflow.steps.len());
///     Ok(())
/// }
/// ```
pub fn load_workflow(path: impl AsRef<Path>) -> Result<Workflow> {
    let path = path.as_ref();
    info!("Loading workflow from: {}", path.display());

    let yaml_content = fs::read_to_string(path).map_err(|e| WorkflowError::io(path, e))?;
    debug!("YAML content loaded ({} bytes)", yaml_content.len());

    parse_workflow(&yaml_content)
}

/// Parses, expands and validates a workflow from YAML text.
pub fn parse_workflow(yaml: &str) -> Result<Workflow> {
    let mut workflow: Workflow = serde_yaml::from_str(yaml)?;
    info!("Parsed {} steps", workflow.steps.len());

    populate_dependencies(&mut workflow)?;
    validate_workflow(&mut workflow)?;

    Ok(workflow)
}

/// Expands wildcards and fills in dependency edges.
///
/// Supports two modes:
/// - **Explicit dependencies**: some step sets `previous`/`next`
/// - **Implicit dependencies**: edges derived from input/output file matching
pub fn populate_dependencies(workflow: &mut Workflow) -> Result<()> {
    let has_explicit_deps = workflow
        .steps
        .iter()
        .any(|s| !s.previous.is_empty() || !s.next.is_empty());

    if has_explicit_deps {
        info!("Using explicit dependencies from workflow definition");
        validate_explicit_dependencies(workflow)?;
        mirror_edges(workflow);
        expand_workflow_wildcards(workflow)?;
        mirror_edges(workflow);
    } else {
        info!("Deriving dependencies from input/output file matching");
        expand_workflow_wildcards(workflow)?;
        derive_dependencies_from_files(workflow)?;
    }

    Ok(())
}

/// Checks that explicit edges reference existing steps.
fn validate_explicit_dependencies(workflow: &Workflow) -> Result<()> {
    let step_ids: HashSet<&str> = workflow.steps.iter().map(|s| s.id.as_str()).collect();

    for step in &workflow.steps {
        for prev_id in &step.previous {
            if !step_ids.contains(prev_id.as_str()) {
                return Err(WorkflowError::Dependency(format!(
                    "Step '{}' references unknown dependency: '{}'",
                    step.id, prev_id
                )));
            }
        }
        for next_id in &step.next {
            if !step_ids.contains(next_id.as_str()) {
                return Err(WorkflowError::Dependency(format!(
                    "Step '{}' references unknown dependent: '{}'",
                    step.id, next_id
                )));
            }
        }
    }

    Ok(())
}

/// Makes `previous` and `next` describe the same edge set.
///
/// An edge given on either side is added to the other.
fn mirror_edges(workflow: &mut Workflow) {
    let mut edges: Vec<(String, String)> = Vec::new();
    for step in &workflow.steps {
        for prev in &step.previous {
            edges.push((prev.clone(), step.id.clone()));
        }
        for next in &step.next {
            edges.push((step.id.clone(), next.clone()));
        }
    }

    let mut previous: HashMap<String, Vec<String>> = HashMap::new();
    let mut next: HashMap<String, Vec<String>> = HashMap::new();
    for (from, to) in edges {
        let entry = previous.entry(to.clone()).or_default();
        if !entry.contains(&from) {
            entry.push(from.clone());
        }
        let entry = next.entry(from).or_default();
        if !entry.contains(&to) {
            entry.push(to);
        }
    }

    for step in &mut workflow.steps {
        let new_previous = previous.remove(&step.id).unwrap_or_default();
        let new_next = next.remove(&step.id).unwrap_or_default();
        if !step.previous.is_empty()
            && !step.next.is_empty()
            && (new_previous.len() != step.previous.len() || new_next.len() != step.next.len())
        {
            warn!(
                "Step '{}': previous/next edges were inconsistent and have been mirrored",
                step.id
            );
        }
        step.previous = new_previous;
        step.next = new_next;
    }
}

/// Derives dependencies from input/output file matching.
///
/// If step A produces file X and step B requires file X as input,
/// then B depends on A.
fn derive_dependencies_from_files(workflow: &mut Workflow) -> Result<()> {
    let mut output_to_step: HashMap<String, String> = HashMap::new();

    for step in &workflow.steps {
        for file in step.output_files() {
            if let Some(existing) = output_to_step.get(&file) {
                return Err(WorkflowError::Dependency(format!(
                    "Multiple steps produce '{}': '{}' and '{}'",
                    file, existing, step.id
                )));
            }
            output_to_step.insert(file, step.id.clone());
        }
    }

    let mut dependencies: HashMap<String, Vec<String>> = HashMap::new();
    let mut dependents: HashMap<String, Vec<String>> = HashMap::new();

    for step in &workflow.steps {
        for file in step.input_files() {
            if let Some(producer_id) = output_to_step.get(&file) {
                if *producer_id == step.id {
                    return Err(WorkflowError::Dependency(format!(
                        "Step '{}' consumes its own output '{}'",
                        step.id, file
                    )));
                }
                dependencies
                    .entry(step.id.clone())
                    .or_default()
                    .push(producer_id.clone());
                dependents
                    .entry(producer_id.clone())
                    .or_default()
                    .push(step.id.clone());
            }
        }
    }

    for step in &mut workflow.steps {
        step.previous = dependencies.remove(&step.id).unwrap_or_default();
        step.previous.sort();
        step.previous.dedup();

        step.next = dependents.remove(&step.id).unwrap_or_default();
        step.next.sort();
        step.next.dedup();

        if !step.previous.is_empty() {
            debug!("Step '{}' depends on: {:?}", step.id, step.previous);
        }
    }

    let edge_count: usize = workflow.steps.iter().map(|s| s.previous.len()).sum();
    info!("Derived {} dependency edges", edge_count);
    Ok(())
}

/// Saves a workflow to a YAML file.
pub fn save_workflow(workflow: &Workflow, path: impl AsRef<Path>) -> Result<()> {
    let path = path.as_ref();
    let yaml_content = serde_yaml::to_string(workflow)?;
    fs::write(path, yaml_content).map_err(|e| WorkflowError::io(path, e))?;
    info!("Workflow saved to: {}", path.display());
    Ok(())
}
