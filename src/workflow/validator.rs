//! Workflow Validation
//!
//! Checks step fields, reference integrity, output uniqueness and command
//! placeholders, then orders the steps topologically (Kahn's algorithm),
//! which also detects dependency cycles.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet};

use log::{debug, info, warn};
use thiserror::Error;

use crate::error::{Result, WorkflowError};

use super::model::{Step, Workflow};
use super::placeholders::{self, PlaceholderError};

/// A single problem found in a workflow definition.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ValidationError {
    #[error("workflow has no steps")]
    EmptyWorkflow,

    #[error("duplicate step ID: '{0}'")]
    DuplicateStepId(String),

    #[error("step has an empty or whitespace-only ID")]
    EmptyStepId,

    #[error("step '{0}' has neither a command nor a script")]
    MissingAction(String),

    #[error("step '{0}' declares both a command and a script")]
    ConflictingAction(String),

    #[error("step '{0}' requests zero threads")]
    ZeroThreads(String),

    #[error("step '{step}' references unknown step '{reference}'")]
    InvalidReference { step: String, reference: String },

    #[error("'{file}' is produced by both '{first}' and '{second}'")]
    DuplicateOutput {
        file: String,
        first: String,
        second: String,
    },

    #[error("step '{step}': {source}")]
    Placeholder {
        step: String,
        source: PlaceholderError,
    },

    #[error("workflow contains a dependency cycle involving: {}", .0.join(", "))]
    CyclicDependency(Vec<String>),
}

/// Validates a single step's fields.
fn validate_step(step: &Step, workflow: &Workflow) -> Vec<ValidationError> {
    let mut errors = Vec::new();

    if step.id.trim().is_empty() {
        errors.push(ValidationError::EmptyStepId);
        return errors;
    }

    match (&step.command, &step.script) {
        (Some(_), Some(_)) => errors.push(ValidationError::ConflictingAction(step.id.clone())),
        (None, None) => errors.push(ValidationError::MissingAction(step.id.clone())),
        (Some(command), None) if command.trim().is_empty() => {
            errors.push(ValidationError::MissingAction(step.id.clone()))
        }
        (None, Some(script)) if script.trim().is_empty() => {
            errors.push(ValidationError::MissingAction(step.id.clone()))
        }
        _ => {}
    }

    if step.threads == 0 {
        errors.push(ValidationError::ZeroThreads(step.id.clone()));
    }

    if let Some(command) = &step.command {
        if let Err(source) = placeholders::render(command, step, &workflow.config) {
            errors.push(ValidationError::Placeholder {
                step: step.id.clone(),
                source,
            });
        }

        if command.contains("{input}") && step.input.is_empty() {
            warn!("Step '{}': command uses {{input}} but no input specified", step.id);
        }
        if command.contains("{output}") && step.output.is_empty() {
            warn!("Step '{}': command uses {{output}} but no output specified", step.id);
        }
    }

    errors
}

/// Validates the entire workflow structure.
///
/// Every problem found is reported at once. On success the steps are
/// reordered so that dependencies come before dependents.
pub fn validate_workflow(workflow: &mut Workflow) -> Result<()> {
    info!("Validating workflow with {} steps", workflow.steps.len());

    if workflow.steps.is_empty() {
        return Err(WorkflowError::Validation(vec![ValidationError::EmptyWorkflow]));
    }

    let mut errors = Vec::new();
    let mut seen_ids: HashSet<&str> = HashSet::new();
    for step in &workflow.steps {
        if !seen_ids.insert(step.id.as_str()) {
            errors.push(ValidationError::DuplicateStepId(step.id.clone()));
        }
    }

    let mut producers: HashMap<String, &str> = HashMap::new();
    for step in &workflow.steps {
        errors.extend(validate_step(step, workflow));

        for reference in step.previous.iter().chain(step.next.iter()) {
            if !seen_ids.contains(reference.as_str()) {
                errors.push(ValidationError::InvalidReference {
                    step: step.id.clone(),
                    reference: reference.clone(),
                });
            }
        }

        for file in step.output_files() {
            if let Some(first) = producers.get(&file) {
                errors.push(ValidationError::DuplicateOutput {
                    file: file.clone(),
                    first: first.to_string(),
                    second: step.id.clone(),
                });
            } else {
                producers.insert(file, step.id.as_str());
            }
        }
    }

    if !errors.is_empty() {
        return Err(WorkflowError::Validation(errors));
    }

    topological_sort(workflow)?;

    info!("Workflow validated: {} steps", workflow.steps.len());
    Ok(())
}

/// Orders steps so that every step follows all of its `previous` steps.
///
/// Ties keep declaration order. Steps left over once no more roots can be
/// removed sit on or behind a cycle.
pub(crate) fn topological_sort(workflow: &mut Workflow) -> Result<()> {
    let index: HashMap<&str, usize> = workflow
        .steps
        .iter()
        .enumerate()
        .map(|(i, s)| (s.id.as_str(), i))
        .collect();

    let mut in_degree: Vec<usize> = vec![0; workflow.steps.len()];
    let mut successors: Vec<Vec<usize>> = vec![Vec::new(); workflow.steps.len()];
    for (i, step) in workflow.steps.iter().enumerate() {
        let deps: HashSet<usize> = step
            .previous
            .iter()
            .filter_map(|dep| index.get(dep.as_str()).copied())
            .collect();
        in_degree[i] = deps.len();
        for dep in deps {
            successors[dep].push(i);
        }
    }

    // Lowest declaration index first among the steps that are ready.
    let mut ready: BinaryHeap<Reverse<usize>> = (0..workflow.steps.len())
        .filter(|&i| in_degree[i] == 0)
        .map(Reverse)
        .collect();
    let mut order = Vec::with_capacity(workflow.steps.len());

    while let Some(Reverse(current)) = ready.pop() {
        order.push(current);
        for &successor in &successors[current] {
            in_degree[successor] -= 1;
            if in_degree[successor] == 0 {
                ready.push(Reverse(successor));
            }
        }
    }

    if order.len() != workflow.steps.len() {
        let stuck: Vec<String> = (0..workflow.steps.len())
            .filter(|&i| in_degree[i] > 0)
            .map(|i| workflow.steps[i].id.clone())
            .collect();
        return Err(WorkflowError::Validation(vec![
            ValidationError::CyclicDependency(stuck),
        ]));
    }

    let mut slots: Vec<Option<Step>> = workflow.steps.drain(..).map(Some).collect();
    workflow.steps = order
        .into_iter()
        .filter_map(|i| slots[i].take())
        .collect();

    debug!("Topological order: {:?}", workflow.step_ids());
    Ok(())
}
