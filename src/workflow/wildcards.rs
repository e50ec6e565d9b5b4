//! Wildcard Pattern Detection and Expansion
//!
//! A step whose inputs or outputs contain `{name}` groups is a template.
//! Expansion turns it into one concrete step per combination of wildcard
//! values. Values come from the step's `wildcard_files` (file stems) or
//! from the workflow-wide `wildcards` table.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;

use log::{debug, info};

use crate::error::{Result, WorkflowError};
use crate::workflow::{Step, Workflow};

/// Names reserved for command placeholders; never treated as wildcards.
const RESERVED: &[&str] = &["input", "inputs", "output", "outputs", "threads", "log"];

/// Extracts wildcard values from a list of file paths.
///
/// When every file shares one extension the stem is used, otherwise the
/// full file name.
///
/// # Example
/// ```
/// use rulegraph::workflow::wildcards::extract_wildcard_values;
///
/// let files = vec!["reads/s1.fastq".to_string(), "reads/s2.fastq".to_string()];
/// assert_eq!(extract_wildcard_values(&files), vec!["s1", "s2"]);
/// ```
pub fn extract_wildcard_values(files: &[String]) -> Vec<String> {
    let extensions: Vec<_> = files
        .iter()
        .map(|f| Path::new(f).extension().and_then(|e| e.to_str()))
        .collect();

    let common_ext = !extensions.is_empty()
        && extensions[0].is_some()
        && extensions.windows(2).all(|w| w[0] == w[1]);

    let mut seen = HashSet::new();
    files
        .iter()
        .map(|file| {
            let path = Path::new(file);
            let part = if common_ext {
                path.file_stem()
            } else {
                path.file_name()
            };
            part.and_then(|s| s.to_str()).unwrap_or(file).to_string()
        })
        .filter(|value| seen.insert(value.clone()))
        .collect()
}

/// Generates a pattern string from files.
///
/// # Example
/// ```
/// use rulegraph::workflow::wildcards::generate_pattern;
///
/// let files = vec!["reads/s1.fastq".to_string(), "reads/s2.fastq".to_string()];
/// assert_eq!(generate_pattern(&files, "sample"), Some("reads/{sample}.fastq".to_string()));
/// ```
pub fn generate_pattern(files: &[String], wildcard_name: &str) -> Option<String> {
    let path = Path::new(files.first()?);

    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| format!(".{}", e))
        .unwrap_or_default();

    let dir = path
        .parent()
        .and_then(|p| p.to_str())
        .filter(|s| !s.is_empty())
        .map(|s| format!("{}/", s))
        .unwrap_or_default();

    Some(format!("{}{{{}}}{}", dir, wildcard_name, ext))
}

/// Checks if a string contains at least one wildcard group.
pub fn has_wildcards(text: &str) -> bool {
    !extract_wildcard_names(text).is_empty()
}

/// Extracts wildcard names from a pattern, in order, without duplicates.
///
/// Groups that are not plain identifiers (`{input[0]}`, `{params.x}`) and
/// reserved placeholder names are ignored.
///
/// # Example
/// ```
/// use rulegraph::workflow::wildcards::extract_wildcard_names;
///
/// assert_eq!(extract_wildcard_names("{id}_{rep}/{id}.txt"), vec!["id", "rep"]);
/// ```
pub fn extract_wildcard_names(pattern: &str) -> Vec<String> {
    let mut names: Vec<String> = Vec::new();
    let mut rest = pattern;

    while let Some(open) = rest.find('{') {
        let after = &rest[open + 1..];
        let Some(close) = after.find('}') else {
            break;
        };
        let name = &after[..close];
        let is_identifier = !name.is_empty()
            && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
        if is_identifier && !RESERVED.contains(&name) && !names.iter().any(|n| n == name) {
            names.push(name.to_string());
        }
        rest = &after[close + 1..];
    }

    names
}

/// Replaces every `{name}` group bound in `bindings`.
pub fn substitute_wildcards(text: &str, bindings: &BTreeMap<String, String>) -> String {
    bindings.iter().fold(text.to_string(), |acc, (name, value)| {
        acc.replace(&format!("{{{}}}", name), value)
    })
}

/// Every combination of values, one binding map per combination.
fn cartesian(values: &BTreeMap<String, Vec<String>>) -> Vec<BTreeMap<String, String>> {
    values.iter().fold(vec![BTreeMap::new()], |combos, (name, vals)| {
        combos
            .iter()
            .flat_map(|combo| {
                vals.iter().map(move |v| {
                    let mut next = combo.clone();
                    next.insert(name.clone(), v.clone());
                    next
                })
            })
            .collect()
    })
}

/// True when both bindings agree on every name they share.
fn compatible(a: &BTreeMap<String, String>, b: &BTreeMap<String, String>) -> bool {
    a.iter().all(|(k, v)| b.get(k).map_or(true, |other| other == v))
}

fn wildcard_values_for(step: &Step, workflow: &Workflow, name: &str) -> Result<Vec<String>> {
    let values = if let Some(files) = step.wildcard_files.get(name) {
        extract_wildcard_values(files)
    } else if let Some(values) = workflow.wildcards.get(name) {
        values.clone()
    } else {
        return Err(WorkflowError::Wildcard(format!(
            "Step '{}': no values provided for wildcard '{{{}}}'",
            step.id, name
        )));
    };

    if values.is_empty() {
        return Err(WorkflowError::Wildcard(format!(
            "Step '{}': wildcard '{{{}}}' has an empty value list",
            step.id, name
        )));
    }
    Ok(values)
}

fn instantiate(step: &Step, binding: &BTreeMap<String, String>) -> Step {
    let mut instance = step.clone();
    let suffix: Vec<&str> = binding.values().map(String::as_str).collect();
    instance.id = format!("{}_{}", step.id, suffix.join("_"));
    instance.input = step
        .input
        .iter()
        .map(|i| substitute_wildcards(i, binding))
        .collect();
    instance.output = step
        .output
        .iter()
        .map(|o| substitute_wildcards(o, binding))
        .collect();
    instance.command = step.command.as_deref().map(|c| substitute_wildcards(c, binding));
    instance.script = step.script.as_deref().map(|s| substitute_wildcards(s, binding));
    instance.log = step.log.as_deref().map(|l| substitute_wildcards(l, binding));
    instance.wildcard_files.clear();
    instance.wildcards = binding.clone();
    instance
}

/// Expands every wildcard step of the workflow into concrete steps.
///
/// Explicit `previous` edges are rewritten: a dependency on an expanded
/// step becomes a dependency on each of its instances whose binding agrees
/// with the dependent's binding. `next` edges are rebuilt from `previous`.
pub fn expand_workflow_wildcards(workflow: &mut Workflow) -> Result<()> {
    if !workflow.steps.iter().any(Step::has_wildcards) {
        debug!("No wildcards detected in workflow");
        return Ok(());
    }

    let original_count = workflow.steps.len();
    let mut expanded: Vec<(Step, Vec<String>)> = Vec::new();
    let mut instances: HashMap<String, Vec<(String, BTreeMap<String, String>)>> = HashMap::new();

    for step in &workflow.steps {
        let names = step.wildcard_names();
        if names.is_empty() {
            expanded.push((step.clone(), step.previous.clone()));
            continue;
        }

        let mut values = BTreeMap::new();
        for name in &names {
            values.insert(name.clone(), wildcard_values_for(step, workflow, name)?);
        }

        let combos = cartesian(&values);
        info!(
            "Expanding step '{}' over {:?} into {} instances",
            step.id,
            names,
            combos.len()
        );

        let entry = instances.entry(step.id.clone()).or_default();
        for binding in combos {
            let instance = instantiate(step, &binding);
            debug!(
                "  Created step '{}' with input={:?}, output={:?}",
                instance.id, instance.input, instance.output
            );
            entry.push((instance.id.clone(), binding));
            expanded.push((instance, step.previous.clone()));
        }
    }

    let mut steps = Vec::with_capacity(expanded.len());
    for (mut step, original_previous) in expanded {
        let mut previous = Vec::new();
        for dep in &original_previous {
            match instances.get(dep) {
                Some(dep_instances) => previous.extend(
                    dep_instances
                        .iter()
                        .filter(|(_, binding)| compatible(binding, &step.wildcards))
                        .map(|(id, _)| id.clone()),
                ),
                None => previous.push(dep.clone()),
            }
        }
        step.previous = previous;
        step.next.clear();
        steps.push(step);
    }

    let mut dependents: HashMap<String, Vec<String>> = HashMap::new();
    for step in &steps {
        for dep in &step.previous {
            dependents.entry(dep.clone()).or_default().push(step.id.clone());
        }
    }
    for step in &mut steps {
        if let Some(next) = dependents.remove(&step.id) {
            step.next = next;
        }
    }

    workflow.steps = steps;
    info!(
        "Wildcard expansion: {} steps -> {} steps",
        original_count,
        workflow.steps.len()
    );
    Ok(())
}
