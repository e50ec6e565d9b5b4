//! Workflow Data Model
//!
//! Core data structures representing workflow steps and their relationships.
//!
//! # Example YAML Format
//!
//! ```yaml
//! name: annotate
//! config:
//!   evalue: 0.001
//! wildcards:
//!   sample: [liver, kidney]
//! steps:
//!   - id: align
//!     command: diamond blastp -q {input} -o {output} --evalue {config.evalue} -p {threads}
//!     input: proteins/{sample}.faa
//!     output: hits/{sample}.tsv
//!     threads: 8
//!
//!   - id: kegg
//!     script: scripts/kegg.py
//!     input: hits/{sample}.tsv
//!     output: annotated/{sample}.csv
//!     retry:
//!       max_retries: 5
//!       interval_ms: 10000
//! ```

use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use serde::de::{self, Deserializer};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Result, WorkflowError};
use crate::execution::retry::RetryPolicy;

use super::wildcards::{extract_wildcard_names, has_wildcards};

/// A single node of the task graph.
///
/// A step either runs a shell `command` template or an external `script`,
/// reading `input` files and producing `output` files.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Step {
    /// Unique identifier for this step
    pub id: String,

    /// Shell command template, see [`crate::workflow::placeholders`]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,

    /// Path to an external script run with its context in the environment
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub script: Option<String>,

    /// Program used to run the command or script (defaults: bash / by extension)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interpreter: Option<String>,

    #[serde(deserialize_with = "single_or_vec", default)]
    pub input: Vec<String>,

    #[serde(deserialize_with = "single_or_vec", default)]
    pub output: Vec<String>,

    /// File receiving the step's stdout and stderr
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log: Option<String>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub params: BTreeMap<String, Value>,

    /// IDs of steps that must complete before this step can run
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub previous: Vec<String>,

    /// IDs of steps that depend on this step (auto-populated)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub next: Vec<String>,

    /// Number of cores this step occupies while running
    #[serde(default = "default_threads")]
    pub threads: usize,

    #[serde(default, skip_serializing_if = "RetryPolicy::is_disabled")]
    pub retry: RetryPolicy,

    /// Concrete files per wildcard name, used to derive wildcard values
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub wildcard_files: BTreeMap<String, Vec<String>>,

    /// Values bound to this instance by wildcard expansion
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub wildcards: BTreeMap<String, String>,
}

fn default_threads() -> usize {
    1
}

/// Deserializes either a single string or array of strings into Vec<String>
fn single_or_vec<'de, D>(deserializer: D) -> std::result::Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let val = Value::deserialize(deserializer)?;
    match val {
        Value::Null => Ok(Vec::new()),
        Value::String(s) if s.is_empty() => Ok(Vec::new()),
        Value::String(s) => Ok(vec![s]),
        Value::Array(arr) => arr
            .into_iter()
            .map(|v| match v {
                Value::String(s) => Ok(s),
                _ => Err(de::Error::custom("Expected string in array")),
            })
            .collect(),
        _ => Err(de::Error::custom("Expected string or array of strings")),
    }
}

/// Splits comma-separated entries and drops empty ones.
pub(crate) fn split_file_list(files: &[String]) -> Vec<String> {
    files
        .iter()
        .flat_map(|s| s.split(','))
        .map(|part| part.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

fn resolve(base: &Path, file: &str) -> PathBuf {
    base.join(file)
}

fn modified(path: &Path) -> Option<SystemTime> {
    fs::metadata(path).and_then(|m| m.modified()).ok()
}

impl Step {
    /// Creates a step running a shell command template.
    ///
    /// # Example
    ///
    /// ```
    /// use rulegraph::workflow::Step;
    ///
    /// let step = Step::new("sort", "sort {input} > {output}")
    ///     .with_input("raw.txt")
    ///     .with_output("sorted.txt")
    ///     .with_threads(2);
    /// assert_eq!(step.output_files(), vec!["sorted.txt"]);
    /// ```
    pub fn new(id: impl Into<String>, command: impl Into<String>) -> Self {
        let mut step = Self::empty(id);
        step.command = Some(command.into().trim().to_string());
        step
    }

    /// Creates a step running an external script.
    pub fn script(id: impl Into<String>, path: impl Into<String>) -> Self {
        let mut step = Self::empty(id);
        step.script = Some(path.into().trim().to_string());
        step
    }

    fn empty(id: impl Into<String>) -> Self {
        Self {
            id: id.into().trim().to_string(),
            command: None,
            script: None,
            interpreter: None,
            input: Vec::new(),
            output: Vec::new(),
            log: None,
            params: BTreeMap::new(),
            previous: Vec::new(),
            next: Vec::new(),
            threads: 1,
            retry: RetryPolicy::default(),
            wildcard_files: BTreeMap::new(),
            wildcards: BTreeMap::new(),
        }
    }

    pub fn with_input(mut self, input: impl Into<String>) -> Self {
        self.input = vec![input.into()];
        self
    }

    pub fn with_inputs(mut self, inputs: Vec<String>) -> Self {
        self.input = inputs;
        self
    }

    pub fn with_output(mut self, output: impl Into<String>) -> Self {
        self.output = vec![output.into()];
        self
    }

    pub fn with_outputs(mut self, outputs: Vec<String>) -> Self {
        self.output = outputs;
        self
    }

    pub fn with_threads(mut self, threads: usize) -> Self {
        self.threads = threads;
        self
    }

    pub fn with_interpreter(mut self, interpreter: impl Into<String>) -> Self {
        self.interpreter = Some(interpreter.into());
        self
    }

    pub fn with_log(mut self, log: impl Into<String>) -> Self {
        self.log = Some(log.into());
        self
    }

    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Adds a dependency on another step.
    pub fn depends_on(mut self, step_id: impl Into<String>) -> Self {
        self.previous.push(step_id.into());
        self
    }

    /// Input files with comma-separated entries split out.
    pub fn input_files(&self) -> Vec<String> {
        split_file_list(&self.input)
    }

    /// Output files with comma-separated entries split out.
    pub fn output_files(&self) -> Vec<String> {
        split_file_list(&self.output)
    }

    /// Checks that the step declares outputs and all of them exist under `base`.
    pub fn outputs_exist(&self, base: &Path) -> bool {
        let outputs = self.output_files();
        !outputs.is_empty() && outputs.iter().all(|f| resolve(base, f).exists())
    }

    /// Output files that do not exist under `base`.
    pub fn missing_outputs(&self, base: &Path) -> Vec<String> {
        self.output_files()
            .into_iter()
            .filter(|f| !resolve(base, f).exists())
            .collect()
    }

    /// Returns true if any input is newer than the oldest output,
    /// or if outputs are missing.
    pub fn outputs_outdated(&self, base: &Path) -> bool {
        if !self.outputs_exist(base) {
            return true;
        }

        let newest_input = self
            .input_files()
            .iter()
            .filter_map(|f| modified(&resolve(base, f)))
            .max();

        let oldest_output = self
            .output_files()
            .iter()
            .filter_map(|f| modified(&resolve(base, f)))
            .min();

        match (newest_input, oldest_output) {
            (Some(input_time), Some(output_time)) => input_time > output_time,
            (None, Some(_)) => false,
            _ => true,
        }
    }

    /// Determines if this step has to run based on output existence and freshness.
    pub fn needs_run(&self, base: &Path) -> bool {
        self.outputs_outdated(base)
    }

    /// Checks if inputs, outputs or log name wildcards.
    pub fn has_wildcards(&self) -> bool {
        self.input.iter().any(|i| has_wildcards(i))
            || self.output.iter().any(|o| has_wildcards(o))
            || self.log.as_deref().is_some_and(has_wildcards)
    }

    /// Wildcard names used in inputs, outputs and log, in first-seen order.
    pub fn wildcard_names(&self) -> Vec<String> {
        let mut seen = HashSet::new();
        self.input
            .iter()
            .chain(self.output.iter())
            .chain(self.log.iter())
            .flat_map(|text| extract_wildcard_names(text))
            .filter(|name| seen.insert(name.clone()))
            .collect()
    }
}

/// A complete task graph.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct Workflow {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// Values available to command templates as `{config.KEY}`
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub config: BTreeMap<String, Value>,

    /// Workflow-wide wildcard values
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub wildcards: BTreeMap<String, Vec<String>>,

    /// Steps; topologically ordered once validated
    pub steps: Vec<Step>,
}

impl Workflow {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_steps(steps: Vec<Step>) -> Self {
        Self {
            steps,
            ..Self::default()
        }
    }

    /// Adds a step, rejecting duplicate ids.
    pub fn add_step(&mut self, step: Step) -> Result<()> {
        if self.steps.iter().any(|s| s.id == step.id) {
            return Err(WorkflowError::Dependency(format!(
                "Step '{}' already exists",
                step.id
            )));
        }
        self.steps.push(step);
        Ok(())
    }

    /// Removes a step and every edge pointing at it.
    pub fn remove_step(&mut self, id: &str) -> Result<Step> {
        let index = self
            .steps
            .iter()
            .position(|s| s.id == id)
            .ok_or_else(|| WorkflowError::Dependency(format!("Step '{}' not found", id)))?;

        for step in &mut self.steps {
            step.previous.retain(|s| s != id);
            step.next.retain(|s| s != id);
        }

        Ok(self.steps.remove(index))
    }

    pub fn get_step(&self, id: &str) -> Option<&Step> {
        self.steps.iter().find(|s| s.id == id)
    }

    pub fn get_step_mut(&mut self, id: &str) -> Option<&mut Step> {
        self.steps.iter_mut().find(|s| s.id == id)
    }

    /// Steps with no dependencies.
    pub fn root_steps(&self) -> Vec<&Step> {
        self.steps.iter().filter(|s| s.previous.is_empty()).collect()
    }

    /// Steps nothing depends on.
    pub fn leaf_steps(&self) -> Vec<&Step> {
        self.steps.iter().filter(|s| s.next.is_empty()).collect()
    }

    pub fn step_ids(&self) -> Vec<&str> {
        self.steps.iter().map(|s| s.id.as_str()).collect()
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Keeps only the steps needed to build `targets`.
    ///
    /// A target is either a step id or a declared output file. An empty
    /// target list leaves the workflow untouched.
    pub fn restrict_to_targets(&mut self, targets: &[String]) -> Result<()> {
        if targets.is_empty() {
            return Ok(());
        }

        let mut stack = Vec::new();
        for target in targets {
            let producer = self.get_step(target).or_else(|| {
                self.steps
                    .iter()
                    .find(|s| s.output_files().iter().any(|f| f == target))
            });
            match producer {
                Some(step) => stack.push(step.id.clone()),
                None => return Err(WorkflowError::UnknownTarget(target.clone())),
            }
        }

        let mut keep: HashSet<String> = HashSet::new();
        while let Some(id) = stack.pop() {
            if !keep.insert(id.clone()) {
                continue;
            }
            if let Some(step) = self.get_step(&id) {
                stack.extend(step.previous.iter().cloned());
            }
        }

        self.steps.retain(|s| keep.contains(&s.id));
        for step in &mut self.steps {
            step.previous.retain(|id| keep.contains(id));
            step.next.retain(|id| keep.contains(id));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;
    use tempfile::tempdir;

    #[test]
    fn test_step_creation() {
        let step = Step::new(" count ", "wc -l {input} > {output}")
            .with_input("input.txt")
            .with_output("output.txt")
            .with_threads(2);

        assert_eq!(step.id, "count");
        assert_eq!(step.command.as_deref(), Some("wc -l {input} > {output}"));
        assert!(step.script.is_none());
        assert_eq!(step.threads, 2);
        assert_eq!(step.input, vec!["input.txt"]);
    }

    #[test]
    fn test_script_step() {
        let step = Step::script("kegg", "scripts/kegg.py").with_interpreter("python3");
        assert!(step.command.is_none());
        assert_eq!(step.script.as_deref(), Some("scripts/kegg.py"));
        assert_eq!(step.interpreter.as_deref(), Some("python3"));
    }

    #[test]
    fn test_file_lists_split_commas() {
        let step = Step::new("t", "true")
            .with_inputs(vec!["a.txt, b.txt".to_string(), "c.txt".to_string()])
            .with_output("x.txt,,y.txt");
        assert_eq!(step.input_files(), vec!["a.txt", "b.txt", "c.txt"]);
        assert_eq!(step.output_files(), vec!["x.txt", "y.txt"]);
    }

    #[test]
    fn test_deserialize_single_or_list() {
        let yaml = r#"
id: s
command: echo hi
input: one.txt
output: [a.txt, b.txt]
"#;
        let step: Step = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(step.input, vec!["one.txt"]);
        assert_eq!(step.output, vec!["a.txt", "b.txt"]);
        assert_eq!(step.threads, 1);
        assert!(step.retry.is_disabled());
    }

    #[test]
    fn test_workflow_add_step_rejects_duplicate() {
        let mut workflow = Workflow::new();
        let step = Step::new("step1", "echo test");

        assert!(workflow.add_step(step.clone()).is_ok());
        assert!(workflow.add_step(step).is_err());
        assert_eq!(workflow.len(), 1);
    }

    #[test]
    fn test_workflow_root_leaf_detection() {
        let mut workflow = Workflow::from_steps(vec![
            Step::new("root", "echo root"),
            Step::new("leaf", "echo leaf").depends_on("root"),
        ]);
        workflow.get_step_mut("root").unwrap().next.push("leaf".to_string());

        assert_eq!(workflow.root_steps()[0].id, "root");
        assert_eq!(workflow.leaf_steps()[0].id, "leaf");
        assert_eq!(workflow.step_ids(), vec!["root", "leaf"]);
    }

    #[test]
    fn test_workflow_remove_cleans_references() {
        let mut workflow = Workflow::from_steps(vec![
            Step::new("step1", "echo 1"),
            Step::new("step2", "echo 2").depends_on("step1"),
        ]);
        workflow.steps[0].next.push("step2".to_string());

        let removed = workflow.remove_step("step1").unwrap();
        assert_eq!(removed.id, "step1");
        assert!(workflow.steps[0].previous.is_empty());
        assert!(workflow.remove_step("step1").is_err());
    }

    #[test]
    fn test_outputs_exist_relative_to_base() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("out.txt"), "x").unwrap();

        let step = Step::new("s", "true").with_output("out.txt");
        assert!(step.outputs_exist(dir.path()));
        assert!(step.missing_outputs(dir.path()).is_empty());

        let step = Step::new("s", "true").with_outputs(vec![
            "out.txt".to_string(),
            "gone.txt".to_string(),
        ]);
        assert!(!step.outputs_exist(dir.path()));
        assert_eq!(step.missing_outputs(dir.path()), vec!["gone.txt"]);
    }

    #[test]
    fn test_no_outputs_always_runs() {
        let dir = tempdir().unwrap();
        let step = Step::new("s", "echo test");
        assert!(!step.outputs_exist(dir.path()));
        assert!(step.needs_run(dir.path()));
    }

    #[test]
    fn test_outputs_outdated_when_input_newer() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("output.txt"), "output").unwrap();
        thread::sleep(Duration::from_millis(50));
        std::fs::write(dir.path().join("input.txt"), "input").unwrap();

        let step = Step::new("s", "cat {input} > {output}")
            .with_input("input.txt")
            .with_output("output.txt");
        assert!(step.outputs_outdated(dir.path()));
    }

    #[test]
    fn test_outputs_fresh_when_output_newer() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("input.txt"), "input").unwrap();
        thread::sleep(Duration::from_millis(50));
        std::fs::write(dir.path().join("output.txt"), "output").unwrap();

        let step = Step::new("s", "cat {input} > {output}")
            .with_input("input.txt")
            .with_output("output.txt");
        assert!(!step.needs_run(dir.path()));
    }

    #[test]
    fn test_outputs_without_inputs_are_fresh() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("seed.txt"), "x").unwrap();
        let step = Step::new("seed", "echo x > {output}").with_output("seed.txt");
        assert!(!step.needs_run(dir.path()));
    }

    #[test]
    fn test_wildcard_names_in_order() {
        let step = Step::new("s", "cat {input}")
            .with_input("{sample}/{lane}.fq")
            .with_output("{sample}.bam")
            .with_log("logs/{sample}.log");
        assert!(step.has_wildcards());
        assert_eq!(step.wildcard_names(), vec!["sample", "lane"]);

        let plain = Step::new("s", "echo {output}").with_output("x.txt");
        assert!(!plain.has_wildcards());
    }

    #[test]
    fn test_restrict_to_targets_by_id_and_file() {
        let mut workflow = Workflow::from_steps(vec![
            Step::new("a", "true").with_output("a.txt"),
            Step::new("b", "true").with_output("b.txt").depends_on("a"),
            Step::new("c", "true").with_output("c.txt").depends_on("b"),
            Step::new("d", "true").with_output("d.txt"),
        ]);
        workflow.steps[0].next.push("b".to_string());
        workflow.steps[1].next.push("c".to_string());

        let mut by_file = workflow.clone();
        by_file.restrict_to_targets(&["b.txt".to_string()]).unwrap();
        assert_eq!(by_file.step_ids(), vec!["a", "b"]);
        assert!(by_file.steps[1].next.is_empty());

        workflow
            .restrict_to_targets(&["d".to_string(), "a".to_string()])
            .unwrap();
        assert_eq!(workflow.step_ids(), vec!["a", "d"]);
    }

    #[test]
    fn test_restrict_to_unknown_target() {
        let mut workflow = Workflow::from_steps(vec![Step::new("a", "true")]);
        let err = workflow
            .restrict_to_targets(&["nope".to_string()])
            .unwrap_err();
        assert!(matches!(err, WorkflowError::UnknownTarget(t) if t == "nope"));
    }
}
