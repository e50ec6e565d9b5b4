//! Command Placeholders
//!
//! Renders a step's command template. Supported groups:
//!
//! | Group | Value |
//! |---|---|
//! | `{input}`, `{inputs}` | all input files, space separated |
//! | `{output}`, `{outputs}` | all output files, space separated |
//! | `{input[N]}`, `{output[N]}` | the N-th file |
//! | `{threads}` | the step's thread count |
//! | `{log}` | the step's log file |
//! | `{params.KEY}` | a step parameter |
//! | `{config.KEY}` | a workflow config value |
//! | `{wildcards.KEY}` | a bound wildcard value |
//!
//! `{{` and `}}` produce literal braces. Any other group is copied as is,
//! so shell `${VAR}` and awk programs pass through untouched.

use std::collections::BTreeMap;

use serde_json::Value;
use thiserror::Error;

use super::model::Step;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum PlaceholderError {
    #[error("{{{kind}[{index}]}} is out of range ({len} file(s) declared)")]
    IndexOutOfRange {
        kind: &'static str,
        index: usize,
        len: usize,
    },

    #[error("{{{namespace}.{key}}} is not defined")]
    UnknownKey { namespace: &'static str, key: String },

    #[error("{{log}} is used but no log file is declared")]
    NoLog,
}

/// Renders a command template for `step`.
///
/// # Example
///
/// ```
/// use std::collections::BTreeMap;
/// use rulegraph::workflow::{placeholders, Step};
///
/// let step = Step::new("sort", "sort -k{params.col} {input} > {output[0]}")
///     .with_input("raw.tsv")
///     .with_output("sorted.tsv")
///     .with_param("col", 2);
/// let template = step.command.as_deref().unwrap();
/// let command = placeholders::render(template, &step, &BTreeMap::new()).unwrap();
/// assert_eq!(command, "sort -k2 raw.tsv > sorted.tsv");
/// ```
pub fn render(
    template: &str,
    step: &Step,
    config: &BTreeMap<String, Value>,
) -> Result<String, PlaceholderError> {
    let inputs = step.input_files();
    let outputs = step.output_files();

    let mut rendered = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(pos) = rest.find(['{', '}']) {
        rendered.push_str(&rest[..pos]);
        let tail = &rest[pos..];

        if tail.starts_with("{{") {
            rendered.push('{');
            rest = &tail[2..];
            continue;
        }
        if tail.starts_with("}}") {
            rendered.push('}');
            rest = &tail[2..];
            continue;
        }
        if tail.starts_with('}') {
            rendered.push('}');
            rest = &tail[1..];
            continue;
        }

        let Some(close) = tail.find('}') else {
            rendered.push_str(tail);
            rest = "";
            break;
        };
        let token = &tail[1..close];
        match resolve(token, step, &inputs, &outputs, config)? {
            Some(value) => rendered.push_str(&value),
            None => rendered.push_str(&tail[..=close]),
        }
        rest = &tail[close + 1..];
    }
    rendered.push_str(rest);

    Ok(rendered)
}

fn resolve(
    token: &str,
    step: &Step,
    inputs: &[String],
    outputs: &[String],
    config: &BTreeMap<String, Value>,
) -> Result<Option<String>, PlaceholderError> {
    let value = match token {
        "input" | "inputs" => inputs.join(" "),
        "output" | "outputs" => outputs.join(" "),
        "threads" => step.threads.to_string(),
        "log" => step.log.clone().ok_or(PlaceholderError::NoLog)?,
        _ => {
            if let Some(index) = indexed(token, "input") {
                return pick("input", inputs, index).map(Some);
            }
            if let Some(index) = indexed(token, "output") {
                return pick("output", outputs, index).map(Some);
            }
            if let Some(key) = token.strip_prefix("params.") {
                return lookup("params", &step.params, key).map(Some);
            }
            if let Some(key) = token.strip_prefix("config.") {
                return lookup("config", config, key).map(Some);
            }
            if let Some(key) = token.strip_prefix("wildcards.") {
                return step.wildcards.get(key).cloned().map(Some).ok_or_else(|| {
                    PlaceholderError::UnknownKey {
                        namespace: "wildcards",
                        key: key.to_string(),
                    }
                });
            }
            return Ok(None);
        }
    };
    Ok(Some(value))
}

/// Parses `name[N]` into `N`.
fn indexed(token: &str, name: &str) -> Option<usize> {
    token
        .strip_prefix(name)?
        .strip_prefix('[')?
        .strip_suffix(']')?
        .trim()
        .parse()
        .ok()
}

fn pick(kind: &'static str, files: &[String], index: usize) -> Result<String, PlaceholderError> {
    files
        .get(index)
        .cloned()
        .ok_or(PlaceholderError::IndexOutOfRange {
            kind,
            index,
            len: files.len(),
        })
}

fn lookup(
    namespace: &'static str,
    values: &BTreeMap<String, Value>,
    key: &str,
) -> Result<String, PlaceholderError> {
    values
        .get(key)
        .map(value_to_string)
        .ok_or_else(|| PlaceholderError::UnknownKey {
            namespace,
            key: key.to_string(),
        })
}

/// Renders a JSON value the way a shell command wants it.
pub fn value_to_string(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        Value::Array(items) => items
            .iter()
            .map(value_to_string)
            .collect::<Vec<_>>()
            .join(" "),
        Value::Object(_) => value.to_string(),
    }
}
