//! Individual Step Execution
//!
//! Handles the execution of a single workflow step including:
//! - Command placeholder rendering
//! - Script generation for command steps
//! - Interpreter selection and context export for script steps
//! - Output directory creation, logging and output verification
//! - Retries according to the step's policy

use std::collections::{BTreeMap, HashMap};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, error, warn};
use once_cell::sync::Lazy;
use serde::Serialize;
use serde_json::Value;
use tempfile::NamedTempFile;

use crate::error::StepError;
use crate::workflow::{placeholders, Step};

/// Interpreter used for command steps unless the step names another.
const DEFAULT_SHELL: &str = "bash";

/// Number of stderr lines kept in a failure message.
const STDERR_TAIL_LINES: usize = 20;

/// Interpreters for script steps, keyed by file extension.
static SCRIPT_INTERPRETERS: Lazy<HashMap<&'static str, &'static str>> = Lazy::new(|| {
    HashMap::from([
        ("py", "python3"),
        ("R", "Rscript"),
        ("r", "Rscript"),
        ("sh", "bash"),
        ("bash", "bash"),
        ("pl", "perl"),
        ("rb", "ruby"),
        ("jl", "julia"),
    ])
});

/// What a step needs from its surroundings.
#[derive(Debug, Clone, Default)]
pub struct StepContext {
    /// Directory commands run in and relative paths resolve against
    pub working_dir: Option<PathBuf>,
    /// Workflow-level config values
    pub config: Arc<BTreeMap<String, Value>>,
}

impl StepContext {
    pub fn new(working_dir: Option<PathBuf>, config: BTreeMap<String, Value>) -> Self {
        Self {
            working_dir,
            config: Arc::new(config),
        }
    }

    /// Base directory for relative paths.
    pub fn base_dir(&self) -> PathBuf {
        self.working_dir
            .clone()
            .unwrap_or_else(|| PathBuf::from("."))
    }
}

/// Outcome of a successful step.
#[derive(Debug, Clone, PartialEq)]
pub struct StepReport {
    pub attempts: u32,
    pub duration: Duration,
}

/// Everything a script step can read from `RULEGRAPH_CONTEXT`.
#[derive(Serialize)]
struct ScriptContext<'a> {
    step: &'a str,
    input: Vec<String>,
    output: Vec<String>,
    params: &'a BTreeMap<String, Value>,
    config: &'a BTreeMap<String, Value>,
    wildcards: &'a BTreeMap<String, String>,
    threads: usize,
    log: Option<&'a str>,
}

/// Runs a step, retrying failed attempts as its retry policy allows.
pub fn execute_with_retry(step: &Step, ctx: &StepContext) -> Result<StepReport, StepError> {
    let started = Instant::now();
    let mut retried = 0;

    loop {
        match execute_step(step, ctx) {
            Ok(_) => {
                return Ok(StepReport {
                    attempts: retried + 1,
                    duration: started.elapsed(),
                })
            }
            Err(e) => match step.retry.delay_for(retried) {
                Some(delay) if e.is_retryable() => {
                    warn!(
                        "Step '{}' attempt {} failed: {}. Retrying in {:?}",
                        step.id,
                        retried + 1,
                        e,
                        delay
                    );
                    thread::sleep(delay);
                    retried += 1;
                }
                _ => return Err(e),
            },
        }
    }
}

/// Executes a single step once.
///
/// Command steps are rendered, written to a temporary script and run with
/// the step's interpreter (bash by default). Script steps run the named
/// file with an interpreter chosen by extension and receive their inputs,
/// outputs and parameters through environment variables:
///
/// - `RULEGRAPH_CONTEXT`: JSON object with every field
/// - `RULEGRAPH_INPUT_<i>` / `RULEGRAPH_OUTPUT_<i>`: individual files
/// - `RULEGRAPH_STEP`, `RULEGRAPH_THREADS`
pub fn execute_step(step: &Step, ctx: &StepContext) -> Result<StepReport, StepError> {
    let started = Instant::now();
    let base = ctx.base_dir();

    ensure_parent_directories(step, &base)?;

    // The temporary script must outlive the child process.
    let (mut cmd, _script_guard) = match (&step.command, &step.script) {
        (Some(command), _) => {
            let rendered = placeholders::render(command, step, &ctx.config).map_err(|source| {
                StepError::Placeholder {
                    step: step.id.clone(),
                    source,
                }
            })?;
            let interpreter = step.interpreter.as_deref().unwrap_or(DEFAULT_SHELL);
            let script = create_execution_script(step, interpreter, &rendered)?;
            let mut cmd = Command::new(interpreter);
            cmd.arg(script.path());
            (cmd, Some(script))
        }
        (None, Some(script)) => (script_command(step, script, ctx, &base)?, None),
        (None, None) => return Err(StepError::NoAction(step.id.clone())),
    };

    cmd.env("RULEGRAPH_STEP", &step.id)
        .env("RULEGRAPH_THREADS", step.threads.to_string());
    if let Some(dir) = &ctx.working_dir {
        cmd.current_dir(dir);
        debug!("Executing '{}' in directory: {}", step.id, dir.display());
    }

    let program = cmd.get_program().to_string_lossy().into_owned();
    let output = cmd.output().map_err(|source| StepError::Spawn {
        step: step.id.clone(),
        program,
        source,
    })?;

    if let Some(log) = &step.log {
        write_log(step, &base.join(log), &output)?;
    }

    let stdout = String::from_utf8_lossy(&output.stdout);
    if !stdout.trim().is_empty() {
        debug!("Step '{}' output:\n{}", step.id, stdout);
    }

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        error!(
            "Step '{}' failed with exit code: {:?}",
            step.id,
            output.status.code()
        );
        return Err(StepError::Exit {
            step: step.id.clone(),
            code: output.status.code(),
            stderr: tail(&stderr, STDERR_TAIL_LINES),
        });
    }

    let missing = step.missing_outputs(&base);
    if !missing.is_empty() {
        return Err(StepError::MissingOutput {
            step: step.id.clone(),
            missing,
        });
    }

    debug!("Step '{}' completed successfully", step.id);
    Ok(StepReport {
        attempts: 1,
        duration: started.elapsed(),
    })
}

/// Builds the command running an external script.
fn script_command(
    step: &Step,
    script: &str,
    ctx: &StepContext,
    base: &Path,
) -> Result<Command, StepError> {
    let inputs = step.input_files();
    let outputs = step.output_files();

    let context = ScriptContext {
        step: &step.id,
        input: inputs.clone(),
        output: outputs.clone(),
        params: &step.params,
        config: &ctx.config,
        wildcards: &step.wildcards,
        threads: step.threads,
        log: step.log.as_deref(),
    };
    let context_json = serde_json::to_string(&context).map_err(|source| StepError::Context {
        step: step.id.clone(),
        source,
    })?;

    let interpreter = step
        .interpreter
        .as_deref()
        .or_else(|| interpreter_for(script));

    let mut cmd = match interpreter {
        Some(interpreter) => {
            let mut cmd = Command::new(interpreter);
            cmd.arg(script);
            cmd
        }
        None => Command::new(base.join(script)),
    };

    cmd.env("RULEGRAPH_CONTEXT", context_json);
    for (i, file) in inputs.iter().enumerate() {
        cmd.env(format!("RULEGRAPH_INPUT_{}", i), file);
    }
    for (i, file) in outputs.iter().enumerate() {
        cmd.env(format!("RULEGRAPH_OUTPUT_{}", i), file);
    }
    Ok(cmd)
}

/// Picks an interpreter from the script's extension.
fn interpreter_for(script: &str) -> Option<&'static str> {
    let ext = Path::new(script).extension()?.to_str()?;
    SCRIPT_INTERPRETERS.get(ext).copied()
}

/// Creates parent directories for output and log files.
fn ensure_parent_directories(step: &Step, base: &Path) -> Result<(), StepError> {
    for file in step.output_files().iter().chain(step.log.iter()) {
        let path = base.join(file);
        let Some(parent) = path.parent() else {
            continue;
        };
        if parent.as_os_str().is_empty() || parent.exists() {
            continue;
        }
        fs::create_dir_all(parent).map_err(|source| StepError::Io {
            step: step.id.clone(),
            path: parent.to_path_buf(),
            source,
        })?;
        debug!("Created directory: {}", parent.display());
    }
    Ok(())
}

/// Writes the rendered command to a temporary script file.
fn create_execution_script(
    step: &Step,
    interpreter: &str,
    command_text: &str,
) -> Result<NamedTempFile, StepError> {
    let io_error = |source| StepError::Io {
        step: step.id.clone(),
        path: std::env::temp_dir(),
        source,
    };

    let mut file = tempfile::Builder::new()
        .prefix(&format!("rulegraph-{}-", step.id))
        .suffix(".sh")
        .tempfile()
        .map_err(io_error)?;

    let strict_mode = if interpreter == "bash" {
        "set -euo pipefail"
    } else {
        "set -e"
    };
    writeln!(file, "#!/usr/bin/env {}", interpreter).map_err(io_error)?;
    writeln!(file, "{}", strict_mode).map_err(io_error)?;
    writeln!(file, "{}", command_text).map_err(io_error)?;
    file.flush().map_err(io_error)?;

    Ok(file)
}

/// Appends a step's stdout and stderr to its log file.
fn write_log(step: &Step, path: &Path, output: &Output) -> Result<(), StepError> {
    let io_error = |source| StepError::Io {
        step: step.id.clone(),
        path: path.to_path_buf(),
        source,
    };

    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(io_error)?;
    writeln!(
        file,
        "# {} {} (exit: {:?})",
        chrono::Utc::now().to_rfc3339(),
        step.id,
        output.status.code()
    )
    .map_err(io_error)?;
    file.write_all(&output.stdout).map_err(io_error)?;
    file.write_all(&output.stderr).map_err(io_error)?;
    Ok(())
}

/// Last `lines` lines of `text`.
fn tail(text: &str, lines: usize) -> String {
    let all: Vec<&str> = text.lines().collect();
    let start = all.len().saturating_sub(lines);
    all[start..].join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::retry::{RetryPolicy, RetryStrategy};
    use tempfile::tempdir;

    fn ctx_in(dir: &Path) -> StepContext {
        StepContext::new(Some(dir.to_path_buf()), BTreeMap::new())
    }

    #[test]
    fn test_interpreter_for() {
        assert_eq!(interpreter_for("scripts/kegg.py"), Some("python3"));
        assert_eq!(interpreter_for("plot.R"), Some("Rscript"));
        assert_eq!(interpreter_for("run.sh"), Some("bash"));
        assert_eq!(interpreter_for("tool"), None);
        assert_eq!(interpreter_for("data.xyz"), None);
    }

    #[test]
    fn test_tail() {
        assert_eq!(tail("a\nb\nc\n", 2), "b\nc");
        assert_eq!(tail("only", 5), "only");
        assert_eq!(tail("", 5), "");
    }

    #[test]
    fn test_create_execution_script() {
        let step = Step::new("script_test", "echo 'hello world'");
        let script = create_execution_script(&step, "bash", "echo 'hello world'").unwrap();

        let content = fs::read_to_string(script.path()).unwrap();
        assert!(content.starts_with("#!/usr/bin/env bash"));
        assert!(content.contains("set -euo pipefail"));
        assert!(content.contains("echo 'hello world'"));

        let path = script.path().to_path_buf();
        drop(script);
        assert!(!path.exists());
    }

    #[test]
    fn test_create_execution_script_plain_sh() {
        let step = Step::new("sh_test", "echo hi");
        let script = create_execution_script(&step, "sh", "echo hi").unwrap();
        let content = fs::read_to_string(script.path()).unwrap();
        assert!(content.contains("set -e\n"));
        assert!(!content.contains("pipefail"));
    }

    #[test]
    fn test_ensure_parent_directories() {
        let dir = tempdir().unwrap();
        let step = Step::new("s", "true")
            .with_output("sub1/sub2/output.txt")
            .with_log("logs/s.log");

        ensure_parent_directories(&step, dir.path()).unwrap();
        assert!(dir.path().join("sub1/sub2").is_dir());
        assert!(dir.path().join("logs").is_dir());
    }

    #[test]
    fn test_execute_command_step() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("in.txt"), "b\na\n").unwrap();

        let step = Step::new("sort", "sort {input} > {output}")
            .with_input("in.txt")
            .with_output("out/sorted.txt");

        execute_step(&step, &ctx_in(dir.path())).unwrap();
        let sorted = fs::read_to_string(dir.path().join("out/sorted.txt")).unwrap();
        assert_eq!(sorted, "a\nb\n");
    }

    #[test]
    fn test_execute_uses_config_and_env() {
        let dir = tempdir().unwrap();
        let mut config = BTreeMap::new();
        config.insert("greeting".to_string(), Value::from("hi"));
        let ctx = StepContext::new(Some(dir.path().to_path_buf()), config);

        let step = Step::new(
            "greet",
            "echo {config.greeting} $RULEGRAPH_STEP $RULEGRAPH_THREADS > {output}",
        )
        .with_output("greet.txt")
        .with_threads(3);

        execute_step(&step, &ctx).unwrap();
        let text = fs::read_to_string(dir.path().join("greet.txt")).unwrap();
        assert_eq!(text.trim(), "hi greet 3");
    }

    #[test]
    fn test_execute_failure_reports_stderr() {
        let dir = tempdir().unwrap();
        let step = Step::new("bad", "echo oops >&2; exit 3");

        let err = execute_step(&step, &ctx_in(dir.path())).unwrap_err();
        match err {
            StepError::Exit { code, stderr, .. } => {
                assert_eq!(code, Some(3));
                assert_eq!(stderr, "oops");
            }
            other => panic!("unexpected error: {}", other),
        }
    }

    #[test]
    fn test_execute_pipefail() {
        let dir = tempdir().unwrap();
        let step = Step::new("pipe", "false | cat");
        assert!(execute_step(&step, &ctx_in(dir.path())).is_err());
    }

    #[test]
    fn test_execute_missing_output() {
        let dir = tempdir().unwrap();
        let step = Step::new("lazy", "true").with_output("never.txt");

        let err = execute_step(&step, &ctx_in(dir.path())).unwrap_err();
        match err {
            StepError::MissingOutput { missing, .. } => assert_eq!(missing, vec!["never.txt"]),
            other => panic!("unexpected error: {}", other),
        }
    }

    #[test]
    fn test_execute_writes_log() {
        let dir = tempdir().unwrap();
        let step = Step::new("chatty", "echo to-stdout; echo to-stderr >&2")
            .with_log("logs/chatty.log");

        execute_step(&step, &ctx_in(dir.path())).unwrap();
        let log = fs::read_to_string(dir.path().join("logs/chatty.log")).unwrap();
        assert!(log.contains("chatty"));
        assert!(log.contains("to-stdout"));
        assert!(log.contains("to-stderr"));
    }

    #[test]
    fn test_execute_script_step_reads_context() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("hits.tsv"), "q1\tt1\n").unwrap();
        fs::write(
            dir.path().join("annotate.sh"),
            "cp \"$RULEGRAPH_INPUT_0\" \"$RULEGRAPH_OUTPUT_0\"\n\
             echo \"$RULEGRAPH_CONTEXT\" > context.json\n",
        )
        .unwrap();

        let mut step = Step::script("annotate", "annotate.sh")
            .with_input("hits.tsv")
            .with_output("annotated.tsv")
            .with_param("db", "kegg");
        step.wildcards.insert("sample".to_string(), "liver".to_string());

        execute_step(&step, &ctx_in(dir.path())).unwrap();

        let copied = fs::read_to_string(dir.path().join("annotated.tsv")).unwrap();
        assert_eq!(copied, "q1\tt1\n");

        let context: Value =
            serde_json::from_str(&fs::read_to_string(dir.path().join("context.json")).unwrap())
                .unwrap();
        assert_eq!(context["step"], "annotate");
        assert_eq!(context["input"][0], "hits.tsv");
        assert_eq!(context["params"]["db"], "kegg");
        assert_eq!(context["wildcards"]["sample"], "liver");
    }

    #[test]
    fn test_execute_without_action() {
        let mut step = Step::new("empty", "x");
        step.command = None;
        let err = execute_step(&step, &StepContext::default()).unwrap_err();
        assert!(matches!(err, StepError::NoAction(_)));
    }

    #[test]
    fn test_retry_until_success() {
        let dir = tempdir().unwrap();
        let step = Step::new(
            "flaky",
            "n=$(cat attempts 2>/dev/null || echo 0); n=$((n+1)); echo $n > attempts; \
             if [ $n -lt 3 ]; then exit 1; fi; echo done > {output}",
        )
        .with_output("done.txt")
        .with_retry(RetryPolicy::new(3, RetryStrategy::Constant, 10));

        let report = execute_with_retry(&step, &ctx_in(dir.path())).unwrap();
        assert_eq!(report.attempts, 3);
        assert!(dir.path().join("done.txt").exists());
    }

    #[test]
    fn test_retry_gives_up() {
        let dir = tempdir().unwrap();
        let step = Step::new("doomed", "exit 1")
            .with_retry(RetryPolicy::new(1, RetryStrategy::Constant, 10));

        let err = execute_with_retry(&step, &ctx_in(dir.path())).unwrap_err();
        assert!(matches!(err, StepError::Exit { .. }));
    }

    #[test]
    fn test_placeholder_errors_are_not_retried() {
        let dir = tempdir().unwrap();
        let step = Step::new("broken", "cat {input[4]}")
            .with_retry(RetryPolicy::new(5, RetryStrategy::Constant, 10_000));

        let started = Instant::now();
        let err = execute_with_retry(&step, &ctx_in(dir.path())).unwrap_err();
        assert!(matches!(err, StepError::Placeholder { .. }));
        assert!(started.elapsed() < Duration::from_secs(5));
    }
}
