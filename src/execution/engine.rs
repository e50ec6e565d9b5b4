//! Workflow Execution Engine
//!
//! The core engine that orchestrates workflow execution including:
//! - Parallel step scheduling under a job limit and a core budget
//! - Skipping steps whose outputs are up to date
//! - Resource monitoring
//! - Pause/resume functionality via file-based signaling
//! - State persistence for resuming interrupted runs

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{channel, Sender};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use colored::Colorize;
use log::{error, info, warn};

use crate::config::RunConfig;
use crate::error::{Result, StepError, WorkflowError};
use crate::monitoring::{EventType, ExecutionTimeline, ResourceMonitor};
use crate::workflow::{placeholders, ExecutionPlanner, Step, Workflow, WorkflowState};

use super::step::{execute_with_retry, StepContext, StepReport};

/// Interval for checking the pause flag file.
const PAUSE_CHECK_INTERVAL: Duration = Duration::from_millis(500);

/// Interval for resource monitoring samples.
const MONITOR_SAMPLE_INTERVAL: Duration = Duration::from_millis(500);

/// Width of the Gantt chart bars.
const TIMELINE_WIDTH: usize = 50;

/// Workflow name used for the state file when none was set.
const DEFAULT_WORKFLOW_PATH: &str = "workflow.yaml";

/// Message a worker sends when its step finishes.
type Completion = (String, std::result::Result<StepReport, StepError>);

/// What happened to each step during a run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunSummary {
    /// Steps that ran (or would run, under dry-run)
    pub executed: Vec<String>,
    /// Steps that were up to date or completed in an earlier run
    pub skipped: Vec<String>,
    pub failed: Vec<String>,
    /// Steps not run because a dependency failed
    pub blocked: Vec<String>,
    pub elapsed: Duration,
}

/// Workflow execution engine.
///
/// # Example
///
/// ```rust,no_run
/// use rulegraph::execution::Engine;
/// use rulegraph::load_workflow;
///
/// fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let workflow = load_workflow("pipeline.yaml")?;
///     let mut engine = Engine::new(workflow);
///     engine.set_workflow_path("pipeline.yaml");
///     engine.set_max_parallel(4);
///     engine.set_working_dir("/data/analysis");
///
///     let summary = engine.run()?;
///     println!("{} steps executed", summary.executed.len());
///     Ok(())
/// }
/// ```
pub struct Engine {
    workflow: Workflow,
    workflow_path: String,
    config: RunConfig,
}

impl Engine {
    /// Creates an engine with default settings.
    pub fn new(workflow: Workflow) -> Self {
        Self::with_config(workflow, RunConfig::default())
    }

    pub fn with_config(workflow: Workflow, config: RunConfig) -> Self {
        Self {
            workflow,
            workflow_path: String::new(),
            config,
        }
    }

    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    /// Sets the workflow file path (used to name the state file).
    pub fn set_workflow_path(&mut self, path: impl Into<String>) {
        self.workflow_path = path.into();
    }

    pub fn set_max_parallel(&mut self, max: usize) {
        self.config.max_parallel = max;
    }

    pub fn set_max_threads(&mut self, max: usize) {
        self.config.max_threads = max;
    }

    pub fn set_dry_run(&mut self, dry_run: bool) {
        self.config.dry_run = dry_run;
    }

    pub fn set_force(&mut self, force: bool) {
        self.config.force = force;
    }

    pub fn set_keep_going(&mut self, keep_going: bool) {
        self.config.keep_going = keep_going;
    }

    /// Sets the path for pause/resume signaling.
    pub fn set_pause_flag_path(&mut self, path: impl Into<PathBuf>) {
        self.config.pause_flag_path = Some(path.into());
    }

    /// Sets the working directory for step execution.
    pub fn set_working_dir(&mut self, dir: impl Into<PathBuf>) {
        self.config.working_dir = Some(dir.into());
    }

    pub fn set_state_dir(&mut self, dir: impl Into<PathBuf>) {
        self.config.state_dir = dir.into();
    }

    pub fn set_show_timeline(&mut self, show: bool) {
        self.config.show_timeline = show;
    }

    fn base_dir(&self) -> PathBuf {
        self.config
            .working_dir
            .clone()
            .unwrap_or_else(|| PathBuf::from("."))
    }

    /// Executes the workflow.
    ///
    /// 1. Loads saved state unless forced, dropping completed steps whose
    ///    outputs have disappeared
    /// 2. Samples resource usage in the background
    /// 3. Runs or skips each step once its dependencies are done
    /// 4. Saves state after each finished step
    /// 5. Deletes the state after a fully successful run
    ///
    /// # Returns
    ///
    /// * `Ok(RunSummary)` - Every step ran or was up to date
    /// * `Err(WorkflowError::StepsFailed)` - One or more steps failed
    pub fn run(&mut self) -> Result<RunSummary> {
        let start_time = Instant::now();

        if self.workflow_path.is_empty() {
            self.workflow_path = DEFAULT_WORKFLOW_PATH.to_string();
        }

        let state_dir = self.config.resolved_state_dir();
        let mut state = self.load_state(&state_dir);

        info!(
            "Starting execution of {} steps (max parallel: {}, cores: {}, dry run: {})",
            self.workflow.len(),
            self.config.max_parallel,
            self.config.max_threads,
            self.config.dry_run
        );

        let monitor_running = Arc::new(AtomicBool::new(true));
        let monitor_handle = if self.config.dry_run {
            None
        } else {
            let monitor_flag = Arc::clone(&monitor_running);
            Some(thread::spawn(move || {
                let mut monitor = ResourceMonitor::new();
                while monitor_flag.load(Ordering::Relaxed) {
                    monitor.sample();
                    thread::sleep(MONITOR_SAMPLE_INTERVAL);
                }
                monitor
            }))
        };

        let mut timeline = ExecutionTimeline::new();
        let outcome = self.schedule(&mut state, &state_dir, &mut timeline);

        monitor_running.store(false, Ordering::Relaxed);
        let monitor = match monitor_handle {
            Some(handle) => Some(
                handle
                    .join()
                    .map_err(|_| WorkflowError::Internal("monitor thread panicked".to_string()))?,
            ),
            None => None,
        };

        let mut summary = outcome?;
        summary.elapsed = start_time.elapsed();

        if self.config.show_timeline {
            println!("{}", timeline.gantt_chart(TIMELINE_WIDTH));
        }
        if let Some(monitor) = monitor {
            println!();
            println!("{}", monitor.summary());
        }

        if !summary.failed.is_empty() {
            return Err(WorkflowError::StepsFailed {
                failed: summary.failed,
                blocked: summary.blocked,
            });
        }

        if !self.config.dry_run {
            state.delete(&state_dir)?;
        }

        info!(
            "Workflow finished in {:.2?}: {} executed, {} skipped",
            summary.elapsed,
            summary.executed.len(),
            summary.skipped.len()
        );
        Ok(summary)
    }

    /// Loads resume state, or starts fresh when forced or nothing was saved.
    fn load_state(&self, state_dir: &Path) -> WorkflowState {
        let fresh = || WorkflowState::new(&self.workflow_path);

        if self.config.force {
            info!("Forced run - ignoring saved state");
            return fresh();
        }

        let state_file = WorkflowState::state_file_path(state_dir, &self.workflow_path);
        if !state_file.exists() {
            info!("Starting fresh workflow execution");
            return fresh();
        }

        let mut state = match WorkflowState::load(state_dir, &self.workflow_path) {
            Ok(state) => state,
            Err(e) => {
                warn!("Ignoring unreadable state: {}", e);
                return fresh();
            }
        };

        let base = self.base_dir();
        for step in &self.workflow.steps {
            if state.completed_steps.contains(&step.id) && !step.missing_outputs(&base).is_empty() {
                info!("Step '{}' outputs missing - scheduling rerun", step.id);
                state.completed_steps.remove(&step.id);
            }
        }

        state
    }

    /// Main scheduling loop.
    fn schedule(
        &self,
        state: &mut WorkflowState,
        state_dir: &Path,
        timeline: &mut ExecutionTimeline,
    ) -> Result<RunSummary> {
        let base = self.base_dir();
        let ctx = StepContext::new(self.config.working_dir.clone(), self.workflow.config.clone());

        let mut planner = if state.is_resume() {
            ExecutionPlanner::from_state(
                self.workflow.clone(),
                state,
                self.config.max_parallel,
                self.config.max_threads,
            )
        } else {
            ExecutionPlanner::new(
                self.workflow.clone(),
                self.config.max_parallel,
                self.config.max_threads,
            )
        };

        let mut summary = RunSummary::default();
        for step in &self.workflow.steps {
            if state.completed_steps.contains(&step.id) {
                timeline.record(&step.id, EventType::Skipped);
                summary.skipped.push(step.id.clone());
            }
        }

        let (tx, rx) = channel::<Completion>();
        let mut halted = false;

        loop {
            if !halted && !self.config.keep_going && !summary.failed.is_empty() {
                halted = true;
                warn!(
                    "Not starting new steps - waiting for {} running step(s)",
                    planner.running_count()
                );
            }

            if !halted {
                self.launch_ready(&mut planner, &ctx, &base, &tx, timeline, &mut summary);
            }

            if planner.running_count() == 0 {
                if halted || !planner.has_work_remaining() {
                    break;
                }
                if !self.config.keep_going && !summary.failed.is_empty() {
                    continue;
                }
                return Err(WorkflowError::Stalled(planner.pending_count()));
            }

            let (step_id, result) = rx.recv().map_err(|e| {
                WorkflowError::Internal(format!("failed to receive step completion: {}", e))
            })?;

            match result {
                Ok(report) => {
                    info!(
                        "Step '{}' completed in {:.2?}{}",
                        step_id,
                        report.duration,
                        if report.attempts > 1 {
                            format!(" after {} attempts", report.attempts)
                        } else {
                            String::new()
                        }
                    );
                    planner.mark_step_completed(&step_id);
                    timeline.record(&step_id, EventType::Completed);
                    state.mark_completed(&step_id);
                    summary.executed.push(step_id);
                }
                Err(e) => {
                    error!("Step '{}' failed: {}", step_id, e);
                    planner.mark_step_failed(&step_id, e.to_string());
                    timeline.record(&step_id, EventType::Failed);
                    state.mark_failed(&step_id);
                    summary.failed.push(step_id);
                }
            }

            state.save(state_dir)?;

            let (done, total) = planner.progress();
            info!("Progress: {}/{} steps", done, total);
        }

        summary.blocked = planner.blocked_steps();
        Ok(summary)
    }

    /// Starts, skips, or (under dry-run) prints every step that is ready.
    fn launch_ready(
        &self,
        planner: &mut ExecutionPlanner,
        ctx: &StepContext,
        base: &Path,
        tx: &Sender<Completion>,
        timeline: &mut ExecutionTimeline,
        summary: &mut RunSummary,
    ) {
        loop {
            let ready_steps = planner.get_ready_steps();
            if ready_steps.is_empty() {
                return;
            }

            for step in ready_steps {
                let Some(reason) = self.run_reason(planner, &step, base) else {
                    info!("Step '{}' is up to date", step.id);
                    planner.mark_step_skipped(&step.id);
                    timeline.record(&step.id, EventType::Skipped);
                    summary.skipped.push(step.id.clone());
                    continue;
                };

                if let Some(pause_path) = &self.config.pause_flag_path {
                    self.check_pause_flag(pause_path);
                }

                planner.mark_step_running(&step.id);

                if self.config.dry_run {
                    match print_dry_run(&step, ctx, reason) {
                        Ok(()) => {
                            planner.mark_step_completed(&step.id);
                            summary.executed.push(step.id.clone());
                        }
                        Err(e) => {
                            error!("{}", e);
                            planner.mark_step_failed(&step.id, e.to_string());
                            summary.failed.push(step.id.clone());
                            if !self.config.keep_going {
                                return;
                            }
                        }
                    }
                    continue;
                }

                info!("Starting step: {} ({})", step.id, reason);
                timeline.record(&step.id, EventType::Started);

                let tx = tx.clone();
                let ctx = ctx.clone();
                thread::spawn(move || {
                    let result = execute_with_retry(&step, &ctx);
                    if let Err(e) = tx.send((step.id.clone(), result)) {
                        error!("Failed to send completion signal: {}", e);
                    }
                });
            }
        }
    }

    /// Why a ready step has to run, or `None` when it is up to date.
    fn run_reason(
        &self,
        planner: &ExecutionPlanner,
        step: &Step,
        base: &Path,
    ) -> Option<&'static str> {
        if self.config.force {
            Some("forced")
        } else if planner.has_executed_dependency(&step.id) {
            Some("dependency re-ran")
        } else if step.output_files().is_empty() {
            Some("no declared outputs")
        } else if !step.outputs_exist(base) {
            Some("missing output")
        } else if step.outputs_outdated(base) {
            Some("input changed")
        } else {
            None
        }
    }

    /// Blocks while the pause flag file exists.
    fn check_pause_flag(&self, pause_path: &Path) {
        if pause_path.exists() {
            info!("Execution paused - waiting for resume signal");

            while pause_path.exists() {
                thread::sleep(PAUSE_CHECK_INTERVAL);
            }

            info!("Resumed");
        }
    }
}

/// Prints what a step would do.
fn print_dry_run(
    step: &Step,
    ctx: &StepContext,
    reason: &str,
) -> std::result::Result<(), StepError> {
    let rendered = match &step.command {
        Some(command) => Some(placeholders::render(command, step, &ctx.config).map_err(
            |source| StepError::Placeholder {
                step: step.id.clone(),
                source,
            },
        )?),
        None => None,
    };

    println!();
    println!(
        "{} {} ({})",
        "[DRY RUN]".yellow().bold(),
        step.id.bold(),
        reason.dimmed()
    );
    if let Some(command) = rendered {
        println!("  command: {}", command);
    }
    if let Some(script) = &step.script {
        println!("  script:  {}", script);
    }
    let inputs = step.input_files();
    if !inputs.is_empty() {
        println!("  input:   {}", inputs.join(", "));
    }
    let outputs = step.output_files();
    if !outputs.is_empty() {
        println!("  output:  {}", outputs.join(", "));
    }
    if let Some(log) = &step.log {
        println!("  log:     {}", log);
    }
    println!("  threads: {}", step.threads);

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::parse_workflow;
    use std::fs;
    use tempfile::tempdir;

    const CHAIN: &str = r#"
steps:
  - id: step1
    command: echo 'test1' > {output}
    output: output1.txt
  - id: step2
    command: cat {input} > {output}
    input: output1.txt
    output: output2.txt
"#;

    fn engine_in(yaml: &str, dir: &Path) -> Engine {
        let mut engine = Engine::new(parse_workflow(yaml).unwrap());
        engine.set_workflow_path("test.yaml");
        engine.set_working_dir(dir);
        engine
    }

    fn state_file(dir: &Path) -> PathBuf {
        dir.join(".rulegraph/test.state.json")
    }

    #[test]
    fn test_engine_configuration() {
        let mut engine = Engine::new(parse_workflow(CHAIN).unwrap());
        assert_eq!(engine.config().max_parallel, 4);
        assert!(!engine.config().dry_run);

        engine.set_max_parallel(8);
        engine.set_max_threads(2);
        engine.set_dry_run(true);
        engine.set_force(true);
        engine.set_keep_going(true);
        engine.set_pause_flag_path("/tmp/pause.flag");
        engine.set_state_dir("/tmp/state");

        let config = engine.config();
        assert_eq!(config.max_parallel, 8);
        assert_eq!(config.max_threads, 2);
        assert!(config.dry_run && config.force && config.keep_going);
        assert_eq!(config.pause_flag_path, Some(PathBuf::from("/tmp/pause.flag")));
        assert_eq!(config.state_dir, PathBuf::from("/tmp/state"));
    }

    #[test]
    fn test_dry_run_executes_nothing() {
        let dir = tempdir().unwrap();
        let mut engine = engine_in(CHAIN, dir.path());
        engine.set_dry_run(true);

        let summary = engine.run().unwrap();
        assert_eq!(summary.executed, vec!["step1", "step2"]);
        assert!(!dir.path().join("output1.txt").exists());
        assert!(!state_file(dir.path()).exists());
    }

    #[test]
    fn test_run_chain_then_skip_when_up_to_date() {
        let dir = tempdir().unwrap();

        let summary = engine_in(CHAIN, dir.path()).run().unwrap();
        assert_eq!(summary.executed, vec!["step1", "step2"]);
        assert_eq!(
            fs::read_to_string(dir.path().join("output2.txt")).unwrap().trim(),
            "test1"
        );
        assert!(!state_file(dir.path()).exists());

        let summary = engine_in(CHAIN, dir.path()).run().unwrap();
        assert!(summary.executed.is_empty());
        assert_eq!(summary.skipped, vec!["step1", "step2"]);

        let mut engine = engine_in(CHAIN, dir.path());
        engine.set_force(true);
        let summary = engine.run().unwrap();
        assert_eq!(summary.executed, vec!["step1", "step2"]);
    }

    #[test]
    fn test_rerun_propagates_downstream() {
        let dir = tempdir().unwrap();
        engine_in(CHAIN, dir.path()).run().unwrap();

        fs::remove_file(dir.path().join("output1.txt")).unwrap();
        let summary = engine_in(CHAIN, dir.path()).run().unwrap();
        assert_eq!(summary.executed, vec!["step1", "step2"]);
    }

    #[test]
    fn test_failure_blocks_dependents_and_saves_state() {
        let dir = tempdir().unwrap();
        let yaml = r#"
steps:
  - id: broken
    command: exit 1
    output: a.txt
  - id: after
    command: cat {input} > {output}
    input: a.txt
    output: b.txt
"#;
        let err = engine_in(yaml, dir.path()).run().unwrap_err();
        match err {
            WorkflowError::StepsFailed { failed, blocked } => {
                assert_eq!(failed, vec!["broken"]);
                assert_eq!(blocked, vec!["after"]);
            }
            other => panic!("unexpected error: {}", other),
        }

        let state = WorkflowState::load(&dir.path().join(".rulegraph"), "test.yaml").unwrap();
        assert!(state.failed_steps.contains("broken"));
    }

    const INDEPENDENT: &str = r#"
steps:
  - id: broken
    command: exit 1
  - id: fine
    command: touch {output}
    output: fine.txt
"#;

    #[test]
    fn test_failure_stops_new_launches() {
        let dir = tempdir().unwrap();
        let mut engine = engine_in(INDEPENDENT, dir.path());
        engine.set_max_parallel(1);

        assert!(engine.run().is_err());
        assert!(!dir.path().join("fine.txt").exists());
    }

    #[test]
    fn test_keep_going_runs_independent_steps() {
        let dir = tempdir().unwrap();
        let mut engine = engine_in(INDEPENDENT, dir.path());
        engine.set_max_parallel(1);
        engine.set_keep_going(true);

        assert!(engine.run().is_err());
        assert!(dir.path().join("fine.txt").exists());
    }

    #[test]
    fn test_resume_skips_completed_steps() {
        let dir = tempdir().unwrap();
        let yaml = r#"
steps:
  - id: step1
    command: echo ran >> marker.txt; echo x > {output}
    output: output1.txt
  - id: step2
    command: cat {input} > {output}
    input: output1.txt
    output: output2.txt
"#;
        fs::write(dir.path().join("output1.txt"), "x\n").unwrap();
        let mut state = WorkflowState::new("test.yaml");
        state.mark_completed("step1");
        state.save(&dir.path().join(".rulegraph")).unwrap();

        let summary = engine_in(yaml, dir.path()).run().unwrap();
        assert_eq!(summary.skipped, vec!["step1"]);
        assert_eq!(summary.executed, vec!["step2"]);
        assert!(!dir.path().join("marker.txt").exists());
        assert!(!state_file(dir.path()).exists());
    }

    #[test]
    fn test_parallel_steps_all_run() {
        let dir = tempdir().unwrap();
        let yaml = r#"
wildcards:
  n: ["1", "2", "3", "4"]
steps:
  - id: make
    command: sleep 0.1; echo {wildcards.n} > {output}
    output: part{n}.txt
  - id: merge
    command: cat {input} > {output}
    input: [part1.txt, part2.txt, part3.txt, part4.txt]
    output: all.txt
"#;
        let mut engine = engine_in(yaml, dir.path());
        engine.set_max_parallel(4);

        let summary = engine.run().unwrap();
        assert_eq!(summary.executed.len(), 5);
        assert_eq!(summary.executed.last().map(String::as_str), Some("merge"));
        let merged = fs::read_to_string(dir.path().join("all.txt")).unwrap();
        assert_eq!(merged.lines().collect::<Vec<_>>(), vec!["1", "2", "3", "4"]);
    }

    #[test]
    fn test_pause_flag_delays_launch() {
        let dir = tempdir().unwrap();
        let pause_path = dir.path().join("pause.flag");
        fs::write(&pause_path, "paused").unwrap();

        let mut engine = engine_in(CHAIN, dir.path());
        engine.set_pause_flag_path(&pause_path);

        let remover = {
            let pause_path = pause_path.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(300));
                fs::remove_file(pause_path).unwrap();
            })
        };

        let summary = engine.run().unwrap();
        remover.join().unwrap();
        assert!(summary.elapsed >= Duration::from_millis(300));
        assert!(dir.path().join("output2.txt").exists());
    }

    #[test]
    fn test_check_pause_flag_without_file() {
        let dir = tempdir().unwrap();
        let engine = engine_in(CHAIN, dir.path());
        engine.check_pause_flag(&dir.path().join("absent.flag"));
    }

    #[test]
    fn test_default_workflow_path() {
        let dir = tempdir().unwrap();
        let mut engine = Engine::new(parse_workflow(CHAIN).unwrap());
        engine.set_working_dir(dir.path());
        engine.set_dry_run(true);

        engine.run().unwrap();
        assert_eq!(engine.workflow_path, "workflow.yaml");
    }
}
