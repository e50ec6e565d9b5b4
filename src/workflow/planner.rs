//! Execution Planner
//!
//! Tracks step status during a run and decides which steps may start:
//! all dependencies finished, the parallel-job limit not reached, and
//! enough cores left in the thread budget.

use std::collections::{HashMap, HashSet};
use std::time::Instant;

use log::{debug, info, warn};

use super::model::{Step, Workflow};
use super::state::WorkflowState;

/// Status of a workflow step during execution.
#[derive(Debug, Clone, PartialEq)]
pub enum StepStatus {
    /// Waiting for dependencies
    Pending,
    Running,
    /// Ran successfully during this run
    Completed,
    /// Up to date, or finished in an earlier run
    Skipped,
    Failed(String),
    /// A dependency failed
    Blocked,
}

/// Execution metrics for a single step.
#[derive(Debug, Clone)]
pub struct StepMetrics {
    pub start_time: Option<Instant>,
    pub end_time: Option<Instant>,
    pub duration_ms: Option<u128>,
    pub status: StepStatus,
}

impl StepMetrics {
    fn new() -> Self {
        Self {
            start_time: None,
            end_time: None,
            duration_ms: None,
            status: StepStatus::Pending,
        }
    }

    fn finish(&mut self, status: StepStatus) {
        let now = Instant::now();
        self.end_time = Some(now);
        if let Some(start) = self.start_time {
            self.duration_ms = Some(now.duration_since(start).as_millis());
        }
        self.status = status;
    }
}

/// Manages execution planning and step scheduling.
pub struct ExecutionPlanner {
    workflow: Workflow,
    /// Steps that finished, whether run or skipped
    completed_steps: HashSet<String>,
    /// Steps that actually ran during this run
    executed_steps: HashSet<String>,
    running_steps: HashSet<String>,
    failed_steps: HashSet<String>,
    blocked_steps: HashSet<String>,
    max_parallel_jobs: usize,
    step_metrics: HashMap<String, StepMetrics>,
    current_threads_used: usize,
    max_threads: usize,
}

impl ExecutionPlanner {
    /// Creates a planner for a validated workflow.
    ///
    /// # Arguments
    ///
    /// * `max_parallel_jobs` - Maximum concurrent steps
    /// * `max_threads` - Core budget shared by running steps
    pub fn new(workflow: Workflow, max_parallel_jobs: usize, max_threads: usize) -> Self {
        let max_parallel_jobs = max_parallel_jobs.max(1);
        let max_threads = max_threads.max(1);
        info!(
            "Creating planner: {} max jobs, {} cores",
            max_parallel_jobs, max_threads
        );

        let step_metrics = workflow
            .steps
            .iter()
            .map(|step| (step.id.clone(), StepMetrics::new()))
            .collect();

        Self {
            workflow,
            completed_steps: HashSet::new(),
            executed_steps: HashSet::new(),
            running_steps: HashSet::new(),
            failed_steps: HashSet::new(),
            blocked_steps: HashSet::new(),
            max_parallel_jobs,
            step_metrics,
            current_threads_used: 0,
            max_threads,
        }
    }

    /// Creates a planner that treats steps completed in `state` as done.
    pub fn from_state(
        workflow: Workflow,
        state: &WorkflowState,
        max_parallel_jobs: usize,
        max_threads: usize,
    ) -> Self {
        let mut planner = Self::new(workflow, max_parallel_jobs, max_threads);

        for step_id in &state.completed_steps {
            if planner.workflow.get_step(step_id).is_some() {
                info!("Skipping previously completed step: {}", step_id);
                planner.mark_step_skipped(step_id);
            }
        }

        planner
    }

    /// The workflow being planned.
    pub fn workflow(&self) -> &Workflow {
        &self.workflow
    }

    /// Cores a step occupies, clamped to the budget so no step waits forever.
    fn thread_demand(&self, step: &Step) -> usize {
        step.threads.clamp(1, self.max_threads)
    }

    fn is_pending(&self, id: &str) -> bool {
        !self.completed_steps.contains(id)
            && !self.running_steps.contains(id)
            && !self.failed_steps.contains(id)
            && !self.blocked_steps.contains(id)
    }

    /// Returns steps that may start now, in workflow order.
    pub fn get_ready_steps(&self) -> Vec<Step> {
        let mut ready_steps = Vec::new();
        let slots = self
            .max_parallel_jobs
            .saturating_sub(self.running_steps.len());
        let mut threads_available = self.max_threads.saturating_sub(self.current_threads_used);

        for step in &self.workflow.steps {
            if ready_steps.len() >= slots {
                break;
            }
            if !self.is_pending(&step.id) {
                continue;
            }

            let deps_complete = step
                .previous
                .iter()
                .all(|dep| self.completed_steps.contains(dep));
            if !deps_complete {
                continue;
            }

            let demand = self.thread_demand(step);
            if demand > threads_available {
                debug!(
                    "Step '{}' needs {} cores but only {} available",
                    step.id, demand, threads_available
                );
                continue;
            }

            threads_available -= demand;
            ready_steps.push(step.clone());
        }

        ready_steps
    }

    pub fn mark_step_running(&mut self, step_id: &str) {
        if !self.running_steps.insert(step_id.to_string()) {
            return;
        }

        if let Some(step) = self.workflow.get_step(step_id) {
            self.current_threads_used += self.thread_demand(step);
            debug!(
                "Step '{}' started (cores in use: {}/{})",
                step_id, self.current_threads_used, self.max_threads
            );
        }

        if let Some(metrics) = self.step_metrics.get_mut(step_id) {
            metrics.start_time = Some(Instant::now());
            metrics.status = StepStatus::Running;
        }
    }

    fn release(&mut self, step_id: &str) {
        if !self.running_steps.remove(step_id) {
            return;
        }
        if let Some(step) = self.workflow.get_step(step_id) {
            let demand = self.thread_demand(step);
            self.current_threads_used = self.current_threads_used.saturating_sub(demand);
        }
    }

    /// Marks a step as having run successfully.
    pub fn mark_step_completed(&mut self, step_id: &str) {
        self.release(step_id);
        self.completed_steps.insert(step_id.to_string());
        self.executed_steps.insert(step_id.to_string());

        if let Some(metrics) = self.step_metrics.get_mut(step_id) {
            metrics.finish(StepStatus::Completed);
        }
    }

    /// Marks a step as done without running it.
    pub fn mark_step_skipped(&mut self, step_id: &str) {
        self.release(step_id);
        self.completed_steps.insert(step_id.to_string());

        if let Some(metrics) = self.step_metrics.get_mut(step_id) {
            metrics.status = StepStatus::Skipped;
        }
    }

    /// Marks a step as failed and blocks everything downstream of it.
    pub fn mark_step_failed(&mut self, step_id: &str, error: String) {
        self.release(step_id);
        self.failed_steps.insert(step_id.to_string());

        if let Some(metrics) = self.step_metrics.get_mut(step_id) {
            metrics.finish(StepStatus::Failed(error));
        }

        let mut stack: Vec<String> = self
            .workflow
            .get_step(step_id)
            .map(|s| s.next.clone())
            .unwrap_or_default();

        while let Some(id) = stack.pop() {
            if self.completed_steps.contains(&id) || !self.blocked_steps.insert(id.clone()) {
                continue;
            }
            warn!("Step '{}' blocked by failure of '{}'", id, step_id);
            if let Some(metrics) = self.step_metrics.get_mut(&id) {
                metrics.status = StepStatus::Blocked;
            }
            if let Some(step) = self.workflow.get_step(&id) {
                stack.extend(step.next.iter().cloned());
            }
        }
    }

    /// True when a dependency of `step_id` ran during this run, which makes
    /// the step's outputs stale regardless of timestamps.
    pub fn has_executed_dependency(&self, step_id: &str) -> bool {
        self.workflow
            .get_step(step_id)
            .map(|s| s.previous.iter().any(|dep| self.executed_steps.contains(dep)))
            .unwrap_or(false)
    }

    /// Returns true while unblocked steps still wait to start.
    pub fn has_work_remaining(&self) -> bool {
        self.pending_count() > 0
    }

    /// Steps neither started, finished, nor blocked.
    pub fn pending_count(&self) -> usize {
        self.workflow
            .steps
            .iter()
            .filter(|s| self.is_pending(&s.id))
            .count()
    }

    /// Number of steps currently running.
    pub fn running_count(&self) -> usize {
        self.running_steps.len()
    }

    /// Returns the current progress as (finished, total).
    pub fn progress(&self) -> (usize, usize) {
        (self.completed_steps.len(), self.workflow.steps.len())
    }

    pub fn get_metrics(&self) -> &HashMap<String, StepMetrics> {
        &self.step_metrics
    }

    /// Steps that can no longer run because a dependency failed, in workflow order.
    pub fn blocked_steps(&self) -> Vec<String> {
        self.workflow
            .steps
            .iter()
            .filter(|s| self.blocked_steps.contains(&s.id))
            .map(|s| s.id.clone())
            .collect()
    }
}
