//! Run Configuration
//!
//! Every knob the engine understands, with the defaults used when the
//! command line or environment leaves them unset.

use std::path::PathBuf;

/// Default maximum number of steps running at once.
pub const DEFAULT_MAX_PARALLEL: usize = 4;

/// Default directory holding resume state.
pub const DEFAULT_STATE_DIR: &str = ".rulegraph";

/// Options controlling one workflow run.
#[derive(Debug, Clone, PartialEq)]
pub struct RunConfig {
    /// Maximum steps running at once
    pub max_parallel: usize,
    /// Core budget shared by running steps
    pub max_threads: usize,
    /// Print what would run without running it
    pub dry_run: bool,
    /// Run every step regardless of output freshness or saved state
    pub force: bool,
    /// Keep running independent steps after a failure
    pub keep_going: bool,
    /// Directory relative paths are resolved against
    pub working_dir: Option<PathBuf>,
    /// While this file exists no new step starts
    pub pause_flag_path: Option<PathBuf>,
    pub state_dir: PathBuf,
    /// Print a Gantt chart after the run
    pub show_timeline: bool,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            max_parallel: DEFAULT_MAX_PARALLEL,
            max_threads: num_cpus::get(),
            dry_run: false,
            force: false,
            keep_going: false,
            working_dir: None,
            pause_flag_path: None,
            state_dir: PathBuf::from(DEFAULT_STATE_DIR),
            show_timeline: false,
        }
    }
}

impl RunConfig {
    /// State directory, resolved against the working directory when relative.
    pub fn resolved_state_dir(&self) -> PathBuf {
        match &self.working_dir {
            Some(dir) if self.state_dir.is_relative() => dir.join(&self.state_dir),
            _ => self.state_dir.clone(),
        }
    }
}
