//! Resource Usage Monitoring
//!
//! Samples CPU and memory of the engine process together with every
//! descendant process, which covers the running steps.

use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

use log::warn;
use sysinfo::{get_current_pid, Pid, ProcessRefreshKind, System};

/// A single resource usage sample.
#[derive(Debug, Clone)]
pub struct ResourceSample {
    pub timestamp: Instant,
    /// CPU usage percentage summed over the process tree (0-100 per core)
    pub cpu_usage: f32,
    pub memory_mb: u64,
    /// Processes in the tree at sampling time
    pub processes: usize,
}

/// Monitors resource usage of the current process tree.
///
/// # Example
///
/// ```rust,no_run
/// use rulegraph::monitoring::ResourceMonitor;
/// use std::thread;
/// use std::time::Duration;
///
/// let mut monitor = ResourceMonitor::new();
/// for _ in 0..5 {
///     monitor.sample();
///     thread::sleep(Duration::from_millis(500));
/// }
/// println!("{}", monitor.summary());
/// ```
pub struct ResourceMonitor {
    system: System,
    root: Option<Pid>,
    samples: Vec<ResourceSample>,
    warmup_done: bool,
    last_sample: Option<Instant>,
    min_interval: Duration,
}

impl ResourceMonitor {
    pub fn new() -> Self {
        let root = match get_current_pid() {
            Ok(pid) => Some(pid),
            Err(e) => {
                warn!("Resource monitoring disabled: {}", e);
                None
            }
        };

        Self {
            system: System::new(),
            root,
            samples: Vec::new(),
            warmup_done: false,
            last_sample: None,
            min_interval: Duration::from_millis(250),
        }
    }

    /// Sets the minimum interval between samples.
    pub fn with_min_interval(mut self, interval: Duration) -> Self {
        self.min_interval = interval;
        self
    }

    /// Takes a sample.
    ///
    /// The first call only primes CPU counters. Later calls closer together
    /// than `min_interval` are ignored.
    pub fn sample(&mut self) {
        let Some(root) = self.root else {
            return;
        };
        let now = Instant::now();
        let refresh_kind = ProcessRefreshKind::new().with_cpu().with_memory();

        if !self.warmup_done {
            self.system.refresh_processes_specifics(refresh_kind);
            self.warmup_done = true;
            self.last_sample = Some(now);
            return;
        }

        if let Some(last) = self.last_sample {
            if now.duration_since(last) < self.min_interval {
                return;
            }
        }

        self.system.refresh_processes_specifics(refresh_kind);
        self.last_sample = Some(now);

        let tree = self.process_tree(root);
        if tree.is_empty() {
            return;
        }

        let (cpu_usage, memory) = tree
            .iter()
            .filter_map(|pid| self.system.process(*pid))
            .fold((0.0_f32, 0_u64), |(cpu, mem), p| {
                (cpu + p.cpu_usage(), mem + p.memory())
            });

        self.samples.push(ResourceSample {
            timestamp: now,
            cpu_usage,
            memory_mb: memory / (1024 * 1024),
            processes: tree.len(),
        });
    }

    /// `root` and all of its descendants that are currently alive.
    fn process_tree(&self, root: Pid) -> Vec<Pid> {
        if self.system.process(root).is_none() {
            return Vec::new();
        }

        let mut children: HashMap<Pid, Vec<Pid>> = HashMap::new();
        for (pid, process) in self.system.processes() {
            if let Some(parent) = process.parent() {
                children.entry(parent).or_default().push(*pid);
            }
        }

        let mut seen = HashSet::from([root]);
        let mut tree = vec![root];
        let mut stack = vec![root];
        while let Some(pid) = stack.pop() {
            for child in children.get(&pid).into_iter().flatten() {
                if seen.insert(*child) {
                    tree.push(*child);
                    stack.push(*child);
                }
            }
        }
        tree
    }

    /// Human-readable usage summary.
    pub fn summary(&self) -> String {
        if self.samples.is_empty() {
            return "No resource data collected".to_string();
        }

        let max_processes = self.samples.iter().map(|s| s.processes).max().unwrap_or(0);

        format!(
            "Resource Usage:\n  Average CPU: {:.1}%\n  Peak Memory: {} MB\n  Peak Processes: {}\n  Samples: {}",
            self.average_cpu(),
            self.peak_memory_mb(),
            max_processes,
            self.samples.len()
        )
    }

    pub fn samples(&self) -> &[ResourceSample] {
        &self.samples
    }

    pub fn peak_memory_mb(&self) -> u64 {
        self.samples.iter().map(|s| s.memory_mb).max().unwrap_or(0)
    }

    pub fn average_cpu(&self) -> f32 {
        if self.samples.is_empty() {
            return 0.0;
        }
        self.samples.iter().map(|s| s.cpu_usage).sum::<f32>() / self.samples.len() as f32
    }
}

impl Default for ResourceMonitor {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::Command;
    use std::thread;

    #[test]
    fn test_first_sample_is_warmup() {
        let mut monitor = ResourceMonitor::new();
        monitor.sample();
        assert!(monitor.samples().is_empty());

        thread::sleep(Duration::from_millis(300));
        monitor.sample();
        assert_eq!(monitor.samples().len(), 1);
        assert!(monitor.samples()[0].processes >= 1);
        assert!(monitor.peak_memory_mb() > 0);
    }

    #[test]
    fn test_min_interval() {
        let mut monitor = ResourceMonitor::new().with_min_interval(Duration::from_millis(200));
        monitor.sample();
        monitor.sample();
        assert!(monitor.samples().is_empty());

        thread::sleep(Duration::from_millis(250));
        monitor.sample();
        assert!(!monitor.samples().is_empty());
    }

    #[test]
    fn test_child_processes_are_counted() {
        let mut child = Command::new("sleep").arg("2").spawn().unwrap();

        let mut monitor = ResourceMonitor::new().with_min_interval(Duration::ZERO);
        monitor.sample();
        thread::sleep(Duration::from_millis(100));
        monitor.sample();

        child.kill().unwrap();
        child.wait().unwrap();

        assert!(monitor.samples()[0].processes >= 2);
    }

    #[test]
    fn test_summary() {
        let monitor = ResourceMonitor::new();
        assert!(monitor.summary().contains("No resource data collected"));
        assert_eq!(monitor.average_cpu(), 0.0);
        assert_eq!(monitor.peak_memory_mb(), 0);

        let mut monitor = ResourceMonitor::new();
        monitor.sample();
        thread::sleep(Duration::from_millis(300));
        monitor.sample();
        let summary = monitor.summary();
        assert!(summary.contains("Average CPU"));
        assert!(summary.contains("Peak Memory"));
        assert!(summary.contains("Samples: 1"));
    }
}
