//! Run Monitoring
//!
//! - [`ResourceMonitor`]: CPU and memory of the engine and its steps
//! - [`ExecutionTimeline`]: Step timing for durations and Gantt charts

pub mod resource;
pub mod timeline;

pub use resource::{ResourceMonitor, ResourceSample};
pub use timeline::{EventType, ExecutionTimeline, TimelineEvent};
