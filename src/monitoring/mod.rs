//! Run Monitoring Module
//!
//! Tracks the execution timeline of a scan run.
//!
//! # Components
//!
//! - [`ExecutionTimeline`]: workflow start/end timing for Gantt charts

pub mod timeline;

pub use timeline::{EventType, ExecutionTimeline, Span, TimelineEvent};
