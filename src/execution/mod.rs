//! Workflow Execution Module
//!
//! Schedules planned workflows, runs their tools as cancellable process
//! groups and carries results forward between levels.
//!
//! # Architecture
//!
//! - [`engine`]: level/group scheduler
//! - [`runner`]: per-workflow step loop behind the [`WorkflowRunner`] trait
//! - [`tool`]: single tool invocation (streaming or buffered)
//! - [`process`]: process-group termination
//! - [`propagation`]: provided-data hand-off with fallbacks
//! - [`cancel`]: signal-driven cancellation coordinator

pub mod cancel;
pub mod engine;
pub mod process;
pub mod propagation;
pub mod runner;
pub mod tool;

pub use cancel::{CancelState, CancellationCoordinator, SignalAction, CANCELLED_EXIT_CODE};
pub use engine::{Engine, RunSummary, WorkflowReport, WorkflowStatus};
pub use process::{terminate_process_tree, ActiveProcesses, Signal, Signaller};
pub use propagation::{PropagationBridge, PROVIDES_PLACEHOLDER};
pub use runner::{StepsOutcome, ToolWorkflowRunner, WorkflowRunner};
pub use tool::{ToolInvocation, ToolOutput, ToolRunner};

pub use crate::workflow::RunGlobals;
