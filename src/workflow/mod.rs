//! Workflow Definition Module
//!
//! Provides data structures and utilities for defining, loading and
//! planning scan workflows.
//!
//! # Structure
//!
//! - [`model`]: Core data structures (Workflow, Step, WorkflowKey)
//! - [`parser`]: Template loading from YAML
//! - [`planner`]: Dependency levels and parallel groups
//! - [`variables`]: `{{placeholder}}` substitution and derivations
//! - [`provided`]: Shared data produced by completed workflows

pub mod model;
pub mod parser;
pub mod planner;
pub mod provided;
pub mod variables;

pub use model::{ReportConfig, ReportFormat, ReportSettings, Step, Template, Workflow, WorkflowKey};
pub use parser::load_template;
pub use planner::{build_levels, ExecutionLevel, ExecutionPlan, ParallelGroup};
pub use provided::ProvidedData;
pub use variables::{RunGlobals, Vars};
