//! reconflow - Reconnaissance Workflow Orchestrator
//!
//! Runs templates of scanner workflows (nmap, naabu, nuclei, ...) against
//! a single target. Workflows declare what they require and provide; the
//! engine orders them into levels, runs parallel groups concurrently and
//! hands discovered data from one level to the next.
//!
//! # Architecture
//!
//! - [`workflow`]: Template model, YAML loading, planning and substitution
//! - [`execution`]: Scheduler, tool runner, propagation and cancellation
//! - [`parsers`]: Tool output to [`parsers::ScanResults`]
//! - [`reporting`]: Per-workflow reports and provided-data extraction
//! - [`monitoring`]: Execution timeline
//! - [`config`]: Run settings
//! - [`health`]: Environment checks
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use reconflow::execution::{Engine, RunGlobals, ToolRunner, ToolWorkflowRunner};
//! use reconflow::load_template;
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let template = load_template("workflows", "default")?;
//!     let globals = RunGlobals::new("10.0.0.1", "default", "reports/10.0.0.1");
//!
//!     let cancel = CancellationToken::new();
//!     let runner = ToolWorkflowRunner::new(ToolRunner::new(cancel.clone()));
//!
//!     let mut engine = Engine::new(template, globals, Arc::new(runner))?;
//!     engine.set_cancellation_token(cancel);
//!
//!     let summary = engine.run().await?;
//!     println!("{} workflows completed", summary.completed());
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod error;
pub mod execution;
pub mod health;
pub mod monitoring;
pub mod parsers;
pub mod reporting;
pub mod workflow;

// Re-export commonly used types
pub use config::Settings;
pub use error::{EngineError, GraphError, LoadError, ReportError};
pub use execution::engine::Engine;
pub use workflow::model::{Step, Template, Workflow, WorkflowKey};
pub use workflow::parser::load_template;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Application name
pub const APP_NAME: &str = "reconflow";
