//! Error Types
//!
//! One enum per failure domain. Only graph, load and cancellation
//! errors stop a run; everything else is isolated to the workflow or
//! step that produced it.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Problems found while resolving the `requires` graph.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GraphError {
    #[error("dependency cycle detected at workflow '{name}'")]
    Cycle { name: String },

    #[error("workflow '{workflow}' requires unknown workflow '{dependency}'")]
    UnknownDependency { workflow: String, dependency: String },

    #[error("workflows '{first}' and '{second}' share the logical name '{name}'")]
    DuplicateLogicalName {
        name: String,
        first: String,
        second: String,
    },
}

/// Problems loading a template from disk.
#[derive(Debug, Error)]
pub enum LoadError {
    #[error("template '{template}' not found in {}", dir.display())]
    TemplateNotFound { template: String, dir: PathBuf },

    #[error("template '{0}' contains no workflows")]
    EmptyTemplate(String),

    #[error("failed to read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to parse {}: {source}", path.display())]
    Yaml {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("workflow '{workflow}' step {index}: {reason}")]
    InvalidStep {
        workflow: String,
        index: usize,
        reason: String,
    },

    #[error("invalid workflow file name: {}", .0.display())]
    InvalidFileName(PathBuf),
}

/// Failures inside the reporting collaborator. Always recovered locally.
#[derive(Debug, Error)]
pub enum ReportError {
    #[error("report I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("malformed report {}: {source}", path.display())]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Errors raised while executing workflows.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Graph(#[from] GraphError),

    #[error(transparent)]
    Load(#[from] LoadError),

    #[error("step '{step}' has unresolved placeholders: {}", placeholders.join(", "))]
    Substitution {
        step: String,
        placeholders: Vec<String>,
    },

    #[error("command `{command}` exited with {status}: {stderr}")]
    Execution {
        command: String,
        status: String,
        stderr: String,
    },

    #[error("failed to start `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: io::Error,
    },

    #[error("run cancelled")]
    Cancelled,

    #[error("could not extract '{key}': {reason}")]
    Extraction { key: String, reason: String },

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl EngineError {
    /// Returns true for errors that abort the whole run.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Graph(_) | Self::Load(_) | Self::Cancelled)
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}
