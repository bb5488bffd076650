//! Data Propagation
//!
//! After a workflow succeeds its results are pushed into the shared
//! [`ProvidedData`] so later levels can substitute them. Values a
//! workflow `provides` are resolved in tiers:
//!
//! 1. Parsed port-discovery results
//! 2. The reporting collaborator's extraction
//! 3. Direct re-parsing of raw output files
//! 4. A fixed fallback (ports only)
//! 5. [`PROVIDES_PLACEHOLDER`]

use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::runner::StepsOutcome;
use crate::error::EngineError;
use crate::parsers::{self, join_ports, ScanResults, ScanType};
use crate::reporting::json::{sorted_files, VULNERABILITY_COUNT};
use crate::reporting::{raw_output_dir, ReportingPipeline};
use crate::workflow::variables::{DISCOVERED_PORTS, FALLBACK_PORTS};
use crate::workflow::{ProvidedData, RunGlobals, Workflow, WorkflowKey};

/// Stored when no tier could produce a provided value.
pub const PROVIDES_PLACEHOLDER: &str = "extracted_by_reporting_pipeline";

pub const DEFAULT_SETTLE_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Where a propagated value came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueSource {
    ScanResults,
    Reporter,
    RawFiles,
    Fallback,
    Placeholder,
}

impl fmt::Display for ValueSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::ScanResults => "scan results",
            Self::Reporter => "reporting pipeline",
            Self::RawFiles => "raw output",
            Self::Fallback => "fallback",
            Self::Placeholder => "placeholder",
        };
        f.write_str(label)
    }
}

/// One value written to the provided data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Propagated {
    pub key: String,
    pub value: String,
    pub source: ValueSource,
}

/// Waits until every path exists and its size is unchanged across one
/// poll. Returns false on timeout or cancellation.
pub async fn wait_for_output_files(
    paths: &[PathBuf],
    timeout: Duration,
    poll_interval: Duration,
    cancel: &CancellationToken,
) -> bool {
    if paths.is_empty() {
        return true;
    }

    let deadline = Instant::now() + timeout;
    let mut previous: Option<Vec<u64>> = None;

    loop {
        let sizes: Option<Vec<u64>> = paths
            .iter()
            .map(|path| fs::metadata(path).ok().map(|m| m.len()))
            .collect();

        match sizes {
            Some(sizes) if previous.as_ref() == Some(&sizes) => return true,
            sizes => previous = sizes,
        }

        if Instant::now() >= deadline {
            warn!("Timed out waiting for output files: {:?}", paths);
            return false;
        }

        tokio::select! {
            _ = cancel.cancelled() => return false,
            _ = tokio::time::sleep(poll_interval) => {}
        }
    }
}

fn is_valid(value: Option<&str>) -> bool {
    value.map_or(false, |v| !v.trim().is_empty())
}

/// Moves a finished workflow's data into the shared map.
#[derive(Clone)]
pub struct PropagationBridge {
    reporter: Arc<dyn ReportingPipeline>,
    settle_timeout: Duration,
    poll_interval: Duration,
    debug: bool,
}

impl PropagationBridge {
    pub fn new(reporter: Arc<dyn ReportingPipeline>) -> Self {
        Self {
            reporter,
            settle_timeout: DEFAULT_SETTLE_TIMEOUT,
            poll_interval: DEFAULT_POLL_INTERVAL,
            debug: false,
        }
    }

    /// How long to wait for tool output files to stop growing.
    pub fn with_settle(mut self, timeout: Duration, poll_interval: Duration) -> Self {
        self.settle_timeout = timeout;
        self.poll_interval = poll_interval;
        self
    }

    pub fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    /// Publishes results and `provides` values for one successful workflow.
    pub async fn propagate(
        &self,
        key: &WorkflowKey,
        workflow: &Workflow,
        outcome: &StepsOutcome,
        globals: &RunGlobals,
        provided: &ProvidedData,
        cancel: &CancellationToken,
    ) -> Vec<Propagated> {
        let mut written = Vec::new();

        if let Some(results) = outcome
            .results
            .as_ref()
            .filter(|r| r.scan_type == ScanType::PortDiscovery)
        {
            let ports = results.open_ports();
            if ports.is_empty() {
                info!("{}: no open ports found", key);
            } else {
                written.push(self.publish(
                    provided,
                    key,
                    DISCOVERED_PORTS,
                    join_ports(&ports),
                    ValueSource::ScanResults,
                ));
            }
        }

        // Values from an earlier workflow do not count; only this run's.
        let mut missing: Vec<String> = workflow
            .provides
            .iter()
            .filter(|k| !written.iter().any(|p| p.key == **k))
            .cloned()
            .collect();

        if !workflow.report.is_enabled() && missing.is_empty() {
            return written;
        }

        let files: Vec<PathBuf> = outcome.output_files.iter().map(|(_, p)| p.clone()).collect();
        if !wait_for_output_files(&files, self.settle_timeout, self.poll_interval, cancel).await {
            debug!("{}: continuing without settled output files", key);
        }

        if let Err(e) = self.reporter.run_workflow_reporting(
            &globals.report_dir,
            &globals.target,
            key,
            workflow,
            self.debug,
        ) {
            warn!("{}: reporting failed: {}", key, e);
        }

        if missing.is_empty() {
            return written;
        }

        match self
            .reporter
            .extract_provided_data(&globals.report_dir, &missing)
        {
            Ok(values) => {
                missing.retain(|k| match values.get(k).filter(|v| is_valid(Some(v.as_str()))) {
                    Some(value) => {
                        written.push(self.publish(provided, key, k, value.clone(), ValueSource::Reporter));
                        false
                    }
                    None => true,
                });
            }
            Err(e) => warn!("{}: {}", key, extraction_failure(&missing, e.to_string())),
        }

        if !missing.is_empty() {
            let values = extract_from_raw_files(&globals.report_dir, key, &outcome.output_files, &missing);
            missing.retain(|k| match values.get(k) {
                Some(value) => {
                    written.push(self.publish(provided, key, k, value.clone(), ValueSource::RawFiles));
                    false
                }
                None => true,
            });
        }

        for k in missing {
            debug!("{}: {}", key, extraction_failure(&[k.clone()], "no extractor produced a value"));
            let (value, source) = if k == DISCOVERED_PORTS {
                (FALLBACK_PORTS.to_string(), ValueSource::Fallback)
            } else {
                (PROVIDES_PLACEHOLDER.to_string(), ValueSource::Placeholder)
            };
            written.push(self.publish(provided, key, &k, value, source));
        }

        written
    }

    fn publish(
        &self,
        provided: &ProvidedData,
        workflow: &WorkflowKey,
        key: &str,
        value: String,
        source: ValueSource,
    ) -> Propagated {
        info!("{}: {} = {} ({})", workflow, key, value, source);
        provided.insert(key, value.clone());
        Propagated {
            key: key.to_string(),
            value,
            source,
        }
    }
}

fn extraction_failure(keys: &[String], reason: impl Into<String>) -> EngineError {
    EngineError::Extraction {
        key: keys.join(","),
        reason: reason.into(),
    }
}

/// Re-parses `raw/<key>/*.log` and the tools' own output files.
pub fn extract_from_raw_files(
    report_dir: &Path,
    key: &WorkflowKey,
    output_files: &[(String, PathBuf)],
    wanted: &[String],
) -> HashMap<String, String> {
    let mut merged = ScanResults::default();

    let logs = sorted_files(&raw_output_dir(report_dir, key), "log").unwrap_or_default();
    let log_sources = logs.into_iter().filter_map(|path| {
        let stem = path.file_stem()?.to_str()?;
        let tool = stem.split_once('_').map(|(_, tool)| tool.to_string())?;
        Some((tool, path))
    });

    for (tool, path) in log_sources.chain(output_files.iter().cloned()) {
        if !parsers::has_parser(&tool) {
            continue;
        }
        let Ok(text) = fs::read_to_string(&path) else {
            continue;
        };
        let lines: Vec<String> = text.lines().map(str::to_string).collect();
        if let Some(results) = parsers::parse_output(&tool, &lines, &[]) {
            debug!("{}: {} results from {}", key, tool, path.display());
            merged.merge(results);
        }
    }

    let mut values = HashMap::new();
    for k in wanted {
        match k.as_str() {
            DISCOVERED_PORTS => {
                let ports = merged.open_ports();
                if !ports.is_empty() {
                    values.insert(k.clone(), join_ports(&ports));
                }
            }
            VULNERABILITY_COUNT if !merged.vulnerabilities.is_empty() => {
                values.insert(k.clone(), merged.vulnerabilities.len().to_string());
            }
            _ => {}
        }
    }
    values
}
