//! JSON/Markdown Reporter
//!
//! Merges the per-step `.json` files a workflow left under
//! `raw/<key>/` into `reports/<key>.json`, optionally rendering
//! `reports/<key>.md` next to it.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use super::{raw_output_dir, ReportingPipeline, REPORTS_SUBDIR};
use crate::error::ReportError;
use crate::parsers::{join_ports, ScanResults, ScanType};
use crate::workflow::variables::DISCOVERED_PORTS;
use crate::workflow::{ReportFormat, Workflow, WorkflowKey};

pub const OPEN_SERVICES: &str = "open_services";
pub const VULNERABILITY_COUNT: &str = "vulnerability_count";

/// On-disk shape of `reports/<key>.json`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct WorkflowReportFile {
    pub workflow: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub target: String,
    pub generated_at: DateTime<Utc>,
    pub results: ScanResults,
}

/// Default [`ReportingPipeline`].
#[derive(Debug, Clone, Default)]
pub struct JsonReporter;

impl JsonReporter {
    pub fn new() -> Self {
        Self
    }

    /// Merged results of every `.json` file in the workflow's raw directory.
    fn collect_raw_results(dir: &Path) -> Result<Option<ScanResults>, ReportError> {
        let mut merged: Option<ScanResults> = None;
        for path in sorted_files(dir, "json")? {
            let results: ScanResults = read_json(&path)?;
            match merged.as_mut() {
                Some(acc) => acc.merge(results),
                None => merged = Some(results),
            }
        }
        Ok(merged)
    }
}

impl ReportingPipeline for JsonReporter {
    fn run_workflow_reporting(
        &self,
        report_dir: &Path,
        target: &str,
        key: &WorkflowKey,
        workflow: &Workflow,
        debug: bool,
    ) -> Result<(), ReportError> {
        let formats = workflow.report.formats();
        if formats.is_empty() {
            debug!("{}: reporting disabled", key);
            return Ok(());
        }

        let Some(mut results) = Self::collect_raw_results(&raw_output_dir(report_dir, key))? else {
            debug!("{}: no parsed output to report", key);
            return Ok(());
        };
        if results.target.is_empty() {
            results.target = target.to_string();
        }

        let report = WorkflowReportFile {
            workflow: key.to_string(),
            name: workflow.name.clone(),
            description: workflow.description.clone(),
            target: target.to_string(),
            generated_at: Utc::now(),
            results,
        };

        let out_dir = report_dir.join(REPORTS_SUBDIR);
        fs::create_dir_all(&out_dir).map_err(|source| ReportError::Io {
            path: out_dir.clone(),
            source,
        })?;

        for format in formats {
            let (path, contents) = match format {
                ReportFormat::Json => {
                    let path = out_dir.join(format!("{}.json", key));
                    let json = serde_json::to_string_pretty(&report).map_err(|source| {
                        ReportError::Json {
                            path: path.clone(),
                            source,
                        }
                    })?;
                    (path, json)
                }
                ReportFormat::Markdown => {
                    let title = workflow.report.title().unwrap_or(&report.name);
                    (out_dir.join(format!("{}.md", key)), render_markdown(title, &report))
                }
            };
            fs::write(&path, contents).map_err(|source| ReportError::Io {
                path: path.clone(),
                source,
            })?;
            if debug {
                info!("Report written: {}", path.display());
            } else {
                debug!("Report written: {}", path.display());
            }
        }
        Ok(())
    }

    fn extract_provided_data(
        &self,
        report_dir: &Path,
        provides: &[String],
    ) -> Result<HashMap<String, String>, ReportError> {
        let mut ports = ScanResults::default();
        let mut vulnerability_reports = 0;
        let mut vulnerabilities = 0;

        for path in sorted_files(&report_dir.join(REPORTS_SUBDIR), "json")? {
            let report: WorkflowReportFile = match read_json(&path) {
                Ok(report) => report,
                Err(e) => {
                    warn!("Skipping unreadable report: {}", e);
                    continue;
                }
            };
            if report.results.scan_type == ScanType::VulnerabilityScan {
                vulnerability_reports += 1;
            }
            vulnerabilities += report.results.vulnerabilities.len();
            ports.ports.extend(report.results.ports);
        }

        let mut extracted = HashMap::new();
        for key in provides {
            let value = match key.as_str() {
                DISCOVERED_PORTS => Some(join_ports(&ports.open_ports())).filter(|v| !v.is_empty()),
                OPEN_SERVICES => open_services(&ports),
                VULNERABILITY_COUNT if vulnerability_reports > 0 => Some(vulnerabilities.to_string()),
                _ => None,
            };
            if let Some(value) = value {
                extracted.insert(key.clone(), value);
            }
        }
        Ok(extracted)
    }
}

/// `port/service` pairs of every open port, sorted by port.
fn open_services(results: &ScanResults) -> Option<String> {
    let mut services: BTreeMap<u16, String> = BTreeMap::new();
    for port in results.ports.iter().filter(|p| p.is_open()) {
        let entry = services.entry(port.number).or_default();
        if entry.is_empty() && !port.service.is_empty() {
            *entry = port.service.clone();
        }
    }
    if services.is_empty() {
        return None;
    }
    Some(
        services
            .into_iter()
            .map(|(port, service)| {
                if service.is_empty() {
                    port.to_string()
                } else {
                    format!("{}/{}", port, service)
                }
            })
            .collect::<Vec<_>>()
            .join(","),
    )
}

fn render_markdown(title: &str, report: &WorkflowReportFile) -> String {
    let mut md = String::new();
    md.push_str(&format!("# {}\n\n", title));
    md.push_str(&format!("- Workflow: `{}`\n", report.workflow));
    md.push_str(&format!("- Target: `{}`\n", report.target));
    md.push_str(&format!("- Scan type: {}\n", report.results.scan_type));
    md.push_str(&format!("- Generated: {}\n\n", report.generated_at.to_rfc3339()));

    let open: Vec<_> = report.results.ports.iter().filter(|p| p.is_open()).collect();
    if !open.is_empty() {
        md.push_str("## Open ports\n\n| Port | Protocol | Service | Version |\n|---|---|---|---|\n");
        for port in open {
            md.push_str(&format!(
                "| {} | {} | {} | {} |\n",
                port.number, port.protocol, port.service, port.version
            ));
        }
        md.push('\n');
    }

    if !report.results.vulnerabilities.is_empty() {
        md.push_str("## Findings\n\n| Severity | Template | Name | Matched at |\n|---|---|---|---|\n");
        for vuln in &report.results.vulnerabilities {
            md.push_str(&format!(
                "| {} | {} | {} | {} |\n",
                vuln.severity, vuln.template_id, vuln.name, vuln.url
            ));
        }
    }
    md
}

/// Files in `dir` with the given extension, sorted. Missing dir is empty.
pub(crate) fn sorted_files(dir: &Path, extension: &str) -> Result<Vec<PathBuf>, ReportError> {
    if !dir.is_dir() {
        return Ok(Vec::new());
    }
    let entries = fs::read_dir(dir).map_err(|source| ReportError::Io {
        path: dir.to_path_buf(),
        source,
    })?;
    let mut files: Vec<PathBuf> = entries
        .filter_map(Result::ok)
        .map(|entry| entry.path())
        .filter(|path| path.is_file() && path.extension().map_or(false, |ext| ext == extension))
        .collect();
    files.sort();
    Ok(files)
}

fn read_json<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<T, ReportError> {
    let text = fs::read_to_string(path).map_err(|source| ReportError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::from_str(&text).map_err(|source| ReportError::Json {
        path: path.to_path_buf(),
        source,
    })
}
