//! Reporting Module
//!
//! Turns raw tool output into per-workflow reports and reads provided
//! values back out of them. The engine treats every call here as
//! best-effort.
//!
//! # Structure
//!
//! - [`ReportingPipeline`]: the two calls the engine depends on
//! - [`json`]: default implementation writing JSON and Markdown reports

pub mod json;

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Local};

use crate::error::ReportError;
use crate::workflow::{Workflow, WorkflowKey};

pub use json::{JsonReporter, WorkflowReportFile};

/// Subdirectory holding the generated reports.
pub const REPORTS_SUBDIR: &str = "reports";

/// Subdirectory holding per-step tool output.
pub const RAW_SUBDIR: &str = "raw";

/// Reporting collaborator used after each successful workflow.
pub trait ReportingPipeline: Send + Sync {
    /// Writes the reports for one workflow under `report_dir`.
    fn run_workflow_reporting(
        &self,
        report_dir: &Path,
        target: &str,
        key: &WorkflowKey,
        workflow: &Workflow,
        debug: bool,
    ) -> Result<(), ReportError>;

    /// Reads values for the requested keys from generated reports.
    ///
    /// Keys it cannot produce are simply absent from the result.
    fn extract_provided_data(
        &self,
        report_dir: &Path,
        provides: &[String],
    ) -> Result<HashMap<String, String>, ReportError>;
}

/// `<report_dir>/raw/<key>`
pub fn raw_output_dir(report_dir: &Path, key: &WorkflowKey) -> PathBuf {
    report_dir.join(RAW_SUBDIR).join(key.to_string())
}

/// Replaces anything but ASCII alphanumerics, `.` and `-` with `_`.
pub fn sanitize_target(target: &str) -> String {
    target
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '.' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// `<reports_dir>/<sanitised target>_<YYYYMMDD_HHMMSS>`
///
/// # Example
///
/// ```
/// use chrono::{Local, TimeZone};
/// use reconflow::reporting::report_dir_for;
///
/// let at = Local.with_ymd_and_hms(2024, 3, 1, 9, 5, 7).unwrap();
/// let dir = report_dir_for("reports", "https://example.org", at);
/// assert_eq!(dir.to_str(), Some("reports/https___example.org_20240301_090507"));
/// ```
pub fn report_dir_for(reports_dir: impl AsRef<Path>, target: &str, at: DateTime<Local>) -> PathBuf {
    reports_dir.as_ref().join(format!(
        "{}_{}",
        sanitize_target(target),
        at.format("%Y%m%d_%H%M%S")
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_target() {
        assert_eq!(sanitize_target("10.0.0.1"), "10.0.0.1");
        assert_eq!(sanitize_target("10.0.0.0/24"), "10.0.0.0_24");
        assert_eq!(sanitize_target("host name:8080"), "host_name_8080");
    }
}
