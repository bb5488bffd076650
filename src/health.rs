//! Environment Health Check
//!
//! Backs `--health`: reports which scanners are installed, whether the
//! process runs privileged, and whether the selected template plans
//! without errors.

use std::path::{Path, PathBuf};

use colored::Colorize;
use log::debug;

use crate::execution::process::is_root;
use crate::workflow::{build_levels, load_template};

/// Tools the bundled templates rely on.
pub const KNOWN_TOOLS: &[&str] = &["nmap", "naabu", "nuclei", "masscan", "sudo"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolStatus {
    pub name: String,
    pub path: Option<PathBuf>,
}

/// Template load/plan result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TemplateStatus {
    Valid { workflows: usize, levels: usize },
    Invalid(String),
}

#[derive(Debug, Clone)]
pub struct HealthReport {
    pub tools: Vec<ToolStatus>,
    pub privileged: bool,
    pub template: String,
    pub template_status: TemplateStatus,
}

impl HealthReport {
    /// Healthy when the template loads and plans.
    pub fn is_healthy(&self) -> bool {
        matches!(self.template_status, TemplateStatus::Valid { .. })
    }

    pub fn render(&self) -> String {
        let mut out = String::from("\nTools:\n");
        for tool in &self.tools {
            match &tool.path {
                Some(path) => out.push_str(&format!(
                    "  {} {:<8} {}\n",
                    "✓".green(),
                    tool.name,
                    path.display()
                )),
                None => out.push_str(&format!(
                    "  {} {:<8} not found in PATH\n",
                    "✗".red(),
                    tool.name
                )),
            }
        }

        let privilege = if self.privileged {
            "root".green()
        } else {
            "unprivileged (use --sudo for raw-socket scans)".yellow()
        };
        out.push_str(&format!("\nPrivileges: {}\n", privilege));

        let status = match &self.template_status {
            TemplateStatus::Valid { workflows, levels } => format!(
                "{} ({} workflows, {} levels)",
                "valid".green(),
                workflows,
                levels
            ),
            TemplateStatus::Invalid(reason) => format!("{} {}", "invalid".red(), reason),
        };
        out.push_str(&format!("Template '{}': {}\n", self.template, status));
        out
    }
}

/// Locates an executable on `PATH`.
pub fn find_in_path(tool: &str) -> Option<PathBuf> {
    which::which(tool).ok()
}

/// Runs every check for `template` under `templates_dir`.
pub fn check(templates_dir: &Path, template: &str) -> HealthReport {
    let tools = KNOWN_TOOLS
        .iter()
        .map(|name| ToolStatus {
            name: name.to_string(),
            path: find_in_path(name),
        })
        .collect();

    let template_status = match load_template(templates_dir, template) {
        Ok(loaded) => match build_levels(&loaded) {
            Ok(plan) => TemplateStatus::Valid {
                workflows: plan.workflow_count(),
                levels: plan.levels.len(),
            },
            Err(e) => TemplateStatus::Invalid(e.to_string()),
        },
        Err(e) => TemplateStatus::Invalid(e.to_string()),
    };
    debug!("Template '{}' health: {:?}", template, template_status);

    HealthReport {
        tools,
        privileged: is_root(),
        template: template.to_string(),
        template_status,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn test_find_in_path_locates_sh() {
        assert!(find_in_path("sh").is_some());
        assert!(find_in_path("reconflow-definitely-missing").is_none());
    }

    #[test]
    fn test_bundled_template_is_healthy() {
        let templates = Path::new(env!("CARGO_MANIFEST_DIR")).join("workflows");
        let report = check(&templates, "default");
        assert!(report.is_healthy(), "{:?}", report.template_status);
        assert_eq!(report.tools.len(), KNOWN_TOOLS.len());
        assert!(report.render().contains("Template 'default'"));
    }

    #[test]
    fn test_render_lists_every_tool() {
        colored::control::set_override(false);
        let report = HealthReport {
            tools: vec![
                ToolStatus {
                    name: "sh".to_string(),
                    path: Some(PathBuf::from("/bin/sh")),
                },
                ToolStatus {
                    name: "nuclei".to_string(),
                    path: None,
                },
            ],
            privileged: false,
            template: "web".to_string(),
            template_status: TemplateStatus::Invalid("empty".to_string()),
        };

        let text = report.render();
        assert!(text.contains("/bin/sh\n"));
        assert!(text.contains("nuclei   not found in PATH\n"));
        assert!(text.ends_with("Template 'web': invalid empty\n"));
    }

    #[test]
    fn test_cyclic_template_is_unhealthy() {
        let temp_dir = tempdir().unwrap();
        let tool_dir = temp_dir.path().join("broken/nmap");
        fs::create_dir_all(&tool_dir).unwrap();
        fs::write(
            tool_dir.join("a.yaml"),
            "requires: b\nsteps:\n  - tool: nmap\n    args: [\"-sT\"]\n",
        )
        .unwrap();
        fs::write(
            tool_dir.join("b.yaml"),
            "requires: a\nsteps:\n  - tool: nmap\n    args: [\"-sT\"]\n",
        )
        .unwrap();

        let report = check(temp_dir.path(), "broken");
        assert!(!report.is_healthy());
        assert!(matches!(report.template_status, TemplateStatus::Invalid(ref r) if r.contains("cycle")));
    }

    #[test]
    fn test_missing_template_is_unhealthy() {
        let temp_dir = tempdir().unwrap();
        assert!(!check(temp_dir.path(), "nope").is_healthy());
    }
}
