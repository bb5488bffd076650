//! Workflow Data Model
//!
//! Core data structures describing scan workflows, their steps and
//! their data contracts.
//!
//! # Example YAML Format
//!
//! A file at `workflows/default/nmap/deep.yaml` defines the workflow
//! keyed `nmap_deep` with logical name `deep`:
//!
//! ```yaml
//! name: Deep service scan
//! description: Version and script scan of discovered ports
//! requires: port_discovery
//! parallel_group: enumeration
//! report:
//!   formats: [json, markdown]
//! steps:
//!   - tool: nmap
//!     args_sudo: ["-sS", "-sV", "-p", "{{discovered_ports}}", "{{target}}"]
//!     args_normal: ["-sT", "-sV", "-p", "{{discovered_ports}}", "{{target}}"]
//! ```

use std::collections::BTreeMap;
use std::fmt;

use serde::de::{self, Deserializer};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// External identity of a workflow: `"{tool}_{name}"`.
///
/// `name` doubles as the logical name used in `requires`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct WorkflowKey {
    pub tool: String,
    pub name: String,
}

impl WorkflowKey {
    pub fn new(tool: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            tool: tool.into(),
            name: name.into(),
        }
    }

    /// Name used for dependency resolution.
    pub fn logical_name(&self) -> &str {
        &self.name
    }
}

impl fmt::Display for WorkflowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}", self.tool, self.name)
    }
}

/// Output formats the reporting collaborator can emit.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ReportFormat {
    Json,
    Markdown,
}

/// Detailed report settings.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ReportSettings {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_formats")]
    pub formats: Vec<ReportFormat>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
}

fn default_true() -> bool {
    true
}

fn default_formats() -> Vec<ReportFormat> {
    vec![ReportFormat::Json]
}

/// `report: true|false` or a `report:` mapping.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(untagged)]
pub enum ReportConfig {
    Toggle(bool),
    Detailed(ReportSettings),
}

impl Default for ReportConfig {
    fn default() -> Self {
        Self::Toggle(true)
    }
}

impl ReportConfig {
    pub fn is_enabled(&self) -> bool {
        match self {
            Self::Toggle(enabled) => *enabled,
            Self::Detailed(settings) => settings.enabled,
        }
    }

    pub fn formats(&self) -> Vec<ReportFormat> {
        match self {
            Self::Toggle(true) => default_formats(),
            Self::Toggle(false) => Vec::new(),
            Self::Detailed(settings) if settings.enabled => settings.formats.clone(),
            Self::Detailed(_) => Vec::new(),
        }
    }

    pub fn title(&self) -> Option<&str> {
        match self {
            Self::Detailed(settings) => settings.title.as_deref(),
            Self::Toggle(_) => None,
        }
    }
}

/// A single tool invocation inside a workflow.
///
/// Either `args` is set, or the `args_sudo`/`args_normal` pair is
/// selected by the privilege flag of the run.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Step {
    /// Program to execute (e.g. "nmap", "naabu", "nuclei")
    pub tool: String,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,

    /// Arguments used when running privileged
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args_sudo: Vec<String>,

    /// Arguments used when running unprivileged
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args_normal: Vec<String>,
}

impl Step {
    /// Creates a step with a single argument list.
    ///
    /// # Example
    ///
    /// ```
    /// use reconflow::workflow::Step;
    ///
    /// let step = Step::new("naabu", ["-host", "{{target}}", "-json"]);
    /// assert_eq!(step.select_args(false)[1], "{{target}}");
    /// ```
    pub fn new<I, S>(tool: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            tool: tool.into().trim().to_string(),
            args: args.into_iter().map(Into::into).collect(),
            args_sudo: Vec::new(),
            args_normal: Vec::new(),
        }
    }

    /// Creates a step with privileged and unprivileged argument lists.
    pub fn with_modes<I, J, S, T>(tool: impl Into<String>, sudo: I, normal: J) -> Self
    where
        I: IntoIterator<Item = S>,
        J: IntoIterator<Item = T>,
        S: Into<String>,
        T: Into<String>,
    {
        Self {
            tool: tool.into().trim().to_string(),
            args: Vec::new(),
            args_sudo: sudo.into_iter().map(Into::into).collect(),
            args_normal: normal.into_iter().map(Into::into).collect(),
        }
    }

    /// True when at least one argument form is present.
    pub fn has_args(&self) -> bool {
        !self.args.is_empty() || !self.args_sudo.is_empty() || !self.args_normal.is_empty()
    }

    /// Picks the argument list for this run's privilege mode.
    pub fn select_args(&self, use_sudo: bool) -> &[String] {
        if !self.args.is_empty() {
            return &self.args;
        }
        match (use_sudo, self.args_sudo.is_empty(), self.args_normal.is_empty()) {
            (true, false, _) => &self.args_sudo,
            (_, _, false) => &self.args_normal,
            _ => &self.args_sudo,
        }
    }

    /// Mutable access to every present argument form.
    pub fn arg_lists_mut(&mut self) -> [&mut Vec<String>; 3] {
        [&mut self.args, &mut self.args_sudo, &mut self.args_normal]
    }
}

/// A named unit of scan work.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Workflow {
    #[serde(default)]
    pub name: String,

    #[serde(default)]
    pub description: String,

    /// Logical names that must complete before this workflow runs
    #[serde(default, deserialize_with = "single_or_vec")]
    pub requires: Vec<String>,

    /// Keys this workflow contributes to the shared variable map
    #[serde(default, deserialize_with = "single_or_vec")]
    pub provides: Vec<String>,

    /// Workflows sharing a group at one level may run concurrently
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parallel_group: Option<String>,

    #[serde(default)]
    pub report: ReportConfig,

    pub steps: Vec<Step>,
}

/// Deserializes either a single string or array of strings into Vec<String>
fn single_or_vec<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let val = Value::deserialize(deserializer)?;
    match val {
        Value::Null => Ok(Vec::new()),
        Value::String(s) if s.is_empty() => Ok(Vec::new()),
        Value::String(s) => Ok(vec![s]),
        Value::Array(arr) => arr
            .into_iter()
            .map(|v| match v {
                Value::String(s) => Ok(s),
                _ => Err(de::Error::custom("Expected string in array")),
            })
            .collect(),
        _ => Err(de::Error::custom("Expected string or array of strings")),
    }
}

impl Workflow {
    /// Creates an empty workflow with the given display name.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            requires: Vec::new(),
            provides: Vec::new(),
            parallel_group: None,
            report: ReportConfig::default(),
            steps: Vec::new(),
        }
    }

    pub fn with_step(mut self, step: Step) -> Self {
        self.steps.push(step);
        self
    }

    pub fn requires(mut self, logical_name: impl Into<String>) -> Self {
        self.requires.push(logical_name.into());
        self
    }

    pub fn provides(mut self, key: impl Into<String>) -> Self {
        self.provides.push(key.into());
        self
    }

    pub fn in_group(mut self, group: impl Into<String>) -> Self {
        self.parallel_group = Some(group.into());
        self
    }

    /// Non-empty parallel group label, if any.
    pub fn group(&self) -> Option<&str> {
        self.parallel_group
            .as_deref()
            .map(str::trim)
            .filter(|g| !g.is_empty())
    }

    /// True when any step runs a vulnerability scanner.
    pub fn is_vulnerability_scan(&self) -> bool {
        self.steps.iter().any(|s| s.tool == "nuclei")
    }
}

/// All workflows loaded from one template directory.
#[derive(Debug, Clone, Default)]
pub struct Template {
    pub name: String,
    pub workflows: BTreeMap<WorkflowKey, Workflow>,
}

impl Template {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            workflows: BTreeMap::new(),
        }
    }

    pub fn insert(&mut self, key: WorkflowKey, workflow: Workflow) {
        self.workflows.insert(key, workflow);
    }

    pub fn len(&self) -> usize {
        self.workflows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workflows.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_display_and_logical_name() {
        let key = WorkflowKey::new("nmap", "deep");
        assert_eq!(key.to_string(), "nmap_deep");
        assert_eq!(key.logical_name(), "deep");
    }

    #[test]
    fn test_select_args_modes() {
        let step = Step::with_modes("nmap", ["-sS", "x"], ["-sT", "x"]);
        assert_eq!(step.select_args(true)[0], "-sS");
        assert_eq!(step.select_args(false)[0], "-sT");

        let only_sudo = Step::with_modes("masscan", ["-p1-65535"], Vec::<String>::new());
        assert_eq!(only_sudo.select_args(false)[0], "-p1-65535");

        let plain = Step::new("naabu", ["-host", "x"]);
        assert_eq!(plain.select_args(true)[0], "-host");
    }

    #[test]
    fn test_step_has_args() {
        assert!(!Step::new("nmap", Vec::<String>::new()).has_args());
        assert!(Step::new("nmap", ["x"]).has_args());
    }

    #[test]
    fn test_workflow_yaml_single_requires_and_report_toggle() {
        let yaml = r#"
name: Vulnerability scan
requires: port_discovery
provides: [findings]
report: false
steps:
  - tool: nuclei
    args: ["-u", "{{target_urls}}", "-jsonl"]
"#;
        let workflow: Workflow = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(workflow.requires, vec!["port_discovery"]);
        assert_eq!(workflow.provides, vec!["findings"]);
        assert_eq!(workflow.report, ReportConfig::Toggle(false));
        assert!(workflow.is_vulnerability_scan());
        assert!(workflow.group().is_none());
    }

    #[test]
    fn test_report_config_detailed() {
        let yaml = r#"
steps:
  - tool: nmap
    args: ["-sV", "{{target}}"]
report:
  formats: [json, markdown]
  title: Services
"#;
        let workflow: Workflow = serde_yaml::from_str(yaml).unwrap();
        assert!(workflow.report.is_enabled());
        assert_eq!(
            workflow.report.formats(),
            vec![ReportFormat::Json, ReportFormat::Markdown]
        );
        assert_eq!(workflow.report.title(), Some("Services"));
        assert_eq!(ReportConfig::default().formats(), vec![ReportFormat::Json]);
    }

    #[test]
    fn test_blank_group_is_sequential() {
        let workflow = Workflow::new("x").in_group("  ");
        assert!(workflow.group().is_none());
        let workflow = Workflow::new("x").in_group("enum");
        assert_eq!(workflow.group(), Some("enum"));
    }

    #[test]
    fn test_template_ordering_by_key() {
        let mut template = Template::new("default");
        template.insert(WorkflowKey::new("nuclei", "vulns"), Workflow::new("b"));
        template.insert(WorkflowKey::new("naabu", "ports"), Workflow::new("a"));

        let keys: Vec<String> = template.workflows.keys().map(|k| k.to_string()).collect();
        assert_eq!(keys, vec!["naabu_ports", "nuclei_vulns"]);
        assert_eq!(template.len(), 2);
    }
}
