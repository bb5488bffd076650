//! Placeholder Substitution
//!
//! Step arguments may contain `{{name}}` placeholders. They are filled
//! from a per-workflow [`Vars`] copy built from the shared provided data
//! plus the run globals (`target`, `template`, `report_dir`).

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;

use log::{debug, info};
use once_cell::sync::Lazy;
use regex::{Captures, Regex};

use super::model::{Step, Workflow, WorkflowKey};

pub const TARGET: &str = "target";
pub const TEMPLATE: &str = "template";
pub const REPORT_DIR: &str = "report_dir";
pub const DISCOVERED_PORTS: &str = "discovered_ports";
pub const TARGET_URLS: &str = "target_urls";

/// Ports scanned by deep nmap workflows before anything was discovered.
pub const FALLBACK_PORTS: &str = "22,53,80,135,139,443,445,993,995,3306,3389,5432,5900,8080,8443";

/// Web ports and the URL scheme served on them.
const PORT_SCHEMES: &[(u16, &str)] = &[
    (80, "http"),
    (443, "https"),
    (3000, "http"),
    (5000, "http"),
    (8000, "http"),
    (8008, "http"),
    (8080, "http"),
    (8443, "https"),
    (8888, "http"),
    (9443, "https"),
];

static PLACEHOLDER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\{\{\s*([A-Za-z0-9_.-]+)\s*\}\}").expect("valid placeholder regex"));

/// Values fixed for the whole run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunGlobals {
    pub target: String,
    pub template: String,
    pub report_dir: PathBuf,
}

impl RunGlobals {
    pub fn new(
        target: impl Into<String>,
        template: impl Into<String>,
        report_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            target: target.into(),
            template: template.into(),
            report_dir: report_dir.into(),
        }
    }
}

/// A private, owned copy of the variable map for one workflow.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Vars {
    values: BTreeMap<String, String>,
}

impl Vars {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds the map from a provided-data snapshot; globals win on conflict.
    pub fn from_snapshot(snapshot: HashMap<String, String>, globals: &RunGlobals) -> Self {
        let mut vars = Self {
            values: snapshot.into_iter().collect(),
        };
        vars.insert(TARGET, globals.target.clone());
        vars.insert(TEMPLATE, globals.template.clone());
        vars.insert(REPORT_DIR, globals.report_dir.display().to_string());
        vars
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    /// Value of `key` if present and non-blank.
    pub fn non_empty(&self, key: &str) -> Option<&str> {
        self.get(key).map(str::trim).filter(|v| !v.is_empty())
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.values.insert(key.into(), value.into());
    }

    pub fn contains(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &String)> {
        self.values.iter()
    }
}

/// Replaces every known `{{key}}` in `text`. Unknown placeholders stay.
pub fn substitute(text: &str, vars: &Vars) -> String {
    PLACEHOLDER
        .replace_all(text, |caps: &Captures| match vars.get(&caps[1]) {
            Some(value) => value.to_string(),
            None => caps[0].to_string(),
        })
        .into_owned()
}

/// Rewrites `args`, `args_sudo` and `args_normal` in place.
pub fn substitute_step(step: &mut Step, vars: &Vars) {
    for list in step.arg_lists_mut() {
        for arg in list.iter_mut() {
            *arg = substitute(arg, vars);
        }
    }
}

pub fn substitute_workflow(workflow: &mut Workflow, vars: &Vars) {
    for step in &mut workflow.steps {
        substitute_step(step, vars);
    }
}

/// Names of placeholders still present in `args`, in first-seen order.
pub fn unresolved_placeholders(args: &[String]) -> Vec<String> {
    let mut names: Vec<String> = Vec::new();
    for arg in args {
        for caps in PLACEHOLDER.captures_iter(arg) {
            let name = caps[1].to_string();
            if !names.contains(&name) {
                names.push(name);
            }
        }
    }
    names
}

/// URL or `host:port` form of one port.
///
/// ```
/// use reconflow::workflow::variables::port_target;
///
/// assert_eq!(port_target("10.0.0.1", 80), "http://10.0.0.1");
/// assert_eq!(port_target("10.0.0.1", 8443), "https://10.0.0.1:8443");
/// assert_eq!(port_target("10.0.0.1", 22), "10.0.0.1:22");
/// ```
pub fn port_target(target: &str, port: u16) -> String {
    match scheme_for(port) {
        Some("http") if port == 80 => format!("http://{}", target),
        Some("https") if port == 443 => format!("https://{}", target),
        Some(scheme) => format!("{}://{}:{}", scheme, target, port),
        None => format!("{}:{}", target, port),
    }
}

fn scheme_for(port: u16) -> Option<&'static str> {
    PORT_SCHEMES
        .iter()
        .find(|(p, _)| *p == port)
        .map(|(_, scheme)| *scheme)
}

fn parse_ports(ports: &str) -> Vec<u16> {
    ports
        .split(',')
        .filter_map(|p| p.trim().parse::<u16>().ok())
        .collect()
}

/// Builds the comma-joined `target_urls` value from a port list.
///
/// Web ports become URLs. Without any web port the `host:port` forms
/// are used instead, and without any port at all the bare target.
pub fn derive_target_urls(target: &str, discovered_ports: &str) -> String {
    let ports = parse_ports(discovered_ports);

    let web: Vec<String> = ports
        .iter()
        .filter(|p| scheme_for(**p).is_some())
        .map(|p| port_target(target, *p))
        .collect();
    if !web.is_empty() {
        return web.join(",");
    }

    if ports.is_empty() {
        return target.to_string();
    }

    ports
        .iter()
        .map(|p| port_target(target, *p))
        .collect::<Vec<_>>()
        .join(",")
}

/// True for nmap workflows that scan a port list in depth.
pub fn is_deep_nmap(key: &WorkflowKey) -> bool {
    key.tool == "nmap" && key.name.contains("deep")
}

/// Applies the tool-specific variable derivations for one workflow.
pub fn apply_derivations(key: &WorkflowKey, workflow: &Workflow, vars: &mut Vars) {
    if workflow.is_vulnerability_scan() {
        let target = vars.get(TARGET).unwrap_or_default().to_string();
        let ports = vars.non_empty(DISCOVERED_PORTS).unwrap_or_default().to_string();
        let urls = derive_target_urls(&target, &ports);
        debug!("{}: target_urls = {}", key, urls);
        vars.insert(TARGET_URLS, urls);
    }

    if is_deep_nmap(key) && vars.non_empty(DISCOVERED_PORTS).is_none() {
        info!("{}: no ports discovered yet, using fallback port list", key);
        vars.insert(DISCOVERED_PORTS, FALLBACK_PORTS);
    }
}
