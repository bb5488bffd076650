//! Tool Output Parsers
//!
//! Pure functions that turn a tool's line output into the canonical
//! [`ScanResults`] shape shared by every workflow.
//!
//! - [`nmap`]: grepable port table lines
//! - [`naabu`]: one JSON object per open port
//! - [`nuclei`]: one JSON finding per line

pub mod naabu;
pub mod nmap;
pub mod nuclei;

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Kind of scan a set of results came from.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum ScanType {
    #[default]
    PortDiscovery,
    DeepScan,
    VulnerabilityScan,
}

impl ScanType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PortDiscovery => "port-discovery",
            Self::DeepScan => "deep-scan",
            Self::VulnerabilityScan => "vulnerability-scan",
        }
    }
}

impl fmt::Display for ScanType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single port line.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct PortInfo {
    pub number: u16,
    pub protocol: String,
    pub state: String,
    #[serde(default)]
    pub service: String,
    #[serde(default)]
    pub version: String,
}

impl PortInfo {
    /// Creates an open TCP port with no service information.
    pub fn open(number: u16) -> Self {
        Self {
            number,
            protocol: "tcp".to_string(),
            state: "open".to_string(),
            service: String::new(),
            version: String::new(),
        }
    }

    pub fn is_open(&self) -> bool {
        self.state == "open"
    }
}

/// A single templated finding.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Default)]
pub struct VulnerabilityInfo {
    pub template_id: String,
    pub name: String,
    pub severity: String,
    pub url: String,
    #[serde(default)]
    pub cve: Vec<String>,
    #[serde(default)]
    pub cwe: Vec<String>,
    #[serde(default)]
    pub tags: Vec<String>,
}

/// Canonical result of one tool invocation (or a merged workflow).
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
pub struct ScanResults {
    pub target: String,
    pub scan_type: ScanType,
    #[serde(default)]
    pub ports: Vec<PortInfo>,
    #[serde(default)]
    pub vulnerabilities: Vec<VulnerabilityInfo>,
}

impl ScanResults {
    pub fn new(scan_type: ScanType) -> Self {
        Self {
            scan_type,
            ..Self::default()
        }
    }

    /// Sorted, de-duplicated numbers of every open port.
    pub fn open_ports(&self) -> Vec<u16> {
        self.ports
            .iter()
            .filter(|p| p.is_open())
            .map(|p| p.number)
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.ports.is_empty() && self.vulnerabilities.is_empty()
    }

    /// Folds another result into this one. The later scan type wins.
    pub fn merge(&mut self, other: ScanResults) {
        if self.target.is_empty() {
            self.target = other.target;
        }
        self.scan_type = other.scan_type;
        self.ports.extend(other.ports);
        self.vulnerabilities.extend(other.vulnerabilities);
    }
}

/// Returns true when a parser exists for `tool`.
pub fn has_parser(tool: &str) -> bool {
    matches!(tool, "nmap" | "naabu" | "nuclei")
}

/// Dispatches to the parser for `tool`. Unknown tools yield `None`.
pub fn parse_output(tool: &str, lines: &[String], args: &[String]) -> Option<ScanResults> {
    match tool {
        "nmap" => Some(nmap::parse(lines, args)),
        "naabu" => Some(naabu::parse(lines, args)),
        "nuclei" => Some(nuclei::parse(lines, args)),
        _ => None,
    }
}

/// Comma-joined form of a port list, as stored under `discovered_ports`.
pub fn join_ports(ports: &[u16]) -> String {
    ports
        .iter()
        .map(|p| p.to_string())
        .collect::<Vec<_>>()
        .join(",")
}
