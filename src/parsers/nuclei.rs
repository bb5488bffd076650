//! nuclei JSON-lines parser. Best-effort: malformed lines are skipped.

use serde_json::Value;

use super::{ScanResults, ScanType, VulnerabilityInfo};

pub fn parse(lines: &[String], _args: &[String]) -> ScanResults {
    let mut results = ScanResults::new(ScanType::VulnerabilityScan);

    for line in lines {
        let line = line.trim();
        if !line.starts_with('{') {
            continue;
        }
        let Ok(value) = serde_json::from_str::<Value>(line) else {
            continue;
        };
        let Some(finding) = parse_finding(&value) else {
            continue;
        };

        if results.target.is_empty() {
            if let Some(host) = value.get("host").and_then(Value::as_str) {
                results.target = host.to_string();
            }
        }
        results.vulnerabilities.push(finding);
    }

    results
}

fn parse_finding(value: &Value) -> Option<VulnerabilityInfo> {
    let template_id = value.get("template-id")?.as_str()?.to_string();
    let info = value.get("info");
    let classification = info.and_then(|i| i.get("classification"));

    Some(VulnerabilityInfo {
        template_id,
        name: str_field(info, "name"),
        severity: str_field(info, "severity"),
        url: value
            .get("matched-at")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
        cve: string_list(classification.and_then(|c| c.get("cve-id"))),
        cwe: string_list(classification.and_then(|c| c.get("cwe-id"))),
        tags: string_list(info.and_then(|i| i.get("tags"))),
    })
}

fn str_field(parent: Option<&Value>, key: &str) -> String {
    parent
        .and_then(|p| p.get(key))
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

/// nuclei emits these as arrays, comma-separated strings, or null.
fn string_list(value: Option<&Value>) -> Vec<String> {
    match value {
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(Value::as_str)
            .map(str::to_string)
            .collect(),
        Some(Value::String(s)) => s
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect(),
        _ => Vec::new(),
    }
}
