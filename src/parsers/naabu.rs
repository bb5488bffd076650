//! naabu JSON-lines parser.
//!
//! naabu only reports open ports, so every well-formed line is an
//! open port.

use log::debug;
use serde::Deserialize;

use super::{PortInfo, ScanResults, ScanType};

#[derive(Deserialize, Debug)]
struct NaabuLine {
    #[serde(default)]
    host: String,
    #[serde(default)]
    ip: String,
    port: u16,
    #[serde(default)]
    protocol: Option<String>,
}

pub fn parse(lines: &[String], _args: &[String]) -> ScanResults {
    let mut results = ScanResults::new(ScanType::PortDiscovery);

    for line in lines {
        let line = line.trim();
        if !line.starts_with('{') {
            continue;
        }

        let entry: NaabuLine = match serde_json::from_str(line) {
            Ok(entry) => entry,
            Err(e) => {
                debug!("Skipping malformed naabu line: {}", e);
                continue;
            }
        };

        if results.target.is_empty() {
            results.target = if entry.host.is_empty() {
                entry.ip.clone()
            } else {
                entry.host.clone()
            };
        }

        let mut port = PortInfo::open(entry.port);
        if let Some(protocol) = entry.protocol.filter(|p| !p.is_empty()) {
            port.protocol = protocol;
        }
        results.ports.push(port);
    }

    results
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_line() {
        let lines = vec![
            r#"{"host":"10.0.0.1","ip":"10.0.0.1","port":22,"protocol":"tcp"}"#.to_string(),
        ];
        let results = parse(&lines, &[]);

        assert_eq!(results.ports.len(), 1);
        assert_eq!(results.ports[0].number, 22);
        assert_eq!(results.ports[0].state, "open");
        assert_eq!(results.target, "10.0.0.1");
        assert_eq!(results.scan_type, ScanType::PortDiscovery);
    }

    #[test]
    fn test_skips_banner_and_garbage() {
        let lines = vec![
            "naabu v2.3.0".to_string(),
            "{not json".to_string(),
            r#"{"ip":"10.0.0.2","port":443}"#.to_string(),
        ];
        let results = parse(&lines, &[]);

        assert_eq!(results.open_ports(), vec![443]);
        assert_eq!(results.target, "10.0.0.2");
        assert_eq!(results.ports[0].protocol, "tcp");
    }
}
