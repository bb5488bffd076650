//! nmap normal-output parser.

use once_cell::sync::Lazy;
use regex::Regex;

use super::{PortInfo, ScanResults, ScanType};

static PORT_LINE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(\d+)/(tcp|udp)\s+(\w+)\s+(.*)$").expect("valid port regex"));

/// Flags that turn a port sweep into a service/script scan.
const DEEP_SCAN_FLAGS: &[&str] = &["-sV", "-sC", "-A"];

const REPORT_PREFIX: &str = "Nmap scan report for ";

/// Parses nmap's port table.
///
/// `80/tcp open http Apache httpd 2.4` yields port 80, state `open`,
/// service `http`, version `Apache httpd 2.4`.
pub fn parse(lines: &[String], args: &[String]) -> ScanResults {
    let scan_type = if args.iter().any(|a| DEEP_SCAN_FLAGS.contains(&a.as_str())) {
        ScanType::DeepScan
    } else {
        ScanType::PortDiscovery
    };

    let mut results = ScanResults::new(scan_type);

    for line in lines {
        let line = line.trim();

        if let Some(host) = line.strip_prefix(REPORT_PREFIX) {
            if results.target.is_empty() {
                results.target = host.trim().to_string();
            }
            continue;
        }

        let Some(caps) = PORT_LINE.captures(line) else {
            continue;
        };
        let Ok(number) = caps[1].parse::<u16>() else {
            continue;
        };

        let mut rest = caps[4].split_whitespace();
        let service = rest.next().unwrap_or_default().to_string();
        let version = rest.collect::<Vec<_>>().join(" ");

        results.ports.push(PortInfo {
            number,
            protocol: caps[2].to_string(),
            state: caps[3].to_string(),
            service,
            version,
        });
    }

    results
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lines(text: &str) -> Vec<String> {
        text.lines().map(str::to_string).collect()
    }

    #[test]
    fn test_simple_open_port() {
        let results = parse(&lines("80/tcp   open  http"), &[]);

        assert_eq!(results.ports.len(), 1);
        let port = &results.ports[0];
        assert_eq!(port.number, 80);
        assert_eq!(port.state, "open");
        assert_eq!(port.service, "http");
        assert_eq!(port.version, "");
        assert_eq!(results.scan_type, ScanType::PortDiscovery);
    }

    #[test]
    fn test_service_version_split() {
        let output = "\
Starting Nmap 7.94 ( https://nmap.org )
Nmap scan report for scanme.example (45.33.32.156)
PORT     STATE    SERVICE VERSION
22/tcp   open     ssh     OpenSSH 6.6.1p1 Ubuntu 2ubuntu2.13
53/udp   filtered domain
Nmap done: 1 IP address (1 host up)";

        let args = vec!["-sV".to_string(), "scanme.example".to_string()];
        let results = parse(&lines(output), &args);

        assert_eq!(results.scan_type, ScanType::DeepScan);
        assert_eq!(results.target, "scanme.example (45.33.32.156)");
        assert_eq!(results.ports.len(), 2);
        assert_eq!(results.ports[0].service, "ssh");
        assert_eq!(results.ports[0].version, "OpenSSH 6.6.1p1 Ubuntu 2ubuntu2.13");
        assert_eq!(results.ports[1].protocol, "udp");
        assert_eq!(results.ports[1].state, "filtered");
        assert_eq!(results.open_ports(), vec![22]);
    }

    #[test]
    fn test_deep_flags() {
        for flag in ["-sC", "-A"] {
            let results = parse(&[], &[flag.to_string()]);
            assert_eq!(results.scan_type, ScanType::DeepScan);
        }
        let results = parse(&[], &["-sS".to_string()]);
        assert_eq!(results.scan_type, ScanType::PortDiscovery);
    }

    #[test]
    fn test_ignores_noise() {
        let results = parse(&lines("PORT STATE SERVICE\n99999/tcp open x\n"), &[]);
        assert!(results.ports.is_empty());
    }
}
