use std::collections::BTreeSet;
use std::fs;
use std::path::Path;

use crate::error::{Result, ScanError};

/// Well-known ports scanned when no port spec is given, with their service names.
pub const COMMON_PORTS: &[(u16, &str)] = &[
    (21, "FTP"),
    (22, "SSH"),
    (23, "Telnet"),
    (25, "SMTP"),
    (53, "DNS"),
    (80, "HTTP"),
    (110, "POP3"),
    (143, "IMAP"),
    (443, "HTTPS"),
    (445, "SMB"),
    (3306, "MySQL"),
    (3389, "RDP"),
    (5432, "PostgreSQL"),
    (6379, "Redis"),
    (8080, "HTTP-Proxy"),
    (8443, "HTTPS-Alt"),
    (9200, "Elasticsearch"),
    (27017, "MongoDB"),
];

// Named for service guessing only; not part of the default scan set.
const EXTRA_SERVICES: &[(u16, &str)] = &[
    (123, "NTP"),
    (161, "SNMP"),
    (500, "IKE"),
    (587, "Submission"),
    (993, "IMAPS"),
    (995, "POP3S"),
    (1433, "MSSQL"),
    (1900, "SSDP"),
    (5900, "VNC"),
];

/// Static port → service name lookup. Unknown ports yield `None`.
pub fn service_name(port: u16) -> Option<&'static str> {
    COMMON_PORTS
        .iter()
        .chain(EXTRA_SERVICES)
        .find(|(p, _)| *p == port)
        .map(|(_, name)| *name)
}

/// The default scan set, ascending.
pub fn default_ports() -> Vec<u16> {
    let mut ports: Vec<u16> = COMMON_PORTS.iter().map(|(p, _)| *p).collect();
    ports.sort_unstable();
    ports
}

/// Parse a command-line port spec into an ascending, deduplicated list.
///
/// Accepts `80`, `1-1024`, `80,443,8080`, mixes such as `22,8000-8010`,
/// and the keywords `common` (the default table) and `all` (1-65535).
pub fn parse_port_spec(spec: &str) -> Result<Vec<u16>> {
    let mut set = BTreeSet::new();
    for token in spec.split(',').map(str::trim) {
        if token.is_empty() {
            continue;
        }
        match token.to_ascii_lowercase().as_str() {
            "common" => set.extend(default_ports()),
            "all" => set.extend(1..=u16::MAX),
            _ => add_token(&mut set, token).map_err(|reason| ScanError::ports(spec, reason))?,
        }
    }
    if set.is_empty() {
        return Err(ScanError::ports(spec, "no ports given"));
    }
    Ok(set.into_iter().collect())
}

/// Parse a ports file into an ascending, deduplicated list.
///
/// Supported formats per line:
/// - single port number: `80`
/// - inclusive range: `8000-8010`
/// - comments: everything after `#` is ignored
/// - whitespace and blank lines are ignored
pub fn parse_ports_str(s: &str) -> Result<Vec<u16>> {
    let mut set = BTreeSet::new();
    for (idx, raw_line) in s.lines().enumerate() {
        let line = raw_line.split('#').next().map(str::trim).unwrap_or("");
        if line.is_empty() {
            continue;
        }
        add_token(&mut set, line)
            .map_err(|reason| ScanError::ports(line, format!("line {}: {reason}", idx + 1)))?;
    }
    Ok(set.into_iter().collect())
}

/// Load a ports list from a file path. Errors if the file cannot be read,
/// fails to parse, or lists no ports.
pub fn load_ports_from_path(path: impl AsRef<Path>) -> Result<Vec<u16>> {
    let path = path.as_ref();
    let content = fs::read_to_string(path)?;
    let ports = parse_ports_str(&content)?;
    if ports.is_empty() {
        return Err(ScanError::ports(
            &path.display().to_string(),
            "file lists no ports",
        ));
    }
    Ok(ports)
}

fn add_token(set: &mut BTreeSet<u16>, token: &str) -> std::result::Result<(), String> {
    if let Some((a, b)) = token.split_once('-') {
        let start = parse_port_str(a.trim()).map_err(|e| format!("invalid range start: {e}"))?;
        let end = parse_port_str(b.trim()).map_err(|e| format!("invalid range end: {e}"))?;
        if start > end {
            return Err(format!("invalid range {start}-{end} (start > end)"));
        }
        set.extend(start..=end);
    } else {
        set.insert(parse_port_str(token)?);
    }
    Ok(())
}

fn parse_port_str(s: &str) -> std::result::Result<u16, String> {
    let val: u32 = s.parse().map_err(|_| format!("not a port number: `{s}`"))?;
    if val == 0 || val > 65535 {
        return Err(format!("port out of range: {val}"));
    }
    Ok(val as u16)
}
