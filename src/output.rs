use clap::ValueEnum;
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

use crate::error::{Result, ScanError};
use crate::types::{PortState, ProbeResult, ScanReport};

/// Header row of the CSV rendering.
pub const CSV_HEADER: [&str; 6] = ["host", "port", "state", "service", "banner", "elapsed_ms"];

/// Banner characters shown in the console table.
const CONSOLE_BANNER_CHARS: usize = 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Format {
    #[value(help = "Human-readable table and summary")]
    Console,
    #[value(help = "JSON document with scan metadata")]
    Json,
    #[value(help = "CSV, one row per probed port")]
    Csv,
}

pub fn render(report: &ScanReport, format: Format) -> Result<String> {
    match format {
        Format::Console => Ok(render_console(report, false)),
        Format::Json => render_json(report),
        Format::Csv => render_csv(report),
    }
}

pub fn render_json(report: &ScanReport) -> Result<String> {
    let mut out = serde_json::to_string_pretty(report)?;
    out.push('\n');
    Ok(out)
}

/// Read back a JSON rendering.
pub fn parse_json(text: &str) -> Result<ScanReport> {
    Ok(serde_json::from_str(text)?)
}

pub fn render_csv(report: &ScanReport) -> Result<String> {
    let mut wtr = csv::Writer::from_writer(Vec::new());
    wtr.write_record(CSV_HEADER)?;
    for r in &report.results {
        wtr.write_record([
            r.unit.host.to_string(),
            r.unit.port.to_string(),
            r.state.to_string(),
            r.service_guess.clone().unwrap_or_default(),
            r.banner.clone().unwrap_or_default(),
            r.elapsed_ms.to_string(),
        ])?;
    }
    let bytes = wtr
        .into_inner()
        .map_err(|e| ScanError::Io(e.into_error()))?;
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

/// Table of results plus a one-line state summary. With `open_only` the
/// table lists open ports only; the summary always covers everything.
pub fn render_console(report: &ScanReport, open_only: bool) -> String {
    let rows: Vec<&ProbeResult> = report
        .results
        .iter()
        .filter(|r| !open_only || r.state == PortState::Open)
        .collect();

    let mut out = String::new();
    out.push_str(&format!("Scan report for {}\n", report.target));
    out.push_str(&format!(
        "started {}  finished {}  ({:.2}s)\n",
        timestamp(report.started_at),
        timestamp(report.finished_at),
        report.duration().as_secs_f64()
    ));
    if report.interrupted {
        out.push_str(&format!(
            "scan interrupted: {} of {} planned units probed\n",
            report.results.len(),
            report.planned
        ));
    }
    if !report.hosts.is_empty() {
        out.push_str("hosts:\n");
        for h in &report.hosts {
            out.push_str(&format!("  {}  {}", h.address, h.label));
            if let Some(ptr) = &h.ptr {
                out.push_str(&format!("  ptr={ptr}"));
            }
            out.push('\n');
        }
    }
    out.push('\n');

    if rows.is_empty() {
        out.push_str(if open_only {
            "No open ports found.\n"
        } else {
            "No results.\n"
        });
    } else {
        let snippets: Vec<String> = rows.iter().map(|r| detail_snippet(r)).collect();
        let host_w = rows
            .iter()
            .map(|r| r.unit.host.to_string().len())
            .max()
            .unwrap_or(0)
            .max("host".len());
        let service_w = rows
            .iter()
            .filter_map(|r| r.service_guess.as_ref().map(String::len))
            .max()
            .unwrap_or(0)
            .max("service".len());
        let port_w = 5;
        let proto_w = 5;
        let state_w = "open|filtered".len();
        let ms_w = "elapsed_ms".len();

        out.push_str(&format!(
            "{:<host_w$}  {:>port_w$}  {:<proto_w$}  {:<state_w$}  {:<service_w$}  {:>ms_w$}  {}\n",
            "host", "port", "proto", "state", "service", "elapsed_ms", "banner"
        ));
        out.push_str(&format!(
            "{:-<host_w$}  {:-<port_w$}  {:-<proto_w$}  {:-<state_w$}  {:-<service_w$}  {:-<ms_w$}  {:-<6}\n",
            "", "", "", "", "", "", ""
        ));
        for (r, snippet) in rows.iter().zip(&snippets) {
            out.push_str(&format!(
                "{:<host_w$}  {:>port_w$}  {:<proto_w$}  {:<state_w$}  {:<service_w$}  {:>ms_w$}  {}\n",
                r.unit.host.to_string(),
                r.unit.port,
                r.unit.protocol.to_string(),
                r.state.as_str(),
                r.service_guess.as_deref().unwrap_or("-"),
                r.elapsed_ms,
                snippet
            ));
        }
    }

    let c = &report.counts;
    out.push_str(&format!(
        "\nopen: {}  closed: {}  filtered: {}  open|filtered: {}  error: {}  (total {})\n",
        c.open,
        c.closed,
        c.filtered,
        c.open_filtered,
        c.error,
        c.total()
    ));
    out
}

/// Banner, or the error detail for failed probes, on one short line.
fn detail_snippet(r: &ProbeResult) -> String {
    let text = match r.state {
        PortState::Error => r.error_detail.as_deref(),
        _ => r.banner.as_deref(),
    }
    .unwrap_or("");
    let escaped = text.replace('\r', "\\r").replace('\n', "\\n");
    let mut snip: String = escaped.chars().take(CONSOLE_BANNER_CHARS).collect();
    if escaped.chars().count() > CONSOLE_BANNER_CHARS {
        snip.push_str("...");
    }
    snip
}

fn timestamp(at: OffsetDateTime) -> String {
    at.format(&Rfc3339)
        .unwrap_or_else(|_| String::from("1970-01-01T00:00:00Z"))
}

enum Destination {
    Stdout,
    File { path: PathBuf, file: File },
}

/// Writes a rendered report to stdout or a file. The file is created when
/// the writer is built, so an unwritable path fails before any scanning.
pub struct OutputWriter {
    format: Format,
    open_only: bool,
    dest: Destination,
}

impl OutputWriter {
    pub fn stdout(format: Format) -> Self {
        Self {
            format,
            open_only: false,
            dest: Destination::Stdout,
        }
    }

    pub fn to_path(format: Format, path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = File::create(&path).map_err(|source| ScanError::Output {
            path: path.clone(),
            source,
        })?;
        Ok(Self {
            format,
            open_only: false,
            dest: Destination::File { path, file },
        })
    }

    /// Restrict the console table to open ports.
    pub fn open_only(mut self, open_only: bool) -> Self {
        self.open_only = open_only;
        self
    }

    pub fn write(self, report: &ScanReport) -> Result<()> {
        let text = match self.format {
            Format::Console => render_console(report, self.open_only),
            other => render(report, other)?,
        };
        match self.dest {
            Destination::Stdout => {
                let mut out = io::stdout().lock();
                out.write_all(text.as_bytes())?;
                out.flush()?;
            }
            Destination::File { path, file } => {
                let mut writer = BufWriter::new(file);
                writer
                    .write_all(text.as_bytes())
                    .and_then(|_| writer.flush())
                    .map_err(|source| ScanError::Output { path, source })?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{HostInfo, ScanUnit, StateCounts};
    use std::net::{IpAddr, Ipv4Addr};
    use std::time::Duration;

    fn sample() -> ScanReport {
        let host = IpAddr::V4(Ipv4Addr::LOCALHOST);
        let results = vec![
            ProbeResult::new(ScanUnit::tcp(host, 21), PortState::Closed, Duration::from_millis(1)),
            ProbeResult::new(ScanUnit::tcp(host, 22), PortState::Open, Duration::from_millis(2))
                .with_banner(Some("SSH-2.0-OpenSSH_9.6\r\nextra".into())),
            ProbeResult::new(ScanUnit::tcp(host, 23), PortState::Error, Duration::from_millis(3))
                .with_error("network unreachable"),
        ];
        let now = OffsetDateTime::now_utc();
        ScanReport {
            target: "127.0.0.1".into(),
            started_at: now,
            finished_at: now,
            interrupted: false,
            planned: 3,
            hosts: Vec::new(),
            counts: StateCounts::from_results(&results),
            results,
        }
    }

    #[test]
    fn console_lists_rows_and_summary() {
        let text = render_console(&sample(), false);
        assert!(text.contains("Scan report for 127.0.0.1"));
        assert!(text.contains("SSH-2.0-OpenSSH_9.6\\r\\nextra"));
        assert!(text.contains("network unreachable"));
        assert!(text.contains("open: 1  closed: 1  filtered: 0  open|filtered: 0  error: 1  (total 3)"));
    }

    #[test]
    fn console_header_lists_named_hosts() {
        let mut report = sample();
        report.hosts.push(HostInfo {
            address: IpAddr::V4(Ipv4Addr::LOCALHOST),
            label: "localhost".into(),
            ptr: Some("localhost.localdomain".into()),
        });
        let text = render_console(&report, false);
        assert!(text.contains("hosts:\n  127.0.0.1  localhost  ptr=localhost.localdomain\n"));
        assert!(!render_console(&sample(), false).contains("hosts:"));
    }

    #[test]
    fn console_open_only_filters_table_not_summary() {
        let text = render_console(&sample(), true);
        assert!(text.contains("SSH"));
        assert!(!text.contains("network unreachable"));
        assert!(text.contains("(total 3)"));
    }

    #[test]
    fn csv_header_is_exact() {
        let csv = render_csv(&sample()).unwrap();
        assert_eq!(csv.lines().next(), Some("host,port,state,service,banner,elapsed_ms"));
    }

    #[test]
    fn json_has_documented_top_level_keys() {
        let json = render_json(&sample()).unwrap();
        let v: serde_json::Value = serde_json::from_str(&json).unwrap();
        for key in ["target", "started_at", "finished_at", "counts", "results"] {
            assert!(v.get(key).is_some(), "missing {key}");
        }
        let first = &v["results"][0];
        for key in ["host", "port", "state", "service", "banner", "elapsed_ms"] {
            assert!(first.get(key).is_some(), "missing result field {key}");
        }
        assert_eq!(first["host"], "127.0.0.1");
        assert_eq!(v["counts"]["open"], 1);
    }
}
