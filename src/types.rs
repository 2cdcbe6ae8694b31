use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;
use std::time::Duration;
use time::OffsetDateTime;

use crate::ports;

/// Upper bound on a stored banner, in bytes.
pub const MAX_BANNER_BYTES: usize = 200;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Tcp,
    Udp,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Tcp => write!(f, "tcp"),
            Protocol::Udp => write!(f, "udp"),
        }
    }
}

/// One (host, port, protocol) probe target.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ScanUnit {
    pub host: IpAddr,
    pub port: u16,
    pub protocol: Protocol,
}

impl ScanUnit {
    pub fn tcp(host: IpAddr, port: u16) -> Self {
        Self {
            host,
            port,
            protocol: Protocol::Tcp,
        }
    }

    pub fn udp(host: IpAddr, port: u16) -> Self {
        Self {
            host,
            port,
            protocol: Protocol::Udp,
        }
    }
}

impl fmt::Display for ScanUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.host {
            IpAddr::V4(ip) => write!(f, "{}:{}/{}", ip, self.port, self.protocol),
            IpAddr::V6(ip) => write!(f, "[{}]:{}/{}", ip, self.port, self.protocol),
        }
    }
}

/// Outcome of a single probe.
///
/// `OpenFiltered` is only produced by UDP probes: silence within the timeout
/// cannot tell an open-but-quiet service from a dropped datagram.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum PortState {
    Open,
    Closed,
    Filtered,
    #[serde(rename = "open|filtered")]
    OpenFiltered,
    Error,
}

impl PortState {
    pub const ALL: [PortState; 5] = [
        PortState::Open,
        PortState::Closed,
        PortState::Filtered,
        PortState::OpenFiltered,
        PortState::Error,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            PortState::Open => "open",
            PortState::Closed => "closed",
            PortState::Filtered => "filtered",
            PortState::OpenFiltered => "open|filtered",
            PortState::Error => "error",
        }
    }
}

impl fmt::Display for PortState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result record for one scan unit.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ProbeResult {
    #[serde(flatten)]
    pub unit: ScanUnit,
    pub state: PortState,
    #[serde(rename = "service")]
    pub service_guess: Option<String>,
    pub banner: Option<String>,
    pub elapsed_ms: u64,
    pub error_detail: Option<String>,
}

impl ProbeResult {
    pub fn new(unit: ScanUnit, state: PortState, elapsed: Duration) -> Self {
        Self {
            unit,
            state,
            service_guess: ports::service_name(unit.port).map(str::to_string),
            banner: None,
            elapsed_ms: elapsed.as_millis().min(u64::MAX as u128) as u64,
            error_detail: None,
        }
    }

    pub fn with_banner(mut self, banner: Option<String>) -> Self {
        self.banner = banner.map(|b| truncate_banner(&b));
        self
    }

    pub fn with_error(mut self, detail: impl Into<String>) -> Self {
        self.error_detail = Some(detail.into());
        self
    }
}

/// Cut a banner to [`MAX_BANNER_BYTES`] without splitting a UTF-8 sequence.
pub fn truncate_banner(s: &str) -> String {
    if s.len() <= MAX_BANNER_BYTES {
        return s.to_string();
    }
    let mut end = MAX_BANNER_BYTES;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    s[..end].to_string()
}

/// Per-state tallies. Every state is always present, zero or not.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StateCounts {
    pub open: u64,
    pub closed: u64,
    pub filtered: u64,
    #[serde(rename = "open|filtered")]
    pub open_filtered: u64,
    pub error: u64,
}

impl StateCounts {
    pub fn from_results<'a>(results: impl IntoIterator<Item = &'a ProbeResult>) -> Self {
        let mut counts = Self::default();
        for r in results {
            counts.record(r.state);
        }
        counts
    }

    pub fn record(&mut self, state: PortState) {
        *self.slot(state) += 1;
    }

    pub fn get(&self, state: PortState) -> u64 {
        match state {
            PortState::Open => self.open,
            PortState::Closed => self.closed,
            PortState::Filtered => self.filtered,
            PortState::OpenFiltered => self.open_filtered,
            PortState::Error => self.error,
        }
    }

    pub fn total(&self) -> u64 {
        PortState::ALL.iter().map(|s| self.get(*s)).sum()
    }

    fn slot(&mut self, state: PortState) -> &mut u64 {
        match state {
            PortState::Open => &mut self.open,
            PortState::Closed => &mut self.closed,
            PortState::Filtered => &mut self.filtered,
            PortState::OpenFiltered => &mut self.open_filtered,
            PortState::Error => &mut self.error,
        }
    }
}

/// A scanned address and where it came from.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct HostInfo {
    pub address: IpAddr,
    /// The host-spec entry (name, CIDR, range or literal) that produced the address.
    pub label: String,
    /// Reverse DNS name, when looked up and found.
    #[serde(default)]
    pub ptr: Option<String>,
}

/// Frozen outcome of one scan run.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ScanReport {
    pub target: String,
    #[serde(with = "time::serde::rfc3339")]
    pub started_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub finished_at: OffsetDateTime,
    /// Set when the scan was cancelled before every planned unit was dispatched.
    #[serde(default)]
    pub interrupted: bool,
    /// Number of units the target expansion produced.
    #[serde(default)]
    pub planned: u64,
    /// Addresses given as single entries plus every address with an open port.
    #[serde(default)]
    pub hosts: Vec<HostInfo>,
    pub counts: StateCounts,
    pub results: Vec<ProbeResult>,
}

impl ScanReport {
    pub fn open_ports(&self) -> impl Iterator<Item = &ProbeResult> {
        self.results.iter().filter(|r| r.state == PortState::Open)
    }

    pub fn duration(&self) -> Duration {
        (self.finished_at - self.started_at)
            .try_into()
            .unwrap_or(Duration::ZERO)
    }
}
