//! Target expansion: host specs and port specs into a lazy stream of scan units.

use if_addrs::{get_if_addrs, IfAddr};
use ipnet::{IpAddrRange, IpNet, Ipv4AddrRange, Ipv4Net, Ipv6AddrRange};
use std::collections::BTreeSet;
use std::fs;
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::path::Path;
use std::time::Duration;
use tokio::net::lookup_host;
use tracing::{debug, info, warn};

use crate::error::{Result, ScanError};
use crate::ports::{default_ports, parse_port_spec};
use crate::types::{Protocol, ScanUnit};

/// Index into per-family span lists.
const V4: usize = 0;
const V6: usize = 1;

/// How long a single hostname lookup may take before the host is skipped.
pub const RESOLVE_TIMEOUT: Duration = Duration::from_secs(5);

/// Interface networks broader than this are narrowed to the surrounding /24.
const MIN_LOCAL_PREFIX: u8 = 16;

/// A contiguous, inclusive span of addresses produced by one host-spec entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostSource {
    label: String,
    first: IpAddr,
    last: IpAddr,
}

impl HostSource {
    pub fn single(label: impl Into<String>, ip: IpAddr) -> Self {
        Self {
            label: label.into(),
            first: ip,
            last: ip,
        }
    }

    /// Usable host addresses of a network.
    ///
    /// For IPv4, excludes the network and broadcast addresses unless the
    /// prefix is /31 or /32. For IPv6, excludes the network address unless
    /// the prefix is /127 or /128.
    pub fn from_net(label: impl Into<String>, net: IpNet) -> Self {
        let (first, last) = match net {
            IpNet::V4(n) => {
                let (lo, hi) = (u32::from(n.network()), u32::from(n.broadcast()));
                if n.prefix_len() >= 31 {
                    (IpAddr::V4(lo.into()), IpAddr::V4(hi.into()))
                } else {
                    (IpAddr::V4((lo + 1).into()), IpAddr::V4((hi - 1).into()))
                }
            }
            IpNet::V6(n) => {
                let (lo, hi) = (u128::from(n.network()), u128::from(n.broadcast()));
                if n.prefix_len() >= 127 {
                    (IpAddr::V6(lo.into()), IpAddr::V6(hi.into()))
                } else {
                    (IpAddr::V6((lo + 1).into()), IpAddr::V6(hi.into()))
                }
            }
        };
        Self {
            label: label.into(),
            first,
            last,
        }
    }

    pub fn range(label: impl Into<String>, first: IpAddr, last: IpAddr) -> Result<Self> {
        let label = label.into();
        let ordered = match (first, last) {
            (IpAddr::V4(a), IpAddr::V4(b)) => a <= b,
            (IpAddr::V6(a), IpAddr::V6(b)) => a <= b,
            _ => return Err(ScanError::target(&label, "range mixes IPv4 and IPv6")),
        };
        if !ordered {
            return Err(ScanError::target(&label, "range start is after range end"));
        }
        Ok(Self { label, first, last })
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn first(&self) -> IpAddr {
        self.first
    }

    pub fn last(&self) -> IpAddr {
        self.last
    }

    /// Number of addresses in the span, saturating at `u64::MAX`.
    pub fn len(&self) -> u64 {
        match (self.first, self.last) {
            (IpAddr::V4(a), IpAddr::V4(b)) => u64::from(u32::from(b) - u32::from(a)) + 1,
            (IpAddr::V6(a), IpAddr::V6(b)) => {
                let n = u128::from(b) - u128::from(a);
                u64::try_from(n).map_or(u64::MAX, |n| n.saturating_add(1))
            }
            _ => 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, ip: IpAddr) -> bool {
        let (family, n) = numeric(ip);
        matches!(span(self), Some((f, lo, hi)) if f == family && lo <= n && n <= hi)
    }

    /// Lazily iterate the addresses in ascending order.
    pub fn addrs(&self) -> IpAddrRange {
        match (self.first, self.last) {
            (IpAddr::V4(a), IpAddr::V4(b)) => IpAddrRange::from(Ipv4AddrRange::new(a, b)),
            (IpAddr::V6(a), IpAddr::V6(b)) => IpAddrRange::from(Ipv6AddrRange::new(a, b)),
            // `range` rejects mixed families; keep the iterator empty regardless.
            _ => IpAddrRange::from(Ipv4AddrRange::new(
                Ipv4Addr::BROADCAST,
                Ipv4Addr::UNSPECIFIED,
            )),
        }
    }
}

/// The expanded target set: resolved hosts crossed with the port list.
#[derive(Debug, Clone)]
pub struct ScanPlan {
    target: String,
    hosts: Vec<HostSource>,
    ports: Vec<u16>,
    protocol: Protocol,
}

impl ScanPlan {
    /// `ports` is sorted and deduplicated here so every host sees them ascending.
    /// Addresses already covered by an earlier host source are dropped, so
    /// every unit is enumerated once.
    pub fn new(
        target: impl Into<String>,
        hosts: Vec<HostSource>,
        mut ports: Vec<u16>,
        protocol: Protocol,
    ) -> Self {
        ports.sort_unstable();
        ports.dedup();
        Self {
            target: target.into(),
            hosts: disjoint_sources(hosts),
            ports,
            protocol,
        }
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn hosts(&self) -> &[HostSource] {
        &self.hosts
    }

    pub fn ports(&self) -> &[u16] {
        &self.ports
    }

    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    /// The host-spec entry an address was expanded from.
    pub fn label_for(&self, ip: IpAddr) -> Option<&str> {
        self.hosts
            .iter()
            .find(|h| h.contains(ip))
            .map(HostSource::label)
    }

    /// Size of the host × port cross-product, without enumerating it.
    pub fn total_units(&self) -> u64 {
        let hosts = self
            .hosts
            .iter()
            .fold(0u64, |acc, h| acc.saturating_add(h.len()));
        hosts.saturating_mul(self.ports.len() as u64)
    }

    /// Units in deterministic order: hosts in input order, ports ascending per host.
    /// Nothing is materialized up front.
    pub fn units(&self) -> impl Iterator<Item = ScanUnit> + '_ {
        let protocol = self.protocol;
        self.hosts.iter().flat_map(move |source| {
            source.addrs().flat_map(move |host| {
                self.ports
                    .iter()
                    .map(move |&port| ScanUnit { host, port, protocol })
            })
        })
    }
}

fn numeric(ip: IpAddr) -> (usize, u128) {
    match ip {
        IpAddr::V4(a) => (V4, u128::from(u32::from(a))),
        IpAddr::V6(a) => (V6, u128::from(a)),
    }
}

fn span(source: &HostSource) -> Option<(usize, u128, u128)> {
    match (numeric(source.first), numeric(source.last)) {
        ((fa, lo), (fb, hi)) if fa == fb => Some((fa, lo, hi)),
        _ => None,
    }
}

fn from_numeric(family: usize, n: u128) -> IpAddr {
    if family == V4 {
        IpAddr::V4(Ipv4Addr::from(n as u32))
    } else {
        IpAddr::V6(Ipv6Addr::from(n))
    }
}

/// Keep host sources in input order but strip addresses an earlier source
/// already covers. A partially overlapping source is split into the
/// uncovered pieces, each keeping its label.
fn disjoint_sources(sources: Vec<HostSource>) -> Vec<HostSource> {
    let mut covered: [Vec<(u128, u128)>; 2] = [Vec::new(), Vec::new()];
    let mut out = Vec::with_capacity(sources.len());
    for source in sources {
        let Some((family, lo, hi)) = span(&source) else {
            continue;
        };
        let pieces = uncovered(&covered[family], lo, hi);
        cover(&mut covered[family], lo, hi);
        if pieces.is_empty() {
            debug!(entry = %source.label, "target already covered by an earlier entry, skipping");
        } else if pieces == [(lo, hi)] {
            out.push(source);
        } else {
            debug!(entry = %source.label, pieces = pieces.len(), "target overlaps an earlier entry");
            out.extend(pieces.into_iter().map(|(a, b)| HostSource {
                label: source.label.clone(),
                first: from_numeric(family, a),
                last: from_numeric(family, b),
            }));
        }
    }
    out
}

/// Parts of `lo..=hi` outside the sorted, merged `spans`.
fn uncovered(spans: &[(u128, u128)], lo: u128, hi: u128) -> Vec<(u128, u128)> {
    let mut pieces = Vec::new();
    let mut next = lo;
    for &(c_lo, c_hi) in spans {
        if c_hi < next {
            continue;
        }
        if c_lo > hi {
            break;
        }
        if c_lo > next {
            pieces.push((next, c_lo - 1));
        }
        if c_hi >= hi {
            return pieces;
        }
        next = c_hi + 1;
    }
    pieces.push((next, hi));
    pieces
}

/// Add `lo..=hi` to `spans`, keeping them sorted and merged.
fn cover(spans: &mut Vec<(u128, u128)>, lo: u128, hi: u128) {
    spans.push((lo, hi));
    spans.sort_unstable();
    let mut merged: Vec<(u128, u128)> = Vec::with_capacity(spans.len());
    for (a, b) in spans.drain(..) {
        match merged.last_mut() {
            Some(last) if a <= last.1.saturating_add(1) => last.1 = last.1.max(b),
            _ => merged.push((a, b)),
        }
    }
    *spans = merged;
}

/// One comma-separated entry of a host spec before DNS.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostEntry {
    Literal(HostSource),
    Name(String),
    Local,
}

/// Split and classify a host spec. Malformed CIDR blocks and address ranges
/// are errors; anything that is not an address literal is treated as a name.
pub fn parse_host_spec(spec: &str) -> Result<Vec<HostEntry>> {
    spec.split(',')
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(classify_entry)
        .collect()
}

fn classify_entry(token: &str) -> Result<HostEntry> {
    if token.eq_ignore_ascii_case("local") {
        return Ok(HostEntry::Local);
    }
    if token.contains('/') {
        let net: IpNet = token
            .parse()
            .map_err(|e| ScanError::target(token, format!("bad CIDR block: {e}")))?;
        return Ok(HostEntry::Literal(HostSource::from_net(token, net)));
    }
    if let Ok(ip) = token.parse::<IpAddr>() {
        return Ok(HostEntry::Literal(HostSource::single(token, ip)));
    }
    if let Some((a, b)) = token.split_once('-') {
        if let Ok(start) = a.trim().parse::<IpAddr>() {
            let end = b
                .trim()
                .parse::<IpAddr>()
                .map_err(|_| ScanError::target(token, "bad range end address"))?;
            return HostSource::range(token, start, end).map(HostEntry::Literal);
        }
    }
    Ok(HostEntry::Name(token.to_string()))
}

/// Resolve every entry of a host spec. Unresolvable names and undetectable
/// local networks are logged and skipped; an empty result is an error.
pub async fn resolve_hosts(host_spec: &str) -> Result<Vec<HostSource>> {
    let entries = parse_host_spec(host_spec)?;
    if entries.is_empty() {
        return Err(ScanError::target(host_spec, "no hosts given"));
    }

    let mut hosts = Vec::with_capacity(entries.len());
    for entry in entries {
        match entry {
            HostEntry::Literal(source) => hosts.push(source),
            HostEntry::Name(name) => match resolve_name(&name).await {
                Ok(ip) => {
                    info!(host = %name, %ip, "resolved");
                    hosts.push(HostSource::single(name, ip));
                }
                Err(e) => warn!(host = %name, error = %e, "cannot resolve host, skipping"),
            },
            HostEntry::Local => match local_networks() {
                Ok(nets) if !nets.is_empty() => {
                    for net in nets {
                        info!(network = %net, "using local network");
                        hosts.push(HostSource::from_net(net.to_string(), IpNet::V4(net)));
                    }
                }
                Ok(_) => warn!("no local IPv4 network found, skipping `local`"),
                Err(e) => warn!(error = %e, "failed to detect local networks, skipping `local`"),
            },
        }
    }

    if hosts.is_empty() {
        return Err(ScanError::Unresolvable(host_spec.to_string()));
    }
    Ok(hosts)
}

/// Resolve a hostname to one address, preferring IPv4.
pub async fn resolve_name(name: &str) -> io::Result<IpAddr> {
    let lookup = tokio::time::timeout(RESOLVE_TIMEOUT, lookup_host((name, 0)))
        .await
        .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "DNS lookup timed out"))??;
    let addrs: Vec<IpAddr> = lookup.map(|sa| sa.ip()).collect();
    debug!(host = %name, candidates = addrs.len(), "lookup finished");
    addrs
        .iter()
        .find(|ip| ip.is_ipv4())
        .or_else(|| addrs.first())
        .copied()
        .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "no addresses returned"))
}

/// Reverse DNS name of an address, or `None` when there is none or the
/// lookup exceeds [`RESOLVE_TIMEOUT`].
pub async fn reverse_name(ip: IpAddr) -> Option<String> {
    let lookup = tokio::task::spawn_blocking(move || dns_lookup::lookup_addr(&ip));
    match tokio::time::timeout(RESOLVE_TIMEOUT, lookup).await {
        Ok(Ok(Ok(name))) if name.parse::<IpAddr>().is_err() => Some(name),
        Ok(Ok(Ok(_))) => None,
        Ok(Ok(Err(e))) => {
            debug!(%ip, error = %e, "no reverse name");
            None
        }
        Ok(Err(e)) => {
            warn!(%ip, error = %e, "reverse lookup task failed");
            None
        }
        Err(_) => {
            debug!(%ip, "reverse lookup timed out");
            None
        }
    }
}

/// Build a scan plan from a host spec and an optional port spec.
/// A missing port spec selects the common-ports table.
pub async fn expand(host_spec: &str, port_spec: Option<&str>, protocol: Protocol) -> Result<ScanPlan> {
    let ports = match port_spec {
        Some(spec) => parse_port_spec(spec)?,
        None => default_ports(),
    };
    expand_with_ports(host_spec, ports, protocol).await
}

/// [`expand`] with an already parsed port list, e.g. from a ports file.
pub async fn expand_with_ports(host_spec: &str, ports: Vec<u16>, protocol: Protocol) -> Result<ScanPlan> {
    let hosts = resolve_hosts(host_spec).await?;
    Ok(ScanPlan::new(host_spec, hosts, ports, protocol))
}

/// Detect local non-loopback IPv4 interface networks. Duplicates are removed
/// and the result is sorted.
pub fn local_networks() -> Result<Vec<Ipv4Net>> {
    let mut set = BTreeSet::<Ipv4Net>::new();
    for iface in get_if_addrs()? {
        if let IfAddr::V4(v4) = iface.addr {
            if v4.ip.is_loopback() {
                continue;
            }
            set.insert(interface_network(v4.ip, v4.netmask));
        }
    }
    Ok(set.into_iter().collect())
}

/// The network an interface address sits in. Missing or very broad masks
/// fall back to the /24 around the address.
pub fn interface_network(ip: Ipv4Addr, netmask: Ipv4Addr) -> Ipv4Net {
    match Ipv4Net::with_netmask(ip, netmask) {
        Ok(net) if net.prefix_len() >= MIN_LOCAL_PREFIX => net.trunc(),
        _ => Ipv4Net::new(ip, 24).expect("/24 is always valid").trunc(),
    }
}

/// Read a targets file into a host spec: one entry per line, `#` comments and
/// blank lines ignored.
pub fn load_targets_from_path(path: impl AsRef<Path>) -> Result<String> {
    let path = path.as_ref();
    let content = fs::read_to_string(path)?;
    let entries: Vec<&str> = content
        .lines()
        .filter_map(|line| line.split('#').next())
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .collect();
    if entries.is_empty() {
        return Err(ScanError::target(
            &path.display().to_string(),
            "targets file lists no hosts",
        ));
    }
    Ok(entries.join(","))
}
