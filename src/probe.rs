//! Single-unit probes: bounded TCP connects with optional banner grabbing,
//! and UDP send/receive probes.

use async_trait::async_trait;
use std::future::Future;
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tokio::time::{self, Instant};
use tracing::debug;

use crate::config::ScanConfig;
use crate::types::{PortState, ProbeResult, Protocol, ScanUnit};

const READ_BUF: usize = 1024;

const HTTP_PROBE: &[u8] = b"HEAD / HTTP/1.0\r\n\r\n";
const SMTP_PROBE: &[u8] = b"EHLO portprobe\r\n";

// Standard query for the root NS records.
const DNS_PROBE: &[u8] = &[
    0x12, 0x34, 0x01, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x02,
    0x00, 0x01,
];

// SNMPv1 GetRequest for sysDescr.0, community "public".
const SNMP_PROBE: &[u8] = &[
    0x30, 0x26, 0x02, 0x01, 0x00, 0x04, 0x06, b'p', b'u', b'b', b'l', b'i', b'c', 0xa0, 0x19,
    0x02, 0x01, 0x01, 0x02, 0x01, 0x00, 0x02, 0x01, 0x00, 0x30, 0x0e, 0x30, 0x0c, 0x06, 0x08,
    0x2b, 0x06, 0x01, 0x02, 0x01, 0x01, 0x01, 0x00, 0x05, 0x00,
];

// NTPv3 client request: LI=0, VN=3, Mode=3, rest zero.
const NTP_PACKET: [u8; 48] = {
    let mut packet = [0u8; 48];
    packet[0] = 0x1b;
    packet
};
const NTP_PROBE: &[u8] = &NTP_PACKET;

/// Something that can probe one scan unit.
///
/// Implementations must always return a result: every failure is expressed
/// through [`PortState`] rather than an error.
#[async_trait]
pub trait Prober: Send + Sync {
    async fn probe(&self, unit: ScanUnit) -> ProbeResult;
}

/// The real network prober.
#[derive(Debug, Clone)]
pub struct NetProber {
    connect_timeout: Duration,
    banner_timeout: Option<Duration>,
}

impl NetProber {
    pub fn new(config: &ScanConfig) -> Self {
        Self {
            connect_timeout: config.connect_timeout,
            banner_timeout: config.banner.then_some(config.banner_timeout),
        }
    }
}

#[async_trait]
impl Prober for NetProber {
    async fn probe(&self, unit: ScanUnit) -> ProbeResult {
        let result = match unit.protocol {
            Protocol::Tcp => probe_tcp(unit, self.connect_timeout, self.banner_timeout).await,
            Protocol::Udp => probe_udp(unit, self.connect_timeout, self.banner_timeout.is_some()).await,
        };
        debug!(unit = %unit, state = %result.state, elapsed_ms = result.elapsed_ms, "probe done");
        result
    }
}

/// Connect to `unit` within `connect_timeout`. When `banner_timeout` is set
/// and the port is open, prime well-known services and read one banner.
///
/// - Uses `tokio::time::timeout` to bound connect time per socket.
/// - The stream is dropped, and the socket closed, on every path.
pub async fn probe_tcp(
    unit: ScanUnit,
    connect_timeout: Duration,
    banner_timeout: Option<Duration>,
) -> ProbeResult {
    let addr = SocketAddr::new(unit.host, unit.port);
    probe_tcp_via(unit, connect_timeout, banner_timeout, TcpStream::connect(addr)).await
}

/// [`probe_tcp`] over any connect future; the future is abandoned once
/// `connect_timeout` elapses.
async fn probe_tcp_via<F>(
    unit: ScanUnit,
    connect_timeout: Duration,
    banner_timeout: Option<Duration>,
    connect: F,
) -> ProbeResult
where
    F: Future<Output = io::Result<TcpStream>>,
{
    let start = Instant::now();
    match time::timeout(connect_timeout, connect).await {
        Ok(Ok(mut stream)) => {
            let banner = match banner_timeout {
                Some(wait) => grab_banner(&mut stream, unit.port, wait).await,
                None => None,
            };
            ProbeResult::new(unit, PortState::Open, start.elapsed()).with_banner(banner)
        }
        Ok(Err(e)) => {
            let (state, detail) = classify_connect_error(&e);
            let result = ProbeResult::new(unit, state, start.elapsed());
            match detail {
                Some(d) => result.with_error(d),
                None => result,
            }
        }
        Err(_) => ProbeResult::new(unit, PortState::Filtered, start.elapsed()),
    }
}

/// Map a failed connect to a port state. Only `Error` carries a detail.
pub fn classify_connect_error(e: &io::Error) -> (PortState, Option<String>) {
    match e.kind() {
        io::ErrorKind::ConnectionRefused | io::ErrorKind::ConnectionReset => {
            (PortState::Closed, None)
        }
        io::ErrorKind::TimedOut => (PortState::Filtered, None),
        _ => (PortState::Error, Some(e.to_string())),
    }
}

/// Payload sent right after connecting to coax a banner out of services
/// that wait for the client to speak first.
pub fn priming_payload(port: u16) -> Option<&'static [u8]> {
    match port {
        80 | 8000 | 8008 | 8080 | 8443 | 8888 => Some(HTTP_PROBE),
        25 | 587 => Some(SMTP_PROBE),
        _ => None,
    }
}

/// Datagram sent to a UDP port. Most services ignore an empty datagram, so a
/// few well-known ones get a request they will answer.
pub fn udp_payload(port: u16) -> &'static [u8] {
    match port {
        53 => DNS_PROBE,
        123 => NTP_PROBE,
        161 => SNMP_PROBE,
        _ => &[],
    }
}

/// Write the priming payload, if any, then perform one bounded read.
/// Any failure just yields no banner.
async fn grab_banner(stream: &mut TcpStream, port: u16, wait: Duration) -> Option<String> {
    if let Some(payload) = priming_payload(port) {
        match time::timeout(wait, stream.write_all(payload)).await {
            Ok(Ok(())) => {}
            _ => return None,
        }
    }
    let mut buf = [0u8; READ_BUF];
    match time::timeout(wait, stream.read(&mut buf)).await {
        Ok(Ok(n)) if n > 0 => clean_banner(&buf[..n]),
        _ => None,
    }
}

/// Decode lossily and trim; blank banners become `None`.
pub fn clean_banner(raw: &[u8]) -> Option<String> {
    let text = String::from_utf8_lossy(raw);
    let text = text.trim();
    (!text.is_empty()).then(|| text.to_string())
}

/// Send one datagram and wait for one reply within `wait`.
///
/// A reply means open. An ICMP port-unreachable surfaces as a refused
/// receive and means closed. Silence is ambiguous and reported as
/// `OpenFiltered`.
pub async fn probe_udp(unit: ScanUnit, wait: Duration, keep_reply: bool) -> ProbeResult {
    let start = Instant::now();
    match exchange_datagram(unit, wait).await {
        Ok(Some(reply)) => {
            let banner = if keep_reply { clean_banner(&reply) } else { None };
            ProbeResult::new(unit, PortState::Open, start.elapsed()).with_banner(banner)
        }
        Ok(None) => ProbeResult::new(unit, PortState::OpenFiltered, start.elapsed()),
        Err(e) if e.kind() == io::ErrorKind::ConnectionRefused => {
            ProbeResult::new(unit, PortState::Closed, start.elapsed())
        }
        Err(e) => ProbeResult::new(unit, PortState::Error, start.elapsed()).with_error(e.to_string()),
    }
}

async fn exchange_datagram(unit: ScanUnit, wait: Duration) -> io::Result<Option<Vec<u8>>> {
    let local = match unit.host {
        IpAddr::V4(_) => SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0),
        IpAddr::V6(_) => SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), 0),
    };
    let socket = UdpSocket::bind(local).await?;
    socket.connect(SocketAddr::new(unit.host, unit.port)).await?;
    socket.send(udp_payload(unit.port)).await?;

    let mut buf = vec![0u8; READ_BUF];
    match time::timeout(wait, socket.recv(&mut buf)).await {
        Ok(Ok(n)) => {
            buf.truncate(n);
            Ok(Some(buf))
        }
        Ok(Err(e)) => Err(e),
        Err(_) => Ok(None),
    }
}
