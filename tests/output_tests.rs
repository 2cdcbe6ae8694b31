use portprobe_rs::output::{parse_json, render_console, render_csv, render_json, Format, OutputWriter};
use portprobe_rs::{HostInfo, PortState, ProbeResult, ScanError, ScanReport, ScanUnit, StateCounts};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::time::Duration;
use time::OffsetDateTime;

fn report() -> ScanReport {
    let v4 = IpAddr::V4(Ipv4Addr::new(192, 168, 1, 10));
    let v6 = IpAddr::V6(Ipv6Addr::LOCALHOST);
    let results = vec![
        ProbeResult::new(ScanUnit::tcp(v4, 22), PortState::Open, Duration::from_millis(3))
            .with_banner(Some("SSH-2.0-OpenSSH_9.6".into())),
        ProbeResult::new(ScanUnit::tcp(v4, 80), PortState::Open, Duration::from_millis(4))
            .with_banner(Some("HTTP/1.0 200 OK\r\nServer: a, b \"c\"".into())),
        ProbeResult::new(ScanUnit::tcp(v4, 443), PortState::Closed, Duration::from_millis(1)),
        ProbeResult::new(ScanUnit::tcp(v4, 3306), PortState::Filtered, Duration::from_millis(1000)),
        ProbeResult::new(ScanUnit::udp(v6, 53), PortState::OpenFiltered, Duration::from_millis(500)),
    ];
    let started_at = OffsetDateTime::now_utc();
    ScanReport {
        target: "192.168.1.10,::1".into(),
        started_at,
        finished_at: started_at + Duration::from_millis(1200),
        interrupted: false,
        planned: 5,
        hosts: vec![
            HostInfo {
                address: v4,
                label: "192.168.1.10".into(),
                ptr: Some("nas.lan".into()),
            },
            HostInfo {
                address: v6,
                label: "::1".into(),
                ptr: None,
            },
        ],
        counts: StateCounts::from_results(&results),
        results,
    }
}

fn triples(report: &ScanReport) -> Vec<(String, u16, String)> {
    report
        .results
        .iter()
        .map(|r| (r.unit.host.to_string(), r.unit.port, r.state.to_string()))
        .collect()
}

#[test]
fn json_reads_back_the_same_results() {
    let original = report();
    let parsed = parse_json(&render_json(&original).unwrap()).unwrap();
    assert_eq!(triples(&parsed), triples(&original));
    assert_eq!(parsed.counts, original.counts);
    assert_eq!(parsed.target, original.target);
    assert_eq!(parsed.results[1].banner, original.results[1].banner);
    assert_eq!(parsed.results[0].service_guess.as_deref(), Some("SSH"));
}

#[test]
fn json_keeps_host_section() {
    let original = report();
    let json = render_json(&original).unwrap();
    let v: serde_json::Value = serde_json::from_str(&json).unwrap();
    assert_eq!(v["hosts"][0]["address"], "192.168.1.10");
    assert_eq!(v["hosts"][0]["ptr"], "nas.lan");
    assert!(v["hosts"][1]["ptr"].is_null());

    let parsed = parse_json(&json).unwrap();
    assert_eq!(parsed.hosts, original.hosts);
    assert!(render_console(&original, false).contains("  192.168.1.10  192.168.1.10  ptr=nas.lan\n"));
}

#[test]
fn json_without_host_section_still_parses() {
    let mut v: serde_json::Value = serde_json::from_str(&render_json(&report()).unwrap()).unwrap();
    v.as_object_mut().unwrap().remove("hosts");
    let parsed = parse_json(&v.to_string()).unwrap();
    assert!(parsed.hosts.is_empty());
    assert_eq!(parsed.results.len(), 5);
}

#[test]
fn json_state_names_are_lowercase() {
    let json = render_json(&report()).unwrap();
    let v: serde_json::Value = serde_json::from_str(&json).unwrap();
    let states: Vec<&str> = v["results"]
        .as_array()
        .unwrap()
        .iter()
        .map(|r| r["state"].as_str().unwrap())
        .collect();
    assert_eq!(states, ["open", "open", "closed", "filtered", "open|filtered"]);
    assert_eq!(v["counts"]["open|filtered"], 1);
    assert!(v["results"][2]["banner"].is_null());
}

#[test]
fn csv_quotes_awkward_banners() {
    let original = report();
    let text = render_csv(&original).unwrap();

    let mut rdr = csv::Reader::from_reader(text.as_bytes());
    let header: Vec<String> = rdr.headers().unwrap().iter().map(String::from).collect();
    assert_eq!(header, ["host", "port", "state", "service", "banner", "elapsed_ms"]);

    let rows: Vec<csv::StringRecord> = rdr.records().collect::<Result<_, _>>().unwrap();
    assert_eq!(rows.len(), original.results.len());
    assert_eq!(&rows[1][4], "HTTP/1.0 200 OK\r\nServer: a, b \"c\"");
    assert_eq!(&rows[1][3], "HTTP");
    assert_eq!(&rows[2][4], "");
    assert_eq!(&rows[4][0], "::1");
    assert_eq!(&rows[4][2], "open|filtered");
}

#[test]
fn every_format_agrees_on_open_ports() {
    let original = report();

    let json = parse_json(&render_json(&original).unwrap()).unwrap();
    let from_json: Vec<u16> = json.open_ports().map(|r| r.unit.port).collect();

    let csv_text = render_csv(&original).unwrap();
    let mut rdr = csv::Reader::from_reader(csv_text.as_bytes());
    let from_csv: Vec<u16> = rdr
        .records()
        .map(|r| r.unwrap())
        .filter(|r| &r[2] == "open")
        .map(|r| r[1].parse().unwrap())
        .collect();

    let console = render_console(&original, true);
    assert_eq!(from_json, vec![22, 80]);
    assert_eq!(from_csv, from_json);
    assert!(console.contains("open: 2  closed: 1  filtered: 1  open|filtered: 1  error: 0  (total 5)"));
    assert!(!console.contains("3306"));
}

#[test]
fn interrupted_report_is_flagged_in_console() {
    let mut partial = report();
    partial.interrupted = true;
    partial.planned = 40;
    let text = render_console(&partial, false);
    assert!(text.contains("scan interrupted: 5 of 40 planned units probed"));
}

#[test]
fn empty_report_renders_in_every_format() {
    let now = OffsetDateTime::now_utc();
    let empty = ScanReport {
        target: "10.0.0.1".into(),
        started_at: now,
        finished_at: now,
        interrupted: true,
        planned: 0,
        hosts: Vec::new(),
        counts: StateCounts::default(),
        results: Vec::new(),
    };
    assert!(render_console(&empty, false).contains("No results."));
    assert_eq!(render_csv(&empty).unwrap().lines().count(), 1);
    assert!(parse_json(&render_json(&empty).unwrap()).unwrap().results.is_empty());
}

#[test]
fn writer_creates_the_report_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("scan.csv");
    OutputWriter::to_path(Format::Csv, &path)
        .unwrap()
        .write(&report())
        .unwrap();
    let written = std::fs::read_to_string(&path).unwrap();
    assert!(written.starts_with("host,port,state,service,banner,elapsed_ms"));
}

#[test]
fn unwritable_path_fails_before_scanning() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("missing").join("scan.json");
    let err = OutputWriter::to_path(Format::Json, &path).err().unwrap();
    assert!(matches!(err, ScanError::Output { .. }));
}
