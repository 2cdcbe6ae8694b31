use std::collections::HashSet;
use time::OffsetDateTime;
use tracing::{info, warn};

use crate::types::{PortState, ProbeResult, ScanReport, ScanUnit, StateCounts};

/// Log a progress line every this many results.
const PROGRESS_EVERY: u64 = 100;

/// Collects probe results as they complete and freezes them into a report.
#[derive(Debug)]
pub struct Aggregator {
    target: String,
    planned: u64,
    started_at: OffsetDateTime,
    seen: HashSet<ScanUnit>,
    results: Vec<ProbeResult>,
    running: StateCounts,
    interrupted: bool,
    frozen: Option<ScanReport>,
}

impl Aggregator {
    pub fn new(target: impl Into<String>, planned: u64) -> Self {
        Self {
            target: target.into(),
            planned,
            started_at: OffsetDateTime::now_utc(),
            seen: HashSet::new(),
            results: Vec::new(),
            running: StateCounts::default(),
            interrupted: false,
            frozen: None,
        }
    }

    /// Record one completed probe. A second result for the same unit is dropped.
    pub fn ingest(&mut self, result: ProbeResult) {
        if self.frozen.is_some() {
            warn!(unit = %result.unit, "result arrived after the report was finalized, ignoring");
            return;
        }
        if !self.seen.insert(result.unit) {
            warn!(unit = %result.unit, "duplicate result, ignoring");
            return;
        }

        if result.state == PortState::Open {
            info!(
                host = %result.unit.host,
                port = result.unit.port,
                service = result.service_guess.as_deref().unwrap_or("-"),
                "open port"
            );
        }
        self.running.record(result.state);
        self.results.push(result);

        let done = self.results.len() as u64;
        if done % PROGRESS_EVERY == 0 {
            info!(done, planned = self.planned, open = self.running.open, "progress");
        }
    }

    pub fn mark_interrupted(&mut self) {
        if self.frozen.is_none() {
            self.interrupted = true;
        }
    }

    /// Sort, count and freeze. Later calls return the same report.
    pub fn finalize(&mut self) -> ScanReport {
        if let Some(report) = &self.frozen {
            return report.clone();
        }

        let mut results = std::mem::take(&mut self.results);
        results.sort_by(|a, b| a.unit.cmp(&b.unit));
        let counts = StateCounts::from_results(&results);

        if !self.interrupted && results.len() as u64 != self.planned {
            warn!(
                planned = self.planned,
                got = results.len(),
                "result count differs from planned unit count"
            );
        }

        let report = ScanReport {
            target: self.target.clone(),
            started_at: self.started_at,
            finished_at: OffsetDateTime::now_utc(),
            interrupted: self.interrupted,
            planned: self.planned,
            hosts: Vec::new(),
            counts,
            results,
        };
        info!(
            total = counts.total(),
            open = counts.open,
            closed = counts.closed,
            filtered = counts.filtered,
            open_filtered = counts.open_filtered,
            error = counts.error,
            interrupted = report.interrupted,
            "scan finished"
        );
        self.frozen = Some(report.clone());
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};
    use std::time::Duration;

    fn result(last_octet: u8, port: u16, state: PortState) -> ProbeResult {
        let unit = ScanUnit::tcp(IpAddr::V4(Ipv4Addr::new(10, 0, 0, last_octet)), port);
        ProbeResult::new(unit, state, Duration::from_millis(1))
    }

    #[test]
    fn finalize_sorts_by_host_then_port() {
        let mut agg = Aggregator::new("10.0.0.1-10.0.0.2", 4);
        agg.ingest(result(2, 22, PortState::Closed));
        agg.ingest(result(1, 443, PortState::Open));
        agg.ingest(result(2, 21, PortState::Filtered));
        agg.ingest(result(1, 80, PortState::Closed));

        let report = agg.finalize();
        let order: Vec<(IpAddr, u16)> = report
            .results
            .iter()
            .map(|r| (r.unit.host, r.unit.port))
            .collect();
        assert_eq!(
            order,
            vec![
                (IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)), 80),
                (IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)), 443),
                (IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2)), 21),
                (IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2)), 22),
            ]
        );
        assert_eq!(report.counts.total(), report.results.len() as u64);
        assert_eq!(report.counts.open, 1);
        assert_eq!(report.counts.closed, 2);
        assert_eq!(report.counts.filtered, 1);
    }

    #[test]
    fn duplicates_are_dropped() {
        let mut agg = Aggregator::new("t", 1);
        agg.ingest(result(1, 22, PortState::Open));
        agg.ingest(result(1, 22, PortState::Closed));
        let report = agg.finalize();
        assert_eq!(report.results.len(), 1);
        assert_eq!(report.results[0].state, PortState::Open);
    }

    #[test]
    fn finalize_is_idempotent() {
        let mut agg = Aggregator::new("t", 2);
        agg.ingest(result(1, 2, PortState::Closed));
        agg.ingest(result(1, 1, PortState::Open));
        let first = agg.finalize();
        agg.ingest(result(1, 3, PortState::Open));
        agg.mark_interrupted();
        let second = agg.finalize();
        assert_eq!(first, second);
        assert!(!second.interrupted);
    }

    #[test]
    fn empty_interrupted_report_is_valid() {
        let mut agg = Aggregator::new("t", 10);
        agg.mark_interrupted();
        let report = agg.finalize();
        assert!(report.interrupted);
        assert!(report.results.is_empty());
        assert_eq!(report.counts.total(), 0);
        assert!(report.finished_at >= report.started_at);
    }
}
