use futures::stream::{self, StreamExt};
use futures::FutureExt;
use std::collections::HashSet;
use std::net::IpAddr;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::{JoinError, JoinSet};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::aggregate::Aggregator;
use crate::config::{ScanConfig, MAX_WORKERS};
use crate::probe::{NetProber, Prober};
use crate::targets::{self, HostSource, ScanPlan};
use crate::types::{HostInfo, PortState, ProbeResult, ScanReport, ScanUnit};

/// Concurrent reverse lookups while naming report hosts.
const RDNS_CONCURRENCY: usize = 16;

/// What happened while dispatching units.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchOutcome {
    pub dispatched: u64,
    /// Cancellation stopped dispatch while units were still pending.
    pub interrupted: bool,
}

/// Runs probes on a bounded pool.
///
/// - Limits concurrent probes using a `Semaphore`; a permit is taken before
///   the next unit is pulled, so the unit source is consumed lazily.
/// - Streams each result into `sink` in completion order.
/// - On cancellation stops dispatching, lets in-flight probes finish, and drains.
pub struct Scheduler<P: ?Sized> {
    prober: Arc<P>,
    workers: usize,
    cancel: CancellationToken,
}

impl<P> Scheduler<P>
where
    P: Prober + ?Sized + 'static,
{
    pub fn new(prober: Arc<P>, workers: usize, cancel: CancellationToken) -> Self {
        Self {
            prober,
            workers: workers.clamp(1, MAX_WORKERS),
            cancel,
        }
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    pub async fn run<I>(&self, units: I, sink: mpsc::Sender<ProbeResult>) -> DispatchOutcome
    where
        I: IntoIterator<Item = ScanUnit>,
    {
        let sem = Arc::new(Semaphore::new(self.workers));
        let mut set = JoinSet::new();
        let mut outcome = DispatchOutcome::default();
        let mut units = units.into_iter();

        loop {
            let permit = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    outcome.interrupted = units.next().is_some();
                    break;
                }
                permit = sem.clone().acquire_owned() => match permit {
                    Ok(p) => p,
                    Err(_) => break,
                },
            };
            let Some(unit) = units.next() else {
                break;
            };

            // Reap finished tasks so the set stays at most `workers` large.
            while let Some(res) = set.try_join_next() {
                log_join(res);
            }

            let prober = Arc::clone(&self.prober);
            let sink = sink.clone();
            set.spawn(async move {
                let _permit = permit; // keep permit until task completes
                let result = probe_contained(prober.as_ref(), unit).await;
                if sink.send(result).await.is_err() {
                    debug!(unit = %unit, "result receiver gone, dropping result");
                }
            });
            outcome.dispatched += 1;
        }

        if outcome.interrupted {
            info!(
                dispatched = outcome.dispatched,
                in_flight = set.len(),
                "scan cancelled, draining in-flight probes"
            );
        }
        while let Some(res) = set.join_next().await {
            log_join(res);
        }
        outcome
    }
}

/// Run one probe, turning a panic into an `Error` result for its unit.
async fn probe_contained<P: Prober + ?Sized>(prober: &P, unit: ScanUnit) -> ProbeResult {
    let start = Instant::now();
    match AssertUnwindSafe(prober.probe(unit)).catch_unwind().await {
        Ok(result) => result,
        Err(_) => {
            warn!(unit = %unit, "probe panicked");
            ProbeResult::new(unit, PortState::Error, start.elapsed()).with_error("probe panicked")
        }
    }
}

fn log_join(res: Result<(), JoinError>) {
    if let Err(e) = res {
        warn!(error = %e, "probe task failed");
    }
}

/// Run a whole scan: dispatch every unit of `plan` through `prober` with at
/// most `workers` probes in flight, aggregate, and return the frozen report.
///
/// Always yields a report; a cancelled scan is marked `interrupted` and holds
/// exactly the units that were dispatched.
pub async fn scan<P>(
    plan: &ScanPlan,
    prober: Arc<P>,
    workers: usize,
    cancel: CancellationToken,
) -> ScanReport
where
    P: Prober + ?Sized + 'static,
{
    let planned = plan.total_units();
    let scheduler = Scheduler::new(prober, workers, cancel);
    info!(
        spec = plan.target(),
        units = planned,
        hosts = plan.hosts().len(),
        ports = plan.ports().len(),
        protocol = %plan.protocol(),
        workers = scheduler.workers(),
        "starting scan"
    );

    let mut aggregator = Aggregator::new(plan.target(), planned);
    let (tx, mut rx) = mpsc::channel(scheduler.workers());
    let collect = async {
        while let Some(result) = rx.recv().await {
            aggregator.ingest(result);
        }
    };
    let (outcome, ()) = tokio::join!(scheduler.run(plan.units(), tx), collect);

    if outcome.interrupted {
        aggregator.mark_interrupted();
    }
    let mut report = aggregator.finalize();
    report.hosts = host_table(plan, &report.results);
    report
}

/// Hosts worth naming in a report: every single-address entry that was
/// probed and every address with an open port. `results` must be sorted.
fn host_table(plan: &ScanPlan, results: &[ProbeResult]) -> Vec<HostInfo> {
    let singles: HashSet<IpAddr> = plan
        .hosts()
        .iter()
        .filter(|h| h.len() == 1)
        .map(HostSource::first)
        .collect();

    let mut hosts: Vec<HostInfo> = Vec::new();
    for r in results {
        let ip = r.unit.host;
        if hosts.last().is_some_and(|h| h.address == ip) {
            continue;
        }
        if r.state != PortState::Open && !singles.contains(&ip) {
            continue;
        }
        hosts.push(HostInfo {
            address: ip,
            label: plan.label_for(ip).map_or_else(|| ip.to_string(), str::to_string),
            ptr: None,
        });
    }
    hosts
}

/// Fill in PTR names, a bounded number of lookups at a time.
pub async fn name_hosts(hosts: &mut [HostInfo]) {
    let names: Vec<Option<String>> = stream::iter(hosts.iter().map(|h| h.address))
        .map(targets::reverse_name)
        .buffered(RDNS_CONCURRENCY)
        .collect()
        .await;
    for (host, ptr) in hosts.iter_mut().zip(names) {
        host.ptr = ptr;
    }
}

/// [`scan`] with the network prober built from `config`. Report hosts get
/// PTR names unless reverse DNS is off or the scan was cancelled.
pub async fn scan_with_config(
    plan: &ScanPlan,
    config: &ScanConfig,
    cancel: CancellationToken,
) -> ScanReport {
    let prober = Arc::new(NetProber::new(config));
    let mut report = scan(plan, prober, config.workers, cancel.clone()).await;
    if config.reverse_dns && !cancel.is_cancelled() {
        name_hosts(&mut report.hosts).await;
    }
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::net::{IpAddr, Ipv4Addr};
    use std::time::Duration;

    struct FixedProber;

    #[async_trait]
    impl Prober for FixedProber {
        async fn probe(&self, unit: ScanUnit) -> ProbeResult {
            let state = if unit.port % 10 == 0 {
                PortState::Open
            } else {
                PortState::Closed
            };
            ProbeResult::new(unit, state, Duration::ZERO)
        }
    }

    struct PanickyProber;

    #[async_trait]
    impl Prober for PanickyProber {
        async fn probe(&self, unit: ScanUnit) -> ProbeResult {
            if unit.port == 13 {
                panic!("boom");
            }
            ProbeResult::new(unit, PortState::Closed, Duration::ZERO)
        }
    }

    fn units(n: u16) -> Vec<ScanUnit> {
        (1..=n)
            .map(|p| ScanUnit::tcp(IpAddr::V4(Ipv4Addr::LOCALHOST), p))
            .collect()
    }

    #[tokio::test]
    async fn streams_every_unit_once() {
        let scheduler = Scheduler::new(Arc::new(FixedProber), 8, CancellationToken::new());
        let (tx, mut rx) = mpsc::channel(8);
        let run = scheduler.run(units(50), tx);
        let collect = async {
            let mut got = Vec::new();
            while let Some(r) = rx.recv().await {
                got.push(r.unit.port);
            }
            got
        };
        let (outcome, mut got) = tokio::join!(run, collect);
        got.sort_unstable();
        assert_eq!(got, (1..=50).collect::<Vec<u16>>());
        assert_eq!(outcome.dispatched, 50);
        assert!(!outcome.interrupted);
    }

    #[tokio::test]
    async fn panicking_probe_becomes_error_result() {
        let scheduler = Scheduler::new(Arc::new(PanickyProber), 4, CancellationToken::new());
        let (tx, mut rx) = mpsc::channel(4);
        let collect = async {
            let mut got = Vec::new();
            while let Some(r) = rx.recv().await {
                got.push(r);
            }
            got
        };
        let (_, got) = tokio::join!(scheduler.run(units(20), tx), collect);
        assert_eq!(got.len(), 20);
        let bad = got.iter().find(|r| r.unit.port == 13).unwrap();
        assert_eq!(bad.state, PortState::Error);
        assert_eq!(bad.error_detail.as_deref(), Some("probe panicked"));
    }

    #[tokio::test]
    async fn cancelled_before_start_dispatches_nothing() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let scheduler = Scheduler::new(Arc::new(FixedProber), 4, cancel);
        let (tx, mut rx) = mpsc::channel(4);
        let outcome = scheduler.run(units(10), tx).await;
        assert_eq!(outcome.dispatched, 0);
        assert!(outcome.interrupted);
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn report_names_single_entries_and_open_hosts() {
        let v4 = |d| IpAddr::V4(Ipv4Addr::new(10, 0, 0, d));
        let plan = ScanPlan::new(
            "db.internal,10.0.0.8/30",
            vec![
                HostSource::single("db.internal", v4(50)),
                HostSource::from_net("10.0.0.8/30", "10.0.0.8/30".parse().unwrap()),
            ],
            vec![10, 11],
            crate::types::Protocol::Tcp,
        );
        // Port 10 is open everywhere under FixedProber, so report only 10.0.0.9
        // and 10.0.0.10 once each, plus the named single entry.
        let report = scan(&plan, Arc::new(FixedProber), 4, CancellationToken::new()).await;

        let hosts: Vec<(IpAddr, &str)> = report
            .hosts
            .iter()
            .map(|h| (h.address, h.label.as_str()))
            .collect();
        assert_eq!(
            hosts,
            vec![
                (v4(9), "10.0.0.8/30"),
                (v4(10), "10.0.0.8/30"),
                (v4(50), "db.internal"),
            ]
        );
        assert!(report.hosts.iter().all(|h| h.ptr.is_none()));
    }

    #[test]
    fn worker_count_is_clamped() {
        let s = Scheduler::new(Arc::new(FixedProber), 0, CancellationToken::new());
        assert_eq!(s.workers(), 1);
        let s = Scheduler::new(Arc::new(FixedProber), usize::MAX, CancellationToken::new());
        assert_eq!(s.workers(), MAX_WORKERS);
    }
}
