use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use portprobe_rs::config::{self, ScanConfig, SpeedProfile, DEFAULT_WORKERS};
use portprobe_rs::output::{Format, OutputWriter};
use portprobe_rs::targets::{self, ScanPlan};
use portprobe_rs::{ports, scanner, Protocol};

const EXIT_FATAL: u8 = 1;
const EXIT_INTERRUPTED: u8 = 130;

/// How a scan that produced a report ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Completed,
    Interrupted,
}

impl Outcome {
    fn code(self) -> u8 {
        match self {
            Outcome::Completed => 0,
            Outcome::Interrupted => EXIT_INTERRUPTED,
        }
    }
}

/// portprobe-rs: bounded-concurrency async TCP/UDP port scanner.
#[derive(Debug, Clone, Parser)]
#[command(
    name = "portprobe-rs",
    version,
    about = "Bounded-concurrency async TCP/UDP port scanner with banner grabbing.",
    long_about = None
)]
struct Cli {
    /// Hosts: IP, hostname, CIDR (10.0.0.0/24), range (10.0.0.1-10.0.0.9), `local`, or a comma list.
    #[arg(short, long, required_unless_present = "target_file")]
    target: Option<String>,

    /// File with one target entry per line (`#` comments allowed).
    #[arg(long, conflicts_with = "target")]
    target_file: Option<PathBuf>,

    /// Ports: 80, 1-1024, 80,443,8080, `common` or `all`. Defaults to the common-ports table.
    #[arg(short, long)]
    ports: Option<String>,

    /// File with one port or range per line.
    #[arg(long, conflicts_with = "ports")]
    ports_file: Option<PathBuf>,

    /// Connect timeout in seconds [default: 1.0, or the --speed profile].
    #[arg(long)]
    timeout: Option<f64>,

    /// Timing profile, T1 (slowest) to T5 (fastest). Ignored when --timeout is set.
    #[arg(long, value_enum)]
    speed: Option<SpeedProfile>,

    /// Max concurrent probes.
    #[arg(long, default_value_t = DEFAULT_WORKERS)]
    workers: usize,

    /// Grab a banner from open ports.
    #[arg(long)]
    banner: bool,

    /// Banner read timeout in seconds.
    #[arg(long, default_value_t = 0.5)]
    banner_timeout: f64,

    /// Probe UDP instead of TCP.
    #[arg(long)]
    udp: bool,

    /// Write the report to this path instead of stdout.
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Report format.
    #[arg(long, value_enum, default_value_t = Format::Console)]
    format: Format,

    /// Only list open ports in the console table.
    #[arg(long)]
    open_only: bool,

    /// Skip reverse DNS for the hosts listed in the report.
    #[arg(long)]
    no_rdns: bool,

    /// Debug logging (RUST_LOG takes precedence).
    #[arg(short, long)]
    verbose: bool,
}

impl Cli {
    fn scan_config(&self) -> portprobe_rs::Result<ScanConfig> {
        let connect_timeout = match (self.timeout, self.speed) {
            (Some(secs), _) => config::seconds(secs)?,
            (None, Some(profile)) => profile.connect_timeout(),
            (None, None) => config::DEFAULT_CONNECT_TIMEOUT,
        };
        let config = ScanConfig {
            workers: self.workers,
            connect_timeout,
            banner: self.banner,
            banner_timeout: config::seconds(self.banner_timeout)?,
            protocol: if self.udp { Protocol::Udp } else { Protocol::Tcp },
            reverse_dns: !self.no_rdns,
        };
        config.validate()?;
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            let _ = e.print();
            // --help and --version land here too and are not failures.
            return if e.use_stderr() {
                ExitCode::from(EXIT_FATAL)
            } else {
                ExitCode::SUCCESS
            };
        }
    };
    init_tracing(cli.verbose);

    let cancel = CancellationToken::new();
    let cancel_ctrlc = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, finishing in-flight probes");
            cancel_ctrlc.cancel();
        }
    });

    match run(cli, cancel).await {
        Ok(outcome) => ExitCode::from(outcome.code()),
        Err(e) => {
            eprintln!("error: {e:#}");
            ExitCode::from(EXIT_FATAL)
        }
    }
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

async fn run(cli: Cli, cancel: CancellationToken) -> Result<Outcome> {
    let config = cli.scan_config().context("bad scan settings")?;

    // Open the destination before anything touches the network so a bad path fails fast.
    let writer = match cli.output.as_deref() {
        Some(path) => OutputWriter::to_path(cli.format, path)?,
        None => OutputWriter::stdout(cli.format),
    }
    .open_only(cli.open_only);

    let plan = build_plan(&cli, &config).await?;
    let report = scanner::scan_with_config(&plan, &config, cancel.clone()).await;

    writer.write(&report).context("failed to write report")?;
    if let Some(path) = cli.output.as_deref() {
        info!(path = %path.display(), "report written");
    }

    if cancel.is_cancelled() {
        Ok(Outcome::Interrupted)
    } else {
        Ok(Outcome::Completed)
    }
}

async fn build_plan(cli: &Cli, config: &ScanConfig) -> Result<ScanPlan> {
    let host_spec = match (&cli.target, &cli.target_file) {
        (Some(spec), _) => spec.clone(),
        (None, Some(path)) => targets::load_targets_from_path(path)
            .with_context(|| format!("failed to read targets file: {}", path.display()))?,
        (None, None) => anyhow::bail!("no target given"),
    };

    let plan = match &cli.ports_file {
        Some(path) => {
            let ports = ports::load_ports_from_path(path)
                .with_context(|| format!("failed to read ports file: {}", path.display()))?;
            targets::expand_with_ports(&host_spec, ports, config.protocol).await?
        }
        None => targets::expand(&host_spec, cli.ports.as_deref(), config.protocol).await?,
    };
    Ok(plan)
}
