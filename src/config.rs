use clap::ValueEnum;
use std::time::Duration;

use crate::error::{Result, ScanError};
use crate::types::Protocol;

/// Hard ceiling on the worker pool.
pub const MAX_WORKERS: usize = 5_000;

pub const DEFAULT_WORKERS: usize = 50;
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(1);
pub const DEFAULT_BANNER_TIMEOUT: Duration = Duration::from_millis(500);

/// Settings for one scan run, built once and handed to the prober and scheduler.
#[derive(Debug, Clone, PartialEq)]
pub struct ScanConfig {
    pub workers: usize,
    pub connect_timeout: Duration,
    pub banner: bool,
    pub banner_timeout: Duration,
    pub protocol: Protocol,
    /// Look up PTR names for the hosts listed in the report.
    pub reverse_dns: bool,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            workers: DEFAULT_WORKERS,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            banner: false,
            banner_timeout: DEFAULT_BANNER_TIMEOUT,
            protocol: Protocol::Tcp,
            reverse_dns: true,
        }
    }
}

impl ScanConfig {
    pub fn validate(&self) -> Result<()> {
        if self.workers == 0 || self.workers > MAX_WORKERS {
            return Err(ScanError::Config(format!(
                "workers must be between 1 and {MAX_WORKERS}, got {}",
                self.workers
            )));
        }
        if self.connect_timeout.is_zero() {
            return Err(ScanError::Config("timeout must be greater than 0".into()));
        }
        if self.banner && self.banner_timeout.is_zero() {
            return Err(ScanError::Config(
                "banner timeout must be greater than 0".into(),
            ));
        }
        Ok(())
    }
}

/// Convert a user-supplied number of seconds into a `Duration`.
pub fn seconds(value: f64) -> Result<Duration> {
    Duration::try_from_secs_f64(value)
        .map_err(|_| ScanError::Config(format!("invalid number of seconds: {value}")))
}

/// Timing templates, slowest to fastest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum SpeedProfile {
    #[value(name = "T1")]
    T1,
    #[value(name = "T2")]
    T2,
    #[value(name = "T3")]
    T3,
    #[value(name = "T4")]
    T4,
    #[value(name = "T5")]
    T5,
}

impl SpeedProfile {
    pub fn connect_timeout(self) -> Duration {
        match self {
            SpeedProfile::T1 => Duration::from_secs(2),
            SpeedProfile::T2 => Duration::from_secs(1),
            SpeedProfile::T3 => Duration::from_millis(500),
            SpeedProfile::T4 => Duration::from_millis(200),
            SpeedProfile::T5 => Duration::from_millis(100),
        }
    }
}
