//! Library crate for portprobe-rs: target expansion, bounded-concurrency
//! probing, aggregation and report rendering.
pub mod aggregate;
pub mod config;
pub mod error;
pub mod output;
pub mod ports;
pub mod probe;
pub mod scanner;
pub mod targets;
pub mod types;

pub use error::{Result, ScanError};
pub use types::{HostInfo, PortState, ProbeResult, Protocol, ScanReport, ScanUnit, StateCounts};
