//! Shared building blocks for the logfetcher binary: configuration loading
//! and validation, destination-template resolution, per-host statistics and
//! tracing setup.

pub mod config;
pub mod logging;
pub mod stats;
pub mod template;
pub mod testutils;

pub use config::{Config, GeneralConfig, HostConfig, LogFileSpec, LogLevel};
pub use stats::FetchStats;
