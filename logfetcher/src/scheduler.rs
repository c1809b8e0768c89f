//! Process-wide driver.
//!
//! Builds one fetch engine per configured host, fires an eager first tick so
//! listings go out immediately, then alternates two timers: the listing tick
//! on every `logCheckInterval` and the statistics flush on every
//! `statusLogInterval`. There is no shutdown protocol; the process exits via
//! signal and completed archive files are valid by construction.

use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;

use common::Config;
use remote::SshTarget;

use crate::engine::FetchEngine;

pub fn build_engines(config: Config) -> Result<Vec<FetchEngine>> {
    let general = Arc::new(config.general);
    let mut engines = Vec::with_capacity(config.hosts.len());
    for host in config.hosts {
        tracing::debug!(
            "configured host {} with {} log file spec(s)",
            host.name,
            host.log_files.len()
        );
        let target = SshTarget::new(host.ssh_connect.clone());
        engines.push(FetchEngine::new(host, general.clone(), target)?);
    }
    Ok(engines)
}

pub async fn run(config: Config) -> Result<()> {
    let log_check_interval = config.general.log_check_interval.max(1);
    let status_log_interval = config.general.status_log_interval.max(1);
    let engines = build_engines(config)?;
    for engine in &engines {
        tracing::debug!("initial tick for {}", engine.name());
        engine.tick().await;
    }
    let mut check = tokio::time::interval(Duration::from_secs(log_check_interval));
    check.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut status = tokio::time::interval(Duration::from_secs(status_log_interval));
    status.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // both intervals fire immediately once; the eager tick already happened
    check.tick().await;
    status.tick().await;
    loop {
        tokio::select! {
            _ = check.tick() => {
                for engine in &engines {
                    engine.tick().await;
                }
            }
            _ = status.tick() => {
                for engine in &engines {
                    engine.log_status();
                }
            }
        }
    }
}
