//! The per-host fetch engine.
//!
//! One engine owns one host's control channel, its in-flight transfer set
//! and its statistics. `tick()` drives listings and the stall watchdog;
//! everything else is event-driven: control-channel data feeds the record
//! parser, records spawn transfer tasks, and completed tasks update the
//! engine state from their own tokio task.
//!
//! All mutable state lives behind a single mutex per host; no await happens
//! while it is held.

use anyhow::{Context, Result};
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

use common::config::{GeneralConfig, HostConfig};
use common::{template, FetchStats};
use remote::channel::{ChannelEvent, ControlChannel};
use remote::protocol::{self, ListingRecord, RecordParser};
use remote::SshTarget;

use crate::transfer;

pub struct FetchEngine {
    pub(crate) inner: Arc<EngineShared>,
}

pub(crate) struct EngineShared {
    pub(crate) host_name: String,
    pub(crate) target: SshTarget,
    pub(crate) specs: Vec<CompiledSpec>,
    pub(crate) general: Arc<GeneralConfig>,
    pub(crate) state: Mutex<EngineState>,
}

pub(crate) struct CompiledSpec {
    pub(crate) glob_pattern: String,
    pub(crate) filter: Option<regex::Regex>,
    pub(crate) destination_template: String,
}

pub(crate) struct EngineState {
    pub(crate) control: Option<ControlChannel>,
    /// Bumped on every channel start so a stale pump cannot discard a
    /// successor channel.
    pub(crate) channel_epoch: u64,
    pub(crate) active_transfers: HashMap<PathBuf, tokio::task::JoinHandle<()>>,
    pub(crate) done_files: HashSet<PathBuf>,
    pub(crate) working_files: HashSet<PathBuf>,
    pub(crate) last_listing_activity: Instant,
    pub(crate) first_read_sample: Option<Vec<u8>>,
    pub(crate) stats: FetchStats,
}

/// The channel is considered stuck once it has been silent for longer than
/// the per-chunk timeout plus one full listing interval.
pub(crate) fn watchdog_expired(idle: Duration, timeout_secs: u64, check_interval_secs: u64) -> bool {
    idle > Duration::from_secs(timeout_secs + check_interval_secs)
}

impl FetchEngine {
    pub fn new(host: HostConfig, general: Arc<GeneralConfig>, target: SshTarget) -> Result<Self> {
        let mut specs = Vec::with_capacity(host.log_files.len());
        for spec in &host.log_files {
            let filter = spec
                .filter_regexp
                .as_deref()
                .map(regex::Regex::new)
                .transpose()
                .with_context(|| {
                    format!("invalid filterRegexp for host {:?}", host.name)
                })?;
            specs.push(CompiledSpec {
                glob_pattern: spec.glob_pattern.clone(),
                filter,
                destination_template: spec.destination_file.clone(),
            });
        }
        Ok(Self {
            inner: Arc::new(EngineShared {
                host_name: host.name,
                target,
                specs,
                general,
                state: Mutex::new(EngineState {
                    control: None,
                    channel_epoch: 0,
                    active_transfers: HashMap::new(),
                    done_files: HashSet::new(),
                    working_files: HashSet::new(),
                    last_listing_activity: Instant::now(),
                    first_read_sample: None,
                    stats: FetchStats::default(),
                }),
            }),
        })
    }

    pub fn name(&self) -> &str {
        &self.inner.host_name
    }

    /// One scheduling round: ensure a control channel exists, service the
    /// stall watchdog, and issue one listing command per log file spec.
    pub async fn tick(&self) {
        let stalled = {
            let mut st = self.inner.state.lock().unwrap();
            if st.control.is_none() {
                if let Err(err) = self.start_channel(&mut st) {
                    tracing::error!(
                        host = %self.inner.host_name,
                        "cannot open control channel: {:#}",
                        err
                    );
                    return;
                }
                None
            } else if watchdog_expired(
                st.last_listing_activity.elapsed(),
                self.inner.general.timeout,
                self.inner.general.log_check_interval,
            ) {
                st.control.take().map(|c| (c, st.first_read_sample.clone()))
            } else {
                None
            }
        };
        if let Some((channel, sample)) = stalled {
            tracing::error!(
                host = %self.inner.host_name,
                pid = ?channel.pid(),
                "control channel stalled; killing it"
            );
            if let Some(sample) = sample {
                tracing::error!(
                    host = %self.inner.host_name,
                    "first channel output was: {:?}",
                    String::from_utf8_lossy(&sample)
                );
            }
            let status = channel.kill().await;
            tracing::debug!(
                host = %self.inner.host_name,
                "stalled channel reaped ({})",
                transfer::describe_exit(status)
            );
            return;
        }
        let st = self.inner.state.lock().unwrap();
        if let Some(control) = &st.control {
            for (spec_id, spec) in self.inner.specs.iter().enumerate() {
                let line = protocol::listing_command(spec_id, &spec.glob_pattern);
                if let Err(err) = control.write(line) {
                    tracing::warn!(
                        host = %self.inner.host_name,
                        "cannot queue listing command: {}",
                        err
                    );
                    break;
                }
            }
        }
    }

    /// Flush and return the statistics counters.
    pub fn flush_stats(&self) -> FetchStats {
        self.inner.state.lock().unwrap().stats.flush()
    }

    pub fn log_status(&self) {
        let stats = self.flush_stats();
        tracing::info!(
            "status {}: filesChecked={} filesTransfered={} bytesTransfered={}",
            self.inner.host_name,
            stats.files_checked,
            stats.files_transfered,
            stats.bytes_transfered,
        );
    }

    fn start_channel(&self, st: &mut EngineState) -> Result<(), remote::channel::ChannelError> {
        let (channel, events) = ControlChannel::start(&self.inner.target)?;
        tracing::info!(
            host = %self.inner.host_name,
            pid = ?channel.pid(),
            "control channel started"
        );
        st.channel_epoch += 1;
        st.control = Some(channel);
        st.last_listing_activity = Instant::now();
        st.first_read_sample = None;
        self.spawn_pump(events, st.channel_epoch);
        Ok(())
    }

    fn spawn_pump(&self, mut events: mpsc::UnboundedReceiver<ChannelEvent>, epoch: u64) {
        let shared = self.inner.clone();
        tokio::spawn(async move {
            let mut parser = RecordParser::new();
            while let Some(event) = events.recv().await {
                match event {
                    ChannelEvent::Data(chunk) => {
                        let records = parser.push(&chunk);
                        {
                            let mut st = shared.state.lock().unwrap();
                            if st.first_read_sample.is_none() {
                                st.first_read_sample =
                                    parser.first_read_sample().map(|s| s.to_vec());
                            }
                        }
                        for record in records {
                            EngineShared::handle_record(&shared, record);
                        }
                    }
                    ChannelEvent::Closed => {
                        let channel = {
                            let mut st = shared.state.lock().unwrap();
                            if st.channel_epoch == epoch {
                                st.control.take()
                            } else {
                                None
                            }
                        };
                        if let Some(channel) = channel {
                            let status = channel.kill().await;
                            tracing::warn!(
                                host = %shared.host_name,
                                "control channel closed ({})",
                                transfer::describe_exit(status)
                            );
                        }
                        break;
                    }
                }
            }
        });
    }
}

impl EngineShared {
    /// Process one decoded listing record: filter, resolve the destination,
    /// dedup against finished and in-flight work, and spawn a transfer task
    /// when the concurrency limit allows.
    pub(crate) fn handle_record(shared: &Arc<EngineShared>, record: ListingRecord) {
        let mut st = shared.state.lock().unwrap();
        st.last_listing_activity = Instant::now();
        let Some(spec) = shared.specs.get(record.spec_id) else {
            tracing::debug!(
                host = %shared.host_name,
                "listing record names unknown spec id {}",
                record.spec_id
            );
            return;
        };
        let captures = match &spec.filter {
            Some(filter) => match filter.captures(&record.remote_path) {
                Some(caps) => template::rxmatch_captures(&caps),
                None => return,
            },
            None => Default::default(),
        };
        let destination = match template::resolve_destination(
            &spec.destination_template,
            record.mtime,
            &captures,
        ) {
            Ok(destination) => destination,
            Err(err) => {
                tracing::error!(
                    host = %shared.host_name,
                    source = %record.remote_path,
                    "cannot resolve destination: {:#}",
                    err
                );
                return;
            }
        };
        st.stats.record_checked();
        if st.done_files.contains(&destination) {
            return;
        }
        if st.working_files.contains(&destination) {
            tracing::debug!(
                host = %shared.host_name,
                destination = ?destination,
                "transfer already in progress"
            );
            return;
        }
        if destination.exists() {
            // the archive directory is the source of truth; memoize it
            st.done_files.insert(destination);
            return;
        }
        let limit = shared.general.transfer_task_limit;
        if limit != 0 && st.active_transfers.len() >= limit {
            tracing::debug!(
                host = %shared.host_name,
                "transfer task limit ({}) reached; {} will be retried next tick",
                limit,
                record.remote_path
            );
            return;
        }
        st.working_files.insert(destination.clone());
        let handle = transfer::spawn(
            shared.clone(),
            record.remote_path,
            record.mtime,
            destination.clone(),
        );
        st.active_transfers.insert(destination, handle);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support;
    use std::os::unix::fs::PermissionsExt;

    #[test]
    fn watchdog_thresholds() {
        assert!(!watchdog_expired(Duration::from_secs(14), 5, 10));
        assert!(!watchdog_expired(Duration::from_secs(15), 5, 10));
        assert!(watchdog_expired(Duration::from_secs(16), 5, 10));
        assert!(watchdog_expired(Duration::from_millis(1001), 1, 0));
    }

    fn engine_with(
        general: GeneralConfig,
        host: HostConfig,
        ssh_program: &std::path::Path,
    ) -> FetchEngine {
        let target = SshTarget::new(host.ssh_connect.clone()).with_ssh_program(ssh_program);
        FetchEngine::new(host, Arc::new(general), target).unwrap()
    }

    async fn wait_until(mut check: impl FnMut() -> bool) {
        for _ in 0..200 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        panic!("condition not reached within 10s");
    }

    #[test_log::test(tokio::test)]
    async fn cold_start_archives_one_file() {
        let tmp = common::testutils::create_temp_dir().await.unwrap();
        let ssh = test_support::stub_ssh(&tmp).await;
        let remote_file = tmp.join("remote").join("x.log");
        tokio::fs::create_dir_all(remote_file.parent().unwrap())
            .await
            .unwrap();
        tokio::fs::write(&remote_file, b"january log contents\n")
            .await
            .unwrap();
        let host = test_support::host_config(
            &[(
                remote_file.to_str().unwrap(),
                None,
                &format!("{}/archive/%Y/x.gz", tmp.display()),
            )],
        );
        let engine = engine_with(test_support::general_config(), host, &ssh);
        engine.tick().await;
        let year = test_support::local_year(&remote_file).await;
        let archived = tmp.join(format!("archive/{}/x.gz", year));
        wait_until(|| archived.exists()).await;
        wait_until(|| engine.inner.state.lock().unwrap().active_transfers.is_empty()).await;
        let stats = engine.flush_stats();
        assert_eq!(stats.files_checked, 1);
        assert_eq!(stats.files_transfered, 1);
        assert!(stats.bytes_transfered > 0);
        let archived_bytes = tokio::fs::read(&archived).await.unwrap();
        assert_eq!(&archived_bytes[..2], b"\x1f\x8b", "not a gzip stream");
        assert!(!test_support::working_path(&archived).exists());
        {
            let st = engine.inner.state.lock().unwrap();
            assert!(st.done_files.contains(&archived));
            assert!(st.working_files.is_empty());
        }
        tokio::fs::remove_dir_all(&tmp).await.unwrap();
    }

    #[test_log::test(tokio::test)]
    async fn existing_destination_is_skipped() {
        let tmp = common::testutils::create_temp_dir().await.unwrap();
        let ssh = test_support::stub_ssh(&tmp).await;
        let remote_file = tmp.join("remote").join("x.log");
        tokio::fs::create_dir_all(remote_file.parent().unwrap())
            .await
            .unwrap();
        tokio::fs::write(&remote_file, b"contents\n").await.unwrap();
        let year = test_support::local_year(&remote_file).await;
        let archived = tmp.join(format!("archive/{}/x.gz", year));
        tokio::fs::create_dir_all(archived.parent().unwrap())
            .await
            .unwrap();
        tokio::fs::write(&archived, b"already here").await.unwrap();
        let host = test_support::host_config(&[(
            remote_file.to_str().unwrap(),
            None,
            &format!("{}/archive/%Y/x.gz", tmp.display()),
        )]);
        let engine = engine_with(test_support::general_config(), host, &ssh);
        engine.tick().await;
        wait_until(|| engine.inner.state.lock().unwrap().stats.files_checked == 1).await;
        // give a would-be transfer time to corrupt the marker, then check
        tokio::time::sleep(Duration::from_millis(300)).await;
        let stats = engine.flush_stats();
        assert_eq!(stats.files_checked, 1);
        assert_eq!(stats.files_transfered, 0);
        let content = tokio::fs::read(&archived).await.unwrap();
        assert_eq!(content, b"already here");
        tokio::fs::remove_dir_all(&tmp).await.unwrap();
    }

    #[test_log::test(tokio::test)]
    async fn filter_and_backrefs_shape_the_destination() {
        let tmp = common::testutils::create_temp_dir().await.unwrap();
        let ssh = test_support::stub_ssh(&tmp).await;
        let remote_dir = tmp.join("remote");
        tokio::fs::create_dir_all(&remote_dir).await.unwrap();
        tokio::fs::write(remote_dir.join("site-access.log.3"), b"a\n")
            .await
            .unwrap();
        tokio::fs::write(remote_dir.join("other.txt"), b"b\n").await.unwrap();
        let host = test_support::host_config(&[(
            &format!("{}/*", remote_dir.display()),
            Some(r"([^/]+-access\.log)\.\d+$"),
            &format!("{}/archive/${{RXMATCH_1}}-%Y.gz", tmp.display()),
        )]);
        let engine = engine_with(test_support::general_config(), host, &ssh);
        engine.tick().await;
        let year = test_support::local_year(&remote_dir.join("site-access.log.3")).await;
        let archived = tmp.join(format!("archive/site-access.log-{}.gz", year));
        wait_until(|| archived.exists()).await;
        wait_until(|| engine.inner.state.lock().unwrap().active_transfers.is_empty()).await;
        // other.txt fails the filter and is never counted
        let stats = engine.flush_stats();
        assert_eq!(stats.files_checked, 1);
        assert_eq!(stats.files_transfered, 1);
        tokio::fs::remove_dir_all(&tmp).await.unwrap();
    }

    #[test_log::test(tokio::test)]
    async fn task_limit_bounds_concurrency() {
        let tmp = common::testutils::create_temp_dir().await.unwrap();
        // slow down data transfers so the limit is observable
        let ssh = test_support::stub_ssh_with_prelude(&tmp, "case \"$*\" in gzip*) sleep 1;; esac")
            .await;
        let remote_dir = tmp.join("remote");
        tokio::fs::create_dir_all(&remote_dir).await.unwrap();
        for idx in 0..5 {
            tokio::fs::write(remote_dir.join(format!("f{}.log", idx)), b"data\n")
                .await
                .unwrap();
        }
        let host = test_support::host_config(&[(
            &format!("{}/*.log", remote_dir.display()),
            Some(r"([^/]+)\.log$"),
            &format!("{}/archive/${{RXMATCH_1}}.gz", tmp.display()),
        )]);
        let mut general = test_support::general_config();
        general.transfer_task_limit = 2;
        general.timeout = 5;
        let engine = engine_with(general, host, &ssh);
        engine.tick().await;
        // all five records must be in before concurrency is judged
        wait_until(|| {
            let st = engine.inner.state.lock().unwrap();
            st.stats.files_checked >= 5
        })
        .await;
        {
            let st = engine.inner.state.lock().unwrap();
            assert!(!st.active_transfers.is_empty());
            assert!(st.active_transfers.len() <= 2, "limit exceeded");
        }
        // keep ticking until all five land
        for _ in 0..40 {
            engine.tick().await;
            let done = {
                let st = engine.inner.state.lock().unwrap();
                st.stats.files_transfered
            };
            {
                let st = engine.inner.state.lock().unwrap();
                assert!(st.active_transfers.len() <= 2, "limit exceeded");
            }
            if done == 5 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(300)).await;
        }
        let stats = engine.flush_stats();
        assert_eq!(stats.files_transfered, 5);
        for idx in 0..5 {
            assert!(tmp.join(format!("archive/f{}.gz", idx)).exists());
        }
        tokio::fs::remove_dir_all(&tmp).await.unwrap();
    }

    #[test_log::test(tokio::test)]
    async fn stalled_channel_is_killed_and_replaced() {
        let tmp = common::testutils::create_temp_dir().await.unwrap();
        // a control shell that never answers
        let script = tmp.join("ssh");
        tokio::fs::write(&script, "#!/bin/sh\nexec sleep 600\n").await.unwrap();
        tokio::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755))
            .await
            .unwrap();
        let host = test_support::host_config(&[(
            "/nonexistent/*",
            None,
            &format!("{}/archive/x.gz", tmp.display()),
        )]);
        let mut general = test_support::general_config();
        general.timeout = 1;
        general.log_check_interval = 0;
        let engine = engine_with(general, host, &script);
        engine.tick().await;
        let first_epoch = engine.inner.state.lock().unwrap().channel_epoch;
        assert!(engine.inner.state.lock().unwrap().control.is_some());
        tokio::time::sleep(Duration::from_millis(1200)).await;
        // watchdog fires: channel killed, none left in place
        engine.tick().await;
        assert!(engine.inner.state.lock().unwrap().control.is_none());
        // next tick builds a fresh one
        engine.tick().await;
        let st = engine.inner.state.lock().unwrap();
        assert!(st.control.is_some());
        assert_eq!(st.channel_epoch, first_epoch + 1);
        drop(st);
        tokio::fs::remove_dir_all(&tmp).await.unwrap();
    }
}
