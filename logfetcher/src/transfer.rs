//! The transfer task: one attempt to archive one remote file.
//!
//! A task owns two ssh children (the data pipe and the mtime verifier) and
//! one working file. The data stream is gzip-compressed at the source (`cat`
//! for `.gz` remotes, `gzip -c` otherwise) and written byte-for-byte into
//! `<destination>.working`. The verifier re-reads the remote mtime while the
//! data flows; the task succeeds only if the data channel closed cleanly,
//! `gunzip --test` accepts the working file, and the verified mtime equals
//! the one observed at listing time. Only then is the working file renamed
//! into place.
//!
//! Tasks never retry; the next listing tick is the retry.

use bytesize::ByteSize;
use std::os::unix::process::ExitStatusExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::engine::EngineShared;

/// Absolute bound on the local `gunzip --test` run.
const INTEGRITY_TIMEOUT: Duration = Duration::from_secs(600);

const READ_CHUNK: usize = 64 * 1024;

lazy_static::lazy_static! {
    static ref VERIFIER_RE: regex::bytes::Regex =
        regex::bytes::Regex::new(r"<(\d+)>").unwrap();
}

#[derive(Debug, thiserror::Error)]
pub(crate) enum TransferError {
    #[error("cannot create archive directory {path:?}: {source}")]
    CreateDirs {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("transfer already in progress (working file exists)")]
    WorkingFileBusy,
    #[error("cannot open working file {path:?}: {source}")]
    OpenWorking {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("cannot spawn subprocess: {0}")]
    Spawn(#[source] std::io::Error),
    #[error("data channel failed ({status}): {stderr}")]
    DataChannel { status: String, stderr: String },
    #[error("no data received from the remote side")]
    ZeroBytes,
    #[error("channel idle for more than {0:?}")]
    IdleTimeout(Duration),
    #[error("error reading from the data channel: {0}")]
    DataRead(#[source] std::io::Error),
    #[error("cannot write working file: {0}")]
    LocalWrite(#[source] std::io::Error),
    #[error("remote mtime changed since listing (expected {expected}, observed {observed})")]
    MtimeMismatch { expected: i64, observed: i64 },
    #[error("mtime verifier failed: {0}")]
    Verifier(String),
    #[error("gunzip --test rejected the archive: {0}")]
    Integrity(String),
    #[error("gunzip --test did not finish within {INTEGRITY_TIMEOUT:?}")]
    IntegrityTimeout,
    #[error("cannot rename working file into place: {0}")]
    Rename(#[source] std::io::Error),
}

struct TransferOutcome {
    bytes: u64,
    elapsed: Duration,
}

pub(crate) fn working_path(destination: &Path) -> PathBuf {
    let mut path = destination.as_os_str().to_os_string();
    path.push(".working");
    PathBuf::from(path)
}

/// Remote command producing the gzip byte stream for `remote_path`.
fn data_command(remote_path: &str) -> String {
    if remote_path.ends_with(".gz") {
        format!("cat {}", remote::shell_escape(remote_path))
    } else {
        format!("gzip -c {}", remote::shell_escape(remote_path))
    }
}

pub(crate) fn describe_exit(status: Option<std::process::ExitStatus>) -> String {
    match status {
        None => "unknown exit status".to_string(),
        Some(status) => match (status.code(), status.signal()) {
            (Some(code), _) => format!("exit code {}", code),
            (None, Some(signal)) => format!("signal {}", signal),
            _ => "unknown exit status".to_string(),
        },
    }
}

/// Spawn the task; the handle lands in the engine's active set. The task
/// always cleans up after itself: working-file removal on failure, state and
/// statistics updates on both paths.
pub(crate) fn spawn(
    shared: Arc<EngineShared>,
    remote_path: String,
    mtime: i64,
    destination: PathBuf,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let working = working_path(&destination);
        let result = run(&shared, &remote_path, mtime, &working).await;
        finish(&shared, &remote_path, &destination, &working, result).await;
    })
}

async fn run(
    shared: &Arc<EngineShared>,
    remote_path: &str,
    expected_mtime: i64,
    working: &Path,
) -> Result<TransferOutcome, TransferError> {
    if let Some(parent) = working.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|source| TransferError::CreateDirs {
                path: parent.to_path_buf(),
                source,
            })?;
    }
    let mut file = match tokio::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(working)
        .await
    {
        Ok(file) => file,
        Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
            return Err(TransferError::WorkingFileBusy)
        }
        Err(source) => {
            return Err(TransferError::OpenWorking {
                path: working.to_path_buf(),
                source,
            })
        }
    };

    let mut child = shared
        .target
        .command(Some(&data_command(remote_path)))
        .stdin(std::process::Stdio::null())
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(TransferError::Spawn)?;
    let mut stdout = child
        .stdout
        .take()
        .ok_or_else(|| TransferError::Spawn(std::io::Error::other("no stdout pipe")))?;
    let stderr = child.stderr.take();
    let stderr_task = tokio::spawn(async move {
        let mut text = Vec::new();
        if let Some(mut stderr) = stderr {
            let _ = stderr.read_to_end(&mut text).await;
        }
        String::from_utf8_lossy(&text).trim().to_string()
    });

    let idle = Duration::from_secs(shared.general.timeout);
    let mut bytes = 0u64;
    let mut started: Option<Instant> = None;
    let mut verifier: Option<tokio::task::JoinHandle<Result<i64, TransferError>>> = None;
    let mut buf = vec![0u8; READ_CHUNK];
    let data_result = loop {
        let n = match tokio::time::timeout(idle, stdout.read(&mut buf)).await {
            Err(_) => break Err(TransferError::IdleTimeout(idle)),
            Ok(Err(err)) => break Err(TransferError::DataRead(err)),
            Ok(Ok(n)) => n,
        };
        if n == 0 {
            break Ok(());
        }
        if started.is_none() {
            // first byte seen: the clock starts and the verifier goes out
            started = Some(Instant::now());
            verifier = Some(spawn_verifier(shared, remote_path.to_string()));
        }
        if let Err(err) = file.write_all(&buf[..n]).await {
            break Err(TransferError::LocalWrite(err));
        }
        bytes += n as u64;
    };
    if let Err(err) = data_result {
        if let Some(verifier) = &verifier {
            verifier.abort();
        }
        return Err(err);
    }

    // all received bytes must be on disk before the rename publishes them
    file.flush().await.map_err(TransferError::LocalWrite)?;
    file.sync_all().await.map_err(TransferError::LocalWrite)?;
    drop(file);

    let status = child.wait().await.map_err(TransferError::Spawn)?;
    let stderr_text = stderr_task.await.unwrap_or_default();
    if !status.success() {
        if let Some(verifier) = &verifier {
            verifier.abort();
        }
        return Err(TransferError::DataChannel {
            status: describe_exit(Some(status)),
            stderr: stderr_text,
        });
    }
    if bytes == 0 {
        return Err(TransferError::ZeroBytes);
    }
    let elapsed = started.map(|s| s.elapsed()).unwrap_or_default();

    if let Err(err) = run_integrity(working).await {
        if let Some(verifier) = &verifier {
            verifier.abort();
        }
        return Err(err);
    }

    // completion barrier: the verifier leg must report before the task may
    // finish, successfully or not
    let observed = match verifier {
        Some(verifier) => verifier
            .await
            .map_err(|err| TransferError::Verifier(err.to_string()))??,
        None => return Err(TransferError::ZeroBytes),
    };
    if observed != expected_mtime {
        return Err(TransferError::MtimeMismatch {
            expected: expected_mtime,
            observed,
        });
    }

    Ok(TransferOutcome { bytes, elapsed })
}

fn spawn_verifier(
    shared: &Arc<EngineShared>,
    remote_path: String,
) -> tokio::task::JoinHandle<Result<i64, TransferError>> {
    let target = shared.target.clone();
    let idle = Duration::from_secs(shared.general.timeout);
    tokio::spawn(async move {
        let command = format!("stat --format='<%Y>' {}", remote::shell_escape(&remote_path));
        let mut child = target
            .command(Some(&command))
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(TransferError::Spawn)?;
        let mut stdout = child
            .stdout
            .take()
            .ok_or_else(|| TransferError::Spawn(std::io::Error::other("no stdout pipe")))?;
        let mut output = Vec::new();
        let mut buf = [0u8; 4096];
        loop {
            match tokio::time::timeout(idle, stdout.read(&mut buf)).await {
                Err(_) => return Err(TransferError::IdleTimeout(idle)),
                Ok(Err(err)) => return Err(TransferError::Verifier(err.to_string())),
                Ok(Ok(0)) => break,
                Ok(Ok(n)) => output.extend_from_slice(&buf[..n]),
            }
        }
        let status = child.wait().await.map_err(TransferError::Spawn)?;
        if !status.success() {
            return Err(TransferError::Verifier(describe_exit(Some(status))));
        }
        let caps = VERIFIER_RE
            .captures(&output)
            .ok_or_else(|| TransferError::Verifier("no mtime in stat output".to_string()))?;
        std::str::from_utf8(&caps[1])
            .ok()
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| TransferError::Verifier("unparsable mtime".to_string()))
    })
}

async fn run_integrity(working: &Path) -> Result<(), TransferError> {
    let child = tokio::process::Command::new("gunzip")
        .arg("--test")
        .arg("--quiet")
        .arg(working)
        .stdin(std::process::Stdio::null())
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(TransferError::Spawn)?;
    match tokio::time::timeout(INTEGRITY_TIMEOUT, child.wait_with_output()).await {
        Err(_) => Err(TransferError::IntegrityTimeout),
        Ok(Err(err)) => Err(TransferError::Spawn(err)),
        Ok(Ok(output)) if output.status.success() => Ok(()),
        Ok(Ok(output)) => {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            Err(TransferError::Integrity(if stderr.is_empty() {
                describe_exit(Some(output.status))
            } else {
                stderr
            }))
        }
    }
}

async fn finish(
    shared: &Arc<EngineShared>,
    remote_path: &str,
    destination: &Path,
    working: &Path,
    result: Result<TransferOutcome, TransferError>,
) {
    let result = match result {
        Ok(outcome) => tokio::fs::rename(working, destination)
            .await
            .map(|()| outcome)
            .map_err(TransferError::Rename),
        Err(err) => Err(err),
    };
    match result {
        Ok(outcome) => {
            {
                let mut st = shared.state.lock().unwrap();
                st.working_files.remove(destination);
                st.active_transfers.remove(destination);
                st.done_files.insert(destination.to_path_buf());
                st.stats.record_transfer(outcome.bytes);
            }
            let secs = outcome.elapsed.as_secs_f64().max(1e-3);
            tracing::info!(
                host = %shared.host_name,
                "archived {} -> {:?} ({}, {}/s)",
                remote_path,
                destination,
                ByteSize(outcome.bytes),
                ByteSize((outcome.bytes as f64 / secs) as u64),
            );
        }
        Err(error) => {
            // never unlink a working file another task owns
            if !matches!(error, TransferError::WorkingFileBusy) {
                let _ = tokio::fs::remove_file(working).await;
            }
            {
                let mut st = shared.state.lock().unwrap();
                st.working_files.remove(destination);
                st.active_transfers.remove(destination);
            }
            tracing::error!(
                host = %shared.host_name,
                source = %remote_path,
                destination = ?destination,
                "transfer failed: {:#}",
                error
            );
        }
    }
}
