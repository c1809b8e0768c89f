//! The per-host control channel.
//!
//! One persistent ssh subprocess hosts an interactive remote shell. Listing
//! commands are written to its stdin through a writer task, so callers never
//! block; stdout and stderr are pumped into a single event stream in arrival
//! order. The channel is terminal once it reports `Closed`: the owner
//! discards it and builds a fresh one on the next tick.

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc;

use crate::SshTarget;

const READ_CHUNK: usize = 8192;

#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("cannot spawn ssh control channel: {0}")]
    Spawn(#[source] std::io::Error),
    #[error("control channel i/o endpoints unavailable")]
    Endpoints,
    #[error("control channel closed")]
    Closed,
}

/// Events surfaced to the owning engine.
#[derive(Debug)]
pub enum ChannelEvent {
    /// One chunk of merged stdout/stderr output.
    Data(Vec<u8>),
    /// Both output streams reached EOF; the subprocess is gone or going.
    Closed,
}

pub struct ControlChannel {
    child: tokio::process::Child,
    writer_tx: mpsc::UnboundedSender<String>,
}

impl std::fmt::Debug for ControlChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControlChannel")
            .field("pid", &self.child.id())
            .finish()
    }
}

impl ControlChannel {
    /// Launch the ssh subprocess and its pump tasks. Returns the channel and
    /// the event stream the owner must drain.
    pub fn start(
        target: &SshTarget,
    ) -> Result<(Self, mpsc::UnboundedReceiver<ChannelEvent>), ChannelError> {
        let mut cmd = target.command(None);
        cmd.stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true);
        let mut child = cmd.spawn().map_err(ChannelError::Spawn)?;
        tracing::debug!("control channel subprocess spawned (pid {:?})", child.id());
        let stdin = child.stdin.take().ok_or(ChannelError::Endpoints)?;
        let stdout = child.stdout.take().ok_or(ChannelError::Endpoints)?;
        let stderr = child.stderr.take().ok_or(ChannelError::Endpoints)?;

        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let out_pump = tokio::spawn(pump(stdout, event_tx.clone()));
        let err_pump = tokio::spawn(pump(stderr, event_tx.clone()));
        tokio::spawn(async move {
            let _ = out_pump.await;
            let _ = err_pump.await;
            let _ = event_tx.send(ChannelEvent::Closed);
        });

        let (writer_tx, writer_rx) = mpsc::unbounded_channel();
        tokio::spawn(write_loop(stdin, writer_rx));

        Ok((
            Self { child, writer_tx },
            event_rx,
        ))
    }

    /// Queue one command line for the remote shell. Never blocks.
    pub fn write(&self, line: String) -> Result<(), ChannelError> {
        self.writer_tx.send(line).map_err(|_| ChannelError::Closed)
    }

    pub fn pid(&self) -> Option<u32> {
        self.child.id()
    }

    /// SIGKILL the subprocess (if still running) and reap it.
    pub async fn kill(mut self) -> Option<std::process::ExitStatus> {
        let _ = self.child.start_kill();
        self.child.wait().await.ok()
    }
}

async fn pump(
    mut reader: impl tokio::io::AsyncRead + Unpin,
    events: mpsc::UnboundedSender<ChannelEvent>,
) {
    let mut buf = [0u8; READ_CHUNK];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                if events.send(ChannelEvent::Data(buf[..n].to_vec())).is_err() {
                    break;
                }
            }
        }
    }
}

async fn write_loop(
    mut stdin: tokio::process::ChildStdin,
    mut lines: mpsc::UnboundedReceiver<String>,
) {
    while let Some(line) = lines.recv().await {
        if stdin.write_all(line.as_bytes()).await.is_err() {
            break;
        }
        if stdin.flush().await.is_err() {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;

    async fn stub_ssh(body: &str) -> (std::path::PathBuf, std::path::PathBuf) {
        let mut idx = 0;
        let dir = loop {
            let dir = std::env::temp_dir().join(format!(
                "logfetcher_channel_test{}_{}",
                std::process::id(),
                idx
            ));
            match tokio::fs::create_dir(&dir).await {
                Ok(()) => break dir,
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => idx += 1,
                Err(e) => panic!("cannot create temp dir: {}", e),
            }
        };
        let script = dir.join("ssh");
        tokio::fs::write(&script, body).await.unwrap();
        tokio::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755))
            .await
            .unwrap();
        (dir, script)
    }

    #[test_log::test(tokio::test)]
    async fn echoes_commands_through_event_stream() {
        let (dir, script) = stub_ssh("#!/bin/sh\nwhile read line; do echo \"got:$line\"; done\n").await;
        let target = SshTarget::new(vec!["testhost".into()]).with_ssh_program(&script);
        let (channel, mut events) = ControlChannel::start(&target).unwrap();
        channel.write("hello\n".to_string()).unwrap();
        let mut collected = Vec::new();
        while let Some(event) = events.recv().await {
            match event {
                ChannelEvent::Data(chunk) => {
                    collected.extend_from_slice(&chunk);
                    if collected.windows(9).any(|w| w == b"got:hello") {
                        break;
                    }
                }
                ChannelEvent::Closed => panic!("channel closed before echo"),
            }
        }
        channel.kill().await;
        tokio::fs::remove_dir_all(&dir).await.unwrap();
    }

    #[test_log::test(tokio::test)]
    async fn exit_surfaces_closed_event() {
        let (dir, script) = stub_ssh("#!/bin/sh\nexit 3\n").await;
        let target = SshTarget::new(vec!["testhost".into()]).with_ssh_program(&script);
        let (channel, mut events) = ControlChannel::start(&target).unwrap();
        loop {
            match events.recv().await {
                Some(ChannelEvent::Data(_)) => continue,
                Some(ChannelEvent::Closed) => break,
                None => panic!("event stream ended without Closed"),
            }
        }
        let status = channel.kill().await.unwrap();
        assert_eq!(status.code(), Some(3));
        tokio::fs::remove_dir_all(&dir).await.unwrap();
    }
}
