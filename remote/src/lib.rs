//! ssh subprocess plumbing for logfetcher.
//!
//! Everything that execs `ssh` lives here: argv construction with the
//! mandatory option set, the persistent per-host control channel, and the
//! listing-record protocol parsed out of the control channel's byte stream.

use std::path::PathBuf;

pub mod channel;
pub mod protocol;

/// Options appended to every ssh invocation, control and transfer alike.
pub const DEFAULT_SSH_OPTS: &[&str] = &[
    "-T",
    "-x",
    "-y",
    "-o",
    "BatchMode=yes",
    "-o",
    "ConnectTimeout=10",
];

/// One remote endpoint: the per-host argument vector plus the ssh binary to
/// exec. The binary is normally just `ssh`; tests substitute a stub.
#[derive(Debug, Clone)]
pub struct SshTarget {
    ssh_program: PathBuf,
    connect_args: Vec<String>,
}

impl SshTarget {
    pub fn new(connect_args: Vec<String>) -> Self {
        Self {
            ssh_program: PathBuf::from("ssh"),
            connect_args,
        }
    }

    pub fn with_ssh_program(mut self, program: impl Into<PathBuf>) -> Self {
        self.ssh_program = program.into();
        self
    }

    /// Build `ssh <connect args> <default opts> [remote command]`.
    pub fn command(&self, remote_command: Option<&str>) -> tokio::process::Command {
        let mut cmd = tokio::process::Command::new(&self.ssh_program);
        cmd.args(&self.connect_args);
        cmd.args(DEFAULT_SSH_OPTS);
        if let Some(remote_command) = remote_command {
            cmd.arg(remote_command);
        }
        cmd
    }
}

/// Quote a string for safe interpolation into a remote `sh` command line.
pub fn shell_escape(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}
