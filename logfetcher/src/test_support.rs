//! Shared fixtures for the engine and transfer test suites.
//!
//! Tests run the real engine against a stub `ssh`: a generated shell script
//! that drops the connection arguments and executes the requested command
//! locally. With no command it reads the control-channel shell from stdin,
//! exactly like `ssh -T` would. A prelude hook lets individual tests
//! reshape specific remote commands (hang, lie, fail).

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::MutexGuard;

use common::config::{GeneralConfig, HostConfig, LogFileSpec, LogLevel};

use crate::engine::{EngineState, FetchEngine};

pub async fn stub_ssh(dir: &Path) -> PathBuf {
    stub_ssh_with_prelude(dir, "").await
}

pub async fn stub_ssh_with_prelude(dir: &Path, prelude: &str) -> PathBuf {
    let body = format!(
        "#!/bin/sh\n\
         # drop the host alias and every ssh option, keep the remote command\n\
         shift\n\
         while [ $# -gt 0 ]; do\n\
         \x20 case \"$1\" in\n\
         \x20   -o) shift 2 ;;\n\
         \x20   -*) shift ;;\n\
         \x20   *) break ;;\n\
         \x20 esac\n\
         done\n\
         {prelude}\n\
         if [ $# -eq 0 ]; then\n\
         \x20 exec /bin/sh -s\n\
         fi\n\
         exec /bin/sh -c \"$*\"\n",
        prelude = prelude,
    );
    let script = dir.join("ssh");
    tokio::fs::write(&script, body).await.unwrap();
    tokio::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755))
        .await
        .unwrap();
    script
}

pub fn general_config() -> GeneralConfig {
    GeneralConfig {
        log_file: std::env::temp_dir().join("logfetcher-test.log"),
        log_level: LogLevel::Debug,
        log_check_interval: 1,
        status_log_interval: 60,
        timeout: 5,
        transfer_task_limit: 20,
    }
}

pub fn host_config(specs: &[(&str, Option<&str>, &str)]) -> HostConfig {
    HostConfig {
        name: "testhost".to_string(),
        ssh_connect: vec!["testhost".to_string()],
        log_files: specs
            .iter()
            .map(|(glob, filter, destination)| LogFileSpec {
                glob_pattern: glob.to_string(),
                filter_regexp: filter.map(str::to_string),
                destination_file: destination.to_string(),
                min_age: None,
            })
            .collect(),
    }
}

pub fn engine_state(engine: &FetchEngine) -> MutexGuard<'_, EngineState> {
    engine.inner.state.lock().unwrap()
}

pub fn working_path(destination: &Path) -> PathBuf {
    crate::transfer::working_path(destination)
}

/// Year of the file's mtime, in local time, as the destination template
/// resolver would render `%Y`.
pub async fn local_year(path: &Path) -> String {
    let metadata = tokio::fs::metadata(path).await.unwrap();
    let mtime = metadata
        .modified()
        .unwrap()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_secs() as i64;
    let empty: [String; 5] = Default::default();
    common::template::resolve_destination("%Y", mtime, &empty)
        .unwrap()
        .to_string_lossy()
        .into_owned()
}
