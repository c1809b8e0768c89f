//! Tracing setup.
//!
//! Log output always goes to the configured log file; `--verbose` forces the
//! `debug` level and mirrors output to stdout. `RUST_LOG` overrides the
//! configured filter when set.

use anyhow::{Context, Result};
use std::path::Path;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::LogLevel;

/// Initialize the global tracing subscriber.
pub fn init(log_file: &Path, level: LogLevel, verbose_stdout: bool) -> Result<()> {
    let directive = if verbose_stdout {
        "debug"
    } else {
        level.as_directive()
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!(
            "logfetcher={0},common={0},remote={0}",
            directive
        ))
    });
    if let Some(parent) = log_file.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("cannot create log directory {:?}", parent))?;
        }
    }
    let file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_file)
        .with_context(|| format!("cannot open log file {:?}", log_file))?;
    let file_layer = fmt::layer()
        .with_writer(std::sync::Arc::new(file))
        .with_ansi(false);
    let registry = tracing_subscriber::registry().with(filter).with(file_layer);
    if verbose_stdout {
        registry
            .with(fmt::layer().with_writer(std::io::stdout))
            .try_init()
            .map_err(|err| anyhow::anyhow!("cannot install tracing subscriber: {}", err))?;
    } else {
        registry
            .try_init()
            .map_err(|err| anyhow::anyhow!("cannot install tracing subscriber: {}", err))?;
    }
    Ok(())
}
