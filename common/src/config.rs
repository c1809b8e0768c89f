//! Configuration loading and validation.
//!
//! The configuration file is JSON extended with `//` line comments. Comments
//! are stripped (string literals are respected) before the document is handed
//! to serde; the typed structs below are the schema, and unknown keys are
//! rejected. `${KEY}` occurrences in glob patterns and destination templates
//! are substituted from the `CONSTANTS` table before the configuration is
//! returned to the caller.

use anyhow::{anyhow, bail, Context, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Default location of the configuration file, relative to the working
/// directory. Overridden by the `LOGFETCHER_CFG` environment variable.
pub const DEFAULT_CONFIG_PATH: &str = "./etc/logfetcher.cfg";

/// Environment variable overriding [`DEFAULT_CONFIG_PATH`].
pub const CONFIG_PATH_ENV: &str = "LOGFETCHER_CFG";

lazy_static::lazy_static! {
    static ref CONSTANT_KEY_RE: regex::Regex = regex::Regex::new(r"^[_A-Z]+$").unwrap();
    // ${RXMATCH_1..5} tokens do not match: the digit in the key falls outside [_A-Z]
    static ref CONSTANT_REF_RE: regex::Regex = regex::Regex::new(r"\$\{([_A-Z]+)\}").unwrap();
}

/// Resolve the configuration path from the environment.
pub fn config_path() -> PathBuf {
    std::env::var_os(CONFIG_PATH_ENV)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH))
}

/// Log level accepted in the `GENERAL.logLevel` key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
    Fatal,
}

impl LogLevel {
    /// Directive string understood by `tracing_subscriber::EnvFilter`.
    /// `fatal` has no tracing equivalent and maps to `error`.
    pub fn as_directive(self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error | LogLevel::Fatal => "error",
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct GeneralConfig {
    /// Log sink; always written, even when `--verbose` mirrors to stdout.
    pub log_file: PathBuf,
    pub log_level: LogLevel,
    /// Seconds between listing rounds.
    #[serde(default = "default_log_check_interval")]
    pub log_check_interval: u64,
    /// Seconds between statistics flushes.
    #[serde(default = "default_status_log_interval")]
    pub status_log_interval: u64,
    /// Per-chunk I/O idle timeout in seconds for transfer and stat channels.
    #[serde(default = "default_timeout")]
    pub timeout: u64,
    /// Maximum concurrent transfer tasks per host; 0 disables the limit.
    #[serde(default = "default_transfer_task_limit")]
    pub transfer_task_limit: usize,
}

fn default_log_check_interval() -> u64 {
    10
}

fn default_status_log_interval() -> u64 {
    60
}

fn default_timeout() -> u64 {
    5
}

fn default_transfer_task_limit() -> usize {
    20
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct LogFileSpec {
    /// Shell glob evaluated on the remote host.
    pub glob_pattern: String,
    /// Paths from the glob that do not match are discarded; capture groups
    /// feed the `${RXMATCH_k}` tokens of the destination template.
    #[serde(default)]
    pub filter_regexp: Option<String>,
    /// Local archive path template: strftime directives plus `${RXMATCH_1..5}`.
    pub destination_file: String,
    /// Minimum age in seconds before a remote file is eligible. Parsed and
    /// carried for operators that set it, but not enforced by the engine.
    #[serde(default)]
    pub min_age: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct HostConfig {
    /// Identifier used in log lines.
    pub name: String,
    /// Arguments prefixed to `ssh` to open a session to this host,
    /// e.g. `["user@host"]` or `["-p", "2222", "host"]`.
    pub ssh_connect: Vec<String>,
    pub log_files: Vec<LogFileSpec>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(rename = "GENERAL")]
    pub general: GeneralConfig,
    #[serde(rename = "CONSTANTS", default)]
    pub constants: BTreeMap<String, String>,
    #[serde(rename = "HOSTS")]
    pub hosts: Vec<HostConfig>,
}

/// Load, parse and validate the configuration at `path`.
///
/// Any failure returns an error whose message is suitable for printing to
/// stderr before a non-zero exit; JSON syntax errors include the offending
/// line with a caret pointer.
pub fn load(path: &Path) -> Result<Config> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("cannot read configuration file {:?}", path))?;
    let config = parse(&raw).with_context(|| format!("invalid configuration in {:?}", path))?;
    tracing::debug!("loaded configuration with {} host(s)", config.hosts.len());
    Ok(config)
}

/// Parse and validate a configuration document.
pub fn parse(raw: &str) -> Result<Config> {
    let stripped = strip_comments(raw);
    let mut config: Config = match serde_json::from_str(&stripped) {
        Ok(config) => config,
        Err(err) => bail!(render_parse_error(&stripped, &err)),
    };
    validate(&mut config)?;
    Ok(config)
}

/// Remove `//` line comments outside of string literals. Newlines are kept so
/// parse errors still point at the right line of the original document.
fn strip_comments(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();
    let mut in_string = false;
    let mut escaped = false;
    while let Some(c) = chars.next() {
        if in_string {
            out.push(c);
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_string = false;
            }
            continue;
        }
        match c {
            '"' => {
                in_string = true;
                out.push(c);
            }
            '/' if chars.peek() == Some(&'/') => {
                // drop everything up to, but not including, the newline
                for next in chars.by_ref() {
                    if next == '\n' {
                        out.push('\n');
                        break;
                    }
                }
            }
            _ => out.push(c),
        }
    }
    out
}

fn render_parse_error(source: &str, err: &serde_json::Error) -> String {
    let line_no = err.line();
    let column = err.column();
    let line = source.lines().nth(line_no.saturating_sub(1)).unwrap_or("");
    format!(
        "parse error at line {} column {}: {}\n  {}\n  {}^",
        line_no,
        column,
        err,
        line,
        " ".repeat(column.saturating_sub(1)),
    )
}

fn validate(config: &mut Config) -> Result<()> {
    if config.hosts.is_empty() {
        bail!("no hosts configured");
    }
    for key in config.constants.keys() {
        if !CONSTANT_KEY_RE.is_match(key) {
            bail!("constant name {:?} does not match [_A-Z]+", key);
        }
    }
    for host in &mut config.hosts {
        if host.name.is_empty() {
            bail!("host with empty name");
        }
        if host.ssh_connect.is_empty() {
            bail!("host {:?} has an empty sshConnect list", host.name);
        }
        if host.log_files.is_empty() {
            bail!("host {:?} has no logFiles entries", host.name);
        }
        for spec in &mut host.log_files {
            spec.glob_pattern = substitute_constants(&spec.glob_pattern, &config.constants)
                .with_context(|| format!("globPattern of host {:?}", host.name))?;
            spec.destination_file = substitute_constants(&spec.destination_file, &config.constants)
                .with_context(|| format!("destinationFile of host {:?}", host.name))?;
            if spec.destination_file.is_empty() {
                bail!("host {:?} has an empty destinationFile", host.name);
            }
            if let Some(filter) = &spec.filter_regexp {
                regex::Regex::new(filter).with_context(|| {
                    format!("invalid filterRegexp {:?} of host {:?}", filter, host.name)
                })?;
            }
        }
    }
    Ok(())
}

/// Substitute every `${KEY}` occurrence with its value from `constants`.
/// A reference to an undefined constant is a validation error.
fn substitute_constants(input: &str, constants: &BTreeMap<String, String>) -> Result<String> {
    let mut missing = None;
    let out = CONSTANT_REF_RE.replace_all(input, |caps: &regex::Captures| {
        let key = &caps[1];
        match constants.get(key) {
            Some(value) => value.clone(),
            None => {
                missing.get_or_insert_with(|| key.to_string());
                String::new()
            }
        }
    });
    if let Some(key) = missing {
        return Err(anyhow!("reference to undefined constant ${{{}}}", key));
    }
    Ok(out.into_owned())
}
