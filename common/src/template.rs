//! Destination template resolution.
//!
//! A destination template combines `strftime` directives, resolved against
//! the remote file's mtime in local time, with `${RXMATCH_1..5}` tokens,
//! resolved from the capture groups of the spec's filter regexp. strftime
//! runs first; backreference values are substituted literally afterwards and
//! are never re-expanded, so a `%` inside a captured filename stays a `%`.

use anyhow::{anyhow, bail, Result};
use chrono::format::{Item, StrftimeItems};
use chrono::{Local, TimeZone};
use std::path::PathBuf;

/// Number of `${RXMATCH_k}` backreference slots.
pub const RXMATCH_SLOTS: usize = 5;

lazy_static::lazy_static! {
    static ref RXMATCH_RE: regex::Regex = regex::Regex::new(r"\$\{RXMATCH_([1-5])\}").unwrap();
}

/// Resolve `template` for a file with the given mtime (Unix seconds) and
/// filter captures. Captures that did not participate in the match are empty
/// strings.
pub fn resolve_destination(
    template: &str,
    mtime: i64,
    captures: &[String; RXMATCH_SLOTS],
) -> Result<PathBuf> {
    let when = Local
        .timestamp_opt(mtime, 0)
        .single()
        .ok_or_else(|| anyhow!("mtime {} is not a representable timestamp", mtime))?;
    let items: Vec<Item> = StrftimeItems::new(template).collect();
    if items.iter().any(|item| matches!(item, Item::Error)) {
        bail!("invalid strftime directive in destination template {:?}", template);
    }
    let formatted = when.format_with_items(items.into_iter()).to_string();
    let resolved = RXMATCH_RE.replace_all(&formatted, |caps: &regex::Captures| {
        let slot: usize = caps[1].parse().unwrap_or(0);
        captures[slot - 1].clone()
    });
    Ok(PathBuf::from(resolved.into_owned()))
}

/// Extract the `${RXMATCH_k}` capture values from a filter match.
pub fn rxmatch_captures(caps: &regex::Captures) -> [String; RXMATCH_SLOTS] {
    std::array::from_fn(|idx| {
        caps.get(idx + 1)
            .map(|m| m.as_str().to_string())
            .unwrap_or_default()
    })
}
