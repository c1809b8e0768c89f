//! The remote listing protocol.
//!
//! The control channel runs an interactive remote shell. For each log file
//! spec the engine writes one `stat` command whose `--format` wraps every
//! result in a tagged frame:
//!
//! ```text
//! <LOG_FILE><id><mtime><path><NL>
//! ```
//!
//! Responses arrive interleaved with shell diagnostics and ssh warnings, so
//! frames are recovered by scanning a growing buffer with a non-greedy
//! prefix skip. Text ahead of the first frame is retained (up to 256 bytes
//! of the first chunk) for stall diagnostics.

use bytes::BytesMut;

/// Literal tokens of the frame. None of these byte sequences may occur
/// naturally in remote filenames; if they do, the input contract is broken.
pub const FRAME_TAG: &str = "<LOG_FILE>";
pub const FRAME_END: &str = "<NL>";

/// Bytes of the first chunk retained for diagnostics.
pub const FIRST_READ_SAMPLE_MAX: usize = 256;

lazy_static::lazy_static! {
    static ref RECORD_RE: regex::bytes::Regex =
        regex::bytes::Regex::new(r"(?s)^(.*?)<LOG_FILE><(\d+)><(\d+)><(.+?)><NL>").unwrap();
}

/// Build the listing command for one log file spec. `spec_id` is the
/// zero-based index of the spec within the host's `logFiles`; the glob is
/// passed unquoted so the remote shell expands it.
pub fn listing_command(spec_id: usize, glob_pattern: &str) -> String {
    format!(
        "stat --format='{tag}<{id}><%Y><%n>{end}' {glob}\n",
        tag = FRAME_TAG,
        end = FRAME_END,
        id = spec_id,
        glob = glob_pattern,
    )
}

/// One decoded listing frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListingRecord {
    pub spec_id: usize,
    /// Remote mtime in Unix seconds, as observed at listing time.
    pub mtime: i64,
    pub remote_path: String,
}

/// Incremental frame parser over the merged control-channel stream.
#[derive(Debug, Default)]
pub struct RecordParser {
    buf: BytesMut,
    first_read_sample: Option<Vec<u8>>,
}

impl RecordParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// The retained head of the channel's first output chunk.
    pub fn first_read_sample(&self) -> Option<&[u8]> {
        self.first_read_sample.as_deref()
    }

    /// Feed one chunk and drain every complete frame it unlocks.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<ListingRecord> {
        if self.first_read_sample.is_none() {
            let n = chunk.len().min(FIRST_READ_SAMPLE_MAX);
            self.first_read_sample = Some(chunk[..n].to_vec());
        }
        self.buf.extend_from_slice(chunk);
        let mut records = Vec::new();
        loop {
            let (consumed, record) = match RECORD_RE.captures(&self.buf) {
                Some(caps) => {
                    let all = caps.get(0).unwrap();
                    (all.end(), decode(&caps))
                }
                None => break,
            };
            let _ = self.buf.split_to(consumed);
            if let Some(record) = record {
                records.push(record);
            }
        }
        records
    }
}

fn decode(caps: &regex::bytes::Captures) -> Option<ListingRecord> {
    let spec_id = std::str::from_utf8(&caps[2]).ok()?.parse().ok()?;
    let mtime = std::str::from_utf8(&caps[3]).ok()?.parse().ok()?;
    let remote_path = String::from_utf8_lossy(&caps[4]).into_owned();
    Some(ListingRecord {
        spec_id,
        mtime,
        remote_path,
    })
}
