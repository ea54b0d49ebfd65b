//! Durable, rotating, self-pruning append log of every snapshot written by the
//! repository. Lines are `{"map_key": .., "payload": {"ts": .., "waits": ..}}`
//! and files are named `<prefix>_<YYYYMMDD_HHMMSS>.<ext>`.

mod fs;
mod purge;
mod reader;
mod sink;
mod writer;

use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;
use thiserror::Error;

use crate::waits::Snapshot;

pub use fs::{JournalFs, MemFs, OsFs, SharedFs};
pub use purge::{PurgeReport, purge_files};
pub use reader::{JournalReader, ReadStats};
pub use sink::{JournalSink, SinkStats};
pub use writer::JournalWriter;

pub const TIMESTAMP_FORMAT: &str = "%Y%m%d_%H%M%S";

/// Where journal files live and how long they are kept.
#[derive(Debug, Clone)]
pub struct JournalSettings {
    pub dir: PathBuf,
    pub prefix: String,
    pub extension: String,
    /// Width of one file's window; a new file is opened once it elapses.
    pub rotate_every: Duration,
    /// Files whose name timestamp is older than `now - retain` are purged.
    pub retain: Duration,
}

impl Default for JournalSettings {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("cache"),
            prefix: "w2".into(),
            extension: "ndjson".into(),
            rotate_every: Duration::from_secs(10 * 60),
            retain: Duration::from_secs(85 * 60),
        }
    }
}

#[derive(Debug, Error)]
pub enum JournalError {
    #[error("journal {op} failed for {}: {source}", path.display())]
    Io {
        op: &'static str,
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("journal directory not found: {}", .0.display())]
    MissingDir(PathBuf),
    #[error("journal prefix and extension must not be empty")]
    InvalidSettings,
    #[error("failed to encode journal record: {0}")]
    Encode(#[source] serde_json::Error),
    #[error("malformed journal line: {0}")]
    Envelope(#[source] serde_json::Error),
    #[error("malformed payload for {key}: {source}")]
    Payload {
        key: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("invalid journal record: {0}")]
    Invalid(&'static str),
}

impl JournalError {
    pub(crate) fn io(op: &'static str, path: &Path, source: io::Error) -> Self {
        Self::Io {
            op,
            path: path.to_path_buf(),
            source,
        }
    }
}

#[derive(Serialize)]
struct JournalRecord<'a> {
    map_key: &'a str,
    payload: &'a Snapshot,
}

#[derive(Deserialize)]
struct JournalEvent {
    map_key: String,
    payload: Box<RawValue>,
}

/// Serialize one event as a single line, without the trailing newline.
pub fn encode_event(key: &str, snapshot: &Snapshot) -> Result<String, JournalError> {
    serde_json::to_string(&JournalRecord {
        map_key: key,
        payload: snapshot,
    })
    .map_err(JournalError::Encode)
}

/// Decode and validate one journal line.
pub fn decode_event(line: &str) -> Result<(String, Snapshot), JournalError> {
    let event: JournalEvent =
        serde_json::from_str(line.trim_end()).map_err(JournalError::Envelope)?;
    if event.map_key.is_empty() {
        return Err(JournalError::Invalid("empty map_key"));
    }
    let snapshot: Snapshot =
        serde_json::from_str(event.payload.get()).map_err(|source| JournalError::Payload {
            key: event.map_key.clone(),
            source,
        })?;
    if !snapshot.has_data() {
        return Err(JournalError::Invalid("zero timestamp"));
    }
    Ok((event.map_key, snapshot))
}

pub fn file_name(prefix: &str, extension: &str, ts: DateTime<Utc>) -> String {
    format!("{prefix}_{}.{extension}", ts.format(TIMESTAMP_FORMAT))
}

/// Timestamp embedded in a journal file name, or `None` if the name does not
/// follow `<prefix>_<YYYYMMDD_HHMMSS>.<ext>`.
pub fn parse_file_timestamp(path: &Path, prefix: &str, extension: &str) -> Option<DateTime<Utc>> {
    let name = path.file_name()?.to_str()?;
    let stamp = name
        .strip_prefix(prefix)?
        .strip_prefix('_')?
        .strip_suffix(extension)?
        .strip_suffix('.')?;
    if stamp.len() != 15 {
        return None;
    }
    NaiveDateTime::parse_from_str(stamp, TIMESTAMP_FORMAT)
        .ok()
        .map(|naive| naive.and_utc())
}

/// Floor `ts` to the start of its rotation window.
pub fn truncate_to_window(ts: DateTime<Utc>, window: Duration) -> DateTime<Utc> {
    let width = window.as_secs().max(1) as i64;
    let secs = ts.timestamp();
    DateTime::from_timestamp(secs - secs.rem_euclid(width), 0).unwrap_or(ts)
}

/// Journal files for `prefix`/`extension` in `dir`, oldest first.
pub(crate) fn list_journal_files(
    fs: &dyn JournalFs,
    settings: &JournalSettings,
) -> Result<Vec<(PathBuf, DateTime<Utc>)>, JournalError> {
    if !fs.exists(&settings.dir) {
        return Err(JournalError::MissingDir(settings.dir.clone()));
    }
    let mut files: Vec<(PathBuf, DateTime<Utc>)> = fs
        .list(&settings.dir)
        .map_err(|err| JournalError::io("list", &settings.dir, err))?
        .into_iter()
        .filter_map(|path| {
            parse_file_timestamp(&path, &settings.prefix, &settings.extension).map(|ts| (path, ts))
        })
        .collect();
    files.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(files)
}
