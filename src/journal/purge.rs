use std::path::PathBuf;

use chrono::{DateTime, Utc};
use tracing::{error, trace};

use super::{JournalError, JournalFs, JournalSettings, list_journal_files};

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PurgeReport {
    pub removed: Vec<PathBuf>,
    pub kept: usize,
    pub failed: usize,
}

/// Remove journal files whose name timestamp is older than `now - retain`.
///
/// The age comes from the file name, never from file metadata. A file that
/// cannot be removed is logged and skipped.
pub fn purge_files(
    fs: &dyn JournalFs,
    settings: &JournalSettings,
    now: DateTime<Utc>,
) -> Result<PurgeReport, JournalError> {
    if settings.prefix.is_empty() || settings.extension.is_empty() {
        return Err(JournalError::InvalidSettings);
    }
    let retain = chrono::Duration::from_std(settings.retain)
        .unwrap_or_else(|_| chrono::Duration::minutes(85));
    let threshold = now - retain;

    let mut report = PurgeReport::default();
    for (path, stamped) in list_journal_files(fs, settings)? {
        if stamped >= threshold {
            report.kept += 1;
            continue;
        }
        trace!(file = %path.display(), "purging journal file");
        match fs.remove(&path) {
            Ok(()) => report.removed.push(path),
            Err(err) => {
                error!(file = %path.display(), error = %err, "failed to purge journal file");
                report.failed += 1;
            }
        }
    }
    Ok(report)
}
