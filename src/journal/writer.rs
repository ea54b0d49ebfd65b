use std::io::Write;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use super::{JournalError, JournalSettings, SharedFs, encode_event, file_name, purge_files, truncate_to_window};
use crate::clock::SharedClock;
use crate::waits::Snapshot;

/// Appends journal events to the current file, rotating and purging as it goes.
pub struct JournalWriter {
    settings: JournalSettings,
    fs: SharedFs,
    clock: SharedClock,
    file: Option<Box<dyn Write + Send>>,
    current_path: Option<PathBuf>,
    window_start: DateTime<Utc>,
}

impl JournalWriter {
    pub fn new(settings: JournalSettings, fs: SharedFs, clock: SharedClock) -> Self {
        Self {
            settings,
            fs,
            clock,
            file: None,
            current_path: None,
            window_start: DateTime::<Utc>::MIN_UTC,
        }
    }

    pub fn settings(&self) -> &JournalSettings {
        &self.settings
    }

    /// Path of the file currently open for writing, if any.
    pub fn current_path(&self) -> Option<&PathBuf> {
        self.current_path.as_ref()
    }

    pub fn write(&mut self, key: &str, snapshot: &Snapshot) -> Result<(), JournalError> {
        let mut line = encode_event(key, snapshot)?;
        line.push('\n');

        let now = self.clock.now();
        if self.file.is_none() || self.window_elapsed(now) {
            self.rotate(now)?;
        }

        let path = self.current_path.clone().unwrap_or_default();
        let Some(file) = self.file.as_mut() else {
            return Ok(());
        };
        if let Err(err) = file.write_all(line.as_bytes()) {
            // drop the handle so the next write reopens the file
            self.file = None;
            return Err(JournalError::io("write", &path, err));
        }
        Ok(())
    }

    /// Close the current file. The next write opens a new one.
    pub fn close(&mut self) {
        if let Some(mut file) = self.file.take() {
            if let Err(err) = file.flush() {
                warn!(error = %err, "failed to flush journal file on close");
            }
        }
    }

    fn window_elapsed(&self, now: DateTime<Utc>) -> bool {
        let width = chrono::Duration::from_std(self.settings.rotate_every)
            .unwrap_or_else(|_| chrono::Duration::minutes(10));
        now >= self.window_start + width
    }

    fn rotate(&mut self, now: DateTime<Utc>) -> Result<(), JournalError> {
        self.close();

        let dir = &self.settings.dir;
        if !dir.as_os_str().is_empty() {
            self.fs
                .create_dir_all(dir)
                .map_err(|err| JournalError::io("create_dir", dir, err))?;
        }

        let window_start = truncate_to_window(now, self.settings.rotate_every);
        let path = dir.join(file_name(
            &self.settings.prefix,
            &self.settings.extension,
            window_start,
        ));
        let file = self
            .fs
            .open_append(&path)
            .map_err(|err| JournalError::io("open", &path, err))?;
        debug!(file = %path.display(), "opened journal file");

        self.file = Some(file);
        self.current_path = Some(path);
        self.window_start = window_start;

        match purge_files(self.fs.as_ref(), &self.settings, now) {
            Ok(report) if !report.removed.is_empty() => {
                info!(
                    removed = report.removed.len(),
                    failed = report.failed,
                    "purged expired journal files"
                );
            }
            Ok(_) => {}
            Err(err) => warn!(error = %err, "journal purge failed"),
        }
        Ok(())
    }
}

impl Drop for JournalWriter {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{Clock, ManualClock};
    use crate::journal::MemFs;
    use chrono::{Duration, TimeZone};
    use std::collections::BTreeMap;
    use std::path::Path;
    use std::sync::Arc;

    fn snapshot(ts: DateTime<Utc>, ms: i64) -> Snapshot {
        Snapshot::new(ts, BTreeMap::from([("Lock".to_string(), ms)]))
    }

    #[test]
    fn rotates_when_window_elapses_and_purges_old_files() {
        let start = Utc.with_ymd_and_hms(2024, 5, 1, 10, 3, 0).unwrap();
        let clock = Arc::new(ManualClock::new(start));
        let fs = MemFs::new();
        let mut writer = JournalWriter::new(
            JournalSettings::default(),
            Arc::new(fs.clone()),
            clock.clone(),
        );

        for minute in 0..120 {
            writer.write("a", &snapshot(clock.now(), minute)).unwrap();
            clock.advance(Duration::minutes(1));
        }

        // 10:03 .. 12:02 spans windows 10:00 .. 12:00; anything older than
        // 85 minutes before the last rotation (12:00) is gone.
        let names = fs.file_names(Path::new("cache"));
        assert_eq!(
            names,
            vec![
                "w2_20240501_104000.ndjson".to_string(),
                "w2_20240501_105000.ndjson".to_string(),
                "w2_20240501_110000.ndjson".to_string(),
                "w2_20240501_111000.ndjson".to_string(),
                "w2_20240501_112000.ndjson".to_string(),
                "w2_20240501_113000.ndjson".to_string(),
                "w2_20240501_114000.ndjson".to_string(),
                "w2_20240501_115000.ndjson".to_string(),
                "w2_20240501_120000.ndjson".to_string(),
            ]
        );
        let current = fs
            .read_file(Path::new("cache/w2_20240501_115000.ndjson"))
            .unwrap();
        assert_eq!(String::from_utf8(current).unwrap().lines().count(), 10);
    }

    #[test]
    fn reopening_a_window_appends() {
        let start = Utc.with_ymd_and_hms(2024, 5, 1, 10, 1, 0).unwrap();
        let clock = Arc::new(ManualClock::new(start));
        let fs = MemFs::new();
        {
            let mut writer =
                JournalWriter::new(JournalSettings::default(), Arc::new(fs.clone()), clock.clone());
            writer.write("a", &snapshot(start, 1)).unwrap();
        }
        clock.advance(Duration::minutes(2));
        let mut writer =
            JournalWriter::new(JournalSettings::default(), Arc::new(fs.clone()), clock.clone());
        writer.write("b", &snapshot(clock.now(), 2)).unwrap();
        assert_eq!(
            writer.current_path().unwrap(),
            &Path::new("cache").join("w2_20240501_100000.ndjson")
        );

        let bytes = fs
            .read_file(Path::new("cache/w2_20240501_100000.ndjson"))
            .unwrap();
        let text = String::from_utf8(bytes).unwrap();
        let keys: Vec<_> = text.lines().map(|l| crate::journal::decode_event(l).unwrap().0).collect();
        assert_eq!(keys, vec!["a".to_string(), "b".to_string()]);
    }
}
