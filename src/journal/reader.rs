use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, trace};

use super::{JournalError, JournalSettings, SharedFs, list_journal_files, purge_files};
use crate::clock::SharedClock;

/// Streams raw journal lines, oldest file first.
pub struct JournalReader {
    settings: JournalSettings,
    fs: SharedFs,
    clock: SharedClock,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReadStats {
    pub files: usize,
    pub lines: usize,
    pub errors: usize,
    /// The consumer stopped listening before every file was read.
    pub abandoned: bool,
}

impl JournalReader {
    pub fn new(settings: JournalSettings, fs: SharedFs, clock: SharedClock) -> Result<Self, JournalError> {
        if settings.prefix.is_empty() || settings.extension.is_empty() {
            return Err(JournalError::InvalidSettings);
        }
        if !fs.exists(&settings.dir) {
            return Err(JournalError::MissingDir(settings.dir.clone()));
        }
        Ok(Self {
            settings,
            fs,
            clock,
        })
    }

    /// Read on a blocking worker. The receiver yields lines and closes when every
    /// file has been read; dropping it stops the worker at the next line.
    pub fn spawn(self, buffer: usize) -> (mpsc::Receiver<String>, JoinHandle<ReadStats>) {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        let handle = tokio::task::spawn_blocking(move || {
            let stats = self.read_all(|line| tx.blocking_send(line).is_ok());
            debug!(files = stats.files, lines = stats.lines, "journal reader finished");
            stats
        });
        (rx, handle)
    }

    /// Purge expired files, then hand every non-blank line to `emit` in file
    /// order. `emit` returns `false` to stop early.
    pub fn read_all(&self, mut emit: impl FnMut(String) -> bool) -> ReadStats {
        let mut stats = ReadStats::default();

        if let Err(err) = purge_files(self.fs.as_ref(), &self.settings, self.clock.now()) {
            error!(error = %err, "journal purge before read failed");
            stats.errors += 1;
        }

        let files = match list_journal_files(self.fs.as_ref(), &self.settings) {
            Ok(files) => files,
            Err(err) => {
                error!(error = %err, "failed to list journal files");
                stats.errors += 1;
                return stats;
            }
        };

        for (path, _) in files {
            trace!(file = %path.display(), "reading journal file");
            let mut reader = match self.fs.open_read(&path) {
                Ok(reader) => reader,
                Err(err) => {
                    error!(error = %JournalError::io("open", &path, err), "skipping journal file");
                    stats.errors += 1;
                    continue;
                }
            };
            stats.files += 1;

            let mut buf = Vec::new();
            loop {
                buf.clear();
                match reader.read_until(b'\n', &mut buf) {
                    Ok(0) => break,
                    Ok(_) => {
                        let line = match std::str::from_utf8(&buf) {
                            Ok(line) => line.trim(),
                            Err(err) => {
                                error!(file = %path.display(), error = %err, "skipping undecodable journal line");
                                stats.errors += 1;
                                continue;
                            }
                        };
                        if line.is_empty() {
                            continue;
                        }
                        stats.lines += 1;
                        if !emit(line.to_string()) {
                            stats.abandoned = true;
                            return stats;
                        }
                    }
                    Err(err) => {
                        error!(error = %JournalError::io("read", &path, err), "stopped reading journal file");
                        stats.errors += 1;
                        break;
                    }
                }
            }
            trace!(file = %path.display(), "closed journal file");
        }
        stats
    }
}
