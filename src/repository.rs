use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{RwLock, mpsc};
use tracing::{debug, error, info, trace, warn};

use crate::clock::SharedClock;
use crate::journal::{JournalReader, JournalSink, SinkStats, decode_event};
use crate::waits::{HISTORY_SLOTS, RingBuffer, Snapshot, TopWaits};

type SharedRing = Arc<RwLock<RingBuffer>>;

/// How much history the repository keeps and how the journal is replayed.
#[derive(Debug, Clone)]
pub struct HistorySettings {
    pub capacity: usize,
    /// Replayed records older than `now - lookback` are skipped.
    pub lookback: Duration,
    /// Upper bound on the whole replay.
    pub replay_timeout: Duration,
}

impl Default for HistorySettings {
    fn default() -> Self {
        Self {
            capacity: HISTORY_SLOTS,
            lookback: Duration::from_secs(60 * 60),
            replay_timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct ReplayStats {
    pub read: u64,
    pub used: u64,
    pub skipped_old: u64,
    pub malformed: u64,
    pub timed_out: bool,
}

struct Inner {
    open: bool,
    rings: HashMap<String, SharedRing>,
}

/// Coordinates the per-instance ring buffers and the shared journal.
pub struct Repository {
    inner: RwLock<Inner>,
    journal: Option<JournalSink>,
    settings: HistorySettings,
    clock: SharedClock,
}

impl Repository {
    pub fn new(settings: HistorySettings, clock: SharedClock, journal: Option<JournalSink>) -> Self {
        Self {
            inner: RwLock::new(Inner {
                open: true,
                rings: HashMap::new(),
            }),
            journal,
            settings,
            clock,
        }
    }

    /// Enqueue into the instance's ring and queue the journal append.
    /// Does nothing once the repository is closed.
    pub async fn write(&self, key: &str, snapshot: Snapshot) {
        let ring = {
            let guard = self.inner.read().await;
            if !guard.open {
                return;
            }
            guard.rings.get(key).cloned()
        };

        let ring = match ring {
            Some(ring) => ring,
            None => {
                let mut guard = self.inner.write().await;
                if !guard.open {
                    return;
                }
                let capacity = self.settings.capacity;
                guard
                    .rings
                    .entry(key.to_string())
                    .or_insert_with(|| {
                        debug!(key, capacity, "creating wait ring");
                        Arc::new(RwLock::new(RingBuffer::new(capacity)))
                    })
                    .clone()
            }
        };

        ring.write().await.enqueue(snapshot.clone());

        if let Some(journal) = &self.journal {
            if !journal.append(key, snapshot) {
                trace!(key, "journal closed or full; snapshot kept in memory only");
            }
        }
    }

    async fn ring(&self, key: &str) -> Option<SharedRing> {
        let guard = self.inner.read().await;
        if !guard.open {
            return None;
        }
        guard.rings.get(key).cloned()
    }

    pub async fn last(&self, key: &str) -> Snapshot {
        match self.ring(key).await {
            Some(ring) => ring.read().await.last(),
            None => Snapshot::default(),
        }
    }

    pub async fn values(&self, key: &str) -> Vec<Snapshot> {
        match self.ring(key).await {
            Some(ring) => ring.read().await.values(),
            None => Vec::new(),
        }
    }

    pub async fn top(&self, key: &str, n: usize) -> TopWaits {
        match self.ring(key).await {
            Some(ring) => ring.read().await.top(n),
            None => TopWaits::default(),
        }
    }

    pub async fn keys(&self) -> Vec<String> {
        let guard = self.inner.read().await;
        if !guard.open {
            return Vec::new();
        }
        let mut keys: Vec<String> = guard.rings.keys().cloned().collect();
        keys.sort();
        keys
    }

    pub async fn delete(&self, key: &str) {
        let mut guard = self.inner.write().await;
        if !guard.open {
            return;
        }
        if guard.rings.remove(key).is_some() {
            info!(key, "removed wait history");
        }
    }

    pub async fn close(&self) {
        self.inner.write().await.open = false;
    }

    pub async fn is_open(&self) -> bool {
        self.inner.read().await.open
    }

    pub fn journal_stats(&self) -> Option<SinkStats> {
        self.journal.as_ref().map(JournalSink::stats)
    }

    /// Stop the journal worker after everything queued has been written.
    pub async fn shutdown_journal(&self) {
        if let Some(journal) = &self.journal {
            journal.shutdown().await;
        }
    }

    /// Rebuild the rings from the journal. Call before pollers start emitting.
    pub async fn read_history(&self, reader: JournalReader) -> ReplayStats {
        let (lines, worker) = reader.spawn(256);
        let stats = self.replay_lines(lines).await;
        if !stats.timed_out {
            match worker.await {
                Ok(read) if read.errors > 0 => {
                    warn!(errors = read.errors, "journal read finished with errors")
                }
                Ok(_) => {}
                Err(err) => error!(error = ?err, "journal reader terminated abnormally"),
            }
        }
        stats
    }

    /// Fold raw journal lines into the rings until the channel closes or the
    /// replay deadline passes. Each record takes the lock on its own, so
    /// reads and live writes interleave with a late replay.
    pub async fn replay_lines(&self, mut lines: mpsc::Receiver<String>) -> ReplayStats {
        let started = tokio::time::Instant::now();
        let deadline = started + self.settings.replay_timeout;
        let now = self.clock.now();
        let cutoff = chrono::Duration::from_std(self.settings.lookback)
            .map(|lookback| now - lookback)
            .unwrap_or(DateTime::<Utc>::MIN_UTC);

        let mut stats = ReplayStats::default();
        loop {
            let line = tokio::select! {
                _ = tokio::time::sleep_until(deadline) => {
                    error!(
                        timeout = ?self.settings.replay_timeout,
                        read = stats.read,
                        "journal replay timed out"
                    );
                    stats.timed_out = true;
                    break;
                }
                line = lines.recv() => match line {
                    Some(line) => line,
                    None => break,
                },
            };
            stats.read += 1;

            let (key, snapshot) = match decode_event(&line) {
                Ok(event) => event,
                Err(err) => {
                    warn!(error = %err, "skipping malformed journal record");
                    stats.malformed += 1;
                    continue;
                }
            };
            if snapshot.ts < cutoff {
                stats.skipped_old += 1;
                continue;
            }
            self.replay_one(&key, snapshot).await;
            stats.used += 1;
        }

        info!(
            read = stats.read,
            used = stats.used,
            skipped_old = stats.skipped_old,
            malformed = stats.malformed,
            elapsed = ?started.elapsed(),
            "journal replay complete"
        );
        stats
    }

    async fn replay_one(&self, key: &str, snapshot: Snapshot) {
        let mut guard = self.inner.write().await;
        if !guard.open {
            return;
        }
        let capacity = self.settings.capacity;
        let ring = guard
            .rings
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(RwLock::new(RingBuffer::new(capacity))))
            .clone();
        ring.write().await.enqueue(snapshot);
    }
}
