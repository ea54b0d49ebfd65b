use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use super::JournalWriter;
use crate::waits::Snapshot;

type Event = (String, Snapshot);

/// Events waiting for the writer before new ones are dropped.
pub const QUEUE_CAPACITY: usize = 4096;

#[derive(Debug, Default)]
struct Counters {
    writes: AtomicU64,
    errors: AtomicU64,
    dropped: AtomicU64,
    dropping: AtomicBool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SinkStats {
    pub writes: u64,
    pub errors: u64,
    /// Events refused because the queue was full.
    pub dropped: u64,
}

/// Fire-and-forget front for a `JournalWriter`.
///
/// Events are queued on a bounded channel and written by one blocking worker,
/// in arrival order. Callers never wait for disk: when the queue is full the
/// event is dropped and counted.
pub struct JournalSink {
    tx: Mutex<Option<mpsc::Sender<Event>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    counters: Arc<Counters>,
}

impl JournalSink {
    /// Must be called from within a tokio runtime.
    pub fn spawn(writer: JournalWriter) -> Self {
        Self::spawn_with_capacity(writer, QUEUE_CAPACITY)
    }

    pub fn spawn_with_capacity(mut writer: JournalWriter, capacity: usize) -> Self {
        let (tx, mut rx) = mpsc::channel::<Event>(capacity.max(1));
        let counters = Arc::new(Counters::default());
        let worker_counters = counters.clone();

        let worker = tokio::task::spawn_blocking(move || {
            let mut last_error: Option<String> = None;
            while let Some((key, snapshot)) = rx.blocking_recv() {
                match writer.write(&key, &snapshot) {
                    Ok(()) => {
                        worker_counters.writes.fetch_add(1, Ordering::Relaxed);
                        if last_error.take().is_some() {
                            info!("journal writes recovered");
                        }
                    }
                    Err(err) => {
                        worker_counters.errors.fetch_add(1, Ordering::Relaxed);
                        let message = err.to_string();
                        if last_error.as_deref() != Some(message.as_str()) {
                            error!(key = %key, error = %message, "journal write failed");
                            last_error = Some(message);
                        }
                    }
                }
            }
            writer.close();
        });

        Self {
            tx: Mutex::new(Some(tx)),
            worker: Mutex::new(Some(worker)),
            counters,
        }
    }

    /// Queue one event. Returns `false` when the queue is full or the sink
    /// has been shut down.
    pub fn append(&self, key: &str, snapshot: Snapshot) -> bool {
        let guard = self.tx.lock();
        let Some(tx) = guard.as_ref() else {
            return false;
        };
        match tx.try_send((key.to_string(), snapshot)) {
            Ok(()) => {
                if self.counters.dropping.swap(false, Ordering::Relaxed) {
                    info!("journal queue accepting events again");
                }
                true
            }
            Err(TrySendError::Full(_)) => {
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                if !self.counters.dropping.swap(true, Ordering::Relaxed) {
                    warn!(key, "journal queue full; dropping events");
                }
                false
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }

    pub fn stats(&self) -> SinkStats {
        SinkStats {
            writes: self.counters.writes.load(Ordering::Relaxed),
            errors: self.counters.errors.load(Ordering::Relaxed),
            dropped: self.counters.dropped.load(Ordering::Relaxed),
        }
    }

    /// Stop accepting events and wait until everything queued is on disk.
    pub async fn shutdown(&self) {
        self.tx.lock().take();
        let worker = self.worker.lock().take();
        if let Some(worker) = worker {
            if let Err(err) = worker.await {
                error!(error = ?err, "journal worker terminated abnormally");
            }
        }
    }
}
