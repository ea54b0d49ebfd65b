//! Wait snapshots, the wait-type normalization table and the per-instance
//! ring buffer that holds one hour of per-minute snapshots.

mod mapping;
mod ring;

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub use mapping::{WaitMapping, WaitRule};
pub use ring::{RingBuffer, TopWaits, WaitTotal};

/// Number of per-minute snapshots kept in memory for each instance.
pub const HISTORY_SLOTS: usize = 60;

/// Accumulated wait time per (normalized) wait type over one emission interval.
///
/// A snapshot whose timestamp is the Unix epoch carries no data; this is what
/// `RingBuffer::last` hands out before anything was enqueued.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    pub ts: DateTime<Utc>,
    #[serde(default)]
    pub waits: BTreeMap<String, i64>,
}

impl Snapshot {
    pub fn new(ts: DateTime<Utc>, waits: BTreeMap<String, i64>) -> Self {
        Self { ts, waits }
    }

    /// True when this is a real snapshot rather than the zero value.
    pub fn has_data(&self) -> bool {
        self.ts != DateTime::<Utc>::default()
    }

    pub fn total_ms(&self) -> i64 {
        self.waits.values().filter(|ms| **ms > 0).sum()
    }
}
