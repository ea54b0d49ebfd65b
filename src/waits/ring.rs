use std::cmp::Ordering;
use std::collections::HashMap;

use serde::Serialize;

use super::Snapshot;

/// Fixed-capacity circular store of snapshots for one instance.
///
/// `p` only ever grows; `data[p % capacity]` is the next slot to write.
#[derive(Debug, Clone)]
pub struct RingBuffer {
    data: Vec<Snapshot>,
    p: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WaitTotal {
    pub wait: String,
    pub total_ms: i64,
}

/// Wait types ranked by accumulated time, largest first.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TopWaits {
    pub waits: Vec<WaitTotal>,
}

impl TopWaits {
    pub fn is_empty(&self) -> bool {
        self.waits.is_empty()
    }

    pub fn get(&self, wait: &str) -> Option<i64> {
        self.waits
            .iter()
            .find(|entry| entry.wait == wait)
            .map(|entry| entry.total_ms)
    }
}

impl RingBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            data: vec![Snapshot::default(); capacity.max(1)],
            p: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    pub fn len(&self) -> usize {
        self.p.min(self.data.len())
    }

    pub fn is_empty(&self) -> bool {
        self.p == 0
    }

    pub fn enqueue(&mut self, snapshot: Snapshot) {
        let slot = self.p % self.data.len();
        self.data[slot] = snapshot;
        self.p += 1;
    }

    /// Most recently enqueued snapshot, or the zero snapshot if nothing was written.
    pub fn last(&self) -> Snapshot {
        if self.p == 0 {
            return Snapshot::default();
        }
        self.data[(self.p - 1) % self.data.len()].clone()
    }

    /// Stored snapshots, oldest first.
    pub fn values(&self) -> Vec<Snapshot> {
        let cap = self.data.len();
        if self.p <= cap {
            return self.data[..self.p].to_vec();
        }
        let split = self.p % cap;
        let mut out = Vec::with_capacity(cap);
        out.extend_from_slice(&self.data[split..]);
        out.extend_from_slice(&self.data[..split]);
        out
    }

    /// Totals per wait type across the stored history. `n == 0` returns all of them.
    pub fn top(&self, n: usize) -> TopWaits {
        let stored = self.len();
        let mut totals: HashMap<&str, i64> = HashMap::new();
        for snapshot in self.data.iter().take(stored) {
            for (wait, ms) in &snapshot.waits {
                if *ms > 0 {
                    *totals.entry(wait.as_str()).or_insert(0) += ms;
                }
            }
        }

        let mut waits: Vec<WaitTotal> = totals
            .into_iter()
            .map(|(wait, total_ms)| WaitTotal {
                wait: wait.to_string(),
                total_ms,
            })
            .collect();
        waits.sort_by(|a, b| match b.total_ms.cmp(&a.total_ms) {
            Ordering::Equal => a.wait.cmp(&b.wait),
            other => other,
        });
        if n > 0 {
            waits.truncate(n);
        }
        TopWaits { waits }
    }
}

impl Default for RingBuffer {
    fn default() -> Self {
        Self::new(super::HISTORY_SLOTS)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, Duration, TimeZone, Utc};
    use std::collections::BTreeMap;

    fn at(minute: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap() + Duration::minutes(minute)
    }

    fn snap(minute: i64, waits: &[(&str, i64)]) -> Snapshot {
        Snapshot::new(
            at(minute),
            waits
                .iter()
                .map(|(w, ms)| (w.to_string(), *ms))
                .collect::<BTreeMap<_, _>>(),
        )
    }

    #[test]
    fn values_stay_chronological_across_wraparound() {
        let mut ring = RingBuffer::new(5);
        assert!(ring.last().waits.is_empty());
        assert!(!ring.last().has_data());

        for i in 0..16 {
            ring.enqueue(snap(i, &[]));
            let values = ring.values();
            let expected_len = (i as usize + 1).min(5);
            assert_eq!(values.len(), expected_len);
            assert_eq!(ring.len(), expected_len);
            assert_eq!(values.last().unwrap().ts, at(i));
            assert_eq!(ring.last().ts, at(i));
            assert_eq!(values[0].ts, at((i - 4).max(0)));
            assert!(values.windows(2).all(|pair| pair[0].ts < pair[1].ts));
        }
    }

    #[test]
    fn exactly_full_ring_returns_every_slot() {
        let mut ring = RingBuffer::new(3);
        for i in 0..3 {
            ring.enqueue(snap(i, &[]));
        }
        let ts: Vec<_> = ring.values().into_iter().map(|s| s.ts).collect();
        assert_eq!(ts, vec![at(0), at(1), at(2)]);
    }

    #[test]
    fn top_sums_positive_values_and_breaks_ties_by_name() {
        let mut ring = RingBuffer::new(60);
        ring.enqueue(snap(0, &[("Lock", 100), ("IO", 50), ("CPU", -20)]));
        ring.enqueue(snap(1, &[("Lock", 20), ("IO", 70), ("CPU", 0)]));
        ring.enqueue(snap(2, &[("Net", 120)]));

        let top = ring.top(0);
        let names: Vec<_> = top.waits.iter().map(|w| w.wait.as_str()).collect();
        assert_eq!(names, vec!["IO", "Lock", "Net"]);
        assert_eq!(top.get("IO"), Some(120));
        assert_eq!(top.get("Lock"), Some(120));
        assert_eq!(top.get("CPU"), None);

        let top1 = ring.top(1);
        assert_eq!(top1.waits.len(), 1);
        assert_eq!(top1.waits[0].wait, "IO");
    }

    #[test]
    fn top_totals_never_decrease_while_history_fits() {
        let mut ring = RingBuffer::new(60);
        let mut previous = 0;
        for i in 0..30 {
            ring.enqueue(snap(i, &[("Lock", i * 3), ("IO", -5)]));
            let total = ring.top(0).get("Lock").unwrap_or(0);
            assert!(total >= previous);
            previous = total;
            assert_eq!(ring.top(0).get("IO"), None);
        }
    }

    #[test]
    fn top_only_counts_stored_history() {
        let mut ring = RingBuffer::new(2);
        ring.enqueue(snap(0, &[("Lock", 1_000)]));
        ring.enqueue(snap(1, &[("IO", 10)]));
        ring.enqueue(snap(2, &[("IO", 10)]));
        assert_eq!(ring.top(0).get("Lock"), None);
        assert_eq!(ring.top(0).get("IO"), Some(20));
    }
}
