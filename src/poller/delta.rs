use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use tracing::debug;

use crate::db::{ActiveRequest, InstanceIdentity, RequestSample, SessionId};
use crate::waits::{Snapshot, WaitMapping};

const LONG_WAIT_MS: i64 = 5 * 60 * 1000;

/// Wait time attributed to one request during a sampling tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WaitDelta {
    pub session_id: SessionId,
    pub wait_type: String,
    pub ms: i64,
}

/// Remembers the previous tick's requests and turns cumulative wait counters
/// into per-tick increments.
#[derive(Debug, Default)]
pub struct RequestTracker {
    identity: Option<InstanceIdentity>,
    previous: HashMap<SessionId, ActiveRequest>,
}

impl RequestTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn identity(&self) -> Option<&InstanceIdentity> {
        self.identity.as_ref()
    }

    pub fn tracked(&self) -> usize {
        self.previous.len()
    }

    /// Forget everything; the next sample only primes the tracker.
    pub fn clear(&mut self) {
        self.identity = None;
        self.previous.clear();
    }

    /// Compare `sample` to the previous one and return the non-zero deltas.
    ///
    /// The first sample, and any sample from a different instance identity,
    /// only replaces the tracked table.
    pub fn observe(&mut self, sample: RequestSample) -> Vec<WaitDelta> {
        let RequestSample { identity, requests } = sample;

        if self.identity.as_ref() != Some(&identity) {
            if let Some(previous) = &self.identity {
                debug!(
                    old_server = %previous.server_name,
                    new_server = %identity.server_name,
                    booted = %identity.booted,
                    "instance identity changed; resetting wait tracking"
                );
            }
            self.identity = Some(identity);
            self.previous = requests;
            return Vec::new();
        }

        let mut deltas = Vec::new();
        for (session_id, current) in &requests {
            // clock skew on the server can report negative waits
            let current_ms = current.wait_time_ms.max(0);
            let ms = match self.previous.get(session_id) {
                Some(previous)
                    if previous.wait_type == current.wait_type
                        && previous.started == current.started =>
                {
                    let previous_ms = previous.wait_time_ms.max(0);
                    if current_ms > previous_ms {
                        current_ms - previous_ms
                    } else if current_ms < previous_ms {
                        // counter went backwards: a new wait of the same type
                        current_ms
                    } else {
                        0
                    }
                }
                _ => current_ms,
            };
            if ms > 0 && !current.wait_type.is_empty() {
                deltas.push(WaitDelta {
                    session_id: *session_id,
                    wait_type: current.wait_type.clone(),
                    ms,
                });
            }
        }
        self.previous = requests;
        deltas
    }
}

/// Normalized wait type to milliseconds accumulated since the last emission.
#[derive(Debug, Default, Clone)]
pub struct WaitAccumulator {
    waits: BTreeMap<String, i64>,
}

impl WaitAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `false` when the wait was excluded or carried no time.
    pub fn add(&mut self, mapping: &WaitMapping, delta: &WaitDelta) -> bool {
        if delta.ms <= 0 {
            return false;
        }
        let Some(label) = mapping.normalize(&delta.wait_type) else {
            return false;
        };
        if delta.ms > LONG_WAIT_MS {
            debug!(
                session_id = delta.session_id,
                wait = %delta.wait_type,
                ms = delta.ms,
                "long wait observed"
            );
        }
        *self.waits.entry(label.to_string()).or_insert(0) += delta.ms;
        true
    }

    pub fn is_empty(&self) -> bool {
        self.waits.is_empty()
    }

    pub fn get(&self, wait: &str) -> Option<i64> {
        self.waits.get(wait).copied()
    }

    /// Drain into a snapshot stamped `ts`, leaving the accumulator empty.
    pub fn take(&mut self, ts: DateTime<Utc>) -> Snapshot {
        Snapshot::new(ts, std::mem::take(&mut self.waits))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn identity(booted_hour: u32) -> InstanceIdentity {
        InstanceIdentity {
            domain: "db-a:5432".into(),
            server_name: "main".into(),
            booted: Utc.with_ymd_and_hms(2024, 5, 1, booted_hour, 0, 0).unwrap(),
        }
    }

    fn request(id: SessionId, wait: &str, ms: i64) -> ActiveRequest {
        ActiveRequest {
            session_id: id,
            started: Some(Utc.with_ymd_and_hms(2024, 5, 1, 9, 0, 0).unwrap()),
            wait_type: wait.into(),
            wait_time_ms: ms,
        }
    }

    fn sample(requests: Vec<ActiveRequest>) -> RequestSample {
        RequestSample::new(identity(1), requests)
    }

    fn primed(requests: Vec<ActiveRequest>) -> RequestTracker {
        let mut tracker = RequestTracker::new();
        assert!(tracker.observe(sample(requests)).is_empty());
        tracker
    }

    fn ms_of(deltas: &[WaitDelta]) -> Vec<(SessionId, &str, i64)> {
        let mut out: Vec<_> = deltas
            .iter()
            .map(|d| (d.session_id, d.wait_type.as_str(), d.ms))
            .collect();
        out.sort();
        out
    }

    #[test]
    fn growth_yields_the_difference() {
        let mut tracker = primed(vec![request(5, "LCK", 100)]);
        let deltas = tracker.observe(sample(vec![request(5, "LCK", 150)]));
        assert_eq!(ms_of(&deltas), vec![(5, "LCK", 50)]);
    }

    #[test]
    fn counter_drop_counts_as_a_new_wait() {
        let mut tracker = primed(vec![request(5, "LCK", 100)]);
        let deltas = tracker.observe(sample(vec![request(5, "LCK", 10)]));
        assert_eq!(ms_of(&deltas), vec![(5, "LCK", 10)]);
    }

    #[test]
    fn unchanged_counter_yields_nothing() {
        let mut tracker = primed(vec![request(5, "LCK", 100)]);
        assert!(tracker.observe(sample(vec![request(5, "LCK", 100)])).is_empty());
    }

    #[test]
    fn wait_type_change_yields_full_value() {
        let mut tracker = primed(vec![request(5, "LCK", 100)]);
        let deltas = tracker.observe(sample(vec![request(5, "IO", 30)]));
        assert_eq!(ms_of(&deltas), vec![(5, "IO", 30)]);
    }

    #[test]
    fn new_request_on_same_session_yields_full_value() {
        let mut tracker = primed(vec![request(5, "LCK", 100)]);
        let mut next = request(5, "LCK", 150);
        next.started = Some(Utc.with_ymd_and_hms(2024, 5, 1, 9, 30, 0).unwrap());
        let deltas = tracker.observe(sample(vec![next]));
        assert_eq!(ms_of(&deltas), vec![(5, "LCK", 150)]);
    }

    #[test]
    fn new_sessions_and_dropped_sessions() {
        let mut tracker = primed(vec![request(5, "LCK", 100), request(6, "IO", 5)]);
        let deltas = tracker.observe(sample(vec![request(7, "IO", 20), request(8, "", 0)]));
        assert_eq!(ms_of(&deltas), vec![(7, "IO", 20)]);
        assert_eq!(tracker.tracked(), 2);

        // session 5 came back after being dropped: treated as new
        let deltas = tracker.observe(sample(vec![request(5, "LCK", 120)]));
        assert_eq!(ms_of(&deltas), vec![(5, "LCK", 120)]);
    }

    #[test]
    fn negative_wait_times_are_never_credited() {
        let mut tracker = primed(vec![request(5, "LCK", 100)]);
        let deltas = tracker.observe(sample(vec![request(5, "LCK", -40), request(9, "IO", -3)]));
        assert!(deltas.is_empty());

        let deltas = tracker.observe(sample(vec![request(5, "LCK", 25), request(9, "IO", -1)]));
        assert_eq!(ms_of(&deltas), vec![(5, "LCK", 25)]);
    }

    #[test]
    fn identity_change_resets_tracking() {
        let mut tracker = primed(vec![request(5, "LCK", 100)]);
        let restarted = RequestSample::new(identity(2), vec![request(5, "LCK", 400)]);
        assert!(tracker.observe(restarted).is_empty());
        assert_eq!(tracker.identity(), Some(&identity(2)));

        let deltas = tracker.observe(RequestSample::new(identity(2), vec![request(5, "LCK", 450)]));
        assert_eq!(ms_of(&deltas), vec![(5, "LCK", 50)]);
    }

    #[test]
    fn accumulator_applies_mapping_and_drains() {
        let mapping = WaitMapping::new(
            vec!["Timeout:PgSleep".to_string()],
            vec![("Lock:tuple".to_string(), "Lock".to_string())],
        );
        let mut acc = WaitAccumulator::new();
        let delta = |wait: &str, ms| WaitDelta {
            session_id: 1,
            wait_type: wait.into(),
            ms,
        };

        assert!(acc.add(&mapping, &delta("Lock:tuple", 40)));
        assert!(acc.add(&mapping, &delta("Lock", 2)));
        assert!(!acc.add(&mapping, &delta("Timeout:PgSleep", 1000)));
        assert!(!acc.add(&mapping, &delta("", 10)));
        assert!(acc.add(&mapping, &delta("IO:DataFileRead", 6)));
        assert_eq!(acc.get("Lock"), Some(42));

        let ts = Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).unwrap();
        let snap = acc.take(ts);
        assert_eq!(snap.ts, ts);
        assert_eq!(
            snap.waits,
            BTreeMap::from([("IO:DataFileRead".to_string(), 6), ("Lock".to_string(), 42)])
        );
        assert!(acc.is_empty());
        assert!(acc.take(ts).waits.is_empty());
    }
}
