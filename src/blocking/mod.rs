//! Head-blocker and transitive block-count annotation of a live session table.

mod service;

use std::cmp::Ordering;
use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;

use crate::db::{SessionId, SessionRow};

pub use service::{
    STATEMENT_TEXT_LIMIT, SessionError, SessionSnapshot, SessionSnapshotService, run_time_text,
    trim_sql,
};

/// Longest blocker chain followed before giving up on a session.
pub const MAX_BLOCKING_DEPTH: usize = 100;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BlockingError {
    #[error("blocking chain for session {session_id} is deeper than {limit}")]
    DepthExceeded { session_id: SessionId, limit: usize },
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SessionRecord {
    pub session_id: SessionId,
    pub blocker_id: SessionId,
    pub total_blocked: i32,
    pub head_blocker_id: SessionId,
    pub path: String,
    pub depth: i32,
    pub start_time: Option<DateTime<Utc>>,
    pub status: String,
    pub database: String,
    pub wait_type: String,
    pub wait_time_ms: i64,
    pub wait_resource: String,
    pub host_name: String,
    pub app_name: String,
    pub login_name: String,
    pub command: String,
    pub open_transaction_count: i32,
    pub statement_text: String,
    pub run_time_seconds: i64,
    pub run_time_text: String,
}

impl From<SessionRow> for SessionRecord {
    fn from(row: SessionRow) -> Self {
        Self {
            session_id: row.session_id,
            blocker_id: row.blocker_id,
            start_time: row.start_time,
            status: row.status,
            database: row.database,
            wait_type: row.wait_type,
            wait_time_ms: row.wait_time_ms,
            wait_resource: row.wait_resource,
            host_name: row.host_name,
            app_name: row.app_name,
            login_name: row.login_name,
            command: row.command,
            open_transaction_count: row.open_transaction_count,
            statement_text: row.statement_text,
            run_time_text: run_time_text(row.run_time_seconds),
            run_time_seconds: row.run_time_seconds,
            ..Self::default()
        }
    }
}

struct Walk {
    head: SessionId,
    /// Start first, head last.
    visited: Vec<SessionId>,
    cycle: bool,
}

fn walk(start: SessionId, blocked_by: &HashMap<SessionId, SessionId>) -> Result<Walk, BlockingError> {
    let mut visited = vec![start];
    let mut current = start;
    loop {
        let Some(&next) = blocked_by.get(&current) else {
            return Ok(Walk {
                head: current,
                visited,
                cycle: false,
            });
        };
        if visited.contains(&next) {
            return Ok(Walk {
                head: next,
                visited,
                cycle: true,
            });
        }
        if visited.len() > MAX_BLOCKING_DEPTH {
            return Err(BlockingError::DepthExceeded {
                session_id: start,
                limit: MAX_BLOCKING_DEPTH,
            });
        }
        visited.push(next);
        current = next;
    }
}

/// Fill in `head_blocker_id`, `total_blocked`, `depth` and `path` for every
/// session. Sessions whose chain is too deep are left unannotated and reported.
pub fn resolve_blocking(sessions: &mut [SessionRecord]) -> Vec<BlockingError> {
    let blocked_by: HashMap<SessionId, SessionId> = sessions
        .iter()
        .filter(|session| session.blocker_id != 0)
        .map(|session| (session.session_id, session.blocker_id))
        .collect();

    let mut totals: HashMap<SessionId, i32> = HashMap::new();
    let mut errors = Vec::new();

    for session in sessions.iter_mut() {
        let start = session.session_id;
        let walk = match walk(start, &blocked_by) {
            Ok(walk) => walk,
            Err(err) => {
                errors.push(err);
                continue;
            }
        };

        for id in walk.visited.iter().skip(1) {
            *totals.entry(*id).or_insert(0) += 1;
        }

        let mut chain: Vec<SessionId> = walk.visited.iter().rev().copied().collect();
        if walk.cycle {
            chain.insert(0, walk.head);
            session.head_blocker_id = walk.head;
        } else if walk.head != start {
            session.head_blocker_id = walk.head;
        }
        session.depth = i32::try_from(walk.visited.len() - 1).unwrap_or(i32::MAX);
        session.path = chain.iter().fold(String::new(), |mut path, id| {
            path.push('/');
            path.push_str(&id.to_string());
            path
        }) + "/";
    }

    for session in sessions.iter_mut() {
        session.total_blocked = totals.get(&session.session_id).copied().unwrap_or(0);
    }
    errors
}

/// Most blocking first, then oldest first. Sessions without a start time go last.
pub fn sort_for_display(sessions: &mut [SessionRecord]) {
    sessions.sort_by(|a, b| {
        b.total_blocked
            .cmp(&a.total_blocked)
            .then_with(|| match (a.start_time, b.start_time) {
                (Some(a), Some(b)) => a.cmp(&b),
                (Some(_), None) => Ordering::Less,
                (None, Some(_)) => Ordering::Greater,
                (None, None) => Ordering::Equal,
            })
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn session(id: SessionId, blocker: SessionId) -> SessionRecord {
        SessionRecord {
            session_id: id,
            blocker_id: blocker,
            ..SessionRecord::default()
        }
    }

    fn by_id(sessions: &[SessionRecord], id: SessionId) -> &SessionRecord {
        sessions.iter().find(|s| s.session_id == id).unwrap()
    }

    #[test]
    fn chain_counts_everyone_below() {
        let mut sessions = vec![session(1, 0), session(2, 1), session(3, 2), session(4, 3)];
        assert!(resolve_blocking(&mut sessions).is_empty());

        let totals: Vec<i32> = sessions.iter().map(|s| s.total_blocked).collect();
        assert_eq!(totals, vec![3, 2, 1, 0]);

        assert_eq!(by_id(&sessions, 1).head_blocker_id, 0);
        for id in 2..=4 {
            assert_eq!(by_id(&sessions, id).head_blocker_id, 1);
        }
        assert_eq!(by_id(&sessions, 1).path, "/1/");
        assert_eq!(by_id(&sessions, 4).path, "/1/2/3/4/");
        assert_eq!(by_id(&sessions, 4).depth, 3);
    }

    #[test]
    fn unrelated_sessions_stay_unblocked() {
        let mut sessions = vec![session(7, 0), session(8, 0)];
        assert!(resolve_blocking(&mut sessions).is_empty());
        for s in &sessions {
            assert_eq!(s.head_blocker_id, 0);
            assert_eq!(s.total_blocked, 0);
            assert_eq!(s.depth, 0);
        }
    }

    #[test]
    fn branching_tree_sums_over_walks() {
        // 1 blocks 2 and 3; 3 blocks 4
        let mut sessions = vec![session(1, 0), session(2, 1), session(3, 1), session(4, 3)];
        assert!(resolve_blocking(&mut sessions).is_empty());
        assert_eq!(by_id(&sessions, 1).total_blocked, 3);
        assert_eq!(by_id(&sessions, 3).total_blocked, 1);
        assert_eq!(by_id(&sessions, 2).total_blocked, 0);
        assert_eq!(by_id(&sessions, 4).path, "/1/3/4/");
    }

    #[test]
    fn cycle_terminates_and_members_head_themselves() {
        let mut sessions = vec![session(10, 12), session(11, 10), session(12, 11)];
        assert!(resolve_blocking(&mut sessions).is_empty());
        for id in [10, 11, 12] {
            let s = by_id(&sessions, id);
            assert_eq!(s.head_blocker_id, id);
            assert_eq!(s.total_blocked, 2);
        }
        assert_eq!(by_id(&sessions, 10).path, "/10/11/12/10/");
    }

    #[test]
    fn session_blocked_by_a_cycle_reports_the_entry_point() {
        let mut sessions = vec![
            session(10, 12),
            session(11, 10),
            session(12, 11),
            session(13, 10),
        ];
        assert!(resolve_blocking(&mut sessions).is_empty());
        assert_eq!(by_id(&sessions, 13).head_blocker_id, 10);
        assert_eq!(by_id(&sessions, 10).total_blocked, 3);
    }

    #[test]
    fn deep_chain_reports_depth_errors() {
        let mut sessions: Vec<SessionRecord> =
            (1..=190).map(|id| session(id, if id == 1 { 0 } else { id - 1 })).collect();
        let errors = resolve_blocking(&mut sessions);

        assert!(!errors.is_empty());
        assert!(errors.contains(&BlockingError::DepthExceeded {
            session_id: 190,
            limit: MAX_BLOCKING_DEPTH,
        }));
        assert!(!errors.iter().any(|err| matches!(
            err,
            BlockingError::DepthExceeded { session_id: 50, .. }
        )));

        let deepest = by_id(&sessions, 190);
        assert_eq!(deepest.head_blocker_id, 0);
        assert!(deepest.path.is_empty());
        assert_eq!(by_id(&sessions, 50).head_blocker_id, 1);
    }

    #[test]
    fn display_order_is_most_blocking_then_oldest() {
        let at = |minute| Some(Utc.with_ymd_and_hms(2024, 5, 1, 10, minute, 0).unwrap());
        let mut sessions = vec![
            SessionRecord {
                start_time: at(5),
                ..session(1, 0)
            },
            SessionRecord {
                start_time: None,
                ..session(2, 0)
            },
            SessionRecord {
                start_time: at(1),
                ..session(3, 0)
            },
            SessionRecord {
                start_time: at(9),
                total_blocked: 2,
                ..session(4, 0)
            },
        ];
        sort_for_display(&mut sessions);
        let order: Vec<SessionId> = sessions.iter().map(|s| s.session_id).collect();
        assert_eq!(order, vec![4, 3, 1, 2]);
    }
}
