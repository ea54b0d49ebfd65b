use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, instrument, warn};

use super::{SessionRecord, resolve_blocking, sort_for_display};
use crate::db::{DbError, SessionRow};
use crate::poller::PollerRegistry;
use crate::waits::WaitMapping;

/// Statement text longer than this many characters is cut.
pub const STATEMENT_TEXT_LIMIT: usize = 2000;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("unknown instance: {0}")]
    UnknownInstance(String),
    #[error("session query failed for {key}: {source}")]
    Db {
        key: String,
        #[source]
        source: DbError,
    },
}

/// Current sessions of one instance, annotated and ordered for display.
#[derive(Debug, Clone, Serialize)]
pub struct SessionSnapshot {
    pub instance: String,
    pub collected_at: DateTime<Utc>,
    pub sessions: Vec<SessionRecord>,
    /// Blocking chains that could not be resolved.
    pub errors: Vec<String>,
}

/// On-demand session listing. Each call opens its own short-lived connection.
pub struct SessionSnapshotService {
    registry: Arc<PollerRegistry>,
}

impl SessionSnapshotService {
    pub fn new(registry: Arc<PollerRegistry>) -> Self {
        Self { registry }
    }

    #[instrument(skip(self))]
    pub async fn get(&self, key: &str) -> Result<SessionSnapshot, SessionError> {
        let connection_string = self
            .registry
            .connection_string(key)
            .ok_or_else(|| SessionError::UnknownInstance(key.to_string()))?;
        let ctx = self.registry.context();
        let db_error = |source| SessionError::Db {
            key: key.to_string(),
            source,
        };

        let mut conn = ctx
            .connector
            .open(&connection_string)
            .await
            .map_err(db_error)?;
        let rows = conn.sessions().await;
        if let Err(err) = conn.close().await {
            debug!(key, error = %err, "failed to close session connection");
        }
        let rows = rows.map_err(db_error)?;

        Ok(build_snapshot(key, rows, &ctx.mapping, ctx.clock.now()))
    }
}

/// Resolve blocking, drop idle noise, order and trim.
pub fn build_snapshot(
    key: &str,
    rows: Vec<SessionRow>,
    mapping: &WaitMapping,
    collected_at: DateTime<Utc>,
) -> SessionSnapshot {
    let mut sessions: Vec<SessionRecord> = rows.into_iter().map(SessionRecord::from).collect();

    let errors = resolve_blocking(&mut sessions);
    for err in &errors {
        warn!(key, error = %err, "blocking chain not resolved");
    }

    sessions.retain(|session| !is_idle_noise(session, mapping));
    sort_for_display(&mut sessions);
    for session in &mut sessions {
        session.statement_text = trim_sql(&session.statement_text, STATEMENT_TEXT_LIMIT);
    }

    SessionSnapshot {
        instance: key.to_string(),
        collected_at,
        sessions,
        errors: errors.iter().map(ToString::to_string).collect(),
    }
}

// sleeping in an excluded wait and involved in nothing
fn is_idle_noise(session: &SessionRecord, mapping: &WaitMapping) -> bool {
    let excluded = mapping
        .lookup(&session.wait_type)
        .is_some_and(|rule| rule.excluded);
    excluded
        && session.blocker_id == 0
        && session.total_blocked == 0
        && session.open_transaction_count == 0
}

/// Collapse whitespace runs, drop replacement characters, and cut to `limit` chars.
pub fn trim_sql(text: &str, limit: usize) -> String {
    let mut out = String::with_capacity(text.len().min(limit));
    let mut count = 0;
    for word in text.split_whitespace() {
        let word = word.replace('\u{FFFD}', "");
        if word.is_empty() {
            continue;
        }
        if count > 0 {
            if count == limit {
                break;
            }
            out.push(' ');
            count += 1;
        }
        for ch in word.chars() {
            if count == limit {
                return out;
            }
            out.push(ch);
            count += 1;
        }
    }
    out
}

/// Compact run time: seconds up to 5 minutes, then minutes, hours past 3
/// hours, days past 72 hours.
pub fn run_time_text(seconds: i64) -> String {
    match seconds {
        s if s > 259_200 => format!("{}d", s / 86_400),
        s if s > 10_800 => format!("{}h", s / 3_600),
        s if s > 300 => format!("{}m", s / 60),
        s if s >= 0 => format!("{s}s"),
        s => format!("Invalid({s})"),
    }
}
