//! Driver seam between the pollers and a monitored database instance.

mod postgres;

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;

pub use postgres::{PgConnector, PgInstanceConnection};

pub type SessionId = i32;

#[derive(Debug, Error)]
pub enum DbError {
    #[error("invalid connection string: {0}")]
    InvalidConnectionString(#[source] sqlx::Error),
    #[error("{query} query failed: {source}")]
    Query {
        query: &'static str,
        #[source]
        source: sqlx::Error,
    },
    #[error("connection is closed")]
    Closed,
    #[error("{0}")]
    Unavailable(String),
}

impl DbError {
    pub(crate) fn query(query: &'static str) -> impl FnOnce(sqlx::Error) -> Self {
        move |source| Self::Query { query, source }
    }
}

/// Who the instance is. A change in any field means the server was replaced
/// or restarted and per-session counters start over.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct InstanceIdentity {
    pub domain: String,
    pub server_name: String,
    pub booted: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerInfo {
    pub identity: InstanceIdentity,
    pub major_version: u32,
    pub version_text: String,
}

/// One in-flight request as seen by a single sampling tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActiveRequest {
    pub session_id: SessionId,
    pub started: Option<DateTime<Utc>>,
    /// Empty when the request is not waiting.
    pub wait_type: String,
    pub wait_time_ms: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestSample {
    pub identity: InstanceIdentity,
    pub requests: HashMap<SessionId, ActiveRequest>,
}

impl RequestSample {
    pub fn new(identity: InstanceIdentity, requests: impl IntoIterator<Item = ActiveRequest>) -> Self {
        Self {
            identity,
            requests: requests
                .into_iter()
                .map(|request| (request.session_id, request))
                .collect(),
        }
    }
}

/// Raw row of the session listing, before blocking resolution.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionRow {
    pub session_id: SessionId,
    /// 0 when the session is not blocked.
    pub blocker_id: SessionId,
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
}

/// A live connection to one monitored instance.
#[async_trait]
pub trait InstanceConnection: Send + Sync {
    async fn server_info(&mut self) -> Result<ServerInfo, DbError>;

    async fn active_requests(&mut self) -> Result<RequestSample, DbError>;

    async fn sessions(&mut self) -> Result<Vec<SessionRow>, DbError>;

    /// Drop cached statements and pooled connections; the next query reconnects.
    async fn reset(&mut self) -> Result<(), DbError>;

    async fn close(&mut self) -> Result<(), DbError>;
}

#[async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn open(&self, connection_string: &str) -> Result<Box<dyn InstanceConnection>, DbError>;
}
