use std::collections::HashMap;
use std::{str::FromStr, time::Duration};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgConnectOptions, PgPoolOptions, PgRow};
use sqlx::{PgPool, Row};
use tracing::{debug, error, instrument};

use super::{
    ActiveRequest, Connector, DbError, InstanceConnection, InstanceIdentity, RequestSample,
    ServerInfo, SessionId, SessionRow,
};
use crate::config::StatementTimeouts;

const APPLICATION_NAME: &str = "waitmon";

const SERVER_INFO_SQL: &str = r#"
SELECT
    current_setting('server_version_num')::int AS version_num,
    current_setting('server_version') AS version_text,
    COALESCE(NULLIF(current_setting('cluster_name'), ''), current_database()) AS server_name,
    COALESCE(host(inet_server_addr()), 'local') || ':' || current_setting('port') AS domain,
    pg_postmaster_start_time() AS booted
"#;

// Identity and the server clock come back even when nothing is running: one
// row with NULL request columns.
const ACTIVE_REQUESTS_SQL: &str = r#"
WITH identity AS (
    SELECT
        COALESCE(NULLIF(current_setting('cluster_name'), ''), current_database()) AS server_name,
        COALESCE(host(inet_server_addr()), 'local') || ':' || current_setting('port') AS domain,
        pg_postmaster_start_time() AS booted,
        clock_timestamp() AS sampled_at
),
active AS (
    SELECT
        a.pid,
        a.query_start AS started,
        COALESCE(a.wait_event_type || ':' || a.wait_event, '') AS wait_type,
        a.state_change
    FROM pg_stat_activity a
    WHERE a.pid <> pg_backend_pid()
      AND a.backend_type = 'client backend'
      AND a.state IS DISTINCT FROM 'idle'
)
SELECT
    i.server_name, i.domain, i.booted, i.sampled_at,
    act.pid, act.started, act.wait_type, act.state_change
FROM identity i
LEFT JOIN active act ON true
"#;

// Idle sessions are listed only while they block someone. Only lock waits carry
// a start time (`pg_locks.waitstart`, PostgreSQL 14+, read through `to_jsonb` so
// older servers get NULL); every other wait reports 0 ms.
const SESSIONS_SQL: &str = r#"
WITH blockers AS (
    SELECT DISTINCT unnest(pg_blocking_pids(pid)) AS pid
    FROM pg_stat_activity
)
SELECT
    a.pid AS session_id,
    COALESCE((pg_blocking_pids(a.pid))[1], 0) AS blocker_id,
    COALESCE(a.query_start, a.backend_start) AS start_time,
    COALESCE(a.state, '') AS status,
    COALESCE(a.datname, '') AS database,
    COALESCE(a.wait_event_type || ':' || a.wait_event, '') AS wait_type,
    COALESCE((
        SELECT (EXTRACT(EPOCH FROM
            clock_timestamp() - min((to_jsonb(l) ->> 'waitstart')::timestamptz)
        ) * 1000)::bigint
        FROM pg_locks l
        WHERE l.pid = a.pid AND NOT l.granted
    ), 0) AS wait_time_ms,
    COALESCE((
        SELECT l.locktype || COALESCE(':' || l.relation::regclass::text, '')
        FROM pg_locks l
        WHERE l.pid = a.pid AND NOT l.granted
        LIMIT 1
    ), '') AS wait_resource,
    COALESCE(host(a.client_addr), a.client_hostname, '') AS host_name,
    COALESCE(a.application_name, '') AS app_name,
    COALESCE(a.usename::text, '') AS login_name,
    upper(split_part(ltrim(COALESCE(a.query, '')), ' ', 1)) AS command,
    CASE WHEN a.xact_start IS NULL THEN 0 ELSE 1 END AS open_transaction_count,
    COALESCE(a.query, '') AS statement_text,
    COALESCE(
        EXTRACT(EPOCH FROM clock_timestamp() - COALESCE(a.query_start, a.backend_start))::bigint,
        0
    ) AS run_time_seconds
FROM pg_stat_activity a
WHERE a.pid <> pg_backend_pid()
  AND a.backend_type = 'client backend'
  AND (a.state IS DISTINCT FROM 'idle' OR a.pid IN (SELECT pid FROM blockers))
"#;

/// Opens read-only, single-connection pools against PostgreSQL instances.
#[derive(Debug, Clone, Default)]
pub struct PgConnector {
    timeouts: StatementTimeouts,
}

impl PgConnector {
    pub fn new(timeouts: StatementTimeouts) -> Self {
        Self { timeouts }
    }

    fn connect_options(&self, connection_string: &str) -> Result<PgConnectOptions, DbError> {
        Ok(PgConnectOptions::from_str(connection_string)
            .map_err(DbError::InvalidConnectionString)?
            .application_name(APPLICATION_NAME)
            .options([
                (
                    "statement_timeout",
                    self.timeouts.statement_timeout_ms.to_string(),
                ),
                ("lock_timeout", self.timeouts.lock_timeout_ms.to_string()),
            ]))
    }
}

#[async_trait]
impl Connector for PgConnector {
    async fn open(&self, connection_string: &str) -> Result<Box<dyn InstanceConnection>, DbError> {
        let options = self.connect_options(connection_string)?;
        Ok(Box::new(PgInstanceConnection::new(options)))
    }
}

fn build_pool(options: PgConnectOptions) -> PgPool {
    PgPoolOptions::new()
        .max_connections(1)
        .min_connections(0)
        .acquire_timeout(Duration::from_secs(5))
        .after_connect(|conn, _meta| {
            Box::pin(async move {
                sqlx::query("SET SESSION CHARACTERISTICS AS TRANSACTION READ ONLY")
                    .execute(&mut *conn)
                    .await
                    .map_err(|err| {
                        error!(error = ?err, "failed to enforce read-only session");
                        err
                    })?;
                Ok(())
            })
        })
        .connect_lazy_with(options)
}

/// One backend as reported by the activity query, before wait timing.
#[derive(Debug, Clone, PartialEq, Eq)]
struct ActivityRow {
    pid: SessionId,
    started: Option<DateTime<Utc>>,
    wait_type: String,
    state_change: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
struct OpenWait {
    started: Option<DateTime<Utc>>,
    wait_type: String,
    since: DateTime<Utc>,
}

/// PostgreSQL shows which event a backend waits on but not since when.
///
/// The timer remembers, per backend and request, when the current wait was
/// first seen and reports the time spent in it since then. A wait that was not
/// visible in the previous sample began after that sample, so a newly seen wait
/// is never credited more than one sampling interval.
#[derive(Debug, Default)]
struct WaitTimer {
    last_sampled: Option<DateTime<Utc>>,
    open: HashMap<SessionId, OpenWait>,
}

impl WaitTimer {
    fn observe(&mut self, sampled_at: DateTime<Utc>, rows: Vec<ActivityRow>) -> Vec<ActiveRequest> {
        let mut open = HashMap::with_capacity(rows.len());
        let mut requests = Vec::with_capacity(rows.len());

        for row in rows {
            let mut wait_time_ms = 0;
            if !row.wait_type.is_empty() {
                let since = match self.open.remove(&row.pid) {
                    Some(wait) if wait.wait_type == row.wait_type && wait.started == row.started => {
                        wait.since
                    }
                    _ => wait_start(row.state_change, self.last_sampled, sampled_at),
                };
                wait_time_ms = (sampled_at - since).num_milliseconds().max(0);
                open.insert(
                    row.pid,
                    OpenWait {
                        started: row.started,
                        wait_type: row.wait_type.clone(),
                        since,
                    },
                );
            }
            requests.push(ActiveRequest {
                session_id: row.pid,
                started: row.started,
                wait_type: row.wait_type,
                wait_time_ms,
            });
        }

        self.open = open;
        self.last_sampled = Some(sampled_at);
        requests
    }
}

// latest of the state change and the previous sample, never after `sampled_at`
fn wait_start(
    state_change: Option<DateTime<Utc>>,
    last_sampled: Option<DateTime<Utc>>,
    sampled_at: DateTime<Utc>,
) -> DateTime<Utc> {
    state_change
        .into_iter()
        .chain(last_sampled)
        .max()
        .map_or(sampled_at, |start| start.min(sampled_at))
}

/// One monitored instance. The pool connects on first use and is rebuilt by `reset`.
pub struct PgInstanceConnection {
    options: PgConnectOptions,
    pool: Option<PgPool>,
    timer: WaitTimer,
}

impl PgInstanceConnection {
    pub fn new(options: PgConnectOptions) -> Self {
        let pool = build_pool(options.clone());
        Self {
            options,
            pool: Some(pool),
            timer: WaitTimer::default(),
        }
    }

    fn pool(&self) -> Result<&PgPool, DbError> {
        self.pool.as_ref().ok_or(DbError::Closed)
    }
}

fn identity_from_row(row: &PgRow, query: &'static str) -> Result<InstanceIdentity, DbError> {
    Ok(InstanceIdentity {
        domain: row.try_get("domain").map_err(DbError::query(query))?,
        server_name: row.try_get("server_name").map_err(DbError::query(query))?,
        booted: row.try_get("booted").map_err(DbError::query(query))?,
    })
}

#[instrument(skip_all)]
async fn fetch_server_info(pool: &PgPool) -> Result<ServerInfo, DbError> {
    const QUERY: &str = "server_info";
    let row = sqlx::query(SERVER_INFO_SQL)
        .fetch_one(pool)
        .await
        .map_err(DbError::query(QUERY))?;

    let version_num: i32 = row.try_get("version_num").map_err(DbError::query(QUERY))?;
    Ok(ServerInfo {
        identity: identity_from_row(&row, QUERY)?,
        major_version: u32::try_from(version_num / 10_000).unwrap_or(0),
        version_text: row.try_get("version_text").map_err(DbError::query(QUERY))?,
    })
}

struct Activity {
    identity: InstanceIdentity,
    sampled_at: DateTime<Utc>,
    rows: Vec<ActivityRow>,
}

#[instrument(skip_all)]
async fn fetch_activity(pool: &PgPool) -> Result<Activity, DbError> {
    const QUERY: &str = "active_requests";
    let rows = sqlx::query(ACTIVE_REQUESTS_SQL)
        .fetch_all(pool)
        .await
        .map_err(DbError::query(QUERY))?;

    let Some(first) = rows.first() else {
        return Err(DbError::Unavailable("identity row missing".into()));
    };
    let identity = identity_from_row(first, QUERY)?;
    let sampled_at: DateTime<Utc> = first.try_get("sampled_at").map_err(DbError::query(QUERY))?;

    let mut activity = Vec::with_capacity(rows.len());
    for row in &rows {
        let pid: Option<SessionId> = row.try_get("pid").map_err(DbError::query(QUERY))?;
        let Some(pid) = pid else {
            continue;
        };
        let wait_type: Option<String> = row.try_get("wait_type").map_err(DbError::query(QUERY))?;
        activity.push(ActivityRow {
            pid,
            started: row.try_get("started").map_err(DbError::query(QUERY))?,
            wait_type: wait_type.unwrap_or_default(),
            state_change: row.try_get("state_change").map_err(DbError::query(QUERY))?,
        });
    }
    debug!(requests = activity.len(), "sampled active requests");
    Ok(Activity {
        identity,
        sampled_at,
        rows: activity,
    })
}

#[instrument(skip_all)]
async fn fetch_sessions(pool: &PgPool) -> Result<Vec<SessionRow>, DbError> {
    const QUERY: &str = "sessions";
    let rows = sqlx::query(SESSIONS_SQL)
        .fetch_all(pool)
        .await
        .map_err(DbError::query(QUERY))?;

    let mut sessions = Vec::with_capacity(rows.len());
    for row in rows {
        sessions.push(SessionRow {
            session_id: row.try_get("session_id").map_err(DbError::query(QUERY))?,
            blocker_id: row.try_get("blocker_id").map_err(DbError::query(QUERY))?,
            start_time: row.try_get("start_time").map_err(DbError::query(QUERY))?,
            status: row.try_get("status").map_err(DbError::query(QUERY))?,
            database: row.try_get("database").map_err(DbError::query(QUERY))?,
            wait_type: row.try_get("wait_type").map_err(DbError::query(QUERY))?,
            wait_time_ms: row.try_get("wait_time_ms").map_err(DbError::query(QUERY))?,
            wait_resource: row.try_get("wait_resource").map_err(DbError::query(QUERY))?,
            host_name: row.try_get("host_name").map_err(DbError::query(QUERY))?,
            app_name: row.try_get("app_name").map_err(DbError::query(QUERY))?,
            login_name: row.try_get("login_name").map_err(DbError::query(QUERY))?,
            command: row.try_get("command").map_err(DbError::query(QUERY))?,
            open_transaction_count: row
                .try_get("open_transaction_count")
                .map_err(DbError::query(QUERY))?,
            statement_text: row.try_get("statement_text").map_err(DbError::query(QUERY))?,
            run_time_seconds: row.try_get("run_time_seconds").map_err(DbError::query(QUERY))?,
        });
    }
    Ok(sessions)
}

#[async_trait]
impl InstanceConnection for PgInstanceConnection {
    async fn server_info(&mut self) -> Result<ServerInfo, DbError> {
        fetch_server_info(self.pool()?).await
    }

    async fn active_requests(&mut self) -> Result<RequestSample, DbError> {
        let activity = fetch_activity(self.pool()?).await?;
        let requests = self.timer.observe(activity.sampled_at, activity.rows);
        Ok(RequestSample::new(activity.identity, requests))
    }

    async fn sessions(&mut self) -> Result<Vec<SessionRow>, DbError> {
        fetch_sessions(self.pool()?).await
    }

    async fn reset(&mut self) -> Result<(), DbError> {
        if let Some(old) = self.pool.take() {
            old.close().await;
        }
        self.pool = Some(build_pool(self.options.clone()));
        Ok(())
    }

    async fn close(&mut self) -> Result<(), DbError> {
        if let Some(pool) = self.pool.take() {
            pool.close().await;
        }
        Ok(())
    }
}
