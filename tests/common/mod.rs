#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use waitmon::clock::SystemClock;
use waitmon::config::PollingConfig;
use waitmon::db::{
    ActiveRequest, Connector, DbError, InstanceConnection, InstanceIdentity, RequestSample,
    ServerInfo, SessionRow,
};
use waitmon::metrics::AppMetrics;
use waitmon::poller::{PollContext, PollState, PollerRegistry, PollingSession};
use waitmon::repository::{HistorySettings, Repository};
use waitmon::waits::WaitMapping;

type Step<T> = Result<T, String>;

/// Replays queued results; the last queued result repeats forever.
#[derive(Default)]
pub struct Script {
    pub server_info: VecDeque<Step<ServerInfo>>,
    pub samples: VecDeque<Step<RequestSample>>,
    pub sessions: Vec<SessionRow>,
}

fn next<T: Clone>(queue: &mut VecDeque<Step<T>>) -> Result<T, DbError> {
    let step = if queue.len() > 1 {
        queue.pop_front()
    } else {
        queue.front().cloned()
    };
    match step {
        Some(Ok(value)) => Ok(value),
        Some(Err(message)) => Err(DbError::Unavailable(message)),
        None => Err(DbError::Unavailable("script exhausted".into())),
    }
}

#[derive(Default)]
pub struct Counters {
    pub opens: AtomicUsize,
    pub resets: AtomicUsize,
    pub closes: AtomicUsize,
}

#[derive(Clone, Default)]
pub struct FakeConnector {
    pub script: Arc<Mutex<Script>>,
    pub counters: Arc<Counters>,
}

impl FakeConnector {
    pub fn new(script: Script) -> Self {
        Self {
            script: Arc::new(Mutex::new(script)),
            counters: Arc::new(Counters::default()),
        }
    }

    pub fn opens(&self) -> usize {
        self.counters.opens.load(Ordering::SeqCst)
    }

    pub fn resets(&self) -> usize {
        self.counters.resets.load(Ordering::SeqCst)
    }

    pub fn closes(&self) -> usize {
        self.counters.closes.load(Ordering::SeqCst)
    }
}

struct FakeConnection {
    script: Arc<Mutex<Script>>,
    counters: Arc<Counters>,
}

#[async_trait]
impl Connector for FakeConnector {
    async fn open(&self, _connection_string: &str) -> Result<Box<dyn InstanceConnection>, DbError> {
        self.counters.opens.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(FakeConnection {
            script: self.script.clone(),
            counters: self.counters.clone(),
        }))
    }
}

#[async_trait]
impl InstanceConnection for FakeConnection {
    async fn server_info(&mut self) -> Result<ServerInfo, DbError> {
        next(&mut self.script.lock().server_info)
    }

    async fn active_requests(&mut self) -> Result<RequestSample, DbError> {
        next(&mut self.script.lock().samples)
    }

    async fn sessions(&mut self) -> Result<Vec<SessionRow>, DbError> {
        Ok(self.script.lock().sessions.clone())
    }

    async fn reset(&mut self) -> Result<(), DbError> {
        self.counters.resets.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn close(&mut self) -> Result<(), DbError> {
        self.counters.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

pub fn identity() -> InstanceIdentity {
    InstanceIdentity {
        domain: "db-a:5432".into(),
        server_name: "main".into(),
        booted: Utc.with_ymd_and_hms(2024, 5, 1, 6, 0, 0).unwrap(),
    }
}

pub fn server_info(major_version: u32) -> ServerInfo {
    ServerInfo {
        identity: identity(),
        major_version,
        version_text: format!("{major_version}.2"),
    }
}

pub fn sample(requests: &[(i32, &str, i64)]) -> RequestSample {
    let started = Utc.with_ymd_and_hms(2024, 5, 1, 9, 0, 0).unwrap();
    RequestSample::new(
        identity(),
        requests.iter().map(|(id, wait, ms)| ActiveRequest {
            session_id: *id,
            started: Some(started),
            wait_type: wait.to_string(),
            wait_time_ms: *ms,
        }),
    )
}

pub fn repository() -> Arc<Repository> {
    Arc::new(Repository::new(
        HistorySettings::default(),
        Arc::new(SystemClock),
        None,
    ))
}

pub fn context(connector: &FakeConnector, repository: Arc<Repository>) -> PollContext {
    PollContext {
        repository,
        mapping: Arc::new(WaitMapping::default()),
        connector: Arc::new(connector.clone()),
        clock: Arc::new(SystemClock),
        metrics: AppMetrics::new().expect("metrics"),
        polling: PollingConfig::default(),
    }
}

pub fn registry(connector: &FakeConnector, repository: Arc<Repository>) -> PollerRegistry {
    PollerRegistry::new(context(connector, repository), CancellationToken::new())
}

/// Let paused time run until `session` reaches `state`.
pub async fn wait_for_state(session: &PollingSession, state: PollState) {
    for _ in 0..2_000 {
        if session.status().state == state {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!(
        "session {} never reached {:?}; last status {:?}",
        session.key(),
        state,
        session.status()
    );
}
