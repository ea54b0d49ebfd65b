use std::hash::Hasher;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use fnv::FnvHasher;
use parking_lot::{Mutex as SyncMutex, RwLock};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use super::PollContext;
use super::delta::{RequestTracker, WaitAccumulator};
use crate::db::{Connector, DbError, InstanceConnection, ServerInfo};

/// Oldest server major version the wait queries support.
pub const MIN_MAJOR_VERSION: u32 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PollState {
    Disconnected,
    Connecting,
    Connected,
    Retrying,
    /// The server is too old. Never retried.
    Unsupported,
    Stopped,
}

impl PollState {
    pub fn code(self) -> i64 {
        match self {
            PollState::Disconnected => 0,
            PollState::Connecting => 1,
            PollState::Connected => 2,
            PollState::Retrying => 3,
            PollState::Unsupported => 4,
            PollState::Stopped => 5,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            PollState::Disconnected => "disconnected",
            PollState::Connecting => "connecting",
            PollState::Connected => "connected",
            PollState::Retrying => "retrying",
            PollState::Unsupported => "unsupported",
            PollState::Stopped => "stopped",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, PollState::Unsupported | PollState::Stopped)
    }
}

/// Point-in-time view of a polling session, readable while a query is in flight.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PollStatus {
    pub state: PollState,
    pub last_error: Option<String>,
    pub state_since: DateTime<Utc>,
    pub last_sample_at: Option<DateTime<Utc>>,
    pub last_emit_at: Option<DateTime<Utc>>,
    pub server_name: Option<String>,
}

impl PollStatus {
    fn new(now: DateTime<Utc>) -> Self {
        Self {
            state: PollState::Disconnected,
            last_error: None,
            state_since: now,
            last_sample_at: None,
            last_emit_at: None,
            server_name: None,
        }
    }
}

#[derive(Debug, Error)]
pub enum SetupError {
    #[error("server version {version} (major {found}) is older than the supported minimum {minimum}")]
    LowVersion {
        found: u32,
        minimum: u32,
        version: String,
    },
    #[error(transparent)]
    Db(#[from] DbError),
}

/// Deterministic per-key start offset in `[0, 1000)` ms so sessions started
/// together do not query in lockstep.
pub fn jitter_for(key: &str) -> Duration {
    let mut hasher = FnvHasher::default();
    hasher.write(key.as_bytes());
    Duration::from_millis(hasher.finish() % 1000)
}

/// Open a connection and check that the server can be monitored.
pub async fn setup(
    connector: &dyn Connector,
    connection_string: &str,
) -> Result<(Box<dyn InstanceConnection>, ServerInfo), SetupError> {
    let mut conn = connector.open(connection_string).await?;
    let result = match conn.server_info().await {
        Ok(info) if info.major_version < MIN_MAJOR_VERSION => Err(SetupError::LowVersion {
            found: info.major_version,
            minimum: MIN_MAJOR_VERSION,
            version: info.version_text,
        }),
        Ok(info) => return Ok((conn, info)),
        Err(err) => Err(SetupError::Db(err)),
    };
    if let Err(err) = conn.close().await {
        debug!(error = %err, "failed to close connection after setup failure");
    }
    result
}

#[derive(Debug)]
enum Transition {
    Entered,
    Changed,
    Unchanged,
}

/// Remembers the current error so only changes get logged.
#[derive(Debug, Default)]
struct ErrorTracker {
    current: Option<String>,
    since: Option<DateTime<Utc>>,
}

impl ErrorTracker {
    fn fail(&mut self, message: &str, now: DateTime<Utc>) -> Transition {
        match self.current.as_deref() {
            None => {
                self.current = Some(message.to_string());
                self.since = Some(now);
                Transition::Entered
            }
            Some(existing) if existing == message => Transition::Unchanged,
            Some(_) => {
                self.current = Some(message.to_string());
                Transition::Changed
            }
        }
    }

    /// Clears the error; returns how long it lasted if there was one.
    fn recover(&mut self, now: DateTime<Utc>) -> Option<chrono::Duration> {
        self.current.take()?;
        self.since.take().map(|since| now - since)
    }
}

struct SessionCore {
    conn: Box<dyn InstanceConnection>,
    tracker: RequestTracker,
    accumulator: WaitAccumulator,
    errors: ErrorTracker,
}

/// One polling task per monitored instance.
pub struct PollingSession {
    key: String,
    status: Arc<RwLock<PollStatus>>,
    token: CancellationToken,
    handle: SyncMutex<Option<JoinHandle<()>>>,
}

impl PollingSession {
    /// Spawn the session. It connects in the background and keeps retrying
    /// until it succeeds, finds an unsupported server, or is stopped.
    pub fn start(
        key: impl Into<String>,
        connection_string: impl Into<String>,
        ctx: PollContext,
        parent: &CancellationToken,
    ) -> Self {
        let key = key.into();
        let token = parent.child_token();
        let status = Arc::new(RwLock::new(PollStatus::new(ctx.clock.now())));
        ctx.metrics.set_poll_state(&key, PollState::Disconnected);

        let worker = Arc::new(Worker {
            key: key.clone(),
            connection_string: connection_string.into(),
            ctx,
            status: status.clone(),
            token: token.clone(),
        });
        let handle = tokio::spawn(worker.run());

        Self {
            key,
            status,
            token,
            handle: SyncMutex::new(Some(handle)),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn status(&self) -> PollStatus {
        self.status.read().clone()
    }

    /// Request cancellation. Activities stop at their next tick.
    pub fn stop(&self) {
        self.token.cancel();
    }

    /// Wait for the session task to finish. Returns immediately on later calls.
    pub async fn join(&self) {
        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            if let Err(err) = handle.await {
                error!(key = %self.key, error = ?err, "polling session task failed");
            }
        }
    }
}

impl Drop for PollingSession {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

struct Worker {
    key: String,
    connection_string: String,
    ctx: PollContext,
    status: Arc<RwLock<PollStatus>>,
    token: CancellationToken,
}

impl Worker {
    fn set_state(&self, state: PollState) {
        {
            let mut status = self.status.write();
            if status.state != state {
                status.state = state;
                status.state_since = self.ctx.clock.now();
            }
        }
        self.ctx.metrics.set_poll_state(&self.key, state);
    }

    fn server_name(&self) -> String {
        self.status.read().server_name.clone().unwrap_or_default()
    }

    /// Record a failure. Returns `true` when this starts a new error period.
    fn failed(&self, errors: &mut ErrorTracker, message: String, stage: &'static str) -> bool {
        let server = self.server_name();
        let entered = match errors.fail(&message, self.ctx.clock.now()) {
            Transition::Entered => {
                error!(key = %self.key, server = %server, stage, error = %message, "polling failed");
                true
            }
            Transition::Changed => {
                warn!(key = %self.key, server = %server, stage, error = %message, "polling error changed");
                false
            }
            Transition::Unchanged => false,
        };
        self.status.write().last_error = Some(message);
        self.set_state(PollState::Retrying);
        entered
    }

    fn recovered(&self, errors: &mut ErrorTracker) {
        if let Some(down) = errors.recover(self.ctx.clock.now()) {
            info!(
                key = %self.key,
                server = %self.server_name(),
                down_secs = down.num_seconds(),
                "polling recovered"
            );
            self.status.write().last_error = None;
        }
        self.set_state(PollState::Connected);
    }

    async fn run(self: Arc<Self>) {
        debug!(key = %self.key, "starting polling session");
        self.set_state(PollState::Connecting);

        let mut errors = ErrorTracker::default();
        let Some((conn, info)) = self.connect(&mut errors).await else {
            return;
        };

        self.status.write().server_name = Some(info.identity.server_name.clone());
        info!(
            key = %self.key,
            server = %info.identity.server_name,
            version = %info.version_text,
            "polling session connected"
        );
        self.recovered(&mut errors);

        let core = Arc::new(Mutex::new(SessionCore {
            conn,
            tracker: RequestTracker::new(),
            accumulator: WaitAccumulator::new(),
            errors,
        }));

        let polling = &self.ctx.polling;
        let jitter = jitter_for(&self.key);
        let now = Instant::now();
        let sample_start = now + jitter;
        let emit_start = now + jitter + polling.emit_offset + polling.emit_interval;

        let sampler = tokio::spawn(self.clone().sample_loop(core.clone(), sample_start));
        let emitter = tokio::spawn(self.clone().emit_loop(core.clone(), emit_start));
        for (activity, handle) in [("sampling", sampler), ("emission", emitter)] {
            if let Err(err) = handle.await {
                error!(key = %self.key, activity, error = ?err, "polling activity failed");
            }
        }

        let mut core = core.lock().await;
        if let Err(err) = core.conn.close().await {
            debug!(key = %self.key, error = %err, "failed to close connection");
        }
        self.set_state(PollState::Stopped);
        info!(key = %self.key, "polling session stopped");
    }

    /// Retry `setup` every `retry_interval` until it succeeds. `None` means the
    /// session ended (stopped or unsupported).
    async fn connect(
        &self,
        errors: &mut ErrorTracker,
    ) -> Option<(Box<dyn InstanceConnection>, ServerInfo)> {
        loop {
            let attempt = tokio::select! {
                _ = self.token.cancelled() => {
                    self.set_state(PollState::Stopped);
                    return None;
                }
                attempt = setup(self.ctx.connector.as_ref(), &self.connection_string) => attempt,
            };

            match attempt {
                Ok(connected) => return Some(connected),
                Err(err @ SetupError::LowVersion { .. }) => {
                    warn!(key = %self.key, error = %err, "server not supported; polling disabled");
                    self.status.write().last_error = Some(err.to_string());
                    self.set_state(PollState::Unsupported);
                    return None;
                }
                Err(err) => {
                    self.failed(errors, err.to_string(), "setup");
                }
            }

            tokio::select! {
                _ = self.token.cancelled() => {
                    self.set_state(PollState::Stopped);
                    return None;
                }
                _ = time::sleep(self.ctx.polling.retry_interval) => {}
            }
        }
    }

    async fn sample_loop(self: Arc<Self>, core: Arc<Mutex<SessionCore>>, start: Instant) {
        let mut ticker = time::interval_at(start, self.ctx.polling.sample_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = self.token.cancelled() => break,
                _ = ticker.tick() => {}
            }
            let mut core = core.lock().await;
            self.sample(&mut core).await;
        }
        trace!(key = %self.key, "sampling stopped");
    }

    async fn emit_loop(self: Arc<Self>, core: Arc<Mutex<SessionCore>>, start: Instant) {
        let mut ticker = time::interval_at(start, self.ctx.polling.emit_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = self.token.cancelled() => break,
                _ = ticker.tick() => {}
            }
            let mut core = core.lock().await;
            self.emit(&mut core).await;
        }
        trace!(key = %self.key, "emission stopped");
    }

    async fn sample(&self, core: &mut SessionCore) {
        let started = Instant::now();
        let result = core.conn.active_requests().await;
        let elapsed = started.elapsed();

        match result {
            Ok(sample) => {
                self.ctx.metrics.observe_sample(&self.key, elapsed, true);
                let server = sample.identity.server_name.clone();
                for delta in core.tracker.observe(sample) {
                    core.accumulator.add(&self.ctx.mapping, &delta);
                }
                {
                    let mut status = self.status.write();
                    status.last_sample_at = Some(self.ctx.clock.now());
                    status.server_name = Some(server);
                }
                self.recovered(&mut core.errors);
            }
            Err(err) => {
                self.ctx.metrics.observe_sample(&self.key, elapsed, false);
                if self.failed(&mut core.errors, err.to_string(), "sample") {
                    if let Err(reset_err) = core.conn.reset().await {
                        warn!(key = %self.key, error = %reset_err, "failed to reset connection");
                    }
                }
            }
        }
    }

    async fn emit(&self, core: &mut SessionCore) {
        let snapshot = core.accumulator.take(self.ctx.clock.now());
        let ts = snapshot.ts;
        let waits = snapshot.waits.len();
        self.ctx.repository.write(&self.key, snapshot).await;
        self.ctx.metrics.inc_emission(&self.key);
        self.status.write().last_emit_at = Some(ts);
        trace!(key = %self.key, waits, "emitted wait snapshot");
    }
}
