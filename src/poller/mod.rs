use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::clock::SharedClock;
use crate::config::PollingConfig;
use crate::db::Connector;
use crate::metrics::AppMetrics;
use crate::repository::Repository;
use crate::waits::WaitMapping;

mod delta;
mod session;

pub use delta::{RequestTracker, WaitAccumulator, WaitDelta};
pub use session::{
    MIN_MAJOR_VERSION, PollState, PollStatus, PollingSession, SetupError, jitter_for, setup,
};

/// Everything a polling session needs besides its own key and connection string.
#[derive(Clone)]
pub struct PollContext {
    pub repository: Arc<Repository>,
    pub mapping: Arc<WaitMapping>,
    pub connector: Arc<dyn Connector>,
    pub clock: SharedClock,
    pub metrics: AppMetrics,
    pub polling: PollingConfig,
}

/// One instance to monitor, with its connection string already resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceTarget {
    pub key: String,
    pub connection_string: String,
    pub polling: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct InstanceStatus {
    pub key: String,
    pub polling: bool,
    /// `None` when polling is disabled for the instance.
    pub status: Option<PollStatus>,
}

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    pub started: Vec<String>,
    pub stopped: Vec<String>,
    pub restarted: Vec<String>,
}

struct Registered {
    target: InstanceTarget,
    session: Option<PollingSession>,
}

/// Running polling sessions keyed by instance key.
pub struct PollerRegistry {
    ctx: PollContext,
    root: CancellationToken,
    instances: RwLock<BTreeMap<String, Registered>>,
}

impl PollerRegistry {
    pub fn new(ctx: PollContext, root: CancellationToken) -> Self {
        Self {
            ctx,
            root,
            instances: RwLock::new(BTreeMap::new()),
        }
    }

    pub fn context(&self) -> &PollContext {
        &self.ctx
    }

    /// Register every target and start polling where enabled.
    pub fn spawn_all(&self, targets: &[InstanceTarget]) -> usize {
        targets
            .iter()
            .filter(|target| self.start_instance(target))
            .count()
    }

    /// Register `target`. Returns `false` if the key is already registered.
    pub fn start_instance(&self, target: &InstanceTarget) -> bool {
        let mut instances = self.instances.write();
        if instances.contains_key(&target.key) {
            warn!(key = %target.key, "instance already registered");
            return false;
        }
        let session = target.polling.then(|| {
            PollingSession::start(
                target.key.clone(),
                target.connection_string.clone(),
                self.ctx.clone(),
                &self.root,
            )
        });
        info!(key = %target.key, polling = target.polling, "registered instance");
        instances.insert(
            target.key.clone(),
            Registered {
                target: target.clone(),
                session,
            },
        );
        true
    }

    /// Stop polling `key`, wait for its session to wind down, and drop its history.
    pub async fn stop_instance(&self, key: &str) -> bool {
        if !self.detach(key).await {
            return false;
        }
        self.ctx.repository.delete(key).await;
        self.ctx.metrics.forget_instance(key);
        info!(key, "removed instance");
        true
    }

    async fn detach(&self, key: &str) -> bool {
        let removed = self.instances.write().remove(key);
        let Some(registered) = removed else {
            return false;
        };
        if let Some(session) = registered.session {
            session.stop();
            session.join().await;
        }
        true
    }

    /// Bring the running set in line with `targets`: start new keys, stop and
    /// forget missing ones, restart keys whose connection or polling flag changed.
    pub async fn reconcile(&self, targets: &[InstanceTarget]) -> ReconcileReport {
        let mut report = ReconcileReport::default();
        let wanted: BTreeMap<&str, &InstanceTarget> = targets
            .iter()
            .map(|target| (target.key.as_str(), target))
            .collect();

        let current: Vec<(String, InstanceTarget)> = self
            .instances
            .read()
            .iter()
            .map(|(key, registered)| (key.clone(), registered.target.clone()))
            .collect();

        for (key, existing) in &current {
            match wanted.get(key.as_str()) {
                None => {
                    if self.stop_instance(key).await {
                        report.stopped.push(key.clone());
                    }
                }
                Some(target) if **target != *existing => {
                    // history survives a restart; only the session is replaced
                    self.detach(key).await;
                    self.start_instance(target);
                    report.restarted.push(key.clone());
                }
                Some(_) => {}
            }
        }

        for target in targets {
            let known = current.iter().any(|(key, _)| *key == target.key);
            if !known && self.start_instance(target) {
                report.started.push(target.key.clone());
            }
        }

        info!(
            started = report.started.len(),
            stopped = report.stopped.len(),
            restarted = report.restarted.len(),
            "reconciled instances"
        );
        report
    }

    pub fn keys(&self) -> Vec<String> {
        self.instances.read().keys().cloned().collect()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.instances.read().contains_key(key)
    }

    pub fn connection_string(&self, key: &str) -> Option<String> {
        self.instances
            .read()
            .get(key)
            .map(|registered| registered.target.connection_string.clone())
    }

    pub fn status(&self, key: &str) -> Option<InstanceStatus> {
        self.instances
            .read()
            .get(key)
            .map(|registered| instance_status(key, registered))
    }

    pub fn statuses(&self) -> Vec<InstanceStatus> {
        self.instances
            .read()
            .iter()
            .map(|(key, registered)| instance_status(key, registered))
            .collect()
    }

    /// Cancel every session and wait for all of them to stop.
    pub async fn shutdown(&self) {
        self.root.cancel();
        let drained: Vec<Registered> = {
            let mut instances = self.instances.write();
            std::mem::take(&mut *instances).into_values().collect()
        };
        for registered in drained {
            if let Some(session) = registered.session {
                session.join().await;
            }
        }
        info!("all polling sessions stopped");
    }
}

fn instance_status(key: &str, registered: &Registered) -> InstanceStatus {
    InstanceStatus {
        key: key.to_string(),
        polling: registered.target.polling,
        status: registered.session.as_ref().map(PollingSession::status),
    }
}
