mod common;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio_util::sync::CancellationToken;

use common::{FakeConnector, Script, context, registry, repository, sample, server_info, wait_for_state};
use waitmon::blocking::{SessionError, SessionSnapshotService};
use waitmon::db::SessionRow;
use waitmon::poller::{InstanceTarget, PollState, PollingSession};
use waitmon::waits::Snapshot;

fn target(key: &str, connection_string: &str) -> InstanceTarget {
    InstanceTarget {
        key: key.into(),
        connection_string: connection_string.into(),
        polling: true,
    }
}

#[tokio::test(start_paused = true)]
async fn old_servers_are_never_retried() {
    let connector = FakeConnector::new(Script {
        server_info: [Ok(server_info(9))].into(),
        ..Script::default()
    });
    let root = CancellationToken::new();
    let session = PollingSession::start("legacy", "fake://legacy", context(&connector, repository()), &root);

    wait_for_state(&session, PollState::Unsupported).await;
    assert!(session.status().last_error.unwrap().contains("minimum 10"));

    tokio::time::sleep(Duration::from_secs(120)).await;
    assert_eq!(connector.opens(), 1);
    assert_eq!(connector.closes(), 1);
    session.join().await;
}

#[tokio::test(start_paused = true)]
async fn setup_failures_are_retried_until_the_server_answers() {
    let connector = FakeConnector::new(Script {
        server_info: [Err("connection refused".to_string()), Ok(server_info(16))].into(),
        samples: [Ok(sample(&[]))].into(),
        ..Script::default()
    });
    let root = CancellationToken::new();
    let session = PollingSession::start("flaky", "fake://flaky", context(&connector, repository()), &root);

    wait_for_state(&session, PollState::Retrying).await;
    assert_eq!(session.status().last_error.as_deref(), Some("connection refused"));

    wait_for_state(&session, PollState::Connected).await;
    let status = session.status();
    assert!(status.last_error.is_none());
    assert_eq!(status.server_name.as_deref(), Some("main"));
    assert_eq!(connector.opens(), 2);

    session.stop();
    session.join().await;
    assert_eq!(session.status().state, PollState::Stopped);
}

#[tokio::test(start_paused = true)]
async fn emits_wait_growth_once_per_interval() {
    let connector = FakeConnector::new(Script {
        server_info: [Ok(server_info(16))].into(),
        samples: [
            Ok(sample(&[(5, "LCK", 100)])),
            Ok(sample(&[(5, "LCK", 150)])),
        ]
        .into(),
        ..Script::default()
    });
    let repo = repository();
    let root = CancellationToken::new();
    let session = PollingSession::start("prod", "fake://prod", context(&connector, repo.clone()), &root);

    // jitter < 1s, emit offset 500ms, emit interval 60s
    tokio::time::sleep(Duration::from_secs(62)).await;

    let history = repo.values("prod").await;
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].waits, BTreeMap::from([("LCK".to_string(), 50)]));
    assert!(session.status().last_emit_at.is_some());

    // no further growth: the next snapshot is empty but still emitted
    tokio::time::sleep(Duration::from_secs(60)).await;
    let history = repo.values("prod").await;
    assert_eq!(history.len(), 2);
    assert!(history[1].has_data());
    assert!(history[1].waits.is_empty());

    root.cancel();
    session.join().await;
    assert_eq!(connector.closes(), 1);
}

#[tokio::test(start_paused = true)]
async fn sample_errors_reset_the_connection_once_per_error_period() {
    let connector = FakeConnector::new(Script {
        server_info: [Ok(server_info(16))].into(),
        samples: [
            Ok(sample(&[])),
            Err("server closed the connection".to_string()),
            Err("server closed the connection".to_string()),
            Err("server closed the connection".to_string()),
            Ok(sample(&[])),
        ]
        .into(),
        ..Script::default()
    });
    let root = CancellationToken::new();
    let session = PollingSession::start("wobbly", "fake://wobbly", context(&connector, repository()), &root);

    wait_for_state(&session, PollState::Retrying).await;
    wait_for_state(&session, PollState::Connected).await;
    tokio::time::sleep(Duration::from_secs(3)).await;

    assert_eq!(connector.resets(), 1);
    assert_eq!(connector.opens(), 1);
    assert_eq!(session.status().state, PollState::Connected);
    assert!(session.status().last_error.is_none());

    session.stop();
    session.join().await;
}

#[tokio::test(start_paused = true)]
async fn reconcile_starts_stops_and_restarts() {
    let connector = FakeConnector::new(Script {
        server_info: [Ok(server_info(16))].into(),
        samples: [Ok(sample(&[]))].into(),
        ..Script::default()
    });
    let repo = repository();
    let registry = registry(&connector, repo.clone());
    assert_eq!(
        registry.spawn_all(&[target("a", "fake://a"), target("b", "fake://b")]),
        2
    );
    assert!(!registry.start_instance(&target("a", "fake://other")));

    let ts = Utc::now();
    repo.write("a", Snapshot::new(ts, BTreeMap::from([("LCK".to_string(), 1)])))
        .await;
    repo.write("b", Snapshot::new(ts, BTreeMap::from([("LCK".to_string(), 2)])))
        .await;

    let report = registry
        .reconcile(&[target("b", "fake://b2"), target("c", "fake://c")])
        .await;
    assert_eq!(report.started, vec!["c".to_string()]);
    assert_eq!(report.stopped, vec!["a".to_string()]);
    assert_eq!(report.restarted, vec!["b".to_string()]);

    assert_eq!(registry.keys(), vec!["b".to_string(), "c".to_string()]);
    assert_eq!(registry.connection_string("b").as_deref(), Some("fake://b2"));
    assert!(repo.values("a").await.is_empty());
    assert_eq!(repo.values("b").await.len(), 1);

    let unchanged = registry
        .reconcile(&[target("b", "fake://b2"), target("c", "fake://c")])
        .await;
    assert_eq!(unchanged, Default::default());

    registry.shutdown().await;
    assert!(registry.keys().is_empty());
}

fn row(session_id: i32, blocker_id: i32) -> SessionRow {
    SessionRow {
        session_id,
        blocker_id,
        status: "active".into(),
        wait_type: if blocker_id == 0 { String::new() } else { "Lock:transactionid".into() },
        statement_text: format!("update   t\n  set x = {session_id}"),
        open_transaction_count: 1,
        ..SessionRow::default()
    }
}

#[tokio::test]
async fn session_listing_resolves_blocking_chains() {
    let connector = FakeConnector::new(Script {
        sessions: vec![row(12, 11), row(10, 0), row(11, 10), row(20, 0)],
        ..Script::default()
    });
    let registry = Arc::new(registry(&connector, repository()));
    registry.start_instance(&InstanceTarget {
        key: "report".into(),
        connection_string: "fake://report".into(),
        polling: false,
    });
    let service = SessionSnapshotService::new(registry);

    let snapshot = service.get("report").await.unwrap();
    assert_eq!(snapshot.instance, "report");
    assert!(snapshot.errors.is_empty());
    let head = snapshot
        .sessions
        .iter()
        .find(|s| s.session_id == 10)
        .unwrap();
    assert_eq!(head.total_blocked, 2);
    let tail = snapshot
        .sessions
        .iter()
        .find(|s| s.session_id == 12)
        .unwrap();
    assert_eq!(tail.head_blocker_id, 10);
    assert_eq!(tail.path, "/10/11/12/");
    assert_eq!(tail.statement_text, "update t set x = 12");
    assert_eq!(connector.opens(), 1);
    assert_eq!(connector.closes(), 1);

    let missing = service.get("nope").await;
    assert!(matches!(missing, Err(SessionError::UnknownInstance(_))));
}
