//! Integration tests for agent and session teardown.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;

use agent_conductor::models::lifecycle::AgentState;
use agent_conductor::models::session::UserSessionState;
use agent_conductor::orchestrator::hooks::{Cleaner, Clock};
use agent_conductor::driver::ClientFactory;
use agent_conductor::{AppError, Manager};

use super::test_helpers::{
    connection, manager, manager_with_cleaner, FakeFactory, ManualClock, RecordingCleaner,
};

#[tokio::test]
async fn terminate_agent_closes_client_once_and_is_idempotent() {
    let temp = tempfile::tempdir().expect("tempdir");
    let factory = Arc::new(FakeFactory::new());
    let mgr = manager(&factory);
    let cancel = CancellationToken::new();
    let session = mgr.create_user_session(&cancel, connection()).await.expect("create");
    let workspace = temp.path().join("auth");
    mgr.spawn_agent(&cancel, &session.id, "auth", &workspace)
        .await
        .expect("spawn");

    mgr.terminate_agent(&cancel, &session.id, "auth")
        .await
        .expect("first terminate");
    mgr.terminate_agent(&cancel, &session.id, "auth")
        .await
        .expect("second terminate");

    let client = factory.client_for(&workspace).expect("client");
    assert_eq!(client.close_count(), 1);
    assert!(mgr.list_agents(&cancel, &session.id).await.expect("list").is_empty());
}

#[tokio::test]
async fn terminate_agent_in_missing_session_is_ok() {
    let factory = Arc::new(FakeFactory::new());
    let mgr = manager(&factory);

    mgr.terminate_agent(&CancellationToken::new(), "ghost", "auth")
        .await
        .expect("no-op");
}

#[tokio::test]
async fn terminate_agent_swallows_close_errors() {
    let temp = tempfile::tempdir().expect("tempdir");
    let factory = Arc::new(FakeFactory::new().with_failing_close());
    let mgr = manager(&factory);
    let cancel = CancellationToken::new();
    let session = mgr.create_user_session(&cancel, connection()).await.expect("create");
    mgr.spawn_agent(&cancel, &session.id, "auth", temp.path().join("auth"))
        .await
        .expect("spawn");

    mgr.terminate_agent(&cancel, &session.id, "auth")
        .await
        .expect("close error is logged, not returned");
    assert!(mgr.list_agents(&cancel, &session.id).await.expect("list").is_empty());
}

#[tokio::test]
async fn terminate_session_closes_agents_and_runs_cleanup_once() {
    let temp = tempfile::tempdir().expect("tempdir");
    let factory = Arc::new(FakeFactory::new());
    factory.fail_workspace("db");
    let cleaner = Arc::new(RecordingCleaner::default());
    let mgr = manager_with_cleaner(&factory, &cleaner);
    let cancel = CancellationToken::new();
    let session = mgr.create_user_session(&cancel, connection()).await.expect("create");

    mgr.spawn_agent(&cancel, &session.id, "auth", temp.path().join("auth"))
        .await
        .expect("auth");
    mgr.spawn_agent(&cancel, &session.id, "db", temp.path().join("db"))
        .await
        .expect_err("db fails");

    mgr.terminate_user_session(&cancel, &session.id)
        .await
        .expect("terminate");
    mgr.terminate_user_session(&cancel, &session.id)
        .await
        .expect("second terminate is a no-op");

    assert!(mgr.get_session(&cancel, &session.id).await.is_none());
    assert_eq!(mgr.count(&cancel).await, 0);
    for client in factory.clients() {
        assert_eq!(client.close_count(), 1);
    }

    let seen = cleaner.seen();
    assert_eq!(seen.len(), 1, "cleanup runs exactly once");
    let snapshot = &seen[0];
    assert_eq!(snapshot.id, session.id);
    assert_eq!(snapshot.state, UserSessionState::Terminated);
    let states: Vec<(&str, AgentState)> = snapshot
        .agents
        .iter()
        .map(|a| (a.role.as_str(), a.state))
        .collect();
    assert_eq!(
        states,
        vec![("auth", AgentState::Terminated), ("db", AgentState::Failed)]
    );
}

#[tokio::test]
async fn cleanup_failure_does_not_block_removal() {
    let factory = Arc::new(FakeFactory::new());
    let cleaner = Arc::new(RecordingCleaner::failing());
    let mgr = manager_with_cleaner(&factory, &cleaner);
    let cancel = CancellationToken::new();
    let session = mgr.create_user_session(&cancel, connection()).await.expect("create");

    mgr.terminate_user_session(&cancel, &session.id)
        .await
        .expect("cleanup error is logged, not returned");

    assert_eq!(cleaner.seen().len(), 1);
    assert!(mgr.get_session(&cancel, &session.id).await.is_none());
}

/// A client whose close never finishes cannot hold teardown hostage.
#[tokio::test]
async fn hung_close_is_abandoned_after_timeout() {
    let temp = tempfile::tempdir().expect("tempdir");
    let factory = Arc::new(FakeFactory::new().with_close_delay(Duration::from_secs(30)));
    let cleaner = Arc::new(RecordingCleaner::default());
    let mgr = Manager::builder()
        .client_factory(Arc::clone(&factory) as Arc<dyn ClientFactory>)
        .cleaner(Arc::clone(&cleaner) as Arc<dyn Cleaner>)
        .agent_close_timeout(Duration::from_millis(200))
        .build()
        .expect("manager");
    let cancel = CancellationToken::new();
    let session = mgr.create_user_session(&cancel, connection()).await.expect("create");
    for role in ["a", "b", "c"] {
        mgr.spawn_agent(&cancel, &session.id, role, temp.path().join(role))
            .await
            .expect("spawn");
    }

    let started = Instant::now();
    mgr.terminate_user_session(&cancel, &session.id)
        .await
        .expect("terminate");
    let elapsed = started.elapsed();

    assert!(
        elapsed < Duration::from_secs(2),
        "closes must run concurrently under the timeout: {elapsed:?}"
    );
    assert!(mgr.get_session(&cancel, &session.id).await.is_none());
    assert_eq!(cleaner.seen().len(), 1);
    for client in factory.clients() {
        assert_eq!(client.close_count(), 1, "close started exactly once");
    }
}

/// A second caller arriving mid-teardown returns only once the session is
/// gone, so it never observes a half-torn-down session.
#[tokio::test]
async fn concurrent_terminate_waits_for_teardown_in_progress() {
    let temp = tempfile::tempdir().expect("tempdir");
    let factory = Arc::new(FakeFactory::new().with_close_delay(Duration::from_millis(300)));
    let cleaner = Arc::new(RecordingCleaner::default());
    let mgr = Arc::new(manager_with_cleaner(&factory, &cleaner));
    let cancel = CancellationToken::new();
    let session = mgr.create_user_session(&cancel, connection()).await.expect("create");
    mgr.spawn_agent(&cancel, &session.id, "auth", temp.path().join("auth"))
        .await
        .expect("spawn");

    let first = {
        let mgr = Arc::clone(&mgr);
        let id = session.id.clone();
        tokio::spawn(async move {
            mgr.terminate_user_session(&CancellationToken::new(), &id)
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;

    mgr.terminate_user_session(&cancel, &session.id)
        .await
        .expect("second terminate");

    assert!(mgr.get_session(&cancel, &session.id).await.is_none());
    assert_eq!(mgr.count(&cancel).await, 0);
    assert_eq!(cleaner.seen().len(), 1, "cleanup ran before the second caller returned");

    first.await.expect("join").expect("first terminate");
    assert_eq!(cleaner.seen().len(), 1);
}

/// A waiter can give up; the teardown it was waiting on still completes.
#[tokio::test]
async fn cancelled_wait_on_teardown_returns_cancelled() {
    let temp = tempfile::tempdir().expect("tempdir");
    let factory = Arc::new(FakeFactory::new().with_close_delay(Duration::from_millis(300)));
    let cleaner = Arc::new(RecordingCleaner::default());
    let mgr = Arc::new(manager_with_cleaner(&factory, &cleaner));
    let cancel = CancellationToken::new();
    let session = mgr.create_user_session(&cancel, connection()).await.expect("create");
    mgr.spawn_agent(&cancel, &session.id, "auth", temp.path().join("auth"))
        .await
        .expect("spawn");

    let first = {
        let mgr = Arc::clone(&mgr);
        let id = session.id.clone();
        tokio::spawn(async move {
            mgr.terminate_user_session(&CancellationToken::new(), &id)
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;

    let waiter = CancellationToken::new();
    waiter.cancel();
    let result = mgr.terminate_user_session(&waiter, &session.id).await;
    assert!(matches!(result, Err(AppError::Cancelled(_))), "{result:?}");

    first.await.expect("join").expect("first terminate");
    assert!(mgr.get_session(&cancel, &session.id).await.is_none());
    assert_eq!(cleaner.seen().len(), 1);
}

#[tokio::test]
async fn terminate_missing_session_is_ok() {
    let factory = Arc::new(FakeFactory::new());
    let cleaner = Arc::new(RecordingCleaner::default());
    let mgr = manager_with_cleaner(&factory, &cleaner);

    mgr.terminate_user_session(&CancellationToken::new(), "ghost")
        .await
        .expect("no-op");
    assert!(cleaner.seen().is_empty());
}

#[tokio::test]
async fn operations_on_terminated_session_are_not_found() {
    let temp = tempfile::tempdir().expect("tempdir");
    let factory = Arc::new(FakeFactory::new());
    let mgr = manager(&factory);
    let cancel = CancellationToken::new();
    let session = mgr.create_user_session(&cancel, connection()).await.expect("create");
    mgr.terminate_user_session(&cancel, &session.id)
        .await
        .expect("terminate");

    assert!(matches!(
        mgr.spawn_agent(&cancel, &session.id, "auth", temp.path().join("auth")).await,
        Err(AppError::NotFound(_))
    ));
    assert!(matches!(
        mgr.list_agents(&cancel, &session.id).await,
        Err(AppError::NotFound(_))
    ));
    assert!(matches!(
        mgr.record_heartbeat(&cancel, &session.id).await,
        Err(AppError::NotFound(_))
    ));
}

#[tokio::test]
async fn heartbeat_refreshes_last_active() {
    let factory = Arc::new(FakeFactory::new());
    let clock = Arc::new(ManualClock::new());
    let mgr = Manager::builder()
        .client_factory(Arc::clone(&factory) as Arc<dyn ClientFactory>)
        .clock(Arc::clone(&clock) as Arc<dyn Clock>)
        .build()
        .expect("manager");
    let session = mgr
        .create_user_session(&CancellationToken::new(), connection())
        .await
        .expect("create");

    clock.advance(chrono::Duration::seconds(90));
    mgr.record_heartbeat(&CancellationToken::new(), &session.id).await.expect("heartbeat");

    let after = mgr.get_session(&CancellationToken::new(), &session.id).await.expect("session");
    assert_eq!(after.created_at, session.created_at);
    assert_eq!(after.last_active, clock.now());
    assert!(after.last_active > session.last_active);
}

#[tokio::test]
async fn shutdown_terminates_every_session() {
    let temp = tempfile::tempdir().expect("tempdir");
    let factory = Arc::new(FakeFactory::new());
    let cleaner = Arc::new(RecordingCleaner::default());
    let mgr = manager_with_cleaner(&factory, &cleaner);
    let cancel = CancellationToken::new();

    for i in 0..3 {
        let session = mgr.create_user_session(&cancel, connection()).await.expect("create");
        mgr.spawn_agent(&cancel, &session.id, "worker", temp.path().join(format!("ws{i}")))
            .await
            .expect("spawn");
    }
    assert_eq!(mgr.list(&cancel, Some(UserSessionState::Active)).await.len(), 3);

    mgr.shutdown(&cancel).await;

    assert_eq!(mgr.count(&cancel).await, 0);
    assert!(mgr.list(&cancel, None).await.is_empty());
    assert_eq!(cleaner.seen().len(), 3);
    assert!(factory.clients().iter().all(|c| c.close_count() == 1));
}
