use super::*;
use std::sync::atomic::Ordering;

use crate::test_support::{
    credential, mint_token, next_link, store_with, CountingRefresher, FakeBroker, StalledConnector,
};

fn config(max_auth_failures: u32) -> ConnectionConfig {
    ConnectionConfig {
        url: "ws://broker.test/ws".into(),
        connect_timeout: Duration::from_secs(2),
        health_check_interval: Duration::from_secs(60),
        reconnect_delay: Duration::from_millis(10),
        max_auth_failures,
    }
}

async fn coordinator_with(token: &str, refresher: Arc<CountingRefresher>) -> RefreshCoordinator {
    RefreshCoordinator::new(
        store_with(token).await,
        refresher,
        Duration::from_secs(15),
        Duration::from_secs(30),
    )
}

async fn wait_for_state(manager: &ConnectionManager, wanted: ConnectionState) {
    let mut state = manager.watch_state();
    tokio::time::timeout(Duration::from_secs(2), state.wait_for(|s| *s == wanted))
        .await
        .expect("state reached within timeout")
        .expect("manager alive");
}

#[tokio::test]
async fn concurrent_connects_open_one_link() {
    let (broker, mut links) = FakeBroker::new();
    let refresher = CountingRefresher::new("unused");
    let coordinator = coordinator_with(&mint_token("alice", 3600), refresher).await;
    let manager = ConnectionManager::new(config(5), broker.clone(), coordinator);

    let (first, second) = tokio::join!(manager.connect(), manager.connect());
    first.expect("first connect");
    second.expect("second connect");
    manager.connect().await.expect("already connected");

    let link = next_link(&mut links).await;
    assert!(link.headers["Authorization"].starts_with("Bearer "));
    assert_eq!(broker.opens(), 1);
    assert_eq!(manager.state(), ConnectionState::Connected);
}

#[tokio::test]
async fn subscribe_requires_a_connection() {
    let (broker, _links) = FakeBroker::new();
    let coordinator =
        coordinator_with(&mint_token("alice", 3600), CountingRefresher::new("unused")).await;
    let manager = ConnectionManager::new(config(5), broker, coordinator);

    let err = manager
        .subscribe("/topic/chat/1")
        .await
        .expect_err("not connected");
    assert!(matches!(err, ClientError::NotConnected));
    let err = manager
        .publish("/app/chat/1", "{}")
        .await
        .expect_err("not connected");
    assert!(matches!(err, ClientError::NotConnected));
}

#[tokio::test]
async fn reconnect_restores_each_subscription_once() {
    let (broker, mut links) = FakeBroker::new();
    let coordinator =
        coordinator_with(&mint_token("alice", 3600), CountingRefresher::new("unused")).await;
    let manager = ConnectionManager::new(config(5), broker.clone(), coordinator);
    manager.connect().await.expect("connect");

    let mut first = next_link(&mut links).await;
    let (_a, mut chat_rx) = manager.subscribe("/topic/chat/1").await.expect("subscribe A");
    let (_b, _notify_rx) = manager
        .subscribe("/user/7/queue/notifications")
        .await
        .expect("subscribe B");
    first.collect(StompCommand::Subscribe, 2).await;

    drop(first);
    wait_for_state(&manager, ConnectionState::Reconnecting).await;
    let mut second = next_link(&mut links).await;
    wait_for_state(&manager, ConnectionState::Connected).await;

    let restored = second.collect(StompCommand::Subscribe, 2).await;
    let mut destinations: Vec<&str> = restored
        .iter()
        .filter_map(|frame| frame.header("destination"))
        .collect();
    destinations.sort_unstable();
    assert_eq!(
        destinations,
        vec!["/topic/chat/1", "/user/7/queue/notifications"]
    );
    assert_eq!(manager.subscription_count().await, 2);
    assert!(second.from_client.try_recv().is_err(), "no duplicate SUBSCRIBE");
    assert_eq!(broker.opens(), 2);

    let chat_id = restored
        .iter()
        .find(|frame| frame.header("destination") == Some("/topic/chat/1"))
        .and_then(|frame| frame.header("id"))
        .expect("subscription id")
        .to_string();
    second.message(&chat_id, "/topic/chat/1", r#"{"command":"TYPING","senderId":3}"#);
    let delivered = tokio::time::timeout(Duration::from_secs(2), chat_rx.recv())
        .await
        .expect("delivered")
        .expect("open channel");
    assert_eq!(delivered.destination, "/topic/chat/1");
    assert!(delivered.body.contains("TYPING"));
}

#[tokio::test]
async fn unsubscribe_is_idempotent() {
    let (broker, mut links) = FakeBroker::new();
    let coordinator =
        coordinator_with(&mint_token("alice", 3600), CountingRefresher::new("unused")).await;
    let manager = ConnectionManager::new(config(5), broker, coordinator);
    manager.connect().await.expect("connect");
    let mut link = next_link(&mut links).await;

    let (handle, _rx) = manager.subscribe("/topic/chat/9").await.expect("subscribe");
    assert!(handle.unsubscribe(&manager).await);
    assert!(!manager.unsubscribe("/topic/chat/9").await);
    assert!(!manager.unsubscribe("/topic/never").await);

    link.collect(StompCommand::Subscribe, 1).await;
    let unsubscribes = link.collect(StompCommand::Unsubscribe, 1).await;
    assert_eq!(unsubscribes.len(), 1);
    assert!(link.from_client.try_recv().is_err());
    assert_eq!(manager.subscription_count().await, 0);
}

#[tokio::test]
async fn auth_failures_past_the_budget_expire_the_session() {
    let (broker, mut links) = FakeBroker::new();
    let refresher = CountingRefresher::new(&mint_token("alice", 3600));
    let coordinator = coordinator_with(&mint_token("alice", 3600), refresher.clone()).await;
    let store = coordinator.store().clone();
    let manager = ConnectionManager::start(config(5), broker.clone(), coordinator);
    manager.connect().await.expect("connect");

    let mut kept = Vec::new();
    for _ in 0..6 {
        let link = next_link(&mut links).await;
        link.reject();
        kept.push(link);
    }

    let mut credentials = store.subscribe();
    tokio::time::timeout(
        Duration::from_secs(2),
        credentials.wait_for(|credential| credential.is_none()),
    )
    .await
    .expect("session cleared")
    .expect("store alive");
    wait_for_state(&manager, ConnectionState::Disconnected).await;

    tokio::time::sleep(Duration::from_millis(100)).await;
    manager.health_check().await;
    assert_eq!(broker.opens(), 6, "no reconnect after the budget is spent");
    assert_eq!(refresher.calls(), 5);
    assert!(matches!(
        manager.connect().await,
        Err(ClientError::RetryBudgetExhausted { failures: 6 })
    ));
    manager.shutdown().await;
}

#[tokio::test]
async fn delivered_message_resets_the_failure_count() {
    let (broker, mut links) = FakeBroker::new();
    let refresher = CountingRefresher::new(&mint_token("alice", 3600));
    let coordinator = coordinator_with(&mint_token("alice", 3600), refresher.clone()).await;
    let manager = ConnectionManager::new(config(5), broker, coordinator);
    manager.connect().await.expect("connect");

    let first = next_link(&mut links).await;
    first.reject();
    let mut second = next_link(&mut links).await;
    wait_for_state(&manager, ConnectionState::Connected).await;
    assert_eq!(manager.auth_failures().await, 1);
    assert_eq!(refresher.calls(), 1);

    let (_handle, mut rx) = manager.subscribe("/topic/chat/1").await.expect("subscribe");
    let subscribe = second.collect(StompCommand::Subscribe, 1).await.remove(0);
    second.message(
        subscribe.header("id").expect("id"),
        "/topic/chat/1",
        r#"{"command":"READING","senderId":3}"#,
    );
    tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("delivered")
        .expect("open channel");
    assert_eq!(manager.auth_failures().await, 0);
}

#[tokio::test]
async fn rejected_handshake_counts_as_an_auth_failure() {
    let (broker, mut links) = FakeBroker::new();
    broker.refuse_auth.store(true, std::sync::atomic::Ordering::SeqCst);
    let refresher = CountingRefresher::new(&mint_token("alice", 3600));
    let coordinator = coordinator_with(&mint_token("alice", 3600), refresher.clone()).await;
    let manager = ConnectionManager::new(config(5), broker.clone(), coordinator);

    let err = manager.connect().await.expect_err("refused");
    assert!(err.is_auth());

    broker.refuse_auth.store(false, std::sync::atomic::Ordering::SeqCst);
    let _link = next_link(&mut links).await;
    wait_for_state(&manager, ConnectionState::Connected).await;
    assert_eq!(refresher.calls(), 1);
    assert_eq!(broker.opens(), 2);
}

#[tokio::test]
async fn publish_refreshes_an_expired_token_first() {
    let (broker, mut links) = FakeBroker::new();
    let fresh = mint_token("alice", 3600);
    let refresher = CountingRefresher::new(&fresh);
    let coordinator = coordinator_with(&mint_token("alice", 3600), refresher.clone()).await;
    let store = coordinator.store().clone();
    let manager = ConnectionManager::new(config(5), broker, coordinator);
    manager.connect().await.expect("connect");
    let mut link = next_link(&mut links).await;

    store
        .write(credential(&mint_token("alice", -60)))
        .await
        .expect("expire token");
    manager
        .publish("/app/chat/1/typing", r#"{"command":"TYPING","senderId":7}"#)
        .await
        .expect("publish");

    let sent = link.collect(StompCommand::Send, 1).await.remove(0);
    assert_eq!(sent.header("Authorization"), Some(format!("Bearer {fresh}").as_str()));
    assert_eq!(sent.header("destination"), Some("/app/chat/1/typing"));
    assert_eq!(refresher.calls(), 1);
}

#[tokio::test]
async fn clearing_the_credential_tears_the_connection_down() {
    let (broker, mut links) = FakeBroker::new();
    let coordinator =
        coordinator_with(&mint_token("alice", 3600), CountingRefresher::new("unused")).await;
    let manager = ConnectionManager::start(config(5), broker, coordinator.clone());
    manager.connect().await.expect("connect");
    let _link = next_link(&mut links).await;
    manager.subscribe("/topic/chat/1").await.expect("subscribe");

    coordinator.logout().await;
    wait_for_state(&manager, ConnectionState::Disconnected).await;
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(manager.subscription_count().await, 0);
    assert!(matches!(
        manager.connect().await,
        Err(ClientError::SessionCleared)
    ));
    manager.shutdown().await;
}

#[tokio::test]
async fn health_check_recovers_a_silently_dead_link() {
    let (broker, mut links) = FakeBroker::new();
    let coordinator =
        coordinator_with(&mint_token("alice", 3600), CountingRefresher::new("unused")).await;
    let manager = ConnectionManager::new(config(5), broker.clone(), coordinator);
    manager.connect().await.expect("connect");

    let link = next_link(&mut links).await;
    let crate::test_support::BrokerLink {
        from_client,
        to_client: _to_client,
        ..
    } = link;
    drop(from_client);

    manager.health_check().await;
    let _second = next_link(&mut links).await;
    assert_eq!(manager.state(), ConnectionState::Connected);
    assert_eq!(broker.opens(), 2);
}

#[tokio::test]
async fn disconnect_keeps_the_registry_for_the_next_connect() {
    let (broker, mut links) = FakeBroker::new();
    let coordinator =
        coordinator_with(&mint_token("alice", 3600), CountingRefresher::new("unused")).await;
    let manager = ConnectionManager::new(config(5), broker, coordinator);
    manager.connect().await.expect("connect");
    let _first = next_link(&mut links).await;
    manager.subscribe("/topic/chat/4").await.expect("subscribe");

    manager.disconnect().await;
    assert_eq!(manager.state(), ConnectionState::Disconnected);
    manager.connect().await.expect("reconnect");
    let mut second = next_link(&mut links).await;
    let restored = second.collect(StompCommand::Subscribe, 1).await;
    assert_eq!(restored[0].header("destination"), Some("/topic/chat/4"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn signing_in_after_an_exhausted_budget_reconnects() {
    for _ in 0..10 {
        let (broker, mut links) = FakeBroker::new();
        broker.refuse_auth.store(true, Ordering::SeqCst);
        let coordinator =
            coordinator_with(&mint_token("alice", 3600), CountingRefresher::new("unused")).await;
        let store = coordinator.store().clone();
        let manager = ConnectionManager::start(config(0), broker.clone(), coordinator.clone());

        let mut credentials = store.subscribe();
        assert!(manager.connect().await.is_err());
        tokio::time::timeout(
            Duration::from_secs(2),
            credentials.wait_for(|credential| credential.is_none()),
        )
        .await
        .expect("session cleared")
        .expect("store alive");

        broker.refuse_auth.store(false, Ordering::SeqCst);
        coordinator
            .login(credential(&mint_token("alice", 7200)))
            .await;
        manager.connect().await.expect("connect for the new session");
        let _link = next_link(&mut links).await;
        assert_eq!(manager.state(), ConnectionState::Connected);
        assert_eq!(manager.auth_failures().await, 0);
        manager.shutdown().await;
    }
}

#[tokio::test]
async fn refresh_timeout_during_auth_recovery_keeps_reconnecting() {
    let (broker, mut links) = FakeBroker::new();
    let fresh = mint_token("alice", 7200);
    let refresher = CountingRefresher::slow(&fresh, Duration::from_millis(300));
    let coordinator = RefreshCoordinator::new(
        store_with(&mint_token("alice", 3600)).await,
        refresher.clone(),
        Duration::from_millis(100),
        Duration::from_secs(30),
    );
    let store = coordinator.store().clone();
    let mut config = config(5);
    config.health_check_interval = Duration::from_millis(50);
    let manager = ConnectionManager::start(config, broker.clone(), coordinator);
    manager.connect().await.expect("connect");

    let first = next_link(&mut links).await;
    first.reject();
    let _second = next_link(&mut links).await;
    wait_for_state(&manager, ConnectionState::Connected).await;

    let mut credentials = store.subscribe();
    tokio::time::timeout(
        Duration::from_secs(2),
        credentials.wait_for(|credential| {
            credential
                .as_ref()
                .is_some_and(|credential| credential.access_token == fresh)
        }),
    )
    .await
    .expect("refresh committed")
    .expect("store alive");
    assert_eq!(manager.state(), ConnectionState::Connected);
    assert_eq!(broker.opens(), 2);
    assert_eq!(refresher.calls(), 1);
    manager.shutdown().await;
}

#[tokio::test]
async fn health_check_waits_for_an_auth_recovery_in_progress() {
    let (broker, mut links) = FakeBroker::new();
    let fresh = mint_token("alice", 7200);
    let refresher = CountingRefresher::slow(&fresh, Duration::from_millis(300));
    let coordinator = coordinator_with(&mint_token("alice", 3600), refresher.clone()).await;
    let manager = ConnectionManager::new(config(5), broker.clone(), coordinator);
    manager.connect().await.expect("connect");

    let first = next_link(&mut links).await;
    first.reject();
    wait_for_state(&manager, ConnectionState::Reconnecting).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    manager.health_check().await;
    assert_eq!(broker.opens(), 1, "no reconnect with the rejected token");

    let second = next_link(&mut links).await;
    wait_for_state(&manager, ConnectionState::Connected).await;
    assert_eq!(second.headers["Authorization"], format!("Bearer {fresh}"));
    assert_eq!(broker.opens(), 2);
    assert_eq!(refresher.calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn stalled_handshake_times_out() {
    let coordinator =
        coordinator_with(&mint_token("alice", 3600), CountingRefresher::new("unused")).await;
    let manager = ConnectionManager::new(config(5), Arc::new(StalledConnector), coordinator);

    let err = manager.connect().await.expect_err("handshake never completes");
    assert!(matches!(err, ClientError::Timeout { .. }));
    assert_eq!(manager.state(), ConnectionState::Disconnected);
}
