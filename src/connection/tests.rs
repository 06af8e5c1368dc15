use super::*;
use crate::bus::MemoryBroker;

fn manager(broker: &MemoryBroker) -> Arc<ConnectionManager> {
    ConnectionManager::new(Arc::new(broker.connector()), ConnectionSettings::fast())
}

async fn wait_for_generation(manager: &ConnectionManager, generation: u64) {
    let mut link = manager.watch_link();
    tokio::time::timeout(
        Duration::from_secs(2),
        link.wait_for(|s| s.state == ConnectionState::Connected && s.generation == generation),
    )
    .await
    .expect("reconnected within timeout")
    .expect("manager alive");
}

#[tokio::test]
async fn test_connect_reaches_connected() {
    let broker = MemoryBroker::new();
    let manager = manager(&broker);
    assert_eq!(manager.state(), ConnectionState::Disconnected);
    assert_eq!(manager.generation(), 0);

    manager.connect().await.unwrap();

    assert_eq!(manager.state(), ConnectionState::Connected);
    assert_eq!(manager.generation(), 1);
    assert_eq!(broker.connection_count(), 1);

    // Connecting again is a no-op
    manager.connect().await.unwrap();
    assert_eq!(broker.connect_attempts(), 1);
}

#[tokio::test]
async fn test_transient_failures_are_retried() {
    let broker = MemoryBroker::new();
    broker.refuse_connections(2);
    let manager = manager(&broker);

    manager.connect().await.unwrap();

    assert_eq!(broker.connect_attempts(), 3);
    assert_eq!(manager.state(), ConnectionState::Connected);
}

#[tokio::test]
async fn test_auth_failure_is_not_retried() {
    let broker = MemoryBroker::new();
    let manager = ConnectionManager::new(
        Arc::new(broker.connector_with("guest", "nope", "/")),
        ConnectionSettings::fast(),
    );

    let result = manager.connect().await;

    assert!(matches!(result, Err(BusError::Connection { fatal: true, .. })));
    assert_eq!(broker.connect_attempts(), 1);
    assert_eq!(manager.state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn test_unreachable_exhausts_attempts() {
    let broker = MemoryBroker::new();
    broker.set_reachable(false);
    let manager = manager(&broker);

    let result = manager.connect().await;

    assert!(matches!(result, Err(BusError::Connection { fatal: false, .. })));
    // One attempt plus four retries
    assert_eq!(broker.connect_attempts(), 5);
    assert_eq!(manager.state(), ConnectionState::Disconnected);

    broker.set_reachable(true);
    manager.connect().await.unwrap();
    assert_eq!(manager.state(), ConnectionState::Connected);
}

#[tokio::test]
async fn test_open_channel_requires_connection() {
    let broker = MemoryBroker::new();
    let manager = manager(&broker);

    let result = manager.open_channel(ChannelOptions::default()).await;
    assert!(matches!(result, Err(BusError::Channel(_))));

    manager.connect().await.unwrap();
    let lease = manager.open_channel(ChannelOptions::default()).await.unwrap();
    assert_eq!(lease.generation, 1);
}

#[tokio::test]
async fn test_reconnects_after_link_drop() {
    let broker = MemoryBroker::new();
    let manager = manager(&broker);
    manager.connect().await.unwrap();

    broker.drop_connections();
    tokio::time::timeout(Duration::from_secs(1), manager.link_lost(1))
        .await
        .unwrap();
    wait_for_generation(&manager, 2).await;

    assert_eq!(broker.connection_count(), 1);
    let lease = manager.open_channel(ChannelOptions::default()).await.unwrap();
    assert_eq!(lease.generation, 2);
}

#[tokio::test]
async fn test_stays_connecting_while_broker_down() {
    let broker = MemoryBroker::new();
    let manager = manager(&broker);
    manager.connect().await.unwrap();

    broker.set_reachable(false);
    broker.drop_connections();
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(manager.state(), ConnectionState::Connecting);
    assert!(matches!(
        manager.open_channel(ChannelOptions::default()).await,
        Err(BusError::Channel(_))
    ));

    broker.set_reachable(true);
    wait_for_generation(&manager, 2).await;
}

#[tokio::test]
async fn test_close_cancels_children_and_is_final() {
    let broker = MemoryBroker::new();
    let manager = manager(&broker);
    manager.connect().await.unwrap();
    let child = manager.child_token();

    manager.close().await.unwrap();

    assert!(child.is_cancelled());
    assert_eq!(manager.state(), ConnectionState::Closed);
    assert_eq!(broker.connection_count(), 0);
    assert!(matches!(manager.connect().await, Err(BusError::Closed)));
    assert!(matches!(
        manager.wait_connected(Duration::from_millis(10)).await,
        Err(BusError::Closed)
    ));
    // Closing twice is harmless
    manager.close().await.unwrap();
}

#[tokio::test]
async fn test_no_reconnect_after_close() {
    let broker = MemoryBroker::new();
    let manager = manager(&broker);
    manager.connect().await.unwrap();
    manager.close().await.unwrap();

    broker.drop_connections();
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(broker.connect_attempts(), 1);
    assert_eq!(manager.state(), ConnectionState::Closed);
}

#[tokio::test]
async fn test_wait_connected_times_out() {
    let broker = MemoryBroker::new();
    let manager = manager(&broker);

    let result = manager.wait_connected(Duration::from_millis(20)).await;
    assert!(matches!(result, Err(BusError::Timeout(_))));
}

#[tokio::test]
async fn test_scope_closes_on_success_and_error() {
    let broker = MemoryBroker::new();

    let manager_ok = manager(&broker);
    let value = manager_ok
        .scope(|m| async move {
            assert_eq!(m.state(), ConnectionState::Connected);
            Ok(7)
        })
        .await
        .unwrap();
    assert_eq!(value, 7);
    assert_eq!(manager_ok.state(), ConnectionState::Closed);

    let manager_err = manager(&broker);
    let result: Result<()> = manager_err
        .scope(|_| async move { Err(BusError::Handler("boom".to_string())) })
        .await;
    assert!(matches!(result, Err(BusError::Handler(_))));
    assert_eq!(manager_err.state(), ConnectionState::Closed);
    assert_eq!(broker.connection_count(), 0);
}
