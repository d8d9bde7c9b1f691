use std::{collections::HashSet, time::Duration};

use futures::future::join_all;
use pretty_assertions::assert_eq;

use super::{options::ConnectionPoolOptions, ConnectionEstablisher, ConnectionPool};
use crate::{
    bson::doc,
    cmap::Command,
    error::{Error, ErrorKind},
    options::ServerAddress,
    runtime,
    sdam::Topology,
    test::MockDeployment,
};

struct Fixture {
    mock: MockDeployment,
    // Owns the updater channel the pool reports to.
    _topology: Topology,
    pool: ConnectionPool,
}

fn pool(mut pool_options: ConnectionPoolOptions) -> Fixture {
    let mock = MockDeployment::standalone();
    let options = mock.client_options();
    let topology = Topology::new(options.clone()).unwrap();
    pool_options.maintenance_frequency = Some(Duration::from_millis(20));

    let pool = ConnectionPool::new(
        ServerAddress::default(),
        ConnectionEstablisher::new(&options).unwrap(),
        topology.updater(),
        Some(pool_options),
    );

    Fixture {
        mock,
        _topology: topology,
        pool,
    }
}

fn ready() -> ConnectionPoolOptions {
    ConnectionPoolOptions {
        ready: Some(true),
        ..Default::default()
    }
}

#[tokio::test]
async fn checked_out_connection_runs_commands() {
    let fixture = pool(ready());
    let mut connection = fixture.pool.check_out().await.unwrap();
    assert_eq!(connection.address(), &ServerAddress::default());
    assert_eq!(connection.stream_description().unwrap().max_wire_version, Some(21));

    let response = connection
        .send_command(Command::new("ping", "admin", doc! { "ping": 1 }))
        .await
        .unwrap();
    assert!(response.is_success());
}

#[tokio::test]
async fn returned_connections_are_reused() {
    let fixture = pool(ready());
    let first = fixture.pool.check_out().await.unwrap();
    let id = first.id;
    drop(first);
    runtime::delay_for(Duration::from_millis(50)).await;

    let second = fixture.pool.check_out().await.unwrap();
    assert_eq!(second.id, id);
}

#[tokio::test]
async fn paused_pool_rejects_checkouts() {
    let fixture = pool(ConnectionPoolOptions::default());
    let error = fixture.pool.check_out().await.unwrap_err();
    assert!(error.is_pool_cleared());

    fixture.pool.mark_as_ready().await;
    fixture.pool.check_out().await.unwrap();
}

#[tokio::test]
async fn clear_bumps_generation_and_pauses() {
    let fixture = pool(ready());
    let mut subscriber = fixture.pool.generation_subscriber();
    let stale = fixture.pool.check_out().await.unwrap();
    assert_eq!(stale.generation, 0);

    fixture.pool.clear(Error::internal("network blip"));
    assert_eq!(
        subscriber
            .wait_for_generation_change(Duration::from_secs(1))
            .await,
        Some(1)
    );
    assert_eq!(fixture.pool.generation(), 1);

    let error = fixture.pool.check_out().await.unwrap_err();
    assert!(error.is_pool_cleared());
    assert!(error.to_string().contains("network blip"));

    fixture.pool.mark_as_ready().await;
    let fresh = fixture.pool.check_out().await.unwrap();
    assert_eq!(fresh.generation, 1);
    assert_ne!(fresh.id, stale.id);
}

#[tokio::test]
async fn full_pool_times_out_waiting() {
    let fixture = pool(ConnectionPoolOptions {
        max_pool_size: Some(1),
        wait_queue_timeout: Some(Duration::from_millis(100)),
        ..ready()
    });
    let _held = fixture.pool.check_out().await.unwrap();

    let error = fixture.pool.check_out().await.unwrap_err();
    assert!(matches!(*error.kind, ErrorKind::WaitQueueTimeout { .. }));
}

#[tokio::test]
async fn closed_pool_fails_checkouts() {
    let fixture = pool(ready());
    fixture.pool.close().await;

    let error = fixture.pool.check_out().await.unwrap_err();
    assert!(matches!(*error.kind, ErrorKind::PoolClosed { .. }));
}

#[tokio::test]
async fn min_pool_size_is_maintained() {
    let fixture = pool(ConnectionPoolOptions {
        min_pool_size: Some(2),
        ..ready()
    });
    runtime::delay_for(Duration::from_millis(200)).await;

    assert!(fixture.mock.connections_opened() >= 2);
}

#[tokio::test]
async fn concurrent_checkouts_stay_within_max_pool_size() {
    let fixture = pool(ConnectionPoolOptions {
        max_pool_size: Some(4),
        wait_queue_timeout: Some(Duration::from_millis(200)),
        ..ready()
    });

    let connections: Vec<_> = join_all((0..4).map(|_| fixture.pool.check_out()))
        .await
        .into_iter()
        .map(|c| c.unwrap())
        .collect();
    let ids: HashSet<u32> = connections.iter().map(|c| c.id).collect();
    assert_eq!(ids.len(), 4);

    let error = fixture.pool.check_out().await.unwrap_err();
    assert!(matches!(*error.kind, ErrorKind::WaitQueueTimeout { .. }));

    drop(connections);
    runtime::delay_for(Duration::from_millis(50)).await;

    let again: Vec<_> = join_all((0..4).map(|_| fixture.pool.check_out()))
        .await
        .into_iter()
        .map(|c| c.unwrap())
        .collect();
    let reused: HashSet<u32> = again.iter().map(|c| c.id).collect();
    assert_eq!(reused, ids);
}

#[tokio::test]
async fn stale_check_in_is_closed_and_frees_its_slot() {
    let fixture = pool(ConnectionPoolOptions {
        max_pool_size: Some(1),
        wait_queue_timeout: Some(Duration::from_millis(500)),
        ..ready()
    });
    let mut subscriber = fixture.pool.generation_subscriber();
    let stale = fixture.pool.check_out().await.unwrap();
    let stale_id = stale.id;

    fixture.pool.clear(Error::internal("reset"));
    assert_eq!(
        subscriber
            .wait_for_generation_change(Duration::from_secs(1))
            .await,
        Some(1)
    );
    fixture.pool.mark_as_ready().await;

    drop(stale);
    runtime::delay_for(Duration::from_millis(50)).await;

    let fresh = fixture.pool.check_out().await.unwrap();
    assert_ne!(fresh.id, stale_id);
    assert_eq!(fresh.generation, 1);
}
