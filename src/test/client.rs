use std::time::Duration;

use pretty_assertions::assert_eq;

use super::{
    util::{FailCommandOptions, FailPoint, FailPointMode},
    MockDeployment,
};
use crate::{
    bson::{doc, Document},
    error::{ErrorKind, WriteFailure},
    Client,
};

#[tokio::test]
async fn runs_commands_against_the_selected_server() {
    let mock = MockDeployment::standalone();
    let client = mock.client();

    let reply = client
        .database("admin")
        .run_command(doc! { "ping": 1 }, None)
        .await
        .unwrap();
    assert_eq!(reply.get_i32("ok"), Ok(1));

    let pings = mock.commands_named("ping");
    assert_eq!(pings.len(), 1);
    assert_eq!(pings[0].get_str("$db"), Ok("admin"));
}

#[tokio::test]
async fn unknown_command_surfaces_server_error() {
    let mock = MockDeployment::standalone();
    let client = mock.client();

    let error = client
        .database("db")
        .run_command(doc! { "frobnicate": 1 }, None)
        .await
        .unwrap_err();
    match *error.kind {
        ErrorKind::Command(ref e) => {
            assert_eq!(e.code, 59);
            assert_eq!(e.code_name, "CommandNotFound");
        }
        ref other => panic!("unexpected error {other:?}"),
    }
}

#[tokio::test]
async fn retries_reads_once() {
    let mock = MockDeployment::standalone();
    let client = mock.client();
    let coll = client.database("db").collection::<Document>("coll");
    coll.insert_one(doc! { "x": 1 }, None).await.unwrap();

    FailPoint::fail_command(
        &["find"],
        FailPointMode::Times(1),
        FailCommandOptions::builder().error_code(6).build(),
    )
    .enable(&client)
    .await
    .unwrap();
    mock.clear_commands();

    let found = coll.find_one(doc! { "x": 1 }, None).await.unwrap();
    assert!(found.is_some());
    assert_eq!(mock.commands_named("find").len(), 2);
}

#[tokio::test]
async fn second_read_failure_is_returned() {
    let mock = MockDeployment::standalone();
    let client = mock.client();

    FailPoint::fail_command(
        &["find"],
        FailPointMode::Times(2),
        FailCommandOptions::builder().error_code(6).build(),
    )
    .enable(&client)
    .await
    .unwrap();

    let error = client
        .database("db")
        .collection::<Document>("coll")
        .find_one(None, None)
        .await
        .unwrap_err();
    assert!(matches!(*error.kind, ErrorKind::Command(ref e) if e.code == 6));
    assert_eq!(mock.commands_named("find").len(), 2);
}

#[tokio::test]
async fn retries_writes_after_network_error() {
    let mock = MockDeployment::replica_set();
    let client = mock.client();

    FailPoint::fail_command(
        &["insert"],
        FailPointMode::Times(1),
        FailCommandOptions::builder().close_connection(true).build(),
    )
    .enable(&client)
    .await
    .unwrap();

    client
        .database("db")
        .collection::<Document>("coll")
        .insert_one(doc! { "_id": 1 }, None)
        .await
        .unwrap();
    assert_eq!(mock.commands_named("insert").len(), 2);
    assert_eq!(mock.documents("db.coll"), vec![doc! { "_id": 1 }]);
}

#[tokio::test]
async fn retries_writes_labelled_by_server() {
    let mock = MockDeployment::replica_set();
    let client = mock.client();

    FailPoint::fail_command(
        &["update"],
        FailPointMode::Times(1),
        FailCommandOptions::builder()
            .error_code(6)
            .error_labels(vec!["RetryableWriteError".to_string()])
            .build(),
    )
    .enable(&client)
    .await
    .unwrap();

    let coll = client.database("db").collection::<Document>("coll");
    let result = coll
        .update_one(doc! { "_id": 1 }, doc! { "$set": { "x": 1 } }, None)
        .await
        .unwrap();
    assert_eq!(result.matched_count, 0);
    assert_eq!(mock.commands_named("update").len(), 2);
}

#[tokio::test]
async fn standalone_does_not_retry_writes() {
    let mock = MockDeployment::standalone();
    let client = mock.client();

    FailPoint::fail_command(
        &["insert"],
        FailPointMode::AlwaysOn,
        FailCommandOptions::builder().close_connection(true).build(),
    )
    .enable(&client)
    .await
    .unwrap();

    let error = client
        .database("db")
        .collection::<Document>("coll")
        .insert_one(doc! { "x": 1 }, None)
        .await
        .unwrap_err();
    assert!(error.is_network_error(), "{error}");
    assert_eq!(mock.commands_named("insert").len(), 1);
}

#[tokio::test]
async fn write_concern_errors_are_reported() {
    let mock = MockDeployment::standalone();
    let client = mock.client();

    FailPoint::fail_command(
        &["insert"],
        FailPointMode::Times(1),
        FailCommandOptions::builder()
            .write_concern_error(doc! { "code": 64, "errmsg": "waiting for replication timed out" })
            .build(),
    )
    .enable(&client)
    .await
    .unwrap();

    let error = client
        .database("db")
        .collection::<Document>("coll")
        .insert_one(doc! { "x": 1 }, None)
        .await
        .unwrap_err();
    match *error.kind {
        ErrorKind::Write(WriteFailure::WriteConcernError(ref e)) => assert_eq!(e.code, 64),
        ref other => panic!("unexpected error {other:?}"),
    }
    // The write itself still happened.
    assert_eq!(mock.documents("db.coll").len(), 1);
}

#[tokio::test]
async fn server_selection_times_out_when_unreachable() {
    let mock = MockDeployment::standalone();
    mock.set_refuse_connections(true);
    let mut options = mock.client_options();
    options.server_selection_timeout = Some(Duration::from_millis(200));
    let client = Client::with_options(options).unwrap();

    let error = client
        .database("db")
        .run_command(doc! { "ping": 1 }, None)
        .await
        .unwrap_err();
    assert!(error.is_server_selection_error(), "{error}");
    assert!(mock.commands().is_empty());
}

#[tokio::test]
async fn recovers_once_server_is_reachable() {
    let mock = MockDeployment::standalone();
    mock.set_refuse_connections(true);
    let client = mock.client();

    let ping = {
        let client = client.clone();
        tokio::spawn(async move {
            client
                .database("admin")
                .run_command(doc! { "ping": 1 }, None)
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    mock.set_refuse_connections(false);

    ping.await.unwrap().unwrap();
    assert!(mock.connections_opened() >= 2);
}

#[tokio::test]
async fn shutdown_fails_later_operations() {
    let mock = MockDeployment::standalone();
    let client = mock.client();
    let handle = client.clone();
    client
        .database("admin")
        .run_command(doc! { "ping": 1 }, None)
        .await
        .unwrap();

    client.shutdown().await;

    let error = handle
        .database("admin")
        .run_command(doc! { "ping": 1 }, None)
        .await
        .unwrap_err();
    assert!(matches!(*error.kind, ErrorKind::Shutdown), "{error}");
}
