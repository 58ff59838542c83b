//! End-to-end scenarios against a real follower/leader pair connected over
//! an in-memory duplex stream, covering the literal I/O scenarios in
//! `spec.md §8`.

use std::sync::Arc;

use sqlrelay::{Connection, ConnectionOptions, Error, FixedRole, RoleAssignment};
use sqlrelay_engine::{serve_connection, LeaderEngine, PeerId};
use sqlrelay_net::Transport;
use tokio::sync::Mutex;

/// Spawns a leader engine behind an in-memory duplex pair and returns a
/// follower [`Connection`] wired to it.
async fn follower_connection() -> Connection {
    let engine = Arc::new(Mutex::new(LeaderEngine::open_in_memory().await.unwrap()));

    let (client_io, server_io) = tokio::io::duplex(64 * 1024);
    tokio::spawn(serve_connection(PeerId(1), server_io, engine));

    let (transport, _incoming) = Transport::new(client_io);
    Connection::new(
        FixedRole::new(RoleAssignment::Follower(transport)),
        ConnectionOptions::default(),
    )
}

#[tokio::test]
async fn create_and_execute_non_query_on_empty_table() {
    let connection = follower_connection().await;
    let mut command = connection.command("CREATE TABLE t(x INTEGER)");
    let changes = command.execute_non_query().await.unwrap();
    assert_eq!(changes, 0);
    command.dispose().await;
}

#[tokio::test]
async fn insert_reports_one_row_changed() {
    let connection = follower_connection().await;
    connection
        .command("CREATE TABLE t(x INTEGER)")
        .execute_non_query()
        .await
        .unwrap();

    let mut insert = connection.command("INSERT INTO t VALUES(42)");
    assert_eq!(insert.execute_non_query().await.unwrap(), 1);
}

#[tokio::test]
async fn read_one_row_then_exhaust_cursor() {
    let connection = follower_connection().await;
    connection
        .command("CREATE TABLE t(x INTEGER)")
        .execute_non_query()
        .await
        .unwrap();
    connection
        .command("INSERT INTO t VALUES(42)")
        .execute_non_query()
        .await
        .unwrap();

    let mut select = connection.command("SELECT x FROM t");
    let mut reader = select.execute_reader(0).await.unwrap();
    assert_eq!(reader.columns().len(), 1);
    assert_eq!(reader.columns()[0].name, "x");

    assert!(reader.read().await.unwrap());
    assert_eq!(reader.get_int32(0).await.unwrap(), Some(42));

    assert!(!reader.read().await.unwrap());
    // Read terminality (spec.md §8, property 5): still false, and Get* now fails.
    assert!(!reader.read().await.unwrap());
    assert!(matches!(
        reader.get_int32(0).await,
        Err(Error::InvalidOperation(_))
    ));
}

#[tokio::test]
async fn unknown_column_name_yields_negative_one() {
    let connection = follower_connection().await;
    connection
        .command("CREATE TABLE t(x INTEGER)")
        .execute_non_query()
        .await
        .unwrap();

    let mut select = connection.command("SELECT x FROM t");
    let reader = select.execute_reader(0).await.unwrap();
    assert_eq!(reader.get_ordinal("missing").await.unwrap(), -1);
}

#[tokio::test]
async fn bad_sql_surfaces_as_server_exception() {
    let connection = follower_connection().await;
    let mut command = connection.command("NOT SQL");
    let error = command.execute_non_query().await.unwrap_err();
    assert!(matches!(error, Error::ServerException(_)));
}

#[tokio::test]
async fn disconnect_mid_flight_fails_the_worker() {
    let engine = Arc::new(Mutex::new(LeaderEngine::open_in_memory().await.unwrap()));
    let (client_io, server_io) = tokio::io::duplex(64 * 1024);
    let server_task = tokio::spawn(serve_connection(PeerId(1), server_io, engine));

    let (transport, _incoming) = Transport::new(client_io);
    let connection = Connection::new(
        FixedRole::new(RoleAssignment::Follower(transport)),
        ConnectionOptions::default(),
    );

    let mut command = connection.command("CREATE TABLE t(x INTEGER)");
    // Force the worker into existence, then kill the leader side so the
    // next call observes `Disconnected`.
    command.execute_non_query().await.unwrap();
    server_task.abort();
    let _ = server_task.await;

    let error = command.execute_non_query().await.unwrap_err();
    assert!(matches!(error, Error::Disconnected));
}

#[tokio::test]
async fn empty_command_text_is_invalid_operation() {
    let connection = follower_connection().await;
    let mut command = connection.command("   ");
    let error = command.execute_non_query().await.unwrap_err();
    assert!(matches!(error, Error::InvalidOperation(_)));
}
