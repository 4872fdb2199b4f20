//! MULTI/EXEC against the in-process server

mod common;

use common::{within, FakeServer};
use shardline::{Client, Command, ConnectionConfig, RedisError, RespValue};

#[tokio::test]
async fn test_incr_two_fresh_keys() {
    let server = FakeServer::standalone().await;
    let client = Client::new(server.endpoint(), ConnectionConfig::default());

    within(async {
        let mut tx = client.transaction().await.unwrap();
        tx.call(&Command::new("INCR").arg("foo"));
        tx.call(&Command::new("INCR").arg("bar"));
        let replies = tx.execute().await.unwrap().unwrap();

        assert_eq!(replies, vec![RespValue::Integer(1), RespValue::Integer(1)]);
        assert_eq!(client.pool_status().available, 1);
    })
    .await;
}

#[tokio::test]
async fn test_failed_command_does_not_abort_siblings() {
    let server = FakeServer::standalone().await;
    let client = Client::new(server.endpoint(), ConnectionConfig::default());

    within(async {
        client
            .call(&Command::new("LPUSH").arg("a_list").arg("x"))
            .await
            .unwrap();

        let mut tx = client.transaction().await.unwrap();
        tx.call(&Command::new("INCR").arg("a_list"));
        tx.call(&Command::new("SET").arg("sibling").arg("applied"));
        let replies = tx.execute().await.unwrap().unwrap();

        assert_eq!(replies[0].error_code(), Some("WRONGTYPE"));
        assert!(replies[1].is_ok());
        assert_eq!(
            client.call(&Command::new("GET").arg("sibling")).await.unwrap(),
            RespValue::from("applied")
        );
    })
    .await;
}

#[tokio::test]
async fn test_discard_applies_nothing() {
    let server = FakeServer::standalone().await;
    let client = Client::new(server.endpoint(), ConnectionConfig::default());

    within(async {
        let mut tx = client.transaction().await.unwrap();
        tx.call(&Command::new("SET").arg("k").arg("v"));
        tx.discard().await.unwrap();

        assert_eq!(
            client.call(&Command::new("GET").arg("k")).await.unwrap(),
            RespValue::Null
        );
        assert_eq!(server.accepted(), 1);
    })
    .await;
}

#[tokio::test]
async fn test_watch_abort_returns_none() {
    let server = FakeServer::standalone().await;
    let client = Client::new(server.endpoint(), ConnectionConfig::default());

    within(async {
        client
            .call(&Command::new("SET").arg("balance").arg(10))
            .await
            .unwrap();

        let mut tx = client.watch(["balance"]).await.unwrap();
        let balance = tx
            .call_sync(&Command::new("GET").arg("balance"))
            .await
            .unwrap()
            .as_int()
            .unwrap();

        // Another connection changes the watched key.
        client
            .call(&Command::new("SET").arg("balance").arg(99))
            .await
            .unwrap();

        tx.call(&Command::new("SET").arg("balance").arg(balance + 1));
        assert_eq!(tx.execute().await.unwrap(), None);
        assert_eq!(
            client
                .call(&Command::new("GET").arg("balance"))
                .await
                .unwrap()
                .as_int()
                .unwrap(),
            99
        );
    })
    .await;
}

#[tokio::test]
async fn test_watch_commits_when_untouched() {
    let server = FakeServer::standalone().await;
    let client = Client::new(server.endpoint(), ConnectionConfig::default());

    within(async {
        let mut tx = client.watch(["counter"]).await.unwrap();
        tx.call(&Command::new("INCR").arg("counter"));
        assert_eq!(
            tx.execute().await.unwrap(),
            Some(vec![RespValue::Integer(1)])
        );
    })
    .await;
}

#[tokio::test]
async fn test_unknown_command_aborts_exec() {
    let server = FakeServer::standalone().await;
    let client = Client::new(server.endpoint(), ConnectionConfig::default());

    within(async {
        let mut tx = client.transaction().await.unwrap();
        tx.call(&Command::new("SET").arg("k").arg("v"));
        tx.call(&Command::new("NOSUCHCOMMAND"));

        match tx.execute().await {
            Err(RedisError::Server(msg)) => assert!(msg.starts_with("EXECABORT")),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(
            client.call(&Command::new("GET").arg("k")).await.unwrap(),
            RespValue::Null
        );
    })
    .await;
}

#[tokio::test]
async fn test_dropped_transaction_connection_is_not_reused() {
    let server = FakeServer::standalone().await;
    let client = Client::new(server.endpoint(), ConnectionConfig::default());

    within(async {
        let mut tx = client.transaction().await.unwrap();
        tx.call(&Command::new("SET").arg("k").arg("v"));
        drop(tx);

        // A fresh connection is opened; nothing queued was applied.
        assert_eq!(
            client.call(&Command::new("GET").arg("k")).await.unwrap(),
            RespValue::Null
        );
        assert_eq!(server.accepted(), 2);
    })
    .await;
}
