//! QPS admission scenarios.

use crate::harness::*;

#[tokio::test]
async fn drained_bucket_in_transaction_closes_session() {
    let backend = spawn_fake_backend().await;
    let manager = new_manager(&[ns_toml(
        "ns1",
        backend,
        "client_qps_limit = 1\nsupport_limit_tx = true",
    )]);

    let mut client = TestClient::connect(&manager, 1, "127.0.0.1:50000", "u", "p")
        .await
        .unwrap();

    // the single token pays for BEGIN; the bucket is now empty
    assert!(matches!(
        client.query("BEGIN").await.unwrap(),
        QueryResponse::Ok { .. }
    ));

    match client.query("UPDATE t SET x = 1").await.unwrap() {
        QueryResponse::Err { code } => assert_eq!(code, 901),
        other => panic!("expected qps-limited error, got {:?}", other),
    }
    assert!(
        client.is_closed().await,
        "in-transaction limiter rejection must close the session"
    );
}

#[tokio::test]
async fn drained_bucket_outside_transaction_keeps_session_open() {
    let backend = spawn_fake_backend().await;
    let manager = new_manager(&[ns_toml(
        "ns1",
        backend,
        "client_qps_limit = 1\nsupport_limit_tx = false",
    )]);

    let mut client = TestClient::connect(&manager, 1, "127.0.0.1:50000", "u", "p")
        .await
        .unwrap();

    assert!(matches!(
        client.query("SELECT 1").await.unwrap(),
        QueryResponse::Rows { .. }
    ));

    match client.query("SELECT 2").await.unwrap() {
        QueryResponse::Err { code } => assert_eq!(code, 901),
        other => panic!("expected qps-limited error, got {:?}", other),
    }

    // session stays usable; PING does not consume tokens
    client.send_ping().await;
    assert!(matches!(
        client.read_response().await.unwrap(),
        QueryResponse::Ok { .. }
    ));
}

#[tokio::test]
async fn limit_tx_disabled_spares_transaction_statements() {
    let backend = spawn_fake_backend().await;
    let manager = new_manager(&[ns_toml(
        "ns1",
        backend,
        "client_qps_limit = 1\nsupport_limit_tx = false",
    )]);

    let mut client = TestClient::connect(&manager, 1, "127.0.0.1:50000", "u", "p")
        .await
        .unwrap();

    assert!(matches!(
        client.query("BEGIN").await.unwrap(),
        QueryResponse::Ok { .. }
    ));
    // bucket is drained, but in-transaction statements bypass the gate
    for _ in 0..3 {
        assert!(matches!(
            client.query("UPDATE t SET x = 1").await.unwrap(),
            QueryResponse::Ok { .. }
        ));
    }
    assert!(matches!(
        client.query("COMMIT").await.unwrap(),
        QueryResponse::Ok { .. }
    ));
}
