//! Handshake and admission scenarios.

use crate::harness::*;

#[tokio::test]
async fn handshake_and_select_roundtrip() {
    let backend = spawn_fake_backend().await;
    let manager = new_manager(&[ns_toml("ns1", backend, "")]);

    let mut client = TestClient::connect(&manager, 1, "127.0.0.1:50000", "u", "p")
        .await
        .expect("handshake should succeed");

    match client.query("SELECT 1").await.unwrap() {
        QueryResponse::Rows { values, .. } => assert_eq!(values, vec!["1".to_string()]),
        other => panic!("expected rows, got {:?}", other),
    }

    // the session survives for a second statement
    match client.query("SELECT 2").await.unwrap() {
        QueryResponse::Rows { values, .. } => assert_eq!(values, vec!["2".to_string()]),
        other => panic!("expected rows, got {:?}", other),
    }
}

#[tokio::test]
async fn wrong_password_is_access_denied() {
    let backend = spawn_fake_backend().await;
    let manager = new_manager(&[ns_toml("ns1", backend, "")]);

    let err = TestClient::connect(&manager, 1, "127.0.0.1:50000", "u", "wrong")
        .await
        .expect_err("handshake must fail");
    assert_eq!(err, 1045);
}

#[tokio::test]
async fn unknown_user_is_access_denied() {
    let backend = spawn_fake_backend().await;
    let manager = new_manager(&[ns_toml("ns1", backend, "")]);

    let err = TestClient::connect(&manager, 1, "127.0.0.1:50000", "nobody", "p")
        .await
        .expect_err("handshake must fail");
    assert_eq!(err, 1045);
}

#[tokio::test]
async fn ip_outside_allowlist_is_rejected_after_handshake() {
    let backend = spawn_fake_backend().await;
    let manager = new_manager(&[ns_toml(
        "ns1",
        backend,
        r#"allowed_ips = ["127.0.0.1/32"]"#,
    )]);

    let err = TestClient::connect(&manager, 1, "10.0.0.5:50000", "u", "p")
        .await
        .expect_err("client outside the allowlist must be rejected");
    assert_eq!(err, 1045);

    // allowed address still connects
    TestClient::connect(&manager, 2, "127.0.0.1:50001", "u", "p")
        .await
        .expect("allowlisted client should connect");
}

#[tokio::test]
async fn connection_cap_admits_exactly_max_clients() {
    let backend = spawn_fake_backend().await;
    let manager = new_manager(&[ns_toml("ns1", backend, "max_client_connections = 2")]);

    let _c1 = TestClient::connect(&manager, 1, "127.0.0.1:50001", "u", "p")
        .await
        .expect("first client fits");
    let _c2 = TestClient::connect(&manager, 2, "127.0.0.1:50002", "u", "p")
        .await
        .expect("second client fits");

    let err = TestClient::connect(&manager, 3, "127.0.0.1:50003", "u", "p")
        .await
        .expect_err("third client exceeds the cap");
    assert_eq!(err, 1040);
}

#[tokio::test]
async fn cap_slot_is_released_on_disconnect() {
    let backend = spawn_fake_backend().await;
    let manager = new_manager(&[ns_toml("ns1", backend, "max_client_connections = 1")]);

    {
        let mut client = TestClient::connect(&manager, 1, "127.0.0.1:50001", "u", "p")
            .await
            .unwrap();
        client.query("SELECT 1").await.unwrap();
        drop(client);
    }

    // wait for the server task to observe the hangup and decrement
    for _ in 0..50 {
        if manager.connection_count("ns1") == 0 {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    }
    assert_eq!(manager.connection_count("ns1"), 0);

    TestClient::connect(&manager, 2, "127.0.0.1:50002", "u", "p")
        .await
        .expect("slot must be reusable after disconnect");
}

#[tokio::test]
async fn use_statement_validates_allowed_dbs() {
    let backend = spawn_fake_backend().await;
    let manager = new_manager(&[ns_toml("ns1", backend, r#"allowed_dbs = ["orders"]"#)]);

    let mut client = TestClient::connect(&manager, 1, "127.0.0.1:50000", "u", "p")
        .await
        .unwrap();

    assert!(matches!(
        client.query("USE orders").await.unwrap(),
        QueryResponse::Ok { .. }
    ));
    assert!(matches!(
        client.query("USE forbidden").await.unwrap(),
        QueryResponse::Err { code: 1046 }
    ));
}

#[tokio::test]
async fn blacklisted_statement_gets_error_but_session_survives() {
    let backend = spawn_fake_backend().await;
    let manager = new_manager(&[ns_toml(
        "ns1",
        backend,
        r#"black_sqls = ["SELECT * FROM forbidden_table"]"#,
    )]);

    let mut client = TestClient::connect(&manager, 1, "127.0.0.1:50000", "u", "p")
        .await
        .unwrap();

    assert!(matches!(
        client.query("SELECT * FROM forbidden_table").await.unwrap(),
        QueryResponse::Err { code: 1105 }
    ));
    // next statement still works
    assert!(matches!(
        client.query("SELECT 3").await.unwrap(),
        QueryResponse::Rows { .. }
    ));
}

#[tokio::test]
async fn quit_closes_the_session() {
    let backend = spawn_fake_backend().await;
    let manager = new_manager(&[ns_toml("ns1", backend, "")]);

    let mut client = TestClient::connect(&manager, 1, "127.0.0.1:50000", "u", "p")
        .await
        .unwrap();

    use futures::SinkExt;
    client
        .framed()
        .send(minerva::protocol::Packet::new(0, vec![0x01u8]))
        .await
        .unwrap();
    assert!(client.is_closed().await);
}
