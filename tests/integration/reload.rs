//! Hot-reload scenarios: epoch detection by live sessions.

use crate::harness::*;

#[tokio::test]
async fn reload_mid_transaction_closes_keep_session_client() {
    let backend = spawn_fake_backend().await;
    let manager = new_manager(&[ns_toml("ns1", backend, "keep_session = true")]);

    let mut tx_client = TestClient::connect(&manager, 1, "127.0.0.1:50001", "u", "p")
        .await
        .unwrap();
    assert!(matches!(
        tx_client.query("BEGIN").await.unwrap(),
        QueryResponse::Ok { .. }
    ));
    assert!(matches!(
        tx_client.query("UPDATE t SET x = 1 WHERE id = 1").await.unwrap(),
        QueryResponse::Ok { .. }
    ));

    // operator reloads the namespace under the open transaction
    manager
        .reload_prepare(&ns_toml("ns1", backend, "keep_session = true"))
        .unwrap();
    manager.reload_commit("ns1").unwrap();

    // next statement is refused and the session is torn down
    match tx_client.query("UPDATE t SET x = 2 WHERE id = 1").await.unwrap() {
        QueryResponse::Err { code } => assert_eq!(code, 902),
        other => panic!("expected tx-ns-changed error, got {:?}", other),
    }
    assert!(tx_client.is_closed().await);
}

#[tokio::test]
async fn reload_outside_transaction_keeps_sessions_alive() {
    let backend = spawn_fake_backend().await;
    let manager = new_manager(&[ns_toml("ns1", backend, "keep_session = true")]);

    let mut client = TestClient::connect(&manager, 1, "127.0.0.1:50001", "u", "p")
        .await
        .unwrap();
    assert!(matches!(
        client.query("SELECT 1").await.unwrap(),
        QueryResponse::Rows { .. }
    ));

    manager
        .reload_prepare(&ns_toml("ns1", backend, "keep_session = true"))
        .unwrap();
    manager.reload_commit("ns1").unwrap();
    assert_eq!(manager.get_namespace("ns1").unwrap().change_index(), 2);

    // the non-transactional session re-acquires against the new namespace
    match client.query("SELECT 5").await.unwrap() {
        QueryResponse::Rows { values, .. } => assert_eq!(values, vec!["5".to_string()]),
        other => panic!("expected rows, got {:?}", other),
    }
}

#[tokio::test]
async fn deleted_namespace_closes_new_requests() {
    let backend = spawn_fake_backend().await;
    let manager = new_manager(&[ns_toml("ns1", backend, "")]);

    let mut client = TestClient::connect(&manager, 1, "127.0.0.1:50001", "u", "p")
        .await
        .unwrap();
    client.query("SELECT 1").await.unwrap();

    manager.delete_namespace("ns1").unwrap();

    client.send_query("SELECT 2").await;
    assert!(client.is_closed().await);
}
