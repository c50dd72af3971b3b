//! Multi-statement handling with MORE_RESULTS_EXISTS chaining.

use minerva::protocol::packet::status::SERVER_MORE_RESULTS_EXISTS;

use crate::harness::*;

#[tokio::test]
async fn multi_statement_sets_more_results_on_all_but_last() {
    let backend = spawn_fake_backend().await;
    let manager = new_manager(&[ns_toml("ns1", backend, "support_multi_query = true")]);

    let mut client = TestClient::connect(&manager, 1, "127.0.0.1:50000", "u", "p")
        .await
        .unwrap();

    client.send_query("SELECT 1;SELECT 2;").await;

    match client.read_response().await.unwrap() {
        QueryResponse::Rows { values, eof_status } => {
            assert_eq!(values, vec!["1".to_string()]);
            assert_ne!(
                eof_status & SERVER_MORE_RESULTS_EXISTS,
                0,
                "first result must advertise more results"
            );
        }
        other => panic!("expected rows, got {:?}", other),
    }

    match client.read_response().await.unwrap() {
        QueryResponse::Rows { values, eof_status } => {
            assert_eq!(values, vec!["2".to_string()]);
            assert_eq!(
                eof_status & SERVER_MORE_RESULTS_EXISTS,
                0,
                "last result must not advertise more results"
            );
        }
        other => panic!("expected rows, got {:?}", other),
    }
}

#[tokio::test]
async fn multi_statement_disabled_namespace_treats_input_as_one_statement() {
    let backend = spawn_fake_backend().await;
    let manager = new_manager(&[ns_toml("ns1", backend, "")]);

    let mut client = TestClient::connect(&manager, 1, "127.0.0.1:50000", "u", "p")
        .await
        .unwrap();

    // the fake backend echoes everything after SELECT, confirming no split
    match client.query("SELECT 1;SELECT 2").await.unwrap() {
        QueryResponse::Rows { values, .. } => {
            assert_eq!(values, vec!["1;SELECT 2".to_string()]);
        }
        other => panic!("expected rows, got {:?}", other),
    }
}
