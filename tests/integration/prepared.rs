//! Prepared-statement protocol: PREPARE / EXECUTE / CLOSE over the wire.

use futures::{SinkExt, StreamExt};

use minerva::protocol::Packet;

use crate::harness::*;

/// Read a prepare response and return (stmt_id, param_count)
async fn read_prepare_ok(client: &mut TestClient) -> (u32, u16) {
    let first = client.framed().next().await.unwrap().unwrap();
    assert_eq!(first.payload[0], 0x00, "expected prepare OK");
    let stmt_id = u32::from_le_bytes([
        first.payload[1],
        first.payload[2],
        first.payload[3],
        first.payload[4],
    ]);
    let column_count = u16::from_le_bytes([first.payload[5], first.payload[6]]);
    let param_count = u16::from_le_bytes([first.payload[7], first.payload[8]]);

    // param placeholder block: param_count fields then EOF
    for _ in 0..param_count {
        client.framed().next().await.unwrap().unwrap();
    }
    if param_count > 0 {
        let eof = client.framed().next().await.unwrap().unwrap();
        assert_eq!(eof.payload[0], 0xFE);
    }
    for _ in 0..column_count {
        client.framed().next().await.unwrap().unwrap();
    }
    if column_count > 0 {
        let eof = client.framed().next().await.unwrap().unwrap();
        assert_eq!(eof.payload[0], 0xFE);
    }

    (stmt_id, param_count)
}

#[tokio::test]
async fn prepare_execute_close_roundtrip() {
    let backend = spawn_fake_backend().await;
    let manager = new_manager(&[ns_toml("ns1", backend, "")]);

    let mut client = TestClient::connect(&manager, 1, "127.0.0.1:50000", "u", "p")
        .await
        .unwrap();

    // COM_STMT_PREPARE
    let mut payload = vec![0x16u8];
    payload.extend_from_slice(b"SELECT ?");
    client
        .framed()
        .send(Packet::new(0, payload))
        .await
        .unwrap();
    let (stmt_id, param_count) = read_prepare_ok(&mut client).await;
    assert_eq!(param_count, 1);

    // COM_STMT_EXECUTE binding 42 as a 4-byte integer
    let mut payload = vec![0x17u8];
    payload.extend_from_slice(&stmt_id.to_le_bytes());
    payload.push(0); // flags
    payload.extend_from_slice(&1u32.to_le_bytes()); // iteration count
    payload.push(0); // null bitmap
    payload.push(1); // new params bound
    payload.extend_from_slice(&(0x03u16).to_le_bytes()); // MYSQL_TYPE_LONG
    payload.extend_from_slice(&42i32.to_le_bytes());
    client
        .framed()
        .send(Packet::new(0, payload))
        .await
        .unwrap();

    // binary result set: column count, column, EOF, row, EOF
    let count = client.framed().next().await.unwrap().unwrap();
    assert_eq!(count.payload[0], 1);
    let _column = client.framed().next().await.unwrap().unwrap();
    let eof = client.framed().next().await.unwrap().unwrap();
    assert_eq!(eof.payload[0], 0xFE);

    let row = client.framed().next().await.unwrap().unwrap();
    assert_eq!(row.payload[0], 0x00, "binary row header");
    // header byte, one null-bitmap byte, then a length-encoded value
    let value_len = row.payload[2] as usize;
    let value = &row.payload[3..3 + value_len];
    assert_eq!(value, b"42");

    let eof = client.framed().next().await.unwrap().unwrap();
    assert_eq!(eof.payload[0], 0xFE);

    // COM_STMT_CLOSE has no response; a following query must still work
    let mut payload = vec![0x19u8];
    payload.extend_from_slice(&stmt_id.to_le_bytes());
    client
        .framed()
        .send(Packet::new(0, payload))
        .await
        .unwrap();

    match client.query("SELECT 7").await.unwrap() {
        QueryResponse::Rows { values, .. } => assert_eq!(values, vec!["7".to_string()]),
        other => panic!("expected rows, got {:?}", other),
    }

    // executing the closed statement now errors but keeps the session
    let mut payload = vec![0x17u8];
    payload.extend_from_slice(&stmt_id.to_le_bytes());
    payload.push(0);
    payload.extend_from_slice(&1u32.to_le_bytes());
    payload.push(0);
    payload.push(1);
    payload.extend_from_slice(&(0x03u16).to_le_bytes());
    payload.extend_from_slice(&1i32.to_le_bytes());
    client
        .framed()
        .send(Packet::new(0, payload))
        .await
        .unwrap();
    match client.read_response().await.unwrap() {
        QueryResponse::Err { code } => assert_eq!(code, 1243),
        other => panic!("expected unknown-statement error, got {:?}", other),
    }
}
