//! Shared fixtures: a scripted backend server, a raw MySQL test client and
//! session spawning helpers.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::io::DuplexStream;
use tokio::net::TcpListener;
use tokio_util::codec::Framed;

use minerva::config::NamespaceConfig;
use minerva::namespace::Manager;
use minerva::protocol::packet::{get_lenenc_int, status::SERVER_STATUS_AUTOCOMMIT};
use minerva::protocol::resultset::{column_types, encode_text_row, parse_text_row, Field};
use minerva::protocol::{
    capabilities, compute_native_auth, EofPacket, ErrPacket, HandshakeResponse, InitialHandshake,
    OkPacket, Packet, PacketCodec,
};
use minerva::session::Session;
use minerva::util::TimeoutWheel;

/// Start a scripted MySQL backend. SELECT statements return a one-column
/// result whose single row echoes the text after `SELECT `; everything
/// else answers OK.
pub async fn spawn_fake_backend() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        let mut next_id = 100u32;
        loop {
            let (stream, _) = match listener.accept().await {
                Ok(v) => v,
                Err(_) => return,
            };
            next_id += 1;
            tokio::spawn(serve_backend_conn(stream, next_id));
        }
    });

    addr
}

async fn serve_backend_conn(stream: tokio::net::TcpStream, connection_id: u32) {
    let mut framed = Framed::new(stream, PacketCodec);

    let greeting = InitialHandshake::new(connection_id, "8.0.25", SERVER_STATUS_AUTOCOMMIT);
    if framed.send(greeting.encode()).await.is_err() {
        return;
    }

    // accept any credentials
    match framed.next().await {
        Some(Ok(_)) => {}
        _ => return,
    }
    let ok = OkPacket::new(SERVER_STATUS_AUTOCOMMIT);
    if framed
        .send(ok.encode(2, capabilities::DEFAULT_CAPABILITIES))
        .await
        .is_err()
    {
        return;
    }

    loop {
        let packet = match framed.next().await {
            Some(Ok(p)) => p,
            _ => return,
        };
        if packet.payload.is_empty() {
            return;
        }
        let cmd = packet.payload[0];
        let body = String::from_utf8_lossy(&packet.payload[1..]).to_string();

        match cmd {
            0x01 => return, // COM_QUIT
            0x03 if body.trim_start().to_ascii_lowercase().starts_with("select") => {
                let value = body.trim_start()[6..].trim().to_string();
                if send_select_result(&mut framed, &value).await.is_err() {
                    return;
                }
            }
            // COM_QUERY non-select, COM_INIT_DB, COM_PING
            0x03 | 0x02 | 0x0e => {
                let ok = OkPacket::new(SERVER_STATUS_AUTOCOMMIT);
                if framed
                    .send(ok.encode(1, capabilities::DEFAULT_CAPABILITIES))
                    .await
                    .is_err()
                {
                    return;
                }
            }
            0x04 => {
                // COM_FIELD_LIST: one column then EOF
                let field = Field::named("id", column_types::MYSQL_TYPE_LONGLONG);
                if framed.send(field.to_packet(1)).await.is_err() {
                    return;
                }
                let eof = EofPacket::new(SERVER_STATUS_AUTOCOMMIT);
                if framed
                    .send(eof.encode(2, capabilities::DEFAULT_CAPABILITIES))
                    .await
                    .is_err()
                {
                    return;
                }
            }
            _ => {
                let err = ErrPacket::new(1047, "08S01", "unknown command");
                if framed
                    .send(err.encode(1, capabilities::DEFAULT_CAPABILITIES))
                    .await
                    .is_err()
                {
                    return;
                }
            }
        }
    }
}

async fn send_select_result(
    framed: &mut Framed<tokio::net::TcpStream, PacketCodec>,
    value: &str,
) -> Result<(), std::io::Error> {
    let caps = capabilities::DEFAULT_CAPABILITIES;

    framed.feed(Packet::new(1, vec![1u8])).await?; // column count
    let field = Field::named("val", column_types::MYSQL_TYPE_VAR_STRING);
    framed.feed(field.to_packet(2)).await?;
    framed
        .feed(EofPacket::new(SERVER_STATUS_AUTOCOMMIT).encode(3, caps))
        .await?;

    let row = vec![Some(bytes::Bytes::copy_from_slice(value.as_bytes()))];
    framed.feed(Packet::new(4, encode_text_row(&row))).await?;
    framed
        .feed(EofPacket::new(SERVER_STATUS_AUTOCOMMIT).encode(5, caps))
        .await?;
    framed.flush().await
}

/// Namespace definition pointing at the fake backend
pub fn ns_toml(name: &str, backend: SocketAddr, extra: &str) -> NamespaceConfig {
    toml::from_str(&format!(
        r#"
        name = "{name}"
        {extra}

        [[users]]
        username = "u"
        password = "p"

        [[slices]]
        name = "slice-0"
        user_name = "proxy"
        password = "proxy_pw"
        master = "{backend}"
        "#,
    ))
    .unwrap()
}

pub fn new_manager(configs: &[NamespaceConfig]) -> Arc<Manager> {
    Manager::new("test", 0, configs)
}

/// Spawn a session over a duplex pipe and return the client-side stream
pub fn spawn_session(
    manager: &Arc<Manager>,
    connection_id: u32,
    peer_addr: &str,
) -> Framed<DuplexStream, PacketCodec> {
    let (client_side, server_side) = tokio::io::duplex(64 * 1024);
    let session = Session::new(
        server_side,
        connection_id,
        peer_addr.to_string(),
        manager.clone(),
        TimeoutWheel::new(),
        Duration::from_secs(60),
    );
    tokio::spawn(async move {
        let _ = session.run().await;
    });
    Framed::new(client_side, PacketCodec)
}

/// What the proxy answered to one statement
#[derive(Debug, PartialEq)]
pub enum QueryResponse {
    Ok { status: u16 },
    Err { code: u16 },
    Rows { values: Vec<String>, eof_status: u16 },
}

#[derive(Debug)]
pub struct TestClient {
    framed: Framed<DuplexStream, PacketCodec>,
}

impl TestClient {
    /// Complete the client side of the handshake; returns the ERR code on
    /// rejection.
    pub async fn connect(
        manager: &Arc<Manager>,
        connection_id: u32,
        peer_addr: &str,
        user: &str,
        password: &str,
    ) -> Result<Self, u16> {
        let mut framed = spawn_session(manager, connection_id, peer_addr);

        let greeting_packet = framed.next().await.unwrap().unwrap();
        let greeting = InitialHandshake::parse(&greeting_packet.payload).unwrap();
        let salt = greeting.auth_plugin_data();

        let response = HandshakeResponse {
            capability_flags: capabilities::CLIENT_LONG_PASSWORD
                | capabilities::CLIENT_PROTOCOL_41
                | capabilities::CLIENT_SECURE_CONNECTION
                | capabilities::CLIENT_TRANSACTIONS
                | capabilities::CLIENT_PLUGIN_AUTH
                | capabilities::CLIENT_MULTI_STATEMENTS
                | capabilities::CLIENT_MULTI_RESULTS,
            max_packet_size: 16 * 1024 * 1024,
            character_set: 45,
            username: user.to_string(),
            auth_response: compute_native_auth(password, &salt),
            database: None,
            auth_plugin_name: "mysql_native_password".to_string(),
        };
        framed.send(response.encode(1)).await.unwrap();

        let reply = framed.next().await.unwrap().unwrap();
        if reply.payload[0] == 0xFF {
            let err = ErrPacket::parse(&reply.payload, capabilities::DEFAULT_CAPABILITIES).unwrap();
            return Err(err.error_code);
        }
        assert_eq!(reply.payload[0], 0x00, "expected OK after handshake");
        Ok(Self { framed })
    }

    pub async fn send_query(&mut self, sql: &str) {
        let mut payload = vec![0x03u8];
        payload.extend_from_slice(sql.as_bytes());
        self.framed.send(Packet::new(0, payload)).await.unwrap();
    }

    pub async fn send_ping(&mut self) {
        self.framed.send(Packet::new(0, vec![0x0eu8])).await.unwrap();
    }

    /// Read one complete response (OK, ERR or a full result set)
    pub async fn read_response(&mut self) -> Option<QueryResponse> {
        let caps = capabilities::DEFAULT_CAPABILITIES;
        let first = self.framed.next().await?.ok()?;

        if first.payload[0] == 0x00 {
            let ok = OkPacket::parse(&first.payload, caps)?;
            return Some(QueryResponse::Ok {
                status: ok.status_flags,
            });
        }
        if first.payload[0] == 0xFF {
            let err = ErrPacket::parse(&first.payload, caps)?;
            return Some(QueryResponse::Err {
                code: err.error_code,
            });
        }

        let (column_count, _) = get_lenenc_int(&first.payload)?;
        let column_count = column_count? as usize;

        for _ in 0..column_count {
            self.framed.next().await?.ok()?;
        }
        // EOF after columns
        let eof = self.framed.next().await?.ok()?;
        assert_eq!(eof.payload[0], 0xFE);

        let mut values = Vec::new();
        loop {
            let packet = self.framed.next().await?.ok()?;
            if packet.payload[0] == 0xFE && packet.payload.len() < 9 {
                let eof = EofPacket::parse(&packet.payload)?;
                return Some(QueryResponse::Rows {
                    values,
                    eof_status: eof.status_flags,
                });
            }
            let row = parse_text_row(&packet.payload, column_count)?;
            for value in row {
                values.push(
                    value
                        .map(|v| String::from_utf8_lossy(&v).to_string())
                        .unwrap_or_else(|| "NULL".to_string()),
                );
            }
        }
    }

    /// Send one statement and read its single response
    pub async fn query(&mut self, sql: &str) -> Option<QueryResponse> {
        self.send_query(sql).await;
        self.read_response().await
    }

    /// True when the proxy has closed its side of the connection
    pub async fn is_closed(&mut self) -> bool {
        match tokio::time::timeout(Duration::from_secs(1), self.framed.next()).await {
            Ok(None) => true,
            Ok(Some(Err(_))) => true,
            _ => false,
        }
    }

    pub fn framed(&mut self) -> &mut Framed<DuplexStream, PacketCodec> {
        &mut self.framed
    }
}
