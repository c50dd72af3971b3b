use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::OwnedSemaphorePermit;
use tokio_util::codec::Framed;
use tracing::{debug, error};

use crate::protocol::packet::{eof_status, get_lenenc_int, Command};
use crate::protocol::resultset::{parse_text_row, Field, ResultSet};
use crate::protocol::{
    capabilities, compute_native_auth, is_eof_packet, is_err_packet, is_ok_packet, ErrPacket,
    HandshakeResponse, InitialHandshake, OkPacket, Packet, PacketCodec, SqlError,
};

use super::pool::ConnPool;
use super::ConnectionError;

/// Endpoint and credentials for one backend instance
#[derive(Debug, Clone)]
pub struct BackendAddr {
    pub addr: String,
    pub user: String,
    pub password: String,
    pub database: Option<String>,
}

/// A proxied connection to one backend MySQL instance
pub struct PooledConn {
    framed: Framed<TcpStream, PacketCodec>,
    /// Backend-assigned connection id, from its initial handshake
    id: u32,
    capabilities: u32,
    addr: String,
    server_version: String,
    created_at: Instant,
    last_used_at: Instant,
    closed: bool,
    current_db: Option<String>,
    autocommit: bool,
    /// Pool to return to on recycle; None for unpooled test connections
    pub(super) home: Option<Arc<ConnPool>>,
    /// Capacity permit held while checked out
    pub(super) permit: Option<OwnedSemaphorePermit>,
}

impl PooledConn {
    /// Dial a backend and complete the native-password handshake
    pub async fn connect(backend: &BackendAddr) -> Result<Self, ConnectionError> {
        debug!(addr = %backend.addr, "connecting to backend");

        let stream = TcpStream::connect(&backend.addr).await.map_err(|e| {
            error!(addr = %backend.addr, error = %e, "backend dial failed");
            ConnectionError::Connect(e.to_string())
        })?;
        stream
            .set_nodelay(true)
            .map_err(|e| ConnectionError::Connect(e.to_string()))?;

        let mut framed = Framed::new(stream, PacketCodec);

        let greeting = framed
            .next()
            .await
            .ok_or(ConnectionError::Disconnected)?
            .map_err(|e| ConnectionError::Io(e.to_string()))?;

        let handshake = InitialHandshake::parse(&greeting.payload)
            .ok_or_else(|| ConnectionError::Protocol("invalid backend handshake".into()))?;

        let salt = handshake.auth_plugin_data();
        let auth_response = compute_native_auth(&backend.password, &salt);

        let mut caps = capabilities::DEFAULT_CAPABILITIES & handshake.capability_flags;
        if backend.database.is_some() {
            caps |= capabilities::CLIENT_CONNECT_WITH_DB;
        }

        let response = HandshakeResponse {
            capability_flags: caps,
            max_packet_size: 16 * 1024 * 1024,
            character_set: 0x21,
            username: backend.user.clone(),
            auth_response,
            database: backend.database.clone(),
            auth_plugin_name: handshake.auth_plugin_name.clone(),
        };

        framed
            .send(response.encode(1))
            .await
            .map_err(|e| ConnectionError::Io(e.to_string()))?;

        let reply = framed
            .next()
            .await
            .ok_or(ConnectionError::Disconnected)?
            .map_err(|e| ConnectionError::Io(e.to_string()))?;

        if is_err_packet(&reply.payload) {
            let err = ErrPacket::parse(&reply.payload, caps)
                .unwrap_or_else(|| ErrPacket::new(1045, "28000", "Access denied"));
            error!(
                addr = %backend.addr,
                code = err.error_code,
                message = %err.error_message,
                "backend authentication failed"
            );
            return Err(ConnectionError::Auth(err.error_message));
        }
        if !is_ok_packet(&reply.payload) {
            return Err(ConnectionError::Protocol(
                "expected OK packet from backend".into(),
            ));
        }

        let now = Instant::now();
        Ok(Self {
            framed,
            id: handshake.connection_id,
            capabilities: caps,
            addr: backend.addr.clone(),
            server_version: handshake.server_version,
            created_at: now,
            last_used_at: now,
            closed: false,
            current_db: backend.database.clone(),
            autocommit: true,
            home: None,
            permit: None,
        })
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    pub fn server_version(&self) -> &str {
        &self.server_version
    }

    /// Backend versions from 8.0.3 drop the tx_read_only variable name
    pub fn supports_transaction_read_only(&self) -> bool {
        let mut parts = self.server_version.split('.');
        let major: u32 = parts.next().and_then(|v| v.parse().ok()).unwrap_or(0);
        let minor: u32 = parts.next().and_then(|v| v.parse().ok()).unwrap_or(0);
        let patch: u32 = parts
            .next()
            .map(|v| v.chars().take_while(|c| c.is_ascii_digit()).collect::<String>())
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);
        (major, minor, patch) >= (8, 0, 3)
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn close(&mut self) {
        self.closed = true;
    }

    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    pub fn idle_for(&self) -> Duration {
        self.last_used_at.elapsed()
    }

    pub(super) fn touch(&mut self) {
        self.last_used_at = Instant::now();
    }

    /// Return this connection to its pool; the pool drops closed conns and
    /// settles its counters either way. Unpooled conns just drop.
    pub async fn recycle(mut self) {
        let home = self.home.take();
        if let Some(pool) = home {
            pool.put(self).await;
        }
    }

    /// Send a command packet (sequence restarts at 0 per command)
    pub async fn write_command(&mut self, cmd: Command, payload: &[u8]) -> Result<(), ConnectionError> {
        self.touch();
        let mut buf = BytesMut::with_capacity(payload.len() + 1);
        buf.extend_from_slice(&[cmd as u8]);
        buf.extend_from_slice(payload);
        self.framed
            .send(Packet::new(0, buf.freeze()))
            .await
            .map_err(|e| {
                self.closed = true;
                ConnectionError::Io(e.to_string())
            })
    }

    /// Read one packet payload from the backend
    pub async fn read_packet(&mut self) -> Result<Bytes, ConnectionError> {
        match self.framed.next().await {
            Some(Ok(packet)) => Ok(packet.payload),
            Some(Err(e)) => {
                self.closed = true;
                Err(ConnectionError::Io(e.to_string()))
            }
            None => {
                self.closed = true;
                Err(ConnectionError::Disconnected)
            }
        }
    }

    fn server_error(payload: &Bytes, caps: u32) -> ConnectionError {
        match ErrPacket::parse(payload, caps) {
            Some(err) => ConnectionError::Server(SqlError {
                code: err.error_code,
                state: err.sql_state,
                message: err.error_message,
            }),
            None => ConnectionError::Protocol("malformed ERR packet".into()),
        }
    }

    /// Execute a statement and buffer the complete result
    pub async fn execute(&mut self, sql: &str) -> Result<ResultSet, ConnectionError> {
        let mut result = self.execute_stream(sql).await?;
        if !result.has_rows() {
            return Ok(result);
        }

        let column_count = result.fields.len();
        loop {
            let payload = self.read_packet().await?;
            if is_eof_packet(&payload) {
                result.status |= eof_status(&payload);
                break;
            }
            if is_err_packet(&payload) {
                return Err(Self::server_error(&payload, self.capabilities));
            }
            let row = parse_text_row(&payload, column_count)
                .ok_or_else(|| ConnectionError::Protocol("malformed row packet".into()))?;
            result.rows.push(row);
        }

        Ok(result)
    }

    /// Execute a statement and stop after the column block, leaving the row
    /// cursor on the wire for a streaming writer.
    pub async fn execute_stream(&mut self, sql: &str) -> Result<ResultSet, ConnectionError> {
        self.write_command(Command::Query, sql.as_bytes()).await?;
        self.read_result_header().await
    }

    /// Read OK/ERR or the column block of a result set
    async fn read_result_header(&mut self) -> Result<ResultSet, ConnectionError> {
        let first = self.read_packet().await?;

        if is_ok_packet(&first) {
            let ok = OkPacket::parse(&first, self.capabilities)
                .ok_or_else(|| ConnectionError::Protocol("malformed OK packet".into()))?;
            return Ok(ResultSet::ok(
                ok.affected_rows,
                ok.last_insert_id,
                ok.status_flags,
            ));
        }
        if is_err_packet(&first) {
            return Err(Self::server_error(&first, self.capabilities));
        }

        let (column_count, _) = get_lenenc_int(&first)
            .ok_or_else(|| ConnectionError::Protocol("malformed column count".into()))?;
        let column_count = column_count.unwrap_or(0) as usize;

        let mut fields = Vec::with_capacity(column_count);
        for _ in 0..column_count {
            let payload = self.read_packet().await?;
            let field = Field::parse(&payload)
                .ok_or_else(|| ConnectionError::Protocol("malformed column definition".into()))?;
            fields.push(field);
        }

        // EOF terminating the column block
        let eof = self.read_packet().await?;
        if !is_eof_packet(&eof) {
            return Err(ConnectionError::Protocol(
                "expected EOF after column definitions".into(),
            ));
        }

        Ok(ResultSet::with_rows(fields, Vec::new()))
    }

    /// COM_FIELD_LIST: column definitions for one table
    pub async fn field_list(
        &mut self,
        table: &str,
        wildcard: &str,
    ) -> Result<Vec<Field>, ConnectionError> {
        let mut payload = Vec::with_capacity(table.len() + wildcard.len() + 1);
        payload.extend_from_slice(table.as_bytes());
        payload.push(0);
        payload.extend_from_slice(wildcard.as_bytes());
        self.write_command(Command::FieldList, &payload).await?;

        let mut fields = Vec::new();
        loop {
            let reply = self.read_packet().await?;
            if is_eof_packet(&reply) {
                return Ok(fields);
            }
            if is_err_packet(&reply) {
                return Err(Self::server_error(&reply, self.capabilities));
            }
            let field = Field::parse(&reply)
                .ok_or_else(|| ConnectionError::Protocol("malformed column definition".into()))?;
            fields.push(field);
        }
    }

    /// COM_PING bounded by a timeout; failure marks the connection bad
    pub async fn ping_with_timeout(&mut self, timeout: Duration) -> Result<(), ConnectionError> {
        let ping = async {
            self.write_command(Command::Ping, &[]).await?;
            let reply = self.read_packet().await?;
            if is_ok_packet(&reply) {
                Ok(())
            } else {
                Err(ConnectionError::Protocol("unexpected ping reply".into()))
            }
        };
        match tokio::time::timeout(timeout, ping).await {
            Ok(result) => result,
            Err(_) => {
                self.closed = true;
                Err(ConnectionError::Io("ping timed out".into()))
            }
        }
    }

    async fn exec_simple(&mut self, sql: &str) -> Result<(), ConnectionError> {
        self.execute(sql).await.map(|_| ())
    }

    pub async fn set_autocommit(&mut self, on: bool) -> Result<(), ConnectionError> {
        if self.autocommit == on {
            return Ok(());
        }
        self.exec_simple(if on { "SET autocommit = 1" } else { "SET autocommit = 0" })
            .await?;
        self.autocommit = on;
        Ok(())
    }

    pub async fn begin(&mut self) -> Result<(), ConnectionError> {
        self.exec_simple("BEGIN").await
    }

    pub async fn commit(&mut self) -> Result<(), ConnectionError> {
        self.exec_simple("COMMIT").await
    }

    pub async fn rollback(&mut self) -> Result<(), ConnectionError> {
        self.exec_simple("ROLLBACK").await
    }

    /// COM_INIT_DB when the session db differs from the connection's
    pub async fn use_db(&mut self, db: &str) -> Result<(), ConnectionError> {
        if self.current_db.as_deref() == Some(db) {
            return Ok(());
        }
        self.write_command(Command::InitDb, db.as_bytes()).await?;
        let reply = self.read_packet().await?;
        if is_err_packet(&reply) {
            return Err(Self::server_error(&reply, self.capabilities));
        }
        self.current_db = Some(db.to_string());
        Ok(())
    }

    /// Apply session charset and variables before first use
    pub async fn sync_session(
        &mut self,
        charset: &str,
        variables: &[(String, String)],
    ) -> Result<(), ConnectionError> {
        self.exec_simple(&format!("SET NAMES '{}'", charset)).await?;
        for (name, value) in variables {
            self.exec_simple(&format!("SET {} = {}", name, value)).await?;
        }
        Ok(())
    }
}

impl Drop for PooledConn {
    fn drop(&mut self) {
        // a conn dropped without going through recycle still settles its
        // pool counters; the permit field releases the capacity slot
        if let Some(pool) = self.home.take() {
            pool.note_dropped();
        }
    }
}
