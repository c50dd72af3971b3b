//! Framed client connection: owns the socket, the negotiated capability
//! bits and the packet sequence discipline. Every write continues the
//! sequence of the exchange it belongs to; the session resets the sequence
//! to 0 before reading each new command.

use bytes::{Bytes, BytesMut};
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::Framed;
use tracing::debug;

use crate::backend::{ConnectionError, PooledConn};

use super::codec::PacketCodec;
use super::handshake::{EofPacket, ErrPacket, OkPacket};
use super::packet::{
    self, capabilities, is_eof_packet, is_err_packet, put_lenenc_int, Packet,
};
use super::resultset::{encode_binary_row, parse_text_row, Field, ResultSet};
use super::SqlError;

/// Client-side framed connection with sequence tracking
pub struct ClientConn<S> {
    framed: Framed<S, PacketCodec>,
    pub connection_id: u32,
    /// Capability bits negotiated at handshake
    pub capability: u32,
    sequence: u8,
    /// Bytes written since the last `take_written`, for flow accounting
    written: usize,
}

impl<S> ClientConn<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(stream: S, connection_id: u32) -> Self {
        Self {
            framed: Framed::new(stream, PacketCodec),
            connection_id,
            capability: capabilities::DEFAULT_CAPABILITIES,
            sequence: 0,
            written: 0,
        }
    }

    /// Reset the sequence counter for a new logical exchange
    pub fn set_sequence(&mut self, sequence: u8) {
        self.sequence = sequence;
    }

    /// Bytes written since the previous call, for write-flow accounting
    pub fn take_written(&mut self) -> usize {
        std::mem::take(&mut self.written)
    }

    async fn send_packet(&mut self, packet: Packet) -> Result<(), std::io::Error> {
        self.written += packet.payload.len() + 4;
        self.framed.send(packet).await
    }

    async fn feed_packet(&mut self, packet: Packet) -> Result<(), std::io::Error> {
        self.written += packet.payload.len() + 4;
        self.framed.feed(packet).await
    }

    /// Read one packet payload, enforcing sequence continuity
    pub async fn read_packet(&mut self) -> Result<Bytes, std::io::Error> {
        let packet = match self.framed.next().await {
            Some(Ok(p)) => p,
            Some(Err(e)) => return Err(e),
            None => {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "client closed connection",
                ))
            }
        };

        if packet.sequence_id != self.sequence {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!(
                    "packet sequence mismatch, expected {}, got {}",
                    self.sequence, packet.sequence_id
                ),
            ));
        }
        self.sequence = self.sequence.wrapping_add(1);
        Ok(packet.payload)
    }

    /// Write one payload with the current sequence number, without flushing
    async fn feed_payload(&mut self, payload: Bytes) -> Result<(), std::io::Error> {
        let packet = Packet::new(self.sequence, payload);
        self.sequence = self.sequence.wrapping_add(1);
        self.feed_packet(packet).await
    }

    /// Write one payload and flush
    pub async fn write_payload(&mut self, payload: Bytes) -> Result<(), std::io::Error> {
        self.feed_payload(payload).await?;
        self.framed.flush().await
    }

    pub async fn flush(&mut self) -> Result<(), std::io::Error> {
        self.framed.flush().await
    }

    /// Send a pre-built packet verbatim (handshake greeting carries seq 0)
    pub async fn write_handshake_packet(&mut self, packet: Packet) -> Result<(), std::io::Error> {
        self.sequence = packet.sequence_id.wrapping_add(1);
        self.send_packet(packet).await
    }

    pub async fn write_ok(&mut self, status: u16) -> Result<(), std::io::Error> {
        let ok = OkPacket::new(status);
        let packet = ok.encode(self.sequence, self.capability);
        self.sequence = self.sequence.wrapping_add(1);
        self.send_packet(packet).await
    }

    pub async fn write_ok_result(
        &mut self,
        status: u16,
        affected_rows: u64,
        insert_id: u64,
    ) -> Result<(), std::io::Error> {
        let ok = OkPacket {
            affected_rows,
            last_insert_id: insert_id,
            status_flags: status,
            warnings: 0,
        };
        let packet = ok.encode(self.sequence, self.capability);
        self.sequence = self.sequence.wrapping_add(1);
        self.send_packet(packet).await
    }

    pub async fn write_eof(&mut self, status: u16) -> Result<(), std::io::Error> {
        let eof = EofPacket::new(status);
        let packet = eof.encode(self.sequence, self.capability);
        self.sequence = self.sequence.wrapping_add(1);
        self.send_packet(packet).await
    }

    async fn feed_eof(&mut self, status: u16) -> Result<(), std::io::Error> {
        let eof = EofPacket::new(status);
        let packet = eof.encode(self.sequence, self.capability);
        self.sequence = self.sequence.wrapping_add(1);
        self.feed_packet(packet).await
    }

    pub async fn write_error(&mut self, err: &SqlError) -> Result<(), std::io::Error> {
        debug!(
            conn_id = self.connection_id,
            code = err.code,
            message = %err.message,
            "writing error packet"
        );
        let packet =
            ErrPacket::new(err.code, &err.state, &err.message).encode(self.sequence, self.capability);
        self.sequence = self.sequence.wrapping_add(1);
        self.send_packet(packet).await
    }

    /// Write a complete in-memory result set
    pub async fn write_result_set(
        &mut self,
        status: u16,
        result: &ResultSet,
        binary: bool,
    ) -> Result<(), std::io::Error> {
        if !result.has_rows() {
            return self
                .write_ok_result(status, result.affected_rows, result.insert_id)
                .await;
        }

        self.feed_column_block(&result.fields, status, binary).await?;

        for row in &result.rows {
            let payload = if binary {
                encode_binary_row(row)
            } else {
                super::resultset::encode_text_row(row)
            };
            self.feed_payload(payload).await?;
        }

        self.feed_eof(status).await?;
        self.framed.flush().await
    }

    /// Column count + column definitions + EOF
    async fn feed_column_block(
        &mut self,
        fields: &[Field],
        status: u16,
        binary: bool,
    ) -> Result<(), std::io::Error> {
        let mut buf = BytesMut::new();
        put_lenenc_int(&mut buf, fields.len() as u64);
        self.feed_payload(buf.freeze()).await?;

        for field in fields {
            let payload = if binary {
                let mut f = field.clone();
                f.field_type = super::resultset::column_types::MYSQL_TYPE_VAR_STRING;
                f.to_payload()
            } else {
                field.to_payload()
            };
            self.feed_payload(payload).await?;
        }

        self.feed_eof(status).await
    }

    /// Write a COM_STMT_PREPARE response
    pub async fn write_prepare(
        &mut self,
        status: u16,
        stmt_id: u32,
        column_count: u16,
        param_count: u16,
    ) -> Result<(), std::io::Error> {
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&[0x00]);
        buf.extend_from_slice(&stmt_id.to_le_bytes());
        buf.extend_from_slice(&column_count.to_le_bytes());
        buf.extend_from_slice(&param_count.to_le_bytes());
        buf.extend_from_slice(&[0x00, 0x00, 0x00]); // filler + warnings
        self.feed_payload(buf.freeze()).await?;

        if param_count > 0 {
            for _ in 0..param_count {
                let payload = Field::placeholder().to_payload();
                self.feed_payload(payload).await?;
            }
            self.feed_eof(status).await?;
        }

        if column_count > 0 {
            for _ in 0..column_count {
                let payload = Field::placeholder().to_payload();
                self.feed_payload(payload).await?;
            }
            self.feed_eof(status).await?;
        }

        self.framed.flush().await
    }

    /// Write a COM_FIELD_LIST response
    pub async fn write_field_list(
        &mut self,
        status: u16,
        fields: &[Field],
    ) -> Result<(), std::io::Error> {
        for field in fields {
            let payload = field.to_payload();
            self.feed_payload(payload).await?;
        }
        self.feed_eof(status).await?;
        self.framed.flush().await
    }

    /// Stream a result set whose rows are still owned by a backend cursor.
    /// The header carries the column definitions already read from the
    /// backend; rows are pulled from `conn` until its EOF and re-framed to
    /// the client, capped at `max_result_size` bytes.
    pub async fn write_result_stream(
        &mut self,
        status: u16,
        header: &ResultSet,
        conn: &mut PooledConn,
        max_result_size: usize,
        binary: bool,
    ) -> Result<(), std::io::Error> {
        if !header.has_rows() {
            return self
                .write_ok_result(status, header.affected_rows, header.insert_id)
                .await;
        }

        self.feed_column_block(&header.fields, status, binary).await?;

        let column_count = header.fields.len();
        let mut streamed = 0usize;

        loop {
            let payload = match conn.read_packet().await {
                Ok(p) => p,
                Err(ConnectionError::Disconnected) => {
                    return Err(std::io::Error::new(
                        std::io::ErrorKind::UnexpectedEof,
                        "backend closed mid-stream",
                    ))
                }
                Err(e) => {
                    return Err(std::io::Error::new(std::io::ErrorKind::Other, e.to_string()))
                }
            };

            if is_eof_packet(&payload) {
                break;
            }
            if is_err_packet(&payload) {
                // surface the backend error in place of the final EOF
                let packet = Packet::new(self.sequence, payload);
                self.sequence = self.sequence.wrapping_add(1);
                self.send_packet(packet).await?;
                return Ok(());
            }

            streamed += payload.len();
            if streamed > max_result_size {
                // drain the cursor so the connection stays usable
                loop {
                    let rest = conn.read_packet().await.map_err(|e| {
                        std::io::Error::new(std::io::ErrorKind::Other, e.to_string())
                    })?;
                    if is_eof_packet(&rest) || is_err_packet(&rest) {
                        break;
                    }
                }
                let err = SqlError::new(
                    packet::error_codes::ER_UNKNOWN_ERROR,
                    &format!("result set too large, max {} bytes", max_result_size),
                );
                return self.write_error(&err).await;
            }

            let out = if binary {
                match parse_text_row(&payload, column_count) {
                    Some(row) => encode_binary_row(&row),
                    None => {
                        return Err(std::io::Error::new(
                            std::io::ErrorKind::InvalidData,
                            "malformed row from backend",
                        ))
                    }
                }
            } else {
                payload
            };
            self.feed_payload(out).await?;
        }

        self.feed_eof(status).await?;
        self.framed.flush().await
    }

    /// Tear down the underlying stream
    pub async fn shutdown(&mut self) {
        use tokio::io::AsyncWriteExt;
        let _ = self.framed.get_mut().shutdown().await;
    }
}
