mod codec;
pub mod conn;
mod handshake;
pub mod packet;
pub mod resultset;

pub use codec::PacketCodec;
pub use conn::ClientConn;
pub use handshake::{
    check_hash_auth, compute_native_auth, compute_sha2_auth, EofPacket, ErrPacket,
    HandshakeResponse, InitialHandshake, OkPacket,
};
pub use packet::{
    capabilities, error_codes, is_eof_packet, is_err_packet, is_ok_packet, status, Command, Packet,
    CACHING_SHA2_PASSWORD, MYSQL_NATIVE_PASSWORD,
};
pub use resultset::{Field, ResultSet, Row};

/// A MySQL-level error destined for an ERR packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SqlError {
    pub code: u16,
    pub state: String,
    pub message: String,
}

impl SqlError {
    pub fn new(code: u16, message: &str) -> Self {
        let state = match code {
            error_codes::ER_ACCESS_DENIED_ERROR => "28000",
            error_codes::ER_CON_COUNT_ERROR => "08004",
            error_codes::ER_NO_DB_ERROR | error_codes::ER_BAD_DB_ERROR => "3D000",
            _ => "HY000",
        };
        Self {
            code,
            state: state.to_string(),
            message: message.to_string(),
        }
    }

    pub fn access_denied(user: &str, client_addr: &str) -> Self {
        Self::new(
            error_codes::ER_ACCESS_DENIED_ERROR,
            &format!("Access denied for user '{}'@'{}' (using password: Yes)", user, client_addr),
        )
    }

    pub fn client_qps_limited() -> Self {
        Self::new(error_codes::ER_CLIENT_QPS_LIMITED, "client qps limited")
    }

    pub fn tx_ns_changed() -> Self {
        Self::new(
            error_codes::ER_TX_NS_CHANGED,
            "namespace changed during transaction, session closed",
        )
    }
}

impl std::fmt::Display for SqlError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ERROR {} ({}): {}", self.code, self.state, self.message)
    }
}

impl std::error::Error for SqlError {}
