use bytes::{Buf, BufMut, Bytes, BytesMut};

/// MySQL packet header size: 3 bytes length + 1 byte sequence
pub const PACKET_HEADER_SIZE: usize = 4;
/// Maximum packet payload size (16MB - 1)
pub const MAX_PACKET_SIZE: usize = 0xFF_FF_FF;

/// MySQL wire protocol packet
#[derive(Debug, Clone)]
pub struct Packet {
    pub sequence_id: u8,
    pub payload: Bytes,
}

impl Packet {
    pub fn new(sequence_id: u8, payload: impl Into<Bytes>) -> Self {
        Self {
            sequence_id,
            payload: payload.into(),
        }
    }

    /// Encode packet to bytes (header + payload)
    pub fn encode(&self, dst: &mut BytesMut) {
        let len = self.payload.len();
        // 3 bytes for length (little endian)
        dst.put_u8((len & 0xFF) as u8);
        dst.put_u8(((len >> 8) & 0xFF) as u8);
        dst.put_u8(((len >> 16) & 0xFF) as u8);
        // 1 byte for sequence id
        dst.put_u8(self.sequence_id);
        dst.extend_from_slice(&self.payload);
    }

    /// Try to decode packet from bytes, returns None if not enough data
    pub fn decode(src: &mut BytesMut) -> Option<Self> {
        if src.len() < PACKET_HEADER_SIZE {
            return None;
        }

        let len = src[0] as usize | ((src[1] as usize) << 8) | ((src[2] as usize) << 16);

        let total_len = PACKET_HEADER_SIZE + len;
        if src.len() < total_len {
            return None;
        }

        let sequence_id = src[3];
        src.advance(PACKET_HEADER_SIZE);
        let payload = src.split_to(len).freeze();

        Some(Self {
            sequence_id,
            payload,
        })
    }
}

/// MySQL capability flags
#[allow(dead_code)]
pub mod capabilities {
    pub const CLIENT_LONG_PASSWORD: u32 = 1;
    pub const CLIENT_FOUND_ROWS: u32 = 1 << 1;
    pub const CLIENT_LONG_FLAG: u32 = 1 << 2;
    pub const CLIENT_CONNECT_WITH_DB: u32 = 1 << 3;
    pub const CLIENT_NO_SCHEMA: u32 = 1 << 4;
    pub const CLIENT_COMPRESS: u32 = 1 << 5;
    pub const CLIENT_ODBC: u32 = 1 << 6;
    pub const CLIENT_LOCAL_FILES: u32 = 1 << 7;
    pub const CLIENT_IGNORE_SPACE: u32 = 1 << 8;
    pub const CLIENT_PROTOCOL_41: u32 = 1 << 9;
    pub const CLIENT_INTERACTIVE: u32 = 1 << 10;
    pub const CLIENT_SSL: u32 = 1 << 11;
    pub const CLIENT_IGNORE_SIGPIPE: u32 = 1 << 13;
    pub const CLIENT_TRANSACTIONS: u32 = 1 << 14;
    pub const CLIENT_SECURE_CONNECTION: u32 = 1 << 15;
    pub const CLIENT_MULTI_STATEMENTS: u32 = 1 << 16;
    pub const CLIENT_MULTI_RESULTS: u32 = 1 << 17;
    pub const CLIENT_PS_MULTI_RESULTS: u32 = 1 << 18;
    pub const CLIENT_PLUGIN_AUTH: u32 = 1 << 19;
    pub const CLIENT_CONNECT_ATTRS: u32 = 1 << 20;
    pub const CLIENT_PLUGIN_AUTH_LENENC_CLIENT_DATA: u32 = 1 << 21;
    pub const CLIENT_DEPRECATE_EOF: u32 = 1 << 24;

    /// Capabilities advertised to clients in the initial handshake.
    pub const DEFAULT_CAPABILITIES: u32 = CLIENT_LONG_PASSWORD
        | CLIENT_LONG_FLAG
        | CLIENT_CONNECT_WITH_DB
        | CLIENT_PROTOCOL_41
        | CLIENT_TRANSACTIONS
        | CLIENT_SECURE_CONNECTION
        | CLIENT_FOUND_ROWS
        | CLIENT_MULTI_RESULTS
        | CLIENT_MULTI_STATEMENTS
        | CLIENT_PS_MULTI_RESULTS
        | CLIENT_LOCAL_FILES
        | CLIENT_PLUGIN_AUTH;
}

/// Server status flags carried in OK/EOF packets
#[allow(dead_code)]
pub mod status {
    pub const SERVER_STATUS_IN_TRANS: u16 = 0x0001;
    pub const SERVER_STATUS_AUTOCOMMIT: u16 = 0x0002;
    pub const SERVER_MORE_RESULTS_EXISTS: u16 = 0x0008;
    pub const SERVER_STATUS_NO_GOOD_INDEX_USED: u16 = 0x0010;
    pub const SERVER_STATUS_NO_INDEX_USED: u16 = 0x0020;
    pub const SERVER_STATUS_CURSOR_EXISTS: u16 = 0x0040;
    pub const SERVER_STATUS_LAST_ROW_SENT: u16 = 0x0080;
    pub const SERVER_STATUS_DB_DROPPED: u16 = 0x0100;
}

/// Error codes the proxy emits on its own behalf
#[allow(dead_code)]
pub mod error_codes {
    pub const ER_ACCESS_DENIED_ERROR: u16 = 1045;
    pub const ER_CON_COUNT_ERROR: u16 = 1040;
    pub const ER_NO_DB_ERROR: u16 = 1046;
    pub const ER_BAD_DB_ERROR: u16 = 1049;
    pub const ER_UNKNOWN_ERROR: u16 = 1105;
    pub const ER_UNKNOWN_CHARACTER_SET: u16 = 1115;
    pub const ER_WRONG_VALUE_FOR_VAR: u16 = 1231;
    pub const ER_VARIABLE_IS_READONLY: u16 = 1238;
    pub const ER_UNKNOWN_STMT_HANDLER: u16 = 1243;
    pub const ER_MALFORMED_PACKET: u16 = 1835;
    pub const ER_INTERNAL_ERROR: u16 = 1815;
    pub const ER_CLIENT_QPS_LIMITED: u16 = 901;
    pub const ER_TX_NS_CHANGED: u16 = 902;
}

/// Auth plugin names
pub const MYSQL_NATIVE_PASSWORD: &str = "mysql_native_password";
pub const CACHING_SHA2_PASSWORD: &str = "caching_sha2_password";

/// MySQL command types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Command {
    Sleep = 0x00,
    Quit = 0x01,
    InitDb = 0x02,
    Query = 0x03,
    FieldList = 0x04,
    CreateDb = 0x05,
    DropDb = 0x06,
    Refresh = 0x07,
    Shutdown = 0x08,
    Statistics = 0x09,
    ProcessInfo = 0x0a,
    Connect = 0x0b,
    ProcessKill = 0x0c,
    Debug = 0x0d,
    Ping = 0x0e,
    Time = 0x0f,
    DelayedInsert = 0x10,
    ChangeUser = 0x11,
    BinlogDump = 0x12,
    TableDump = 0x13,
    ConnectOut = 0x14,
    RegisterSlave = 0x15,
    StmtPrepare = 0x16,
    StmtExecute = 0x17,
    StmtSendLongData = 0x18,
    StmtClose = 0x19,
    StmtReset = 0x1a,
    SetOption = 0x1b,
    StmtFetch = 0x1c,
    Daemon = 0x1d,
    BinlogDumpGtid = 0x1e,
    ResetConnection = 0x1f,
    Unknown = 0xff,
}

impl From<u8> for Command {
    fn from(value: u8) -> Self {
        match value {
            0x00 => Command::Sleep,
            0x01 => Command::Quit,
            0x02 => Command::InitDb,
            0x03 => Command::Query,
            0x04 => Command::FieldList,
            0x05 => Command::CreateDb,
            0x06 => Command::DropDb,
            0x07 => Command::Refresh,
            0x08 => Command::Shutdown,
            0x09 => Command::Statistics,
            0x0a => Command::ProcessInfo,
            0x0b => Command::Connect,
            0x0c => Command::ProcessKill,
            0x0d => Command::Debug,
            0x0e => Command::Ping,
            0x0f => Command::Time,
            0x10 => Command::DelayedInsert,
            0x11 => Command::ChangeUser,
            0x12 => Command::BinlogDump,
            0x13 => Command::TableDump,
            0x14 => Command::ConnectOut,
            0x15 => Command::RegisterSlave,
            0x16 => Command::StmtPrepare,
            0x17 => Command::StmtExecute,
            0x18 => Command::StmtSendLongData,
            0x19 => Command::StmtClose,
            0x1a => Command::StmtReset,
            0x1b => Command::SetOption,
            0x1c => Command::StmtFetch,
            0x1d => Command::Daemon,
            0x1e => Command::BinlogDumpGtid,
            0x1f => Command::ResetConnection,
            _ => Command::Unknown,
        }
    }
}

/// Encode a length-encoded integer
pub fn put_lenenc_int(buf: &mut BytesMut, value: u64) {
    if value < 251 {
        buf.put_u8(value as u8);
    } else if value < 65536 {
        buf.put_u8(0xFC);
        buf.put_u16_le(value as u16);
    } else if value < 16777216 {
        buf.put_u8(0xFD);
        buf.put_u8((value & 0xFF) as u8);
        buf.put_u8(((value >> 8) & 0xFF) as u8);
        buf.put_u8(((value >> 16) & 0xFF) as u8);
    } else {
        buf.put_u8(0xFE);
        buf.put_u64_le(value);
    }
}

/// Encode a length-encoded string
pub fn put_lenenc_bytes(buf: &mut BytesMut, value: &[u8]) {
    put_lenenc_int(buf, value.len() as u64);
    buf.extend_from_slice(value);
}

/// Parse a length-encoded integer, returning the value and bytes consumed.
/// 0xFB encodes NULL in row data and is reported as `(None, 1)`.
pub fn get_lenenc_int(data: &[u8]) -> Option<(Option<u64>, usize)> {
    match *data.first()? {
        v @ 0..=0xFA => Some((Some(v as u64), 1)),
        0xFB => Some((None, 1)),
        0xFC if data.len() >= 3 => Some((Some(u16::from_le_bytes([data[1], data[2]]) as u64), 3)),
        0xFD if data.len() >= 4 => Some((
            Some(u32::from_le_bytes([data[1], data[2], data[3], 0]) as u64),
            4,
        )),
        0xFE if data.len() >= 9 => Some((
            Some(u64::from_le_bytes([
                data[1], data[2], data[3], data[4], data[5], data[6], data[7], data[8],
            ])),
            9,
        )),
        _ => None,
    }
}

/// Parse a length-encoded string, returning the bytes and total bytes consumed
pub fn get_lenenc_bytes(data: &[u8]) -> Option<(Option<&[u8]>, usize)> {
    let (len, consumed) = get_lenenc_int(data)?;
    match len {
        None => Some((None, consumed)),
        Some(len) => {
            let len = len as usize;
            if data.len() < consumed + len {
                return None;
            }
            Some((Some(&data[consumed..consumed + len]), consumed + len))
        }
    }
}

/// Check if packet is OK packet
pub fn is_ok_packet(payload: &Bytes) -> bool {
    !payload.is_empty() && payload[0] == 0x00
}

/// Check if packet is ERR packet
pub fn is_err_packet(payload: &Bytes) -> bool {
    !payload.is_empty() && payload[0] == 0xFF
}

/// Check if packet is EOF packet
pub fn is_eof_packet(payload: &Bytes) -> bool {
    !payload.is_empty() && payload[0] == 0xFE && payload.len() < 9
}

/// Status flags carried in an EOF packet (0xFE, warnings u16, status u16)
pub fn eof_status(payload: &Bytes) -> u16 {
    if payload.len() >= 5 {
        u16::from_le_bytes([payload[3], payload[4]])
    } else {
        0
    }
}

/// Known collations: id -> (collation name, charset)
pub const COLLATIONS: &[(u16, &str, &str)] = &[
    (8, "latin1_swedish_ci", "latin1"),
    (28, "gbk_chinese_ci", "gbk"),
    (33, "utf8_general_ci", "utf8"),
    (45, "utf8mb4_general_ci", "utf8mb4"),
    (46, "utf8mb4_bin", "utf8mb4"),
    (63, "binary", "binary"),
    (83, "utf8_bin", "utf8"),
    (224, "utf8mb4_unicode_ci", "utf8mb4"),
    (255, "utf8mb4_0900_ai_ci", "utf8mb4"),
];

/// Default collation advertised by the proxy (utf8mb4_general_ci)
pub const DEFAULT_COLLATION_ID: u16 = 45;

/// Resolve a collation id to its collation name
pub fn collation_name(id: u16) -> Option<&'static str> {
    COLLATIONS
        .iter()
        .find(|(cid, _, _)| *cid == id)
        .map(|(_, name, _)| *name)
}

/// Resolve a collation name to its charset
pub fn collation_charset(name: &str) -> Option<&'static str> {
    COLLATIONS
        .iter()
        .find(|(_, cname, _)| *cname == name)
        .map(|(_, _, charset)| *charset)
}

/// Resolve a charset to its default collation id
pub fn charset_default_collation(charset: &str) -> Option<u16> {
    COLLATIONS
        .iter()
        .find(|(_, _, cs)| *cs == charset)
        .map(|(id, _, _)| *id)
}

/// Resolve a collation name to its id
pub fn collation_id(name: &str) -> Option<u16> {
    COLLATIONS
        .iter()
        .find(|(_, cname, _)| *cname == name)
        .map(|(id, _, _)| *id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn packet_roundtrip() {
        let packet = Packet::new(3, Bytes::from_static(b"\x03SELECT 1"));
        let mut buf = BytesMut::new();
        packet.encode(&mut buf);

        let decoded = Packet::decode(&mut buf).unwrap();
        assert_eq!(decoded.sequence_id, 3);
        assert_eq!(&decoded.payload[..], b"\x03SELECT 1");
        assert!(buf.is_empty());
    }

    #[test]
    fn packet_decode_partial() {
        let mut buf = BytesMut::from(&[5u8, 0, 0][..]);
        assert!(Packet::decode(&mut buf).is_none());

        // header present but payload short
        let mut buf = BytesMut::from(&[5u8, 0, 0, 0, b'a', b'b'][..]);
        assert!(Packet::decode(&mut buf).is_none());
    }

    #[test]
    fn lenenc_int_roundtrip() {
        for value in [0u64, 250, 251, 65535, 65536, 16777215, 16777216, u64::MAX] {
            let mut buf = BytesMut::new();
            put_lenenc_int(&mut buf, value);
            let (parsed, consumed) = get_lenenc_int(&buf).unwrap();
            assert_eq!(parsed, Some(value));
            assert_eq!(consumed, buf.len());
        }
    }

    #[test]
    fn lenenc_null_marker() {
        let (parsed, consumed) = get_lenenc_int(&[0xFB, 1, 2]).unwrap();
        assert_eq!(parsed, None);
        assert_eq!(consumed, 1);
    }

    #[test]
    fn collation_lookups() {
        let name = collation_name(45).unwrap();
        assert_eq!(name, "utf8mb4_general_ci");
        assert_eq!(collation_charset(name), Some("utf8mb4"));
        assert!(collation_name(9999).is_none());
    }
}
