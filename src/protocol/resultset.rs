//! Result-set model shared by the client-side writers and the backend driver.
//!
//! Rows are kept as raw text-protocol values; binary-protocol rows for the
//! prepared-statement path are re-encoded on the way out with every column
//! downgraded to VAR_STRING, which every client accepts.

use bytes::{BufMut, Bytes, BytesMut};

use super::packet::{get_lenenc_bytes, put_lenenc_bytes, Packet};

/// Column type bytes used on the wire
#[allow(dead_code)]
pub mod column_types {
    pub const MYSQL_TYPE_DECIMAL: u8 = 0x00;
    pub const MYSQL_TYPE_TINY: u8 = 0x01;
    pub const MYSQL_TYPE_SHORT: u8 = 0x02;
    pub const MYSQL_TYPE_LONG: u8 = 0x03;
    pub const MYSQL_TYPE_FLOAT: u8 = 0x04;
    pub const MYSQL_TYPE_DOUBLE: u8 = 0x05;
    pub const MYSQL_TYPE_NULL: u8 = 0x06;
    pub const MYSQL_TYPE_TIMESTAMP: u8 = 0x07;
    pub const MYSQL_TYPE_LONGLONG: u8 = 0x08;
    pub const MYSQL_TYPE_INT24: u8 = 0x09;
    pub const MYSQL_TYPE_DATE: u8 = 0x0a;
    pub const MYSQL_TYPE_TIME: u8 = 0x0b;
    pub const MYSQL_TYPE_DATETIME: u8 = 0x0c;
    pub const MYSQL_TYPE_YEAR: u8 = 0x0d;
    pub const MYSQL_TYPE_VARCHAR: u8 = 0x0f;
    pub const MYSQL_TYPE_NEWDECIMAL: u8 = 0xf6;
    pub const MYSQL_TYPE_BLOB: u8 = 0xfc;
    pub const MYSQL_TYPE_VAR_STRING: u8 = 0xfd;
    pub const MYSQL_TYPE_STRING: u8 = 0xfe;
}

/// Column definition (Protocol::ColumnDefinition41)
#[derive(Debug, Clone)]
pub struct Field {
    pub schema: Bytes,
    pub table: Bytes,
    pub org_table: Bytes,
    pub name: Bytes,
    pub org_name: Bytes,
    pub charset: u16,
    pub column_length: u32,
    pub field_type: u8,
    pub flags: u16,
    pub decimals: u8,
}

impl Field {
    /// Build a minimal field for proxy-synthesized result sets
    pub fn named(name: &str, field_type: u8) -> Self {
        Self {
            schema: Bytes::new(),
            table: Bytes::new(),
            org_table: Bytes::new(),
            name: Bytes::copy_from_slice(name.as_bytes()),
            org_name: Bytes::copy_from_slice(name.as_bytes()),
            charset: 33,
            column_length: 255,
            field_type,
            flags: 0,
            decimals: 0,
        }
    }

    /// Placeholder field used for parameter markers in prepare responses
    pub fn placeholder() -> Self {
        Self::named("?", column_types::MYSQL_TYPE_VAR_STRING)
    }

    /// Parse a ColumnDefinition41 payload
    pub fn parse(payload: &[u8]) -> Option<Self> {
        let mut pos = 0usize;
        let mut next = |data: &[u8]| -> Option<(Bytes, usize)> {
            let (value, consumed) = get_lenenc_bytes(data)?;
            Some((Bytes::copy_from_slice(value.unwrap_or(&[])), consumed))
        };

        let (_catalog, n) = next(&payload[pos..])?;
        pos += n;
        let (schema, n) = next(&payload[pos..])?;
        pos += n;
        let (table, n) = next(&payload[pos..])?;
        pos += n;
        let (org_table, n) = next(&payload[pos..])?;
        pos += n;
        let (name, n) = next(&payload[pos..])?;
        pos += n;
        let (org_name, n) = next(&payload[pos..])?;
        pos += n;

        // fixed-length tail: 0x0c marker, charset u16, length u32, type u8,
        // flags u16, decimals u8, 2 filler bytes
        if payload.len() < pos + 13 {
            return None;
        }
        pos += 1;
        let charset = u16::from_le_bytes([payload[pos], payload[pos + 1]]);
        pos += 2;
        let column_length = u32::from_le_bytes([
            payload[pos],
            payload[pos + 1],
            payload[pos + 2],
            payload[pos + 3],
        ]);
        pos += 4;
        let field_type = payload[pos];
        pos += 1;
        let flags = u16::from_le_bytes([payload[pos], payload[pos + 1]]);
        pos += 2;
        let decimals = payload[pos];

        Some(Self {
            schema,
            table,
            org_table,
            name,
            org_name,
            charset,
            column_length,
            field_type,
            flags,
            decimals,
        })
    }

    /// Encode as a ColumnDefinition41 payload
    pub fn to_payload(&self) -> Bytes {
        let mut buf = BytesMut::new();
        put_lenenc_bytes(&mut buf, b"def");
        put_lenenc_bytes(&mut buf, &self.schema);
        put_lenenc_bytes(&mut buf, &self.table);
        put_lenenc_bytes(&mut buf, &self.org_table);
        put_lenenc_bytes(&mut buf, &self.name);
        put_lenenc_bytes(&mut buf, &self.org_name);
        buf.put_u8(0x0c);
        buf.put_u16_le(self.charset);
        buf.put_u32_le(self.column_length);
        buf.put_u8(self.field_type);
        buf.put_u16_le(self.flags);
        buf.put_u8(self.decimals);
        buf.put_u16_le(0);
        buf.freeze()
    }

    pub fn to_packet(&self, sequence_id: u8) -> Packet {
        Packet::new(sequence_id, self.to_payload())
    }
}

/// A row of text-protocol values; None encodes SQL NULL
pub type Row = Vec<Option<Bytes>>;

/// Protocol-level result: either an OK-style outcome or a result set
#[derive(Debug, Clone, Default)]
pub struct ResultSet {
    pub affected_rows: u64,
    pub insert_id: u64,
    /// Status flags reported alongside the result (merged into the
    /// session status by the executor before writing)
    pub status: u16,
    pub fields: Vec<Field>,
    pub rows: Vec<Row>,
}

impl ResultSet {
    /// OK-style result with no rows
    pub fn ok(affected_rows: u64, insert_id: u64, status: u16) -> Self {
        Self {
            affected_rows,
            insert_id,
            status,
            ..Default::default()
        }
    }

    /// Result set with column definitions and rows
    pub fn with_rows(fields: Vec<Field>, rows: Vec<Row>) -> Self {
        Self {
            fields,
            rows,
            ..Default::default()
        }
    }

    pub fn has_rows(&self) -> bool {
        !self.fields.is_empty()
    }
}

/// Parse a text-protocol row payload into column values
pub fn parse_text_row(payload: &[u8], column_count: usize) -> Option<Row> {
    let mut pos = 0usize;
    let mut row = Vec::with_capacity(column_count);
    for _ in 0..column_count {
        let (value, consumed) = get_lenenc_bytes(&payload[pos..])?;
        row.push(value.map(Bytes::copy_from_slice));
        pos += consumed;
    }
    Some(row)
}

/// Encode a row in the text protocol
pub fn encode_text_row(row: &Row) -> Bytes {
    let mut buf = BytesMut::new();
    for value in row {
        match value {
            Some(v) => put_lenenc_bytes(&mut buf, v),
            None => buf.put_u8(0xFB),
        }
    }
    buf.freeze()
}

/// Encode a row in the binary protocol. All values are emitted as
/// length-encoded strings; the column definitions must be rewritten to
/// VAR_STRING to match.
pub fn encode_binary_row(row: &Row) -> Bytes {
    let mut buf = BytesMut::new();
    buf.put_u8(0x00); // packet header for binary row

    // null bitmap, offset 2
    let bitmap_len = (row.len() + 7 + 2) / 8;
    let mut bitmap = vec![0u8; bitmap_len];
    for (i, value) in row.iter().enumerate() {
        if value.is_none() {
            let bit = i + 2;
            bitmap[bit / 8] |= 1 << (bit % 8);
        }
    }
    buf.extend_from_slice(&bitmap);

    for value in row.iter().flatten() {
        put_lenenc_bytes(&mut buf, value);
    }
    buf.freeze()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn field_roundtrip() {
        let field = Field {
            schema: Bytes::from_static(b"orders"),
            table: Bytes::from_static(b"t"),
            org_table: Bytes::from_static(b"t_0001"),
            name: Bytes::from_static(b"id"),
            org_name: Bytes::from_static(b"id"),
            charset: 63,
            column_length: 20,
            field_type: column_types::MYSQL_TYPE_LONGLONG,
            flags: 0x0003,
            decimals: 0,
        };
        let payload = field.to_payload();
        let parsed = Field::parse(&payload).unwrap();
        assert_eq!(parsed.name, field.name);
        assert_eq!(parsed.org_table, field.org_table);
        assert_eq!(parsed.field_type, field.field_type);
        assert_eq!(parsed.flags, field.flags);
        assert_eq!(parsed.column_length, field.column_length);
    }

    #[test]
    fn text_row_roundtrip() {
        let row: Row = vec![
            Some(Bytes::from_static(b"1")),
            None,
            Some(Bytes::from_static(b"hello")),
        ];
        let payload = encode_text_row(&row);
        let parsed = parse_text_row(&payload, 3).unwrap();
        assert_eq!(parsed, row);
    }

    #[test]
    fn binary_row_null_bitmap() {
        let row: Row = vec![Some(Bytes::from_static(b"7")), None];
        let payload = encode_binary_row(&row);
        assert_eq!(payload[0], 0x00);
        // second column null: bit 3 of the first bitmap byte
        assert_eq!(payload[1] & 0b0000_1000, 0b0000_1000);
    }
}
