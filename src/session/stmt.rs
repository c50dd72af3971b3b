//! Prepared statements. The statement text is split at its `?` markers at
//! prepare time; EXECUTE rewrites the bound-parameter buffer into the
//! fragment list without reparsing the SQL.

use std::collections::HashMap;

use bytes::{Buf, Bytes};

use crate::protocol::error_codes;
use crate::protocol::packet::get_lenenc_bytes;
use crate::protocol::resultset::column_types::*;

use super::error::ExecError;

/// One prepared statement owned by a session executor
#[derive(Debug, Clone)]
pub struct Stmt {
    pub id: u32,
    pub sql: String,
    /// Text between parameter markers; fragments.len() == param_count + 1
    pub fragments: Vec<String>,
    /// Byte offsets of each `?` in the original SQL
    pub offsets: Vec<usize>,
    pub param_count: usize,
    /// Parameter types from the last EXECUTE with new-params-bound set
    pub param_types: Vec<u16>,
    /// COM_STMT_SEND_LONG_DATA accumulations, keyed by parameter index
    pub long_data: HashMap<u16, Vec<u8>>,
}

impl Stmt {
    pub fn prepare(id: u32, sql: &str) -> Result<Self, ExecError> {
        let (fragments, offsets) = calc_params(sql)?;
        let param_count = offsets.len();
        Ok(Self {
            id,
            sql: sql.to_string(),
            fragments,
            offsets,
            param_count,
            param_types: Vec::new(),
            long_data: HashMap::new(),
        })
    }

    pub fn reset(&mut self) {
        self.long_data.clear();
    }

    pub fn append_long_data(&mut self, param_id: u16, data: &[u8]) {
        self.long_data.entry(param_id).or_default().extend_from_slice(data);
    }

    /// Interleave bound literals with the statement fragments
    pub fn rewrite(&self, values: &[String]) -> Result<String, ExecError> {
        if values.len() != self.param_count {
            return Err(ExecError::sql(
                error_codes::ER_MALFORMED_PACKET,
                "parameter count mismatch",
            ));
        }
        let mut sql = String::with_capacity(self.sql.len() + values.iter().map(String::len).sum::<usize>());
        for (i, fragment) in self.fragments.iter().enumerate() {
            sql.push_str(fragment);
            if let Some(value) = values.get(i) {
                sql.push_str(value);
            }
        }
        Ok(sql)
    }
}

/// Split a statement at its `?` placeholders, skipping quoted regions.
/// Returns the fragments and the marker byte offsets.
pub fn calc_params(sql: &str) -> Result<(Vec<String>, Vec<usize>), ExecError> {
    let bytes = sql.as_bytes();
    let mut fragments = Vec::new();
    let mut offsets = Vec::new();
    let mut start = 0usize;
    let mut i = 0usize;

    while i < bytes.len() {
        match bytes[i] {
            b'\'' | b'"' | b'`' => {
                let quote = bytes[i];
                i += 1;
                while i < bytes.len() {
                    if bytes[i] == b'\\' {
                        i += 2;
                        continue;
                    }
                    if bytes[i] == quote {
                        break;
                    }
                    i += 1;
                }
                i += 1;
            }
            b'?' => {
                fragments.push(sql[start..i].to_string());
                offsets.push(i);
                start = i + 1;
                i += 1;
            }
            _ => i += 1,
        }
    }

    fragments.push(sql[start..].to_string());
    Ok((fragments, offsets))
}

/// Escape a value into a quoted SQL literal. Values that are not valid
/// UTF-8 go out as hex literals so binary long-data survives intact.
pub fn escape_literal(value: &[u8]) -> String {
    let text = match std::str::from_utf8(value) {
        Ok(text) => text,
        Err(_) => return format!("0x{}", hex::encode(value)),
    };

    let mut out = String::with_capacity(text.len() + 2);
    out.push('\'');
    for c in text.chars() {
        match c {
            '\'' => out.push_str("\\'"),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\0' => out.push_str("\\0"),
            '\x1a' => out.push_str("\\Z"),
            _ => out.push(c),
        }
    }
    out.push('\'');
    out
}

/// Decoded COM_STMT_EXECUTE request
#[derive(Debug)]
pub struct ExecuteRequest {
    pub stmt_id: u32,
    pub values: Vec<String>,
}

/// Parse a COM_STMT_EXECUTE payload (after the command byte) against the
/// statement it targets, producing text literals for every parameter.
pub fn parse_execute(stmt: &mut Stmt, data: &Bytes) -> Result<ExecuteRequest, ExecError> {
    let malformed = || ExecError::sql(error_codes::ER_MALFORMED_PACKET, "malformed execute packet");

    if data.len() < 9 {
        return Err(malformed());
    }
    let mut buf = &data[..];
    let stmt_id = buf.get_u32_le();
    let _flags = buf.get_u8();
    let _iteration_count = buf.get_u32_le();

    if stmt.param_count == 0 {
        return Ok(ExecuteRequest {
            stmt_id,
            values: Vec::new(),
        });
    }

    let bitmap_len = (stmt.param_count + 7) / 8;
    if buf.len() < bitmap_len + 1 {
        return Err(malformed());
    }
    let null_bitmap = buf[..bitmap_len].to_vec();
    buf.advance(bitmap_len);

    let new_params_bound = buf.get_u8();
    if new_params_bound == 1 {
        if buf.len() < stmt.param_count * 2 {
            return Err(malformed());
        }
        let mut types = Vec::with_capacity(stmt.param_count);
        for _ in 0..stmt.param_count {
            types.push(buf.get_u16_le());
        }
        stmt.param_types = types;
    } else if stmt.param_types.len() != stmt.param_count {
        return Err(ExecError::sql(
            error_codes::ER_UNKNOWN_STMT_HANDLER,
            "execute without bound parameter types",
        ));
    }

    let mut values = Vec::with_capacity(stmt.param_count);
    for i in 0..stmt.param_count {
        if null_bitmap[i / 8] & (1 << (i % 8)) != 0 {
            values.push("NULL".to_string());
            continue;
        }

        if let Some(long) = stmt.long_data.get(&(i as u16)) {
            values.push(escape_literal(long));
            continue;
        }

        let field_type = (stmt.param_types[i] & 0xFF) as u8;
        let unsigned = stmt.param_types[i] & 0x8000 != 0;
        let value = decode_binary_value(&mut buf, field_type, unsigned).ok_or_else(malformed)?;
        values.push(value);
    }

    Ok(ExecuteRequest { stmt_id, values })
}

fn decode_binary_value(buf: &mut &[u8], field_type: u8, unsigned: bool) -> Option<String> {
    match field_type {
        MYSQL_TYPE_NULL => Some("NULL".to_string()),
        MYSQL_TYPE_TINY => {
            if buf.len() < 1 {
                return None;
            }
            let v = buf.get_u8();
            Some(if unsigned {
                v.to_string()
            } else {
                (v as i8).to_string()
            })
        }
        MYSQL_TYPE_SHORT | MYSQL_TYPE_YEAR => {
            if buf.len() < 2 {
                return None;
            }
            let v = buf.get_u16_le();
            Some(if unsigned {
                v.to_string()
            } else {
                (v as i16).to_string()
            })
        }
        MYSQL_TYPE_LONG | MYSQL_TYPE_INT24 => {
            if buf.len() < 4 {
                return None;
            }
            let v = buf.get_u32_le();
            Some(if unsigned {
                v.to_string()
            } else {
                (v as i32).to_string()
            })
        }
        MYSQL_TYPE_LONGLONG => {
            if buf.len() < 8 {
                return None;
            }
            let v = buf.get_u64_le();
            Some(if unsigned {
                v.to_string()
            } else {
                (v as i64).to_string()
            })
        }
        MYSQL_TYPE_FLOAT => {
            if buf.len() < 4 {
                return None;
            }
            let mut raw = [0u8; 4];
            raw.copy_from_slice(&buf[..4]);
            buf.advance(4);
            Some(f32::from_le_bytes(raw).to_string())
        }
        MYSQL_TYPE_DOUBLE => {
            if buf.len() < 8 {
                return None;
            }
            let mut raw = [0u8; 8];
            raw.copy_from_slice(&buf[..8]);
            buf.advance(8);
            Some(f64::from_le_bytes(raw).to_string())
        }
        // string-shaped types arrive as length-encoded bytes
        MYSQL_TYPE_DECIMAL | MYSQL_TYPE_NEWDECIMAL | MYSQL_TYPE_VARCHAR | MYSQL_TYPE_BLOB
        | MYSQL_TYPE_VAR_STRING | MYSQL_TYPE_STRING | MYSQL_TYPE_DATE | MYSQL_TYPE_TIME
        | MYSQL_TYPE_DATETIME | MYSQL_TYPE_TIMESTAMP => {
            let (value, consumed) = get_lenenc_bytes(buf)?;
            let value = value?;
            let literal = escape_literal(value);
            buf.advance(consumed);
            Some(literal)
        }
        _ => None,
    }
}
