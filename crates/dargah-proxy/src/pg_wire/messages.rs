//! Protocol message builders and client-message parsers.
//!
//! Builders construct frames the proxy synthesizes itself (errors,
//! ReadyForQuery); parsers pull apart the extended-protocol client messages
//! the session pipeline needs to inspect.

use super::codec::{read_cstr, read_i16, read_i32, CodecError};

/// Build an ErrorResponse frame with severity, SQLSTATE and message fields.
/// The length field covers length + payload but not the type byte.
pub fn encode_error(severity: &str, code: &str, message: &str) -> Vec<u8> {
    let mut buf = Vec::new();
    buf.push(b'E');
    buf.extend_from_slice(&[0, 0, 0, 0]); // length placeholder

    buf.push(b'S');
    buf.extend_from_slice(severity.as_bytes());
    buf.push(0);

    buf.push(b'C');
    buf.extend_from_slice(code.as_bytes());
    buf.push(0);

    buf.push(b'M');
    buf.extend_from_slice(message.as_bytes());
    buf.push(0);

    buf.push(0); // terminator

    let len = (buf.len() - 1) as u32;
    buf[1..5].copy_from_slice(&len.to_be_bytes());
    buf
}

/// ReadyForQuery with the given transaction status byte.
pub fn encode_ready_for_query(status: u8) -> [u8; 6] {
    [b'Z', 0, 0, 0, 5, status]
}

/// A Parse message: statement name, SQL text, declared parameter types.
#[derive(Debug, Clone)]
pub struct ParseMessage {
    pub statement: String,
    pub sql: String,
    pub param_types: Vec<i32>,
}

/// Decode the payload of a `P` frame: `name\0 sql\0 i16 n [i32 oid]*`.
pub fn decode_parse(payload: &[u8]) -> Result<ParseMessage, CodecError> {
    let (statement, offset) = read_cstr(payload, 0)?;
    let (sql, offset) = read_cstr(payload, offset)?;
    let (count, mut offset) = read_i16(payload, offset)?;

    let mut param_types = Vec::with_capacity(count.max(0) as usize);
    for _ in 0..count {
        let (oid, next) = read_i32(payload, offset)?;
        param_types.push(oid);
        offset = next;
    }

    Ok(ParseMessage {
        statement,
        sql,
        param_types,
    })
}

/// One bound parameter value with its format.
#[derive(Debug, Clone, PartialEq)]
pub enum BindValue {
    Null,
    Text(String),
    Binary(Vec<u8>),
}

/// A Bind message: the portal it creates, the statement it binds, and the
/// parameter values (format codes already applied).
#[derive(Debug, Clone)]
pub struct BindMessage {
    pub portal: String,
    pub statement: String,
    pub params: Vec<BindValue>,
}

/// Decode the payload of a `B` frame:
/// `portal\0 stmt\0 i16 nfmt [i16]* i16 nparam [i32 len; bytes]* i16 nres [i16]*`.
pub fn decode_bind(payload: &[u8]) -> Result<BindMessage, CodecError> {
    let (portal, offset) = read_cstr(payload, 0)?;
    let (statement, offset) = read_cstr(payload, offset)?;

    let (nfmt, mut offset) = read_i16(payload, offset)?;
    let mut formats = Vec::with_capacity(nfmt.max(0) as usize);
    for _ in 0..nfmt {
        let (fmt, next) = read_i16(payload, offset)?;
        formats.push(fmt);
        offset = next;
    }

    let (nparam, mut offset) = read_i16(payload, offset)?;
    let mut params = Vec::with_capacity(nparam.max(0) as usize);
    for i in 0..nparam {
        let (len, next) = read_i32(payload, offset)?;
        offset = next;
        if len == -1 {
            params.push(BindValue::Null);
            continue;
        }
        if len < 0 {
            return Err(CodecError::Protocol(format!(
                "negative parameter length {len} at index {i}"
            )));
        }
        let end = offset + len as usize;
        let bytes = payload
            .get(offset..end)
            .ok_or_else(|| CodecError::Protocol(format!("truncated parameter {i}")))?;
        offset = end;

        // format code resolution: none declared means all-text, a single
        // declared code applies to every parameter
        let format = match formats.len() {
            0 => 0,
            1 => formats[0],
            _ => *formats.get(i as usize).unwrap_or(&0),
        };
        if format == 1 {
            params.push(BindValue::Binary(bytes.to_vec()));
        } else {
            params.push(BindValue::Text(String::from_utf8_lossy(bytes).into_owned()));
        }
    }

    // result-column formats are irrelevant to the proxy; ignore the tail

    Ok(BindMessage {
        portal,
        statement,
        params,
    })
}

/// Extract NUL-terminated SQL from a `Q` frame payload.
pub fn decode_simple_query(payload: &[u8]) -> Result<String, CodecError> {
    let (sql, _) = read_cstr(payload, 0)?;
    Ok(sql)
}

/// Render a bind value as a SQL literal for audit materialization.
///
/// Text values are single-quoted with internal quotes doubled; binary
/// values become bytea-style hex literals.
pub fn literal(value: &BindValue) -> String {
    match value {
        BindValue::Null => "NULL".to_string(),
        BindValue::Text(text) => format!("'{}'", text.replace('\'', "''")),
        BindValue::Binary(bytes) => {
            let hex: String = bytes.iter().map(|b| format!("{b:02x}")).collect();
            format!("'\\x{hex}'")
        }
    }
}

/// Inline bind parameters into `$n` placeholders of the parsed SQL.
///
/// The statement is scanned once and literals are spliced in by range, so
/// substituted text is never looked at again: a bound value that itself
/// contains `$1` comes out exactly as bound, and `$1` never clobbers the
/// prefix of `$10`. Placeholders with no matching parameter are left alone.
pub fn materialize_sql(sql: &str, params: &[BindValue]) -> String {
    let bytes = sql.as_bytes();
    let mut result = String::with_capacity(sql.len());
    let mut copied = 0;
    let mut i = 0;

    while i < bytes.len() {
        if bytes[i] != b'$' {
            i += 1;
            continue;
        }
        let mut end = i + 1;
        while end < bytes.len() && bytes[end].is_ascii_digit() {
            end += 1;
        }
        match sql[i + 1..end].parse::<usize>() {
            Ok(n) if n >= 1 && n <= params.len() => {
                result.push_str(&sql[copied..i]);
                result.push_str(&literal(&params[n - 1]));
                copied = end;
            }
            _ => {}
        }
        i = end.max(i + 1);
    }

    result.push_str(&sql[copied..]);
    result
}
