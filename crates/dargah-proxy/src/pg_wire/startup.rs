//! Startup-family messages: parse, token removal, re-encoding.
//!
//! The very first client message has no type byte: `[i32 length][i32 code]`
//! followed, for a normal startup, by NUL-terminated `key\0value\0` pairs and
//! a single trailing NUL. Parameter order is significant to us because the
//! rewritten message must be byte-identical apart from the removed pair.

use super::codec::{map_startup_eof, CodecError};
use tokio::io::{AsyncRead, AsyncReadExt};

/// Protocol version 3.0
pub const PROTOCOL_V3: u32 = 196_608;
/// SSL negotiation request
pub const SSL_REQUEST: u32 = 80_877_103;
/// Out-of-band cancel request
pub const CANCEL_REQUEST: u32 = 80_877_102;
/// GSSAPI encryption request
pub const GSSENC_REQUEST: u32 = 80_877_104;

/// The startup parameter carrying the bearer token. Consumed by the proxy,
/// never forwarded upstream.
pub const TOKEN_PARAMETER: &str = "token";

/// A decoded startup-family message.
#[derive(Debug, Clone)]
pub struct StartupMessage {
    pub code: u32,
    /// Everything after the code field, still encoded.
    pub body: Vec<u8>,
}

impl StartupMessage {
    pub fn is_ssl_request(&self) -> bool {
        self.code == SSL_REQUEST
    }

    pub fn is_cancel_request(&self) -> bool {
        self.code == CANCEL_REQUEST
    }

    pub fn is_gssenc_request(&self) -> bool {
        self.code == GSSENC_REQUEST
    }

    pub fn is_startup(&self) -> bool {
        self.code == PROTOCOL_V3
    }

    /// Decode the parameter list, preserving order. Duplicate keys are
    /// rejected outright.
    pub fn parameters(&self) -> Result<Vec<(String, String)>, CodecError> {
        decode_parameters(&self.body)
    }
}

/// Read one startup-family frame.
pub async fn read_startup<R: AsyncRead + Unpin>(
    reader: &mut R,
    max_len: usize,
) -> Result<StartupMessage, CodecError> {
    let mut len_buf = [0u8; 4];
    reader
        .read_exact(&mut len_buf)
        .await
        .map_err(map_startup_eof)?;
    let len = u32::from_be_bytes(len_buf) as usize;
    if len < 8 || len > max_len {
        return Err(CodecError::BadLength(len));
    }

    let mut code_buf = [0u8; 4];
    reader
        .read_exact(&mut code_buf)
        .await
        .map_err(map_startup_eof)?;
    let code = u32::from_be_bytes(code_buf);

    let mut body = vec![0u8; len - 8];
    reader
        .read_exact(&mut body)
        .await
        .map_err(map_startup_eof)?;

    Ok(StartupMessage { code, body })
}

/// Decode `key\0value\0 ... \0` into ordered pairs.
pub fn decode_parameters(body: &[u8]) -> Result<Vec<(String, String)>, CodecError> {
    let mut params = Vec::new();
    let mut offset = 0;

    loop {
        let rest = &body[offset..];
        if rest.is_empty() {
            return Err(CodecError::Protocol(
                "startup parameters missing trailing NUL".into(),
            ));
        }
        if rest[0] == 0 {
            // single NUL terminates the list
            break;
        }

        let (key, next) = super::codec::read_cstr(body, offset)?;
        let (value, next) = super::codec::read_cstr(body, next)?;
        offset = next;

        if params.iter().any(|(existing, _)| *existing == key) {
            return Err(CodecError::DuplicateParameter(key));
        }
        params.push((key, value));
    }

    Ok(params)
}

/// Encode a startup message from ordered parameters, length field fixed up.
pub fn encode_startup(params: &[(String, String)]) -> Vec<u8> {
    let mut buf = Vec::new();
    buf.extend_from_slice(&[0, 0, 0, 0]); // length placeholder
    buf.extend_from_slice(&PROTOCOL_V3.to_be_bytes());
    for (key, value) in params {
        buf.extend_from_slice(key.as_bytes());
        buf.push(0);
        buf.extend_from_slice(value.as_bytes());
        buf.push(0);
    }
    buf.push(0); // terminator
    let len = buf.len() as u32;
    buf[0..4].copy_from_slice(&len.to_be_bytes());
    buf
}

/// Remove the `token` parameter and re-emit the startup message. All other
/// pairs keep their original order; the trailing NUL is preserved.
pub fn rewrite_without_token(params: &[(String, String)]) -> Vec<u8> {
    let kept: Vec<(String, String)> = params
        .iter()
        .filter(|(key, _)| key != TOKEN_PARAMETER)
        .cloned()
        .collect();
    encode_startup(&kept)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[tokio::test]
    async fn encode_decode_round_trip() {
        let original = params(&[("user", "u1"), ("database", "db"), ("token", "t0k3n")]);
        let encoded = encode_startup(&original);

        let mut cursor = std::io::Cursor::new(encoded);
        let message = read_startup(&mut cursor, 16 * 1024 * 1024).await.unwrap();
        assert!(message.is_startup());
        assert_eq!(message.parameters().unwrap(), original);
    }

    #[test]
    fn rewrite_strips_only_the_token() {
        let original = params(&[
            ("user", "u1"),
            ("token", "secret"),
            ("database", "db"),
            ("application_name", "psql"),
        ]);
        let rewritten = rewrite_without_token(&original);

        let decoded = decode_parameters(&rewritten[8..]).unwrap();
        assert_eq!(
            decoded,
            params(&[("user", "u1"), ("database", "db"), ("application_name", "psql")])
        );
        // length field covers the whole buffer
        let len = u32::from_be_bytes([rewritten[0], rewritten[1], rewritten[2], rewritten[3]]);
        assert_eq!(len as usize, rewritten.len());
        // trailing NUL preserved
        assert_eq!(*rewritten.last().unwrap(), 0);
    }

    #[test]
    fn rewrite_without_token_is_identity_on_bytes() {
        // a message with no token re-encodes bit-identical
        let original = params(&[("user", "u1"), ("database", "db")]);
        let encoded = encode_startup(&original);
        assert_eq!(rewrite_without_token(&original), encoded);
    }

    #[test]
    fn duplicate_keys_rejected() {
        let encoded = encode_startup(&params(&[("user", "a"), ("user", "b")]));
        let err = decode_parameters(&encoded[8..]).unwrap_err();
        assert!(matches!(err, CodecError::DuplicateParameter(k) if k == "user"));
    }

    #[test]
    fn missing_terminator_rejected() {
        let mut encoded = encode_startup(&params(&[("user", "a")]));
        encoded.pop();
        assert!(decode_parameters(&encoded[8..]).is_err());
    }

    #[tokio::test]
    async fn recognizes_negotiation_codes() {
        for (code, check) in [
            (SSL_REQUEST, true),
            (CANCEL_REQUEST, false),
            (GSSENC_REQUEST, false),
        ] {
            let mut buf = Vec::new();
            buf.extend_from_slice(&8u32.to_be_bytes());
            buf.extend_from_slice(&code.to_be_bytes());
            let mut cursor = std::io::Cursor::new(buf);
            let message = read_startup(&mut cursor, 1024).await.unwrap();
            assert_eq!(message.is_ssl_request(), check);
            assert!(!message.is_startup());
        }
    }
}
