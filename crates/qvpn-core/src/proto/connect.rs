//! Connect handshake framing on the first bidirectional stream.
//!
//! The client names the tunnel target (authority + path from the URI
//! template); the server answers with an HTTP-style status code. Both
//! frames use varint-length-prefixed UTF-8 fields.

use bytes::{Buf, Bytes, BytesMut};

use crate::constants::MAX_REQUEST_FIELD;
use crate::error::{Error, Result};

use super::varint::{get_varint, peek_varint, put_varint, varint_len};

/// CONNECT-IP request sent by the peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectRequest {
    /// Target authority, e.g. `vpn.example.org:4433`.
    pub authority: String,
    /// Target path from the URI template, e.g. `/vpn`.
    pub path: String,
}

impl ConnectRequest {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(
            self.authority.len() + self.path.len() + 2 * varint_len(MAX_REQUEST_FIELD as u64),
        );
        put_varint(&mut buf, self.authority.len() as u64);
        buf.extend_from_slice(self.authority.as_bytes());
        put_varint(&mut buf, self.path.len() as u64);
        buf.extend_from_slice(self.path.as_bytes());
        buf.freeze()
    }

    /// Decode a request; `Ok(None)` while the buffer is still incomplete.
    pub fn decode(buf: &mut BytesMut) -> Result<Option<Self>> {
        let Some((authority, after_authority)) = peek_field(buf, 0)? else {
            return Ok(None);
        };
        let Some((path, end)) = peek_field(buf, after_authority)? else {
            return Ok(None);
        };
        buf.advance(end);
        Ok(Some(Self { authority, path }))
    }
}

/// Server answer to a [`ConnectRequest`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectResponse {
    pub status: u16,
}

impl ConnectResponse {
    pub fn new(status: u16) -> Self {
        Self { status }
    }

    pub fn is_ok(&self) -> bool {
        self.status == super::STATUS_OK
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(varint_len(self.status as u64));
        put_varint(&mut buf, self.status as u64);
        buf.freeze()
    }

    /// Decode a response; `Ok(None)` while the buffer is still incomplete.
    pub fn decode(buf: &mut BytesMut) -> Result<Option<Self>> {
        let Some((status, _)) = peek_varint(buf) else {
            return Ok(None);
        };
        if status > u16::MAX as u64 {
            return Err(Error::codec(format!("status {status} out of range")));
        }
        get_varint(buf);
        Ok(Some(Self {
            status: status as u16,
        }))
    }
}

/// Peek one length-prefixed UTF-8 field at `offset`; returns the field and
/// the offset just past it.
fn peek_field(buf: &BytesMut, offset: usize) -> Result<Option<(String, usize)>> {
    let Some((len, len_len)) = peek_varint(&buf[offset..]) else {
        return Ok(None);
    };
    let len = len as usize;
    if len > MAX_REQUEST_FIELD {
        return Err(Error::codec(format!(
            "request field of {len} bytes exceeds maximum {MAX_REQUEST_FIELD}"
        )));
    }
    let start = offset + len_len;
    if buf.len() < start + len {
        return Ok(None);
    }
    let field = std::str::from_utf8(&buf[start..start + len])
        .map_err(|_| Error::codec("request field is not valid UTF-8"))?
        .to_string();
    Ok(Some((field, start + len)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proto::{STATUS_BAD_REQUEST, STATUS_OK};

    #[test]
    fn request_roundtrip() {
        let request = ConnectRequest {
            authority: "vpn.example.org:4433".to_string(),
            path: "/vpn".to_string(),
        };
        let mut buf = BytesMut::from(&request.encode()[..]);
        assert_eq!(ConnectRequest::decode(&mut buf).unwrap(), Some(request));
        assert!(buf.is_empty());
    }

    #[test]
    fn request_partial_returns_none() {
        let request = ConnectRequest {
            authority: "vpn.example.org:4433".to_string(),
            path: "/vpn".to_string(),
        };
        let encoded = request.encode();
        for cut in 0..encoded.len() {
            let mut buf = BytesMut::from(&encoded[..cut]);
            assert!(ConnectRequest::decode(&mut buf).unwrap().is_none());
            assert_eq!(buf.len(), cut);
        }
    }

    #[test]
    fn request_oversized_field_rejected() {
        let mut buf = BytesMut::new();
        put_varint(&mut buf, (MAX_REQUEST_FIELD + 1) as u64);
        assert!(ConnectRequest::decode(&mut buf).is_err());
    }

    #[test]
    fn request_invalid_utf8_rejected() {
        let mut buf = BytesMut::new();
        put_varint(&mut buf, 2);
        buf.extend_from_slice(&[0xff, 0xfe]);
        put_varint(&mut buf, 1);
        buf.extend_from_slice(b"/");
        assert!(ConnectRequest::decode(&mut buf).is_err());
    }

    #[test]
    fn response_roundtrip() {
        for status in [STATUS_OK, STATUS_BAD_REQUEST, 403, 503] {
            let response = ConnectResponse::new(status);
            let mut buf = BytesMut::from(&response.encode()[..]);
            assert_eq!(ConnectResponse::decode(&mut buf).unwrap(), Some(response));
        }
        assert!(ConnectResponse::new(STATUS_OK).is_ok());
        assert!(!ConnectResponse::new(STATUS_BAD_REQUEST).is_ok());
    }

    #[test]
    fn response_empty_buffer_returns_none() {
        let mut buf = BytesMut::new();
        assert!(ConnectResponse::decode(&mut buf).unwrap().is_none());
    }
}
