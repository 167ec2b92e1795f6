//! CONNECT-IP signalling and datagram framing.
//!
//! The capsule codec follows RFC 9484: `ADDRESS_ASSIGN`, `ADDRESS_REQUEST`
//! and `ROUTE_ADVERTISEMENT` capsules on the request stream, IP packets as
//! QUIC datagrams prefixed with an HTTP datagram context ID.

mod capsule;
mod connect;
mod varint;

pub use capsule::{AssignedAddress, Capsule, IpRoute};
pub use connect::{ConnectRequest, ConnectResponse};
pub use varint::{get_varint, peek_varint, put_varint, varint_len};

use bytes::{Bytes, BytesMut};

use crate::constants::CONTEXT_ID_IP;
use crate::error::{Error, Result};

/// Connect response status: request accepted.
pub const STATUS_OK: u16 = 200;
/// Connect response status: unknown path or malformed request.
pub const STATUS_BAD_REQUEST: u16 = 400;
/// Connect response status: peer identity rejected.
pub const STATUS_FORBIDDEN: u16 = 403;
/// Connect response status: address pool exhausted.
pub const STATUS_UNAVAILABLE: u16 = 503;

/// Frame an IP packet as an HTTP datagram payload (context ID 0).
pub fn encode_datagram(packet: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(varint_len(CONTEXT_ID_IP) + packet.len());
    put_varint(&mut buf, CONTEXT_ID_IP);
    buf.extend_from_slice(packet);
    buf.freeze()
}

/// Strip the HTTP datagram context ID and return the IP packet.
///
/// Datagrams with an unknown context ID are a peer-local permanent error:
/// the caller drops them.
pub fn decode_datagram(datagram: &[u8]) -> Result<&[u8]> {
    let (context_id, consumed) =
        peek_varint(datagram).ok_or_else(|| Error::codec("datagram too short for context ID"))?;
    if context_id != CONTEXT_ID_IP {
        return Err(Error::codec(format!("unknown datagram context {context_id}")));
    }
    Ok(&datagram[consumed..])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn datagram_roundtrip() {
        let packet = [0x45u8, 0, 0, 20, 1, 2, 3, 4];
        let framed = encode_datagram(&packet);
        assert_eq!(framed[0], 0); // context ID 0 encodes as a single byte
        assert_eq!(decode_datagram(&framed).unwrap(), &packet[..]);
    }

    #[test]
    fn datagram_unknown_context_rejected() {
        let mut buf = BytesMut::new();
        put_varint(&mut buf, 7);
        buf.extend_from_slice(&[0x45, 0, 0, 20]);
        assert!(decode_datagram(&buf).is_err());
    }

    #[test]
    fn datagram_empty_rejected() {
        assert!(decode_datagram(&[]).is_err());
    }
}
