//! Capsule codec for the CONNECT-IP request stream (RFC 9484 §4.7).
//!
//! A capsule is `type (varint) | length (varint) | payload`. Unknown capsule
//! types are skipped, as the capsule protocol requires.

use std::net::IpAddr;

use bytes::{Buf, Bytes, BytesMut};
use ipnet::IpNet;

use crate::constants::MAX_CAPSULE_SIZE;
use crate::error::{Error, Result};

use super::varint::{get_varint, peek_varint, put_varint, varint_len};

/// ADDRESS_ASSIGN capsule type.
pub const CAPSULE_ADDRESS_ASSIGN: u64 = 0x01;
/// ADDRESS_REQUEST capsule type.
pub const CAPSULE_ADDRESS_REQUEST: u64 = 0x02;
/// ROUTE_ADVERTISEMENT capsule type.
pub const CAPSULE_ROUTE_ADVERTISEMENT: u64 = 0x03;

/// One assigned (or requested) address element.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssignedAddress {
    /// Request ID this assignment answers (0 for unsolicited).
    pub request_id: u64,
    /// Assigned prefix; a unique host carries the full prefix length of the
    /// VPN network.
    pub prefix: IpNet,
}

/// One advertised route element: an inclusive address span and an IP
/// protocol selector (0 = any).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IpRoute {
    pub start: IpAddr,
    pub end: IpAddr,
    pub protocol: u8,
}

impl IpRoute {
    /// Route covering a whole prefix for any protocol.
    pub fn for_prefix(prefix: IpNet) -> Self {
        let (start, end) = crate::net::route_span(prefix);
        Self {
            start,
            end,
            protocol: 0,
        }
    }
}

/// A decoded capsule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Capsule {
    AddressAssign(Vec<AssignedAddress>),
    AddressRequest(Vec<AssignedAddress>),
    RouteAdvertisement(Vec<IpRoute>),
}

impl Capsule {
    fn capsule_type(&self) -> u64 {
        match self {
            Capsule::AddressAssign(_) => CAPSULE_ADDRESS_ASSIGN,
            Capsule::AddressRequest(_) => CAPSULE_ADDRESS_REQUEST,
            Capsule::RouteAdvertisement(_) => CAPSULE_ROUTE_ADVERTISEMENT,
        }
    }

    /// Encode this capsule with its type and length prefix.
    pub fn encode(&self) -> Bytes {
        let mut payload = BytesMut::new();
        match self {
            Capsule::AddressAssign(addresses) | Capsule::AddressRequest(addresses) => {
                for address in addresses {
                    encode_address(&mut payload, address);
                }
            }
            Capsule::RouteAdvertisement(routes) => {
                for route in routes {
                    encode_route(&mut payload, route);
                }
            }
        }

        let mut buf =
            BytesMut::with_capacity(varint_len(self.capsule_type()) + 8 + payload.len());
        put_varint(&mut buf, self.capsule_type());
        put_varint(&mut buf, payload.len() as u64);
        buf.extend_from_slice(&payload);
        buf.freeze()
    }

    /// Decode the next known capsule from `buf`.
    ///
    /// Returns `Ok(None)` when the buffer does not yet hold a complete
    /// capsule. Unknown capsule types are consumed and skipped. The buffer
    /// is only advanced past complete capsules.
    pub fn decode(buf: &mut BytesMut) -> Result<Option<Capsule>> {
        loop {
            let Some((capsule_type, type_len)) = peek_varint(buf) else {
                return Ok(None);
            };
            let Some((payload_len, len_len)) = peek_varint(&buf[type_len..]) else {
                return Ok(None);
            };
            let payload_len = payload_len as usize;
            if payload_len > MAX_CAPSULE_SIZE {
                return Err(Error::codec(format!(
                    "capsule payload {payload_len} exceeds maximum {MAX_CAPSULE_SIZE}"
                )));
            }

            let header_len = type_len + len_len;
            if buf.len() < header_len + payload_len {
                return Ok(None);
            }

            buf.advance(header_len);
            let mut payload = buf.split_to(payload_len);

            match capsule_type {
                CAPSULE_ADDRESS_ASSIGN => {
                    return Ok(Some(Capsule::AddressAssign(decode_addresses(
                        &mut payload,
                    )?)));
                }
                CAPSULE_ADDRESS_REQUEST => {
                    return Ok(Some(Capsule::AddressRequest(decode_addresses(
                        &mut payload,
                    )?)));
                }
                CAPSULE_ROUTE_ADVERTISEMENT => {
                    return Ok(Some(Capsule::RouteAdvertisement(decode_routes(
                        &mut payload,
                    )?)));
                }
                _ => {
                    // Unknown capsule: skip and keep scanning
                    continue;
                }
            }
        }
    }
}

fn encode_address(buf: &mut BytesMut, address: &AssignedAddress) {
    put_varint(buf, address.request_id);
    match address.prefix.addr() {
        IpAddr::V4(v4) => {
            buf.extend_from_slice(&[4]);
            buf.extend_from_slice(&v4.octets());
        }
        IpAddr::V6(v6) => {
            buf.extend_from_slice(&[6]);
            buf.extend_from_slice(&v6.octets());
        }
    }
    buf.extend_from_slice(&[address.prefix.prefix_len()]);
}

fn encode_route(buf: &mut BytesMut, route: &IpRoute) {
    match (route.start, route.end) {
        (IpAddr::V4(start), IpAddr::V4(end)) => {
            buf.extend_from_slice(&[4]);
            buf.extend_from_slice(&start.octets());
            buf.extend_from_slice(&end.octets());
        }
        (IpAddr::V6(start), IpAddr::V6(end)) => {
            buf.extend_from_slice(&[6]);
            buf.extend_from_slice(&start.octets());
            buf.extend_from_slice(&end.octets());
        }
        // Mixed-family spans cannot occur for routes built from a prefix;
        // degrade to the single start address.
        (IpAddr::V4(start), _) => {
            buf.extend_from_slice(&[4]);
            buf.extend_from_slice(&start.octets());
            buf.extend_from_slice(&start.octets());
        }
        (IpAddr::V6(start), _) => {
            buf.extend_from_slice(&[6]);
            buf.extend_from_slice(&start.octets());
            buf.extend_from_slice(&start.octets());
        }
    }
    buf.extend_from_slice(&[route.protocol]);
}

fn decode_addresses(payload: &mut BytesMut) -> Result<Vec<AssignedAddress>> {
    let mut addresses = Vec::new();
    while !payload.is_empty() {
        let request_id =
            get_varint(payload).ok_or_else(|| Error::codec("truncated address request ID"))?;
        let addr = decode_ip(payload)?;
        if payload.is_empty() {
            return Err(Error::codec("truncated address prefix length"));
        }
        let prefix_len = payload.split_to(1)[0];
        let prefix = IpNet::new(addr, prefix_len)
            .map_err(|e| Error::codec(format!("invalid prefix length {prefix_len}: {e}")))?;
        addresses.push(AssignedAddress { request_id, prefix });
    }
    Ok(addresses)
}

fn decode_routes(payload: &mut BytesMut) -> Result<Vec<IpRoute>> {
    let mut routes = Vec::new();
    while !payload.is_empty() {
        let version = payload[0];
        payload.advance(1);
        let (start, end) = match version {
            4 => {
                if payload.len() < 8 {
                    return Err(Error::codec("truncated IPv4 route"));
                }
                let start: [u8; 4] = payload.split_to(4).as_ref().try_into().expect("length");
                let end: [u8; 4] = payload.split_to(4).as_ref().try_into().expect("length");
                (IpAddr::from(start), IpAddr::from(end))
            }
            6 => {
                if payload.len() < 32 {
                    return Err(Error::codec("truncated IPv6 route"));
                }
                let start: [u8; 16] = payload.split_to(16).as_ref().try_into().expect("length");
                let end: [u8; 16] = payload.split_to(16).as_ref().try_into().expect("length");
                (IpAddr::from(start), IpAddr::from(end))
            }
            v => return Err(Error::codec(format!("unknown route IP version {v}"))),
        };
        if start > end {
            return Err(Error::codec("route start address after end address"));
        }
        if payload.is_empty() {
            return Err(Error::codec("truncated route protocol"));
        }
        let protocol = payload.split_to(1)[0];
        routes.push(IpRoute {
            start,
            end,
            protocol,
        });
    }
    Ok(routes)
}

fn decode_ip(payload: &mut BytesMut) -> Result<IpAddr> {
    if payload.is_empty() {
        return Err(Error::codec("truncated IP version"));
    }
    let version = payload[0];
    payload.advance(1);
    match version {
        4 => {
            if payload.len() < 4 {
                return Err(Error::codec("truncated IPv4 address"));
            }
            let octets: [u8; 4] = payload.split_to(4).as_ref().try_into().expect("length");
            Ok(IpAddr::from(octets))
        }
        6 => {
            if payload.len() < 16 {
                return Err(Error::codec("truncated IPv6 address"));
            }
            let octets: [u8; 16] = payload.split_to(16).as_ref().try_into().expect("length");
            Ok(IpAddr::from(octets))
        }
        v => Err(Error::codec(format!("unknown address IP version {v}"))),
    }
}
