//! VPN network math.
//!
//! Derives the gateway and the allocatable host range from the configured
//! assignment prefix. The gateway is the first host address and is reserved
//! for the concentrator's TUN interface; it is never handed to a peer.

use std::net::IpAddr;

use ipnet::IpNet;

use crate::error::{Error, Result};

/// Immutable description of the VPN network.
///
/// Built once from `assign_cidr` at startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkInfo {
    /// The whole VPN prefix with host bits cleared.
    prefix: IpNet,
    /// First host address, reserved for the concentrator.
    gateway: IpAddr,
}

impl NetworkInfo {
    /// Build network info from an assignment prefix.
    ///
    /// Fails when the prefix has no allocatable host address besides the
    /// gateway (e.g. /31, /32).
    pub fn new(cidr: IpNet) -> Result<Self> {
        let prefix = cidr.trunc();
        let gateway = next_ip(prefix.network()).ok_or_else(|| Error::Config {
            message: format!("prefix {prefix} has no gateway address"),
        })?;

        if !prefix.contains(&gateway) {
            return Err(Error::Config {
                message: format!("prefix {prefix} too small for a gateway"),
            });
        }

        let info = Self { prefix, gateway };
        if info.allocatable().next().is_none() {
            return Err(Error::Config {
                message: format!("prefix {prefix} has no allocatable host address"),
            });
        }

        Ok(info)
    }

    /// The masked VPN prefix.
    pub fn prefix(&self) -> IpNet {
        self.prefix
    }

    /// Prefix length in bits.
    pub fn prefix_len(&self) -> u8 {
        self.prefix.prefix_len()
    }

    /// Gateway host address.
    pub fn gateway(&self) -> IpAddr {
        self.gateway
    }

    /// Gateway address with the network's prefix length, as assigned to the
    /// TUN interface.
    pub fn gateway_net(&self) -> IpNet {
        // prefix_len was validated by the IpNet we derived it from
        IpNet::new(self.gateway, self.prefix.prefix_len())
            .unwrap_or_else(|_| self.prefix)
    }

    /// Whether `addr` lies inside the VPN prefix.
    pub fn contains(&self, addr: IpAddr) -> bool {
        self.prefix.contains(&addr)
    }

    /// Whether `addr` may be assigned to a peer.
    ///
    /// Excludes the network address, the gateway and (for IPv4) the
    /// broadcast address.
    pub fn is_allocatable(&self, addr: IpAddr) -> bool {
        self.prefix.contains(&addr)
            && addr != self.prefix.network()
            && addr != self.gateway
            && !(addr.is_ipv4() && addr == self.prefix.broadcast())
    }

    /// Allocatable host addresses in ascending order.
    ///
    /// IPv6 `hosts()` includes the network address, so the filter applies the
    /// full allocatable predicate rather than just skipping the gateway.
    pub fn allocatable(&self) -> impl Iterator<Item = IpAddr> + '_ {
        self.prefix.hosts().filter(move |a| self.is_allocatable(*a))
    }

    /// Turn an allocated host address into the prefix communicated to the
    /// peer (`addr/prefix_len`).
    pub fn host_prefix(&self, addr: IpAddr) -> Result<IpNet> {
        IpNet::new(addr, self.prefix.prefix_len()).map_err(|e| Error::Internal {
            message: format!("host prefix for {addr}: {e}"),
        })
    }
}

/// The address immediately after `ip`, carrying over between bytes.
///
/// Returns `None` on wrap-around past the all-ones address.
pub fn next_ip(ip: IpAddr) -> Option<IpAddr> {
    match ip {
        IpAddr::V4(v4) => {
            let n = u32::from(v4).checked_add(1)?;
            Some(IpAddr::V4(n.into()))
        }
        IpAddr::V6(v6) => {
            let n = u128::from(v6).checked_add(1)?;
            Some(IpAddr::V6(n.into()))
        }
    }
}

/// The inclusive address span covered by `prefix`, used when advertising a
/// route as a (start, end) pair.
pub fn route_span(prefix: IpNet) -> (IpAddr, IpAddr) {
    let masked = prefix.trunc();
    (masked.network(), masked.broadcast())
}
