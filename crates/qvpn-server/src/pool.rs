//! Address pool keyed by peer identity.
//!
//! An ordered map from peer to assigned address and the inverse map, kept
//! mutually consistent under one mutex. Allocation scans the allocatable
//! range in ascending order; the gateway and the network/broadcast
//! addresses are never handed out.

use std::collections::BTreeMap;
use std::net::IpAddr;
use std::sync::Mutex;

use ipnet::IpNet;

use qvpn_core::error::{Error, Result};
use qvpn_core::net::NetworkInfo;
use qvpn_core::PeerId;

struct PoolMaps {
    by_peer: BTreeMap<PeerId, IpAddr>,
    by_addr: BTreeMap<IpAddr, PeerId>,
}

/// The concentrator's address allocator.
pub struct AddressPool {
    net: NetworkInfo,
    inner: Mutex<PoolMaps>,
}

impl AddressPool {
    pub fn new(net: NetworkInfo) -> Self {
        Self {
            net,
            inner: Mutex::new(PoolMaps {
                by_peer: BTreeMap::new(),
                by_addr: BTreeMap::new(),
            }),
        }
    }

    /// The network this pool allocates from.
    pub fn network(&self) -> &NetworkInfo {
        &self.net
    }

    /// Allocate a host address for `peer`.
    ///
    /// Idempotent per peer: a reconnecting peer receives the address it
    /// already holds. Scans ascending and returns the first free address;
    /// fails with [`Error::NoAddressAvailable`] when the pool is exhausted.
    pub fn allocate(&self, peer: &PeerId) -> Result<IpNet> {
        let mut maps = self.inner.lock().expect("pool lock poisoned");

        if let Some(addr) = maps.by_peer.get(peer) {
            return self.net.host_prefix(*addr);
        }

        let addr = self
            .net
            .allocatable()
            .find(|a| !maps.by_addr.contains_key(a))
            .ok_or(Error::NoAddressAvailable)?;

        maps.by_peer.insert(peer.clone(), addr);
        maps.by_addr.insert(addr, peer.clone());
        self.net.host_prefix(addr)
    }

    /// Release `addr` and its peer mapping. No-op if absent.
    pub fn release(&self, addr: IpAddr) {
        let mut maps = self.inner.lock().expect("pool lock poisoned");
        if let Some(peer) = maps.by_addr.remove(&addr) {
            maps.by_peer.remove(&peer);
        }
    }

    pub fn lookup_by_peer(&self, peer: &PeerId) -> Option<IpAddr> {
        self.inner
            .lock()
            .expect("pool lock poisoned")
            .by_peer
            .get(peer)
            .copied()
    }

    pub fn lookup_by_addr(&self, addr: IpAddr) -> Option<PeerId> {
        self.inner
            .lock()
            .expect("pool lock poisoned")
            .by_addr
            .get(&addr)
            .cloned()
    }

    /// Number of assigned addresses.
    pub fn len(&self) -> usize {
        self.inner.lock().expect("pool lock poisoned").by_peer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Check that the forward and inverse maps agree.
    #[cfg(test)]
    fn assert_consistent(&self) {
        let maps = self.inner.lock().expect("pool lock poisoned");
        assert_eq!(maps.by_peer.len(), maps.by_addr.len());
        for (peer, addr) in &maps.by_peer {
            assert_eq!(maps.by_addr.get(addr), Some(peer));
            assert!(self.net.is_allocatable(*addr));
        }
    }
}
