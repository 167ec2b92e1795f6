//! In-memory route table: destination host address to live session.
//!
//! Read-dominated (one lookup per packet on the demultiplexer path), so a
//! read-write lock guards the map. Handles are non-owning: an entry is
//! inserted atomically with address allocation and removed by the session
//! finaliser before the address is released.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::RwLock;
use std::time::SystemTime;

use tokio::sync::mpsc;

use qvpn_core::buffer::PooledBuf;
use qvpn_core::error::{Error, Result};
use qvpn_core::PeerId;

/// Why a packet could not be handed to a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliverError {
    /// The session's bounded downlink queue is full (slow peer).
    QueueFull,
    /// The session is tearing down.
    Closed,
}

/// Non-owning reference to a session's downlink queue.
#[derive(Clone)]
pub struct SessionHandle {
    peer_id: PeerId,
    connected_at: SystemTime,
    downlink: mpsc::Sender<PooledBuf>,
}

impl SessionHandle {
    pub fn new(peer_id: PeerId, connected_at: SystemTime, downlink: mpsc::Sender<PooledBuf>) -> Self {
        Self {
            peer_id,
            connected_at,
            downlink,
        }
    }

    pub fn peer_id(&self) -> &PeerId {
        &self.peer_id
    }

    pub fn connected_at(&self) -> SystemTime {
        self.connected_at
    }

    /// Hand a packet to the session without waiting.
    ///
    /// The demultiplexer must never stall on one slow peer, so a full queue
    /// drops the packet (returning its buffer to the pool).
    pub fn try_deliver(&self, buf: PooledBuf) -> std::result::Result<(), DeliverError> {
        self.downlink.try_send(buf).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => DeliverError::QueueFull,
            mpsc::error::TrySendError::Closed(_) => DeliverError::Closed,
        })
    }
}

/// Destination address to session map.
pub struct RouteTable {
    inner: RwLock<HashMap<IpAddr, SessionHandle>>,
}

impl RouteTable {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(HashMap::new()),
        }
    }

    /// Insert a route. A pre-existing entry for `addr` is an internal
    /// invariant violation: the pool guarantees no two live sessions share
    /// an address.
    pub fn insert(&self, addr: IpAddr, handle: SessionHandle) -> Result<()> {
        let mut map = self.inner.write().expect("route table lock poisoned");
        if map.contains_key(&addr) {
            return Err(Error::Internal {
                message: format!("route for {addr} already present"),
            });
        }
        map.insert(addr, handle);
        Ok(())
    }

    /// Remove the route for `addr`. No-op if absent.
    pub fn remove(&self, addr: IpAddr) -> Option<SessionHandle> {
        self.inner
            .write()
            .expect("route table lock poisoned")
            .remove(&addr)
    }

    /// Look up the session for a destination address.
    pub fn lookup(&self, addr: IpAddr) -> Option<SessionHandle> {
        self.inner
            .read()
            .expect("route table lock poisoned")
            .get(&addr)
            .cloned()
    }

    /// Snapshot of all routes, for the control bridge.
    pub fn snapshot(&self) -> Vec<(IpAddr, SessionHandle)> {
        self.inner
            .read()
            .expect("route table lock poisoned")
            .iter()
            .map(|(addr, handle)| (*addr, handle.clone()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.inner.read().expect("route table lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for RouteTable {
    fn default() -> Self {
        Self::new()
    }
}
