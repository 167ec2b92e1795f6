//! Session registry: coordinates the address pool, the route table and the
//! access controller over the session lifecycle.
//!
//! The registry creates sessions atomically with address allocation and
//! route insertion, and finalises them exactly once: route entry removed
//! first, address released second, so the demultiplexer can never observe
//! a route whose address has already been reassigned.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::{Arc, Mutex};
use std::time::SystemTime;

use ipnet::IpNet;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use qvpn_core::buffer::PooledBuf;
use qvpn_core::constants::{DOWNLINK_QUEUE_DEPTH, UPLINK_QUEUE_DEPTH};
use qvpn_core::error::{Error, Result};
use qvpn_core::net::NetworkInfo;
use qvpn_core::proto::IpRoute;
use qvpn_core::PeerId;

use crate::acl::AccessController;
use crate::pool::AddressPool;
use crate::routes::{RouteTable, SessionHandle};
use crate::session::Session;

/// A session's wiring, handed to whoever drives its connection.
#[derive(Debug)]
pub struct SessionSetup {
    pub session: Arc<Session>,
    /// Feed uplink packets (peer to kernel) here.
    pub uplink_tx: mpsc::Sender<PooledBuf>,
    /// Consumed by the uplink task.
    pub uplink_rx: mpsc::Receiver<PooledBuf>,
    /// Clone for ICMP replies; the demultiplexer holds one via the route
    /// table.
    pub downlink_tx: mpsc::Sender<PooledBuf>,
    /// Packets for the peer (kernel to peer, plus ICMP replies).
    pub downlink_rx: mpsc::Receiver<PooledBuf>,
    /// Routes to advertise to the peer right after address assignment.
    pub advertised: Vec<IpRoute>,
}

/// Control-plane view of one session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionInfo {
    pub peer_id: PeerId,
    pub addr: IpAddr,
    pub connected_at: SystemTime,
}

/// Registry of live sessions.
pub struct SessionRegistry {
    net: NetworkInfo,
    pool: AddressPool,
    routes: Arc<RouteTable>,
    acl: Arc<AccessController>,
    advertised: Vec<IpRoute>,
    sessions: Mutex<HashMap<PeerId, Arc<Session>>>,
    /// Parent of every session's cancellation token.
    cancel: CancellationToken,
}

impl SessionRegistry {
    pub fn new(
        net: NetworkInfo,
        acl: Arc<AccessController>,
        advertise_routes: &[IpNet],
        cancel: CancellationToken,
    ) -> Self {
        let advertised = advertise_routes
            .iter()
            .map(|prefix| IpRoute::for_prefix(*prefix))
            .collect();
        Self {
            pool: AddressPool::new(net.clone()),
            net,
            routes: Arc::new(RouteTable::new()),
            acl,
            advertised,
            sessions: Mutex::new(HashMap::new()),
            cancel,
        }
    }

    pub fn network(&self) -> &NetworkInfo {
        &self.net
    }

    pub fn routes(&self) -> Arc<RouteTable> {
        Arc::clone(&self.routes)
    }

    pub fn pool(&self) -> &AddressPool {
        &self.pool
    }

    /// Create a session for an authenticated peer.
    ///
    /// Allocates an address, registers the policy snapshot channel and
    /// inserts the route entry. A still-live session under the same peer
    /// identity is drained and finalised first (the peer reconnected).
    pub fn begin_session(&self, peer_id: PeerId) -> Result<SessionSetup> {
        if let Some(existing) = self.session(&peer_id) {
            info!(peer = %peer_id, "Peer reconnected, replacing live session");
            existing.mark_draining();
            self.finalise(&existing);
        }

        let assigned = self.pool.allocate(&peer_id)?;
        let policy = self.acl.register_peer(&peer_id);
        let session = Arc::new(Session::new(
            peer_id.clone(),
            assigned,
            self.net.gateway(),
            self.cancel.child_token(),
            policy,
        ));

        let (uplink_tx, uplink_rx) = mpsc::channel(UPLINK_QUEUE_DEPTH);
        let (downlink_tx, downlink_rx) = mpsc::channel(DOWNLINK_QUEUE_DEPTH);

        let handle = SessionHandle::new(
            peer_id.clone(),
            session.connected_at(),
            downlink_tx.clone(),
        );
        if let Err(e) = self.routes.insert(assigned.addr(), handle) {
            // Pool and route table disagree; give the address back and fail
            // this connection rather than the process
            error!(peer = %peer_id, addr = %assigned.addr(), error = %e,
                "Route table inconsistency on session creation");
            self.acl.unregister_peer(&peer_id);
            self.pool.release(assigned.addr());
            return Err(e);
        }

        self.sessions
            .lock()
            .expect("session map lock poisoned")
            .insert(peer_id.clone(), Arc::clone(&session));

        debug!(peer = %peer_id, addr = %assigned, "Session created");

        Ok(SessionSetup {
            session,
            uplink_tx,
            uplink_rx,
            downlink_tx,
            downlink_rx,
            advertised: self.advertised.clone(),
        })
    }

    /// Finalise a session exactly once: remove it from the session map and
    /// the route table, then release its address.
    ///
    /// Safe to call from the connection task and the control bridge
    /// concurrently; only the call that removes the map entry does the
    /// work.
    pub fn finalise(&self, session: &Arc<Session>) {
        let removed = {
            let mut sessions = self.sessions.lock().expect("session map lock poisoned");
            match sessions.get(session.peer_id()) {
                Some(current) if Arc::ptr_eq(current, session) => {
                    sessions.remove(session.peer_id());
                    true
                }
                _ => false,
            }
        };

        if !removed {
            // Already finalised, or replaced by a newer session
            return;
        }

        // Route first, address second: after this no packet can be routed
        // to a released address
        if self.routes.remove(session.addr()).is_none() {
            warn!(peer = %session.peer_id(), addr = %session.addr(),
                "Finalising session without a route entry");
        }
        self.pool.release(session.addr());
        self.acl.unregister_peer(session.peer_id());
        session.mark_terminated();
        info!(peer = %session.peer_id(), addr = %session.addr(), "Session finalised");
    }

    /// Look up a live session by peer identity.
    pub fn session(&self, peer_id: &PeerId) -> Option<Arc<Session>> {
        self.sessions
            .lock()
            .expect("session map lock poisoned")
            .get(peer_id)
            .cloned()
    }

    /// Begin draining a session by peer identity (admin disconnect).
    ///
    /// Finalisation happens through the owning connection task as usual.
    pub fn disconnect(&self, peer_id: &PeerId) -> Result<()> {
        let session = self.session(peer_id).ok_or_else(|| Error::PeerRejected {
            message: format!("no session for peer {peer_id}"),
        })?;
        info!(peer = %peer_id, "Admin disconnect");
        session.mark_draining();
        Ok(())
    }

    /// Enumerate live sessions for the control bridge.
    pub fn list(&self) -> Vec<SessionInfo> {
        let sessions = self.sessions.lock().expect("session map lock poisoned");
        let mut infos: Vec<SessionInfo> = sessions
            .values()
            .map(|s| SessionInfo {
                peer_id: s.peer_id().clone(),
                addr: s.addr(),
                connected_at: s.connected_at(),
            })
            .collect();
        infos.sort_by(|a, b| a.peer_id.cmp(&b.peer_id));
        infos
    }

    /// Cancel every live session (process shutdown).
    pub fn drain_all(&self) {
        let sessions: Vec<Arc<Session>> = {
            let map = self.sessions.lock().expect("session map lock poisoned");
            map.values().cloned().collect()
        };
        for session in sessions {
            session.mark_draining();
        }
    }

    pub fn len(&self) -> usize {
        self.sessions.lock().expect("session map lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::acl::Action;
    use crate::session::SessionState;

    fn registry(cidr: &str) -> Arc<SessionRegistry> {
        let net = NetworkInfo::new(cidr.parse().unwrap()).unwrap();
        let acl = Arc::new(AccessController::new(Action::Allow));
        Arc::new(SessionRegistry::new(
            net,
            acl,
            &[cidr.parse().unwrap()],
            CancellationToken::new(),
        ))
    }

    #[tokio::test]
    async fn begin_session_wires_pool_and_routes() {
        let registry = registry("10.0.0.0/24");
        let setup = registry.begin_session(PeerId::from("a")).unwrap();

        assert_eq!(
            setup.session.assigned(),
            "10.0.0.2/24".parse::<IpNet>().unwrap()
        );
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.routes().len(), 1);
        assert!(registry
            .routes()
            .lookup("10.0.0.2".parse().unwrap())
            .is_some());
        assert_eq!(setup.advertised.len(), 1);
        assert_eq!(
            setup.advertised[0].start,
            "10.0.0.0".parse::<IpAddr>().unwrap()
        );
    }

    #[tokio::test]
    async fn finalise_removes_route_before_releasing_address() {
        let registry = registry("10.0.0.0/24");
        let setup = registry.begin_session(PeerId::from("a")).unwrap();
        let addr = setup.session.addr();

        registry.finalise(&setup.session);

        assert!(registry.routes().lookup(addr).is_none());
        assert!(registry.pool().lookup_by_addr(addr).is_none());
        assert_eq!(setup.session.state(), SessionState::Terminated);
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn finalise_is_idempotent() {
        let registry = registry("10.0.0.0/24");
        let setup = registry.begin_session(PeerId::from("a")).unwrap();

        registry.finalise(&setup.session);
        registry.finalise(&setup.session);
        assert!(registry.is_empty());
        assert!(registry.pool().is_empty());
    }

    #[tokio::test]
    async fn reconnect_replaces_live_session() {
        let registry = registry("10.0.0.0/24");
        let first = registry.begin_session(PeerId::from("a")).unwrap();
        let second = registry.begin_session(PeerId::from("a")).unwrap();

        // The old session was drained and finalised
        assert_eq!(first.session.state(), SessionState::Terminated);
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.routes().len(), 1);
        // Same address comes back for the same peer
        assert_eq!(second.session.addr(), first.session.addr());
    }

    #[tokio::test]
    async fn finalising_replaced_session_leaves_successor_intact() {
        let registry = registry("10.0.0.0/24");
        let first = registry.begin_session(PeerId::from("a")).unwrap();
        let second = registry.begin_session(PeerId::from("a")).unwrap();

        // Late finalise of the replaced session must not disturb the new one
        registry.finalise(&first.session);
        assert_eq!(registry.len(), 1);
        assert!(registry.routes().lookup(second.session.addr()).is_some());
        assert_eq!(
            registry.pool().lookup_by_peer(&PeerId::from("a")),
            Some(second.session.addr())
        );
    }

    #[tokio::test]
    async fn pool_exhaustion_rejects_second_peer() {
        let registry = registry("10.0.0.0/30");
        let first = registry.begin_session(PeerId::from("a")).unwrap();

        let err = registry.begin_session(PeerId::from("b")).unwrap_err();
        assert!(matches!(err, Error::NoAddressAvailable));

        // First peer unaffected
        assert_eq!(first.session.state(), SessionState::Assigning);
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn disconnect_drains_session() {
        let registry = registry("10.0.0.0/24");
        let setup = registry.begin_session(PeerId::from("a")).unwrap();

        registry.disconnect(&PeerId::from("a")).unwrap();
        assert_eq!(setup.session.state(), SessionState::Draining);
        assert!(setup.session.cancel_token().is_cancelled());

        assert!(registry.disconnect(&PeerId::from("missing")).is_err());
    }

    #[tokio::test]
    async fn list_reports_sessions_sorted() {
        let registry = registry("10.0.0.0/24");
        registry.begin_session(PeerId::from("b")).unwrap();
        registry.begin_session(PeerId::from("a")).unwrap();

        let infos = registry.list();
        assert_eq!(infos.len(), 2);
        assert_eq!(infos[0].peer_id, PeerId::from("a"));
        assert_eq!(infos[1].peer_id, PeerId::from("b"));
    }

    #[tokio::test]
    async fn drain_all_cancels_every_session() {
        let registry = registry("10.0.0.0/24");
        let a = registry.begin_session(PeerId::from("a")).unwrap();
        let b = registry.begin_session(PeerId::from("b")).unwrap();

        registry.drain_all();
        assert_eq!(a.session.state(), SessionState::Draining);
        assert_eq!(b.session.state(), SessionState::Draining);
    }
}
