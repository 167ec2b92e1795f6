//! Per-peer session: lifecycle state and the uplink packet path.
//!
//! A session owns its assigned address, its policy snapshot channel and a
//! cancellation token pinned to the lifetime of the CONNECT-IP connection.
//! The uplink task enforces the source-spoof check and access control
//! before packets reach the TUN; the downlink direction is owned by the
//! demultiplexer, which feeds the session's bounded queue.

use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::SystemTime;

use ipnet::IpNet;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use qvpn_core::buffer::PooledBuf;
use qvpn_core::error::{Error, Result};
use qvpn_core::packet::{admin_prohibited_reply, IpHeader};
use qvpn_core::tun::TunPort;
use qvpn_core::PeerId;

use crate::acl::{Action, PolicySnapshot};

/// Session lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// CONNECT-IP request being parsed, client certificate validated.
    Handshaking,
    /// Address allocated, waiting for the peer's acknowledgement.
    Assigning,
    /// Packets flowing.
    Active,
    /// Tearing down: tasks are being cancelled.
    Draining,
    /// Finalised: route removed, address released.
    Terminated,
}

/// Packet-path drop and delivery counters.
#[derive(Debug, Default)]
pub struct SessionStats {
    pub packets_up: AtomicU64,
    pub packets_down: AtomicU64,
    /// Uplink packets whose source was not the assigned address.
    pub spoof_drops: AtomicU64,
    /// Uplink packets denied by access control.
    pub acl_drops: AtomicU64,
    /// Uplink packets with an unparsable IP header.
    pub malformed_drops: AtomicU64,
}

impl SessionStats {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get(counter: &AtomicU64) -> u64 {
        counter.load(Ordering::Relaxed)
    }
}

/// One connected peer.
pub struct Session {
    peer_id: PeerId,
    assigned: IpNet,
    gateway: IpAddr,
    connected_at: SystemTime,
    state: Mutex<SessionState>,
    cancel: CancellationToken,
    policy: watch::Receiver<Arc<PolicySnapshot>>,
    stats: SessionStats,
}

impl Session {
    pub(crate) fn new(
        peer_id: PeerId,
        assigned: IpNet,
        gateway: IpAddr,
        cancel: CancellationToken,
        policy: watch::Receiver<Arc<PolicySnapshot>>,
    ) -> Self {
        Self {
            peer_id,
            assigned,
            gateway,
            connected_at: SystemTime::now(),
            state: Mutex::new(SessionState::Assigning),
            cancel,
            policy,
            stats: SessionStats::default(),
        }
    }

    pub fn peer_id(&self) -> &PeerId {
        &self.peer_id
    }

    /// The host address assigned to this peer.
    pub fn addr(&self) -> IpAddr {
        self.assigned.addr()
    }

    /// The assigned prefix as communicated to the peer.
    pub fn assigned(&self) -> IpNet {
        self.assigned
    }

    pub fn connected_at(&self) -> SystemTime {
        self.connected_at
    }

    pub fn state(&self) -> SessionState {
        *self.state.lock().expect("session state lock poisoned")
    }

    pub fn stats(&self) -> &SessionStats {
        &self.stats
    }

    /// Token cancelled when the session should tear down.
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Current policy snapshot; cheap clone of an `Arc`.
    pub fn policy(&self) -> Arc<PolicySnapshot> {
        self.policy.borrow().clone()
    }

    /// Address assignment acknowledged and routes advertised.
    pub fn mark_active(&self) -> Result<()> {
        let mut state = self.state.lock().expect("session state lock poisoned");
        match *state {
            SessionState::Assigning => {
                *state = SessionState::Active;
                Ok(())
            }
            other => Err(Error::Internal {
                message: format!("cannot activate session in state {other:?}"),
            }),
        }
    }

    /// Begin teardown: transport error, peer close, admin disconnect or
    /// process shutdown. Idempotent; cancels the session token.
    pub fn mark_draining(&self) {
        {
            let mut state = self.state.lock().expect("session state lock poisoned");
            if matches!(*state, SessionState::Terminated) {
                return;
            }
            *state = SessionState::Draining;
        }
        self.cancel.cancel();
    }

    pub(crate) fn mark_terminated(&self) {
        let mut state = self.state.lock().expect("session state lock poisoned");
        *state = SessionState::Terminated;
    }

    /// Uplink task: peer packets towards the kernel.
    ///
    /// For each packet: verify the IP source equals the assigned address
    /// (silent drop on mismatch), evaluate access control (drop and answer
    /// with an ICMP administratively-prohibited reply on deny), then write
    /// to the TUN. Exits on peer disconnect (channel close), TUN failure or
    /// cancellation; malformed packets are logged and dropped.
    pub async fn run_uplink<T: TunPort>(
        self: &Arc<Self>,
        mut uplink_rx: mpsc::Receiver<PooledBuf>,
        reply_tx: mpsc::Sender<PooledBuf>,
        tun: Arc<T>,
    ) -> Result<()> {
        loop {
            let buf = tokio::select! {
                _ = self.cancel.cancelled() => return Ok(()),
                next = uplink_rx.recv() => match next {
                    Some(buf) => buf,
                    None => return Ok(()),
                },
            };

            let packet = buf.packet();
            let header = match IpHeader::parse(packet) {
                Ok(header) => header,
                Err(e) => {
                    SessionStats::bump(&self.stats.malformed_drops);
                    debug!(peer = %self.peer_id, error = %e, "Dropping malformed uplink packet");
                    continue;
                }
            };

            if header.src != self.addr() {
                SessionStats::bump(&self.stats.spoof_drops);
                trace!(
                    peer = %self.peer_id,
                    claimed = %header.src,
                    assigned = %self.addr(),
                    "Dropping spoofed uplink packet"
                );
                continue;
            }

            if self.policy().check(header.dst) == Action::Deny {
                SessionStats::bump(&self.stats.acl_drops);
                trace!(peer = %self.peer_id, dst = %header.dst, "Uplink packet denied by policy");
                if let Some(reply) = admin_prohibited_reply(packet, self.gateway) {
                    // Best effort: a full downlink queue just drops the reply
                    let _ = reply_tx.try_send(PooledBuf::detached(reply));
                }
                continue;
            }

            if let Err(e) = tun.write_packet(packet).await {
                warn!(peer = %self.peer_id, error = %e, "TUN write failed, ending uplink");
                return Err(Error::Tun {
                    message: e.to_string(),
                });
            }
            SessionStats::bump(&self.stats.packets_up);
        }
    }

    /// Record one packet delivered to the peer.
    pub fn record_downlink(&self) {
        SessionStats::bump(&self.stats.packets_down);
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("peer_id", &self.peer_id)
            .field("assigned", &self.assigned)
            .field("state", &self.state())
            .finish()
    }
}
