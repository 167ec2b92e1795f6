//! Control-plane bridge.
//!
//! The only surface exposed to the admin collaborator: enumerate sessions,
//! force-disconnect by peer identity, and push an access-control refresh.
//! Errors are structured values; nothing else mutates packet-path state.

use std::sync::Arc;

use thiserror::Error;

use qvpn_core::{GroupId, PeerId};

use crate::acl::AccessController;
use crate::registry::{SessionInfo, SessionRegistry};

/// Structured control-plane error: kind plus message.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ControlError {
    #[error("unknown peer: {0}")]
    UnknownPeer(PeerId),
    #[error("unknown group: {0}")]
    UnknownGroup(GroupId),
}

/// Read-mostly interface handed to admin code.
#[derive(Clone)]
pub struct ControlBridge {
    registry: Arc<SessionRegistry>,
    acl: Arc<AccessController>,
}

impl ControlBridge {
    pub fn new(registry: Arc<SessionRegistry>, acl: Arc<AccessController>) -> Self {
        Self { registry, acl }
    }

    /// Enumerate live sessions: (peer, address, connected-at).
    pub fn list_sessions(&self) -> Vec<SessionInfo> {
        self.registry.list()
    }

    /// Transition a session to draining and close its connection.
    ///
    /// The address is released through the session finaliser as usual.
    pub fn disconnect(&self, peer_id: &PeerId) -> Result<(), ControlError> {
        self.registry
            .disconnect(peer_id)
            .map_err(|_| ControlError::UnknownPeer(peer_id.clone()))
    }

    /// Recompute and republish policy snapshots for every connected member
    /// of `group`. Returns how many sessions received a new snapshot.
    pub fn policy_changed(&self, group: &GroupId) -> Result<usize, ControlError> {
        if !self.acl.has_group(group) {
            return Err(ControlError::UnknownGroup(group.clone()));
        }
        Ok(self.acl.refresh(group))
    }
}
