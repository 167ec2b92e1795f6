//! Per-peer access-control evaluation.
//!
//! Policies live in groups; a peer's effective rule list is the
//! concatenation of its groups' policies re-sorted by ascending priority.
//! Each session reads an immutable snapshot published through a watch
//! channel, so the packet path never takes the store lock. A refresh
//! recomputes and republishes snapshots for the affected peers; an
//! unchanged list leaves the published `Arc` pointer-equal.

use std::collections::{BTreeSet, HashMap};
use std::net::IpAddr;
use std::sync::{Arc, Mutex};

use ipnet::IpNet;
use tokio::sync::watch;

use qvpn_core::{GroupId, PeerId};

/// Access-control verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Allow,
    Deny,
}

/// One ordered rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Policy {
    /// Lower priority values are evaluated first.
    pub priority: i32,
    pub prefix: IpNet,
    pub action: Action,
}

/// Immutable, priority-ordered rule list attached to a session.
#[derive(Debug, PartialEq, Eq)]
pub struct PolicySnapshot {
    rules: Vec<Policy>,
    default_action: Action,
}

impl PolicySnapshot {
    /// Build a snapshot, sorting rules by ascending priority.
    pub fn new(mut rules: Vec<Policy>, default_action: Action) -> Self {
        rules.sort_by_key(|p| p.priority);
        Self {
            rules,
            default_action,
        }
    }

    /// Empty snapshot: every check yields the default action.
    pub fn empty(default_action: Action) -> Self {
        Self {
            rules: Vec::new(),
            default_action,
        }
    }

    /// First matching prefix decides; otherwise the default action.
    ///
    /// Total: always returns a verdict, and deterministic with respect to
    /// this snapshot.
    pub fn check(&self, dst: IpAddr) -> Action {
        for rule in &self.rules {
            if rule.prefix.contains(&dst) {
                return rule.action;
            }
        }
        self.default_action
    }

    pub fn rules(&self) -> &[Policy] {
        &self.rules
    }

    pub fn default_action(&self) -> Action {
        self.default_action
    }
}

struct AclState {
    groups: HashMap<GroupId, Vec<Policy>>,
    members: HashMap<PeerId, BTreeSet<GroupId>>,
    watchers: HashMap<PeerId, watch::Sender<Arc<PolicySnapshot>>>,
}

/// The evaluator: group store plus per-peer published snapshots.
pub struct AccessController {
    default_action: Action,
    state: Mutex<AclState>,
}

impl AccessController {
    /// Seed the controller from the configuration file's `[acl]` section.
    pub fn from_config(config: &crate::config::AclConfig) -> Self {
        let default_action =
            crate::config::parse_action(&config.default_action).unwrap_or(Action::Deny);
        let controller = Self::new(default_action);

        let mut memberships: HashMap<PeerId, BTreeSet<GroupId>> = HashMap::new();
        for group in &config.groups {
            let group_id = GroupId::new(group.name.clone());
            let policies = group
                .policies
                .iter()
                .map(|p| Policy {
                    priority: p.priority,
                    prefix: p.prefix,
                    action: crate::config::parse_action(&p.action).unwrap_or(Action::Deny),
                })
                .collect();
            controller.set_group_policies(group_id.clone(), policies);
            for member in &group.members {
                memberships
                    .entry(PeerId::new(member.clone()))
                    .or_default()
                    .insert(group_id.clone());
            }
        }
        for (peer, groups) in memberships {
            controller.set_membership(peer, groups);
        }
        controller
    }

    pub fn new(default_action: Action) -> Self {
        Self {
            default_action,
            state: Mutex::new(AclState {
                groups: HashMap::new(),
                members: HashMap::new(),
                watchers: HashMap::new(),
            }),
        }
    }

    /// Replace the policy list of a group. Takes effect for connected peers
    /// on the next [`AccessController::refresh`].
    pub fn set_group_policies(&self, group: GroupId, policies: Vec<Policy>) {
        let mut state = self.state.lock().expect("acl lock poisoned");
        state.groups.insert(group, policies);
    }

    /// Replace a peer's group membership.
    pub fn set_membership(&self, peer: PeerId, groups: BTreeSet<GroupId>) {
        let mut state = self.state.lock().expect("acl lock poisoned");
        state.members.insert(peer, groups);
    }

    /// Whether `group` exists in the store.
    pub fn has_group(&self, group: &GroupId) -> bool {
        self.state
            .lock()
            .expect("acl lock poisoned")
            .groups
            .contains_key(group)
    }

    /// Register a connecting peer and hand back its snapshot channel.
    ///
    /// The session keeps the receiver; the packet path reads the current
    /// snapshot from it without touching the store.
    pub fn register_peer(&self, peer: &PeerId) -> watch::Receiver<Arc<PolicySnapshot>> {
        let mut state = self.state.lock().expect("acl lock poisoned");
        let snapshot = Arc::new(compute(&state, peer, self.default_action));
        let (tx, rx) = watch::channel(snapshot);
        state.watchers.insert(peer.clone(), tx);
        rx
    }

    /// Drop a departed peer's snapshot channel.
    pub fn unregister_peer(&self, peer: &PeerId) {
        let mut state = self.state.lock().expect("acl lock poisoned");
        state.watchers.remove(peer);
    }

    /// Recompute and republish the snapshot of every connected peer in
    /// `group`. Returns how many peers were republished (unchanged lists
    /// are not republished, keeping the snapshot pointer-equal).
    pub fn refresh(&self, group: &GroupId) -> usize {
        let state = self.state.lock().expect("acl lock poisoned");
        let mut republished = 0;

        for (peer, tx) in &state.watchers {
            let in_group = state
                .members
                .get(peer)
                .map(|groups| groups.contains(group))
                .unwrap_or(false);
            if !in_group {
                continue;
            }

            let snapshot = compute(&state, peer, self.default_action);
            let changed = tx.send_if_modified(|current| {
                if **current == snapshot {
                    false
                } else {
                    *current = Arc::new(snapshot);
                    true
                }
            });
            if changed {
                republished += 1;
            }
        }

        republished
    }

    /// One-shot check for a peer, outside the packet path.
    pub fn check(&self, peer: &PeerId, dst: IpAddr) -> Action {
        let state = self.state.lock().expect("acl lock poisoned");
        if let Some(tx) = state.watchers.get(peer) {
            return tx.borrow().check(dst);
        }
        compute(&state, peer, self.default_action).check(dst)
    }
}

/// Effective snapshot for a peer: its groups' policies concatenated and
/// re-sorted by ascending priority.
fn compute(state: &AclState, peer: &PeerId, default_action: Action) -> PolicySnapshot {
    let mut rules = Vec::new();
    if let Some(groups) = state.members.get(peer) {
        for group in groups {
            if let Some(policies) = state.groups.get(group) {
                rules.extend(policies.iter().cloned());
            }
        }
    }
    PolicySnapshot::new(rules, default_action)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(priority: i32, prefix: &str, action: Action) -> Policy {
        Policy {
            priority,
            prefix: prefix.parse().unwrap(),
            action,
        }
    }

    fn addr(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    fn members(groups: &[&str]) -> BTreeSet<GroupId> {
        groups.iter().map(|g| GroupId::from(*g)).collect()
    }

    #[test]
    fn check_is_total_and_first_match_wins() {
        let snapshot = PolicySnapshot::new(
            vec![
                policy(10, "192.168.0.0/16", Action::Allow),
                policy(0, "192.168.1.0/24", Action::Deny),
            ],
            Action::Deny,
        );

        // Priority 0 rule matches first despite insertion order
        assert_eq!(snapshot.check(addr("192.168.1.1")), Action::Deny);
        assert_eq!(snapshot.check(addr("192.168.2.1")), Action::Allow);
        // No rule matches: default
        assert_eq!(snapshot.check(addr("10.0.0.1")), Action::Deny);
    }

    #[test]
    fn empty_snapshot_yields_default() {
        let deny = PolicySnapshot::empty(Action::Deny);
        let allow = PolicySnapshot::empty(Action::Allow);
        assert_eq!(deny.check(addr("1.2.3.4")), Action::Deny);
        assert_eq!(allow.check(addr("1.2.3.4")), Action::Allow);
    }

    #[test]
    fn snapshot_is_deterministic() {
        let snapshot = PolicySnapshot::new(
            vec![policy(0, "10.0.0.0/8", Action::Allow)],
            Action::Deny,
        );
        for _ in 0..100 {
            assert_eq!(snapshot.check(addr("10.1.2.3")), Action::Allow);
            assert_eq!(snapshot.check(addr("11.1.2.3")), Action::Deny);
        }
    }

    #[test]
    fn peer_snapshot_concatenates_groups_by_priority() {
        let acl = AccessController::new(Action::Deny);
        acl.set_group_policies(
            GroupId::from("ops"),
            vec![policy(5, "192.168.0.0/16", Action::Deny)],
        );
        acl.set_group_policies(
            GroupId::from("dev"),
            vec![policy(1, "192.168.1.0/24", Action::Allow)],
        );
        let peer = PeerId::from("p");
        acl.set_membership(peer.clone(), members(&["ops", "dev"]));

        let rx = acl.register_peer(&peer);
        let snapshot = rx.borrow().clone();
        // dev's rule sorts first by priority
        assert_eq!(snapshot.rules()[0].priority, 1);
        assert_eq!(snapshot.check(addr("192.168.1.5")), Action::Allow);
        assert_eq!(snapshot.check(addr("192.168.2.5")), Action::Deny);
    }

    #[test]
    fn refresh_publishes_to_group_members_only() {
        let acl = AccessController::new(Action::Deny);
        acl.set_group_policies(GroupId::from("g"), vec![]);
        let member = PeerId::from("member");
        let outsider = PeerId::from("outsider");
        acl.set_membership(member.clone(), members(&["g"]));

        let member_rx = acl.register_peer(&member);
        let outsider_rx = acl.register_peer(&outsider);
        let member_before = member_rx.borrow().clone();
        let outsider_before = outsider_rx.borrow().clone();

        acl.set_group_policies(
            GroupId::from("g"),
            vec![policy(0, "10.0.0.0/8", Action::Allow)],
        );
        let republished = acl.refresh(&GroupId::from("g"));
        assert_eq!(republished, 1);

        assert!(!Arc::ptr_eq(&member_before, &member_rx.borrow()));
        assert!(Arc::ptr_eq(&outsider_before, &outsider_rx.borrow()));
        assert_eq!(member_rx.borrow().check(addr("10.1.1.1")), Action::Allow);
    }

    #[test]
    fn refresh_with_unchanged_policies_is_pointer_equal() {
        let acl = AccessController::new(Action::Deny);
        acl.set_group_policies(
            GroupId::from("g"),
            vec![policy(0, "192.168.0.0/16", Action::Deny)],
        );
        let peer = PeerId::from("p");
        acl.set_membership(peer.clone(), members(&["g"]));
        let rx = acl.register_peer(&peer);

        let before = rx.borrow().clone();
        assert_eq!(acl.refresh(&GroupId::from("g")), 0);
        assert_eq!(acl.refresh(&GroupId::from("g")), 0);
        assert!(Arc::ptr_eq(&before, &rx.borrow()));
    }

    #[test]
    fn check_without_registration_computes_fresh() {
        let acl = AccessController::new(Action::Allow);
        acl.set_group_policies(
            GroupId::from("g"),
            vec![policy(0, "192.168.0.0/16", Action::Deny)],
        );
        let peer = PeerId::from("p");
        acl.set_membership(peer.clone(), members(&["g"]));

        assert_eq!(acl.check(&peer, addr("192.168.1.1")), Action::Deny);
        assert_eq!(acl.check(&peer, addr("8.8.8.8")), Action::Allow);
        // Unknown peer: no rules, default only
        assert_eq!(
            acl.check(&PeerId::from("q"), addr("192.168.1.1")),
            Action::Allow
        );
    }

    #[test]
    fn controller_builds_from_config() {
        let config = crate::config::ServerConfig::from_toml(
            r#"
            listen_addr = "0.0.0.0:4433"
            server_name = "vpn.example.org"
            cert_file   = "server.crt"
            key_file    = "server.key"
            ca_file     = "ca.crt"
            assign_cidr = "10.0.0.0/24"

            [acl]
            default_action = "deny"

            [[acl.group]]
            name    = "g"
            members = ["client-a"]

              [[acl.group.policy]]
              priority = 0
              prefix   = "192.168.0.0/16"
              action   = "deny"

              [[acl.group.policy]]
              priority = 1
              prefix   = "0.0.0.0/0"
              action   = "allow"
        "#,
        )
        .unwrap();

        let acl = AccessController::from_config(&config.acl);
        let peer = PeerId::from("client-a");
        assert_eq!(acl.check(&peer, addr("192.168.1.1")), Action::Deny);
        assert_eq!(acl.check(&peer, addr("8.8.8.8")), Action::Allow);
        // Non-members fall through to the default
        assert_eq!(acl.check(&PeerId::from("client-b"), addr("8.8.8.8")), Action::Deny);
    }

    #[test]
    fn unregister_drops_watcher() {
        let acl = AccessController::new(Action::Deny);
        let peer = PeerId::from("p");
        acl.set_membership(peer.clone(), members(&["g"]));
        acl.set_group_policies(GroupId::from("g"), vec![]);
        let _rx = acl.register_peer(&peer);
        acl.unregister_peer(&peer);
        assert_eq!(acl.refresh(&GroupId::from("g")), 0);
    }
}
