//! The routing table: direct neighbors with liveness, distance-vector routes
//! to indirect peers, and the last public key seen for every label.
//!
//! Routes never chain through a non-direct node: a multi-hop path is stored
//! as "reach `label` via direct neighbor `next_hop` at cumulative `cost`".

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use node_proto::NodeReport;
use tokio::sync::RwLock;

use crate::membership::{now_ms, Liveness, Node};

/// The map as shared between the handler, discovery and ACK/NAK callbacks.
pub type SharedNodeMap = Arc<RwLock<NodeMap>>;

#[derive(Debug, Clone)]
pub struct DirectEntry {
    pub node: Node,
    pub liveness: Liveness,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    pub next_hop: String,
    pub cost: i64,
}

/// One reconciled row of the known-node table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KnownNode {
    pub label: String,
    pub pubkey: String,
    pub latency: i64,
    /// `None` when the latency is a direct measurement (or the local node).
    pub via: Option<String>,
}

impl From<&KnownNode> for NodeReport {
    fn from(known: &KnownNode) -> Self {
        NodeReport {
            node: known.label.clone(),
            pubkey: known.pubkey.clone(),
            latency: known.latency,
        }
    }
}

pub struct NodeMap {
    local: Node,
    direct: HashMap<String, DirectEntry>,
    routes: HashMap<String, Route>,
    pubkeys: HashMap<String, String>,
    last_discovery_ms: i64,
}

impl NodeMap {
    pub fn new(local: Node, local_pubkey: &str) -> Self {
        let mut pubkeys = HashMap::new();
        if !local_pubkey.is_empty() {
            pubkeys.insert(local.label.clone(), local_pubkey.to_string());
        }
        Self {
            local,
            direct: HashMap::new(),
            routes: HashMap::new(),
            pubkeys,
            last_discovery_ms: now_ms(),
        }
    }

    pub fn local(&self) -> &Node {
        &self.local
    }

    pub fn last_discovery_ms(&self) -> i64 {
        self.last_discovery_ms
    }

    /// Stamp the start of a discovery broadcast.
    pub fn begin_discovery_round(&mut self, now_ms: i64) {
        self.last_discovery_ms = now_ms;
    }

    /// Register a neighbor without a liveness verdict. Refreshes the address
    /// of an existing entry. Returns true if newly added.
    pub fn add_direct(&mut self, node: Node) -> bool {
        if node.label == self.local.label {
            return false;
        }
        match self.direct.get_mut(&node.label) {
            Some(entry) => {
                entry.node = node;
                false
            }
            None => {
                self.direct.insert(
                    node.label.clone(),
                    DirectEntry {
                        node,
                        liveness: Liveness::Unknown,
                    },
                );
                true
            }
        }
    }

    pub fn set_direct(&mut self, node: Node, alive: bool) -> bool {
        self.set_direct_at(node, alive, now_ms())
    }

    /// Record a direct neighbor as alive (latency measured against the last
    /// discovery broadcast) or dead. Routes through it are left untouched.
    /// Returns true if the neighbor was newly added.
    pub fn set_direct_at(&mut self, node: Node, alive: bool, now_ms: i64) -> bool {
        if node.label == self.local.label {
            return false;
        }
        let liveness = if alive {
            Liveness::Alive {
                latency_ms: (now_ms - self.last_discovery_ms).max(0),
            }
        } else {
            Liveness::Dead
        };
        let label = node.label.clone();
        let is_new = !self.direct.contains_key(&label);
        self.direct.insert(label, DirectEntry { node, liveness });
        is_new
    }

    /// Mark a neighbor alive without re-measuring; falls back to a fresh
    /// measurement when no latency is recorded yet.
    pub fn touch_alive(&mut self, label: &str) {
        let last = self.last_discovery_ms;
        if let Some(entry) = self.direct.get_mut(label) {
            if !entry.liveness.is_alive() {
                entry.liveness = Liveness::Alive {
                    latency_ms: (now_ms() - last).max(0),
                };
            }
        }
    }

    pub fn mark_dead(&mut self, label: &str) {
        if let Some(entry) = self.direct.get_mut(label) {
            entry.liveness = Liveness::Dead;
        }
    }

    pub fn update_address(&mut self, label: &str, ip: &str, port: u16) {
        if let Some(entry) = self.direct.get_mut(label) {
            entry.node = Node::new(label, ip, port);
        }
    }

    /// Drop a direct neighbor and every route that used it as next hop.
    pub fn remove_node(&mut self, label: &str) -> Option<Node> {
        let removed = self.direct.remove(label)?;
        self.routes.retain(|_, route| route.next_hop != label);
        Some(removed.node)
    }

    /// Distance-vector update from neighbor `from`.
    ///
    /// `None` means the neighbor reported no knowledge: every route through
    /// it is purged. Otherwise each reported row may install or replace the
    /// route to its label when no route exists, when the current route
    /// already goes through `from`, or when the new cost is strictly lower.
    pub fn learn_neighbor_table(&mut self, from: &str, reported: Option<&[NodeReport]>) {
        let Some(reported) = reported else {
            self.routes.retain(|_, route| route.next_hop != from);
            return;
        };

        let base = self.direct.get(from).and_then(|e| e.liveness.latency());
        for report in reported {
            if report.node == self.local.label {
                continue;
            }
            if !report.pubkey.is_empty() {
                self.set_pubkey(&report.node, &report.pubkey);
            }
            if report.node == from || report.latency < 0 {
                continue;
            }
            let Some(base) = base else {
                continue;
            };

            let cost = report.latency.saturating_add(base);
            let replace = match self.routes.get(&report.node) {
                None => true,
                Some(current) => current.next_hop == from || cost < current.cost,
            };
            if replace {
                self.routes.insert(
                    report.node.clone(),
                    Route {
                        next_hop: from.to_string(),
                        cost,
                    },
                );
            }
        }
    }

    /// Turn a destination label into the node to dial: the neighbor itself
    /// if direct, otherwise the next hop of the best route.
    ///
    /// A dead direct link loses to a route through a live neighbor.
    pub fn resolve(&self, label: &str) -> Option<Node> {
        let direct = self.direct.get(label);
        if let Some(entry) = direct {
            if !entry.liveness.is_dead() {
                return Some(entry.node.clone());
            }
        }
        let via = self
            .routes
            .get(label)
            .and_then(|route| self.direct.get(&route.next_hop));
        match (direct, via) {
            (_, Some(hop)) if !hop.liveness.is_dead() => Some(hop.node.clone()),
            (Some(entry), _) => Some(entry.node.clone()),
            (None, Some(hop)) => Some(hop.node.clone()),
            (None, None) => None,
        }
    }

    /// Reconciled view of every label with a usable latency, local node
    /// included at 0. A direct measurement wins ties against a route.
    pub fn known_nodes(&self) -> Vec<KnownNode> {
        let mut known: BTreeMap<String, KnownNode> = BTreeMap::new();
        known.insert(
            self.local.label.clone(),
            KnownNode {
                label: self.local.label.clone(),
                pubkey: self.pubkey_or_empty(&self.local.label),
                latency: 0,
                via: None,
            },
        );

        for (label, entry) in &self.direct {
            if let Some(latency) = entry.liveness.latency() {
                known.insert(
                    label.clone(),
                    KnownNode {
                        label: label.clone(),
                        pubkey: self.pubkey_or_empty(label),
                        latency,
                        via: None,
                    },
                );
            }
        }

        for (label, route) in &self.routes {
            if label == &self.local.label || !self.is_alive(&route.next_hop) {
                continue;
            }
            let better = known
                .get(label)
                .map_or(true, |current| route.cost < current.latency);
            if better {
                known.insert(
                    label.clone(),
                    KnownNode {
                        label: label.clone(),
                        pubkey: self.pubkey_or_empty(label),
                        latency: route.cost,
                        via: Some(route.next_hop.clone()),
                    },
                );
            }
        }

        known.into_values().collect()
    }

    /// Discovery table for `neighbor`, leaving out routes learned from it.
    pub fn table_for(&self, neighbor: &str) -> Vec<NodeReport> {
        self.known_nodes()
            .iter()
            .filter(|known| known.via.as_deref() != Some(neighbor))
            .map(NodeReport::from)
            .collect()
    }

    /// Every label reachable directly or through a route, local excluded.
    pub fn all_known_labels(&self) -> Vec<String> {
        let mut labels: Vec<String> = self
            .direct
            .keys()
            .chain(self.routes.keys())
            .filter(|label| *label != &self.local.label)
            .cloned()
            .collect();
        labels.sort();
        labels.dedup();
        labels
    }

    pub fn direct_neighbors(&self) -> Vec<Node> {
        self.direct.values().map(|e| e.node.clone()).collect()
    }

    pub fn living_direct_neighbors(&self) -> Vec<Node> {
        self.direct
            .values()
            .filter(|e| e.liveness.is_alive())
            .map(|e| e.node.clone())
            .collect()
    }

    pub fn direct(&self, label: &str) -> Option<&DirectEntry> {
        self.direct.get(label)
    }

    pub fn is_direct(&self, label: &str) -> bool {
        self.direct.contains_key(label)
    }

    pub fn liveness(&self, label: &str) -> Option<Liveness> {
        self.direct.get(label).map(|e| e.liveness)
    }

    pub fn route(&self, label: &str) -> Option<&Route> {
        self.routes.get(label)
    }

    pub fn routes(&self) -> &HashMap<String, Route> {
        &self.routes
    }

    /// Store `pubkey` for `label` if it is non-empty and differs. Returns true
    /// when the stored value changed.
    pub fn set_pubkey(&mut self, label: &str, pubkey: &str) -> bool {
        if pubkey.is_empty() || self.pubkeys.get(label).map(String::as_str) == Some(pubkey) {
            return false;
        }
        self.pubkeys.insert(label.to_string(), pubkey.to_string());
        true
    }

    pub fn get_pubkey(&self, label: &str) -> Option<&str> {
        self.pubkeys.get(label).map(String::as_str)
    }

    fn pubkey_or_empty(&self, label: &str) -> String {
        self.pubkeys.get(label).cloned().unwrap_or_default()
    }

    fn is_alive(&self, label: &str) -> bool {
        self.direct
            .get(label)
            .map_or(false, |e| e.liveness.is_alive())
    }
}
