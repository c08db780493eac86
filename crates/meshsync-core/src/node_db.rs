//! Node database
//!
//! Owns every node known to one device identity slot along with the
//! per-node error state. Incoming records pass through
//! [`NodeIdentityResolver`] before they touch the map, and partial updates
//! merge field by field so a packet never blanks out what is already known.

use hashbrown::HashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::events::{MeshPacketInfo, RoutingError, Telemetry};
use crate::identity::{NodeIdentityResolver, Resolution};
use crate::node::{NodeRecord, Position, User};
use crate::types::{node_id_string, MeshDeviceId, NodeNum, Timestamp};

// ----------------------------------------------------------------------------
// Node Errors
// ----------------------------------------------------------------------------

/// Problem recorded against one node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NodeErrorKind {
    /// Another node already announced the same public key
    DuplicatePki,
    /// The node announced a key different from the one on record
    MismatchPki,
    /// The firmware reported a routing failure for this node
    Routing(RoutingError),
}

/// One error per node, last write wins
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeError {
    pub node: NodeNum,
    pub error: NodeErrorKind,
}

// ----------------------------------------------------------------------------
// Node Database
// ----------------------------------------------------------------------------

/// Nodes known to one device identity slot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeDatabase {
    id: MeshDeviceId,
    #[serde(default)]
    my_node_num: Option<NodeNum>,
    #[serde(default)]
    nodes: HashMap<NodeNum, NodeRecord>,
    #[serde(default)]
    errors: HashMap<NodeNum, NodeError>,
}

impl NodeDatabase {
    pub fn new(id: MeshDeviceId) -> Self {
        Self {
            id,
            my_node_num: None,
            nodes: HashMap::new(),
            errors: HashMap::new(),
        }
    }

    pub fn id(&self) -> MeshDeviceId {
        self.id
    }

    pub fn my_node_num(&self) -> Option<NodeNum> {
        self.my_node_num
    }

    /// Record the own node number without reconciling other slots
    ///
    /// Use [`reconcile`] through the owning context when other databases may
    /// hold the same physical node.
    pub fn set_my_node_num(&mut self, num: NodeNum) {
        self.my_node_num = Some(num);
    }

    // ------------------------------------------------------------------------
    // Ingestion
    // ------------------------------------------------------------------------

    /// Validate and merge one node record
    pub fn add_node(&mut self, incoming: NodeRecord) -> Resolution {
        let num = incoming.num;
        let resolution = NodeIdentityResolver::resolve(incoming, self.nodes.values());
        match &resolution {
            Resolution::Accepted(record) => {
                let merged = match self.nodes.get(&num) {
                    Some(existing) => existing.merged_with(record.clone()),
                    None => {
                        debug!("Adding node {}", node_id_string(num));
                        record.clone()
                    }
                };
                self.nodes.insert(num, merged);
            }
            Resolution::Rejected { error: Some(kind), .. } => {
                self.set_node_error(num, kind.clone());
            }
            Resolution::Rejected { error: None, .. } => {}
        }
        resolution
    }

    /// Update liveness from any received packet
    pub fn process_packet(&mut self, packet: MeshPacketInfo, now: Timestamp) {
        let last_heard = if packet.rx_time > 0 {
            packet.rx_time
        } else {
            now.as_secs() as u32
        };
        let node = self
            .nodes
            .entry(packet.from)
            .or_insert_with(|| NodeRecord::placeholder(packet.from));
        node.last_heard = last_heard;
        node.snr = packet.rx_snr;
    }

    /// Merge a user packet; the announced key goes through identity resolution
    pub fn add_user(&mut self, from: NodeNum, user: User) -> Resolution {
        let current = self
            .nodes
            .get(&from)
            .cloned()
            .unwrap_or_else(|| NodeRecord::placeholder(from));
        self.add_node(NodeRecord {
            num: from,
            user: Some(user),
            ..current
        })
    }

    /// Merge a position packet, creating the node when unknown
    pub fn add_position(&mut self, from: NodeNum, position: Position) {
        let node = self.nodes.entry(from).or_insert_with(|| {
            debug!("Adding node {} from position packet", node_id_string(from));
            NodeRecord::placeholder(from)
        });
        node.position = Some(position);
    }

    /// Store telemetry for a known node
    ///
    /// Telemetry from a node that is not in the database is dropped.
    pub fn set_metrics(&mut self, from: NodeNum, telemetry: Telemetry) {
        let Some(node) = self.nodes.get_mut(&from) else {
            debug!("Ignoring telemetry from unknown node {}", node_id_string(from));
            return;
        };
        match telemetry {
            Telemetry::DeviceMetrics(m) => node.device_metrics = Some(m),
            Telemetry::EnvironmentMetrics(m) => node.environment_metrics = Some(m),
            Telemetry::PowerMetrics(m) => node.power_metrics = Some(m),
            Telemetry::HostMetrics(m) => node.host_metrics = Some(m),
            Telemetry::AirQualityMetrics(m) => node.air_quality_metrics = Some(m),
            Telemetry::LocalStats(m) => node.local_stats = Some(m),
        }
    }

    pub fn update_favorite(&mut self, num: NodeNum, is_favorite: bool) {
        if let Some(node) = self.nodes.get_mut(&num) {
            node.is_favorite = is_favorite;
        }
    }

    pub fn update_ignore(&mut self, num: NodeNum, is_ignored: bool) {
        if let Some(node) = self.nodes.get_mut(&num) {
            node.is_ignored = is_ignored;
        }
    }

    // ------------------------------------------------------------------------
    // Removal
    // ------------------------------------------------------------------------

    /// Remove a node and its error
    pub fn remove_node(&mut self, num: NodeNum) -> Option<NodeRecord> {
        self.errors.remove(&num);
        self.nodes.remove(&num)
    }

    /// Remove every node, optionally keeping the own node
    pub fn remove_all_nodes(&mut self, keep_my_node: bool) {
        let keep = self
            .my_node_num
            .filter(|_| keep_my_node)
            .and_then(|num| self.nodes.remove(&num));
        self.nodes.clear();
        if let Some(node) = keep {
            self.nodes.insert(node.num, node);
        }
    }

    /// Remove nodes not heard from within `window_secs`
    ///
    /// The own node and nodes never heard from are kept.
    pub fn prune_stale_nodes(&mut self, now: Timestamp, window_secs: u64) -> usize {
        let cutoff = now.as_secs().saturating_sub(window_secs);
        let my_node = self.my_node_num;
        let before = self.nodes.len();
        self.nodes.retain(|num, node| {
            Some(*num) == my_node || node.last_heard == 0 || u64::from(node.last_heard) >= cutoff
        });
        let pruned = before - self.nodes.len();
        if pruned > 0 {
            info!(
                "Pruned {} stale node(s) older than {} days",
                pruned,
                window_secs / 86_400
            );
        }
        pruned
    }

    // ------------------------------------------------------------------------
    // Errors
    // ------------------------------------------------------------------------

    pub fn set_node_error(&mut self, num: NodeNum, error: NodeErrorKind) {
        self.errors.insert(num, NodeError { node: num, error });
    }

    pub fn clear_node_error(&mut self, num: NodeNum) {
        self.errors.remove(&num);
    }

    pub fn remove_all_node_errors(&mut self) {
        self.errors.clear();
    }

    pub fn get_node_error(&self, num: NodeNum) -> Option<&NodeError> {
        self.errors.get(&num)
    }

    pub fn has_node_error(&self, num: NodeNum) -> bool {
        self.errors.contains_key(&num)
    }

    // ------------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------------

    pub fn get_node(&self, num: NodeNum) -> Option<&NodeRecord> {
        self.nodes.get(&num)
    }

    /// Nodes matching `filter`, ordered by node number
    pub fn get_nodes<F>(&self, filter: Option<F>, include_self: bool) -> Vec<&NodeRecord>
    where
        F: Fn(&NodeRecord) -> bool,
    {
        let mut nodes: Vec<&NodeRecord> = self
            .nodes
            .values()
            .filter(|n| include_self || Some(n.num) != self.my_node_num)
            .filter(|n| filter.as_ref().map_or(true, |f| f(n)))
            .collect();
        nodes.sort_by_key(|n| n.num);
        nodes
    }

    /// Every node including the own node, ordered by node number
    pub fn all_nodes(&self) -> Vec<&NodeRecord> {
        self.get_nodes(None::<fn(&NodeRecord) -> bool>, true)
    }

    pub fn get_nodes_length(&self) -> usize {
        self.nodes.len()
    }

    /// The own node, or a bare record when only its number is known
    pub fn get_my_node(&self) -> Option<NodeRecord> {
        let num = self.my_node_num?;
        Some(
            self.nodes
                .get(&num)
                .cloned()
                .unwrap_or_else(|| NodeRecord::placeholder(num)),
        )
    }

    fn errors(&self) -> impl Iterator<Item = &NodeError> {
        self.errors.values()
    }
}

// ----------------------------------------------------------------------------
// Identity Reconciliation
// ----------------------------------------------------------------------------

/// Result of folding other databases into a recipient
#[derive(Debug, Clone, PartialEq)]
pub struct Reconciliation {
    /// The recipient with donor state applied
    pub merged: NodeDatabase,
    /// Donor slots the caller must delete
    pub absorbed: Vec<MeshDeviceId>,
}

/// Fold every donor that shares the recipient's own node number into it
///
/// Donor nodes replay through the same path as live ingestion, so identity
/// conflicts are resolved the same way. A donor's error is copied only when
/// the recipient has none for that node. Donors are applied in slot order,
/// which makes the result independent of the order they are passed in.
pub fn reconcile<'a, I>(recipient: &NodeDatabase, donors: I) -> Reconciliation
where
    I: IntoIterator<Item = &'a NodeDatabase>,
{
    let mut merged = recipient.clone();
    let mut absorbed = Vec::new();

    let Some(own) = recipient.my_node_num else {
        return Reconciliation { merged, absorbed };
    };

    let mut matching: Vec<&NodeDatabase> = donors
        .into_iter()
        .filter(|d| d.id != recipient.id && d.my_node_num == Some(own))
        .collect();
    matching.sort_by_key(|d| d.id);

    for donor in matching {
        info!(
            "Merging node database {} into {} (node {})",
            donor.id,
            recipient.id,
            node_id_string(own)
        );
        for node in donor.all_nodes() {
            merged.add_node(node.clone());
        }
        for error in donor.errors() {
            if !merged.has_node_error(error.node) {
                merged.set_node_error(error.node, error.error.clone());
            }
        }
        absorbed.push(donor.id);
    }

    Reconciliation { merged, absorbed }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
