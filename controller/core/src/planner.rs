//! Deterministic placement of externally advertised IPs onto nodes.
//!
//! The planner is a pure function of the sorted advertisements, the node set
//! and the previously persisted status. Ties between equally loaded nodes are
//! broken by the SHA-256 digest of the node name so that every process
//! computes the same plan from the same inputs.

use ahash::AHashMap;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};

/// A mapping of EIP to the name of the node that announces it.
pub type Announce = BTreeMap<String, String>;

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct NodeInfo {
    pub name: String,
    pub ready: bool,
    pub network_unavailable: bool,
    /// Explicitly marked as able to terminate E4LB traffic.
    pub e4lb_enabled: bool,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Advertisement {
    pub namespace: String,
    pub name: String,
    /// EIPs in declaration order.
    pub eips: Vec<String>,
    /// Restricts placement to these nodes when non-empty.
    pub nodes: Vec<String>,
    /// The assignment currently persisted on the object's status.
    pub announce: Announce,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Assignment {
    pub namespace: String,
    pub name: String,
    pub announce: Announce,
    /// Whether `announce` differs from the persisted status.
    pub changed: bool,
}

/// The transient layout built during one planning pass.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Plan {
    /// Node name to the EIPs it holds, each tagged with the owning
    /// advertisement as `namespace/name`.
    pub nodes: BTreeMap<String, BTreeMap<String, String>>,
    /// EIP to node name.
    pub eips: Announce,
    pub assignments: Vec<Assignment>,
}

/// Returns the names of the nodes eligible to hold EIPs.
///
/// A node is eligible when it is ready and its network is available. If any
/// eligible node is explicitly marked as E4LB-capable, only marked nodes are
/// returned.
pub fn eligible_nodes<'n>(nodes: impl IntoIterator<Item = &'n NodeInfo>) -> BTreeSet<String> {
    let ready = nodes
        .into_iter()
        .filter(|n| n.ready && !n.network_unavailable)
        .collect::<Vec<_>>();
    let marked = ready.iter().any(|n| n.e4lb_enabled);
    ready
        .into_iter()
        .filter(|n| !marked || n.e4lb_enabled)
        .map(|n| n.name.clone())
        .collect()
}

/// Produces a stable EIP-to-node assignment for every advertisement.
///
/// Advertisements are processed in `(namespace, name)` order regardless of
/// the order in which they are provided.
pub fn plan(advertisements: &[Advertisement], eligible: &BTreeSet<String>) -> Plan {
    let mut advs = advertisements.iter().collect::<Vec<_>>();
    advs.sort_by(|a, b| (&a.namespace, &a.name).cmp(&(&b.namespace, &b.name)));

    let mut layout = Announce::new();
    let mut owners = BTreeMap::<String, String>::new();
    let mut counts = AHashMap::<String, usize>::new();

    // Seed with persisted assignments that are still valid.
    for adv in &advs {
        let allowed = allowed_nodes(adv, eligible);
        for (eip, node) in &adv.announce {
            if !adv.eips.contains(eip) || !allowed.contains(node) || layout.contains_key(eip) {
                continue;
            }
            layout.insert(eip.clone(), node.clone());
            owners.insert(eip.clone(), id(adv));
            *counts.entry(node.clone()).or_default() += 1;
        }
    }

    let mut assignments = Vec::with_capacity(advs.len());
    for adv in &advs {
        let allowed = allowed_nodes(adv, eligible);
        let mut announce = Announce::new();

        let mut available = allowed.clone();
        for eip in &adv.eips {
            if let Some(node) = layout.get(eip) {
                available.remove(node);
            }
        }

        for eip in &adv.eips {
            if announce.contains_key(eip) {
                continue;
            }
            if let Some(node) = layout.get(eip) {
                announce.insert(eip.clone(), node.clone());
                continue;
            }
            if allowed.is_empty() {
                continue;
            }
            if available.is_empty() {
                available = allowed.clone();
            }
            let Some(node) = least_loaded(&available, &counts) else {
                continue;
            };
            available.remove(&node);
            *counts.entry(node.clone()).or_default() += 1;
            layout.insert(eip.clone(), node.clone());
            owners.insert(eip.clone(), id(adv));
            announce.insert(eip.clone(), node);
        }

        let changed = announce_hash(&announce) != announce_hash(&adv.announce);
        assignments.push(Assignment {
            namespace: adv.namespace.clone(),
            name: adv.name.clone(),
            announce,
            changed,
        });
    }

    let mut nodes = BTreeMap::<String, BTreeMap<String, String>>::new();
    for (eip, node) in &layout {
        let owner = owners.get(eip).cloned().unwrap_or_default();
        nodes
            .entry(node.clone())
            .or_default()
            .insert(eip.clone(), owner);
    }

    Plan {
        nodes,
        eips: layout,
        assignments,
    }
}

/// A structural digest of an announce map, used to detect status changes.
pub fn announce_hash(announce: &Announce) -> [u8; 32] {
    let mut hasher = Sha256::new();
    for (eip, node) in announce {
        hasher.update(eip.as_bytes());
        hasher.update([0]);
        hasher.update(node.as_bytes());
        hasher.update([0]);
    }
    hasher.finalize().into()
}

/// Picks the owner of an annotation-declared EIP: the eligible node whose
/// `sha256(node#eip)` digest sorts first.
pub fn hashed_owner<'n>(eligible: impl IntoIterator<Item = &'n String>, eip: &str) -> Option<&'n String> {
    eligible
        .into_iter()
        .min_by_key(|node| Sha256::digest(format!("{node}#{eip}").as_bytes()))
}

fn allowed_nodes(adv: &Advertisement, eligible: &BTreeSet<String>) -> BTreeSet<String> {
    if adv.nodes.is_empty() {
        return eligible.clone();
    }
    adv.nodes
        .iter()
        .filter(|n| eligible.contains(*n))
        .cloned()
        .collect()
}

fn least_loaded(available: &BTreeSet<String>, counts: &AHashMap<String, usize>) -> Option<String> {
    available
        .iter()
        .min_by_key(|node| {
            (
                counts.get(*node).copied().unwrap_or(0),
                Sha256::digest(node.as_bytes()),
            )
        })
        .cloned()
}

fn id(adv: &Advertisement) -> String {
    format!("{}/{}", adv.namespace, adv.name)
}
