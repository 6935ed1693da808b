// Riptide: Compiling Network Policies into Flow-Table Updates
// Copyright (C) 2021  Tibor Schneider
//
// This program is free software; you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation; either version 2 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License along
// with this program; if not, write to the Free Software Foundation, Inc.,
// 51 Franklin Street, Fifth Floor, Boston, MA 02110-1301 USA.

//! # Dynamic Policies
//!
//! A [`DynamicPolicy`] is a shared cell holding the current policy. Clones of the cell refer to
//! the same policy. Assigning a new policy with [`DynamicPolicy::set_policy`] sends the id of the
//! cell to every subscribed listener (usually the runtime), which then recompiles.
//!
//! Cells may carry a [`NetworkHandler`], which recomputes the policy from the topology. The
//! runtime walks the policy tree with [`propagate_network`] on every committed topology change.

use super::{filter, match_field, parallel, xfwd, Policy};
use crate::classifier::{Classifier, Match};
use crate::lock;
use crate::network::{Location, Topology};
use crate::packet::{INPORT, OUTPORT, SWITCH};

use log::*;
use std::collections::{BTreeSet, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::Sender;
use std::sync::{Arc, Mutex, PoisonError, RwLock, Weak};

/// Recomputes the policy of a dynamic cell from the topology
pub trait NetworkHandler: Send + Sync {
    /// Returns the new policy for the topology, or `None` if the policy stays the same.
    fn update(&self, topo: &Topology) -> Option<Policy>;

    /// Returns `true` if the handler passes the topology to the dynamic cells nested inside its
    /// policy on its own. Otherwise, [`propagate_network`] descends into the new policy.
    fn owns_children(&self) -> bool {
        false
    }
}

struct DynamicCell {
    id: usize,
    name: String,
    policy: RwLock<Policy>,
    classifier: Mutex<Option<Classifier>>,
    network_version: AtomicU64,
    handler: Option<Box<dyn NetworkHandler>>,
    listeners: Mutex<Vec<Sender<usize>>>,
}

/// # Dynamic Policy
/// Shared cell holding a policy that changes at runtime. Equality is identity.
#[derive(Clone)]
pub struct DynamicPolicy(Arc<DynamicCell>);

impl DynamicPolicy {
    /// Create a new cell holding `policy`
    pub fn new(name: &str, policy: Policy) -> Self {
        Self::build(name, policy, None)
    }

    /// Create a new cell whose policy is recomputed by `handler` on every topology change.
    pub fn with_handler<H: NetworkHandler + 'static>(name: &str, policy: Policy, handler: H) -> Self {
        Self::build(name, policy, Some(Box::new(handler)))
    }

    fn build(name: &str, policy: Policy, handler: Option<Box<dyn NetworkHandler>>) -> Self {
        Self(Arc::new(DynamicCell {
            id: crate::next_id(),
            name: name.to_string(),
            policy: RwLock::new(policy),
            classifier: Mutex::new(None),
            network_version: AtomicU64::new(0),
            handler,
            listeners: Mutex::new(Vec::new()),
        }))
    }

    /// Unique id of the cell
    pub fn id(&self) -> usize {
        self.0.id
    }

    /// Name of the cell
    pub fn name(&self) -> &str {
        &self.0.name
    }

    /// Returns a copy of the current policy
    pub fn policy(&self) -> Policy {
        self.0.policy.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Assign a new policy and notify all listeners.
    pub fn set_policy(&self, policy: Policy) {
        self.replace(policy);
        let id = self.id();
        lock(&self.0.listeners).retain(|tx| tx.send(id).is_ok());
    }

    /// Assign a new policy without notifying the listeners. Used while propagating a topology
    /// change, which triggers its own recompilation.
    pub(crate) fn replace(&self, policy: Policy) {
        *self.0.policy.write().unwrap_or_else(PoisonError::into_inner) = policy;
        self.invalidate_classifier();
    }

    /// Subscribe to policy changes. The id of the cell is sent on every change.
    pub fn subscribe(&self, tx: Sender<usize>) {
        lock(&self.0.listeners).push(tx);
    }

    /// Returns the memoized classifier
    pub fn cached_classifier(&self) -> Option<Classifier> {
        lock(&self.0.classifier).clone()
    }

    /// Memoize the classifier of the current policy
    pub(crate) fn store_classifier(&self, c: Classifier) {
        *lock(&self.0.classifier) = Some(c);
    }

    /// Forget the memoized classifier
    pub fn invalidate_classifier(&self) {
        *lock(&self.0.classifier) = None;
    }

    /// Returns a weak reference to the cell, used by `recurse`.
    pub fn downgrade(&self) -> RecurseRef {
        RecurseRef { id: self.id(), cell: Arc::downgrade(&self.0) }
    }

    /// Version of the last topology this cell has seen
    pub fn network_version(&self) -> Option<u64> {
        match self.0.network_version.load(Ordering::SeqCst) {
            0 => None,
            v => Some(v),
        }
    }

    /// Hand the topology to the cell. Returns `false` if the cell has already seen this version.
    fn set_network(&self, topo: &Topology) -> bool {
        if self.0.network_version.swap(topo.version(), Ordering::SeqCst) == topo.version() {
            return false;
        }
        if let Some(handler) = self.0.handler.as_ref() {
            if let Some(policy) = handler.update(topo) {
                debug!("dynamic policy {} changed with topology {}", self.name(), topo.version());
                self.replace(policy);
            }
        }
        true
    }

    fn owns_children(&self) -> bool {
        self.0.handler.as_ref().map(|h| h.owns_children()).unwrap_or(false)
    }
}

impl PartialEq for DynamicPolicy {
    fn eq(&self, other: &Self) -> bool {
        self.id() == other.id()
    }
}

impl fmt::Debug for DynamicPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DynamicPolicy({}#{})", self.name(), self.id())
    }
}

/// Weak reference to a dynamic cell
#[derive(Clone)]
pub struct RecurseRef {
    id: usize,
    cell: Weak<DynamicCell>,
}

impl RecurseRef {
    /// Id of the referenced cell
    pub fn id(&self) -> usize {
        self.id
    }

    /// Returns the cell, if it still exists.
    pub fn upgrade(&self) -> Option<DynamicPolicy> {
        self.cell.upgrade().map(DynamicPolicy)
    }
}

impl PartialEq for RecurseRef {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl fmt::Debug for RecurseRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "recurse(#{})", self.id)
    }
}

/// Hand the topology to every dynamic cell of the policy, exactly once per cell. Cells that
/// have already seen this topology version are skipped. Returns the cells that were updated.
pub fn propagate_network(policy: &Policy, topo: &Topology) -> Vec<DynamicPolicy> {
    let mut visited = HashSet::new();
    let mut updated = Vec::new();
    propagate_inner(policy, topo, &mut visited, &mut updated);
    updated
}

fn propagate_inner(
    policy: &Policy,
    topo: &Topology,
    visited: &mut HashSet<usize>,
    updated: &mut Vec<DynamicPolicy>,
) {
    match policy {
        Policy::Dynamic(d) => {
            if !visited.insert(d.id()) {
                return;
            }
            if d.set_network(topo) {
                updated.push(d.clone());
            }
            if !d.owns_children() {
                propagate_inner(&d.policy(), topo, visited, updated);
            }
        }
        Policy::Negate(p) => propagate_inner(p, topo, visited, updated),
        Policy::Difference(p, q) => {
            propagate_inner(p, topo, visited, updated);
            propagate_inner(q, topo, visited, updated);
        }
        Policy::If(p, t, f) => {
            propagate_inner(p, topo, visited, updated);
            propagate_inner(t, topo, visited, updated);
            propagate_inner(f, topo, visited, updated);
        }
        Policy::Union(ps) | Policy::Intersection(ps) | Policy::Parallel(ps) | Policy::Sequential(ps) => {
            ps.iter().for_each(|p| propagate_inner(p, topo, visited, updated))
        }
        _ => {}
    }
}

/// Floods on a minimum spanning tree of the topology
struct FloodHandler {
    mst: Mutex<Option<Topology>>,
}

impl NetworkHandler for FloodHandler {
    fn update(&self, topo: &Topology) -> Option<Policy> {
        let mst = topo.minimum_spanning_tree();
        let mut last = lock(&self.mst);
        if last.as_ref() == Some(&mst) {
            return None;
        }
        let policy = parallel(
            mst.switches()
                .into_iter()
                .filter_map(|s| mst.switch(s))
                .map(|node| {
                    match_field(SWITCH, node.id)
                        >> parallel(node.ports.keys().map(|p| xfwd(*p)).collect())
                })
                .collect(),
        );
        *last = Some(mst);
        Some(policy)
    }
}

/// Flood every packet on a minimum spanning tree, recomputed on every topology change. Packets
/// leave on every port of the tree and every egress port, except the port they arrived on.
pub fn flood() -> DynamicPolicy {
    DynamicPolicy::with_handler("flood", Policy::Drop, FloodHandler { mst: Mutex::new(None) })
}

/// Matches packets at (or leaving through) the egress locations of the network
struct EgressHandler {
    port_field: &'static str,
    egresses: Mutex<Option<BTreeSet<Location>>>,
}

impl NetworkHandler for EgressHandler {
    fn update(&self, topo: &Topology) -> Option<Policy> {
        let egresses = topo.egress_locations(None);
        let mut last = lock(&self.egresses);
        if last.as_ref() == Some(&egresses) {
            return None;
        }
        let policy = parallel(
            egresses
                .iter()
                .map(|l| filter(Match::identity().with(SWITCH, l.switch).with(self.port_field, l.port)))
                .collect(),
        );
        *last = Some(egresses);
        Some(policy)
    }
}

/// Filter passing packets located at a port entering the network from a host.
pub fn ingress_network() -> DynamicPolicy {
    DynamicPolicy::with_handler(
        "ingress_network",
        Policy::Drop,
        EgressHandler { port_field: INPORT, egresses: Mutex::new(None) },
    )
}

/// Filter passing packets about to leave the network towards a host.
pub fn egress_network() -> DynamicPolicy {
    DynamicPolicy::with_handler(
        "egress_network",
        Policy::Drop,
        EgressHandler { port_field: OUTPORT, egresses: Mutex::new(None) },
    )
}
