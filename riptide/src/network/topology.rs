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

//! # Topology
//!
//! Undirected graph of switches. Every switch carries its port map, and every link is annotated
//! with the port numbers on both ends. A topology carries a version, which changes on every
//! mutation. Copies keep the version of the original, so dynamic policies can detect whether
//! they have already seen a topology.

use log::*;
use petgraph::algo::astar;
use petgraph::prelude::*;
use petgraph::stable_graph::StableGraph;
use petgraph::unionfind::UnionFind;
use petgraph::visit::{Bfs, NodeIndexable};
use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;

type IndexType = u32;
type SwitchIndex = NodeIndex<IndexType>;

/// Datapath id of a switch
pub type SwitchId = u32;
/// Port number on a switch
pub type PortNo = u32;

static NEXT_VERSION: AtomicU64 = AtomicU64::new(1);

fn next_version() -> u64 {
    NEXT_VERSION.fetch_add(1, Ordering::SeqCst)
}

/// Error while modifying the topology
#[derive(Error, Debug, PartialEq)]
pub enum TopologyError {
    /// The switch is not part of the topology
    #[error("Switch {0} is not part of the topology")]
    UnknownSwitch(SwitchId),
    /// The port is not part of the topology
    #[error("Port {0} is not part of the topology")]
    UnknownPort(Location),
    /// A link is reported on the same ports again, while one of the ports is down.
    #[error("Link update between {0} and {1}, but the ports are down")]
    InconsistentLink(Location, Location),
}

/// A port on a specific switch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Location {
    /// Switch
    pub switch: SwitchId,
    /// Port on the switch
    pub port: PortNo,
}

impl Location {
    /// Create a new location
    pub fn new(switch: SwitchId, port: PortNo) -> Self {
        Self { switch, port }
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}]", self.switch, self.port)
    }
}

/// Type of a port, as reported by the switch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PortType {
    /// Physical port
    Physical,
    /// Logical port of a virtualized network
    Virtual,
}

impl Default for PortType {
    fn default() -> Self {
        Self::Physical
    }
}

/// Port of a switch
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Port {
    /// Port number
    pub no: PortNo,
    /// The port is administratively up
    pub config_up: bool,
    /// The link of the port is up
    pub status_up: bool,
    /// Type of the port
    pub port_type: PortType,
    /// The location on the other end of the link, if any.
    pub linked_to: Option<Location>,
}

impl Port {
    /// Create a new port without a link
    pub fn new(no: PortNo, config_up: bool, status_up: bool, port_type: PortType) -> Self {
        Self { no, config_up, status_up, port_type, linked_to: None }
    }

    /// Returns `true` if both the configuration and the status report the port as down.
    pub fn definitely_down(&self) -> bool {
        !self.config_up && !self.status_up
    }

    /// Some switches report the status as down while the link is up, so a port is considered up
    /// if either of the two flags says so.
    pub fn possibly_up(&self) -> bool {
        !self.definitely_down()
    }
}

/// Node of the topology graph
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SwitchNode {
    /// Datapath id
    pub id: SwitchId,
    /// Ports of the switch
    pub ports: BTreeMap<PortNo, Port>,
}

/// Link between two switches
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Link {
    /// One end
    pub a: Location,
    /// The other end
    pub b: Location,
}

impl Link {
    /// Returns the port of the link on the given switch
    pub fn port_at(&self, switch: SwitchId) -> Option<PortNo> {
        if self.a.switch == switch {
            Some(self.a.port)
        } else if self.b.switch == switch {
            Some(self.b.port)
        } else {
            None
        }
    }
}

/// Changes of a port modification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PortChange {
    /// The port was configured down
    pub config_down: bool,
    /// The link status went down
    pub status_down: bool,
    /// The port came up (in configuration or status)
    pub came_up: bool,
}

/// # Topology
#[derive(Debug, Clone)]
pub struct Topology {
    graph: StableGraph<SwitchNode, Link, Undirected, IndexType>,
    index: HashMap<SwitchId, SwitchIndex>,
    version: u64,
}

impl Default for Topology {
    fn default() -> Self {
        Self::new()
    }
}

impl PartialEq for Topology {
    fn eq(&self, other: &Self) -> bool {
        self.switches() == other.switches()
            && self.switches().iter().all(|s| self.switch(*s) == other.switch(*s))
            && self.links() == other.links()
    }
}

impl Topology {
    /// Create an empty topology
    pub fn new() -> Self {
        Self { graph: StableGraph::default(), index: HashMap::new(), version: next_version() }
    }

    fn touch(&mut self) {
        self.version = next_version();
    }

    /// Version of the topology. Every mutation assigns a fresh version.
    pub fn version(&self) -> u64 {
        self.version
    }

    /// Returns all switches, sorted by id
    pub fn switches(&self) -> Vec<SwitchId> {
        let mut switches: Vec<SwitchId> = self.index.keys().copied().collect();
        switches.sort_unstable();
        switches
    }

    /// Number of switches
    pub fn num_switches(&self) -> usize {
        self.index.len()
    }

    /// Returns `true` if the switch is part of the topology
    pub fn contains_switch(&self, switch: SwitchId) -> bool {
        self.index.contains_key(&switch)
    }

    /// Returns the switch node
    pub fn switch(&self, switch: SwitchId) -> Option<&SwitchNode> {
        self.index.get(&switch).and_then(|idx| self.graph.node_weight(*idx))
    }

    fn switch_mut(&mut self, switch: SwitchId) -> Result<&mut SwitchNode, TopologyError> {
        let idx = *self.index.get(&switch).ok_or(TopologyError::UnknownSwitch(switch))?;
        self.graph.node_weight_mut(idx).ok_or(TopologyError::UnknownSwitch(switch))
    }

    /// Returns the port at a location
    pub fn port(&self, loc: Location) -> Option<&Port> {
        self.switch(loc.switch).and_then(|s| s.ports.get(&loc.port))
    }

    fn port_mut(&mut self, loc: Location) -> Result<&mut Port, TopologyError> {
        self.switch_mut(loc.switch)?.ports.get_mut(&loc.port).ok_or(TopologyError::UnknownPort(loc))
    }

    /// Returns all links, each with the smaller location first, sorted.
    pub fn links(&self) -> Vec<(Location, Location)> {
        let mut links: Vec<(Location, Location)> = self
            .graph
            .edge_indices()
            .filter_map(|e| self.graph.edge_weight(e))
            .map(|l| if l.a <= l.b { (l.a, l.b) } else { (l.b, l.a) })
            .collect();
        links.sort_unstable();
        links
    }

    /// Add a switch without ports. Returns `false` if the switch already exists.
    pub fn add_switch(&mut self, switch: SwitchId) -> bool {
        if self.index.contains_key(&switch) {
            return false;
        }
        let idx = self.graph.add_node(SwitchNode { id: switch, ports: BTreeMap::new() });
        self.index.insert(switch, idx);
        self.touch();
        true
    }

    /// Remove a switch together with all links of its ports.
    pub fn remove_switch(&mut self, switch: SwitchId) -> Result<(), TopologyError> {
        let ports: Vec<PortNo> =
            self.switch(switch).ok_or(TopologyError::UnknownSwitch(switch))?.ports.keys().copied().collect();
        for port in ports {
            self.remove_associated_link(Location::new(switch, port))?;
        }
        if let Some(idx) = self.index.remove(&switch) {
            self.graph.remove_node(idx);
        }
        self.touch();
        Ok(())
    }

    /// Add (or replace) a port of a switch.
    pub fn add_port(
        &mut self,
        loc: Location,
        config_up: bool,
        status_up: bool,
        port_type: PortType,
    ) -> Result<(), TopologyError> {
        let node = self.switch_mut(loc.switch)?;
        node.ports.insert(loc.port, Port::new(loc.port, config_up, status_up, port_type));
        self.touch();
        Ok(())
    }

    /// Remove a port together with its link.
    pub fn remove_port(&mut self, loc: Location) -> Result<(), TopologyError> {
        self.remove_associated_link(loc)?;
        self.switch_mut(loc.switch)?.ports.remove(&loc.port).ok_or(TopologyError::UnknownPort(loc))?;
        self.touch();
        Ok(())
    }

    /// Update the flags of a port, and return what changed.
    pub fn modify_port(
        &mut self,
        loc: Location,
        config_up: bool,
        status_up: bool,
    ) -> Result<PortChange, TopologyError> {
        let port = self.port_mut(loc)?;
        let change = PortChange {
            config_down: port.config_up && !config_up,
            status_down: port.status_up && !status_up,
            came_up: (!port.config_up && config_up) || (!port.status_up && status_up),
        };
        port.config_up = config_up;
        port.status_up = status_up;
        self.touch();
        Ok(change)
    }

    /// Remove the link attached to the port, if there is any.
    pub fn remove_associated_link(&mut self, loc: Location) -> Result<(), TopologyError> {
        let peer = match self.port_mut(loc)?.linked_to.take() {
            Some(peer) => peer,
            None => return Ok(()),
        };
        if let Ok(p) = self.port_mut(peer) {
            p.linked_to = None;
        }
        if let (Some(a), Some(b)) = (self.index.get(&loc.switch), self.index.get(&peer.switch)) {
            if let Some(e) = self.graph.find_edge(*a, *b) {
                self.graph.remove_edge(e);
            }
        }
        self.touch();
        Ok(())
    }

    /// Handle a link report between two ports. An already present identical link is left alone.
    /// If the switches were linked over different ports, the old link is removed first. The link
    /// is only added if both ports are possibly up. Returns `true` if the topology changed.
    pub fn update_link(&mut self, l1: Location, l2: Location) -> Result<bool, TopologyError> {
        let p1 = self.port(l1).ok_or(TopologyError::UnknownPort(l1))?.clone();
        let p2 = self.port(l2).ok_or(TopologyError::UnknownPort(l2))?.clone();
        let (i1, i2) = (self.index[&l1.switch], self.index[&l2.switch]);
        let mut changed = false;

        if let Some(link) = self.graph.find_edge(i1, i2).and_then(|e| self.graph.edge_weight(e)).copied() {
            let old1 = link.port_at(l1.switch);
            let old2 = link.port_at(l2.switch);
            if old1 == Some(l1.port) && old2 == Some(l2.port) {
                if p1.possibly_up() && p2.possibly_up() {
                    return Ok(false);
                }
                return Err(TopologyError::InconsistentLink(l1, l2));
            }
            if let Some(old) = old1.filter(|p| *p != l1.port) {
                self.remove_associated_link(Location::new(l1.switch, old))?;
                changed = true;
            }
            if let Some(old) = old2.filter(|p| *p != l2.port) {
                self.remove_associated_link(Location::new(l2.switch, old))?;
                changed = true;
            }
        }

        if p1.possibly_up() && p2.possibly_up() {
            // the ports themselves may still be linked to other switches
            self.remove_associated_link(l1)?;
            self.remove_associated_link(l2)?;
            self.port_mut(l1)?.linked_to = Some(l2);
            self.port_mut(l2)?.linked_to = Some(l1);
            self.graph.add_edge(i1, i2, Link { a: l1, b: l2 });
            changed = true;
        }
        if changed {
            self.touch();
        }
        Ok(changed)
    }

    /// Ports that are possibly up and not linked to another switch. These lead to hosts.
    pub fn egress_locations(&self, switch: Option<SwitchId>) -> BTreeSet<Location> {
        self.locations(switch, |p| p.linked_to.is_none())
    }

    /// Ports that are possibly up and linked to another switch.
    pub fn interior_locations(&self, switch: Option<SwitchId>) -> BTreeSet<Location> {
        self.locations(switch, |p| p.linked_to.is_some())
    }

    fn locations<F: Fn(&Port) -> bool>(&self, switch: Option<SwitchId>, f: F) -> BTreeSet<Location> {
        let switches = match switch {
            Some(s) => vec![s],
            None => self.switches(),
        };
        let f = &f;
        switches
            .into_iter()
            .filter_map(|s| self.switch(s))
            .flat_map(move |node| {
                node.ports
                    .values()
                    .filter(move |p| p.possibly_up() && f(p))
                    .map(move |p| Location::new(node.id, p.no))
            })
            .collect()
    }

    /// Returns `true` if every switch can reach every other switch. The empty topology is not
    /// connected.
    pub fn is_connected(&self) -> bool {
        let start = match self.graph.node_indices().next() {
            Some(n) => n,
            None => return false,
        };
        let mut bfs = Bfs::new(&self.graph, start);
        let mut reached = 0;
        while bfs.next(&self.graph).is_some() {
            reached += 1;
        }
        reached == self.graph.node_count()
    }

    /// Minimum spanning tree (every link has the same weight), taking links in the order of
    /// their locations. Ports of links not part of the tree are removed.
    pub fn minimum_spanning_tree(&self) -> Topology {
        let links = self.links();
        self.spanning_tree(links)
    }

    /// Minimum spanning tree over a random ordering of the links.
    pub fn random_minimum_spanning_tree<R: Rng + ?Sized>(&self, rng: &mut R) -> Topology {
        let mut links = self.links();
        links.shuffle(rng);
        self.spanning_tree(links)
    }

    /// Kruskal over the links in the given order
    fn spanning_tree(&self, links: Vec<(Location, Location)>) -> Topology {
        let mut uf: UnionFind<usize> = UnionFind::new(self.graph.node_bound());
        let mut removed = Vec::new();
        for (a, b) in links {
            let ia = self.index[&a.switch].index();
            let ib = self.index[&b.switch].index();
            if !uf.union(ia, ib) {
                removed.push((a, b));
            }
        }
        let mut tree = self.clone();
        tree.remove_links(&removed, false);
        tree
    }

    /// Remove links. If `keep_ports` is `false`, the ports of the removed links are deleted,
    /// otherwise they become egress ports.
    fn remove_links(&mut self, links: &[(Location, Location)], keep_ports: bool) {
        for (a, b) in links {
            for loc in [a, b].iter() {
                if let Err(e) = self.remove_associated_link(**loc) {
                    debug!("{}", e);
                }
                if !keep_ports {
                    if let Ok(node) = self.switch_mut(loc.switch) {
                        node.ports.remove(&loc.port);
                    }
                }
            }
        }
        self.touch();
    }

    /// Heuristic for a set of link-disjoint spanning trees: pick a random spanning tree, remove
    /// its links, and repeat while the remainder is still connected.
    pub fn disjoint_minimum_spanning_trees<R: Rng + ?Sized>(&self, rng: &mut R) -> Vec<Topology> {
        let mut trees = Vec::new();
        let mut remainder = self.clone();
        while remainder.is_connected() {
            let tree = remainder.random_minimum_spanning_tree(rng);
            let tree_links = tree.links();
            remainder.remove_links(&tree_links, false);
            trees.push(tree);
            if remainder.links().is_empty() {
                break;
            }
        }
        trees
    }

    /// Shortest paths between every pair of switches. A path is the list of egress locations
    /// traversed from the source switch towards the destination switch, and is empty for a
    /// switch to itself. Unreachable pairs are absent.
    pub fn all_pairs_shortest_paths(&self) -> HashMap<(SwitchId, SwitchId), Vec<Location>> {
        let mut result = HashMap::new();
        for s in self.switches() {
            for t in self.switches() {
                let (is, it) = (self.index[&s], self.index[&t]);
                let path = astar(&self.graph, is, |n| n == it, |_| 1u32, |_| 0u32);
                if let Some((_, nodes)) = path {
                    let locs = nodes
                        .windows(2)
                        .filter_map(|w| {
                            let e = self.graph.find_edge(w[0], w[1])?;
                            let cur = self.graph.node_weight(w[0])?.id;
                            let port = self.graph.edge_weight(e)?.port_at(cur)?;
                            Some(Location::new(cur, port))
                        })
                        .collect();
                    result.insert((s, t), locs);
                }
            }
        }
        result
    }

    /// Sub-topology containing only the given switches. Ports whose link was cut become egress
    /// ports.
    pub fn filter_switches(&self, keep: &[SwitchId]) -> Topology {
        let keep: HashSet<SwitchId> = keep.iter().copied().collect();
        let remove: Vec<SwitchId> = self.switches().into_iter().filter(|s| !keep.contains(s)).collect();
        self.filter_out_switches(&remove)
    }

    /// Sub-topology without the given switches. Ports whose link was cut become egress ports.
    pub fn filter_out_switches(&self, remove: &[SwitchId]) -> Topology {
        let mut topo = self.clone();
        for s in remove {
            if let Err(e) = topo.remove_switch(*s) {
                debug!("{}", e);
            }
        }
        topo
    }
}

impl fmt::Display for Topology {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "switch | links | egress ports")?;
        for s in self.switches() {
            let links: Vec<String> = self
                .links()
                .into_iter()
                .filter(|(a, b)| a.switch == s || b.switch == s)
                .map(|(a, b)| format!("{} --- {}", a, b))
                .collect();
            let egress: Vec<String> =
                self.egress_locations(Some(s)).iter().map(|l| format!("{}---", l)).collect();
            writeln!(f, "{} | {} | {}", s, links.join(", "), egress.join(", "))?;
        }
        Ok(())
    }
}
