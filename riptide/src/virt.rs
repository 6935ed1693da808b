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

//! # Virtualization
//!
//! A virtualized policy is written for a *derived* network (for instance a single big switch),
//! but runs on the underlying network. The [`Vmap`] maps every port of the derived network to
//! ports of the underlying one. Packets entering the network at a mapped port are *lifted*: the
//! virtual location is pushed on top of the physical one, the user policy runs on the virtual
//! location, and the packet is *lowered* again, carrying a tag that identifies the
//! virtualization. Tagged packets are routed by the fabric policy to the physical port behind
//! the chosen virtual output port, where the egress policy strips all virtual headers.
//!
//! The push, pop and move primitives are realized by the controller, so virtualized policies
//! are evaluated by the interpreter.

use crate::classifier::Match;
use crate::lock;
use crate::network::{Location, PortType, SwitchId, Topology};
use crate::packet::{HeaderValue, INPORT, OUTPORT, SWITCH};
use crate::policy::{
    filter, fwd, if_, intersection, match_field, move_fields, negate, parallel, pop,
    propagate_network, push, sequential, union, DynamicPolicy, NetworkHandler, Policy,
};

use log::*;
use maplit::btreemap;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;

/// Virtual switch header
pub const VSWITCH: &str = "vswitch";
/// Virtual ingress port header
pub const VINPORT: &str = "vinport";
/// Virtual egress port header
pub const VOUTPORT: &str = "voutport";
/// Virtualization tag header
pub const VTAG: &str = "vtag";
/// Tag of a packet that just entered a virtualized network and still needs to be lifted
pub const VTAG_INGRESS: u32 = 0;

static LAST_VTAG: AtomicU32 = AtomicU32::new(0);

/// Returns a new unique virtualization tag. Tags start at 1.
pub fn new_vtag() -> u32 {
    LAST_VTAG.fetch_add(1, Ordering::SeqCst) + 1
}

/// Lift a packet from the underlying network into the derived network.
pub fn lift_packet() -> Policy {
    pop(vec![VTAG.to_string()])
        >> move_fields(vec![
            (OUTPORT.to_string(), VOUTPORT.to_string()),
            (SWITCH.to_string(), VSWITCH.to_string()),
            (INPORT.to_string(), VINPORT.to_string()),
        ])
}

/// Lower a packet from the derived network back into the underlying network, tagging it with
/// `vtag`.
pub fn lower_packet(vtag: u32) -> Policy {
    push(btreemap! {VTAG.to_string() => HeaderValue::Int(vtag)})
        >> move_fields(vec![
            (VOUTPORT.to_string(), OUTPORT.to_string()),
            (VSWITCH.to_string(), SWITCH.to_string()),
            (VINPORT.to_string(), INPORT.to_string()),
        ])
}

/// Remove all virtualization headers
pub fn pop_vheaders() -> Policy {
    pop(vec![VSWITCH.to_string(), VINPORT.to_string(), VOUTPORT.to_string(), VTAG.to_string()])
}

/// # Virtual Map
/// Mapping between the locations of the derived network (`d`) and the locations of the
/// underlying network (`u`).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Vmap {
    /// Derived location to the underlying locations it stands for
    pub d2u: BTreeMap<Location, Vec<Location>>,
    /// Underlying location to the derived location it belongs to
    pub u2d: BTreeMap<Location, Location>,
}

impl Vmap {
    /// Create an empty map
    pub fn new() -> Self {
        Self::default()
    }

    /// Map the derived location `d` onto the underlying location `u`.
    pub fn insert(&mut self, d: Location, u: Location) {
        self.d2u.entry(d).or_insert_with(Vec::new).push(u);
        self.u2d.insert(u, d);
    }

    /// Returns `true` if no location is mapped
    pub fn is_empty(&self) -> bool {
        self.d2u.is_empty()
    }

    fn at(field: &str, u: &Location) -> Policy {
        filter(Match::identity().with(SWITCH, u.switch).with(field, u.port))
    }

    fn any_at(field: &str, us: &[Location]) -> Policy {
        union(us.iter().map(|u| Self::at(field, u)).collect())
    }

    fn virtual_pair(d1: &Location, d2: &Location, switch: SwitchId) -> Policy {
        filter(
            Match::identity()
                .with(VSWITCH, d1.switch)
                .with(VINPORT, d1.port)
                .with(VOUTPORT, d2.port)
                .with(SWITCH, switch),
        )
    }

    /// Packets arriving on a mapped port get the virtual location pushed, together with the
    /// ingress tag. All other packets pass unchanged.
    pub fn ingress_policy(&self) -> Policy {
        let non_ingress = negate(union(
            self.d2u.values().map(|us| Self::any_at(INPORT, us)).collect(),
        ));
        let ingress = parallel(
            self.d2u
                .iter()
                .map(|(d, us)| {
                    Self::any_at(INPORT, us)
                        >> push(btreemap! {
                            VTAG.to_string() => HeaderValue::Int(VTAG_INGRESS),
                            VSWITCH.to_string() => HeaderValue::Int(d.switch),
                            VINPORT.to_string() => HeaderValue::Int(d.port),
                            VOUTPORT.to_string() => HeaderValue::Absent,
                        })
                })
                .collect(),
        );
        ingress + non_ingress
    }

    /// Packets leaving through a mapped port are only let through if they leave the virtual
    /// port they were sent to, and lose their virtual headers. All other packets pass
    /// unchanged.
    pub fn egress_policy(&self) -> Policy {
        let mut leaving = Vec::new();
        let mut valid = Vec::new();
        for (d, us) in self.d2u.iter() {
            let at_port = Self::any_at(OUTPORT, us);
            valid.push(intersection(vec![
                filter(Match::identity().with(VSWITCH, d.switch).with(VOUTPORT, d.port)),
                at_port.clone(),
            ]));
            leaving.push(at_port);
        }
        if_(union(leaving), union(valid) >> pop_vheaders(), Policy::Identity)
    }

    /// Fabric for derived switches whose ports all map onto the same underlying switch.
    pub fn one_to_one_fabric_policy(&self) -> Policy {
        let mut fabric = Vec::new();
        for (d1, u1) in self.single_mappings() {
            for (d2, u2) in self.single_mappings() {
                if d1.switch != d2.switch {
                    continue;
                }
                fabric.push(Self::virtual_pair(d1, d2, u1.switch) >> fwd(u2.port));
            }
        }
        parallel(fabric)
    }

    /// Fabric routing every pair of virtual ports of the same derived switch along the shortest
    /// path of the underlying topology. Pairs whose underlying switches are disconnected are
    /// left out.
    pub fn shortest_path_fabric_policy(&self, topo: &Topology) -> Policy {
        let paths = topo.all_pairs_shortest_paths();
        let mut fabric = Vec::new();
        for (d1, u1) in self.single_mappings() {
            for (d2, u2) in self.single_mappings() {
                if d1.switch != d2.switch {
                    continue;
                }
                if d1.port != d2.port {
                    match paths.get(&(u1.switch, u2.switch)) {
                        Some(path) => fabric.extend(
                            path.iter().map(|hop| Self::virtual_pair(d1, d2, hop.switch) >> fwd(hop.port)),
                        ),
                        None => {
                            debug!("No path between {} and {} for the fabric", u1, u2);
                            continue;
                        }
                    }
                }
                fabric.push(Self::virtual_pair(d1, d2, u2.switch) >> fwd(u2.port));
            }
        }
        parallel(fabric)
    }

    /// Derived locations that are backed by exactly one underlying location.
    fn single_mappings(&self) -> impl Iterator<Item = (&Location, &Location)> {
        self.d2u.iter().filter_map(|(d, us)| match us.as_slice() {
            [u] => Some((d, u)),
            _ => None,
        })
    }
}

/// Definition of a derived network on top of an underlying one
pub trait VirtualizationDef: Send + Sync {
    /// Returns the derived topology together with the mapping onto the underlying topology.
    fn derive(&self, underlying: &Topology) -> (Topology, Vmap);

    /// Fabric policy of the virtualization. By default, packets are routed along shortest paths.
    fn fabric_policy(&self, vmap: &Vmap, underlying: &Topology) -> Policy {
        vmap.shortest_path_fabric_policy(underlying)
    }
}

/// # Big Switch
/// Presents the whole underlying network (or a subset of its switches) as a single switch with
/// id 1. Every egress location of the underlying network becomes one port of the big switch,
/// numbered from 1 in the order of the locations.
#[derive(Debug, Clone, Default)]
pub struct BigSwitch {
    keep: Vec<SwitchId>,
}

impl BigSwitch {
    /// Id of the big switch in the derived network
    pub const SWITCH_ID: SwitchId = 1;

    /// Big switch made of the entire underlying network
    pub fn new() -> Self {
        Self::default()
    }

    /// Big switch made only of the given switches
    pub fn of_switches(keep: Vec<SwitchId>) -> Self {
        Self { keep }
    }
}

impl VirtualizationDef for BigSwitch {
    fn derive(&self, underlying: &Topology) -> (Topology, Vmap) {
        let filtered;
        let topo = if self.keep.is_empty() {
            underlying
        } else {
            filtered = underlying.filter_switches(&self.keep);
            &filtered
        };
        let mut vmap = Vmap::new();
        let mut derived = Topology::new();
        derived.add_switch(Self::SWITCH_ID);
        for (u, port) in topo.egress_locations(None).into_iter().zip(1..) {
            let d = Location::new(Self::SWITCH_ID, port);
            if let Err(e) = derived.add_port(d, true, true, PortType::Virtual) {
                warn!("Cannot add port {} to the big switch: {}", d, e);
                continue;
            }
            vmap.insert(d, u);
        }
        (derived, vmap)
    }
}

struct VirtualizeHandler {
    inner: Policy,
    vdef: Box<dyn VirtualizationDef>,
    vtag: u32,
    last: Mutex<Option<(Topology, Vmap)>>,
}

impl VirtualizeHandler {
    fn build(&self, vmap: &Vmap, underlying: &Topology) -> Policy {
        sequential(vec![
            vmap.ingress_policy(),
            if_(
                match_field(VTAG, VTAG_INGRESS),
                lift_packet() >> self.inner.clone() >> lower_packet(self.vtag),
                Policy::Identity,
            ),
            if_(
                match_field(VTAG, self.vtag),
                self.vdef.fabric_policy(vmap, underlying) >> vmap.egress_policy(),
                Policy::Identity,
            ),
        ])
    }
}

impl NetworkHandler for VirtualizeHandler {
    fn update(&self, topo: &Topology) -> Option<Policy> {
        let (derived, vmap) = self.vdef.derive(topo);
        let mut last = lock(&self.last);
        let derived_changed = match last.as_ref() {
            Some((d, _)) => d != &derived,
            None => true,
        };
        if derived_changed {
            debug!("derived network of vtag {} changed:\n{}", self.vtag, derived);
            propagate_network(&self.inner, &derived);
        }
        let policy = self.build(&vmap, topo);
        *last = Some((derived, vmap));
        Some(policy)
    }

    fn owns_children(&self) -> bool {
        true
    }
}

/// Run `policy` on the network derived by `vdef`. The returned cell is rebuilt on every topology
/// change, and hands the derived topology to the dynamic cells inside `policy` whenever it
/// changes. Until the first topology arrives, the cell drops every packet.
pub fn virtualize<V: VirtualizationDef + 'static>(policy: Policy, vdef: V) -> DynamicPolicy {
    let vtag = new_vtag();
    DynamicPolicy::with_handler(
        &format!("virtualize({})", vtag),
        Policy::Drop,
        VirtualizeHandler { inner: policy, vdef: Box::new(vdef), vtag, last: Mutex::new(None) },
    )
}
