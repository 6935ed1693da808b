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
//! Test the virtualization layer on a big switch

use crate::network::{Location, PortType, Topology};
use crate::packet::*;
use crate::policy::*;
use crate::virt::*;
use maplit::btreemap;

fn loc(s: u32, p: u32) -> Location {
    Location::new(s, p)
}

/// `h --- 1[1]  1[2] --- 2[1]  2[2] --- h`
fn two_switches() -> Topology {
    let mut t = Topology::new();
    for (s, p) in [(1, 1), (1, 2), (2, 1), (2, 2)].iter() {
        t.add_switch(*s);
        t.add_port(loc(*s, *p), true, true, PortType::Physical).unwrap();
    }
    t.update_link(loc(1, 2), loc(2, 1)).unwrap();
    t
}

fn single(p: &Policy, pkt: &Packet) -> Packet {
    let out: Vec<Packet> = p.eval(pkt).into_iter().collect();
    assert_eq!(out.len(), 1, "expected a single packet, got {:?}", out);
    out.into_iter().next().unwrap()
}

#[test]
fn test_big_switch_derive() {
    let (derived, vmap) = BigSwitch::new().derive(&two_switches());
    assert_eq!(derived.switches(), vec![BigSwitch::SWITCH_ID]);
    let node = derived.switch(1).unwrap();
    assert_eq!(node.ports.keys().copied().collect::<Vec<_>>(), vec![1, 2]);
    assert!(node.ports.values().all(|p| p.port_type == PortType::Virtual));
    assert_eq!(vmap.d2u, btreemap! {loc(1, 1) => vec![loc(1, 1)], loc(1, 2) => vec![loc(2, 2)]});
    assert_eq!(vmap.u2d, btreemap! {loc(1, 1) => loc(1, 1), loc(2, 2) => loc(1, 2)});

    // cutting switch 2 turns the link port of switch 1 into an egress port
    let (_, vmap) = BigSwitch::of_switches(vec![1]).derive(&two_switches());
    assert_eq!(vmap.d2u, btreemap! {loc(1, 1) => vec![loc(1, 1)], loc(1, 2) => vec![loc(1, 2)]});
}

#[test]
fn test_lift_and_lower() {
    let pkt = Packet::new()
        .with(SWITCH, 1u32)
        .with(INPORT, 1u32)
        .push(VTAG, HeaderValue::Int(VTAG_INGRESS))
        .push(VSWITCH, HeaderValue::Int(7))
        .push(VINPORT, HeaderValue::Int(3))
        .push(VOUTPORT, HeaderValue::Absent);

    let lifted = single(&lift_packet(), &pkt);
    assert_eq!(lifted.get_int(SWITCH), Some(7));
    assert_eq!(lifted.get_int(INPORT), Some(3));
    assert_eq!(lifted.get(OUTPORT), None);
    assert_eq!(lifted.get(VTAG), None);

    let lowered = single(&(fwd(4) >> lower_packet(9)), &lifted);
    assert_eq!(lowered.get_int(SWITCH), Some(1));
    assert_eq!(lowered.get_int(INPORT), Some(1));
    assert_eq!(lowered.get(OUTPORT), None);
    assert_eq!(lowered.get_int(VSWITCH), Some(7));
    assert_eq!(lowered.get_int(VINPORT), Some(3));
    assert_eq!(lowered.get_int(VOUTPORT), Some(4));
    assert_eq!(lowered.get_int(VTAG), Some(9));

    let stripped = single(&pop_vheaders(), &lowered);
    assert_eq!(stripped, Packet::new().with(SWITCH, 1u32).with(INPORT, 1u32));
}

#[test]
fn test_ingress_policy() {
    let (_, vmap) = BigSwitch::new().derive(&two_switches());
    let p = vmap.ingress_policy();

    let entering = single(&p, &Packet::new().with(SWITCH, 2u32).with(INPORT, 2u32));
    assert_eq!(entering.get_int(VTAG), Some(VTAG_INGRESS));
    assert_eq!(entering.get_int(VSWITCH), Some(1));
    assert_eq!(entering.get_int(VINPORT), Some(2));
    assert_eq!(entering.get(VOUTPORT), None);

    let interior = Packet::new().with(SWITCH, 2u32).with(INPORT, 1u32);
    assert_eq!(single(&p, &interior), interior);
}

#[test]
fn test_egress_policy() {
    let (_, vmap) = BigSwitch::new().derive(&two_switches());
    let p = vmap.egress_policy();
    let tagged = |switch: u32, outport: u32, voutport: u32| {
        Packet::new()
            .with(SWITCH, switch)
            .with(OUTPORT, outport)
            .push(VTAG, HeaderValue::Int(5))
            .push(VSWITCH, HeaderValue::Int(1))
            .push(VOUTPORT, HeaderValue::Int(voutport))
    };

    // leaving through the right virtual port strips the virtual headers
    assert_eq!(single(&p, &tagged(2, 2, 2)), Packet::new().with(SWITCH, 2u32).with(OUTPORT, 2u32));
    // leaving through another port is dropped
    assert!(p.eval(&tagged(2, 2, 1)).is_empty());
    // interior links are not affected
    assert_eq!(single(&p, &tagged(1, 2, 2)), tagged(1, 2, 2));
}

#[test]
fn test_one_to_one_fabric() {
    let mut vmap = Vmap::new();
    vmap.insert(loc(5, 1), loc(3, 1));
    vmap.insert(loc(5, 2), loc(3, 4));
    let p = vmap.one_to_one_fabric_policy();
    let pkt = Packet::new()
        .with(SWITCH, 3u32)
        .with(VSWITCH, 5u32)
        .with(VINPORT, 1u32)
        .with(VOUTPORT, 2u32);
    assert_eq!(single(&p, &pkt).get_int(OUTPORT), Some(4));
    assert!(p.eval(&pkt.modify(SWITCH, HeaderValue::Int(4))).is_empty());
}

#[test]
fn test_shortest_path_fabric() {
    let topo = two_switches();
    let (_, vmap) = BigSwitch::new().derive(&topo);
    let p = vmap.shortest_path_fabric_policy(&topo);
    let pkt = |switch: u32| {
        Packet::new()
            .with(SWITCH, switch)
            .with(VSWITCH, 1u32)
            .with(VINPORT, 1u32)
            .with(VOUTPORT, 2u32)
    };
    // towards switch 2 over the link, then out of the host port
    assert_eq!(single(&p, &pkt(1)).get_int(OUTPORT), Some(2));
    assert_eq!(single(&p, &pkt(2)).get_int(OUTPORT), Some(2));
}

#[test]
fn test_vtags_are_unique() {
    let a = new_vtag();
    let b = new_vtag();
    assert_ne!(a, VTAG_INGRESS);
    assert!(b > a);
}

#[test]
fn test_virtualize_end_to_end() {
    let topo = two_switches();
    let inner = DynamicPolicy::new("inner", match_field(INPORT, 1u32) >> fwd(2));
    let cell = virtualize(Policy::from(inner.clone()), BigSwitch::new());
    let p = Policy::from(cell.clone());

    let pkt = Packet::new().with(SWITCH, 1u32).with(INPORT, 1u32).with(DSTPORT, 80u32);
    // nothing passes before the first topology
    assert!(p.eval(&pkt).is_empty());

    propagate_network(&p, &topo);
    assert!(cell.network_version().is_some());
    // the inner policy sees the big switch
    assert!(inner.network_version().is_some());
    assert_ne!(inner.network_version(), cell.network_version());

    // first hop: tagged and sent over the link
    let hop1 = single(&p, &pkt);
    assert_eq!(hop1.get_int(SWITCH), Some(1));
    assert_eq!(hop1.get_int(OUTPORT), Some(2));
    assert_eq!(hop1.get_int(VOUTPORT), Some(2));
    assert!(hop1.get_int(VTAG).map(|t| t != VTAG_INGRESS).unwrap_or(false));

    // second hop: leaves the big switch through its port 2
    let arrived = hop1
        .modify(SWITCH, HeaderValue::Int(2))
        .modify(INPORT, HeaderValue::Int(1))
        .modify(OUTPORT, HeaderValue::Absent);
    let hop2 = single(&p, &arrived);
    assert_eq!(
        hop2,
        Packet::new().with(SWITCH, 2u32).with(INPORT, 1u32).with(OUTPORT, 2u32).with(DSTPORT, 80u32)
    );

    // the virtual policy does not forward packets entering on the other port
    let other = Packet::new().with(SWITCH, 2u32).with(INPORT, 2u32);
    assert!(p.eval(&other).is_empty());
}
