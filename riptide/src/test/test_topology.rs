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

//! Test the topology graph and the debounced network view

use crate::network::*;
use maplit::btreeset;
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::time::{Duration, Instant};

fn loc(s: SwitchId, p: PortNo) -> Location {
    Location::new(s, p)
}

fn build(ports: &[(SwitchId, PortNo)], links: &[((SwitchId, PortNo), (SwitchId, PortNo))]) -> Topology {
    let mut t = Topology::new();
    for (s, p) in ports.iter() {
        t.add_switch(*s);
        t.add_port(loc(*s, *p), true, true, PortType::Physical).unwrap();
    }
    for (a, b) in links.iter() {
        t.update_link(loc(a.0, a.1), loc(b.0, b.1)).unwrap();
    }
    t
}

/// ```text
///  h --- 1[1]  1[2] --- 2[1]  2[3] --- h
///        1[3]           2[2]
///          \             /
///          3[2]        3[1]
///               3[3] --- h
/// ```
fn triangle() -> Topology {
    build(
        &[(1, 1), (1, 2), (1, 3), (2, 1), (2, 2), (2, 3), (3, 1), (3, 2), (3, 3)],
        &[((1, 2), (2, 1)), ((2, 2), (3, 1)), ((3, 2), (1, 3))],
    )
}

/// `1 --- 2 --- 3`, with a host on every switch.
fn line() -> Topology {
    build(
        &[(1, 1), (1, 2), (2, 1), (2, 2), (2, 3), (3, 1), (3, 2)],
        &[((1, 2), (2, 1)), ((2, 2), (3, 1))],
    )
}

#[test]
fn test_links_and_locations() {
    let t = triangle();
    assert_eq!(t.switches(), vec![1, 2, 3]);
    assert_eq!(
        t.links(),
        vec![(loc(1, 2), loc(2, 1)), (loc(1, 3), loc(3, 2)), (loc(2, 2), loc(3, 1))]
    );
    assert_eq!(t.egress_locations(None), btreeset! {loc(1, 1), loc(2, 3), loc(3, 3)});
    assert_eq!(t.egress_locations(Some(2)), btreeset! {loc(2, 3)});
    assert_eq!(t.interior_locations(Some(1)), btreeset! {loc(1, 2), loc(1, 3)});
    assert_eq!(t.port(loc(1, 2)).and_then(|p| p.linked_to), Some(loc(2, 1)));
    assert!(t.is_connected());
    assert!(!Topology::new().is_connected());
}

#[test]
fn test_version() {
    let mut t = triangle();
    let copy = t.clone();
    assert_eq!(copy.version(), t.version());
    assert!(!t.add_switch(1));
    assert_eq!(copy.version(), t.version());

    t.add_switch(4);
    assert_ne!(copy.version(), t.version());
    assert_ne!(copy, t);
    t.remove_switch(4).unwrap();
    // equality ignores the version
    assert_eq!(copy, t);
}

#[test]
fn test_update_link() {
    let mut t = triangle();
    // the same link again
    assert_eq!(t.update_link(loc(2, 1), loc(1, 2)), Ok(false));

    // the switches are now linked over other ports
    assert_eq!(t.update_link(loc(1, 1), loc(2, 3)), Ok(true));
    assert!(t.links().contains(&(loc(1, 1), loc(2, 3))));
    assert!(!t.links().contains(&(loc(1, 2), loc(2, 1))));
    assert_eq!(t.egress_locations(Some(1)), btreeset! {loc(1, 2)});

    // links on ports that are down are ignored
    t.add_switch(4);
    t.add_port(loc(4, 1), false, false, PortType::Physical).unwrap();
    assert_eq!(t.update_link(loc(4, 1), loc(1, 2)), Ok(false));
    assert_eq!(t.port(loc(4, 1)).and_then(|p| p.linked_to), None);
    assert!(t.egress_locations(Some(4)).is_empty());

    assert_eq!(t.update_link(loc(3, 9), loc(1, 2)), Err(TopologyError::UnknownPort(loc(3, 9))));
}

#[test]
fn test_update_link_inconsistent() {
    let mut t = triangle();
    t.modify_port(loc(1, 2), false, false).unwrap();
    assert_eq!(
        t.update_link(loc(1, 2), loc(2, 1)),
        Err(TopologyError::InconsistentLink(loc(1, 2), loc(2, 1)))
    );
}

#[test]
fn test_remove() {
    let mut t = triangle();
    t.remove_port(loc(1, 2)).unwrap();
    assert_eq!(t.links().len(), 2);
    assert_eq!(t.egress_locations(Some(2)), btreeset! {loc(2, 1), loc(2, 3)});

    t.remove_switch(3).unwrap();
    assert!(t.links().is_empty());
    assert!(!t.contains_switch(3));
    assert_eq!(t.remove_switch(3), Err(TopologyError::UnknownSwitch(3)));
    assert_eq!(t.remove_port(loc(1, 2)), Err(TopologyError::UnknownPort(loc(1, 2))));
}

#[test]
fn test_modify_port() {
    let mut t = triangle();
    let change = t.modify_port(loc(1, 1), true, false).unwrap();
    assert_eq!(change, PortChange { config_down: false, status_down: true, came_up: false });
    let change = t.modify_port(loc(1, 1), true, true).unwrap();
    assert_eq!(change, PortChange { config_down: false, status_down: false, came_up: true });
    assert!(t.port(loc(1, 1)).unwrap().possibly_up());
}

#[test]
fn test_minimum_spanning_tree() {
    let t = triangle();
    let mst = t.minimum_spanning_tree();
    assert_eq!(mst.links(), vec![(loc(1, 2), loc(2, 1)), (loc(1, 3), loc(3, 2))]);
    assert!(mst.is_connected());
    // ports of the removed link are gone, so they are not egress ports either
    assert!(mst.port(loc(2, 2)).is_none());
    assert!(mst.port(loc(3, 1)).is_none());
    assert_eq!(mst.egress_locations(None), t.egress_locations(None));

    let mut rng = StdRng::seed_from_u64(42);
    let random = t.random_minimum_spanning_tree(&mut rng);
    assert_eq!(random.links().len(), 2);
    assert!(random.is_connected());

    let trees = t.disjoint_minimum_spanning_trees(&mut rng);
    assert_eq!(trees.len(), 1);
}

#[test]
fn test_shortest_paths() {
    let paths = line().all_pairs_shortest_paths();
    assert!(paths[&(1, 1)].is_empty());
    assert_eq!(paths[&(1, 2)], vec![loc(1, 2)]);
    assert_eq!(paths[&(1, 3)], vec![loc(1, 2), loc(2, 2)]);
    assert_eq!(paths[&(3, 1)], vec![loc(3, 1), loc(2, 1)]);
    assert_eq!(paths.len(), 9);

    let mut split = line();
    split.remove_port(loc(2, 2)).unwrap();
    let paths = split.all_pairs_shortest_paths();
    assert!(!paths.contains_key(&(1, 3)));
    assert!(paths.contains_key(&(1, 2)));
}

#[test]
fn test_filter_switches() {
    let t = triangle();
    let sub = t.filter_switches(&[1, 2]);
    assert_eq!(sub.switches(), vec![1, 2]);
    assert_eq!(sub.links(), vec![(loc(1, 2), loc(2, 1))]);
    assert_eq!(sub.egress_locations(None), btreeset! {loc(1, 1), loc(1, 3), loc(2, 2), loc(2, 3)});
    assert_eq!(t.filter_out_switches(&[3]), sub);
}

#[test]
fn test_network_view_debounce() {
    let mut view = NetworkView::new(Duration::from_secs(1));
    let t0 = Instant::now();

    let effect = view.apply(&TopologyEvent::SwitchJoin { switch: 1 }, t0).unwrap();
    assert!(effect.changed);
    assert!(view.is_dirty());
    assert!(view.poll(t0).is_none());
    assert_eq!(view.current().num_switches(), 0);

    // a second event restarts the window
    let t1 = t0 + Duration::from_millis(800);
    let join = TopologyEvent::PortJoin {
        switch: 1,
        port: 1,
        config_up: true,
        status_up: false,
        port_type: PortType::Physical,
    };
    let effect = view.apply(&join, t1).unwrap();
    assert_eq!(effect.discover, vec![loc(1, 1)]);
    assert!(view.poll(t0 + Duration::from_millis(1500)).is_none());

    let committed = view.poll(t1 + Duration::from_secs(1)).unwrap().clone();
    assert!(committed.port(loc(1, 1)).is_some());
    assert!(!view.is_dirty());
    assert_eq!(view.current(), view.next());
    assert!(view.poll(t1 + Duration::from_secs(5)).is_none());
}

#[test]
fn test_network_view_events() {
    let mut view = NetworkView::new(Duration::from_secs(0));
    let now = Instant::now();
    for s in [1, 2].iter() {
        view.apply(&TopologyEvent::SwitchJoin { switch: *s }, now).unwrap();
        for p in [1, 2].iter() {
            let join = TopologyEvent::PortJoin {
                switch: *s,
                port: *p,
                config_up: true,
                status_up: true,
                port_type: PortType::Physical,
            };
            view.apply(&join, now).unwrap();
        }
    }
    let link = TopologyEvent::LinkUpdate { s1: 1, p1: 2, s2: 2, p2: 1 };
    assert!(view.apply(&link, now).unwrap().changed);
    assert!(!view.apply(&link, now).unwrap().changed);
    assert!(!view.apply(&TopologyEvent::SwitchJoin { switch: 1 }, now).unwrap().changed);

    // a port going down loses its link
    let down = TopologyEvent::PortMod { switch: 1, port: 2, config_up: true, status_up: false };
    let effect = view.apply(&down, now).unwrap();
    assert_eq!(effect, EventEffect { changed: true, discover: vec![loc(1, 2)] });
    assert!(view.next().links().is_empty());

    let effect = view.apply(&TopologyEvent::PortPart { switch: 2, port: 2 }, now).unwrap();
    assert!(effect.changed);
    assert_eq!(
        view.apply(&TopologyEvent::SwitchPart { switch: 9 }, now),
        Err(TopologyError::UnknownSwitch(9))
    );

    let topo = view.poll(now).unwrap();
    assert_eq!(topo.egress_locations(None), btreeset! {loc(1, 1), loc(1, 2), loc(2, 1)});
}

#[test]
fn test_event_serde() {
    let event: TopologyEvent = serde_json::from_str(r#"{"event": "switch_join", "switch": 4}"#).unwrap();
    assert_eq!(event, TopologyEvent::SwitchJoin { switch: 4 });

    let event: TopologyEvent = serde_json::from_str(
        r#"{"event": "port_join", "switch": 4, "port": 2, "config_up": true, "status_up": false}"#,
    )
    .unwrap();
    assert_eq!(
        event,
        TopologyEvent::PortJoin {
            switch: 4,
            port: 2,
            config_up: true,
            status_up: false,
            port_type: PortType::Physical
        }
    );
    assert_eq!(event.to_string(), "port 4[2] joined");

    let link = TopologyEvent::LinkUpdate { s1: 1, p1: 2, s2: 3, p2: 4 };
    let json = serde_json::to_string(&link).unwrap();
    assert_eq!(serde_json::from_str::<TopologyEvent>(&json).unwrap(), link);
    assert_eq!(link.to_string(), "link 1[2] --- 3[4]");
}
