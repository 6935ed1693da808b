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
//! Derived policies for everyday programs: membership filters, printing and breakpoints.
//!
//! Printing policies and breakpoints pass every packet unchanged and hand a copy to a
//! [`FwdBucket`]. On the switches, this sends the packets to the controller, where the runtime
//! delivers them to the bucket. The output goes to the log at level `info`.

use super::{bucket, match_field, union, DynamicPolicy, NetworkHandler, Policy};
use crate::buckets::FwdBucket;
use crate::lock;
use crate::network::{SwitchId, Topology};
use crate::packet::{HeaderValue, Packet, DSTIP, SWITCH};

use log::*;
use std::fmt;
use std::sync::{Arc, Mutex};

/// Filter passing packets whose `field` holds one of the values. Without values, nothing passes.
pub fn field_in<V: Into<HeaderValue>>(field: &str, values: Vec<V>) -> Policy {
    union(values.into_iter().map(|v| match_field(field, v)).collect())
}

/// Filter passing packets located at one of the switches
pub fn switch_in(switches: &[SwitchId]) -> Policy {
    field_in(SWITCH, switches.to_vec())
}

/// Filter passing packets destined to one of the addresses (or prefixes)
pub fn dstip_in(addresses: Vec<HeaderValue>) -> Policy {
    field_in(DSTIP, addresses)
}

fn tap<F: Fn(&Packet) + Send + Sync + 'static>(f: F) -> Policy {
    let b = FwdBucket::new();
    b.register_callback(f);
    Policy::Identity + bucket(b)
}

fn framed<T: fmt::Display>(title: &str, body: T) -> String {
    if title.is_empty() {
        body.to_string()
    } else {
        format!("---- {} ----\n{}", title, body)
    }
}

/// Log `msg` for every packet. Packets pass unchanged.
pub fn str_print(msg: &str) -> Policy {
    let msg = msg.to_string();
    tap(move |_| info!("{}", msg))
}

/// Log every packet below an optional title. Packets pass unchanged.
pub fn pkt_print(title: &str) -> Policy {
    let title = title.to_string();
    tap(move |pkt| info!("{}", framed(&title, pkt)))
}

struct TopologyTracker(Arc<Mutex<Option<Topology>>>);

impl NetworkHandler for TopologyTracker {
    fn update(&self, topo: &Topology) -> Option<Policy> {
        *lock(&self.0) = Some(topo.clone());
        None
    }
}

/// Log the current topology below an optional title for every packet. Packets pass unchanged.
pub fn topo_print(title: &str) -> DynamicPolicy {
    let topo: Arc<Mutex<Option<Topology>>> = Arc::new(Mutex::new(None));
    let shared = topo.clone();
    let title = title.to_string();
    let policy = tap(move |_| match lock(&shared).as_ref() {
        Some(t) => info!("{}", framed(&title, t)),
        None => info!("{}", framed(&title, "no topology")),
    });
    DynamicPolicy::with_handler("topo_print", policy, TopologyTracker(topo))
}

/// Pass every packet, and call `hook` with every packet passing the filter `pred`.
pub fn breakpoint<F: Fn(&Packet) + Send + Sync + 'static>(pred: Policy, hook: F) -> Policy {
    let b = FwdBucket::new();
    b.register_callback(move |pkt| {
        warn!("breakpoint hit by {}", pkt);
        hook(pkt)
    });
    Policy::Identity + (pred >> bucket(b))
}
