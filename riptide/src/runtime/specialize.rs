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

//! # Per-Switch Specialization
//!
//! Turns a switch-agnostic classifier into the flow tables of every switch in the topology:
//!
//! 1. Each rule is restricted to `switch = s`. Rules that cannot fire on `s` disappear.
//! 2. Rules matching on a header the switch cannot realize are widened to the realizable part of
//!    the match, and send the packet to the controller.
//! 3. Shadowed rules are removed.
//! 4. OpenFlow never sends a packet out of the port it arrived on, unless the output port is the
//!    virtual `IN_PORT`. Forwarding rules are split per ingress port, and the copy restricted to
//!    `inport = p` forwards to `IN_PORT` instead of `p`.
//! 5. On a single-table pipeline, actions without an output port drop the packet.
//! 6. Rules get descending priorities starting at [`RULE_PRIORITY_BASE`].

use super::driver::ConcreteAction;
use crate::classifier::{Action, Classifier, Match, Rule};
use crate::network::{SwitchId, Topology};
use crate::packet::{
    is_compilable, HeaderMap, HeaderValue, ETHTYPE, ETH_TYPE_IPV6, ETH_TYPE_LLDP, INPORT,
    OFPP_IN_PORT, OUTPORT, SWITCH,
};

use log::*;
use std::collections::BTreeMap;

/// Priority of the first policy rule on every switch
pub const RULE_PRIORITY_BASE: u16 = 60000;
/// Priority of the LLDP and IPv6 default rules
pub const DEFAULT_HIGH_PRIORITY: u16 = 65535;
/// Priority of the table-miss rule
pub const TABLE_MISS_PRIORITY: u16 = 0;

/// Rule of a single switch, with its priority
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SwitchRule {
    /// Match, including `switch`
    pub matches: Match,
    /// Priority
    pub priority: u16,
    /// Actions, still including the bucket actions
    pub actions: Vec<Action>,
}

/// Specialize the classifier for every switch of the topology.
pub fn specialize(
    c: &Classifier,
    topo: &Topology,
    multi_table: bool,
) -> BTreeMap<SwitchId, Vec<SwitchRule>> {
    topo.switches()
        .into_iter()
        .map(|s| (s, specialize_switch(c, topo, s, multi_table)))
        .collect()
}

fn specialize_switch(c: &Classifier, topo: &Topology, s: SwitchId, multi_table: bool) -> Vec<SwitchRule> {
    let at_switch = Match::identity().with(SWITCH, s);
    let rules: Vec<Rule> = c
        .rules
        .iter()
        .filter_map(|r| {
            let m = r.matches.intersect(&at_switch)?;
            if m.fields().keys().all(|f| is_compilable(f)) {
                Some(Rule::derived(m, r.actions.clone(), &[r]))
            } else {
                trace!("widening {} on switch {} to the controller", r.matches, s);
                Some(Rule::derived(m.restrict(is_compilable), vec![Action::Controller], &[r]))
            }
        })
        .collect();
    let rules = Classifier::new(rules).optimize().rules;
    let ports: Vec<u32> =
        topo.switch(s).map(|node| node.ports.keys().copied().collect()).unwrap_or_default();
    inportize(rules, &ports)
        .into_iter()
        .enumerate()
        .map(|(i, r)| SwitchRule {
            priority: (RULE_PRIORITY_BASE as usize).saturating_sub(i).max(1) as u16,
            actions: if multi_table { r.actions } else { forwarding_only(r.actions) },
            matches: r.matches,
        })
        .collect()
}

/// Rewrite `outport = p` into `outport = IN_PORT` for packets that arrived on `p`. A forwarding
/// rule without an `inport` test is split into one rule per port of the switch. If the ports of
/// the switch are unknown, a copy is added for every output port, followed by the original rule.
pub fn inportize(rules: Vec<Rule>, ports: &[u32]) -> Vec<Rule> {
    let mut result = Vec::with_capacity(rules.len());
    for r in rules {
        let mut outports: Vec<u32> = r.actions.iter().filter_map(Action::outport).collect();
        if outports.is_empty() {
            result.push(r);
            continue;
        }
        if let Some(inport) = r.matches.get(INPORT).and_then(HeaderValue::as_int) {
            let actions = r.actions.iter().map(|a| to_in_port(a, inport)).collect();
            result.push(Rule::derived(r.matches.clone(), actions, &[&r]));
            continue;
        }
        outports.sort_unstable();
        outports.dedup();
        let split = if ports.is_empty() { &outports[..] } else { ports };
        for p in split {
            let actions = r.actions.iter().map(|a| to_in_port(a, *p)).collect();
            result.push(Rule::derived(r.matches.clone().with(INPORT, *p), actions, &[&r]));
        }
        if ports.is_empty() {
            result.push(r);
        }
    }
    result
}

fn to_in_port(action: &Action, inport: u32) -> Action {
    match action {
        Action::Modify(map) if action.outport() == Some(inport) => {
            let mut map = map.clone();
            map.insert(OUTPORT.to_string(), HeaderValue::Int(OFPP_IN_PORT));
            Action::Modify(map)
        }
        a => a.clone(),
    }
}

/// Keep only actions that leave the switch, i.e., forwarding, controller and bucket actions.
fn forwarding_only(actions: Vec<Action>) -> Vec<Action> {
    actions
        .into_iter()
        .filter(|a| match a {
            Action::Identity => false,
            Action::Modify(_) => a.outport().is_some(),
            Action::Controller | Action::Bucket(_) => true,
        })
        .collect()
}

/// Translate the actions into the actions sent to the switch, removing the bucket actions.
pub fn concretize(actions: &[Action]) -> Vec<ConcreteAction> {
    actions
        .iter()
        .filter_map(|a| match a {
            Action::Identity => Some(ConcreteAction::Forward(HeaderMap::new())),
            Action::Modify(map) => Some(ConcreteAction::Forward(map.clone())),
            Action::Controller => Some(ConcreteAction::Controller),
            Action::Bucket(_) => None,
        })
        .collect()
}

/// Platform default rules of a switch. LLDP goes to the controller for link discovery, IPv6 is
/// dropped, and packets missing every rule are sent to the controller.
pub fn default_rules(s: SwitchId, table: u8) -> Vec<(Match, u16, Vec<ConcreteAction>)> {
    let at_switch = Match::identity().with(SWITCH, s);
    let mut rules = Vec::new();
    if table == 0 {
        rules.push((
            at_switch.clone().with(ETHTYPE, ETH_TYPE_LLDP),
            DEFAULT_HIGH_PRIORITY,
            vec![ConcreteAction::Controller],
        ));
        rules.push((at_switch.clone().with(ETHTYPE, ETH_TYPE_IPV6), DEFAULT_HIGH_PRIORITY, vec![]));
    }
    rules.push((at_switch, TABLE_MISS_PRIORITY, vec![ConcreteAction::Controller]));
    rules
}
