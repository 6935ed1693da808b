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
//! Scenario files describing a policy, virtual fields and a sequence of events.
//!
//! ```json
//! {
//!     "config": { "install_mode": "incremental" },
//!     "virtual_fields": [ { "name": "color", "values": [1, 2], "stage": 0 } ],
//!     "steps": [
//!         { "event": "switch_join", "switch": 1 },
//!         { "event": "port_join", "switch": 1, "port": 1, "config_up": true, "status_up": true },
//!         { "set_policy": { "sequential": [ { "match": { "switch": 1 } }, { "fwd": 2 } ] } },
//!         { "packet_in": { "switch": 1, "port": 1, "dstport": 80 } }
//!     ]
//! }
//! ```

use riptide::buckets::{packets, CountBucket, PacketsQuery};
use riptide::classifier::Match;
use riptide::network::{NetworkView, Topology, TopologyEvent};
use riptide::packet::{HeaderMap, HeaderValue, Packet};
use riptide::policy::*;
use riptide::runtime::RuntimeConfig;
use riptide::virt::{virtualize, BigSwitch};

use log::*;
use serde::Deserialize;
use std::collections::HashMap;
use std::error::Error;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Policy description, written as externally tagged JSON (`{"fwd": 2}`, `"identity"`, ...)
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicySpec {
    Identity,
    Drop,
    Controller,
    Flood,
    Match(HeaderMap),
    Modify(HeaderMap),
    Fwd(u32),
    Xfwd(u32),
    Parallel(Vec<PolicySpec>),
    Sequential(Vec<PolicySpec>),
    Union(Vec<PolicySpec>),
    Intersection(Vec<PolicySpec>),
    Negate(Box<PolicySpec>),
    If {
        pred: Box<PolicySpec>,
        then: Box<PolicySpec>,
        #[serde(rename = "else", default = "identity_spec")]
        otherwise: Box<PolicySpec>,
    },
    MatchModify {
        field: String,
        from: HeaderValue,
        to: HeaderValue,
    },
    /// Count bucket, named so that it can be pulled later
    Count(String),
    /// Packet bucket printing every packet it receives
    Packets(String),
    /// Dynamic cell, named so that later steps can replace its policy
    Dynamic {
        name: String,
        policy: Box<PolicySpec>,
    },
    /// Run the policy on a single big switch
    BigSwitch(Box<PolicySpec>),
}

fn identity_spec() -> Box<PolicySpec> {
    Box::new(PolicySpec::Identity)
}

/// Virtual field to register before the first policy is installed
#[derive(Debug, Clone, Deserialize)]
pub struct VirtualField {
    pub name: String,
    pub values: Vec<HeaderValue>,
    #[serde(default)]
    pub stage: u32,
}

/// Single step of a scenario
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum Step {
    /// Topology event reported by a switch
    Topology(TopologyEvent),
    /// Install a policy in a table
    SetPolicy {
        set_policy: PolicySpec,
        #[serde(default)]
        table: u8,
    },
    /// Replace the policy of a named dynamic cell
    Update { update: String, policy: PolicySpec },
    /// Packet sent to the controller by a rule of `table`
    PacketIn {
        packet_in: HeaderMap,
        #[serde(default)]
        table: u8,
    },
    /// Ask the switches for the counters of a count bucket
    Pull { pull: String },
}

/// # Scenario
#[derive(Debug, Clone, Deserialize)]
pub struct Scenario {
    #[serde(default)]
    pub config: RuntimeConfig,
    #[serde(default)]
    pub virtual_fields: Vec<VirtualField>,
    pub steps: Vec<Step>,
}

impl Scenario {
    /// Read a scenario from a JSON file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, Box<dyn Error>> {
        let content = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }

    /// Topology after all topology events of the scenario
    pub fn final_topology(&self) -> Topology {
        let mut view = NetworkView::new(Duration::from_secs(0));
        let now = Instant::now();
        for step in self.steps.iter() {
            if let Step::Topology(event) = step {
                if let Err(e) = view.apply(event, now) {
                    warn!("Skipping {}: {}", event, e);
                }
            }
        }
        view.poll(now);
        view.current().clone()
    }

    /// The last policy the scenario installs in `table`
    pub fn last_policy(&self, table: u8) -> Option<&PolicySpec> {
        self.steps
            .iter()
            .filter_map(|s| match s {
                Step::SetPolicy { set_policy, table: t } if *t == table => Some(set_policy),
                _ => None,
            })
            .last()
    }
}

/// Named buckets and dynamic cells created while building policies
#[derive(Default)]
pub struct Names {
    pub counts: HashMap<String, Arc<CountBucket>>,
    pub packets: HashMap<String, PacketsQuery>,
    pub dynamics: HashMap<String, DynamicPolicy>,
}

impl Names {
    fn count_bucket(&mut self, name: &str) -> Arc<CountBucket> {
        self.counts
            .entry(name.to_string())
            .or_insert_with(|| {
                let b = CountBucket::new();
                let name = name.to_string();
                b.register_callback(move |x: &(u64, u64)| {
                    println!("count {}: {} packets, {} bytes", name, x.0, x.1)
                });
                b
            })
            .clone()
    }

    fn packets_query(&mut self, name: &str) -> Policy {
        self.packets
            .entry(name.to_string())
            .or_insert_with(|| {
                let q = packets(None, vec![]);
                let name = name.to_string();
                q.register_callback(move |pkt: &Packet| println!("packets {}: {}", name, pkt));
                q
            })
            .policy()
    }

    /// Build the policy. Dynamic cells and buckets with a known name are reused.
    pub fn build(&mut self, spec: &PolicySpec) -> Policy {
        match spec {
            PolicySpec::Identity => Policy::Identity,
            PolicySpec::Drop => Policy::Drop,
            PolicySpec::Controller => Policy::Controller,
            PolicySpec::Flood => Policy::from(flood()),
            PolicySpec::Match(fields) => filter(Match::new(fields.clone())),
            PolicySpec::Modify(fields) => modify(fields.clone()),
            PolicySpec::Fwd(port) => fwd(*port),
            PolicySpec::Xfwd(port) => xfwd(*port),
            PolicySpec::Parallel(ps) => parallel(ps.iter().map(|p| self.build(p)).collect()),
            PolicySpec::Sequential(ps) => sequential(ps.iter().map(|p| self.build(p)).collect()),
            PolicySpec::Union(ps) => union(ps.iter().map(|p| self.build(p)).collect()),
            PolicySpec::Intersection(ps) => intersection(ps.iter().map(|p| self.build(p)).collect()),
            PolicySpec::Negate(p) => negate(self.build(p)),
            PolicySpec::If { pred, then, otherwise } => {
                if_(self.build(pred), self.build(then), self.build(otherwise))
            }
            PolicySpec::MatchModify { field, from, to } => match_modify(field, from.clone(), to.clone()),
            PolicySpec::Count(name) => bucket(self.count_bucket(name)),
            PolicySpec::Packets(name) => self.packets_query(name),
            PolicySpec::Dynamic { name, policy } => {
                let p = self.build(policy);
                match self.dynamics.get(name) {
                    Some(d) => {
                        d.set_policy(p);
                        Policy::from(d.clone())
                    }
                    None => {
                        let d = DynamicPolicy::new(name, p);
                        self.dynamics.insert(name.clone(), d.clone());
                        Policy::from(d)
                    }
                }
            }
            PolicySpec::BigSwitch(p) => Policy::from(virtualize(self.build(p), BigSwitch::new())),
        }
    }
}

/// Turn the headers of a packet-in step into a packet
pub fn packet(fields: &HeaderMap) -> Packet {
    Packet::new().modify_many(fields)
}
