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

//! # NetKAT Codec
//!
//! Encodes a [`Policy`] as the JSON request of an external NetKAT compile service, and decodes
//! the per-switch flow tables of its reply into a [`Classifier`]. The transport is left to an
//! implementation of [`CompileService`].
//!
//! NetKAT cannot express a missing VLAN tag, so `None` is sent as the sentinel values
//! [`VLAN_NONE_VALUE`] and [`VLAN_PCP_NONE_VALUE`], and decoded back to `Absent`.

use crate::buckets::BucketRef;
use crate::classifier::{Action, Classifier, Match, Rule};
use crate::packet::{
    HeaderMap, HeaderValue, IpPrefix, DSTIP, DSTMAC, DSTPORT, ETHTYPE, ETH_TYPE_ARP, ETH_TYPE_IP,
    INPORT, IP_PROTO_TCP, IP_PROTO_UDP, OFPP_IN_PORT, OUTPORT, PORT, PROTOCOL, SRCIP, SRCMAC,
    SRCPORT, SWITCH, VLAN_ID, VLAN_NBITS, VLAN_OFFSET, VLAN_PCP, VLAN_TOTAL_STAGES,
};
use crate::policy::{if_, match_field, modify_field, Policy};

use serde_json::{json, Map, Value};
use std::collections::HashMap;
use thiserror::Error;

/// Value of `vlan` that stands for a missing tag
pub const VLAN_NONE_VALUE: u32 = 0xfff;
/// Value of `vlanpcp` that stands for a missing tag
pub const VLAN_PCP_NONE_VALUE: u32 = 0x7;
/// Response header carrying the compile time in seconds
pub const COMPILE_TIME_HEADER: &str = "x-compile-time";

/// Error of the NetKAT codec
#[derive(Error, Debug, PartialEq)]
pub enum NetkatError {
    /// The policy contains a construct NetKAT cannot express
    #[error("Cannot encode {0} for NetKAT")]
    Unsupported(String),
    /// A header has no NetKAT counterpart
    #[error("Unknown header: {0}")]
    UnknownHeader(String),
    /// A header value has the wrong type
    #[error("Invalid value for header {0}: {1}")]
    InvalidValue(String, String),
    /// The response does not have the expected structure
    #[error("Malformed response: {0}")]
    Malformed(String),
    /// A rule sets or matches only one of `vlan` and `vlanpcp`
    #[error("Only one of vlan and vlanpcp is set in {0}")]
    OneSidedVlan(String),
    /// A rule refers to a query that is not part of the policy
    #[error("Unknown query: {0}")]
    UnknownQuery(String),
    /// The compile service failed
    #[error("Compile service failed: {0}")]
    Service(String),
}

/// Transport to an external NetKAT compiler
pub trait CompileService: Send + Sync {
    /// Compile a request. Returns the response body and the compile time in seconds.
    fn compile(&self, request: &Value) -> Result<(Value, f64), NetkatError>;
}

fn physical(port: u32) -> Value {
    json!({ "type": "physical", "port": port })
}

fn int_value(header: &str, v: &HeaderValue) -> Result<u32, NetkatError> {
    v.as_int().ok_or_else(|| NetkatError::InvalidValue(header.to_string(), v.to_string()))
}

type Encoded = Result<Option<(&'static str, Value)>, NetkatError>;

/// Translate a header into its NetKAT name and value. Helper fields of the tag register
/// return `None`.
fn header_val(header: &str, v: &HeaderValue) -> Encoded {
    let invalid = || NetkatError::InvalidValue(header.to_string(), v.to_string());
    let ip = |name: &'static str| -> Encoded {
        match v {
            HeaderValue::Ip(p) => {
                Ok(Some((name, json!({ "addr": p.addr().to_string(), "mask": p.prefix_len() }))))
            }
            _ => Err(invalid()),
        }
    };
    let mac = |name: &'static str| -> Encoded {
        match v {
            HeaderValue::Mac(m) => Ok(Some((name, json!(m.to_string())))),
            _ => Err(invalid()),
        }
    };
    let int = |name: &'static str| -> Encoded { Ok(Some((name, json!(int_value(header, v)?)))) };
    match header {
        SWITCH => int("switch"),
        INPORT | OUTPORT | PORT => Ok(Some(("location", physical(int_value(header, v)?)))),
        SRCMAC => mac("ethsrc"),
        DSTMAC => mac("ethdst"),
        VLAN_ID if v.is_absent() => Ok(Some(("vlan", json!(VLAN_NONE_VALUE)))),
        VLAN_ID => int("vlan"),
        VLAN_PCP if v.is_absent() => Ok(Some(("vlanpcp", json!(VLAN_PCP_NONE_VALUE)))),
        VLAN_PCP => int("vlanpcp"),
        ETHTYPE => int("ethtype"),
        PROTOCOL => int("ipproto"),
        SRCIP => ip("ip4src"),
        DSTIP => ip("ip4dst"),
        SRCPORT => int("tcpsrcport"),
        DSTPORT => int("tcpdstport"),
        VLAN_OFFSET | VLAN_NBITS | VLAN_TOTAL_STAGES => Ok(None),
        h => Err(NetkatError::UnknownHeader(h.to_string())),
    }
}

fn mk_and(preds: Vec<Value>) -> Value {
    json!({ "type": "and", "preds": preds })
}

fn mk_or(preds: Vec<Value>) -> Value {
    json!({ "type": "or", "preds": preds })
}

fn mk_filter(pred: Value) -> Value {
    json!({ "type": "filter", "pred": pred })
}

fn mk_seq(pols: Vec<Value>) -> Value {
    json!({ "type": "seq", "pols": pols })
}

fn mk_union(pols: Vec<Value>) -> Value {
    json!({ "type": "union", "pols": pols })
}

fn match_to_pred(fields: &HeaderMap) -> Result<Value, NetkatError> {
    let mut tests = Vec::new();
    for (h, v) in fields.iter() {
        if let Some((header, value)) = header_val(h, v)? {
            tests.push(json!({ "type": "test", "header": header, "value": value }));
        }
    }
    Ok(mk_and(tests))
}

fn expand(maps: Vec<HeaderMap>, needed: impl Fn(&HeaderMap) -> bool, field: &str, values: &[u32]) -> Vec<HeaderMap> {
    maps.into_iter()
        .flat_map(|m| {
            if needed(&m) {
                values
                    .iter()
                    .map(|v| {
                        let mut m = m.clone();
                        m.insert(field.to_string(), HeaderValue::Int(*v));
                        m
                    })
                    .collect()
            } else {
                vec![m]
            }
        })
        .collect()
}

/// Add the prerequisite fields OpenFlow requires for L3 and L4 matches. Transport ports need an
/// IP protocol, an IP protocol needs the IPv4 ethertype, and IP addresses need an ethertype.
fn with_prerequisites(m: &Match) -> Result<Value, NetkatError> {
    let has = |f: &HeaderMap, h: &str| f.contains_key(h);
    let maps = vec![m.fields().clone()];
    let maps = expand(
        maps,
        |f| (has(f, SRCPORT) || has(f, DSTPORT)) && !has(f, PROTOCOL),
        PROTOCOL,
        &[IP_PROTO_TCP, IP_PROTO_UDP],
    );
    let maps = expand(maps, |f| has(f, PROTOCOL) && !has(f, ETHTYPE), ETHTYPE, &[ETH_TYPE_IP]);
    let maps = expand(
        maps,
        |f| (has(f, SRCIP) || has(f, DSTIP)) && !has(f, ETHTYPE),
        ETHTYPE,
        &[ETH_TYPE_IP, ETH_TYPE_ARP],
    );
    if maps.len() == 1 {
        match_to_pred(&maps[0])
    } else {
        Ok(mk_or(maps.iter().map(match_to_pred).collect::<Result<_, _>>()?))
    }
}

struct Encoder {
    stack: Vec<usize>,
}

impl Encoder {
    fn pred(&mut self, p: &Policy) -> Result<Value, NetkatError> {
        Ok(match p {
            Policy::Match(m) => with_prerequisites(m)?,
            Policy::Identity => json!({ "type": "true" }),
            Policy::Drop => json!({ "type": "false" }),
            Policy::Negate(p) => json!({ "type": "neg", "pred": self.pred(p)? }),
            Policy::Union(ps) | Policy::Parallel(ps) => {
                mk_or(ps.iter().map(|p| self.pred(p)).collect::<Result<_, _>>()?)
            }
            Policy::Intersection(ps) | Policy::Sequential(ps) => {
                mk_and(ps.iter().map(|p| self.pred(p)).collect::<Result<_, _>>()?)
            }
            Policy::Difference(p, q) => {
                mk_and(vec![self.pred(p)?, json!({ "type": "neg", "pred": self.pred(q)? })])
            }
            Policy::Dynamic(d) => self.enter(d.id(), |e| e.pred(&d.policy()))?,
            p => return Err(NetkatError::Unsupported(format!("{} as a predicate", p))),
        })
    }

    fn enter<F>(&mut self, id: usize, f: F) -> Result<Value, NetkatError>
    where
        F: FnOnce(&mut Self) -> Result<Value, NetkatError>,
    {
        if self.stack.contains(&id) {
            return Err(NetkatError::Unsupported(format!("recursive dynamic policy {}", id)));
        }
        self.stack.push(id);
        let result = f(self);
        self.stack.pop();
        result
    }

    fn pol(&mut self, p: &Policy) -> Result<Value, NetkatError> {
        Ok(match p {
            Policy::Match(_)
            | Policy::Identity
            | Policy::Drop
            | Policy::Negate(_)
            | Policy::Union(_)
            | Policy::Intersection(_)
            | Policy::Difference(_, _) => mk_filter(self.pred(p)?),
            Policy::Modify(fields) => {
                let mut mods = Vec::new();
                for (h, v) in fields.iter() {
                    if let Some((header, value)) = header_val(h, v)? {
                        mods.push(json!({ "type": "mod", "header": header, "value": value }));
                    }
                }
                mk_seq(mods)
            }
            Policy::Parallel(ps) => mk_union(ps.iter().map(|p| self.pol(p)).collect::<Result<_, _>>()?),
            Policy::Sequential(ps) => mk_seq(ps.iter().map(|p| self.pol(p)).collect::<Result<_, _>>()?),
            Policy::Fwd(port) => json!({ "type": "mod", "header": "location", "value": physical(*port) }),
            Policy::XFwd(port) => self.pol(&Policy::xfwd_expansion(*port))?,
            Policy::If(c, t, f) => {
                let c = self.pred(c)?;
                mk_union(vec![
                    mk_seq(vec![mk_filter(c.clone()), self.pol(t)?]),
                    mk_seq(vec![mk_filter(json!({ "type": "neg", "pred": c })), self.pol(f)?]),
                ])
            }
            Policy::MatchModify(field, from, to) => self.pol(&if_(
                match_field(field, from.clone()),
                modify_field(field, to.clone()),
                Policy::Identity,
            ))?,
            Policy::Controller | Policy::Push(_) | Policy::Pop(_) | Policy::Move(_) => {
                json!({ "type": "mod", "header": "location", "value": { "type": "pipe", "name": "controller" } })
            }
            Policy::Bucket(b) => {
                let kind = if b.needs_controller() { "pipe" } else { "query" };
                json!({ "type": "mod", "header": "location", "value": { "type": kind, "name": b.id().to_string() } })
            }
            Policy::Dynamic(d) => self.enter(d.id(), |e| e.pol(&d.policy()))?,
            Policy::Recurse(r) => {
                let d = r
                    .upgrade()
                    .ok_or_else(|| NetkatError::Unsupported(format!("dropped dynamic policy {}", r.id())))?;
                self.enter(d.id(), |e| e.pol(&d.policy()))?
            }
        })
    }
}

/// Encode the policy as a NetKAT compile request. The policy is prefixed with a filter naming
/// every switch `1..=switch_count`, so that the compiler produces a table for each of them.
pub fn to_request(policy: &Policy, switch_count: u32) -> Result<Value, NetkatError> {
    let mut encoder = Encoder { stack: Vec::new() };
    let body = encoder.pol(policy)?;
    if switch_count == 0 {
        return Ok(body);
    }
    let switches: Vec<Value> = (1..=switch_count)
        .map(|s| json!({ "type": "test", "header": "switch", "value": s }))
        .collect();
    Ok(mk_seq(vec![mk_filter(mk_or(switches)), body]))
}

fn field_name(netkat: &str) -> Option<&'static str> {
    Some(match netkat {
        "dlSrc" => SRCMAC,
        "dlDst" => DSTMAC,
        "dlTyp" => ETHTYPE,
        "dlVlan" => VLAN_ID,
        "dlVlanPcp" => VLAN_PCP,
        "nwSrc" => SRCIP,
        "nwDst" => DSTIP,
        "nwProto" => PROTOCOL,
        "tpSrc" => SRCPORT,
        "tpDst" => DSTPORT,
        "inPort" => INPORT,
        _ => return None,
    })
}

fn decode_value(field: &str, v: &Value) -> Result<HeaderValue, NetkatError> {
    let invalid = || NetkatError::InvalidValue(field.to_string(), v.to_string());
    match field {
        SRCMAC | DSTMAC => HeaderValue::mac(v.as_str().ok_or_else(invalid)?).map_err(|_| invalid()),
        SRCIP | DSTIP => match v {
            Value::String(s) => HeaderValue::ip(s).map_err(|_| invalid()),
            Value::Object(o) => {
                let addr = o.get("addr").and_then(Value::as_str).ok_or_else(invalid)?;
                let mask = o.get("mask").and_then(Value::as_u64).unwrap_or(32);
                let prefix: IpPrefix = format!("{}/{}", addr, mask).parse().map_err(|_| invalid())?;
                Ok(HeaderValue::Ip(prefix))
            }
            _ => Err(invalid()),
        },
        _ => v.as_u64().map(|x| HeaderValue::Int(x as u32)).ok_or_else(invalid),
    }
}

/// Decode both vlan fields at once. Both sentinels mean `Absent`.
fn decode_vlan(
    id: Option<HeaderValue>,
    pcp: Option<HeaderValue>,
    context: &str,
) -> Result<Option<(HeaderValue, HeaderValue)>, NetkatError> {
    match (id, pcp) {
        (None, None) => Ok(None),
        (Some(id), Some(pcp)) => {
            if id == HeaderValue::Int(VLAN_NONE_VALUE) && pcp == HeaderValue::Int(VLAN_PCP_NONE_VALUE) {
                Ok(Some((HeaderValue::Absent, HeaderValue::Absent)))
            } else {
                Ok(Some((id, pcp)))
            }
        }
        _ => Err(NetkatError::OneSidedVlan(context.to_string())),
    }
}

fn decode_pattern(pattern: &Map<String, Value>, switch: u32) -> Result<Match, NetkatError> {
    let mut fields = HeaderMap::new();
    if switch > 0 {
        fields.insert(SWITCH.to_string(), HeaderValue::Int(switch));
    }
    for (k, v) in pattern.iter() {
        if v.is_null() {
            continue;
        }
        let field = field_name(k).ok_or_else(|| NetkatError::UnknownHeader(k.clone()))?;
        fields.insert(field.to_string(), decode_value(field, v)?);
    }
    let id = fields.remove(VLAN_ID);
    let pcp = fields.remove(VLAN_PCP);
    if let Some((id, pcp)) = decode_vlan(id, pcp, &Value::Object(pattern.clone()).to_string())? {
        fields.insert(VLAN_ID.to_string(), id);
        fields.insert(VLAN_PCP.to_string(), pcp);
    }
    Ok(Match::new(fields))
}

fn decode_action_list(acts: &[Value], matches: &Match) -> Result<Vec<Action>, NetkatError> {
    let malformed = |v: &Value| NetkatError::Malformed(v.to_string());
    let mut mods = HeaderMap::new();
    let mut controller = false;
    for act in acts {
        let kind = act.get(0).and_then(Value::as_str).ok_or_else(|| malformed(act))?;
        let arg = act.get(1).ok_or_else(|| malformed(act))?;
        match kind {
            "Modify" => {
                let name = arg.get(0).and_then(Value::as_str).ok_or_else(|| malformed(act))?;
                let name = name.strip_prefix("Set").ok_or_else(|| malformed(act))?;
                let name = match name {
                    "Vlan" | "VlanPcp" => format!("dl{}", name),
                    n => {
                        let mut chars = n.chars();
                        match chars.next() {
                            Some(c) => c.to_lowercase().chain(chars).collect(),
                            None => return Err(malformed(act)),
                        }
                    }
                };
                let field = field_name(&name).ok_or(NetkatError::UnknownHeader(name))?;
                let value = arg.get(1).ok_or_else(|| malformed(act))?;
                mods.insert(field.to_string(), decode_value(field, value)?);
            }
            "Output" => match arg.get("type").and_then(Value::as_str) {
                Some("physical") => {
                    let port = arg.get("port").and_then(Value::as_u64).ok_or_else(|| malformed(act))?;
                    mods.insert(OUTPORT.to_string(), HeaderValue::Int(port as u32));
                }
                Some("controller") => controller = true,
                Some("inport") => {
                    mods.insert(OUTPORT.to_string(), HeaderValue::Int(OFPP_IN_PORT));
                }
                _ => return Err(malformed(act)),
            },
            _ => return Err(malformed(act)),
        }
    }
    let mut id = mods.remove(VLAN_ID);
    let mut pcp = mods.remove(VLAN_PCP);
    // a modification of only one half keeps the matched value of the other half
    if id.is_some() != pcp.is_some() {
        id = id.or_else(|| matches.get(VLAN_ID).cloned());
        pcp = pcp.or_else(|| matches.get(VLAN_PCP).cloned());
    }
    if let Some((id, pcp)) = decode_vlan(id, pcp, &Value::Array(acts.to_vec()).to_string())? {
        mods.insert(VLAN_ID.to_string(), id);
        mods.insert(VLAN_PCP.to_string(), pcp);
    }
    let mut actions = Vec::new();
    if controller {
        actions.push(Action::Controller);
    }
    if !mods.is_empty() {
        actions.push(Action::Modify(mods));
    }
    Ok(actions)
}

/// Decode the response of the compile service. `buckets` are the buckets of the compiled policy,
/// used to resolve the query names of the rules.
pub fn from_response(response: &Value, buckets: &[BucketRef]) -> Result<Classifier, NetkatError> {
    let malformed = |s: &str| NetkatError::Malformed(s.to_string());
    let queries: HashMap<String, &BucketRef> = buckets.iter().map(|b| (b.id().to_string(), b)).collect();
    let tables = response.as_array().ok_or_else(|| malformed("expected a list of switch tables"))?;
    let mut rules = Vec::new();
    for table in tables {
        let switch = table.get("switch_id").and_then(Value::as_u64).ok_or_else(|| malformed("switch_id"))? as u32;
        let tbl = table.get("tbl").and_then(Value::as_array).ok_or_else(|| malformed("tbl"))?;
        let mut switch_rules = Vec::new();
        for rule in tbl {
            let priority = rule.get("priority").and_then(Value::as_u64).unwrap_or(0);
            let pattern = rule.get("pattern").and_then(Value::as_object).ok_or_else(|| malformed("pattern"))?;
            let matches = decode_pattern(pattern, switch)?;
            let action_lists = rule.get("action").and_then(Value::as_array).ok_or_else(|| malformed("action"))?;
            let mut actions = Vec::new();
            for list in action_lists {
                let list = list.as_array().ok_or_else(|| malformed("action list"))?;
                let decoded = decode_action_list(list, &matches)?;
                if decoded.is_empty() {
                    actions.push(Action::Identity);
                } else {
                    actions.extend(decoded);
                }
            }
            if let Some(names) = rule.get("queries").and_then(Value::as_array) {
                for name in names {
                    let name = name.as_str().map(str::to_string).unwrap_or_else(|| name.to_string());
                    let b = queries.get(&name).ok_or(NetkatError::UnknownQuery(name))?;
                    actions.push(Action::Bucket((*b).clone()));
                }
            }
            switch_rules.push((priority, Rule::new(matches, actions)));
        }
        switch_rules.sort_by(|a, b| b.0.cmp(&a.0));
        rules.extend(switch_rules.into_iter().map(|(_, r)| r));
    }
    rules.push(Rule::new(Match::identity(), vec![]));
    Ok(Classifier::new(rules))
}
