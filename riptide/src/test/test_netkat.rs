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
//! Test the NetKAT request encoder and the response decoder

use crate::buckets::{BucketRef, CountBucket, FwdBucket};
use crate::classifier::{Action, Match, Rule};
use crate::netkat::*;
use crate::network::PortType;
use crate::packet::*;
use crate::policy::*;
use crate::runtime::{CompileBackend, RecordingDriver, Runtime, RuntimeConfig, RuntimeError};
use maplit::btreemap;
use serde_json::{json, Value};

fn pred_test(header: &str, value: Value) -> Value {
    json!({ "type": "test", "header": header, "value": value })
}

#[test]
fn test_request_structure() {
    let p = match_field(SWITCH, 1u32) >> fwd(2);
    assert_eq!(
        to_request(&p, 2).unwrap(),
        json!({ "type": "seq", "pols": [
            { "type": "filter", "pred": { "type": "or", "preds": [pred_test("switch", json!(1)), pred_test("switch", json!(2))] } },
            { "type": "seq", "pols": [
                { "type": "filter", "pred": { "type": "and", "preds": [pred_test("switch", json!(1))] } },
                { "type": "mod", "header": "location", "value": { "type": "physical", "port": 2 } }
            ] }
        ] })
    );
    // without switches, only the body is sent
    assert_eq!(
        to_request(&fwd(3), 0).unwrap(),
        json!({ "type": "mod", "header": "location", "value": { "type": "physical", "port": 3 } })
    );
}

#[test]
fn test_request_if() {
    let p = if_(match_field(INPORT, 1u32), fwd(2), Policy::Drop);
    let c = json!({ "type": "and", "preds": [pred_test("location", json!({ "type": "physical", "port": 1 }))] });
    assert_eq!(
        to_request(&p, 0).unwrap(),
        json!({ "type": "union", "pols": [
            { "type": "seq", "pols": [
                { "type": "filter", "pred": c },
                { "type": "mod", "header": "location", "value": { "type": "physical", "port": 2 } }
            ] },
            { "type": "seq", "pols": [
                { "type": "filter", "pred": { "type": "neg", "pred": c } },
                { "type": "filter", "pred": { "type": "false" } }
            ] }
        ] })
    );
}

#[test]
fn test_transport_prerequisites() {
    let request = to_request(&match_field(DSTPORT, 80u32), 0).unwrap();
    let and = |proto: u32| {
        json!({ "type": "and", "preds": [
            pred_test("tcpdstport", json!(80)),
            pred_test("ethtype", json!(ETH_TYPE_IP)),
            pred_test("ipproto", json!(proto)),
        ] })
    };
    assert_eq!(
        request,
        json!({ "type": "filter", "pred": { "type": "or", "preds": [and(IP_PROTO_TCP), and(IP_PROTO_UDP)] } })
    );

    // an explicit protocol only adds the ethertype
    let m = Match::identity().with(DSTPORT, 22u32).with(PROTOCOL, IP_PROTO_TCP);
    assert_eq!(
        to_request(&filter(m), 0).unwrap(),
        json!({ "type": "filter", "pred": { "type": "and", "preds": [
            pred_test("tcpdstport", json!(22)),
            pred_test("ethtype", json!(ETH_TYPE_IP)),
            pred_test("ipproto", json!(IP_PROTO_TCP)),
        ] } })
    );
}

#[test]
fn test_ip_prerequisites() {
    let request = to_request(&match_field(SRCIP, HeaderValue::ip("10.0.0.0/8").unwrap()), 0).unwrap();
    let and = |ethtype: u32| {
        json!({ "type": "and", "preds": [
            pred_test("ethtype", json!(ethtype)),
            pred_test("ip4src", json!({ "addr": "10.0.0.0", "mask": 8 })),
        ] })
    };
    assert_eq!(
        request,
        json!({ "type": "filter", "pred": { "type": "or", "preds": [and(ETH_TYPE_IP), and(ETH_TYPE_ARP)] } })
    );
}

#[test]
fn test_request_modify() {
    let p = modify(btreemap! {
        VLAN_ID.to_string() => HeaderValue::Absent,
        VLAN_PCP.to_string() => HeaderValue::Absent,
        VLAN_OFFSET.to_string() => HeaderValue::Int(4),
    });
    assert_eq!(
        to_request(&p, 0).unwrap(),
        json!({ "type": "seq", "pols": [
            { "type": "mod", "header": "vlan", "value": VLAN_NONE_VALUE },
            { "type": "mod", "header": "vlanpcp", "value": VLAN_PCP_NONE_VALUE },
        ] })
    );
}

#[test]
fn test_request_buckets() {
    let f = FwdBucket::new();
    let c = CountBucket::new();
    let request = to_request(&(bucket(f.clone()) + bucket(c.clone())), 0).unwrap();
    assert_eq!(
        request,
        json!({ "type": "union", "pols": [
            { "type": "mod", "header": "location", "value": { "type": "pipe", "name": f.id().to_string() } },
            { "type": "mod", "header": "location", "value": { "type": "query", "name": c.id().to_string() } },
        ] })
    );
}

#[test]
fn test_request_errors() {
    assert!(matches!(to_request(&negate(fwd(1)), 0), Err(NetkatError::Unsupported(_))));
    assert_eq!(
        to_request(&match_field("service", 1u32), 0),
        Err(NetkatError::UnknownHeader("service".to_string()))
    );
    assert!(matches!(
        to_request(&match_field(SRCIP, 7u32), 0),
        Err(NetkatError::InvalidValue(_, _))
    ));
    let d = DynamicPolicy::new("loop", Policy::Identity);
    d.set_policy(fwd(1) >> recurse(&d));
    assert!(matches!(to_request(&Policy::from(d), 0), Err(NetkatError::Unsupported(_))));
}

#[test]
fn test_decode_response() {
    let count = CountBucket::new();
    let buckets = vec![BucketRef::from(count.clone())];
    let response = json!([{ "switch_id": 1, "tbl": [
        {
            "priority": 10,
            "pattern": { "inPort": 1, "tpDst": null },
            "action": [[["Output", { "type": "physical", "port": 2 }]]]
        },
        {
            "priority": 20,
            "pattern": { "dlTyp": 2048, "nwSrc": { "addr": "10.0.0.0", "mask": 8 } },
            "action": [[
                ["Modify", ["SetVlan", 5]],
                ["Modify", ["SetVlanPcp", 1]],
                ["Output", { "type": "controller" }]
            ]]
        },
        {
            "priority": 5,
            "pattern": {},
            "action": [],
            "queries": [count.id().to_string()]
        }
    ] }]);
    let c = from_response(&response, &buckets).unwrap();
    let at_1 = Match::identity().with(SWITCH, 1u32);
    assert_eq!(c.rules.len(), 4);
    assert_eq!(
        c.rules[0],
        Rule::new(
            at_1.clone().with(ETHTYPE, ETH_TYPE_IP).with(SRCIP, HeaderValue::ip("10.0.0.0/8").unwrap()),
            vec![
                Action::Controller,
                Action::Modify(btreemap! {
                    VLAN_ID.to_string() => HeaderValue::Int(5),
                    VLAN_PCP.to_string() => HeaderValue::Int(1),
                })
            ]
        )
    );
    assert_eq!(c.rules[1], Rule::new(at_1.clone().with(INPORT, 1u32), vec![Action::fwd(2)]));
    assert_eq!(c.rules[2], Rule::new(at_1, vec![Action::Bucket(BucketRef::from(count))]));
    assert_eq!(c.rules[3], Rule::new(Match::identity(), vec![]));
}

#[test]
fn test_decode_vlan() {
    let decode = |pattern: Value, action: Value| {
        from_response(
            &json!([{ "switch_id": 3, "tbl": [{ "priority": 1, "pattern": pattern, "action": [action] }] }]),
            &[],
        )
    };

    // both sentinels stand for a missing tag
    let c = decode(json!({ "dlVlan": VLAN_NONE_VALUE, "dlVlanPcp": VLAN_PCP_NONE_VALUE }), json!([])).unwrap();
    assert_eq!(c.rules[0].matches.get(VLAN_ID), Some(&HeaderValue::Absent));
    assert_eq!(c.rules[0].matches.get(VLAN_PCP), Some(&HeaderValue::Absent));
    // an empty action list passes the packet unchanged
    assert_eq!(c.rules[0].actions, vec![Action::Identity]);

    // rewriting one half keeps the matched value of the other
    let c = decode(json!({ "dlVlan": 3, "dlVlanPcp": 2 }), json!([["Modify", ["SetVlan", 4]]])).unwrap();
    assert_eq!(
        c.rules[0].actions,
        vec![Action::Modify(btreemap! {
            VLAN_ID.to_string() => HeaderValue::Int(4),
            VLAN_PCP.to_string() => HeaderValue::Int(2),
        })]
    );

    assert!(matches!(decode(json!({ "dlVlan": 3 }), json!([])), Err(NetkatError::OneSidedVlan(_))));
    assert!(matches!(
        decode(json!({}), json!([["Modify", ["SetVlan", 4]]])),
        Err(NetkatError::OneSidedVlan(_))
    ));
    assert!(matches!(
        decode(json!({}), json!([["Output", { "type": "inport" }]])),
        Ok(c) if c.rules[0].actions == vec![Action::fwd(OFPP_IN_PORT)]
    ));
}

#[test]
fn test_decode_errors() {
    assert!(matches!(from_response(&json!({}), &[]), Err(NetkatError::Malformed(_))));
    assert!(matches!(from_response(&json!([{ "tbl": [] }]), &[]), Err(NetkatError::Malformed(_))));
    let unknown_query = json!([{ "switch_id": 1, "tbl": [
        { "priority": 1, "pattern": {}, "action": [], "queries": ["999999"] }
    ] }]);
    assert_eq!(
        from_response(&unknown_query, &[]),
        Err(NetkatError::UnknownQuery("999999".to_string()))
    );
    let unknown_field = json!([{ "switch_id": 1, "tbl": [
        { "priority": 1, "pattern": { "mplsLabel": 3 }, "action": [] }
    ] }]);
    assert_eq!(
        from_response(&unknown_field, &[]),
        Err(NetkatError::UnknownHeader("mplsLabel".to_string()))
    );
}

struct Canned(Value);

impl CompileService for Canned {
    fn compile(&self, _request: &Value) -> Result<(Value, f64), NetkatError> {
        Ok((self.0.clone(), 0.01))
    }
}

struct Broken;

impl CompileService for Broken {
    fn compile(&self, _request: &Value) -> Result<(Value, f64), NetkatError> {
        Err(NetkatError::Service("connection refused".to_string()))
    }
}

fn netkat_runtime() -> (Runtime, RecordingDriver) {
    let config = RuntimeConfig { compile_backend: CompileBackend::Netkat, ..Default::default() };
    let driver = RecordingDriver::new();
    let response = json!([{ "switch_id": 1, "tbl": [
        { "priority": 1, "pattern": { "inPort": 1 }, "action": [[["Output", { "type": "physical", "port": 2 }]]] }
    ] }]);
    let rt = Runtime::new(config, driver.clone()).with_compile_service(Canned(response));
    (rt, driver)
}

#[test]
fn test_runtime_backend() {
    let (rt, _driver) = netkat_runtime();
    rt.handle_switch_join(1).unwrap();
    rt.handle_port_join(1, 1, true, true, PortType::Physical).unwrap();
    rt.set_policy(match_field(INPORT, 1u32) >> fwd(2)).unwrap();
    let installed = rt.installed();
    let rules = installed[&0].switch_rules(1);
    assert_eq!(rules.len(), 2);
    assert_eq!(rules[0].actions, vec![Action::fwd(2)]);
    assert!(rules[1].actions.is_empty());
}

#[test]
fn test_runtime_backend_errors() {
    let config = RuntimeConfig { compile_backend: CompileBackend::Netkat, ..Default::default() };
    let rt = Runtime::new(config.clone(), RecordingDriver::new());
    assert_eq!(rt.set_policy(fwd(1)), Err(RuntimeError::NoCompileService));

    let rt = Runtime::new(config, RecordingDriver::new()).with_compile_service(Broken);
    assert_eq!(
        rt.set_policy(fwd(1)),
        Err(RuntimeError::Netkat(NetkatError::Service("connection refused".to_string())))
    );
    assert!(rt.installed().is_empty());
}
