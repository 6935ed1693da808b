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

//! Test the classifier algebra

use crate::classifier::compose::{negate, parallel, sequential};
use crate::classifier::{Action, Classifier, ClassifierError, Match, Rule, Sink, Trace};
use crate::packet::{HeaderValue, IpPrefix, Packet, DSTIP, INPORT, OUTPORT, SRCIP, SWITCH};
use lazy_static::lazy_static;
use maplit::btreemap;

lazy_static! {
    static ref NET: HeaderValue = HeaderValue::ip("10.0.0.0/24").unwrap();
    static ref H1: HeaderValue = HeaderValue::ip("10.0.0.1").unwrap();
    static ref H5: HeaderValue = HeaderValue::ip("10.0.0.5").unwrap();
    static ref OTHER: HeaderValue = HeaderValue::ip("10.0.1.1").unwrap();
}

fn pkt(dst: &HeaderValue) -> Packet {
    Packet::new().with(SWITCH, 1u32).with(INPORT, 1u32).modify(DSTIP, dst.clone())
}

fn fwd_rule(m: Match, port: u32) -> Rule {
    Rule::new(m, vec![Action::fwd(port)])
}

#[test]
fn test_match_intersect() {
    let net = Match::identity().with(DSTIP, NET.clone());
    let host = Match::identity().with(DSTIP, H5.clone());
    let other = Match::identity().with(DSTIP, OTHER.clone());

    // the more specific prefix wins, independent of the order
    assert_eq!(net.intersect(&host), Some(host.clone()));
    assert_eq!(host.intersect(&net), Some(host.clone()));
    // disjoint prefixes
    assert_eq!(net.intersect(&other), None);
    // different fields are combined
    let sw = Match::identity().with(SWITCH, 1u32);
    assert_eq!(sw.intersect(&host), Some(host.clone().with(SWITCH, 1u32)));
    // identity is neutral
    assert_eq!(Match::identity().intersect(&host), Some(host));
}

#[test]
fn test_match_covers() {
    let net = Match::identity().with(DSTIP, NET.clone());
    let host = Match::identity().with(DSTIP, H5.clone()).with(SWITCH, 1u32);

    assert!(net.covers(&host));
    assert!(!host.covers(&net));
    assert!(Match::identity().covers(&net));
    assert!(!net.covers(&Match::identity()));
}

#[test]
fn test_match_eval_absent() {
    let m = Match::identity().with(SRCIP, HeaderValue::Absent);
    assert!(m.eval(&pkt(&H1)));
    assert!(!m.eval(&pkt(&H1).modify(SRCIP, H1.clone())));
}

#[test]
fn test_filter_and_drop() {
    let c = Classifier::filter(Match::identity().with(DSTIP, NET.clone()));
    assert_eq!(c.len(), 2);
    assert!(c.is_total());

    let p = pkt(&H5);
    assert_eq!(c.eval(&p), Ok(vec![p.clone()].into_iter().collect()));
    assert!(c.eval(&pkt(&OTHER)).unwrap().is_empty());

    assert!(Classifier::drop().eval(&p).unwrap().is_empty());
    assert_eq!(Classifier::filter(Match::identity()), Classifier::identity());
}

#[test]
fn test_not_total() {
    let c = Classifier::new(vec![fwd_rule(Match::identity().with(DSTIP, NET.clone()), 1)]);
    assert!(!c.is_total());
    assert_eq!(c.eval(&pkt(&OTHER)), Err(ClassifierError::NotTotal(pkt(&OTHER))));
}

#[test]
fn test_negate() {
    let c = Classifier::filter(Match::identity().with(SRCIP, H1.clone()));
    let n = negate(&c).unwrap();
    assert_eq!(
        n,
        Classifier::new(vec![
            Rule::new(Match::identity().with(SRCIP, H1.clone()), vec![]),
            Rule::new(Match::identity(), vec![Action::Identity]),
        ])
    );

    let not_filter = Classifier::single(Action::fwd(1));
    assert!(matches!(negate(&not_filter), Err(ClassifierError::NegateNonFilter(_))));
}

#[test]
fn test_parallel_shadow_removal() {
    let c1 = Classifier::new(vec![
        fwd_rule(Match::identity().with(DSTIP, NET.clone()), 1),
        Rule::new(Match::identity(), vec![]),
    ]);
    let c2 = Classifier::new(vec![
        fwd_rule(Match::identity().with(DSTIP, H5.clone()), 2),
        Rule::new(Match::identity(), vec![]),
    ]);
    let c = parallel(&c1, &c2);

    assert_eq!(c.len(), 3);
    assert_eq!(c.rules[0].matches, Match::identity().with(DSTIP, H5.clone()));
    assert_eq!(c.rules[0].actions, vec![Action::fwd(1), Action::fwd(2)]);
    assert_eq!(c.rules[1].matches, Match::identity().with(DSTIP, NET.clone()));
    assert_eq!(c.rules[2].matches, Match::identity());
    // provenance of the crossed rule
    assert_eq!(c.rules[0].parents().len(), 2);
}

#[test]
fn test_parallel_drop_neutral() {
    let c = Classifier::new(vec![
        fwd_rule(Match::identity().with(DSTIP, NET.clone()), 1),
        Rule::new(Match::identity(), vec![]),
    ]);
    let p = parallel(&c, &Classifier::drop());
    for dst in [H1.clone(), H5.clone(), OTHER.clone()].iter() {
        assert_eq!(p.eval(&pkt(dst)), c.eval(&pkt(dst)));
    }
}

#[test]
fn test_sequential_modify_match() {
    let modify = Classifier::single(Action::modify(DSTIP, H1.clone()));
    let filter = Classifier::filter(Match::identity().with(DSTIP, H1.clone()));
    let fwd = Classifier::single(Action::fwd(1));
    let c = &(&modify >> &filter) >> &fwd;

    assert_eq!(
        c,
        Classifier::new(vec![Rule::new(
            Match::identity(),
            vec![Action::Modify(btreemap! {
                DSTIP.to_string() => H1.clone(),
                OUTPORT.to_string() => HeaderValue::Int(1),
            })]
        )])
    );
}

#[test]
fn test_sequential_modify_mismatch() {
    // a packet rewritten to H5 never passes a filter on H1
    let modify = Classifier::single(Action::modify(DSTIP, H5.clone()));
    let filter = Classifier::filter(Match::identity().with(DSTIP, H1.clone()));
    let c = sequential(&modify, &filter);
    assert_eq!(c, Classifier::drop());
}

#[test]
fn test_sequential_drop_absorbs() {
    let fwd = Classifier::single(Action::fwd(2));
    assert_eq!(sequential(&Classifier::drop(), &fwd), Classifier::drop());
    assert_eq!(sequential(&fwd, &Classifier::drop()), Classifier::drop());
}

#[test]
fn test_remove_shadowed() {
    let host = Match::identity().with(DSTIP, H5.clone());
    let net = Match::identity().with(DSTIP, NET.clone());
    let c = Classifier::new(vec![
        fwd_rule(net.clone(), 1),
        fwd_rule(host.clone(), 2),
        fwd_rule(net.clone(), 3),
        Rule::new(Match::identity(), vec![]),
    ]);
    let exact = c.clone().remove_shadowed_exact_single();
    assert_eq!(exact.len(), 3);
    let cover = c.optimize();
    assert_eq!(cover, Classifier::new(vec![fwd_rule(net, 1), Rule::new(Match::identity(), vec![])]));
}

#[test]
fn test_controller_and_bucket_trace() {
    let c = Classifier::new(vec![Rule::new(
        Match::identity(),
        vec![Action::Controller, Action::fwd(2)],
    )]);
    let mut trace = Trace::new();
    let out = c.eval_traced(&pkt(&H1), &mut trace).unwrap();
    assert_eq!(out.len(), 1);
    assert_eq!(trace, vec![(Sink::Controller, pkt(&H1))]);
}

#[test]
fn test_ip_prefix() {
    let p: IpPrefix = "10.0.0.17/24".parse().unwrap();
    assert_eq!(p.to_string(), "10.0.0.0/24");
    assert_eq!(p.prefix_len(), 24);
    assert!("10.0.0.1/33".parse::<IpPrefix>().is_err());
    assert!("10.0.0".parse::<IpPrefix>().is_err());
}
