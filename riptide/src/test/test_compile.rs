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

//! Test the compiler from policies to classifiers

use crate::buckets::{BucketRef, CountBucket, FwdBucket};
use crate::classifier::{Action, Classifier, ClassifierError, Match, Rule};
use crate::compile::{compile, CompileError, Compiler};
use crate::packet::{HeaderValue, DSTIP, DSTPORT, OUTPORT, SWITCH};
use crate::policy::*;
use crate::vheader::VirtualFieldRegistry;
use lazy_static::lazy_static;
use maplit::btreemap;

lazy_static! {
    static ref H1: HeaderValue = HeaderValue::ip("10.0.0.1").unwrap();
    static ref H2: HeaderValue = HeaderValue::ip("10.0.0.2").unwrap();
}

#[test]
fn test_primitives() {
    assert_eq!(compile(&Policy::Identity), Ok(Classifier::identity()));
    assert_eq!(compile(&Policy::Drop), Ok(Classifier::drop()));
    assert_eq!(compile(&fwd(3)), Ok(Classifier::single(Action::fwd(3))));
    assert_eq!(compile(&Policy::Controller), Ok(Classifier::single(Action::Controller)));
    assert_eq!(compile(&modify(btreemap! {})), Ok(Classifier::identity()));
    assert_eq!(
        compile(&match_field(SWITCH, 1u32)),
        Ok(Classifier::filter(Match::identity().with(SWITCH, 1u32)))
    );
}

#[test]
fn test_negation() {
    let c = compile(&negate(match_field(DSTPORT, 80u32))).unwrap();
    assert_eq!(
        c.rules,
        vec![
            Rule::new(Match::identity().with(DSTPORT, 80u32), vec![]),
            Rule::new(Match::identity(), vec![Action::Identity]),
        ]
    );
}

#[test]
fn test_negate_non_filter() {
    let result = compile(&negate(fwd(1)));
    assert!(matches!(result, Err(CompileError::Classifier(ClassifierError::NegateNonFilter(_)))));
    let result = compile(&(match_field(SWITCH, 1u32) - fwd(1)));
    assert!(matches!(result, Err(CompileError::Classifier(ClassifierError::NegateNonFilter(_)))));
}

#[test]
fn test_modify_then_match() {
    let p = modify_field(DSTIP, H1.clone()) >> match_field(DSTIP, H1.clone()) >> fwd(1);
    let c = compile(&p).unwrap();
    assert_eq!(
        c.rules,
        vec![Rule::new(
            Match::identity(),
            vec![Action::Modify(btreemap! {
                DSTIP.to_string() => H1.clone(),
                OUTPORT.to_string() => HeaderValue::Int(1),
            })]
        )]
    );

    // rewriting to another address never passes the filter
    let p = modify_field(DSTIP, H2.clone()) >> match_field(DSTIP, H1.clone()) >> fwd(1);
    assert_eq!(compile(&p), Ok(Classifier::drop()));
}

#[test]
fn test_empty_sequential() {
    assert_eq!(compile(&Policy::Sequential(vec![])), Err(CompileError::EmptySequential));
    assert_eq!(compile(&Policy::Intersection(vec![])), Err(CompileError::EmptySequential));
    assert_eq!(compile(&Policy::Parallel(vec![])), Ok(Classifier::drop()));
}

#[test]
fn test_totality() {
    let policies = vec![
        if_(match_field(DSTIP, H1.clone()), fwd(1), fwd(2)),
        xfwd(2),
        match_modify(DSTPORT, 80u32, 8080u32),
        (match_field(SWITCH, 1u32) | match_field(SWITCH, 2u32)) & !match_field(DSTPORT, 22u32),
        (match_field(DSTIP, H1.clone()) >> fwd(1)) + (match_field(DSTIP, H2.clone()) >> fwd(2)),
    ];
    for p in policies.iter() {
        let c = compile(p).unwrap();
        assert!(c.is_total(), "classifier of {} is not total", p);
    }
}

#[test]
fn test_header_stacks_need_controller() {
    let controller = Ok(Classifier::single(Action::Controller));
    assert_eq!(compile(&push(btreemap! {"vswitch".to_string() => 1u32.into()})), controller);
    assert_eq!(compile(&pop(vec!["vswitch".to_string()])), controller);
    assert_eq!(
        compile(&move_fields(vec![("vswitch".to_string(), SWITCH.to_string())])),
        controller
    );
}

#[test]
fn test_buckets() {
    let fwd_bucket = FwdBucket::new();
    let count_bucket = CountBucket::new();
    assert_eq!(compile(&bucket(fwd_bucket)), Ok(Classifier::single(Action::Controller)));
    assert_eq!(
        compile(&bucket(count_bucket.clone())),
        Ok(Classifier::single(Action::Bucket(BucketRef::from(count_bucket))))
    );
}

#[test]
fn test_virtual_fields_compilable_with_registry() {
    let p = modify_field("service", 2u32);
    assert_eq!(compile(&p), Ok(Classifier::single(Action::Controller)));

    let mut registry = VirtualFieldRegistry::new();
    registry.register("service", vec![HeaderValue::Int(1), HeaderValue::Int(2)], 0).unwrap();
    let c = Compiler::new().with_registry(&registry).compile(&p).unwrap();
    assert_eq!(c, Classifier::single(Action::modify("service", 2u32)));
}

#[test]
fn test_recursive_policy() {
    let d = DynamicPolicy::new("loop", Policy::Drop);
    d.set_policy(match_field(SWITCH, 1u32) >> recurse(&d));
    assert_eq!(compile(&Policy::from(d.clone())), Err(CompileError::RecursivePolicy(d.id())));
}

#[test]
fn test_dangling_recursion() {
    let d = DynamicPolicy::new("gone", fwd(1));
    let id = d.id();
    let p = recurse(&d);
    drop(d);
    assert_eq!(compile(&p), Err(CompileError::DanglingRecursion(id)));
}

#[test]
fn test_recurse_uses_memoized_classifier() {
    let d = DynamicPolicy::new("cell", fwd(1));
    compile(&Policy::from(d.clone())).unwrap();
    d.store_classifier(Classifier::single(Action::fwd(7)));
    assert_eq!(compile(&recurse(&d)), Ok(Classifier::single(Action::fwd(7))));
}

#[test]
fn test_memoization() {
    let d = DynamicPolicy::new("cell", fwd(1));
    let p = match_field(SWITCH, 1u32) >> Policy::from(d.clone());
    assert!(d.cached_classifier().is_none());

    let first = compile(&p).unwrap();
    assert_eq!(d.cached_classifier(), Some(Classifier::single(Action::fwd(1))));

    // a stale memo is used unless the compiler is forced
    d.store_classifier(Classifier::single(Action::fwd(9)));
    assert_ne!(compile(&p).unwrap(), first);
    assert_eq!(Compiler::new().forced(true).compile(&p), Ok(first.clone()));
    assert_eq!(d.cached_classifier(), Some(Classifier::single(Action::fwd(1))));

    // a new policy drops the memo
    d.set_policy(fwd(2));
    assert!(d.cached_classifier().is_none());
    assert_ne!(compile(&p).unwrap(), first);
}

#[test]
fn test_forced_compiles_each_cell_once() {
    let d = DynamicPolicy::new("cell", fwd(1));
    d.store_classifier(Classifier::single(Action::fwd(9)));
    let p = Policy::from(d.clone()) >> Policy::from(d.clone());
    let c = Compiler::new().forced(true).compile(&p).unwrap();
    assert_eq!(c, Classifier::single(Action::fwd(1)));
    assert_eq!(d.cached_classifier(), Some(Classifier::single(Action::fwd(1))));
}
