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

//! # Policy Language
//!
//! A [`Policy`] is a function from a located packet to a set of located packets. Policies are
//! built from primitive filters (`identity`, `drop`, `match`), primitive actions (`modify`,
//! `Controller`, buckets) and combinators (parallel and sequential composition). Filters are
//! closed under negation, union, intersection and difference.
//!
//! ```rust
//! use riptide::policy::*;
//! use riptide::classifier::Match;
//! use riptide::packet::{HeaderValue, Packet, DSTIP, OUTPORT};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let to_h2 = filter(Match::identity().with(DSTIP, HeaderValue::ip("10.0.0.2")?));
//!     let to_h3 = filter(Match::identity().with(DSTIP, HeaderValue::ip("10.0.0.3")?));
//!     let policy = (to_h2 >> fwd(2)) + (to_h3 >> fwd(3));
//!
//!     let pkt = Packet::new().with(DSTIP, HeaderValue::ip("10.0.0.2")?);
//!     let out = policy.eval(&pkt);
//!     assert_eq!(out.len(), 1);
//!     assert!(out.iter().all(|p| p.get_int(OUTPORT) == Some(2)));
//!     Ok(())
//! }
//! ```
//!
//! Policies whose behavior changes at runtime are [`DynamicPolicy`] cells. Assigning a new
//! policy to a cell notifies the runtime, which recompiles and updates the switches.

mod convenience;
mod dynamic;
mod eval;
mod printer;

pub use convenience::{
    breakpoint, dstip_in, field_in, pkt_print, str_print, switch_in, topo_print,
};
pub use dynamic::{
    egress_network, flood, ingress_network, propagate_network, DynamicPolicy, NetworkHandler,
    RecurseRef,
};

use crate::buckets::BucketRef;
use crate::classifier::{Classifier, Match};
use crate::compile::CompileError;
use crate::packet::{HeaderMap, HeaderValue, INPORT, OUTPORT};

use std::collections::HashSet;
use std::ops::{Add, BitAnd, BitOr, Not, Shr, Sub};

/// # Policy
/// Closed sum of all policy constructs.
#[derive(Debug, Clone, PartialEq)]
pub enum Policy {
    /// Pass every packet through unchanged
    Identity,
    /// Drop every packet
    Drop,
    /// Pass packets matching all fields
    Match(Match),
    /// Replace the given fields
    Modify(HeaderMap),
    /// Send the packet to the controller
    Controller,
    /// Deliver the packet to a bucket
    Bucket(BucketRef),
    /// Push values on the header stacks
    Push(HeaderMap),
    /// Pop the top of the named header stacks
    Pop(Vec<String>),
    /// Move the top of each source header onto the destination header, as `(dst, src)`.
    Move(Vec<(String, String)>),
    /// Complement of a filter
    Negate(Box<Policy>),
    /// Union of filters
    Union(Vec<Policy>),
    /// Intersection of filters
    Intersection(Vec<Policy>),
    /// Packets passing the first filter, but not the second one
    Difference(Box<Policy>, Box<Policy>),
    /// Union of the outputs of all policies
    Parallel(Vec<Policy>),
    /// Output of each policy fed into the next one
    Sequential(Vec<Policy>),
    /// `If(pred, t, f)`: apply `t` to packets passing `pred`, and `f` to all others.
    If(Box<Policy>, Box<Policy>, Box<Policy>),
    /// Forward out of a port
    Fwd(u32),
    /// Forward out of a port, unless the packet arrived on it.
    XFwd(u32),
    /// `MatchModify(f, v1, v2)`: rewrite field `f` from `v1` to `v2`, pass everything else.
    MatchModify(String, HeaderValue, HeaderValue),
    /// Cell holding a policy that may change at runtime
    Dynamic(DynamicPolicy),
    /// Weak reference to an enclosing dynamic cell
    Recurse(RecurseRef),
}

/// Filter passing packets that match all fields
pub fn filter(m: Match) -> Policy {
    Policy::Match(m)
}

/// Filter on a single field
pub fn match_field<V: Into<HeaderValue>>(field: &str, value: V) -> Policy {
    Policy::Match(Match::identity().with(field, value))
}

/// Replace the given fields
pub fn modify(fields: HeaderMap) -> Policy {
    Policy::Modify(fields)
}

/// Replace a single field
pub fn modify_field<V: Into<HeaderValue>>(field: &str, value: V) -> Policy {
    let mut fields = HeaderMap::new();
    fields.insert(field.to_string(), value.into());
    Policy::Modify(fields)
}

/// Forward out of a port
pub fn fwd(port: u32) -> Policy {
    Policy::Fwd(port)
}

/// Forward out of a port, unless the packet arrived on it.
pub fn xfwd(port: u32) -> Policy {
    Policy::XFwd(port)
}

/// Apply `t` to packets passing `pred`, and `f` to all others.
pub fn if_(pred: Policy, t: Policy, f: Policy) -> Policy {
    Policy::If(Box::new(pred), Box::new(t), Box::new(f))
}

/// Parallel composition. The empty composition is `drop`.
pub fn parallel(policies: Vec<Policy>) -> Policy {
    if policies.is_empty() {
        Policy::Drop
    } else {
        Policy::Parallel(policies)
    }
}

/// Sequential composition. The empty composition is `identity`.
pub fn sequential(policies: Vec<Policy>) -> Policy {
    if policies.is_empty() {
        Policy::Identity
    } else {
        Policy::Sequential(policies)
    }
}

/// Union of filters. The empty union is `drop`.
pub fn union(filters: Vec<Policy>) -> Policy {
    if filters.is_empty() {
        Policy::Drop
    } else {
        Policy::Union(filters)
    }
}

/// Intersection of filters. The empty intersection is `identity`.
pub fn intersection(filters: Vec<Policy>) -> Policy {
    if filters.is_empty() {
        Policy::Identity
    } else {
        Policy::Intersection(filters)
    }
}

/// Complement of a filter
pub fn negate(pred: Policy) -> Policy {
    Policy::Negate(Box::new(pred))
}

/// Packets passing `p` but not `q`
pub fn difference(p: Policy, q: Policy) -> Policy {
    Policy::Difference(Box::new(p), Box::new(q))
}

/// Rewrite field `field` from `from` to `to`, pass all other packets unchanged.
pub fn match_modify<V: Into<HeaderValue>>(field: &str, from: V, to: V) -> Policy {
    Policy::MatchModify(field.to_string(), from.into(), to.into())
}

/// Reference to a dynamic cell from within its own policy
pub fn recurse(cell: &DynamicPolicy) -> Policy {
    Policy::Recurse(cell.downgrade())
}

/// Push values on the header stacks
pub fn push(fields: HeaderMap) -> Policy {
    Policy::Push(fields)
}

/// Pop the top of the header stacks
pub fn pop(fields: Vec<String>) -> Policy {
    Policy::Pop(fields)
}

/// Move the top of each `src` header onto the `dst` header, given as `(dst, src)` pairs.
pub fn move_fields(pairs: Vec<(String, String)>) -> Policy {
    Policy::Move(pairs)
}

/// Deliver packets to a bucket
pub fn bucket<B: Into<BucketRef>>(b: B) -> Policy {
    Policy::Bucket(b.into())
}

impl Policy {
    /// Compile the policy into a classifier, using the memoized classifiers of dynamic cells.
    pub fn compile(&self) -> Result<Classifier, CompileError> {
        crate::compile::compile(self)
    }

    /// Returns `true` if the policy only filters, and never modifies packets.
    pub fn is_filter(&self) -> bool {
        match self {
            Self::Identity | Self::Drop | Self::Match(_) => true,
            Self::Negate(_) | Self::Union(_) | Self::Intersection(_) | Self::Difference(_, _) => {
                true
            }
            Self::Parallel(ps) | Self::Sequential(ps) => ps.iter().all(|p| p.is_filter()),
            Self::Dynamic(d) => d.policy().is_filter(),
            _ => false,
        }
    }

    /// Walk the policy tree in pre-order. The current policy of every dynamic cell is visited
    /// once.
    pub fn walk<F: FnMut(&Policy)>(&self, f: &mut F) {
        self.walk_inner(f, &mut HashSet::new())
    }

    fn walk_inner<F: FnMut(&Policy)>(&self, f: &mut F, seen: &mut HashSet<usize>) {
        f(self);
        match self {
            Self::Negate(p) => p.walk_inner(f, seen),
            Self::Difference(p, q) => {
                p.walk_inner(f, seen);
                q.walk_inner(f, seen);
            }
            Self::If(p, t, e) => {
                p.walk_inner(f, seen);
                t.walk_inner(f, seen);
                e.walk_inner(f, seen);
            }
            Self::Union(ps) | Self::Intersection(ps) | Self::Parallel(ps) | Self::Sequential(ps) => {
                ps.iter().for_each(|p| p.walk_inner(f, seen))
            }
            Self::Dynamic(d) => {
                if seen.insert(d.id()) {
                    d.policy().walk_inner(f, seen)
                }
            }
            _ => {}
        }
    }

    /// Returns all buckets referenced by the policy
    pub fn buckets(&self) -> Vec<BucketRef> {
        let mut result: Vec<BucketRef> = Vec::new();
        self.walk(&mut |p| {
            if let Policy::Bucket(b) = p {
                if !result.contains(b) {
                    result.push(b.clone());
                }
            }
        });
        result
    }

    /// Returns all dynamic cells of the policy
    pub fn dynamics(&self) -> Vec<DynamicPolicy> {
        let mut result: Vec<DynamicPolicy> = Vec::new();
        self.walk(&mut |p| {
            if let Policy::Dynamic(d) = p {
                if !result.contains(d) {
                    result.push(d.clone());
                }
            }
        });
        result
    }

    /// Forget the memoized classifiers of all dynamic cells.
    pub fn invalidate_classifier(&self) {
        for d in self.dynamics() {
            d.invalidate_classifier();
        }
    }

    /// `xfwd(port)` expressed as `~match(inport=port) >> fwd(port)`
    pub(crate) fn xfwd_expansion(port: u32) -> Policy {
        negate(match_field(INPORT, port)) >> modify_field(OUTPORT, port)
    }
}

impl Add for Policy {
    type Output = Policy;

    fn add(self, other: Policy) -> Policy {
        match self {
            Policy::Parallel(mut ps) => {
                ps.push(other);
                Policy::Parallel(ps)
            }
            p => Policy::Parallel(vec![p, other]),
        }
    }
}

impl Shr for Policy {
    type Output = Policy;

    fn shr(self, other: Policy) -> Policy {
        match self {
            Policy::Sequential(mut ps) => {
                ps.push(other);
                Policy::Sequential(ps)
            }
            p => Policy::Sequential(vec![p, other]),
        }
    }
}

impl BitAnd for Policy {
    type Output = Policy;

    fn bitand(self, other: Policy) -> Policy {
        match self {
            Policy::Intersection(mut ps) => {
                ps.push(other);
                Policy::Intersection(ps)
            }
            p => Policy::Intersection(vec![p, other]),
        }
    }
}

impl BitOr for Policy {
    type Output = Policy;

    fn bitor(self, other: Policy) -> Policy {
        match self {
            Policy::Union(mut ps) => {
                ps.push(other);
                Policy::Union(ps)
            }
            p => Policy::Union(vec![p, other]),
        }
    }
}

impl Not for Policy {
    type Output = Policy;

    fn not(self) -> Policy {
        negate(self)
    }
}

impl Sub for Policy {
    type Output = Policy;

    fn sub(self, other: Policy) -> Policy {
        difference(self, other)
    }
}

impl From<Match> for Policy {
    fn from(m: Match) -> Self {
        Policy::Match(m)
    }
}

impl From<BucketRef> for Policy {
    fn from(b: BucketRef) -> Self {
        Policy::Bucket(b)
    }
}

impl From<DynamicPolicy> for Policy {
    fn from(d: DynamicPolicy) -> Self {
        Policy::Dynamic(d)
    }
}
