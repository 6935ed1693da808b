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

//! # Compiler
//!
//! Translates a [`Policy`] into a total [`Classifier`], inductively over the structure of the
//! policy. Primitive policies compile to one or two rules, and the combinators use the classifier
//! algebra of [`crate::classifier::compose`].
//!
//! Modifications of fields the switches cannot realize are compiled into rules sending the packet
//! to the controller, where the policy is interpreted instead. The same holds for the header
//! stack operations `push`, `pop` and `move`, and for buckets that need to see the packet itself.
//!
//! Dynamic cells memoize their classifier. The memoized classifier is used unless the compiler
//! is *forced*, in which case every cell is compiled again (once per compiler run).

use crate::classifier::{compose, Action, Classifier, ClassifierError};
use crate::packet::{is_compilable, HeaderMap, HeaderValue};
use crate::policy::{if_, match_field, modify_field, DynamicPolicy, Policy};
use crate::vheader::{VHeaderError, VirtualFieldRegistry};

use log::*;
use std::collections::HashSet;
use thiserror::Error;

/// Error during compilation
#[derive(Error, Debug, PartialEq)]
pub enum CompileError {
    /// A sequential composition (or intersection) without any policy.
    #[error("Cannot compile an empty sequential composition")]
    EmptySequential,
    /// Error of the classifier algebra, e.g., negating a policy that is not a filter.
    #[error("Classifier error: {0}")]
    Classifier(#[from] ClassifierError),
    /// A dynamic cell is reached again while it is being compiled.
    #[error("Dynamic policy {0} recursively contains itself")]
    RecursivePolicy(usize),
    /// A `recurse` refers to a dynamic cell that no longer exists.
    #[error("Recursive reference to a dropped dynamic policy {0}")]
    DanglingRecursion(usize),
    /// Error while packing virtual fields
    #[error("Virtual header error: {0}")]
    VHeader(#[from] VHeaderError),
}

/// # Compiler
/// Holds the state of a single compilation run.
#[derive(Debug, Default)]
pub struct Compiler<'a> {
    registry: Option<&'a VirtualFieldRegistry>,
    force: bool,
    stack: Vec<usize>,
    fresh: HashSet<usize>,
}

impl<'a> Compiler<'a> {
    /// Create a compiler using memoized classifiers and no virtual fields
    pub fn new() -> Self {
        Self::default()
    }

    /// Modifications of the registered virtual fields are compilable.
    pub fn with_registry(mut self, registry: &'a VirtualFieldRegistry) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Ignore memoized classifiers, and compile every dynamic cell again.
    pub fn forced(mut self, force: bool) -> Self {
        self.force = force;
        self
    }

    fn modify_compilable(&self, fields: &HeaderMap) -> bool {
        fields
            .keys()
            .all(|f| is_compilable(f) || self.registry.map(|r| r.is_virtual(f)).unwrap_or(false))
    }

    /// Compile a policy
    pub fn compile(&mut self, policy: &Policy) -> Result<Classifier, CompileError> {
        Ok(match policy {
            Policy::Identity => Classifier::identity(),
            Policy::Drop => Classifier::drop(),
            Policy::Match(m) => Classifier::filter(m.clone()),
            Policy::Modify(fields) if fields.is_empty() => Classifier::identity(),
            Policy::Modify(fields) => {
                if self.modify_compilable(fields) {
                    Classifier::single(Action::Modify(fields.clone()))
                } else {
                    Classifier::single(Action::Controller)
                }
            }
            Policy::Controller => Classifier::single(Action::Controller),
            Policy::Bucket(b) => {
                if b.needs_controller() {
                    Classifier::single(Action::Controller)
                } else {
                    Classifier::single(Action::Bucket(b.clone()))
                }
            }
            Policy::Push(_) | Policy::Pop(_) | Policy::Move(_) => Classifier::single(Action::Controller),
            Policy::Negate(p) => compose::negate(&self.compile(p)?)?,
            Policy::Union(ps) | Policy::Parallel(ps) => {
                let mut acc: Option<Classifier> = None;
                for p in ps.iter() {
                    let c = self.compile(p)?;
                    acc = Some(match acc {
                        Some(a) => compose::parallel(&a, &c),
                        None => c,
                    });
                }
                acc.unwrap_or_else(Classifier::drop)
            }
            Policy::Intersection(ps) | Policy::Sequential(ps) => {
                let mut acc: Option<Classifier> = None;
                for p in ps.iter() {
                    let c = self.compile(p)?;
                    acc = Some(match acc {
                        Some(a) => compose::sequential(&a, &c),
                        None => c,
                    });
                }
                acc.ok_or(CompileError::EmptySequential)?
            }
            Policy::Difference(p, q) => {
                let cq = compose::negate(&self.compile(q)?)?;
                compose::sequential(&self.compile(p)?, &cq)
            }
            Policy::If(pred, t, f) => {
                let cp = self.compile(pred)?;
                let not_cp = compose::negate(&cp)?;
                let ct = compose::sequential(&cp, &self.compile(t)?);
                let cf = compose::sequential(&not_cp, &self.compile(f)?);
                compose::parallel(&ct, &cf)
            }
            Policy::Fwd(port) => Classifier::single(Action::fwd(*port)),
            Policy::XFwd(port) => self.compile(&Policy::xfwd_expansion(*port))?,
            Policy::MatchModify(field, from, to) => self.compile(&match_modify_expansion(field, from, to))?,
            Policy::Dynamic(d) => self.compile_dynamic(d)?,
            Policy::Recurse(r) => {
                let d = r.upgrade().ok_or_else(|| CompileError::DanglingRecursion(r.id()))?;
                self.compile_dynamic(&d)?
            }
        })
    }

    fn compile_dynamic(&mut self, d: &DynamicPolicy) -> Result<Classifier, CompileError> {
        if self.stack.contains(&d.id()) {
            return Err(CompileError::RecursivePolicy(d.id()));
        }
        if !self.force || self.fresh.contains(&d.id()) {
            if let Some(c) = d.cached_classifier() {
                return Ok(c);
            }
        }
        trace!("compiling dynamic policy {}", d.name());
        self.stack.push(d.id());
        let result = self.compile(&d.policy());
        self.stack.pop();
        let c = result?;
        d.store_classifier(c.clone());
        self.fresh.insert(d.id());
        Ok(c)
    }
}

fn match_modify_expansion(field: &str, from: &HeaderValue, to: &HeaderValue) -> Policy {
    if_(match_field(field, from.clone()), modify_field(field, to.clone()), Policy::Identity)
}

/// Compile a policy, using the memoized classifiers of dynamic cells.
pub fn compile(policy: &Policy) -> Result<Classifier, CompileError> {
    Compiler::new().compile(policy)
}
