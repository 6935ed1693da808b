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

//! # Classifier
//!
//! A [`Classifier`] is the operational form of a compiled policy: an ordered list of
//! [`Rule`]s, where the position in the list is the priority. The first rule whose match fires on
//! a packet decides what happens to it. Every classifier produced by the compiler is *total*, i.e.,
//! its last rule matches every packet.
//!
//! Classifiers are composed with the operators `+` (parallel composition) and `>>` (sequential
//! composition), see [`compose`]. Both operators run [`Classifier::optimize`] on their result,
//! which removes every rule shadowed by an earlier rule.

mod action;
pub mod compose;
mod matches;

pub use action::{Action, Sink, Trace};
pub use matches::Match;

use crate::packet::{Packet, PacketSet};

use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use thiserror::Error;

/// Errors of the classifier algebra
#[derive(Error, Debug, PartialEq)]
pub enum ClassifierError {
    /// No rule of the classifier matches the packet. This violates the totality invariant.
    #[error("Classifier is not total: no rule matches {0}")]
    NotTotal(Packet),
    /// A negated classifier contains an action which is neither identity nor drop.
    #[error("Cannot negate a rule with action {0}")]
    NegateNonFilter(String),
}

/// # Rule
/// A pair of a [`Match`] and a list of [`Action`]s. The rule produces one output per action. An
/// empty action list drops the packet.
///
/// Rules remember the rules they were derived from (`parents`). This provenance is only used for
/// diagnostics, and is ignored when comparing rules. Parents are stored shallow, i.e., without
/// their own parents.
#[derive(Debug, Clone)]
pub struct Rule {
    /// Match of the rule
    pub matches: Match,
    /// Actions of the rule
    pub actions: Vec<Action>,
    parents: Vec<Arc<Rule>>,
}

impl Rule {
    /// Create a new rule without provenance
    pub fn new(matches: Match, actions: Vec<Action>) -> Self {
        Self { matches, actions, parents: Vec::new() }
    }

    /// Create a new rule derived from the given parents.
    pub fn derived(matches: Match, actions: Vec<Action>, parents: &[&Rule]) -> Self {
        Self {
            matches,
            actions,
            parents: parents.iter().map(|r| Arc::new(r.shallow())).collect(),
        }
    }

    /// Returns the rules this rule was derived from
    pub fn parents(&self) -> &[Arc<Rule>] {
        &self.parents
    }

    fn shallow(&self) -> Self {
        Self::new(self.matches.clone(), self.actions.clone())
    }

    /// Returns `true` if the rule drops every packet it matches
    pub fn is_drop(&self) -> bool {
        self.actions.is_empty()
    }

    /// Evaluate the rule on a packet. Returns `None` if the match does not fire.
    pub fn eval(&self, pkt: &Packet, trace: &mut Trace) -> Option<PacketSet> {
        if !self.matches.eval(pkt) {
            return None;
        }
        Some(self.actions.iter().filter_map(|a| a.eval(pkt, trace)).collect())
    }
}

impl PartialEq for Rule {
    fn eq(&self, other: &Self) -> bool {
        self.matches == other.matches && self.actions == other.actions
    }
}

impl Eq for Rule {}

impl Hash for Rule {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.matches.hash(state);
        self.actions.hash(state);
    }
}

impl fmt::Display for Rule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> [", self.matches)?;
        for (i, a) in self.actions.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", a)?;
        }
        write!(f, "]")
    }
}

/// # Classifier
/// Ordered list of rules. Equality is structural.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct Classifier {
    /// Rules, ordered from highest to lowest priority
    pub rules: Vec<Rule>,
}

impl Classifier {
    /// Create a classifier from a list of rules
    pub fn new(rules: Vec<Rule>) -> Self {
        Self { rules }
    }

    /// Classifier of `identity`: `[(identity, [identity])]`
    pub fn identity() -> Self {
        Self::new(vec![Rule::new(Match::identity(), vec![Action::Identity])])
    }

    /// Classifier of `drop`: `[(identity, [])]`
    pub fn drop() -> Self {
        Self::new(vec![Rule::new(Match::identity(), vec![])])
    }

    /// Classifier that applies a single action on every packet
    pub fn single(action: Action) -> Self {
        Self::new(vec![Rule::new(Match::identity(), vec![action])])
    }

    /// Classifier of `match(M)`: `[(M, [identity]), (identity, [])]`
    pub fn filter(m: Match) -> Self {
        if m.is_identity() {
            return Self::identity();
        }
        Self::new(vec![
            Rule::new(m, vec![Action::Identity]),
            Rule::new(Match::identity(), vec![]),
        ])
    }

    /// Number of rules
    pub fn len(&self) -> usize {
        self.rules.len()
    }

    /// Returns `true` if there is no rule
    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Returns `true` if the last rule matches every packet
    pub fn is_total(&self) -> bool {
        self.rules.last().map(|r| r.matches.is_identity()).unwrap_or(false)
    }

    /// Evaluate the classifier on a packet. Packets delivered to the controller or to buckets are
    /// dropped from the result.
    pub fn eval(&self, pkt: &Packet) -> Result<PacketSet, ClassifierError> {
        self.eval_traced(pkt, &mut Trace::new())
    }

    /// Evaluate the classifier on a packet, recording all packets delivered to sinks in `trace`.
    pub fn eval_traced(&self, pkt: &Packet, trace: &mut Trace) -> Result<PacketSet, ClassifierError> {
        self.rules
            .iter()
            .find_map(|r| r.eval(pkt, trace))
            .ok_or_else(|| ClassifierError::NotTotal(pkt.clone()))
    }

    /// Returns the winning rule for a packet
    pub fn winner(&self, pkt: &Packet) -> Option<&Rule> {
        self.rules.iter().find(|r| r.matches.eval(pkt))
    }

    /// Remove all shadowed rules
    pub fn optimize(self) -> Self {
        self.remove_shadowed_cover_single()
    }

    /// Walk the rule list once, keeping a rule only if no earlier kept rule has an equal match.
    pub fn remove_shadowed_exact_single(self) -> Self {
        let mut rules: Vec<Rule> = Vec::with_capacity(self.rules.len());
        for r in self.rules {
            if !rules.iter().any(|k| k.matches == r.matches) {
                rules.push(r);
            }
        }
        Self { rules }
    }

    /// Walk the rule list once, keeping a rule only if no earlier kept rule covers its match.
    pub fn remove_shadowed_cover_single(self) -> Self {
        let mut rules: Vec<Rule> = Vec::with_capacity(self.rules.len());
        for r in self.rules {
            if !rules.iter().any(|k| k.matches.covers(&r.matches)) {
                rules.push(r);
            }
        }
        Self { rules }
    }
}

impl fmt::Display for Classifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for r in self.rules.iter() {
            writeln!(f, "{}", r)?;
        }
        Ok(())
    }
}
