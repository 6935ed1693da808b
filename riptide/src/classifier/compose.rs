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

//! # Classifier Composition
//!
//! Parallel and sequential composition of classifiers, and negation of filter classifiers. All
//! operations take total classifiers and return total classifiers.

use super::{Action, Classifier, ClassifierError, Match, Rule};
use crate::packet::HeaderMap;

use itertools::iproduct;
use std::ops::{Add, Shr};

/// Parallel composition `c1 + c2`. The result produces the union of the outputs of both
/// classifiers.
///
/// Every pair of rules with an overlapping match is crossed into a rule that performs the actions
/// of both. Then, the rules of `c1` and the rules of `c2` are appended, and the shadowed rules are
/// removed.
pub fn parallel(c1: &Classifier, c2: &Classifier) -> Classifier {
    let mut rules: Vec<Rule> = iproduct!(c1.rules.iter(), c2.rules.iter())
        .filter_map(|(r1, r2)| {
            r1.matches.intersect(&r2.matches).map(|m| {
                let actions = r1.actions.iter().chain(r2.actions.iter()).cloned().collect();
                Rule::derived(m, actions, &[r1, r2])
            })
        })
        .collect();
    rules.extend(c1.rules.iter().cloned());
    rules.extend(c2.rules.iter().cloned());
    Classifier::new(rules).optimize()
}

/// Sequential composition `c1 >> c2`. The result feeds every output of `c1` into `c2`.
///
/// For every rule of `c1`, the actions are sequenced with `c2`, which yields a classifier
/// describing what happens to a packet that hit the rule. Its matches are restricted to the match
/// of the rule of `c1`, and the results are concatenated in the priority order of `c1`.
pub fn sequential(c1: &Classifier, c2: &Classifier) -> Classifier {
    let mut rules: Vec<Rule> = Vec::new();
    for r1 in c1.rules.iter() {
        let sequenced = sequence_actions_classifier(&r1.actions, c2);
        let restricted: Vec<Rule> = sequenced
            .rules
            .iter()
            .filter_map(|r2| {
                r2.matches
                    .intersect(&r1.matches)
                    .map(|m| Rule::derived(m, r2.actions.clone(), &[r1, r2]))
            })
            .collect();
        rules.extend(Classifier::new(restricted).optimize().rules);
    }
    Classifier::new(rules).optimize()
}

/// Negation of a filter classifier: every `identity` action becomes `drop`, and vice versa.
/// Classifiers with any other action cannot be negated.
pub fn negate(c: &Classifier) -> Result<Classifier, ClassifierError> {
    let rules = c
        .rules
        .iter()
        .map(|r| {
            let actions = if r.actions.is_empty() {
                vec![Action::Identity]
            } else if r.actions.iter().all(|a| a == &Action::Identity) {
                vec![]
            } else {
                return Err(ClassifierError::NegateNonFilter(r.to_string()));
            };
            Ok(Rule::derived(r.matches.clone(), actions, &[r]))
        })
        .collect::<Result<Vec<_>, _>>()?;
    Ok(Classifier::new(rules))
}

/// Sequence a list of (parallel) actions with a classifier. The result is the parallel
/// composition of every action sequenced with the classifier.
fn sequence_actions_classifier(actions: &[Action], c2: &Classifier) -> Classifier {
    actions
        .iter()
        .fold(Classifier::drop(), |acc, a| parallel(&acc, &sequence_action_classifier(a, c2)))
}

/// Sequence a single action with a classifier. Every rule of `c2` is commuted past the action.
/// The result stops at the first rule whose commuted match is `identity`.
fn sequence_action_classifier(action: &Action, c2: &Classifier) -> Classifier {
    let mut rules = Vec::new();
    for r2 in c2.rules.iter() {
        match commute_test(action, &r2.matches) {
            Some(m) if m.is_identity() => {
                rules.push(Rule::derived(m, sequence_actions(action, &r2.actions), &[r2]));
                break;
            }
            Some(m) => rules.push(Rule::derived(m, sequence_actions(action, &r2.actions), &[r2])),
            None => {}
        }
    }
    if rules.is_empty() {
        return Classifier::drop();
    }
    Classifier::new(rules)
}

/// Given an action `a` and a match `m`, return the match `m'` such that `a >> m == m' >> a`.
/// `None` stands for `drop`.
fn commute_test(action: &Action, m: &Match) -> Option<Match> {
    match action {
        Action::Identity => Some(m.clone()),
        // the packet has left the data plane
        Action::Controller | Action::Bucket(_) => Some(Match::identity()),
        Action::Modify(modified) => {
            let mut fields = HeaderMap::new();
            for (f, v) in m.fields().iter() {
                match modified.get(f) {
                    Some(new) if v.accepts(new) => {}
                    Some(_) => return None,
                    None => {
                        fields.insert(f.clone(), v.clone());
                    }
                }
            }
            Some(Match::new(fields))
        }
    }
}

/// Sequence a single action with a list of parallel actions.
fn sequence_actions(a1: &Action, as2: &[Action]) -> Vec<Action> {
    match a1 {
        Action::Identity => as2.to_vec(),
        Action::Controller | Action::Bucket(_) => vec![a1.clone()],
        Action::Modify(m1) => as2
            .iter()
            .map(|a2| match a2 {
                Action::Identity => Action::Modify(m1.clone()),
                Action::Modify(m2) => {
                    let mut m = m1.clone();
                    m.extend(m2.iter().map(|(k, v)| (k.clone(), v.clone())));
                    Action::Modify(m)
                }
                Action::Controller | Action::Bucket(_) => a2.clone(),
            })
            .collect(),
    }
}

impl Add for Classifier {
    type Output = Classifier;

    fn add(self, other: Self) -> Self::Output {
        parallel(&self, &other)
    }
}

impl<'a> Add<&'a Classifier> for &'a Classifier {
    type Output = Classifier;

    fn add(self, other: &'a Classifier) -> Self::Output {
        parallel(self, other)
    }
}

impl Shr for Classifier {
    type Output = Classifier;

    fn shr(self, other: Self) -> Self::Output {
        sequential(&self, &other)
    }
}

impl<'a> Shr<&'a Classifier> for &'a Classifier {
    type Output = Classifier;

    fn shr(self, other: &'a Classifier) -> Self::Output {
        sequential(self, other)
    }
}
