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

//! # Rule Tables and their Difference
//!
//! A [`RuleTable`] holds the rules of one flow table across all switches, keyed by their
//! [`RuleSlot`] (switch, match and priority). [`RuleTable::get_diff`] computes the
//! [`RulePatch`] that transforms one table into another, and [`RuleTable::apply_patch`] applies
//! it atomically.
//!
//! Two rules that differ only in their bucket actions are the same rule on the switch. They
//! produce a [`RuleModifier::Stay`], which keeps the cookie of the installed rule.

use super::cookie::Cookie;
use crate::buckets::BucketRef;
use crate::classifier::{Action, Match};
use crate::network::SwitchId;

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use thiserror::Error;

/// Error while applying a patch to a rule table
#[derive(Error, Debug, PartialEq)]
pub enum DiffError {
    /// A rule is added to a slot that is already occupied
    #[error("Slot is already occupied: {0}")]
    SlotOccupied(RuleSlot),
    /// A rule is removed or modified, but the slot is empty
    #[error("Slot is empty: {0}")]
    SlotMissing(RuleSlot),
    /// The installed rule differs from the rule the modifier expects
    #[error("Installed rule differs from the expected one: {0}")]
    Mismatch(RuleSlot),
}

/// Position of a rule in the flow table of a switch
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RuleSlot {
    /// Datapath id
    pub switch: SwitchId,
    /// Match of the rule
    pub matches: Match,
    /// Priority of the rule
    pub priority: u16,
}

impl fmt::Display for RuleSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "s{} prio {} {}", self.switch, self.priority, self.matches)
    }
}

/// A rule as it is installed on a switch, including its bucket actions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstalledRule {
    /// Position of the rule
    pub slot: RuleSlot,
    /// Actions, including the controller-side bucket actions
    pub actions: Vec<Action>,
    /// Version cookie
    pub cookie: Cookie,
}

impl InstalledRule {
    /// Actions without the buckets, i.e., the actions the switch executes.
    pub fn wire_actions(&self) -> Vec<Action> {
        self.actions.iter().filter(|a| !a.is_bucket()).cloned().collect()
    }

    /// Buckets that track the rule
    pub fn buckets(&self) -> Vec<BucketRef> {
        let mut seen = HashSet::new();
        self.actions
            .iter()
            .filter_map(|a| match a {
                Action::Bucket(b) if b.tracks_rules() && seen.insert(b.id()) => Some(b.clone()),
                _ => None,
            })
            .collect()
    }
}

/// Single change of a rule table
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuleModifier {
    /// Install a new rule
    Add(InstalledRule),
    /// Remove a rule
    Delete(InstalledRule),
    /// Replace the actions of a rule
    Modify {
        /// Installed rule
        from: InstalledRule,
        /// New rule
        to: InstalledRule,
    },
    /// The rule stays on the switch. Only the bucket actions may change.
    Stay {
        /// Installed rule
        from: InstalledRule,
        /// New rule, with the cookie of the installed one
        to: InstalledRule,
    },
}

impl RuleModifier {
    /// Slot of the modified rule
    pub fn slot(&self) -> &RuleSlot {
        match self {
            Self::Add(r) | Self::Delete(r) => &r.slot,
            Self::Modify { to, .. } | Self::Stay { to, .. } => &to.slot,
        }
    }
}

/// Ordered list of rule modifiers
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RulePatch {
    /// Modifiers, deletes first, then adds, modifies and stays.
    pub modifiers: Vec<RuleModifier>,
}

impl RulePatch {
    /// Create an empty patch
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a modifier
    pub fn add(&mut self, modifier: RuleModifier) {
        self.modifiers.push(modifier);
    }

    /// Returns `(adds, deletes, modifies, stays)`
    pub fn counts(&self) -> (usize, usize, usize, usize) {
        self.modifiers.iter().fold((0, 0, 0, 0), |(a, d, m, s), x| match x {
            RuleModifier::Add(_) => (a + 1, d, m, s),
            RuleModifier::Delete(_) => (a, d + 1, m, s),
            RuleModifier::Modify { .. } => (a, d, m + 1, s),
            RuleModifier::Stay { .. } => (a, d, m, s + 1),
        })
    }

    /// Returns `true` if the patch changes nothing on the switches
    pub fn is_noop(&self) -> bool {
        self.modifiers.iter().all(|m| matches!(m, RuleModifier::Stay { .. }))
    }
}

/// # Rule Table
/// Rules of one flow table on every switch
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RuleTable {
    rules: BTreeMap<RuleSlot, InstalledRule>,
}

impl RuleTable {
    /// Create an empty table
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a rule, replacing any rule in the same slot.
    pub fn insert(&mut self, rule: InstalledRule) {
        self.rules.insert(rule.slot.clone(), rule);
    }

    /// Number of rules
    pub fn len(&self) -> usize {
        self.rules.len()
    }

    /// Returns `true` if the table holds no rule
    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Returns the rule in the slot
    pub fn get(&self, slot: &RuleSlot) -> Option<&InstalledRule> {
        self.rules.get(slot)
    }

    /// Iterate over all rules, ordered by switch and match.
    pub fn iter(&self) -> impl Iterator<Item = &InstalledRule> {
        self.rules.values()
    }

    /// Rules of a switch, ordered from the highest to the lowest priority.
    pub fn switch_rules(&self, switch: SwitchId) -> Vec<&InstalledRule> {
        let mut rules: Vec<&InstalledRule> =
            self.rules.values().filter(|r| r.slot.switch == switch).collect();
        rules.sort_by(|a, b| b.slot.priority.cmp(&a.slot.priority));
        rules
    }

    /// Switches with at least one rule
    pub fn switches(&self) -> Vec<SwitchId> {
        let mut switches: Vec<SwitchId> = self.rules.keys().map(|s| s.switch).collect();
        switches.dedup();
        switches
    }

    /// Remove all rules of a switch, and return them.
    pub fn remove_switch(&mut self, switch: SwitchId) -> Vec<InstalledRule> {
        let slots: Vec<RuleSlot> =
            self.rules.keys().filter(|s| s.switch == switch).cloned().collect();
        slots.iter().filter_map(|s| self.rules.remove(s)).collect()
    }

    /// Apply a single modifier. The table is left unchanged if the modifier does not fit.
    pub fn apply_modifier(&mut self, modifier: &RuleModifier) -> Result<(), DiffError> {
        match modifier {
            RuleModifier::Add(r) => {
                if self.rules.contains_key(&r.slot) {
                    return Err(DiffError::SlotOccupied(r.slot.clone()));
                }
                self.rules.insert(r.slot.clone(), r.clone());
            }
            RuleModifier::Delete(r) => match self.rules.get(&r.slot) {
                Some(x) if x == r => {
                    self.rules.remove(&r.slot);
                }
                Some(_) => return Err(DiffError::Mismatch(r.slot.clone())),
                None => return Err(DiffError::SlotMissing(r.slot.clone())),
            },
            RuleModifier::Modify { from, to } | RuleModifier::Stay { from, to } => {
                match self.rules.get(&from.slot) {
                    Some(x) if x == from => {
                        self.rules.insert(to.slot.clone(), to.clone());
                    }
                    Some(_) => return Err(DiffError::Mismatch(from.slot.clone())),
                    None => return Err(DiffError::SlotMissing(from.slot.clone())),
                }
            }
        }
        Ok(())
    }

    /// Apply all modifiers of a patch. If any of them fails, the table is restored to the state
    /// before the patch.
    pub fn apply_patch(&mut self, patch: &RulePatch) -> Result<(), DiffError> {
        let mut before = self.rules.clone();
        for modifier in patch.modifiers.iter() {
            if let Err(e) = self.apply_modifier(modifier) {
                std::mem::swap(&mut self.rules, &mut before);
                return Err(e);
            }
        }
        Ok(())
    }

    /// Compute the patch that transforms `self` into `other`.
    pub fn get_diff(&self, other: &Self) -> RulePatch {
        let mut patch = RulePatch::new();

        // rules missing in other
        for (slot, r) in self.rules.iter() {
            if !other.rules.contains_key(slot) {
                patch.add(RuleModifier::Delete(r.clone()));
            }
        }

        // rules missing in self
        for (slot, r) in other.rules.iter() {
            if !self.rules.contains_key(slot) {
                patch.add(RuleModifier::Add(r.clone()));
            }
        }

        let mut stays = Vec::new();
        for (slot, from) in self.rules.iter() {
            let to = match other.rules.get(slot) {
                Some(to) => to,
                None => continue,
            };
            if from.wire_actions() == to.wire_actions() {
                let to = InstalledRule { cookie: from.cookie, ..to.clone() };
                stays.push(RuleModifier::Stay { from: from.clone(), to });
            } else {
                patch.add(RuleModifier::Modify { from: from.clone(), to: to.clone() });
            }
        }
        patch.modifiers.extend(stays);
        patch
    }

    /// Patch that removes every rule of `self` and installs every rule of `other`.
    pub fn get_nuclear_diff(&self, other: &Self) -> RulePatch {
        let mut patch = RulePatch::new();
        self.rules.values().for_each(|r| patch.add(RuleModifier::Delete(r.clone())));
        other.rules.values().for_each(|r| patch.add(RuleModifier::Add(r.clone())));
        patch
    }
}
