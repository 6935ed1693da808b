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

//! # Count Bucket
//!
//! A [`CountBucket`] aggregates the packet and byte counters of all flow-table rules it is
//! installed on. The update engine tells the bucket about every rule it feeds, identified by a
//! [`RuleKey`] (match, priority and version cookie). On [`CountBucket::begin_pull`], the switches
//! holding these rules are asked for their statistics, and once every reply arrived, the sum is
//! delivered to the callbacks.
//!
//! Counters of rules that were removed from the switches are flushed into a persistent total,
//! either by a flow-removed notification or by the next stats reply still carrying the rule.
//! A rule whose actions were modified in place keeps its counters, but reports them under its
//! new version. The old version is forgotten once the new one first reports.

use super::{dispatch, Callback};
use crate::classifier::Match;
use crate::lock;
use crate::packet::Packet;

use log::*;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};

/// Identifies a rule on a switch
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RuleKey {
    /// Match of the rule (including the switch)
    pub matches: Match,
    /// Priority of the rule
    pub priority: u16,
    /// Version cookie of the rule
    pub version: u16,
}

/// State of a single rule tracked by the bucket
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RuleStats {
    /// Packet counter
    pub packets: u64,
    /// Byte counter
    pub bytes: u64,
    /// The rule was installed before the bucket tracked it. Its first reported counters become
    /// the `baseline`.
    pub existing: bool,
    /// Counters of the rule from before the bucket tracked it
    pub baseline: (u64, u64),
    /// The rule is deleted, and waits for its last counters
    pub to_delete: bool,
}

impl RuleStats {
    /// Counters accumulated while the bucket tracked the rule
    pub fn own(&self) -> (u64, u64) {
        (self.packets.saturating_sub(self.baseline.0), self.bytes.saturating_sub(self.baseline.1))
    }
}

/// Result of [`CountBucket::begin_pull`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PullStatus {
    /// Flow statistics must be requested from these switches
    Requested(BTreeSet<u32>),
    /// The bucket has no rules. The callbacks were called with the persistent counters.
    NoStatsRequested,
}

#[derive(Default)]
struct CountState {
    rules: HashMap<RuleKey, RuleStats>,
    replaced: HashMap<RuleKey, RuleKey>,
    in_update: bool,
    outstanding: HashSet<u32>,
    pulled: (u64, u64),
    persistent: (u64, u64),
}

impl CountState {
    /// Move the counters of a rule into the persistent total and forget the rule.
    fn flush(&mut self, key: &RuleKey, counters: Option<(u64, u64)>) -> bool {
        let stats = match self.rules.remove(key) {
            Some(stats) => stats,
            None => return false,
        };
        let (packets, bytes) = match counters {
            Some((p, b)) => {
                (p.saturating_sub(stats.baseline.0), b.saturating_sub(stats.baseline.1))
            }
            None => stats.own(),
        };
        self.persistent.0 += packets;
        self.persistent.1 += bytes;
        self.forget_predecessors(key);
        true
    }

    /// The versions replaced by `key` are gone from the switch. Their counters are part of the
    /// counters of `key`.
    fn forget_predecessors(&mut self, key: &RuleKey) {
        let mut next = self.replaced.remove(key);
        while let Some(old) = next {
            self.rules.remove(&old);
            next = self.replaced.remove(&old);
        }
    }
}

/// # Count Bucket
pub struct CountBucket {
    id: usize,
    state: Mutex<CountState>,
    in_update: Condvar,
    callbacks: Mutex<Vec<Callback<(u64, u64)>>>,
}

impl CountBucket {
    /// Create a new bucket without callbacks
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            id: crate::next_id(),
            state: Mutex::new(CountState::default()),
            in_update: Condvar::new(),
            callbacks: Mutex::new(Vec::new()),
        })
    }

    /// Unique id of the bucket
    pub fn id(&self) -> usize {
        self.id
    }

    /// Register a callback, receiving `(packets, bytes)`.
    pub fn register_callback<F: Fn(&(u64, u64)) + Send + Sync + 'static>(&self, f: F) {
        lock(&self.callbacks).push(Box::new(f));
    }

    /// Lock the state, waiting until no bulk update is in progress.
    fn settled(&self) -> MutexGuard<'_, CountState> {
        let mut state = lock(&self.state);
        while state.in_update {
            state = self.in_update.wait(state).unwrap_or_else(PoisonError::into_inner);
        }
        state
    }

    /// Mark the start of a bulk update. Pulls and replies wait until [`Self::finish_update`].
    pub fn start_update(&self) {
        lock(&self.state).in_update = true;
    }

    /// Mark the end of a bulk update.
    pub fn finish_update(&self) {
        lock(&self.state).in_update = false;
        self.in_update.notify_all();
    }

    /// Track a newly installed rule, starting with zero counters.
    pub fn add_match(&self, key: RuleKey) {
        debug!("bucket {}: add {:?}", self.id, key);
        lock(&self.state).rules.entry(key).or_insert_with(RuleStats::default);
    }

    /// Mark a rule as deleted. Its entry remains until its final counters are flushed.
    pub fn delete_match(&self, key: &RuleKey) {
        debug!("bucket {}: delete {:?}", self.id, key);
        if let Some(stats) = lock(&self.state).rules.get_mut(key) {
            stats.to_delete = true;
        }
    }

    /// Keep tracking a rule that survived a recompilation. If the bucket did not track the rule
    /// before, the counters the rule carries so far are not counted.
    pub fn carry_over(&self, key: RuleKey) {
        debug!("bucket {}: carry over {:?}", self.id, key);
        let mut state = lock(&self.state);
        let stats = state
            .rules
            .entry(key)
            .or_insert_with(|| RuleStats { existing: true, ..Default::default() });
        stats.to_delete = false;
    }

    /// The actions of the rule `from` were modified in place. The switch keeps its counters and
    /// reports them as `to` from now on. `from` is tracked until `to` first reports.
    pub fn replace_match(&self, from: &RuleKey, to: RuleKey) {
        debug!("bucket {}: replace {:?} by {:?}", self.id, from, to);
        let mut state = lock(&self.state);
        match state.rules.get(from).copied() {
            Some(stats) => {
                state.rules.insert(to.clone(), RuleStats { to_delete: false, ..stats });
                state.replaced.insert(to, from.clone());
            }
            None => {
                let fresh = RuleStats { existing: true, ..Default::default() };
                state.rules.entry(to).or_insert(fresh);
            }
        }
    }

    /// Stop tracking a rule that stays on the switch. The counters of the last reply become
    /// persistent.
    pub fn retire_match(&self, key: &RuleKey) {
        debug!("bucket {}: retire {:?}", self.id, key);
        lock(&self.state).flush(key, None);
    }

    /// Returns `true` if the bucket tracks the rule
    pub fn tracks(&self, key: &RuleKey) -> bool {
        lock(&self.state).rules.contains_key(key)
    }

    /// Returns a copy of all tracked rules
    pub fn rules(&self) -> HashMap<RuleKey, RuleStats> {
        lock(&self.state).rules.clone()
    }

    /// Returns the counters of rules that are no longer installed, plus packets counted on the
    /// controller.
    pub fn persistent(&self) -> (u64, u64) {
        lock(&self.state).persistent
    }

    /// Count a packet that was delivered to the bucket on the controller.
    pub fn apply_packet(&self, pkt: &Packet) {
        let mut state = lock(&self.state);
        state.persistent.0 += 1;
        state.persistent.1 += pkt.size();
    }

    /// Start a pull cycle. Returns the switches that must be asked for flow statistics. If the
    /// bucket has no rules, the callbacks are called right away.
    pub fn begin_pull(&self) -> PullStatus {
        let mut state = self.settled();
        let switches: BTreeSet<u32> =
            state.rules.keys().filter_map(|k| k.matches.switch()).collect();
        if switches.is_empty() {
            let result = state.persistent;
            drop(state);
            dispatch(self.id, &lock(&self.callbacks), &result);
            return PullStatus::NoStatsRequested;
        }
        state.outstanding = switches.iter().copied().collect();
        state.pulled = (0, 0);
        PullStatus::Requested(switches)
    }

    /// Returns `true` if the bucket waits for a reply from the switch
    pub fn is_outstanding(&self, switch: u32) -> bool {
        lock(&self.state).outstanding.contains(&switch)
    }

    /// Handle the flow statistics of a switch. Each entry is the key of a rule together with its
    /// `(packets, bytes)` counters. Replies from switches that were not asked are ignored. Once
    /// all replies arrived, the callbacks are called with the aggregated counters.
    pub fn handle_flow_stats_reply(&self, switch: u32, stats: &[(RuleKey, u64, u64)]) {
        let mut state = self.settled();
        if !state.outstanding.remove(&switch) {
            debug!("bucket {}: ignoring unrequested stats of switch {}", self.id, switch);
            return;
        }
        for (key, packets, bytes) in stats {
            let flush = match state.rules.get_mut(key) {
                Some(entry) => {
                    if entry.existing {
                        entry.baseline = (*packets, *bytes);
                        entry.existing = false;
                    }
                    entry.packets = *packets;
                    entry.bytes = *bytes;
                    entry.to_delete
                }
                None => continue,
            };
            if flush {
                state.flush(key, None);
            } else {
                state.forget_predecessors(key);
                let own = state.rules.get(key).map(RuleStats::own).unwrap_or_default();
                state.pulled.0 += own.0;
                state.pulled.1 += own.1;
            }
        }
        if state.outstanding.is_empty() {
            let result =
                (state.persistent.0 + state.pulled.0, state.persistent.1 + state.pulled.1);
            drop(state);
            dispatch(self.id, &lock(&self.callbacks), &result);
        }
    }

    /// Handle the final counters of a removed rule. Returns `false` if the rule is unknown.
    pub fn handle_flow_removed(&self, key: &RuleKey, packets: u64, bytes: u64) -> bool {
        lock(&self.state).flush(key, Some((packets, bytes)))
    }
}
