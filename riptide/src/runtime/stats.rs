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

//! Module containing the book-keeping of outstanding statistics queries and deletions

use crate::buckets::{CountBucket, RuleKey};
use crate::network::SwitchId;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// # Query Tracker
/// Remembers which count buckets wait for the flow statistics of which switch, and when each
/// switch was last asked. A switch is asked again only if no reply is outstanding, or if the
/// last request is older than the re-query interval (the reply is then assumed to be lost).
#[derive(Default)]
pub struct QueryTracker {
    interval: Duration,
    last: HashMap<SwitchId, Instant>,
    outstanding: HashMap<SwitchId, Vec<Arc<CountBucket>>>,
}

impl QueryTracker {
    /// Create a tracker with the given re-query interval
    pub fn new(interval: Duration) -> Self {
        Self { interval, ..Default::default() }
    }

    /// Register a bucket waiting for the switch. Returns `true` if a request must be sent.
    pub fn register(&mut self, switch: SwitchId, bucket: Arc<CountBucket>, now: Instant) -> bool {
        let waiting = self.outstanding.entry(switch).or_insert_with(Vec::new);
        let pending = !waiting.is_empty();
        if !waiting.iter().any(|b| b.id() == bucket.id()) {
            waiting.push(bucket);
        }
        let recent = match self.last.get(&switch) {
            Some(t) => now.saturating_duration_since(*t) < self.interval,
            None => false,
        };
        if pending && recent {
            return false;
        }
        self.last.insert(switch, now);
        true
    }

    /// Returns and forgets all buckets waiting for the switch.
    pub fn take(&mut self, switch: SwitchId) -> Vec<Arc<CountBucket>> {
        self.outstanding.remove(&switch).unwrap_or_default()
    }

    /// Number of buckets waiting for the switch
    pub fn waiting(&self, switch: SwitchId) -> usize {
        self.outstanding.get(&switch).map(Vec::len).unwrap_or(0)
    }

    /// Forget everything about a switch that left the network.
    pub fn forget_switch(&mut self, switch: SwitchId) {
        self.outstanding.remove(&switch);
        self.last.remove(&switch);
    }
}

/// Count buckets waiting for the final counters of deleted rules
#[derive(Default)]
pub struct PendingDeletes {
    pending: HashMap<(SwitchId, RuleKey), Vec<Arc<CountBucket>>>,
}

impl PendingDeletes {
    /// Create an empty map
    pub fn new() -> Self {
        Self::default()
    }

    /// The bucket waits for the flow-removed notification of the rule.
    pub fn add(&mut self, switch: SwitchId, key: RuleKey, bucket: Arc<CountBucket>) {
        self.pending.entry((switch, key)).or_insert_with(Vec::new).push(bucket);
    }

    /// Returns and forgets all buckets waiting for the rule.
    pub fn take(&mut self, switch: SwitchId, key: &RuleKey) -> Vec<Arc<CountBucket>> {
        self.pending.remove(&(switch, key.clone())).unwrap_or_default()
    }

    /// Forget the buckets that no longer track the rule, because a stats reply flushed it.
    pub fn settle(&mut self, switch: SwitchId, key: &RuleKey) {
        let k = (switch, key.clone());
        if let Some(buckets) = self.pending.get_mut(&k) {
            buckets.retain(|b| b.tracks(key));
            if buckets.is_empty() {
                self.pending.remove(&k);
            }
        }
    }

    /// Number of rules waiting for a notification
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    /// Returns `true` if no rule waits for a notification
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}
