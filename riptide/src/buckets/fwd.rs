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

//! Module containing the packet buckets and the queries built on top of them

use super::{dispatch, Callback};
use crate::classifier::Match;
use crate::lock;
use crate::network::Location;
use crate::packet::{is_compilable, HeaderValue, Packet};
use crate::policy::{bucket, filter, intersection, DynamicPolicy, Policy};

use log::*;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Limit on the number of packets delivered per group
struct GroupLimit {
    limit: usize,
    group_by: Vec<String>,
    seen: HashMap<Vec<(String, HeaderValue)>, usize>,
}

impl GroupLimit {
    /// Count the packet. Returns whether it may still be delivered, and whether this packet
    /// exhausted its group.
    fn admit(&mut self, pkt: &Packet) -> (bool, bool) {
        let key = group_key(&self.group_by, pkt);
        let seen = self.seen.entry(key).or_insert(0);
        if *seen >= self.limit {
            return (false, false);
        }
        *seen += 1;
        (true, *seen == self.limit)
    }
}

/// Key of a packet grouped by the headers. An empty `group_by` groups on every header.
fn group_key(group_by: &[String], pkt: &Packet) -> Vec<(String, HeaderValue)> {
    if group_by.is_empty() {
        pkt.fields().map(|(h, v)| (h.to_string(), v.clone())).collect()
    } else {
        group_by
            .iter()
            .map(|h| (h.clone(), pkt.get(h).cloned().unwrap_or(HeaderValue::Absent)))
            .collect()
    }
}

/// Match selecting a group on the switch. Only headers a switch can match on are kept.
fn group_match(key: Vec<(String, HeaderValue)>) -> Match {
    Match::new(key.into_iter().filter(|(h, v)| is_compilable(h) && !v.is_absent()).collect())
}

/// Policy sending every packet outside of the excluded groups to the bucket
fn narrowed(b: &Arc<FwdBucket>, excluded: &[Match]) -> Policy {
    intersection(excluded.iter().map(|m| !filter(m.clone())).collect()) >> bucket(b.clone())
}

/// # Forwarding Bucket
/// Every packet reaching the bucket is sent to the controller and delivered to all callbacks.
pub struct FwdBucket {
    id: usize,
    callbacks: Mutex<Vec<Callback<Packet>>>,
}

impl FwdBucket {
    /// Create a new bucket without callbacks
    pub fn new() -> Arc<Self> {
        Arc::new(Self { id: crate::next_id(), callbacks: Mutex::new(Vec::new()) })
    }

    /// Unique id of the bucket
    pub fn id(&self) -> usize {
        self.id
    }

    /// Register a callback
    pub fn register_callback<F: Fn(&Packet) + Send + Sync + 'static>(&self, f: F) {
        lock(&self.callbacks).push(Box::new(f));
    }

    /// Deliver a packet to all callbacks
    pub fn deliver(&self, pkt: &Packet) {
        dispatch(self.id, &lock(&self.callbacks), pkt);
    }
}

/// # Packets Query
/// Delivers the packets reaching it to its callbacks, at most `limit` per group of packets with
/// equal `group_by` headers. The query is a dynamic policy: once a group is exhausted, the policy
/// excludes the group, and the switches stop sending its packets to the controller after the
/// next recompilation. Packets already on their way are still counted and dropped.
///
/// The excluded groups are matched on the headers a switch can realize. With an empty
/// `group_by`, an exhausted group therefore excludes all packets sharing its location and
/// L2-L4 headers.
pub struct PacketsQuery {
    bucket: Arc<FwdBucket>,
    cell: DynamicPolicy,
    callbacks: Arc<Mutex<Vec<Callback<Packet>>>>,
    excluded: Arc<Mutex<Vec<Match>>>,
}

impl PacketsQuery {
    /// Policy to place in the program
    pub fn policy(&self) -> Policy {
        Policy::Dynamic(self.cell.clone())
    }

    /// The dynamic cell holding the current policy of the query
    pub fn cell(&self) -> &DynamicPolicy {
        &self.cell
    }

    /// The bucket receiving the packets on the controller
    pub fn bucket(&self) -> Arc<FwdBucket> {
        self.bucket.clone()
    }

    /// Groups that reached the limit and are no longer sent to the controller
    pub fn excluded(&self) -> Vec<Match> {
        lock(&self.excluded).clone()
    }

    /// Register a callback
    pub fn register_callback<F: Fn(&Packet) + Send + Sync + 'static>(&self, f: F) {
        lock(&self.callbacks).push(Box::new(f));
    }
}

/// Create a query that forwards at most `limit` packets per group of equal `group_by` headers to
/// its callbacks. An empty `group_by` groups on every header of the packet. With `limit` set to
/// `None`, every packet is forwarded and the policy never changes.
pub fn packets(limit: Option<usize>, group_by: Vec<String>) -> PacketsQuery {
    let b = FwdBucket::new();
    let cell = DynamicPolicy::new("packets", narrowed(&b, &[]));
    let callbacks: Arc<Mutex<Vec<Callback<Packet>>>> = Arc::new(Mutex::new(Vec::new()));
    let excluded = Arc::new(Mutex::new(Vec::new()));

    let id = b.id();
    let limit = Mutex::new(limit.map(|limit| GroupLimit { limit, group_by, seen: HashMap::new() }));
    let shared_callbacks = callbacks.clone();
    let shared_excluded = excluded.clone();
    let weak_bucket = Arc::downgrade(&b);
    let weak_cell = cell.downgrade();
    b.register_callback(move |pkt: &Packet| {
        let (admit, exhausted) = match lock(&limit).as_mut() {
            Some(l) => l.admit(pkt),
            None => (true, false),
        };
        if admit {
            dispatch(id, &lock(&shared_callbacks), pkt);
        }
        if !exhausted {
            return;
        }
        let group = match lock(&limit).as_ref() {
            Some(l) => group_match(group_key(&l.group_by, pkt)),
            None => return,
        };
        debug!("packets query {} stops watching {}", id, group);
        let mut excluded = lock(&shared_excluded);
        excluded.push(group);
        if let (Some(cell), Some(b)) = (weak_cell.upgrade(), weak_bucket.upgrade()) {
            cell.set_policy(narrowed(&b, &excluded));
        }
    });

    PacketsQuery { bucket: b, cell, callbacks, excluded }
}

/// # Path Bucket
/// Like a [`FwdBucket`], but the callbacks receive the trajectory of the packet alongside.
pub struct PathBucket {
    id: usize,
    callbacks: Mutex<Vec<Callback<(Packet, Vec<Vec<Location>>)>>>,
}

impl PathBucket {
    /// Create a new bucket without callbacks
    pub fn new() -> Arc<Self> {
        Arc::new(Self { id: crate::next_id(), callbacks: Mutex::new(Vec::new()) })
    }

    /// Unique id of the bucket
    pub fn id(&self) -> usize {
        self.id
    }

    /// Register a callback
    pub fn register_callback<F>(&self, f: F)
    where
        F: Fn(&(Packet, Vec<Vec<Location>>)) + Send + Sync + 'static,
    {
        lock(&self.callbacks).push(Box::new(f));
    }

    /// Deliver a packet together with the paths it took
    pub fn deliver(&self, pkt: &Packet, paths: &[Vec<Location>]) {
        dispatch(self.id, &lock(&self.callbacks), &(pkt.clone(), paths.to_vec()));
    }
}

/// Value of an aggregate query
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Aggregate {
    /// A single total
    Total(u64),
    /// Totals per group
    Grouped(BTreeMap<Vec<(String, HeaderValue)>, u64>),
}

/// # Aggregate Query
/// Counts packets (or bytes) arriving at a [`FwdBucket`]. The current value is delivered to the
/// callbacks on every [`AggregateQuery::report`], or periodically after
/// [`AggregateQuery::start_reporting`].
pub struct AggregateQuery {
    bucket: Arc<FwdBucket>,
    value: Arc<Mutex<Aggregate>>,
    callbacks: Mutex<Vec<Callback<Aggregate>>>,
    reporting: AtomicBool,
}

impl AggregateQuery {
    fn new(group_by: Vec<String>, bytes: bool) -> Self {
        let bucket = FwdBucket::new();
        let value = Arc::new(Mutex::new(if group_by.is_empty() {
            Aggregate::Total(0)
        } else {
            Aggregate::Grouped(BTreeMap::new())
        }));
        let shared = value.clone();
        bucket.register_callback(move |pkt| {
            let amount = if bytes { pkt.size() } else { 1 };
            match &mut *lock(&shared) {
                Aggregate::Total(x) => *x += amount,
                Aggregate::Grouped(map) => {
                    *map.entry(group_key(&group_by, pkt)).or_insert(0) += amount
                }
            }
        });
        Self { bucket, value, callbacks: Mutex::new(Vec::new()), reporting: AtomicBool::new(false) }
    }

    /// Bucket that must be placed in the policy
    pub fn bucket(&self) -> Arc<FwdBucket> {
        self.bucket.clone()
    }

    /// Current value of the aggregate
    pub fn value(&self) -> Aggregate {
        lock(&self.value).clone()
    }

    /// Register a callback
    pub fn register_callback<F: Fn(&Aggregate) + Send + Sync + 'static>(&self, f: F) {
        lock(&self.callbacks).push(Box::new(f));
    }

    /// Call every callback with the current value
    pub fn report(&self) {
        let value = self.value();
        dispatch(self.bucket.id(), &lock(&self.callbacks), &value);
    }

    /// Report the current value every `interval`, until [`Self::stop_reporting`] is called.
    pub fn start_reporting(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        self.reporting.store(true, Ordering::SeqCst);
        let query = self.clone();
        thread::spawn(move || {
            while query.reporting.load(Ordering::SeqCst) {
                query.report();
                thread::sleep(interval);
            }
        })
    }

    /// Stop the periodic reports
    pub fn stop_reporting(&self) {
        self.reporting.store(false, Ordering::SeqCst);
    }
}

/// Count the packets arriving at the query, grouped by the given headers (or in total, if
/// `group_by` is empty).
pub fn count_packets(group_by: Vec<String>) -> AggregateQuery {
    AggregateQuery::new(group_by, false)
}

/// Count the bytes (header and payload length) arriving at the query, grouped by the given
/// headers (or in total, if `group_by` is empty).
pub fn count_bytes(group_by: Vec<String>) -> AggregateQuery {
    AggregateQuery::new(group_by, true)
}
