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

//! # Query Buckets
//!
//! Buckets are controller-side sinks. A policy delivers packets (or, for [`CountBucket`],
//! per-rule statistics) to a bucket, which dispatches them to the callbacks registered by the
//! programmer. Buckets are compared by identity, never by content, so that every rule derived
//! from the same bucket keeps feeding the same callbacks across recompilations.
//!
//! Callbacks run isolated from the dispatcher: a panicking callback is logged and skipped for
//! that delivery, while all other callbacks still receive the value.

mod count;
mod fwd;
mod netflow;

pub use count::{CountBucket, PullStatus, RuleKey, RuleStats};
pub use fwd::{
    count_bytes, count_packets, packets, Aggregate, AggregateQuery, FwdBucket, PacketsQuery,
    PathBucket,
};
pub use netflow::{
    parse_record, CaptureType, CollectorHandle, CollectorHub, CollectorSpawner, NetflowBucket,
    ProcessSpawner,
};

use log::*;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use thiserror::Error;

/// Callback registered on a bucket
pub type Callback<T> = Box<dyn Fn(&T) + Send + Sync>;

/// Error of the bucket subsystem
#[derive(Error, Debug, PartialEq)]
pub enum BucketError {
    /// The flow collector daemon could not be started
    #[error("Cannot start the {0} collector: {1}")]
    CollectorSpawn(String, String),
    /// A flow record could not be parsed
    #[error("Invalid flow record: {0}")]
    InvalidRecord(String),
    /// The flow dump could not be read
    #[error("Cannot read flow dump: {0}")]
    DumpUnreadable(String),
}

/// Call every callback with the value. A panic in one callback does not affect the others.
pub(crate) fn dispatch<T>(bucket: usize, callbacks: &[Callback<T>], value: &T) {
    for (i, cb) in callbacks.iter().enumerate() {
        if catch_unwind(AssertUnwindSafe(|| cb(value))).is_err() {
            warn!("Callback {} of bucket {} panicked, skipping it for this delivery", i, bucket);
        }
    }
}

/// # Bucket Reference
/// Shared handle to a bucket. Two references are equal if and only if they point to the same
/// bucket.
#[derive(Clone)]
pub enum BucketRef {
    /// Packet bucket
    Fwd(Arc<FwdBucket>),
    /// Packet bucket receiving the trajectory of the packet
    Path(Arc<PathBucket>),
    /// Statistics bucket
    Count(Arc<CountBucket>),
    /// Flow record bucket
    Netflow(Arc<NetflowBucket>),
}

impl BucketRef {
    /// Unique id of the bucket
    pub fn id(&self) -> usize {
        match self {
            Self::Fwd(b) => b.id(),
            Self::Path(b) => b.id(),
            Self::Count(b) => b.id(),
            Self::Netflow(b) => b.id(),
        }
    }

    /// Returns `true` if the bucket receives packets on the controller, i.e., if rules feeding
    /// it must send packets to the controller.
    pub fn needs_controller(&self) -> bool {
        matches!(self, Self::Fwd(_) | Self::Path(_))
    }

    /// Returns `true` if the bucket is updated with the rules it is installed on.
    pub fn tracks_rules(&self) -> bool {
        matches!(self, Self::Count(_) | Self::Netflow(_))
    }

    /// Deliver a packet that reached the bucket in the controller.
    pub fn deliver(&self, pkt: &crate::packet::Packet) {
        match self {
            Self::Fwd(b) => b.deliver(pkt),
            Self::Path(b) => b.deliver(pkt, &[]),
            Self::Count(b) => b.apply_packet(pkt),
            Self::Netflow(b) => debug!("Netflow bucket {} has no packet delivery", b.id()),
        }
    }

    /// Prepare the bucket for a bulk update of its rules
    pub fn start_update(&self) {
        match self {
            Self::Count(b) => b.start_update(),
            Self::Netflow(b) => b.start_update(),
            _ => {}
        }
    }

    /// Finish a bulk update of the rules
    pub fn finish_update(&self) {
        match self {
            Self::Count(b) => b.finish_update(),
            Self::Netflow(b) => b.finish_update(),
            _ => {}
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            Self::Fwd(_) => "FwdBucket",
            Self::Path(_) => "PathBucket",
            Self::Count(_) => "CountBucket",
            Self::Netflow(_) => "NetflowBucket",
        }
    }
}

impl PartialEq for BucketRef {
    fn eq(&self, other: &Self) -> bool {
        self.id() == other.id()
    }
}

impl Eq for BucketRef {}

impl Hash for BucketRef {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id().hash(state)
    }
}

impl fmt::Debug for BucketRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.kind(), self.id())
    }
}

impl From<Arc<FwdBucket>> for BucketRef {
    fn from(b: Arc<FwdBucket>) -> Self {
        Self::Fwd(b)
    }
}

impl From<Arc<PathBucket>> for BucketRef {
    fn from(b: Arc<PathBucket>) -> Self {
        Self::Path(b)
    }
}

impl From<Arc<CountBucket>> for BucketRef {
    fn from(b: Arc<CountBucket>) -> Self {
        Self::Count(b)
    }
}

impl From<Arc<NetflowBucket>> for BucketRef {
    fn from(b: Arc<NetflowBucket>) -> Self {
        Self::Netflow(b)
    }
}
