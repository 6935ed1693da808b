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

//! Module containing the actions of a classifier rule

use crate::buckets::BucketRef;
use crate::packet::{HeaderMap, HeaderValue, Packet, OUTPORT};

use std::fmt;

/// # Action
/// Single action of a rule. A rule with an empty action list drops the packet, so there is no
/// separate drop action.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Action {
    /// Pass the packet through unchanged
    Identity,
    /// Replace the named fields
    Modify(HeaderMap),
    /// Deliver a copy to the controller
    Controller,
    /// Deliver a copy to a bucket
    Bucket(BucketRef),
}

/// Destination of a packet that leaves the data plane during evaluation
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Sink {
    /// The packet is sent to the controller
    Controller,
    /// The packet is delivered to a bucket
    Bucket(BucketRef),
}

/// Packets collected by sinks while evaluating a policy or a classifier.
pub type Trace = Vec<(Sink, Packet)>;

impl Action {
    /// Create a modify action that sets a single field
    pub fn modify<V: Into<HeaderValue>>(field: &str, value: V) -> Self {
        let mut map = HeaderMap::new();
        map.insert(field.to_string(), value.into());
        Self::Modify(map)
    }

    /// Create a forwarding action
    pub fn fwd(port: u32) -> Self {
        Self::modify(OUTPORT, port)
    }

    /// Apply the action on a packet. Actions delivering to a sink record the packet in the trace
    /// and produce no output.
    pub fn eval(&self, pkt: &Packet, trace: &mut Trace) -> Option<Packet> {
        match self {
            Self::Identity => Some(pkt.clone()),
            Self::Modify(map) => Some(pkt.modify_many(map)),
            Self::Controller => {
                trace.push((Sink::Controller, pkt.clone()));
                None
            }
            Self::Bucket(b) => {
                trace.push((Sink::Bucket(b.clone()), pkt.clone()));
                None
            }
        }
    }

    /// Returns `true` if the action delivers to a bucket
    pub fn is_bucket(&self) -> bool {
        matches!(self, Self::Bucket(_))
    }

    /// Returns the output port, if the action forwards the packet.
    pub fn outport(&self) -> Option<u32> {
        match self {
            Self::Modify(map) => map.get(OUTPORT).and_then(HeaderValue::as_int),
            _ => None,
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Identity => write!(f, "identity"),
            Self::Modify(map) => {
                write!(f, "modify(")?;
                for (i, (k, v)) in map.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}={}", k, v)?;
                }
                write!(f, ")")
            }
            Self::Controller => write!(f, "Controller"),
            Self::Bucket(b) => write!(f, "{:?}", b),
        }
    }
}
