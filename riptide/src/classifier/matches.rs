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

//! Module containing the match of a classifier rule

use crate::packet::{HeaderMap, HeaderValue, Packet, SWITCH};

use serde::{Deserialize, Serialize};
use std::fmt;

/// # Match
/// Conjunction of field tests. The empty match is `identity` (it matches every packet). There is
/// no representation of `drop`; operations that would produce an empty match return `None`
/// instead.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub struct Match {
    fields: HeaderMap,
}

impl Match {
    /// The match that fires on every packet
    pub fn identity() -> Self {
        Self::default()
    }

    /// Create a match from a map of fields
    pub fn new(fields: HeaderMap) -> Self {
        Self { fields }
    }

    /// Returns the match extended by another field. Builder style.
    pub fn with<V: Into<HeaderValue>>(mut self, field: &str, value: V) -> Self {
        self.fields.insert(field.to_string(), value.into());
        self
    }

    /// Returns `true` if the match does not constrain any field
    pub fn is_identity(&self) -> bool {
        self.fields.is_empty()
    }

    /// Returns the constrained fields
    pub fn fields(&self) -> &HeaderMap {
        &self.fields
    }

    /// Returns the value a field is constrained to
    pub fn get(&self, field: &str) -> Option<&HeaderValue> {
        self.fields.get(field)
    }

    /// Returns the switch the match is restricted to, if any.
    pub fn switch(&self) -> Option<u32> {
        self.get(SWITCH).and_then(HeaderValue::as_int)
    }

    /// Returns a copy of the match without the given field
    pub fn without(&self, field: &str) -> Self {
        let mut fields = self.fields.clone();
        fields.remove(field);
        Self { fields }
    }

    /// Returns a copy of the match where only fields satisfying the predicate remain.
    pub fn restrict<F: Fn(&str) -> bool>(&self, keep: F) -> Self {
        Self {
            fields: self
                .fields
                .iter()
                .filter(|(k, _)| keep(k))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        }
    }

    /// Returns `true` if the match fires on the packet. A missing packet header only satisfies
    /// an `Absent` test.
    pub fn eval(&self, pkt: &Packet) -> bool {
        self.fields.iter().all(|(field, pattern)| match pkt.get(field) {
            Some(value) => pattern.accepts(value),
            None => pattern.is_absent(),
        })
    }

    /// Intersect two matches. The result is the most specific match satisfying both, or `None`
    /// (drop) if any shared field disagrees. For IP prefixes, the more specific prefix is taken
    /// if one contains the other.
    pub fn intersect(&self, other: &Match) -> Option<Match> {
        let mut fields = self.fields.clone();
        for (field, b) in other.fields.iter() {
            match fields.get(field).cloned() {
                None => {
                    fields.insert(field.clone(), b.clone());
                }
                Some(a) if &a == b => {}
                Some(HeaderValue::Ip(a)) => match b {
                    HeaderValue::Ip(b) if a.contains(b) => {
                        fields.insert(field.clone(), HeaderValue::Ip(*b));
                    }
                    HeaderValue::Ip(b) if b.contains(&a) => {}
                    _ => return None,
                },
                Some(_) => return None,
            }
        }
        Some(Match { fields })
    }

    /// Returns `true` if every packet matched by `other` is also matched by `self`. This holds if
    /// every field constrained by `self` is constrained in `other` to the same value, or to a
    /// prefix contained in the prefix of `self`.
    pub fn covers(&self, other: &Match) -> bool {
        self.fields.iter().all(|(field, a)| match other.fields.get(field) {
            Some(b) => a.accepts(b),
            None => false,
        })
    }
}

impl From<HeaderMap> for Match {
    fn from(fields: HeaderMap) -> Self {
        Self { fields }
    }
}

impl fmt::Display for Match {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_identity() {
            return write!(f, "identity");
        }
        write!(f, "match(")?;
        for (i, (k, v)) in self.fields.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}={}", k, v)?;
        }
        write!(f, ")")
    }
}
