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

//! # Virtual Header Fields
//!
//! Programs may use header fields the switches do not know about. These *virtual fields* take
//! values from a fixed list, and are packed into the 15-bit tag register formed by `vlan_id`
//! (12 bits) and `vlan_pcp` (3 bits).
//!
//! Every field belongs to a *stage*. All fields of a stage form a mixed-radix numeral, where the
//! field with cardinality `n` (its values plus `None`) contributes a digit in `0..n`, and `None` is
//! always digit `0`. The fields of a stage are ordered by name, with the first field being the
//! most significant digit. The stage occupies `ceil(log2(product of cardinalities))` bits, and
//! stages are laid out from the least significant bit upwards in the order of their index.

use crate::classifier::{Action, Classifier, Match, Rule};
use crate::packet::{HeaderMap, HeaderValue, VLAN_ID, VLAN_NBITS, VLAN_OFFSET, VLAN_PCP, VLAN_TOTAL_STAGES};
use crate::policy::{modify, Policy};

use log::*;
use std::collections::{BTreeMap, BTreeSet};
use thiserror::Error;

/// Width of the tag register in bits
pub const TAG_BITS: u32 = 15;

/// Error while registering or packing virtual fields
#[derive(Error, Debug, PartialEq)]
pub enum VHeaderError {
    /// The field is already registered
    #[error("Virtual field {0} is already registered")]
    DuplicateField(String),
    /// The packed fields need more bits than the tag register offers
    #[error("Virtual fields need {0} bits, but only 15 are available")]
    TagOverflow(u32),
    /// A single match or modification uses fields of multiple stages
    #[error("Fields of multiple stages used together: {0:?}")]
    CrossStageUse(Vec<String>),
    /// The field is not registered
    #[error("Unknown virtual field: {0}")]
    UnknownVirtualField(String),
    /// The value is not part of the value list of the field
    #[error("Unknown value {1} for virtual field {0}")]
    UnknownValue(String, HeaderValue),
}

#[derive(Debug, Clone, PartialEq)]
struct VirtualField {
    values: Vec<HeaderValue>,
    stage: u32,
}

impl VirtualField {
    fn cardinality(&self) -> u32 {
        self.values.len() as u32 + 1
    }

    /// Digit of the value, `0` for `None`
    fn digit(&self, name: &str, value: &HeaderValue) -> Result<u32, VHeaderError> {
        if value.is_absent() {
            return Ok(0);
        }
        self.values
            .iter()
            .position(|v| v == value)
            .map(|i| i as u32 + 1)
            .ok_or_else(|| VHeaderError::UnknownValue(name.to_string(), value.clone()))
    }

    fn value(&self, digit: u32) -> HeaderValue {
        match digit {
            0 => HeaderValue::Absent,
            d => self.values.get(d as usize - 1).cloned().unwrap_or(HeaderValue::Absent),
        }
    }
}

/// Bit layout of a stage
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageLayout {
    /// Fields of the stage, ordered by name
    pub fields: Vec<String>,
    /// Offset of the lowest bit
    pub offset: u32,
    /// Number of bits
    pub width: u32,
}

fn ceil_log2(x: u64) -> u32 {
    if x <= 1 {
        0
    } else {
        64 - (x - 1).leading_zeros()
    }
}

/// Split a tag into `(vlan_id, vlan_pcp)`
pub fn split_tag(tag: u16) -> (u32, u32) {
    ((tag & 0xfff) as u32, ((tag >> 12) & 0x7) as u32)
}

/// Join `vlan_id` and `vlan_pcp` into a tag
pub fn join_tag(vlan_id: u32, vlan_pcp: u32) -> u16 {
    ((vlan_id & 0xfff) | ((vlan_pcp & 0x7) << 12)) as u16
}

/// # Virtual Field Registry
#[derive(Debug, Clone, Default, PartialEq)]
pub struct VirtualFieldRegistry {
    fields: BTreeMap<String, VirtualField>,
    stages: BTreeMap<u32, StageLayout>,
}

impl VirtualFieldRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` if no field is registered
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Returns `true` if the field is registered
    pub fn is_virtual(&self, field: &str) -> bool {
        self.fields.contains_key(field)
    }

    /// Returns the layout of all stages
    pub fn stages(&self) -> &BTreeMap<u32, StageLayout> {
        &self.stages
    }

    /// Register a virtual field with its values in a stage. Fails if the field exists, or if the
    /// tag register overflows. In both cases, the registry is unchanged.
    pub fn register(&mut self, name: &str, values: Vec<HeaderValue>, stage: u32) -> Result<(), VHeaderError> {
        if self.fields.contains_key(name) {
            return Err(VHeaderError::DuplicateField(name.to_string()));
        }
        let mut fields = self.fields.clone();
        fields.insert(name.to_string(), VirtualField { values, stage });
        let stages = Self::layout(&fields);
        let total: u32 = stages.values().map(|s| s.width).sum();
        if total > TAG_BITS {
            return Err(VHeaderError::TagOverflow(total));
        }
        debug!("registered virtual field {} in stage {} ({} bits used)", name, stage, total);
        self.fields = fields;
        self.stages = stages;
        Ok(())
    }

    fn layout(fields: &BTreeMap<String, VirtualField>) -> BTreeMap<u32, StageLayout> {
        let mut by_stage: BTreeMap<u32, Vec<String>> = BTreeMap::new();
        for (name, f) in fields.iter() {
            by_stage.entry(f.stage).or_insert_with(Vec::new).push(name.clone());
        }
        let mut offset = 0;
        by_stage
            .into_iter()
            .map(|(stage, names)| {
                let product: u64 = names.iter().map(|n| fields[n].cardinality() as u64).product();
                let width = ceil_log2(product);
                let layout = StageLayout { fields: names, offset, width };
                offset += width;
                (stage, layout)
            })
            .collect()
    }

    /// Forget all fields
    pub fn clear(&mut self) {
        self.fields.clear();
        self.stages.clear();
    }

    fn field(&self, name: &str) -> Result<&VirtualField, VHeaderError> {
        self.fields.get(name).ok_or_else(|| VHeaderError::UnknownVirtualField(name.to_string()))
    }

    /// Encode the fields of a single stage. Missing fields of the stage are `None`.
    fn encode_stage(&self, stage: u32, assignment: &HeaderMap) -> Result<u16, VHeaderError> {
        let layout = match self.stages.get(&stage) {
            Some(l) => l,
            None => return Ok(0),
        };
        let mut numeral: u32 = 0;
        for name in layout.fields.iter() {
            let field = self.field(name)?;
            let digit = match assignment.get(name) {
                Some(v) => field.digit(name, v)?,
                None => 0,
            };
            numeral = numeral * field.cardinality() + digit;
        }
        Ok((numeral << layout.offset) as u16)
    }

    /// Compress an assignment of virtual fields into a tag. All fields must belong to the same
    /// stage. Fields of that stage missing in the assignment are encoded as `None`, and so are
    /// all other stages.
    pub fn compress(&self, assignment: &HeaderMap) -> Result<u16, VHeaderError> {
        let mut stages = BTreeSet::new();
        for name in assignment.keys() {
            stages.insert(self.field(name)?.stage);
        }
        if stages.len() > 1 {
            return Err(VHeaderError::CrossStageUse(assignment.keys().cloned().collect()));
        }
        match stages.into_iter().next() {
            Some(stage) => self.encode_stage(stage, assignment),
            None => Ok(0),
        }
    }

    /// Encode the virtual fields of all stages at once. Used when sending a packet.
    pub fn encode_all(&self, assignment: &HeaderMap) -> Result<u16, VHeaderError> {
        for name in assignment.keys() {
            self.field(name)?;
        }
        let mut tag = 0;
        for stage in self.stages.keys() {
            tag |= self.encode_stage(*stage, assignment)?;
        }
        Ok(tag)
    }

    /// Expand a tag into the values of all registered fields (`Absent` for `None`).
    pub fn expand(&self, tag: u16) -> HeaderMap {
        let mut result = HeaderMap::new();
        for layout in self.stages.values() {
            let mask = (1u32 << layout.width) - 1;
            let mut numeral = (tag as u32 >> layout.offset) & mask;
            for name in layout.fields.iter().rev() {
                if let Some(field) = self.fields.get(name) {
                    let card = field.cardinality();
                    result.insert(name.clone(), field.value(numeral % card));
                    numeral /= card;
                }
            }
        }
        result
    }

    /// Modification that sets every virtual field to `None`. Used to remove the tag at the edge
    /// of the network.
    pub fn virtual_none(&self) -> Policy {
        let (id, pcp) = split_tag(0);
        let mut fields = HeaderMap::new();
        fields.insert(VLAN_ID.to_string(), HeaderValue::Int(id));
        fields.insert(VLAN_PCP.to_string(), HeaderValue::Int(pcp));
        modify(fields)
    }

    /// Split a header map into the virtual fields and the rest.
    fn partition(&self, fields: &HeaderMap) -> (HeaderMap, HeaderMap) {
        fields.iter().map(|(k, v)| (k.clone(), v.clone())).partition(|(k, _)| self.is_virtual(k))
    }

    fn tag_fields(&self, tag: u16, helpers: Option<u32>) -> HeaderMap {
        let (id, pcp) = split_tag(tag);
        let mut fields = HeaderMap::new();
        fields.insert(VLAN_ID.to_string(), HeaderValue::Int(id));
        fields.insert(VLAN_PCP.to_string(), HeaderValue::Int(pcp));
        if let Some(stage) = helpers.and_then(|s| self.stages.get(&s)) {
            fields.insert(VLAN_OFFSET.to_string(), HeaderValue::Int(stage.offset));
            fields.insert(VLAN_NBITS.to_string(), HeaderValue::Int(stage.width));
            fields.insert(VLAN_TOTAL_STAGES.to_string(), HeaderValue::Int(self.stages.len() as u32));
        }
        fields
    }

    /// Rewrite every match and modification of the classifier that mentions virtual fields into
    /// constraints on `vlan_id` and `vlan_pcp`. With `multi_table`, matches additionally carry the
    /// stage layout in the helper fields `vlan_offset`, `vlan_nbits` and `vlan_total_stages`.
    /// Rules whose match becomes unsatisfiable are removed.
    pub fn rewrite_classifier(&self, c: Classifier, multi_table: bool) -> Result<Classifier, VHeaderError> {
        if self.is_empty() {
            return Ok(c);
        }
        let mut rules = Vec::with_capacity(c.rules.len());
        for rule in c.rules.iter() {
            let (virt, plain) = self.partition(rule.matches.fields());
            let matches = if virt.is_empty() {
                Some(rule.matches.clone())
            } else {
                let stage = virt.keys().next().map(|k| self.field(k)).transpose()?.map(|f| f.stage);
                let tag = self.compress(&virt)?;
                let helpers = if multi_table { stage } else { None };
                Match::new(plain).intersect(&Match::new(self.tag_fields(tag, helpers)))
            };
            let matches = match matches {
                Some(m) => m,
                None => continue,
            };
            let actions = rule
                .actions
                .iter()
                .map(|a| match a {
                    Action::Modify(fields) => {
                        let (virt, mut plain) = self.partition(fields);
                        if !virt.is_empty() {
                            plain.extend(self.tag_fields(self.compress(&virt)?, None));
                        }
                        Ok(Action::Modify(plain))
                    }
                    a => Ok(a.clone()),
                })
                .collect::<Result<Vec<_>, VHeaderError>>()?;
            rules.push(Rule::derived(matches, actions, &[rule]));
        }
        Ok(Classifier::new(rules))
    }
}
