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

//! # Version Cookies
//!
//! Every installed rule carries a 16-bit cookie. The upper 5 bits name the flow table, and the
//! lower 11 bits the generation of the update cycle that installed the rule. Generation 0 is
//! reserved for the platform default rules.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Number of bits used for the table id
pub const TABLE_BITS: u32 = 5;
/// Number of bits used for the generation
pub const GENERATION_BITS: u32 = 11;
/// Largest generation before the counter wraps
pub const MAX_GENERATION: u16 = (1 << GENERATION_BITS) - 1;
/// Largest table id
pub const MAX_TABLE: u8 = (1 << TABLE_BITS) - 1;

/// Cookie of a flow-table rule
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub struct Cookie(u16);

impl Cookie {
    /// Build the cookie from table and generation. Both are truncated to their bit width.
    pub fn new(table: u8, generation: u16) -> Self {
        Self(((table & MAX_TABLE) as u16) << GENERATION_BITS | (generation & MAX_GENERATION))
    }

    /// Interpret a raw cookie
    pub fn from_raw(raw: u16) -> Self {
        Self(raw)
    }

    /// Raw value sent to the switch
    pub fn raw(&self) -> u16 {
        self.0
    }

    /// Table id
    pub fn table(&self) -> u8 {
        (self.0 >> GENERATION_BITS) as u8
    }

    /// Generation of the update cycle
    pub fn generation(&self) -> u16 {
        self.0 & MAX_GENERATION
    }

    /// Returns `true` for the cookie of the platform default rules
    pub fn is_default(&self) -> bool {
        self.generation() == 0
    }
}

impl fmt::Display for Cookie {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "t{}g{}", self.table(), self.generation())
    }
}

/// Monotonic generation counter of a single table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct GenerationCounter {
    current: u16,
}

impl GenerationCounter {
    /// Create a counter that has not issued any generation yet
    pub fn new() -> Self {
        Self::default()
    }

    /// The last issued generation, or 0 if none was issued.
    pub fn current(&self) -> u16 {
        self.current
    }

    /// Issue the next generation. After [`MAX_GENERATION`], the counter wraps to 1, and the
    /// second value is `true`.
    pub fn next(&mut self) -> (u16, bool) {
        let wrapped = self.current >= MAX_GENERATION;
        self.current = if wrapped { 1 } else { self.current + 1 };
        (self.current, wrapped)
    }
}
