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

//! # Network View
//!
//! The [`Topology`] is an undirected graph of switches, built from the events reported by the
//! switch driver ([`TopologyEvent`]). The [`NetworkView`] collects the events and commits a new
//! topology snapshot once they quiesce.

mod events;
mod topology;

pub use events::{EventEffect, NetworkView, TopologyEvent};
pub use topology::{
    Link, Location, Port, PortChange, PortNo, PortType, SwitchId, SwitchNode, Topology,
    TopologyError,
};
