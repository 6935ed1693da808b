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

//! # Switch Driver
//!
//! The runtime talks to the switches through a [`SwitchDriver`], which receives a stream of
//! [`DriverCommand`]s. Transport failures are reported as [`DriverError`], which the runtime logs
//! without aborting the update cycle.
//!
//! [`RecordingDriver`] keeps every command in memory. It is used by the command line front-end
//! and by the tests.

use super::cookie::Cookie;
use crate::classifier::Match;
use crate::lock;
use crate::network::{Location, SwitchId};
use crate::packet::{HeaderMap, Packet};

use serde::Serialize;
use std::collections::HashSet;
use std::fmt;
use std::sync::{Arc, Mutex};
use thiserror::Error;

/// Action of a rule as installed on a switch
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub enum ConcreteAction {
    /// Rewrite the fields (at least `outport` on a single-table pipeline) and forward.
    Forward(HeaderMap),
    /// Send the packet to the controller
    Controller,
}

impl fmt::Display for ConcreteAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Controller => write!(f, "CONTROLLER"),
            Self::Forward(map) => {
                write!(f, "{{")?;
                for (i, (k, v)) in map.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}: {}", k, v)?;
                }
                write!(f, "}}")
            }
        }
    }
}

/// Flow-table entry sent to a switch
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FlowSpec {
    /// Datapath id
    pub switch: SwitchId,
    /// Flow table
    pub table: u8,
    /// Match of the entry
    pub matches: Match,
    /// Priority of the entry
    pub priority: u16,
    /// Actions of the entry
    pub actions: Vec<ConcreteAction>,
    /// Version cookie
    pub cookie: Cookie,
    /// Ask the switch for a flow-removed notification
    pub notify_on_remove: bool,
}

/// Counters of a flow-table entry, reported by a switch
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FlowStat {
    /// Match of the entry
    pub matches: Match,
    /// Priority of the entry
    pub priority: u16,
    /// Version cookie
    pub cookie: Cookie,
    /// Packet counter
    pub packets: u64,
    /// Byte counter
    pub bytes: u64,
    /// Actions of the entry, if the switch reports them
    pub actions: Option<Vec<ConcreteAction>>,
}

/// Command sent to the switch driver
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "cmd", rename_all = "snake_case")]
pub enum DriverCommand {
    /// Install a new entry
    Install(FlowSpec),
    /// Replace the actions of an existing entry. The entry takes over the cookie of the spec
    /// and keeps its counters, so later statistics report them under the new cookie. No
    /// flow-removed notification is expected for the old cookie.
    Modify(FlowSpec),
    /// Delete the entry with the match and priority
    Delete {
        /// Datapath id
        switch: SwitchId,
        /// Flow table
        table: u8,
        /// Match of the entry
        matches: Match,
        /// Priority of the entry
        priority: u16,
    },
    /// Remove all entries of a table
    Clear {
        /// Datapath id
        switch: SwitchId,
        /// Flow table
        table: u8,
    },
    /// Wait until all earlier commands are processed
    Barrier {
        /// Datapath id
        switch: SwitchId,
    },
    /// Send a concrete packet (carrying `switch` and `port`)
    SendPacket {
        /// The packet
        packet: Packet,
    },
    /// Request the counters of all entries
    FlowStatsRequest {
        /// Datapath id
        switch: SwitchId,
    },
    /// Send a link discovery packet out of a port
    InjectDiscovery {
        /// Port to send the packet on
        location: Location,
    },
}

impl DriverCommand {
    /// Switch the command is addressed to
    pub fn switch(&self) -> Option<SwitchId> {
        match self {
            Self::Install(spec) | Self::Modify(spec) => Some(spec.switch),
            Self::Delete { switch, .. }
            | Self::Clear { switch, .. }
            | Self::Barrier { switch }
            | Self::FlowStatsRequest { switch } => Some(*switch),
            Self::SendPacket { packet } => packet.get_int(crate::packet::SWITCH),
            Self::InjectDiscovery { location } => Some(location.switch),
        }
    }
}

impl fmt::Display for DriverCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let actions = |actions: &[ConcreteAction]| {
            actions.iter().map(|a| a.to_string()).collect::<Vec<_>>().join(", ")
        };
        match self {
            Self::Install(s) => write!(
                f,
                "install s{} t{} prio {} {} -> [{}] ({})",
                s.switch,
                s.table,
                s.priority,
                s.matches,
                actions(&s.actions),
                s.cookie
            ),
            Self::Modify(s) => write!(
                f,
                "modify  s{} t{} prio {} {} -> [{}] ({})",
                s.switch,
                s.table,
                s.priority,
                s.matches,
                actions(&s.actions),
                s.cookie
            ),
            Self::Delete { switch, table, matches, priority } => {
                write!(f, "delete  s{} t{} prio {} {}", switch, table, priority, matches)
            }
            Self::Clear { switch, table } => write!(f, "clear   s{} t{}", switch, table),
            Self::Barrier { switch } => write!(f, "barrier s{}", switch),
            Self::SendPacket { packet } => write!(f, "send    {}", packet),
            Self::FlowStatsRequest { switch } => write!(f, "stats   s{}", switch),
            Self::InjectDiscovery { location } => write!(f, "lldp    {}", location),
        }
    }
}

/// Transport error of the switch driver
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DriverError {
    /// The switch is not connected
    #[error("Switch {0} is not connected")]
    Disconnected(SwitchId),
    /// Any other transport failure
    #[error("Transport failure: {0}")]
    Transport(String),
}

/// Connection to the switches
pub trait SwitchDriver: Send {
    /// Execute a single command
    fn execute(&mut self, cmd: DriverCommand) -> Result<(), DriverError>;
}

/// # Recording Driver
/// Records every command. Clones share the same record, so one clone can be handed to the
/// runtime while another one is inspected.
#[derive(Debug, Clone, Default)]
pub struct RecordingDriver {
    commands: Arc<Mutex<Vec<DriverCommand>>>,
    disconnected: Arc<Mutex<HashSet<SwitchId>>>,
}

impl RecordingDriver {
    /// Create an empty recorder
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a copy of all recorded commands
    pub fn commands(&self) -> Vec<DriverCommand> {
        lock(&self.commands).clone()
    }

    /// Returns and forgets all recorded commands
    pub fn take(&self) -> Vec<DriverCommand> {
        std::mem::take(&mut *lock(&self.commands))
    }

    /// Commands to this switch fail with [`DriverError::Disconnected`] until it is reconnected.
    pub fn disconnect(&self, switch: SwitchId) {
        lock(&self.disconnected).insert(switch);
    }

    /// Accept commands to the switch again
    pub fn reconnect(&self, switch: SwitchId) {
        lock(&self.disconnected).remove(&switch);
    }
}

impl SwitchDriver for RecordingDriver {
    fn execute(&mut self, cmd: DriverCommand) -> Result<(), DriverError> {
        if let Some(sw) = cmd.switch() {
            if lock(&self.disconnected).contains(&sw) {
                return Err(DriverError::Disconnected(sw));
            }
        }
        lock(&self.commands).push(cmd);
        Ok(())
    }
}
