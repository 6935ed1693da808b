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

//! Module containing the topology events and the debounced network view

use super::topology::{Location, PortNo, PortType, SwitchId, Topology, TopologyError};

use log::*;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{Duration, Instant};

/// Event reported by the switch driver, changing the topology
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum TopologyEvent {
    /// A switch connected
    SwitchJoin {
        /// Datapath id
        switch: SwitchId,
    },
    /// A switch disconnected
    SwitchPart {
        /// Datapath id
        switch: SwitchId,
    },
    /// A port was added
    PortJoin {
        /// Datapath id
        switch: SwitchId,
        /// Port number
        port: PortNo,
        /// Administratively up
        config_up: bool,
        /// Link up
        status_up: bool,
        /// Port type
        #[serde(default)]
        port_type: PortType,
    },
    /// A port was removed
    PortPart {
        /// Datapath id
        switch: SwitchId,
        /// Port number
        port: PortNo,
    },
    /// The flags of a port changed
    PortMod {
        /// Datapath id
        switch: SwitchId,
        /// Port number
        port: PortNo,
        /// Administratively up
        config_up: bool,
        /// Link up
        status_up: bool,
    },
    /// Link discovery found a link between two ports
    LinkUpdate {
        /// First switch
        s1: SwitchId,
        /// Port on the first switch
        p1: PortNo,
        /// Second switch
        s2: SwitchId,
        /// Port on the second switch
        p2: PortNo,
    },
}

impl fmt::Display for TopologyEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SwitchJoin { switch } => write!(f, "switch {} joined", switch),
            Self::SwitchPart { switch } => write!(f, "switch {} left", switch),
            Self::PortJoin { switch, port, .. } => write!(f, "port {}[{}] joined", switch, port),
            Self::PortPart { switch, port } => write!(f, "port {}[{}] left", switch, port),
            Self::PortMod { switch, port, config_up, status_up } => write!(
                f,
                "port {}[{}] modified (config {}, status {})",
                switch, port, config_up, status_up
            ),
            Self::LinkUpdate { s1, p1, s2, p2 } => {
                write!(f, "link {}[{}] --- {}[{}]", s1, p1, s2, p2)
            }
        }
    }
}

/// Effect of an applied event
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EventEffect {
    /// The topology changed, and a network update must be fired.
    pub changed: bool,
    /// Discovery packets must be injected on these ports.
    pub discover: Vec<Location>,
}

/// # Network View
/// Events mutate the *next* topology. Once no event arrived for the debounce window, the next
/// topology becomes the *current* one, which is the snapshot every dynamic policy compiles against.
#[derive(Debug, Clone)]
pub struct NetworkView {
    current: Topology,
    next: Topology,
    debounce: Duration,
    last_event: Option<Instant>,
    dirty: bool,
}

impl NetworkView {
    /// Create an empty view with the given debounce window
    pub fn new(debounce: Duration) -> Self {
        let topo = Topology::new();
        Self { current: topo.clone(), next: topo, debounce, last_event: None, dirty: false }
    }

    /// The current topology snapshot
    pub fn current(&self) -> &Topology {
        &self.current
    }

    /// The topology including all events not yet committed
    pub fn next(&self) -> &Topology {
        &self.next
    }

    /// Returns `true` if events are waiting to be committed
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Apply an event to the next topology.
    pub fn apply(&mut self, event: &TopologyEvent, now: Instant) -> Result<EventEffect, TopologyError> {
        let mut effect = EventEffect::default();
        match *event {
            TopologyEvent::SwitchJoin { switch } => {
                if self.next.add_switch(switch) {
                    info!("OpenFlow switch {} connected", switch);
                    effect.changed = true;
                }
            }
            TopologyEvent::SwitchPart { switch } => {
                self.next.remove_switch(switch)?;
                info!("OpenFlow switch {} disconnected", switch);
                effect.changed = true;
            }
            TopologyEvent::PortJoin { switch, port, config_up, status_up, port_type } => {
                let loc = Location::new(switch, port);
                self.next.add_port(loc, config_up, status_up, port_type)?;
                if config_up || status_up {
                    effect.discover.push(loc);
                    effect.changed = true;
                }
            }
            TopologyEvent::PortPart { switch, port } => {
                self.next.remove_port(Location::new(switch, port))?;
                effect.changed = true;
            }
            TopologyEvent::PortMod { switch, port, config_up, status_up } => {
                let loc = Location::new(switch, port);
                let change = self.next.modify_port(loc, config_up, status_up)?;
                if change.config_down || change.status_down {
                    self.next.remove_associated_link(loc)?;
                    effect.changed = true;
                }
                if change.status_down || change.came_up {
                    effect.discover.push(loc);
                }
                if change.came_up {
                    effect.changed = true;
                }
            }
            TopologyEvent::LinkUpdate { s1, p1, s2, p2 } => {
                effect.changed =
                    self.next.update_link(Location::new(s1, p1), Location::new(s2, p2))?;
            }
        }
        if effect.changed {
            self.dirty = true;
            self.last_event = Some(now);
        }
        Ok(effect)
    }

    /// Commit the next topology if the debounce window elapsed. Returns the new snapshot.
    pub fn poll(&mut self, now: Instant) -> Option<&Topology> {
        if !self.dirty {
            return None;
        }
        let quiet = match self.last_event {
            Some(t) => now.saturating_duration_since(t) >= self.debounce,
            None => true,
        };
        if !quiet {
            return None;
        }
        self.current = self.next.clone();
        self.dirty = false;
        debug!("committed topology version {}", self.current.version());
        Some(&self.current)
    }

    /// Replace both the current and next topology
    pub fn reset(&mut self, topo: Topology) {
        self.next = topo.clone();
        self.current = topo;
        self.dirty = false;
    }
}
