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

#![deny(missing_docs)]

//! # Riptide: Compiling Network Policies into Flow-Table Updates
//! This is a library for writing the forwarding behavior of a software-defined network as a
//! composable policy, and keeping the flow tables of the switches in sync with it while the
//! policy and the topology change.
//!
//! ## Structure
//!
//! - **[`Packets`](packet)**: Located packets, header values and the header sets that can be
//!   realized on a switch.
//!
//! - **[`Policies`](policy)**: The policy language. Policies are built from primitives (filters,
//!   modifications, forwarding, buckets) and composed in parallel (`+`) or in sequence (`>>`).
//!   [`DynamicPolicy`](policy::DynamicPolicy) cells change at runtime.
//!
//! - **[`Classifiers`](classifier)**: Prioritized rule lists, and the algebra to compose them.
//!
//! - **[`Compiler`](compile)**: Translates a policy into a classifier, memoizing the classifiers
//!   of dynamic cells.
//!
//! - **[`Virtual Headers`](vheader)**: Packs user-defined fields into the 15 bits of the VLAN
//!   tag, so that switches can match and modify them.
//!
//! - **[`Buckets`](buckets)**: Sinks collecting packets or counters, which are delivered to
//!   callbacks.
//!
//! - **[`Network`](network)**: The topology, as reported by the switches.
//!
//! - **[`Runtime`](runtime)**: The update engine, computing the minimal set of flow-table changes
//!   for every new policy or topology, and talking to the switches through a
//!   [`SwitchDriver`](runtime::SwitchDriver).
//!
//! - **[`Virtualization`](virt)**: Run a policy on a derived network, like a single big switch.
//!
//! - **[`NetKAT`](netkat)**: Codec for an external compile service.
//!
//! ## Usage
//!
//! ```
//! use riptide::policy::*;
//! use riptide::runtime::{RecordingDriver, Runtime, RuntimeConfig};
//! use riptide::network::TopologyEvent;
//! use riptide::Error;
//!
//! fn main() -> Result<(), Error> {
//!     let driver = RecordingDriver::new();
//!     let runtime = Runtime::new(RuntimeConfig::default(), driver.clone());
//!
//!     runtime.handle_switch_join(1)?;
//!     runtime.set_policy(match_field("switch", 1u32) >> fwd(2))?;
//!     runtime.flush();
//!
//!     for cmd in driver.commands() {
//!         println!("{}", cmd);
//!     }
//!     Ok(())
//! }
//! ```

pub mod buckets;
pub mod classifier;
pub mod compile;
mod error;
pub mod netkat;
pub mod network;
pub mod packet;
pub mod policy;
pub mod runtime;
pub mod vheader;
pub mod virt;

// test modules
#[cfg(test)]
mod test;

pub use error::Error;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

static NEXT_ID: AtomicUsize = AtomicUsize::new(1);

/// Returns a process-wide unique id, used for buckets and dynamic cells.
pub(crate) fn next_id() -> usize {
    NEXT_ID.fetch_add(1, Ordering::SeqCst)
}

/// Lock the mutex, taking over a poisoned lock.
pub(crate) fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}
