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

//! Module containing the configuration of the runtime

use super::RuntimeError;

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// How an update cycle installs the new rules
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstallMode {
    /// Clear the tables and install every rule again
    Nuclear,
    /// Install only the difference to the rules already on the switches
    Incremental,
}

/// Which compiler produces the classifiers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompileBackend {
    /// The classifier algebra of this crate
    InMemory,
    /// An external NetKAT compile service
    Netkat,
}

/// # Runtime Configuration
/// Every field has a default, so a configuration file only needs to name the fields it changes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Installation mode of the update cycles
    pub install_mode: InstallMode,
    /// Compile for a multi-table pipeline
    pub multi_table: bool,
    /// Minimum time between two flow statistics requests to the same switch, in seconds
    pub requery_interval_secs: u64,
    /// Quiet time after a topology event before the topology is committed, in milliseconds
    pub debounce_ms: u64,
    /// Rules feeding count buckets ask for flow-removed notifications
    pub notify_on_remove: bool,
    /// Compiler backend
    pub compile_backend: CompileBackend,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            install_mode: InstallMode::Incremental,
            multi_table: false,
            requery_interval_secs: 5,
            debounce_ms: 0,
            notify_on_remove: true,
            compile_backend: CompileBackend::InMemory,
        }
    }
}

impl RuntimeConfig {
    /// Parse a configuration from a JSON string
    pub fn from_json(s: &str) -> Result<Self, RuntimeError> {
        serde_json::from_str(s).map_err(|e| RuntimeError::Config(e.to_string()))
    }

    /// Read a configuration from a JSON file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, RuntimeError> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| RuntimeError::Config(format!("{}: {}", path.as_ref().display(), e)))?;
        Self::from_json(&content)
    }

    /// Minimum re-query interval
    pub fn requery_interval(&self) -> Duration {
        Duration::from_secs(self.requery_interval_secs)
    }

    /// Debounce window of the topology
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }
}
