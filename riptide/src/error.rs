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

//! Module containing all error types

use crate::buckets::BucketError;
use crate::classifier::ClassifierError;
use crate::compile::CompileError;
use crate::netkat::NetkatError;
use crate::network::TopologyError;
use crate::packet::PacketError;
use crate::runtime::{DiffError, DriverError, RuntimeError};
use crate::vheader::VHeaderError;
use thiserror::Error;

/// Main error type
#[derive(Debug, Error)]
pub enum Error {
    /// Invalid header value
    #[error("Packet Error: {0}")]
    PacketError(#[from] PacketError),
    /// Error of the classifier algebra
    #[error("Classifier Error: {0}")]
    ClassifierError(#[from] ClassifierError),
    /// The policy cannot be compiled
    #[error("Compile Error: {0}")]
    CompileError(#[from] CompileError),
    /// Error while packing virtual fields into the tag
    #[error("Virtual Header Error: {0}")]
    VHeaderError(#[from] VHeaderError),
    /// Error of a bucket
    #[error("Bucket Error: {0}")]
    BucketError(#[from] BucketError),
    /// Invalid topology event
    #[error("Topology Error: {0}")]
    TopologyError(#[from] TopologyError),
    /// Error of the update engine
    #[error("Runtime Error: {0}")]
    RuntimeError(#[from] RuntimeError),
    /// Error of the NetKAT codec
    #[error("NetKAT Error: {0}")]
    NetkatError(#[from] NetkatError),
    /// The installed rules are inconsistent with a patch
    #[error("Diff Error: {0}")]
    DiffError(#[from] DiffError),
    /// A switch could not be reached
    #[error("Driver Error: {0}")]
    DriverError(#[from] DriverError),
    /// Invalid JSON input
    #[error("JSON Error: {0}")]
    JsonError(#[from] serde_json::Error),
    /// File could not be read
    #[error("IO Error: {0}")]
    IoError(#[from] std::io::Error),
}
