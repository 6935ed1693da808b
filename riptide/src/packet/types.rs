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

//! Module containing the address types used in packet headers

use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;
use thiserror::Error;

/// Error while parsing or building header values
#[derive(Error, Debug, PartialEq)]
pub enum PacketError {
    /// The string is not a valid IPv4 address or prefix
    #[error("Invalid IPv4 address or prefix: {0}")]
    InvalidIp(String),
    /// The prefix length is larger than 32
    #[error("Invalid prefix length: /{0}")]
    InvalidPrefixLength(u8),
    /// The string is not a valid Ethernet address
    #[error("Invalid MAC address: {0}")]
    InvalidMac(String),
}

/// # IPv4 Prefix
/// An IPv4 network in CIDR notation. A single host address is represented as a `/32` prefix. The
/// host bits of the address are always zero, so two prefixes are equal if and only if they denote
/// the same set of addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct IpPrefix {
    addr: Ipv4Addr,
    len: u8,
}

impl IpPrefix {
    /// Create a new prefix. The host bits of `addr` are cleared.
    pub fn new(addr: Ipv4Addr, len: u8) -> Result<Self, PacketError> {
        if len > 32 {
            return Err(PacketError::InvalidPrefixLength(len));
        }
        Ok(Self { addr: Ipv4Addr::from(u32::from(addr) & Self::mask(len)), len })
    }

    /// Create a `/32` prefix for a single host
    pub fn host(addr: Ipv4Addr) -> Self {
        Self { addr, len: 32 }
    }

    fn mask(len: u8) -> u32 {
        if len == 0 {
            0
        } else {
            u32::MAX << (32 - len as u32)
        }
    }

    /// Network address of the prefix
    pub fn addr(&self) -> Ipv4Addr {
        self.addr
    }

    /// Length of the prefix in bits
    pub fn prefix_len(&self) -> u8 {
        self.len
    }

    /// Returns `true` if the prefix denotes a single host
    pub fn is_host(&self) -> bool {
        self.len == 32
    }

    /// Returns `true` if every address of `other` is also inside `self`.
    pub fn contains(&self, other: &IpPrefix) -> bool {
        self.len <= other.len && u32::from(other.addr) & Self::mask(self.len) == u32::from(self.addr)
    }
}

impl From<Ipv4Addr> for IpPrefix {
    fn from(addr: Ipv4Addr) -> Self {
        Self::host(addr)
    }
}

impl FromStr for IpPrefix {
    type Err = PacketError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || PacketError::InvalidIp(s.to_string());
        match s.split_once('/') {
            Some((addr, len)) => {
                let addr = addr.parse::<Ipv4Addr>().map_err(|_| invalid())?;
                let len = len.parse::<u8>().map_err(|_| invalid())?;
                Self::new(addr, len)
            }
            None => Ok(Self::host(s.parse::<Ipv4Addr>().map_err(|_| invalid())?)),
        }
    }
}

impl fmt::Display for IpPrefix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_host() {
            write!(f, "{}", self.addr)
        } else {
            write!(f, "{}/{}", self.addr, self.len)
        }
    }
}

impl Serialize for IpPrefix {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for IpPrefix {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(de::Error::custom)
    }
}

/// # Ethernet Address
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct MacAddr(pub [u8; 6]);

impl MacAddr {
    /// Build the address from the lower 48 bits of `x`.
    pub fn from_u64(x: u64) -> Self {
        let b = x.to_be_bytes();
        Self([b[2], b[3], b[4], b[5], b[6], b[7]])
    }

    /// Returns the address as an integer
    pub fn to_u64(&self) -> u64 {
        self.0.iter().fold(0u64, |acc, b| (acc << 8) | *b as u64)
    }
}

impl FromStr for MacAddr {
    type Err = PacketError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut bytes = [0u8; 6];
        let mut parts = s.split(|c| c == ':' || c == '-');
        for byte in bytes.iter_mut() {
            let part = parts.next().ok_or_else(|| PacketError::InvalidMac(s.to_string()))?;
            *byte =
                u8::from_str_radix(part, 16).map_err(|_| PacketError::InvalidMac(s.to_string()))?;
        }
        if parts.next().is_some() {
            return Err(PacketError::InvalidMac(s.to_string()));
        }
        Ok(Self(bytes))
    }
}

impl fmt::Display for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let b = self.0;
        write!(f, "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}", b[0], b[1], b[2], b[3], b[4], b[5])
    }
}

impl Serialize for MacAddr {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for MacAddr {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(de::Error::custom)
    }
}
