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

//! # Located Packets
//!
//! A [`Packet`] is an immutable record of header fields. Two of the fields, `switch` and `inport`
//! (or `outport`), place the packet at a specific point in the network. Every header holds a
//! stack of values, where only the top of the stack is visible to matches and modifications.
//! [`Packet::push`], [`Packet::pop`] and [`Packet::move_field`] operate on the stack, and are used
//! by the virtualization layer to temporarily replace the location of a packet.
//!
//! Header names are plain strings. The recognized names are grouped into *basic*, *tagging*,
//! *location* and *content* headers. Only the first three groups are *compilable*, i.e., they can
//! be realized by flow-table entries on a switch.

mod types;
pub use types::{IpPrefix, MacAddr, PacketError};

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::net::Ipv4Addr;

/// Switch location header
pub const SWITCH: &str = "switch";
/// Ingress port header
pub const INPORT: &str = "inport";
/// Egress port header
pub const OUTPORT: &str = "outport";
/// Concrete port of a packet received from (or sent to) a switch driver
pub const PORT: &str = "port";
/// Source ethernet address
pub const SRCMAC: &str = "srcmac";
/// Destination ethernet address
pub const DSTMAC: &str = "dstmac";
/// Source IPv4 address
pub const SRCIP: &str = "srcip";
/// Destination IPv4 address
pub const DSTIP: &str = "dstip";
/// Type of service
pub const TOS: &str = "tos";
/// Source transport port
pub const SRCPORT: &str = "srcport";
/// Destination transport port
pub const DSTPORT: &str = "dstport";
/// Ethernet type
pub const ETHTYPE: &str = "ethtype";
/// IP protocol number
pub const PROTOCOL: &str = "protocol";
/// 12 bit vlan id
pub const VLAN_ID: &str = "vlan_id";
/// 3 bit vlan priority
pub const VLAN_PCP: &str = "vlan_pcp";
/// Bit offset of the virtual header stage inside the tag register
pub const VLAN_OFFSET: &str = "vlan_offset";
/// Bit width of the virtual header stage inside the tag register
pub const VLAN_NBITS: &str = "vlan_nbits";
/// Total number of virtual header stages
pub const VLAN_TOTAL_STAGES: &str = "vlan_total_stages";
/// Raw packet content
pub const RAW: &str = "raw";
/// Length of the packet header in bytes
pub const HEADER_LEN: &str = "header_len";
/// Length of the payload in bytes
pub const PAYLOAD_LEN: &str = "payload_len";

/// Basic L2-L4 headers
pub const BASIC_HEADERS: [&str; 9] =
    [SRCMAC, DSTMAC, SRCIP, DSTIP, TOS, SRCPORT, DSTPORT, ETHTYPE, PROTOCOL];
/// Headers describing the tag register and its helper metadata
pub const TAGGING_HEADERS: [&str; 5] =
    [VLAN_ID, VLAN_PCP, VLAN_OFFSET, VLAN_NBITS, VLAN_TOTAL_STAGES];
/// Headers describing the location of the packet
pub const LOCATION_HEADERS: [&str; 3] = [SWITCH, INPORT, OUTPORT];
/// Headers describing the content of the packet
pub const CONTENT_HEADERS: [&str; 3] = [RAW, HEADER_LEN, PAYLOAD_LEN];

/// Virtual output port that sends the packet back out of the port it arrived on
pub const OFPP_IN_PORT: u32 = 0xfff8;
/// Virtual output port that sends the packet to the controller
pub const OFPP_CONTROLLER: u32 = 0xfffd;
/// Ethertype of IPv4
pub const ETH_TYPE_IP: u32 = 0x0800;
/// Ethertype of ARP
pub const ETH_TYPE_ARP: u32 = 0x0806;
/// Ethertype of LLDP
pub const ETH_TYPE_LLDP: u32 = 0x88cc;
/// Ethertype of IPv6
pub const ETH_TYPE_IPV6: u32 = 0x86dd;
/// IP protocol number of TCP
pub const IP_PROTO_TCP: u32 = 6;
/// IP protocol number of UDP
pub const IP_PROTO_UDP: u32 = 17;

/// Returns `true` if the header can be realized by a flow-table entry.
pub fn is_compilable(header: &str) -> bool {
    BASIC_HEADERS.contains(&header)
        || TAGGING_HEADERS.contains(&header)
        || LOCATION_HEADERS.contains(&header)
}

/// Map from header name to value, used by matches and modifications.
pub type HeaderMap = BTreeMap<String, HeaderValue>;

/// Set of packets, the result of evaluating a policy.
pub type PacketSet = HashSet<Packet>;

/// # Header Value
/// Sum type of all values a header can take. `Absent` is the sentinel for a header that is not
/// set. Matching a field against `Absent` succeeds if the packet does not carry the field, and
/// modifying a field to `Absent` removes it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(untagged)]
pub enum HeaderValue {
    /// 32-bit integer
    Int(u32),
    /// IPv4 address or prefix
    Ip(IpPrefix),
    /// Ethernet address
    Mac(MacAddr),
    /// Opaque byte string
    Raw(Vec<u8>),
    /// Not set
    Absent,
}

impl HeaderValue {
    /// Parse an IPv4 address or prefix
    pub fn ip(s: &str) -> Result<Self, PacketError> {
        Ok(Self::Ip(s.parse()?))
    }

    /// Parse an ethernet address
    pub fn mac(s: &str) -> Result<Self, PacketError> {
        Ok(Self::Mac(s.parse()?))
    }

    /// Returns the integer, if the value is an integer.
    pub fn as_int(&self) -> Option<u32> {
        match self {
            Self::Int(x) => Some(*x),
            _ => None,
        }
    }

    /// Returns `true` if the value is `Absent`
    pub fn is_absent(&self) -> bool {
        matches!(self, Self::Absent)
    }

    /// Returns `true` if the pattern `self` accepts the value `other`. IP prefixes accept every
    /// address they contain, all other values must be equal.
    pub fn accepts(&self, other: &HeaderValue) -> bool {
        match (self, other) {
            (Self::Ip(a), Self::Ip(b)) => a.contains(b),
            (a, b) => a == b,
        }
    }
}

impl From<u32> for HeaderValue {
    fn from(x: u32) -> Self {
        Self::Int(x)
    }
}

impl From<IpPrefix> for HeaderValue {
    fn from(x: IpPrefix) -> Self {
        Self::Ip(x)
    }
}

impl From<Ipv4Addr> for HeaderValue {
    fn from(x: Ipv4Addr) -> Self {
        Self::Ip(IpPrefix::host(x))
    }
}

impl From<MacAddr> for HeaderValue {
    fn from(x: MacAddr) -> Self {
        Self::Mac(x)
    }
}

impl fmt::Display for HeaderValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Int(x) => write!(f, "{}", x),
            Self::Ip(x) => write!(f, "{}", x),
            Self::Mac(x) => write!(f, "{}", x),
            Self::Raw(x) => write!(f, "<{} bytes>", x.len()),
            Self::Absent => write!(f, "None"),
        }
    }
}

/// # Located Packet
/// Immutable record of header stacks. Every operation returns a modified copy.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub struct Packet {
    headers: BTreeMap<String, Vec<HeaderValue>>,
}

impl Packet {
    /// Create an empty packet
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a copy of the packet with the header set. Builder style.
    pub fn with<V: Into<HeaderValue>>(self, header: &str, value: V) -> Self {
        self.modify(header, value.into())
    }

    /// Returns the visible value of the header, or `None` if it is not set.
    pub fn get(&self, header: &str) -> Option<&HeaderValue> {
        self.headers.get(header).and_then(|stack| stack.last()).filter(|v| !v.is_absent())
    }

    /// Returns the visible value of the header as an integer.
    pub fn get_int(&self, header: &str) -> Option<u32> {
        self.get(header).and_then(HeaderValue::as_int)
    }

    /// Iterate over all headers with a visible value.
    pub fn fields(&self) -> impl Iterator<Item = (&str, &HeaderValue)> {
        self.headers
            .iter()
            .filter_map(|(k, stack)| stack.last().filter(|v| !v.is_absent()).map(|v| (k.as_str(), v)))
    }

    /// Returns a copy where the top of the header stack is replaced by `value`.
    pub fn modify(&self, header: &str, value: HeaderValue) -> Self {
        let mut pkt = self.clone();
        pkt.modify_in_place(header, value);
        pkt
    }

    /// Returns a copy where all headers of the map are replaced.
    pub fn modify_many(&self, headers: &HeaderMap) -> Self {
        let mut pkt = self.clone();
        for (h, v) in headers.iter() {
            pkt.modify_in_place(h, v.clone());
        }
        pkt
    }

    fn modify_in_place(&mut self, header: &str, value: HeaderValue) {
        let stack = self.headers.entry(header.to_string()).or_insert_with(Vec::new);
        match stack.last_mut() {
            Some(top) => *top = value,
            None => stack.push(value),
        }
        // a single absent value is the same as no value at all
        if stack.len() == 1 && stack[0].is_absent() {
            self.headers.remove(header);
        }
    }

    /// Returns a copy where `value` is pushed on top of the header stack.
    pub fn push(&self, header: &str, value: HeaderValue) -> Self {
        let mut pkt = self.clone();
        pkt.headers.entry(header.to_string()).or_insert_with(Vec::new).push(value);
        pkt
    }

    /// Returns a copy where the top of the header stack is removed.
    pub fn pop(&self, header: &str) -> Self {
        let mut pkt = self.clone();
        pkt.pop_in_place(header);
        pkt
    }

    fn pop_in_place(&mut self, header: &str) -> Option<HeaderValue> {
        let stack = self.headers.get_mut(header)?;
        let value = stack.pop();
        if stack.is_empty() {
            self.headers.remove(header);
        }
        value
    }

    /// Returns a copy where the top of `src` is popped and pushed onto `dst`.
    pub fn move_field(&self, dst: &str, src: &str) -> Self {
        let mut pkt = self.clone();
        let value = pkt.pop_in_place(src).unwrap_or(HeaderValue::Absent);
        pkt.headers.entry(dst.to_string()).or_insert_with(Vec::new).push(value);
        pkt
    }

    /// Size of the packet (header and payload) in bytes, as far as it is known.
    pub fn size(&self) -> u64 {
        self.get_int(HEADER_LEN).unwrap_or(0) as u64 + self.get_int(PAYLOAD_LEN).unwrap_or(0) as u64
    }
}

impl fmt::Display for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{")?;
        for (i, (h, v)) in self.fields().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}: {}", h, v)?;
        }
        write!(f, "}}")
    }
}
