// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

use serde::Deserialize;
use serde::Serialize;
use std::fmt;
use std::fmt::Display;
use std::net::IpAddr;
use std::net::Ipv4Addr;
use std::net::Ipv6Addr;
use std::str::FromStr;

pub const PROTO_ICMP: u8 = 0x1;
pub const PROTO_IGMP: u8 = 0x2;
pub const PROTO_TCP: u8 = 0x6;
pub const PROTO_UDP: u8 = 0x11;
pub const PROTO_ICMPV6: u8 = 0x3A;
pub const PROTO_SCTP: u8 = 0x84;

/// An upper-layer protocol.
#[derive(
    Clone,
    Copy,
    Debug,
    Deserialize,
    Eq,
    Hash,
    Ord,
    PartialEq,
    PartialOrd,
    Serialize,
)]
pub enum Protocol {
    ICMP,
    IGMP,
    TCP,
    UDP,
    ICMPv6,
    SCTP,
    Unknown(u8),
}

impl Protocol {
    /// Does this protocol carry source and destination ports?
    pub fn has_ports(&self) -> bool {
        matches!(self, Self::TCP | Self::UDP | Self::SCTP)
    }

    pub fn number(&self) -> u8 {
        match self {
            Self::ICMP => PROTO_ICMP,
            Self::IGMP => PROTO_IGMP,
            Self::TCP => PROTO_TCP,
            Self::UDP => PROTO_UDP,
            Self::ICMPv6 => PROTO_ICMPV6,
            Self::SCTP => PROTO_SCTP,
            Self::Unknown(n) => *n,
        }
    }
}

impl Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::ICMP => write!(f, "ICMP"),
            Self::IGMP => write!(f, "IGMP"),
            Self::TCP => write!(f, "TCP"),
            Self::UDP => write!(f, "UDP"),
            Self::ICMPv6 => write!(f, "ICMPv6"),
            Self::SCTP => write!(f, "SCTP"),
            Self::Unknown(n) => write!(f, "{n}"),
        }
    }
}

impl From<u8> for Protocol {
    fn from(proto: u8) -> Self {
        match proto {
            PROTO_ICMP => Self::ICMP,
            PROTO_IGMP => Self::IGMP,
            PROTO_TCP => Self::TCP,
            PROTO_UDP => Self::UDP,
            PROTO_ICMPV6 => Self::ICMPv6,
            PROTO_SCTP => Self::SCTP,
            _ => Self::Unknown(proto),
        }
    }
}

impl FromStr for Protocol {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "icmp" => Ok(Self::ICMP),
            "igmp" => Ok(Self::IGMP),
            "tcp" => Ok(Self::TCP),
            "udp" => Ok(Self::UDP),
            "icmpv6" | "icmp6" => Ok(Self::ICMPv6),
            "sctp" => Ok(Self::SCTP),
            num => num
                .parse::<u8>()
                .map(Self::from)
                .map_err(|_| format!("bad protocol: {s}")),
        }
    }
}

/// The address family of an address or prefix.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum AddrFamily {
    Inet,
    Inet6,
}

impl Display for AddrFamily {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Inet => write!(f, "inet"),
            Self::Inet6 => write!(f, "inet6"),
        }
    }
}

pub fn addr_family(ip: &IpAddr) -> AddrFamily {
    match ip {
        IpAddr::V4(_) => AddrFamily::Inet,
        IpAddr::V6(_) => AddrFamily::Inet6,
    }
}

/// An IPv4 or IPv6 prefix.
///
/// The address is always stored with the host bits cleared, so two
/// prefixes covering the same addresses compare equal regardless of
/// how they were written.
#[derive(
    Clone,
    Copy,
    Debug,
    Deserialize,
    Eq,
    Hash,
    Ord,
    PartialEq,
    PartialOrd,
    Serialize,
)]
#[serde(try_from = "String", into = "String")]
pub struct IpCidr {
    ip: IpAddr,
    prefix_len: u8,
}

impl IpCidr {
    pub fn new(ip: IpAddr, prefix_len: u8) -> Result<Self, String> {
        let max = max_prefix_len(&ip);
        if prefix_len > max {
            return Err(format!(
                "bad prefix length for {}: {prefix_len}",
                addr_family(&ip),
            ));
        }

        Ok(Self { ip: mask(ip, prefix_len), prefix_len })
    }

    /// A prefix covering exactly one host.
    pub fn host(ip: IpAddr) -> Self {
        Self { ip, prefix_len: max_prefix_len(&ip) }
    }

    /// The prefix covering every address of the given family.
    pub fn any(family: AddrFamily) -> Self {
        match family {
            AddrFamily::Inet => {
                Self { ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED), prefix_len: 0 }
            }

            AddrFamily::Inet6 => {
                Self { ip: IpAddr::V6(Ipv6Addr::UNSPECIFIED), prefix_len: 0 }
            }
        }
    }

    pub fn ip(&self) -> IpAddr {
        self.ip
    }

    pub fn prefix_len(&self) -> u8 {
        self.prefix_len
    }

    pub fn max_prefix_len(&self) -> u8 {
        max_prefix_len(&self.ip)
    }

    pub fn family(&self) -> AddrFamily {
        addr_family(&self.ip)
    }

    /// Is `ip` within this prefix?
    pub fn contains(&self, ip: IpAddr) -> bool {
        addr_family(&ip) == self.family()
            && mask(ip, self.prefix_len) == self.ip
    }

    /// Is every address of `other` within this prefix?
    pub fn covers(&self, other: &IpCidr) -> bool {
        other.prefix_len >= self.prefix_len && self.contains(other.ip)
    }
}

fn max_prefix_len(ip: &IpAddr) -> u8 {
    match ip {
        IpAddr::V4(_) => 32,
        IpAddr::V6(_) => 128,
    }
}

fn mask(ip: IpAddr, prefix_len: u8) -> IpAddr {
    match ip {
        IpAddr::V4(ip4) => {
            let bits = u32::from(ip4);
            let mask = u32::MAX.checked_shl(32 - u32::from(prefix_len));
            IpAddr::V4(Ipv4Addr::from(bits & mask.unwrap_or(0)))
        }

        IpAddr::V6(ip6) => {
            let bits = u128::from(ip6);
            let mask = u128::MAX.checked_shl(128 - u32::from(prefix_len));
            IpAddr::V6(Ipv6Addr::from(bits & mask.unwrap_or(0)))
        }
    }
}

impl FromStr for IpCidr {
    type Err = String;

    /// Convert a string like "192.168.2.0/24" into an `IpCidr`. A bare
    /// address is taken as a host prefix.
    fn from_str(val: &str) -> Result<Self, Self::Err> {
        let Some((ip_s, prefix_s)) = val.split_once('/') else {
            let ip = val.parse().map_err(|e| format!("bad IP: {e}"))?;
            return Ok(Self::host(ip));
        };

        let ip = match ip_s.parse() {
            Ok(v) => v,
            Err(e) => return Err(format!("bad IP: {e}")),
        };

        let prefix_len = match prefix_s.parse::<u8>() {
            Ok(v) => v,
            Err(e) => return Err(format!("bad prefix length: {e}")),
        };

        Self::new(ip, prefix_len)
    }
}

impl TryFrom<String> for IpCidr {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<IpCidr> for String {
    fn from(cidr: IpCidr) -> Self {
        cidr.to_string()
    }
}

impl Display for IpCidr {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}/{}", self.ip, self.prefix_len)
    }
}

/// The header fields of a single packet, as supplied by the
/// routing/address-family layer.
///
/// Ports are ignored for protocols which do not carry them.
#[derive(
    Clone, Copy, Debug, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd,
    Serialize,
)]
pub struct FlowId {
    pub proto: Protocol,
    pub src_ip: IpAddr,
    pub src_port: u16,
    pub dst_ip: IpAddr,
    pub dst_port: u16,
}

impl FlowId {
    /// The same flow seen from the other end.
    pub fn mirror(self) -> Self {
        Self {
            proto: self.proto,
            src_ip: self.dst_ip,
            src_port: self.dst_port,
            dst_ip: self.src_ip,
            dst_port: self.src_port,
        }
    }
}

impl Display for FlowId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{}:{}:{}:{}:{}",
            self.proto, self.src_ip, self.src_port, self.dst_ip, self.dst_port,
        )
    }
}
