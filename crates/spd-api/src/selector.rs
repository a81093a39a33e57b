// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Traffic selectors.

use super::AddrFamily;
use super::FlowId;
use super::IpCidr;
use super::Protocol;
use super::SpdError;
use serde::Deserialize;
use serde::Serialize;
use std::fmt;
use std::fmt::Display;

/// The raw, unvalidated form of a [`Selector`], as it appears in
/// policy files and on the admin path.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct SelectorSpec {
    pub src: IpCidr,
    pub dst: IpCidr,
    #[serde(default)]
    pub proto: Option<Protocol>,
    #[serde(default)]
    pub src_port: Option<u16>,
    #[serde(default)]
    pub dst_port: Option<u16>,
}

/// A traffic class: source and destination prefixes, an upper-layer
/// protocol, and source and destination ports. A `None` protocol or
/// port means ANY.
///
/// A `Selector` can only be built through [`Selector::new()`] (or one
/// of the conversions which call it), so every value in hand is
/// well-formed:
///
/// * the source and destination prefixes are of the same family, and
/// * ports are only present for a protocol which carries them.
#[derive(
    Clone, Copy, Debug, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd,
    Serialize,
)]
#[serde(try_from = "SelectorSpec", into = "SelectorSpec")]
pub struct Selector {
    src: IpCidr,
    dst: IpCidr,
    proto: Option<Protocol>,
    src_port: Option<u16>,
    dst_port: Option<u16>,
}

impl Selector {
    pub fn new(
        src: IpCidr,
        dst: IpCidr,
        proto: Option<Protocol>,
        src_port: Option<u16>,
        dst_port: Option<u16>,
    ) -> Result<Self, SpdError> {
        if src.family() != dst.family() {
            return Err(SpdError::InvalidSelector(format!(
                "address family mismatch: src {src} dst {dst}",
            )));
        }

        if src_port.is_some() || dst_port.is_some() {
            match proto {
                Some(p) if p.has_ports() => (),
                Some(p) => {
                    return Err(SpdError::InvalidSelector(format!(
                        "protocol {p} does not carry ports",
                    )));
                }
                None => {
                    return Err(SpdError::InvalidSelector(
                        "ports given without a protocol".to_string(),
                    ));
                }
            }
        }

        Ok(Self { src, dst, proto, src_port, dst_port })
    }

    /// The selector matching everything of the given family.
    pub fn any(family: AddrFamily) -> Self {
        let any = IpCidr::any(family);
        Self { src: any, dst: any, proto: None, src_port: None, dst_port: None }
    }

    pub fn src(&self) -> IpCidr {
        self.src
    }

    pub fn dst(&self) -> IpCidr {
        self.dst
    }

    pub fn proto(&self) -> Option<Protocol> {
        self.proto
    }

    pub fn src_port(&self) -> Option<u16> {
        self.src_port
    }

    pub fn dst_port(&self) -> Option<u16> {
        self.dst_port
    }

    pub fn family(&self) -> AddrFamily {
        self.src.family()
    }

    /// The combined source and destination prefix length, used to
    /// rank matching policies: the larger the value, the more specific
    /// the selector.
    pub fn specificity(&self) -> u16 {
        u16::from(self.src.prefix_len()) + u16::from(self.dst.prefix_len())
    }

    /// Does the candidate selector `pkt` fall within this selector?
    ///
    /// Both prefixes of `pkt` must lie inside the corresponding prefix
    /// of `self`; the protocol must be ANY or equal; and, for a
    /// protocol with ports, each port must be ANY or equal. A `pkt`
    /// of another address family never matches.
    pub fn matches(&self, pkt: &Selector) -> bool {
        if !self.src.covers(&pkt.src) || !self.dst.covers(&pkt.dst) {
            return false;
        }

        let Some(proto) = self.proto else {
            return true;
        };

        if pkt.proto != Some(proto) {
            return false;
        }

        if !proto.has_ports() {
            return true;
        }

        port_matches(self.src_port, pkt.src_port)
            && port_matches(self.dst_port, pkt.dst_port)
    }

    /// The selector with source and destination swapped.
    pub fn mirror(&self) -> Self {
        Self {
            src: self.dst,
            dst: self.src,
            proto: self.proto,
            src_port: self.dst_port,
            dst_port: self.src_port,
        }
    }
}

fn port_matches(policy: Option<u16>, pkt: Option<u16>) -> bool {
    match policy {
        None => true,
        Some(p) => pkt == Some(p),
    }
}

impl TryFrom<SelectorSpec> for Selector {
    type Error = SpdError;

    fn try_from(spec: SelectorSpec) -> Result<Self, Self::Error> {
        Self::new(spec.src, spec.dst, spec.proto, spec.src_port, spec.dst_port)
    }
}

impl From<Selector> for SelectorSpec {
    fn from(sel: Selector) -> Self {
        Self {
            src: sel.src,
            dst: sel.dst,
            proto: sel.proto,
            src_port: sel.src_port,
            dst_port: sel.dst_port,
        }
    }
}

impl TryFrom<&FlowId> for Selector {
    type Error = SpdError;

    /// Build the host-level selector used to look up a packet.
    fn try_from(flow: &FlowId) -> Result<Self, Self::Error> {
        let (src_port, dst_port) = if flow.proto.has_ports() {
            (Some(flow.src_port), Some(flow.dst_port))
        } else {
            (None, None)
        };

        Self::new(
            IpCidr::host(flow.src_ip),
            IpCidr::host(flow.dst_ip),
            Some(flow.proto),
            src_port,
            dst_port,
        )
    }
}

fn fmt_port(f: &mut fmt::Formatter, port: Option<u16>) -> fmt::Result {
    match port {
        Some(p) => write!(f, "{p}"),
        None => write!(f, "ANY"),
    }
}

impl Display for Selector {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}[", self.src)?;
        fmt_port(f, self.src_port)?;
        write!(f, "] {}[", self.dst)?;
        fmt_port(f, self.dst_port)?;
        write!(f, "] ")?;
        match self.proto {
            Some(p) => write!(f, "{p}"),
            None => write!(f, "ANY"),
        }
    }
}
