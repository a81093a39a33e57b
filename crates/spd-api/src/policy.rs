// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Administrative descriptions of policies, requests, and SAs.

use super::Direction;
use super::Selector;
use super::SpdError;
use super::addr_family;
use serde::Deserialize;
use serde::Serialize;
use std::fmt;
use std::fmt::Display;
use std::net::IpAddr;
use std::str::FromStr;

/// A policy's identifier. Unique across the SPD while the policy is
/// alive.
pub type PolicyId = u32;

/// What to do with traffic matching a policy.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Disposition {
    Discard,
    Bypass,
    Ipsec,
}

impl Display for Disposition {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match self {
            Self::Discard => "DISCARD",
            Self::Bypass => "BYPASS",
            Self::Ipsec => "IPSEC",
        };
        write!(f, "{s}")
    }
}

/// The system-wide answer for traffic no policy matches.
///
/// There is deliberately no IPsec variant: without a selected policy
/// there is no request chain to apply.
#[derive(
    Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize,
)]
#[serde(rename_all = "lowercase")]
pub enum DefaultPolicy {
    #[default]
    Discard,
    None,
}

impl Display for DefaultPolicy {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Discard => write!(f, "DISCARD"),
            Self::None => write!(f, "NONE"),
        }
    }
}

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
#[serde(rename_all = "lowercase")]
pub enum SecProto {
    Esp,
    Ah,
}

impl Display for SecProto {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Esp => write!(f, "ESP"),
            Self::Ah => write!(f, "AH"),
        }
    }
}

impl FromStr for SecProto {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "esp" => Ok(Self::Esp),
            "ah" => Ok(Self::Ah),
            _ => Err(format!("bad IPsec protocol: {s}")),
        }
    }
}

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
#[serde(rename_all = "lowercase")]
pub enum Mode {
    Transport,
    Tunnel,
}

impl Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Transport => write!(f, "transport"),
            Self::Tunnel => write!(f, "tunnel"),
        }
    }
}

/// How strictly a request must be satisfied.
#[derive(
    Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Level {
    /// Whatever the system default for the protocol and mode says.
    #[default]
    Default,
    /// Apply if an SA exists, otherwise send without this step.
    Use,
    /// An SA must exist.
    Require,
    /// An SA must exist, and every use must be the same SA.
    Unique,
}

impl Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match self {
            Self::Default => "default",
            Self::Use => "use",
            Self::Require => "require",
            Self::Unique => "unique",
        };
        write!(f, "{s}")
    }
}

/// The Security Association Index: the key used to find an SA.
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
pub struct Sai {
    pub dst: IpAddr,
    pub proto: SecProto,
    pub mode: Mode,
    pub peer: IpAddr,
}

impl Display for Sai {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}/{}/{}-{}", self.proto, self.mode, self.peer, self.dst)
    }
}

/// One step of a policy's transform chain.
///
/// `dst` and `peer` are the tunnel endpoints. When absent (transport
/// mode) they are taken from each packet: `dst` from its destination
/// and `peer` from its source.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct IpsecRequestSpec {
    pub proto: SecProto,
    pub mode: Mode,
    #[serde(default)]
    pub level: Level,
    #[serde(default)]
    pub dst: Option<IpAddr>,
    #[serde(default)]
    pub peer: Option<IpAddr>,
}

impl IpsecRequestSpec {
    pub fn validate(&self) -> Result<(), SpdError> {
        if self.mode == Mode::Tunnel && self.dst.is_none() {
            return Err(SpdError::InvalidPolicy(format!(
                "{} tunnel request without a tunnel endpoint",
                self.proto,
            )));
        }

        if let (Some(dst), Some(peer)) = (self.dst, self.peer) {
            if addr_family(&dst) != addr_family(&peer) {
                return Err(SpdError::InvalidPolicy(format!(
                    "tunnel endpoints of different families: {peer} {dst}",
                )));
            }
        }

        Ok(())
    }
}

/// A policy as supplied by the administrative layer.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct PolicySpec {
    /// An operator-chosen id, or `None` to let the SPD assign one.
    #[serde(default)]
    pub id: Option<PolicyId>,
    pub dir: Direction,
    pub selector: Selector,
    pub disposition: Disposition,
    #[serde(default)]
    pub requests: Vec<IpsecRequestSpec>,
    /// Seconds after creation at which the policy expires; zero for
    /// never.
    #[serde(default)]
    pub lifetime_secs: u64,
    /// Seconds without use after which the policy expires; zero for
    /// never.
    #[serde(default)]
    pub validtime_secs: u64,
}

impl PolicySpec {
    pub fn new(
        dir: Direction,
        selector: Selector,
        disposition: Disposition,
    ) -> Self {
        Self {
            id: None,
            dir,
            selector,
            disposition,
            requests: vec![],
            lifetime_secs: 0,
            validtime_secs: 0,
        }
    }

    pub fn validate(&self) -> Result<(), SpdError> {
        validate_chain(self.disposition, &self.requests)
    }
}

/// A request chain must be present for, and only for, an IPsec
/// disposition.
pub fn validate_chain(
    disp: Disposition,
    requests: &[IpsecRequestSpec],
) -> Result<(), SpdError> {
    match (disp, requests.is_empty()) {
        (Disposition::Ipsec, true) => {
            return Err(SpdError::InvalidPolicy(
                "IPSEC policy with an empty request chain".to_string(),
            ));
        }

        (Disposition::Discard | Disposition::Bypass, false) => {
            return Err(SpdError::InvalidPolicy(format!(
                "{disp} policy with a request chain",
            )));
        }

        _ => (),
    }

    requests.iter().try_for_each(IpsecRequestSpec::validate)
}

/// The kind of policy a socket may be asked to carry.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PolicyKind {
    Discard,
    None,
    Bypass,
    Entrust,
    Ipsec,
}

impl Display for PolicyKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match self {
            Self::Discard => "DISCARD",
            Self::None => "NONE",
            Self::Bypass => "BYPASS",
            Self::Entrust => "ENTRUST",
            Self::Ipsec => "IPSEC",
        };
        write!(f, "{s}")
    }
}

/// A per-socket policy, as exchanged through the socket option path.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct PcbPolicySpec {
    pub kind: PolicyKind,
    pub requests: Vec<IpsecRequestSpec>,
}

impl PcbPolicySpec {
    pub fn entrust() -> Self {
        Self { kind: PolicyKind::Entrust, requests: vec![] }
    }

    pub fn bypass() -> Self {
        Self { kind: PolicyKind::Bypass, requests: vec![] }
    }

    pub fn ipsec(requests: Vec<IpsecRequestSpec>) -> Self {
        Self { kind: PolicyKind::Ipsec, requests }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, SpdError> {
        postcard::to_allocvec(self)
            .map_err(|e| SpdError::SerPolicy(e.to_string()))
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, SpdError> {
        postcard::from_bytes(bytes)
            .map_err(|e| SpdError::DeserPolicy(e.to_string()))
    }
}

#[derive(
    Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize,
)]
#[serde(rename_all = "kebab-case")]
pub enum AuthAlg {
    #[default]
    None,
    HmacSha1,
    HmacSha256,
    HmacSha384,
    HmacSha512,
}

#[derive(
    Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize,
)]
#[serde(rename_all = "kebab-case")]
pub enum EncAlg {
    #[default]
    Null,
    AesCbc,
    AesCtr,
    AesGcm16,
}

pub const DEF_REPLAY_WINDOW: u8 = 32;

/// An SA, as handed to the SAD by key management.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct SaSpec {
    pub dst: IpAddr,
    pub peer: IpAddr,
    pub proto: SecProto,
    pub mode: Mode,
    pub spi: u32,
    #[serde(default)]
    pub auth: AuthAlg,
    #[serde(default)]
    pub enc: EncAlg,
    #[serde(default)]
    pub key: Vec<u8>,
    /// The anti-replay window in packets; zero disables the check.
    #[serde(default = "def_replay_window")]
    pub replay_window: u8,
    #[serde(default)]
    pub lifetime_secs: u64,
}

fn def_replay_window() -> u8 {
    DEF_REPLAY_WINDOW
}

impl SaSpec {
    pub fn new(sai: Sai, spi: u32) -> Self {
        Self {
            dst: sai.dst,
            peer: sai.peer,
            proto: sai.proto,
            mode: sai.mode,
            spi,
            auth: AuthAlg::default(),
            enc: EncAlg::default(),
            key: vec![],
            replay_window: DEF_REPLAY_WINDOW,
            lifetime_secs: 0,
        }
    }

    pub fn sai(&self) -> Sai {
        Sai {
            dst: self.dst,
            proto: self.proto,
            mode: self.mode,
            peer: self.peer,
        }
    }
}

/// A policy as reported by the SPD dump.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct PolicyDump {
    pub id: PolicyId,
    pub dir: Direction,
    pub selector: Selector,
    pub disposition: Disposition,
    pub requests: Vec<IpsecRequestSpec>,
    /// Holders of the policy other than the SPD itself.
    pub refcnt: u64,
    pub hits: u64,
    pub age_secs: u64,
    pub idle_secs: u64,
    pub lifetime_secs: u64,
    pub validtime_secs: u64,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct DumpSpdResp {
    pub generation: u64,
    pub default_policy: DefaultPolicy,
    pub policies: Vec<PolicyDump>,
}
