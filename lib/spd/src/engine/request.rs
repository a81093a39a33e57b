// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! IPsec requests and the resolution of request chains to SAs.
//!
//! A policy with an IPSEC disposition carries a chain of requests.
//! Outbound, the chain is applied in order: the first request wraps
//! the packet first and so ends up innermost. Inbound, headers are
//! unwound outermost first, so the chain is checked in reverse.

use super::policy::PolicyRef;
use super::policy::SecurityPolicy;
use super::sad::SaHandle;
use super::sad::SaId;
use super::sad::SecurityAssociationDb;
use crate::sys::sync::KMutex;
use core::fmt;
use spd_api::FlowId;
use spd_api::IpsecCfg;
use spd_api::IpsecRequestSpec;
use spd_api::Level;
use spd_api::Mode;
use spd_api::Sai;
use spd_api::SecProto;
use std::collections::BTreeMap;
use std::sync::Weak;

/// A request level with `Default` resolved away.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum EffectiveLevel {
    Use,
    Require,
    Unique,
}

impl EffectiveLevel {
    /// Must an SA exist for the packet to proceed?
    pub fn is_required(self) -> bool {
        !matches!(self, Self::Use)
    }
}

/// The system-wide levels that `Level::Default` requests resolve to,
/// one per protocol and mode.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct DefaultLevels {
    pub esp_trans: EffectiveLevel,
    pub esp_net: EffectiveLevel,
    pub ah_trans: EffectiveLevel,
    pub ah_net: EffectiveLevel,
}

impl DefaultLevels {
    /// Take the defaults from `cfg`. Only `use` and `require` are
    /// meaningful as defaults; anything else is coerced to `use` and
    /// the name of the offending setting returned.
    pub fn from_cfg(cfg: &IpsecCfg) -> (Self, Vec<&'static str>) {
        let mut coerced = vec![];
        let mut level = |name: &'static str, lvl: Level| match lvl {
            Level::Use => EffectiveLevel::Use,
            Level::Require => EffectiveLevel::Require,
            Level::Default | Level::Unique => {
                coerced.push(name);
                EffectiveLevel::Use
            }
        };

        let levels = Self {
            esp_trans: level("esp_trans_deflev", cfg.esp_trans_deflev),
            esp_net: level("esp_net_deflev", cfg.esp_net_deflev),
            ah_trans: level("ah_trans_deflev", cfg.ah_trans_deflev),
            ah_net: level("ah_net_deflev", cfg.ah_net_deflev),
        };

        (levels, coerced)
    }

    pub fn effective(&self, req: &IpsecRequestSpec) -> EffectiveLevel {
        match req.level {
            Level::Use => EffectiveLevel::Use,
            Level::Require => EffectiveLevel::Require,
            Level::Unique => EffectiveLevel::Unique,
            Level::Default => match (req.proto, req.mode) {
                (SecProto::Esp, Mode::Transport) => self.esp_trans,
                (SecProto::Esp, Mode::Tunnel) => self.esp_net,
                (SecProto::Ah, Mode::Transport) => self.ah_trans,
                (SecProto::Ah, Mode::Tunnel) => self.ah_net,
            },
        }
    }
}

impl Default for DefaultLevels {
    fn default() -> Self {
        Self::from_cfg(&IpsecCfg::default()).0
    }
}

/// One step of a policy's transform chain.
pub struct IpsecRequest {
    spec: IpsecRequestSpec,
    // The SA each SAI is bound to, for UNIQUE requests.
    pins: KMutex<BTreeMap<Sai, SaId>>,
    policy: Weak<SecurityPolicy>,
}

impl IpsecRequest {
    pub(crate) fn new(
        spec: IpsecRequestSpec,
        policy: Weak<SecurityPolicy>,
    ) -> Self {
        Self { spec, pins: KMutex::new(BTreeMap::new()), policy }
    }

    pub fn spec(&self) -> &IpsecRequestSpec {
        &self.spec
    }

    pub fn proto(&self) -> SecProto {
        self.spec.proto
    }

    pub fn mode(&self) -> Mode {
        self.spec.mode
    }

    /// The policy this request belongs to, unless it has already been
    /// freed.
    pub fn policy(&self) -> Option<PolicyRef> {
        self.policy.upgrade()
    }

    /// The SAI this request needs for a packet of `flow`.
    pub fn sai(&self, flow: &FlowId) -> Sai {
        Sai {
            dst: self.spec.dst.unwrap_or(flow.dst_ip),
            proto: self.spec.proto,
            mode: self.spec.mode,
            peer: self.spec.peer.unwrap_or(flow.src_ip),
        }
    }

    /// The SA a UNIQUE request is bound to for `sai`, if any.
    pub fn pinned(&self, sai: &Sai) -> Option<SaId> {
        self.pins.lock().get(sai).copied()
    }

    /// Find the SA for `sai`.
    ///
    /// At the UNIQUE level the first SA found is pinned, and only that
    /// SA is acceptable while it lives. Once the SAD no longer has it
    /// the pin is dropped and this call fails; the next call pins
    /// whatever SA has replaced it.
    pub fn resolve(
        &self,
        sai: &Sai,
        level: EffectiveLevel,
        sad: &dyn SecurityAssociationDb,
    ) -> Option<SaHandle> {
        if level != EffectiveLevel::Unique {
            return sad.resolve(sai);
        }

        let mut pins = self.pins.lock();
        match pins.get(sai) {
            Some(id) => {
                let sa = sad.lookup(sai, *id);
                if sa.is_none() {
                    pins.remove(sai);
                }
                sa
            }

            None => {
                let sa = sad.resolve(sai)?;
                pins.insert(*sai, sa.id());
                Some(sa)
            }
        }
    }

    /// Drop the pins whose SA has left the SAD, returning how many
    /// were dropped.
    pub fn prune_pins(&self, sad: &dyn SecurityAssociationDb) -> usize {
        let mut pins = self.pins.lock();
        let before = pins.len();
        pins.retain(|sai, id| sad.lookup(sai, *id).is_some());
        before - pins.len()
    }

    pub fn pin_count(&self) -> usize {
        self.pins.lock().len()
    }
}

impl fmt::Debug for IpsecRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IpsecRequest")
            .field("proto", &self.spec.proto)
            .field("mode", &self.spec.mode)
            .field("level", &self.spec.level)
            .field("dst", &self.spec.dst)
            .field("peer", &self.spec.peer)
            .finish()
    }
}

/// The outcome of resolving a policy's chain for one packet.
#[derive(Debug, Default)]
pub struct ChainResolution {
    /// The SAs to apply, in chain order.
    pub sas: Vec<SaHandle>,

    /// The SAIs for which no SA was found. Each wants an acquire.
    pub missing: Vec<Sai>,

    /// The first SAI which was both missing and required. When set,
    /// the packet must not be sent.
    pub blocked: Option<Sai>,
}

/// Resolve every request of `policy` for a packet of `flow`.
///
/// A missing SA for a USE request just drops that step; for any other
/// level the packet is blocked. Either way the SAI is reported as
/// missing so key management can be asked for it.
pub fn resolve_chain(
    policy: &SecurityPolicy,
    flow: &FlowId,
    levels: &DefaultLevels,
    sad: &dyn SecurityAssociationDb,
) -> ChainResolution {
    let mut res = ChainResolution::default();

    for req in policy.chain() {
        let sai = req.sai(flow);
        let level = levels.effective(req.spec());

        match req.resolve(&sai, level, sad) {
            Some(sa) => res.sas.push(sa),
            None => {
                if level.is_required() && res.blocked.is_none() {
                    res.blocked = Some(sai);
                }
                res.missing.push(sai);
            }
        }
    }

    res
}

/// Does the transform history of an inbound packet satisfy `chain`?
///
/// `history` lists the `(proto, mode)` of each header removed from the
/// packet, outermost first. The chain is walked in reverse; every
/// required request must be found in the history, in order, while USE
/// requests may be absent.
pub fn history_satisfies(
    chain: &[IpsecRequest],
    history: &[(SecProto, Mode)],
    levels: &DefaultLevels,
) -> bool {
    let mut pos = 0;

    for req in chain.iter().rev() {
        let want = (req.proto(), req.mode());
        match history[pos..].iter().position(|h| *h == want) {
            Some(off) => pos += off + 1,
            None if levels.effective(req.spec()).is_required() => {
                return false;
            }
            None => (),
        }
    }

    true
}
