// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Per-socket policy.
//!
//! A socket may carry its own policy for each direction, which takes
//! precedence over the SPD. Without one it entrusts its traffic to the
//! SPD, and remembers the outcome of its last lookup per direction so
//! that a socket sending the same flow over and over does not walk the
//! SPD for every packet.
//!
//! A cached outcome is only good for the SPD generation it was looked
//! up under. Changing the SPD never touches the sockets: each socket
//! notices the new generation the next time it looks.

use super::policy::PolicyRef;
use super::policy::SecurityPolicy;
use super::spd::Resolved;
use super::spd::Spd;
use crate::sys::time::Moment;
use spd_api::Direction;
use spd_api::Disposition;
use spd_api::PcbPolicySpec;
use spd_api::PolicyKind;
use spd_api::Selector;
use spd_api::SpdError;

/// What a socket's cache says about a flow.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum CacheHint {
    /// Unknown; a full lookup is needed.
    #[default]
    Maybe,

    /// IPsec processing applies.
    Yes,

    /// No IPsec processing applies: the packet either goes out in the
    /// clear or is dropped, as the cached result says.
    No,
}

impl CacheHint {
    fn for_policy(p: &SecurityPolicy) -> Self {
        match p.disposition() {
            Disposition::Ipsec => Self::Yes,
            Disposition::Bypass | Disposition::Discard => Self::No,
        }
    }

    fn for_result(res: &Resolved) -> Self {
        match res {
            Resolved::Policy(p) => Self::for_policy(p),
            Resolved::Default(_) => Self::No,
        }
    }
}

/// Where a socket's answer came from.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum CacheOutcome {
    /// The socket's own policy.
    Override,

    /// A cache slot valid for the current generation.
    Hit,

    /// No usable slot.
    Miss,

    /// A slot filled under an older generation.
    Stale,
}

#[derive(Clone, Debug, Default)]
struct CacheSlot {
    result: Option<Resolved>,
    selector: Option<Selector>,
    hint: CacheHint,
    generation: u64,
}

impl CacheSlot {
    fn is_valid_for(&self, sel: &Selector, generation: u64) -> bool {
        self.result.is_some()
            && self.generation == generation
            && self.selector.as_ref() == Some(sel)
    }
}

/// A socket's IPsec state.
///
/// Owned by the socket and only ever used by whoever is processing
/// that socket's packets, hence `&mut self` throughout.
#[derive(Debug, Default)]
pub struct PcbPolicy {
    sp_in: Option<PolicyRef>,
    sp_out: Option<PolicyRef>,
    privileged: bool,
    cache: [CacheSlot; 3],
}

impl PcbPolicy {
    pub fn new(privileged: bool) -> Self {
        Self { privileged, ..Default::default() }
    }

    pub fn is_privileged(&self) -> bool {
        self.privileged
    }

    fn slot_policy(
        &self,
        dir: Direction,
    ) -> Result<&Option<PolicyRef>, SpdError> {
        match dir {
            Direction::In => Ok(&self.sp_in),
            Direction::Out => Ok(&self.sp_out),
            Direction::Any => Err(SpdError::InvalidPolicy(
                "socket policy must be inbound or outbound".to_string(),
            )),
        }
    }

    /// The socket's own policy for `dir`, if it has one.
    pub fn policy(&self, dir: Direction) -> Option<&PolicyRef> {
        match dir {
            Direction::In => self.sp_in.as_ref(),
            Direction::Out => self.sp_out.as_ref(),
            Direction::Any => None,
        }
    }

    /// Set the socket's policy for `dir` from its encoded form.
    ///
    /// # Errors
    ///
    /// `Discard` and `None` cannot be set on a socket. `Bypass` is
    /// reserved to privileged sockets. On any error the socket's
    /// existing policy is untouched.
    pub fn set_policy(
        &mut self,
        dir: Direction,
        bytes: &[u8],
        now: Moment,
    ) -> Result<(), SpdError> {
        self.slot_policy(dir)?;
        let spec = PcbPolicySpec::from_bytes(bytes)?;

        let policy = match spec.kind {
            PolicyKind::Entrust => None,

            PolicyKind::Bypass => {
                if !self.privileged {
                    return Err(SpdError::PermissionDenied);
                }

                Some(SecurityPolicy::for_socket(
                    dir,
                    Disposition::Bypass,
                    &spec.requests,
                    now,
                )?)
            }

            PolicyKind::Ipsec => Some(SecurityPolicy::for_socket(
                dir,
                Disposition::Ipsec,
                &spec.requests,
                now,
            )?),

            kind @ (PolicyKind::Discard | PolicyKind::None) => {
                return Err(SpdError::InvalidPolicy(format!(
                    "{kind} cannot be set on a socket",
                )));
            }
        };

        match dir {
            Direction::In => self.sp_in = policy,
            _ => self.sp_out = policy,
        }
        self.invalidate();
        Ok(())
    }

    /// The encoded form of the socket's policy for `dir`.
    pub fn get_policy(&self, dir: Direction) -> Result<Vec<u8>, SpdError> {
        let spec = match self.slot_policy(dir)? {
            None => PcbPolicySpec::entrust(),
            Some(p) => match p.disposition() {
                Disposition::Ipsec => PcbPolicySpec::ipsec(p.request_specs()),
                Disposition::Bypass => PcbPolicySpec::bypass(),
                // Never set on a socket.
                Disposition::Discard => PcbPolicySpec {
                    kind: PolicyKind::Discard,
                    requests: vec![],
                },
            },
        };

        spec.to_bytes()
    }

    /// Forget every cached lookup.
    pub fn invalidate(&mut self) {
        self.cache = Default::default();
    }

    /// The fast-path answer for `sel` in `dir`, given the current SPD
    /// `generation`.
    ///
    /// `Maybe` means the caller must do a full lookup.
    pub fn check(
        &self,
        dir: Direction,
        sel: &Selector,
        generation: u64,
    ) -> CacheHint {
        if let Some(p) = self.policy(dir) {
            return CacheHint::for_policy(p);
        }

        let slot = &self.cache[dir.idx()];
        if slot.is_valid_for(sel, generation) {
            slot.hint
        } else {
            CacheHint::Maybe
        }
    }

    /// Decide what applies to `sel` in `dir`: the socket's own policy,
    /// then a valid cache slot, then the SPD.
    ///
    /// A fresh SPD result is cached under the generation read *before*
    /// the lookup, so a concurrent change can only make the slot look
    /// stale, never make a stale result look current.
    pub fn resolve(
        &mut self,
        spd: &Spd,
        dir: Direction,
        sel: &Selector,
        now: Moment,
    ) -> (Resolved, CacheOutcome) {
        if let Some(p) = self.policy(dir) {
            p.touch(now);
            let res = Resolved::Policy(PolicyRef::clone(p));
            return (res, CacheOutcome::Override);
        }

        let generation = spd.generation();
        let slot = &mut self.cache[dir.idx()];

        if slot.is_valid_for(sel, generation) && slot.hint != CacheHint::Maybe
        {
            if let Some(res) = &slot.result {
                if let Resolved::Policy(p) = res {
                    p.touch(now);
                }
                return (res.clone(), CacheOutcome::Hit);
            }
        }

        let stale = slot.result.is_some() && slot.generation != generation;
        let outcome = if stale {
            CacheOutcome::Stale
        } else {
            CacheOutcome::Miss
        };

        let res = spd.resolve(dir, sel, now);
        *slot = CacheSlot {
            hint: CacheHint::for_result(&res),
            result: Some(res.clone()),
            selector: Some(*sel),
            generation,
        };

        (res, outcome)
    }
}
