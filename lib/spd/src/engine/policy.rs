// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Security policies.
//!
//! A [`SecurityPolicy`] is immutable once built, apart from its usage
//! bookkeeping and its liveness state. Changing a policy means
//! building a new one and swapping it into the SPD; anyone still
//! holding the old one (a socket's cache, a packet in flight) keeps a
//! valid, if DEAD, policy until they let go of it.

use super::request::IpsecRequest;
use crate::sys::time::Moment;
use crate::sys::time::Ttl;
use core::fmt;
use core::sync::atomic::AtomicU8;
use core::sync::atomic::AtomicU64;
use core::sync::atomic::Ordering;
use core::time::Duration;
use spd_api::Direction;
use spd_api::Disposition;
use spd_api::IpsecRequestSpec;
use spd_api::PolicyDump;
use spd_api::PolicyId;
use spd_api::PolicySpec;
use spd_api::Selector;
use spd_api::SpdError;
use spd_api::validate_chain;
use std::sync::Arc;

/// The id carried by policies attached to a socket rather than stored
/// in the SPD. The SPD never hands it out.
pub const SOCKET_POLICY_ID: PolicyId = 0;

/// A shared reference to a policy. The policy is freed when the last
/// reference is dropped.
pub type PolicyRef = Arc<SecurityPolicy>;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[repr(u8)]
pub enum PolicyState {
    Alive = 1,
    Dead = 2,
}

pub struct SecurityPolicy {
    id: PolicyId,
    dir: Direction,
    // `None` for a socket policy, which covers all of the socket's
    // traffic in its direction.
    selector: Option<Selector>,
    disposition: Disposition,
    chain: Box<[IpsecRequest]>,
    created: Moment,
    // Milliseconds after `created` of the most recent use.
    last_used: AtomicU64,
    hits: AtomicU64,
    lifetime: Ttl,
    validtime: Ttl,
    state: AtomicU8,
}

impl SecurityPolicy {
    /// Build an SPD policy from its administrative description.
    pub(crate) fn new(
        id: PolicyId,
        spec: &PolicySpec,
        now: Moment,
    ) -> Result<PolicyRef, SpdError> {
        spec.validate()?;

        Ok(Self::build(
            id,
            spec.dir,
            Some(spec.selector),
            spec.disposition,
            &spec.requests,
            Ttl::new_seconds(spec.lifetime_secs),
            Ttl::new_seconds(spec.validtime_secs),
            now,
        ))
    }

    /// Build a policy to attach to a socket.
    pub(crate) fn for_socket(
        dir: Direction,
        disposition: Disposition,
        requests: &[IpsecRequestSpec],
        now: Moment,
    ) -> Result<PolicyRef, SpdError> {
        validate_chain(disposition, requests)?;

        Ok(Self::build(
            SOCKET_POLICY_ID,
            dir,
            None,
            disposition,
            requests,
            Ttl::NEVER,
            Ttl::NEVER,
            now,
        ))
    }

    #[allow(clippy::too_many_arguments)]
    fn build(
        id: PolicyId,
        dir: Direction,
        selector: Option<Selector>,
        disposition: Disposition,
        requests: &[IpsecRequestSpec],
        lifetime: Ttl,
        validtime: Ttl,
        now: Moment,
    ) -> PolicyRef {
        // The requests point back at the policy which owns them, but
        // only weakly: they must not keep it alive.
        Arc::new_cyclic(|me| Self {
            id,
            dir,
            selector,
            disposition,
            chain: requests
                .iter()
                .map(|spec| IpsecRequest::new(spec.clone(), me.clone()))
                .collect(),
            created: now,
            last_used: AtomicU64::new(0),
            hits: AtomicU64::new(0),
            lifetime,
            validtime,
            state: AtomicU8::new(PolicyState::Alive as u8),
        })
    }

    pub fn id(&self) -> PolicyId {
        self.id
    }

    pub fn dir(&self) -> Direction {
        self.dir
    }

    pub fn selector(&self) -> Option<&Selector> {
        self.selector.as_ref()
    }

    pub fn disposition(&self) -> Disposition {
        self.disposition
    }

    /// The transform chain, outermost first. Empty unless the
    /// disposition is IPSEC.
    pub fn chain(&self) -> &[IpsecRequest] {
        &self.chain
    }

    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn created(&self) -> Moment {
        self.created
    }

    pub fn last_used(&self) -> Moment {
        self.created
            + Duration::from_millis(self.last_used.load(Ordering::Relaxed))
    }

    /// Record a use of this policy at `now`.
    pub(crate) fn touch(&self, now: Moment) {
        self.hits.fetch_add(1, Ordering::Relaxed);
        self.last_used
            .fetch_max(now.delta_as_millis(self.created), Ordering::Relaxed);
    }

    pub fn state(&self) -> PolicyState {
        match self.state.load(Ordering::Acquire) {
            1 => PolicyState::Alive,
            _ => PolicyState::Dead,
        }
    }

    pub fn is_alive(&self) -> bool {
        self.state() == PolicyState::Alive
    }

    /// Mark the policy as no longer reachable from the SPD. Holders
    /// may keep using it until they drop their reference.
    pub(crate) fn mark_dead(&self) {
        self.state.store(PolicyState::Dead as u8, Ordering::Release);
    }

    /// Has this policy outlived its lifetime, or gone unused for
    /// longer than its valid time?
    pub fn is_expired(&self, now: Moment) -> bool {
        self.lifetime.is_expired(self.created, now)
            || self.validtime.is_expired(self.last_used(), now)
    }

    pub fn request_specs(&self) -> Vec<IpsecRequestSpec> {
        self.chain.iter().map(|r| r.spec().clone()).collect()
    }

    /// Summarize the policy for the admin layer. The SPD's own
    /// reference is not counted in `refcnt`.
    pub(crate) fn dump(self: &Arc<Self>, now: Moment) -> Option<PolicyDump> {
        let selector = *self.selector.as_ref()?;
        let refcnt = Arc::strong_count(self).saturating_sub(1);

        Some(PolicyDump {
            id: self.id,
            dir: self.dir,
            selector,
            disposition: self.disposition,
            requests: self.request_specs(),
            refcnt: refcnt as u64,
            hits: self.hits(),
            age_secs: now.delta_as_millis(self.created) / 1_000,
            idle_secs: now.delta_as_millis(self.last_used()) / 1_000,
            lifetime_secs: self.lifetime.as_seconds(),
            validtime_secs: self.validtime.as_seconds(),
        })
    }
}

impl fmt::Debug for SecurityPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecurityPolicy")
            .field("id", &self.id)
            .field("dir", &self.dir)
            .field("selector", &self.selector)
            .field("disposition", &self.disposition)
            .field("chain", &self.chain)
            .field("state", &self.state())
            .finish()
    }
}

impl fmt::Display for SecurityPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.selector {
            Some(sel) => write!(
                f,
                "policy {} {} {} {}",
                self.id, self.dir, sel, self.disposition,
            ),
            None => {
                write!(f, "socket policy {} {}", self.dir, self.disposition)
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use spd_api::Level;
    use spd_api::Mode;
    use spd_api::SecProto;

    fn spec(disp: Disposition) -> PolicySpec {
        let sel = Selector::new(
            "10.0.0.0/24".parse().unwrap(),
            "10.0.1.0/24".parse().unwrap(),
            None,
            None,
            None,
        )
        .unwrap();
        let mut spec = PolicySpec::new(Direction::Out, sel, disp);
        if disp == Disposition::Ipsec {
            spec.requests.push(IpsecRequestSpec {
                proto: SecProto::Esp,
                mode: Mode::Transport,
                level: Level::Require,
                dst: None,
                peer: None,
            });
        }
        spec
    }

    #[test]
    fn requests_point_back_weakly() {
        let p = SecurityPolicy::new(7, &spec(Disposition::Ipsec), Moment::now())
            .unwrap();
        assert_eq!(Arc::strong_count(&p), 1);
        let owner = p.chain()[0].policy().unwrap();
        assert_eq!(owner.id(), 7);
        drop(owner);

        let req_owner = Arc::downgrade(&p);
        drop(p);
        assert!(req_owner.upgrade().is_none());
    }

    #[test]
    fn invalid_chain_rejected() {
        let mut s = spec(Disposition::Bypass);
        s.requests = spec(Disposition::Ipsec).requests;
        assert!(matches!(
            SecurityPolicy::new(1, &s, Moment::now()),
            Err(SpdError::InvalidPolicy(_))
        ));
    }

    #[test]
    fn lifetime_and_validtime() {
        let t0 = Moment::now();
        let mut s = spec(Disposition::Discard);
        s.lifetime_secs = 60;
        s.validtime_secs = 10;
        let p = SecurityPolicy::new(1, &s, t0).unwrap();

        assert!(!p.is_expired(t0 + Duration::from_secs(9)));
        p.touch(t0 + Duration::from_secs(9));
        assert!(!p.is_expired(t0 + Duration::from_secs(18)));
        assert!(p.is_expired(t0 + Duration::from_secs(19)));

        // Touching keeps the valid time at bay, but not the lifetime.
        p.touch(t0 + Duration::from_secs(55));
        assert!(p.is_expired(t0 + Duration::from_secs(60)));
        assert_eq!(p.hits(), 2);
    }

    #[test]
    fn dead_is_sticky() {
        let discard = spec(Disposition::Discard);
        let p = SecurityPolicy::new(1, &discard, Moment::now()).unwrap();
        assert!(p.is_alive());
        p.mark_dead();
        assert_eq!(p.state(), PolicyState::Dead);
    }

    #[test]
    fn socket_policy_not_dumped() {
        let now = Moment::now();
        let p = SecurityPolicy::for_socket(
            Direction::Out,
            Disposition::Bypass,
            &[],
            now,
        )
        .unwrap();
        assert_eq!(p.id(), SOCKET_POLICY_ID);
        assert!(p.selector().is_none());
        assert!(p.dump(now).is_none());
    }
}
