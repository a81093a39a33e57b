// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! The Security Policy Database.
//!
//! ### Ordering
//!
//! The table is kept sorted so that the first matching entry is the
//! best one. Entries are ordered by the combined length of their
//! source and destination prefixes, longest first; entries of equal
//! length are ordered by id, lowest first. The result of a lookup
//! therefore depends only on the set of policies installed, never on
//! the order they were installed in.
//!
//! ### Generation
//!
//! Every insert, delete, replace, flush, or expiry produces a new
//! table and bumps the SPD generation. Anything derived from a lookup
//! (a socket's cached policy, for instance) records the generation it
//! was derived under and is stale once the two differ. Readers never
//! wait on writers for more than the pointer swap.

use super::policy::PolicyRef;
use super::policy::SecurityPolicy;
use super::sad::SecurityAssociationDb;
use crate::dynamic::Dynamic;
use crate::sys::time::Moment;
use core::cmp::Reverse;
use core::convert::Infallible;
use core::fmt;
use core::sync::atomic::AtomicU32;
use core::sync::atomic::Ordering;
use slog::Logger;
use slog::debug;
use slog::info;
use spd_api::DefaultPolicy;
use spd_api::Direction;
use spd_api::DumpSpdResp;
use spd_api::IpsecCfg;
use spd_api::PolicyId;
use spd_api::PolicySpec;
use spd_api::Selector;
use spd_api::SpdError;

/// The answer to "what applies to this traffic?".
#[derive(Clone, Debug)]
pub enum Resolved {
    /// An explicit policy matched.
    Policy(PolicyRef),

    /// Nothing matched; the system default applies.
    Default(DefaultPolicy),
}

#[derive(Clone, Default)]
struct PolicyTable {
    policies: Vec<PolicyRef>,
}

fn rank(p: &SecurityPolicy) -> (Reverse<u16>, PolicyId) {
    let spec = p.selector().map(Selector::specificity).unwrap_or_default();
    (Reverse(spec), p.id())
}

impl PolicyTable {
    fn contains(&self, id: PolicyId) -> bool {
        self.policies.iter().any(|p| p.id() == id)
    }

    fn get(&self, id: PolicyId) -> Option<&PolicyRef> {
        self.policies.iter().find(|p| p.id() == id)
    }

    // Find the position in which to insert this policy.
    fn find_pos(&self, policy: &SecurityPolicy) -> usize {
        let r = rank(policy);
        self.policies.partition_point(|p| rank(p) < r)
    }

    fn add(&mut self, policy: PolicyRef) {
        let pos = self.find_pos(&policy);
        self.policies.insert(pos, policy);
    }

    fn remove(&mut self, id: PolicyId) -> Option<PolicyRef> {
        let idx = self.policies.iter().position(|p| p.id() == id)?;
        Some(self.policies.remove(idx))
    }

    fn find_match(
        &self,
        dir: Direction,
        sel: &Selector,
    ) -> Option<&PolicyRef> {
        self.policies.iter().find(|p| {
            p.dir().applies_to(dir)
                && p.selector().is_some_and(|ps| ps.matches(sel))
        })
    }
}

pub struct Spd {
    log: Logger,
    default_policy: DefaultPolicy,
    max_entries: u32,
    table: Dynamic<PolicyTable>,
    next_id: AtomicU32,
}

impl Spd {
    pub fn new(cfg: &IpsecCfg, log: Logger) -> Self {
        Self {
            log,
            default_policy: cfg.default_policy,
            max_entries: cfg.spd_max_entries,
            table: Dynamic::from(PolicyTable::default()),
            next_id: AtomicU32::new(1),
        }
    }

    /// The current SPD generation.
    pub fn generation(&self) -> u64 {
        self.table.generation()
    }

    pub fn default_policy(&self) -> DefaultPolicy {
        self.default_policy
    }

    pub fn len(&self) -> usize {
        self.table.load().policies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Find the best policy for `sel` in direction `dir`, recording
    /// its use at `now`.
    ///
    /// `None` means no policy matched. This is not the same thing as
    /// DISCARD: see [`Spd::resolve()`].
    pub fn lookup(
        &self,
        dir: Direction,
        sel: &Selector,
        now: Moment,
    ) -> Option<PolicyRef> {
        let table = self.table.load();
        let policy = table.find_match(dir, sel)?;
        policy.touch(now);
        Some(PolicyRef::clone(policy))
    }

    /// Like [`Spd::lookup()`], with the system default standing in
    /// when nothing matches.
    pub fn resolve(
        &self,
        dir: Direction,
        sel: &Selector,
        now: Moment,
    ) -> Resolved {
        match self.lookup(dir, sel, now) {
            Some(p) => Resolved::Policy(p),
            None => Resolved::Default(self.default_policy),
        }
    }

    pub fn get(&self, id: PolicyId) -> Option<PolicyRef> {
        self.table.load().get(id).cloned()
    }

    /// Drop every UNIQUE pin, across all installed policies, whose SA
    /// has left `sad`. Returns how many were dropped.
    pub fn prune_pins(&self, sad: &dyn SecurityAssociationDb) -> usize {
        let snap = self.table.load();
        snap.policies
            .iter()
            .flat_map(|p| p.chain())
            .map(|req| req.prune_pins(sad))
            .sum()
    }

    /// The ids of every policy, in lookup order.
    #[cfg(any(feature = "test-help", test))]
    pub fn policy_ids(&self) -> Vec<PolicyId> {
        self.table.load().policies.iter().map(|p| p.id()).collect()
    }

    /// Add a policy, returning its id.
    ///
    /// # Errors
    ///
    /// If the policy is malformed, its requested id is in use, or the
    /// table is full, an error is returned and the SPD is unchanged.
    pub fn insert(
        &self,
        spec: &PolicySpec,
        now: Moment,
    ) -> Result<PolicyId, SpdError> {
        let policy = self.table.update(|table| {
            let len = table.policies.len();
            if len >= self.max_entries as usize {
                return Err(SpdError::ResourceExhausted(len as u64));
            }

            let id = match spec.id {
                Some(id) => {
                    Self::check_id(id)?;
                    if table.contains(id) {
                        return Err(SpdError::DuplicateId(id));
                    }
                    id
                }

                None => self.alloc_id(table),
            };

            let policy = SecurityPolicy::new(id, spec, now)?;
            let mut next = table.clone();
            next.add(PolicyRef::clone(&policy));
            Ok((next, policy))
        })?;

        info!(self.log, "policy added"; "policy" => %policy);
        Ok(policy.id())
    }

    /// Remove policy `id`. Anyone holding it may continue to use it,
    /// but it is marked DEAD.
    pub fn delete(&self, id: PolicyId) -> Result<(), SpdError> {
        let policy = self.table.update(|table| {
            let mut next = table.clone();
            let old = next.remove(id).ok_or(SpdError::NotFound(id))?;
            Ok((next, old))
        })?;

        policy.mark_dead();
        info!(self.log, "policy deleted"; "policy" => %policy);
        Ok(())
    }

    /// Swap in a new policy under the existing id `id`.
    ///
    /// The new policy is built before anything is changed; if that
    /// fails, the old policy remains in place.
    pub fn replace(
        &self,
        id: PolicyId,
        spec: &PolicySpec,
        now: Moment,
    ) -> Result<(), SpdError> {
        if spec.id.is_some_and(|sid| sid != id) {
            return Err(SpdError::InvalidPolicy(format!(
                "replacement for policy {id} names policy {}",
                spec.id.unwrap_or_default(),
            )));
        }

        let (old, new) = self.table.update(|table| {
            if !table.contains(id) {
                return Err(SpdError::NotFound(id));
            }

            let new = SecurityPolicy::new(id, spec, now)?;
            let mut next = table.clone();
            let old = next.remove(id).ok_or(SpdError::NotFound(id))?;
            next.add(PolicyRef::clone(&new));
            Ok((next, (old, new)))
        })?;

        old.mark_dead();
        info!(self.log, "policy replaced"; "old" => %old, "new" => %new);
        Ok(())
    }

    /// Remove every policy, returning how many there were.
    pub fn flush(&self) -> usize {
        let Ok(old) = self.table.update(|table| {
            let old = table.policies.clone();
            Ok::<_, Infallible>((PolicyTable::default(), old))
        });

        for p in &old {
            p.mark_dead();
        }

        info!(self.log, "SPD flushed"; "count" => old.len());
        old.len()
    }

    /// Remove every policy past its lifetime or valid time as of
    /// `now`, returning the ids of those removed.
    pub fn expire(&self, now: Moment) -> Vec<PolicyId> {
        let snap = self.table.load();
        if !snap.policies.iter().any(|p| p.is_expired(now)) {
            return vec![];
        }

        let Ok(expired) = self.table.update(|table| {
            let (expired, kept): (Vec<PolicyRef>, Vec<PolicyRef>) = table
                .policies
                .iter()
                .cloned()
                .partition(|p| p.is_expired(now));
            Ok::<_, Infallible>((PolicyTable { policies: kept }, expired))
        });

        for p in &expired {
            p.mark_dead();
            debug!(self.log, "policy expired"; "policy" => %p);
        }

        expired.iter().map(|p| p.id()).collect()
    }

    pub fn dump(&self, now: Moment) -> DumpSpdResp {
        let snap = self.table.load();
        DumpSpdResp {
            generation: snap.generation,
            default_policy: self.default_policy,
            policies: snap
                .policies
                .iter()
                .filter_map(|p| p.dump(now))
                .collect(),
        }
    }

    fn check_id(id: PolicyId) -> Result<(), SpdError> {
        if id == super::policy::SOCKET_POLICY_ID {
            return Err(SpdError::InvalidPolicy(format!(
                "policy id {id} is reserved",
            )));
        }
        Ok(())
    }

    // The table is never full at this point, so a free id exists.
    fn alloc_id(&self, table: &PolicyTable) -> PolicyId {
        loop {
            let id = self.next_id.fetch_add(1, Ordering::Relaxed);
            if Self::check_id(id).is_ok() && !table.contains(id) {
                return id;
            }
        }
    }
}

impl fmt::Debug for Spd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Spd")
            .field("default_policy", &self.default_policy)
            .field("generation", &self.generation())
            .field("len", &self.len())
            .finish()
    }
}
