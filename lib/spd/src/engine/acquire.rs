// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Acquires: asking key management for SAs the SAD lacks.
//!
//! Every packet which finds no SA for one of its requests wants an
//! acquire, and a flow that is waiting on key negotiation can easily
//! produce thousands of them. The [`AcquireQueue`] remembers what has
//! been asked for, per selector and SA identity, and suppresses repeats
//! until the entry is either satisfied or too old to trust.

use crate::sys::sync::KMutex;
use crate::sys::time::Moment;
use crate::sys::time::Ttl;
use spd_api::PolicyId;
use spd_api::Sai;
use spd_api::Selector;
use std::collections::BTreeMap;

/// The key management actor.
///
/// Callbacks are made from packet-processing and admin contexts and
/// must not block.
pub trait KeyManager: Send + Sync {
    /// Negotiate an SA for `sai`, on behalf of traffic matching `sel`.
    fn on_acquire(&self, sel: &Selector, sai: &Sai);

    /// Policy `id` has expired out of the SPD.
    fn on_policy_expire(&self, _id: PolicyId) {}
}

/// A key manager which ignores everything.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoKeyManager;

impl KeyManager for NoKeyManager {
    fn on_acquire(&self, _sel: &Selector, _sai: &Sai) {}
}

#[derive(Clone, Debug)]
pub struct AcquireEntry {
    pub sai: Sai,
    pub created: Moment,
    /// Acquires suppressed since key management was last signalled.
    pub count: u32,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum AcquireResult {
    /// Key management should be signalled.
    Sent,

    /// An equivalent acquire is already pending.
    Suppressed,
}

pub struct AcquireQueue {
    lifetime: Ttl,
    block_count: u32,
    entries: KMutex<BTreeMap<(Selector, Sai), AcquireEntry>>,
}

impl AcquireQueue {
    pub fn new(lifetime: Ttl, block_count: u32) -> Self {
        Self { lifetime, block_count, entries: KMutex::new(BTreeMap::new()) }
    }

    /// Record an acquire of `sai` for `sel` at `now` and decide
    /// whether key management needs to hear about it.
    ///
    /// A pending, unexpired entry for the same `sel` and `sai`
    /// suppresses the signal.
    /// After `block_count` suppressions the signal goes out again
    /// anyway, in case key management lost the first one.
    pub fn acquire(
        &self,
        sel: &Selector,
        sai: &Sai,
        now: Moment,
    ) -> AcquireResult {
        let mut entries = self.entries.lock();

        if let Some(entry) = entries.get_mut(&(*sel, *sai)) {
            if !self.lifetime.is_expired(entry.created, now) {
                if entry.count < self.block_count {
                    entry.count += 1;
                    return AcquireResult::Suppressed;
                }

                entry.count = 0;
                return AcquireResult::Sent;
            }
        }

        let entry = AcquireEntry { sai: *sai, created: now, count: 0 };
        entries.insert((*sel, *sai), entry);
        AcquireResult::Sent
    }

    /// An SA for `sai` has been installed: forget the acquires which
    /// were waiting on it. Returns the number removed.
    pub fn satisfied(&self, sai: &Sai) -> usize {
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|(_, s), _| s != sai);
        before - entries.len()
    }

    /// Remove every entry older than the acquire lifetime, answered or
    /// not. Returns the number removed.
    pub fn prune(&self, now: Moment) -> usize {
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|_, e| !self.lifetime.is_expired(e.created, now));
        before - entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn dump(&self) -> Vec<(Selector, AcquireEntry)> {
        let entries = self.entries.lock();
        entries.iter().map(|((sel, _), e)| (*sel, e.clone())).collect()
    }
}
