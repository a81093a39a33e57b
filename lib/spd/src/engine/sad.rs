// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! The Security Association Database boundary.
//!
//! The SAD is populated by key management and consulted by the
//! engine through [`SecurityAssociationDb`]. The engine only ever
//! holds the [`SaHandle`]s it resolves for the packet at hand; the
//! one exception is a UNIQUE request, which remembers the [`SaId`] it
//! is bound to and revalidates it against the SAD on every use.
//!
//! [`MemSad`] is an in-memory implementation of the boundary.

use crate::sys::sync::KMutex;
use crate::sys::sync::KRwLock;
use crate::sys::time::Moment;
use crate::sys::time::Ttl;
use core::fmt;
use core::sync::atomic::AtomicBool;
use core::sync::atomic::AtomicU32;
use core::sync::atomic::Ordering;
use spd_api::AuthAlg;
use spd_api::EncAlg;
use spd_api::Sai;
use spd_api::SaSpec;
use spd_api::SpdError;
use std::collections::BTreeMap;
use std::sync::Arc;

/// An SA's identity: its SPI.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct SaId(pub u32);

impl fmt::Display for SaId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#010x}", self.0)
    }
}

pub type SaHandle = Arc<SecurityAssociation>;

/// An anti-replay sliding window of up to 64 sequence numbers.
///
/// The highest sequence number seen so far sits at bit 0 of the
/// bitmap; bit `n` records whether `last_seq - n` has been seen.
#[derive(Clone, Debug)]
pub struct ReplayWindow {
    size: u32,
    last_seq: u32,
    bitmap: u64,
    count: u64,
}

pub const MAX_REPLAY_WINDOW: u32 = u64::BITS;

impl ReplayWindow {
    /// A window of `size` packets; zero disables replay checking.
    pub fn new(size: u8) -> Self {
        Self {
            size: u32::from(size).min(MAX_REPLAY_WINDOW),
            last_seq: 0,
            bitmap: 0,
            count: 0,
        }
    }

    /// Would `seq` be accepted?
    pub fn check(&self, seq: u32) -> bool {
        if self.size == 0 {
            return true;
        }

        if seq == 0 {
            return false;
        }

        // The first packet is always fine.
        if self.count == 0 || seq > self.last_seq {
            return true;
        }

        let diff = self.last_seq - seq;
        if diff >= self.size {
            return false;
        }

        self.bitmap & (1 << diff) == 0
    }

    /// Check `seq` and, if it is acceptable, record it.
    ///
    /// This must only be called once the packet carrying `seq` has
    /// been authenticated.
    pub fn update(&mut self, seq: u32) -> bool {
        if !self.check(seq) {
            return false;
        }

        self.count += 1;
        if self.size == 0 {
            return true;
        }

        if self.count == 1 {
            self.last_seq = seq;
            self.bitmap = 1;
            return true;
        }

        if seq > self.last_seq {
            let diff = seq - self.last_seq;
            self.bitmap =
                if diff < self.size { (self.bitmap << diff) | 1 } else { 1 };
            self.last_seq = seq;
        } else {
            self.bitmap |= 1 << (self.last_seq - seq);
        }

        true
    }

    pub fn last_seq(&self) -> u32 {
        self.last_seq
    }
}

/// A single negotiated cryptographic context.
pub struct SecurityAssociation {
    id: SaId,
    sai: Sai,
    auth: AuthAlg,
    enc: EncAlg,
    key: Vec<u8>,
    created: Moment,
    lifetime: Ttl,
    seq_out: AtomicU32,
    replay: KMutex<ReplayWindow>,
    dead: AtomicBool,
}

impl SecurityAssociation {
    pub fn new(spec: SaSpec, now: Moment) -> Self {
        Self {
            id: SaId(spec.spi),
            sai: spec.sai(),
            auth: spec.auth,
            enc: spec.enc,
            replay: KMutex::new(ReplayWindow::new(spec.replay_window)),
            lifetime: Ttl::new_seconds(spec.lifetime_secs),
            key: spec.key,
            created: now,
            seq_out: AtomicU32::new(0),
            dead: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> SaId {
        self.id
    }

    pub fn sai(&self) -> &Sai {
        &self.sai
    }

    pub fn auth_alg(&self) -> AuthAlg {
        self.auth
    }

    pub fn enc_alg(&self) -> EncAlg {
        self.enc
    }

    pub fn key(&self) -> &[u8] {
        &self.key
    }

    /// Allocate the next outbound sequence number.
    pub fn next_seq(&self) -> u32 {
        self.seq_out.fetch_add(1, Ordering::Relaxed).wrapping_add(1)
    }

    /// Would an inbound packet with `seq` pass the replay check?
    pub fn check_replay(&self, seq: u32) -> bool {
        self.replay.lock().check(seq)
    }

    /// Record an authenticated inbound `seq`, failing if it is a
    /// replay.
    pub fn update_replay(&self, seq: u32) -> bool {
        self.replay.lock().update(seq)
    }

    pub fn is_expired(&self, now: Moment) -> bool {
        self.lifetime.is_expired(self.created, now)
    }

    pub fn is_dead(&self) -> bool {
        self.dead.load(Ordering::Acquire)
    }

    fn mark_dead(&self) {
        self.dead.store(true, Ordering::Release);
    }
}

impl fmt::Debug for SecurityAssociation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Keep the key material out of any log.
        f.debug_struct("SecurityAssociation")
            .field("id", &self.id)
            .field("sai", &self.sai)
            .field("auth", &self.auth)
            .field("enc", &self.enc)
            .field("dead", &self.is_dead())
            .finish()
    }
}

/// The engine's view of the SAD.
///
/// Every method may be called concurrently from packet-processing
/// threads and must not block on anything but short internal locks.
pub trait SecurityAssociationDb: Send + Sync {
    /// Find the SA to use for `sai`, if one is established.
    fn resolve(&self, sai: &Sai) -> Option<SaHandle>;

    /// Find the specific SA `id` under `sai`, if it is still usable.
    fn lookup(&self, sai: &Sai, id: SaId) -> Option<SaHandle>;

    fn install(&self, sa: SecurityAssociation) -> Result<SaHandle, SpdError>;

    /// Remove every SA for `sai`, returning how many there were.
    fn expire(&self, sai: &Sai) -> usize;
}

/// An in-memory SAD.
///
/// Several SAs may share an SAI while a rekey is in progress; the
/// oldest usable one is preferred, matching the usual convention of
/// draining the old SA before moving to its replacement.
///
/// Lookups never consult the clock. An SA stays usable until it is
/// torn down with [`SecurityAssociationDb::expire()`] or its lifetime
/// is enforced by [`MemSad::expire_at()`], which the owner must call
/// periodically with the same clock it passes everywhere else.
#[derive(Default)]
pub struct MemSad {
    sas: KRwLock<BTreeMap<Sai, Vec<SaHandle>>>,
}

impl MemSad {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.sas.read().values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn dump(&self) -> Vec<SaHandle> {
        self.sas.read().values().flatten().cloned().collect()
    }

    /// Remove every SA whose lifetime has run out as of `now`.
    pub fn expire_at(&self, now: Moment) -> Vec<SaHandle> {
        let mut expired = vec![];
        let mut sas = self.sas.write();
        for list in sas.values_mut() {
            list.retain(|sa| {
                if sa.is_expired(now) {
                    sa.mark_dead();
                    expired.push(Arc::clone(sa));
                    false
                } else {
                    true
                }
            });
        }
        sas.retain(|_, list| !list.is_empty());
        expired
    }

    fn usable(sa: &SecurityAssociation) -> bool {
        !sa.is_dead()
    }
}

impl SecurityAssociationDb for MemSad {
    fn resolve(&self, sai: &Sai) -> Option<SaHandle> {
        self.sas
            .read()
            .get(sai)?
            .iter()
            .find(|sa| Self::usable(sa))
            .cloned()
    }

    fn lookup(&self, sai: &Sai, id: SaId) -> Option<SaHandle> {
        self.sas
            .read()
            .get(sai)?
            .iter()
            .find(|sa| sa.id() == id && Self::usable(sa))
            .cloned()
    }

    fn install(&self, sa: SecurityAssociation) -> Result<SaHandle, SpdError> {
        let mut sas = self.sas.write();
        if sas.values().flatten().any(|s| s.id() == sa.id()) {
            return Err(SpdError::DuplicateSa(sa.id().0));
        }

        let sa = Arc::new(sa);
        sas.entry(*sa.sai()).or_default().push(Arc::clone(&sa));
        Ok(sa)
    }

    fn expire(&self, sai: &Sai) -> usize {
        match self.sas.write().remove(sai) {
            Some(list) => {
                list.iter().for_each(|sa| sa.mark_dead());
                list.len()
            }
            None => 0,
        }
    }
}
