// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Recording stand-ins for the transform engine and key management.

use spd::api::PolicyId;
use spd::api::Sai;
use spd::api::Selector;
use spd::engine::acquire::KeyManager;
use spd::engine::sad::SaId;
use spd::engine::sad::SecurityAssociation;
use spd::engine::xform::TransformEngine;
use spd::engine::xform::XformError;
use std::sync::Mutex;

/// A transform engine which records every call.
///
/// `apply` pushes a 4-byte header carrying the SA's next sequence
/// number onto the front of the packet; `verify` pops it again and
/// runs the SA's replay window over it. A chain applied by `apply` is
/// therefore unwound by `verify` given the SAs outermost first.
#[derive(Default)]
pub struct RecordingXform {
    applied: Mutex<Vec<SaId>>,
    verified: Mutex<Vec<SaId>>,
    fail_next: Mutex<Option<XformError>>,
}

impl RecordingXform {
    /// The SAs passed to `apply`, in call order.
    pub fn applied(&self) -> Vec<SaId> {
        self.applied.lock().unwrap().clone()
    }

    /// The SAs passed to `verify`, in call order.
    pub fn verified(&self) -> Vec<SaId> {
        self.verified.lock().unwrap().clone()
    }

    /// Make the next `apply` or `verify` fail with `err`.
    pub fn fail_next(&self, err: XformError) {
        *self.fail_next.lock().unwrap() = Some(err);
    }

    fn take_failure(&self) -> Result<(), XformError> {
        match self.fail_next.lock().unwrap().take() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

impl TransformEngine for RecordingXform {
    fn apply(
        &self,
        sa: &SecurityAssociation,
        pkt: &mut Vec<u8>,
    ) -> Result<(), XformError> {
        self.applied.lock().unwrap().push(sa.id());
        self.take_failure()?;
        let mut out = sa.next_seq().to_be_bytes().to_vec();
        out.extend_from_slice(pkt);
        *pkt = out;
        Ok(())
    }

    fn verify(
        &self,
        sa: &SecurityAssociation,
        pkt: &mut Vec<u8>,
    ) -> Result<(), XformError> {
        self.verified.lock().unwrap().push(sa.id());
        self.take_failure()?;

        let Some(hdr) = pkt.get(..4) else {
            return Err(XformError::Other("truncated header".to_string()));
        };
        let seq = u32::from_be_bytes([hdr[0], hdr[1], hdr[2], hdr[3]]);

        if !sa.check_replay(seq) {
            return Err(XformError::Replay(seq));
        }
        // Authentication would happen here.
        if !sa.update_replay(seq) {
            return Err(XformError::Replay(seq));
        }

        pkt.drain(..4);
        Ok(())
    }
}

/// A key manager which records every callback.
#[derive(Default)]
pub struct RecordingKm {
    acquires: Mutex<Vec<(Selector, Sai)>>,
    expired: Mutex<Vec<PolicyId>>,
}

impl RecordingKm {
    pub fn acquires(&self) -> Vec<(Selector, Sai)> {
        self.acquires.lock().unwrap().clone()
    }

    pub fn expired(&self) -> Vec<PolicyId> {
        self.expired.lock().unwrap().clone()
    }
}

impl KeyManager for RecordingKm {
    fn on_acquire(&self, sel: &Selector, sai: &Sai) {
        self.acquires.lock().unwrap().push((*sel, *sai));
    }

    fn on_policy_expire(&self, id: PolicyId) {
        self.expired.lock().unwrap().push(id);
    }
}
