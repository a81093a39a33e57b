// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! The transform engine boundary.
//!
//! The engine decides *which* SAs to apply to a packet and in what
//! order; a [`TransformEngine`] does the actual AH/ESP work.

use super::sad::SecurityAssociation;
use thiserror::Error;

#[derive(Clone, Debug, Eq, Error, PartialEq)]
pub enum XformError {
    #[error("authentication failed")]
    AuthFailed,

    #[error("replayed sequence number {0}")]
    Replay(u32),

    #[error("out of resources")]
    NoResources,

    #[error("{0}")]
    Other(String),
}

pub trait TransformEngine: Send + Sync {
    /// Protect `pkt` in place with `sa`.
    fn apply(
        &self,
        sa: &SecurityAssociation,
        pkt: &mut Vec<u8>,
    ) -> Result<(), XformError>;

    /// Authenticate and unwrap `pkt` in place with `sa`, including the
    /// anti-replay check.
    fn verify(
        &self,
        sa: &SecurityAssociation,
        pkt: &mut Vec<u8>,
    ) -> Result<(), XformError>;
}

/// A transform engine which leaves packets untouched and accepts
/// everything. Useful for exercising policy decisions on their own.
#[derive(Clone, Copy, Debug, Default)]
pub struct NullXform;

impl TransformEngine for NullXform {
    fn apply(
        &self,
        _sa: &SecurityAssociation,
        _pkt: &mut Vec<u8>,
    ) -> Result<(), XformError> {
        Ok(())
    }

    fn verify(
        &self,
        _sa: &SecurityAssociation,
        _pkt: &mut Vec<u8>,
    ) -> Result<(), XformError> {
        Ok(())
    }
}
