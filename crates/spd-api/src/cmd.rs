// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

use super::PolicyId;
use serde::Deserialize;
use serde::Serialize;
use thiserror::Error;

/// Errors returned to the administrative caller.
///
/// A failed administrative operation never modifies the SPD.
#[derive(Clone, Debug, Deserialize, Eq, Error, PartialEq, Serialize)]
pub enum SpdError {
    #[error("policy {0} not found")]
    NotFound(PolicyId),

    #[error("policy {0} already exists")]
    DuplicateId(PolicyId),

    #[error("invalid selector: {0}")]
    InvalidSelector(String),

    #[error("invalid policy: {0}")]
    InvalidPolicy(String),

    /// Only a privileged socket may bypass IPsec.
    #[error("permission denied")]
    PermissionDenied,

    #[error("SPD is at max capacity: {0} policies")]
    ResourceExhausted(u64),

    #[error("SA with SPI {0:#x} already installed")]
    DuplicateSa(u32),

    #[error("policy deserialization failed: {0}")]
    DeserPolicy(String),

    #[error("policy serialization failed: {0}")]
    SerPolicy(String),
}
