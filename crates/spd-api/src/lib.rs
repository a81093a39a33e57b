// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

#![deny(unreachable_patterns)]
#![deny(unused_must_use)]

use serde::Deserialize;
use serde::Serialize;
use std::fmt;
use std::fmt::Display;

pub mod cfg;
pub mod cmd;
pub mod ip;
pub mod policy;
pub mod selector;

pub use cfg::*;
pub use cmd::*;
pub use ip::*;
pub use policy::*;
pub use selector::*;

/// The direction of traffic a policy applies to.
///
/// A lookup for `In` considers `In` and `Any` policies, likewise for
/// `Out`. A lookup for `Any` only considers `Any` policies.
#[derive(
    Clone, Copy, Debug, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd,
    Serialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    In,
    Out,
    Any,
}

impl Direction {
    pub const ALL: [Direction; 3] = [Self::In, Self::Out, Self::Any];

    /// The index of this direction's per-socket cache slot.
    pub const fn idx(self) -> usize {
        match self {
            Self::In => 0,
            Self::Out => 1,
            Self::Any => 2,
        }
    }

    /// Does a policy for `self` apply to traffic looked up as `dir`?
    pub fn applies_to(self, dir: Direction) -> bool {
        self == dir || self == Self::Any
    }
}

impl core::str::FromStr for Direction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "in" => Ok(Direction::In),
            "out" => Ok(Direction::Out),
            "any" => Ok(Direction::Any),
            _ => Err(format!("invalid direction: {s}")),
        }
    }
}

impl Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let dirstr = match self {
            Direction::In => "IN",
            Direction::Out => "OUT",
            Direction::Any => "ANY",
        };

        write!(f, "{dirstr}")
    }
}
