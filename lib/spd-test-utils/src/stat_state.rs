// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Routines for verifying the IPsec counters.

use spd::engine::ipsec::Ipsec;
use std::collections::BTreeMap;

/// Track the expected value of every IPsec counter, for the purpose of
/// verifying that exactly the expected events occur when a packet is
/// processed or an administrative command runs. This type should be
/// manipulated by the macros that follow.
///
/// The counters are keyed by the names in the statistics table.
/// Asserting the state compares every one of them, so an unexpected
/// bump of any counter fails the check.
pub struct IpsecState {
    pub counts: BTreeMap<&'static str, u64>,
    pub generation: u64,
}

impl IpsecState {
    /// Start from whatever `ipsec` currently reports.
    pub fn new(ipsec: &Ipsec) -> Self {
        Self {
            counts: ipsec.stats().into_iter().collect(),
            generation: ipsec.spd().generation(),
        }
    }
}

/// Assert that the engine's counters and SPD generation match the
/// expected state stored in the `IpsecState`.
#[macro_export]
macro_rules! assert_stats {
    ($ias:expr) => {
        for (field, actual_val) in $ias.ipsec.stats() {
            let expected_val = $ias.st.counts.get(field).copied();
            assert!(
                expected_val == Some(actual_val),
                "counter mismatch: field: {}, expected: {:?}, actual: {}",
                field,
                expected_val,
                actual_val,
            );
        }

        {
            let expected = $ias.st.generation;
            let actual = $ias.ipsec.spd().generation();
            assert!(
                expected == actual,
                "generation mismatch: expected: {}, actual: {}",
                expected,
                actual,
            );
        }
    };
}

/// Increment a list of counters in the `IpsecState`. The pseudo-field
/// `generation` bumps the expected SPD generation.
#[macro_export]
macro_rules! incr_na {
    ($ias:expr, $fields:expr) => {
        for f in $fields {
            match f {
                "generation" => $ias.st.generation += 1,
                _ => match $ias.st.counts.get_mut(f) {
                    Some(v) => *v += 1,
                    None => panic!("counter does not exist: {}", f),
                },
            }
        }
    };
}

/// Increment a list of counters in the `IpsecState` and assert the
/// engine's state.
///
/// ```ignore
/// incr!(g, ["spd_insert", "generation"]);
/// ```
#[macro_export]
macro_rules! incr {
    ($ias:expr, $fields:expr) => {
        $crate::incr_na!($ias, $fields);
        $crate::assert_stats!($ias);
    };
}

/// Set counters to explicit values, given as `name=value`, and
/// assert the engine's state.
///
/// ```ignore
/// set!(g, ["acquire_suppressed=10"]);
/// ```
#[macro_export]
macro_rules! set {
    ($ias:expr, $fields:expr) => {
        for f in $fields {
            match f.split_once("=") {
                Some(("generation", val)) => {
                    $ias.st.generation = val.parse::<u64>().unwrap();
                }

                Some((field, val)) => match $ias.st.counts.get_mut(field) {
                    Some(v) => *v = val.parse().unwrap(),
                    None => panic!("counter does not exist: {}", field),
                },

                _ => panic!("malformed field expr: {}", f),
            }
        }
        $crate::assert_stats!($ias);
    };
}
