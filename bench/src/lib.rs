// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

use criterion::measurement::Measurement;
use criterion::measurement::WallTime;
use rand::Rng;
use slog::Logger;
use spd::engine::acquire::NoKeyManager;
use spd::engine::xform::NullXform;
use spd_test_utils::*;
use std::sync::Arc;

#[cfg(feature = "alloc")]
pub mod alloc;

/// Additional labelling information for [`Measurement`]s for
/// pretty-printing and grouping.
pub trait MeasurementInfo: Measurement {
    fn label() -> &'static str;
}

impl MeasurementInfo for WallTime {
    fn label() -> &'static str {
        "wallclock"
    }
}

/// SPD sizes worth comparing. Each must fit in the /24s of 10.0.0.0/8.
pub const SPD_SIZES: [usize; 4] = [1, 16, 256, 4096];

/// The `i`th benchmark subnet, as its first three octets.
fn subnet(i: usize) -> (usize, usize) {
    ((i >> 8) & 0xff, i & 0xff)
}

/// An engine with `n` outbound BYPASS policies, each covering its own
/// /24 of 10.0.0.0/8, above a catch-all DISCARD.
pub fn spd_with(n: usize) -> Ipsec {
    let ipsec = Ipsec::spd_init(
        IpsecCfg::default(),
        Logger::root(slog::Discard, slog::o!()),
        Arc::new(MemSad::new()),
        Arc::new(NullXform),
        Arc::new(NoKeyManager),
    )
    .unwrap();

    let now = Moment::now();
    let all = sel("0.0.0.0/0", "0.0.0.0/0");
    ipsec.spd_insert(&policy(Out, all, Disposition::Discard), now).unwrap();

    for i in 0..n {
        let (b, c) = subnet(i);
        let dst = sel("0.0.0.0/0", &format!("10.{b}.{c}.0/24"));
        ipsec.spd_insert(&policy(Out, dst, Disposition::Bypass), now).unwrap();
    }

    ipsec
}

/// `count` TCP flows to hosts chosen at random from the first `n`
/// benchmark subnets.
pub fn random_flows(n: usize, count: usize) -> Vec<FlowId> {
    let mut rng = rand::rng();
    (0..count)
        .map(|_| {
            let (b, c) = subnet(rng.random_range(0..n));
            let host: u8 = rng.random_range(1..255);
            tcp4("192.168.0.7", 40000, &format!("10.{b}.{c}.{host}"), 443)
        })
        .collect()
}
