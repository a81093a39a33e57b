// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

use super::DefaultPolicy;
use super::Level;
use serde::Deserialize;
use serde::Serialize;

pub const DEF_ACQUIRE_LIFETIME_SECS: u64 = 20;
pub const DEF_ACQUIRE_BLOCK_COUNT: u32 = 10;
pub const DEF_SPD_MAX_ENTRIES: u32 = 8192;
pub const DEF_LOG_RATE_LIMIT_MS: u64 = 1_000;

/// System-wide IPsec configuration.
///
/// Every field has a default, so a configuration file need only name
/// what it changes.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(default)]
pub struct IpsecCfg {
    /// The disposition of traffic which matches no policy.
    pub default_policy: DefaultPolicy,

    /// The level used by `default` ESP transport requests.
    pub esp_trans_deflev: Level,

    /// The level used by `default` ESP tunnel requests.
    pub esp_net_deflev: Level,

    /// The level used by `default` AH transport requests.
    pub ah_trans_deflev: Level,

    /// The level used by `default` AH tunnel requests.
    pub ah_net_deflev: Level,

    /// How long an acquire suppresses identical acquires.
    pub acquire_lifetime_secs: u64,

    /// The number of suppressed acquires after which key management
    /// is signalled again anyway.
    pub acquire_block_count: u32,

    pub spd_max_entries: u32,

    /// The minimum interval between two packet-path log messages of
    /// the same kind.
    pub log_rate_limit_ms: u64,
}

impl Default for IpsecCfg {
    fn default() -> Self {
        Self {
            default_policy: DefaultPolicy::Discard,
            esp_trans_deflev: Level::Use,
            esp_net_deflev: Level::Use,
            ah_trans_deflev: Level::Use,
            ah_net_deflev: Level::Use,
            acquire_lifetime_secs: DEF_ACQUIRE_LIFETIME_SECS,
            acquire_block_count: DEF_ACQUIRE_BLOCK_COUNT,
            spd_max_entries: DEF_SPD_MAX_ENTRIES,
            log_rate_limit_ms: DEF_LOG_RATE_LIMIT_MS,
        }
    }
}
