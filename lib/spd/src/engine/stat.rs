// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! The IPsec statistics table.

use crate::sys::kstat;
use crate::sys::kstat::KStatProvider;
use crate::sys::kstat::KStatU64;
use kstat_macro::KStatProvider;
use spd_api::SecProto;

#[derive(KStatProvider)]
pub struct IpsecStats {
    /// Inbound packets which passed policy verification.
    pub in_success: KStatU64,

    /// Inbound packets dropped by a DISCARD policy, the DISCARD
    /// default, or a transform history not satisfying the policy.
    pub in_polvio: KStatU64,

    /// Inbound packets arriving without the SAs their policy requires.
    pub in_nosa: KStatU64,

    /// Inbound packets whose selector could not be built.
    pub in_inval: KStatU64,

    pub in_replay: KStatU64,
    pub in_ah_auth_ok: KStatU64,
    pub in_ah_auth_fail: KStatU64,
    pub in_esp_auth_ok: KStatU64,
    pub in_esp_auth_fail: KStatU64,
    pub in_xform_err: KStatU64,

    /// Outbound packets released, protected or in the clear.
    pub out_success: KStatU64,

    /// Outbound packets dropped by a DISCARD policy or default.
    pub out_polvio: KStatU64,

    /// Outbound packets dropped for lack of a required SA.
    pub out_nosa: KStatU64,

    pub out_inval: KStatU64,

    /// Outbound packets released in the clear by BYPASS or NONE.
    pub out_bypass: KStatU64,

    pub out_xform_err: KStatU64,

    pub spd_insert: KStatU64,
    pub spd_delete: KStatU64,
    pub spd_replace: KStatU64,
    pub spd_flush: KStatU64,
    pub spd_expired: KStatU64,

    /// Lookups which matched no policy and fell to the default.
    pub spd_lookup_miss: KStatU64,

    pub pcb_cache_hit: KStatU64,
    pub pcb_cache_miss: KStatU64,

    /// Cache slots found to predate the current SPD generation.
    pub pcb_cache_stale: KStatU64,

    pub acquire_sent: KStatU64,
    pub acquire_suppressed: KStatU64,
    pub acquire_pruned: KStatU64,

    /// Configured default levels which had to be coerced to `use`.
    pub cfg_coerced: KStatU64,
}

impl IpsecStats {
    pub fn auth_ok(&self, proto: SecProto) -> &KStatU64 {
        match proto {
            SecProto::Ah => &self.in_ah_auth_ok,
            SecProto::Esp => &self.in_esp_auth_ok,
        }
    }

    pub fn auth_fail(&self, proto: SecProto) -> &KStatU64 {
        match proto {
            SecProto::Ah => &self.in_ah_auth_fail,
            SecProto::Esp => &self.in_esp_auth_fail,
        }
    }
}
