// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! The IPsec policy engine.
//!
//! The leaves are the SAD boundary ([`sad`]) and the transform engine
//! boundary ([`xform`]). Policies ([`policy`]) and their request
//! chains ([`request`]) are held in the SPD ([`spd`]), consulted
//! either directly or through a socket's cache ([`pcb`]). Missing SAs
//! turn into acquires ([`acquire`]). [`ipsec`] ties it all together.
pub mod acquire;
pub mod ipsec;
pub mod pcb;
pub mod policy;
pub mod request;
pub mod sad;
pub mod spd;
pub mod stat;
pub mod xform;

pub use spd_api::Direction;
