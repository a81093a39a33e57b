// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Moments and time-to-live values.
//!
//! Every time-dependent operation in the engine takes the current
//! [`Moment`] as an argument, so expiry can be driven by a test clock.
use core::ops::Add;
use core::time::Duration;
use std::time::Instant;

/// The number of milliseconds in a second.
pub const MILLIS: u64 = 1_000;

/// A moment in time.
#[derive(Clone, Copy, Debug, Eq, Ord, PartialEq, PartialOrd)]
pub struct Moment {
    inner: Instant,
}

impl Add<Duration> for Moment {
    type Output = Self;

    fn add(self, rhs: Duration) -> Self {
        Self { inner: self.inner + rhs }
    }
}

impl Moment {
    /// Compute the delta between `self` and `earlier` in
    /// milliseconds. A moment before `earlier` yields zero.
    pub fn delta_as_millis(&self, earlier: Moment) -> u64 {
        let delta = self.inner.saturating_duration_since(earlier.inner);
        u64::try_from(delta.as_millis()).unwrap_or(u64::MAX)
    }

    pub fn now() -> Self {
        Self { inner: Instant::now() }
    }
}

impl Default for Moment {
    fn default() -> Self {
        Self::now()
    }
}

/// A Time To Live in milliseconds. A TTL of zero never expires.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Ttl(u64);

impl Ttl {
    pub const NEVER: Self = Ttl(0);

    pub fn as_seconds(&self) -> u64 {
        self.0 / MILLIS
    }

    pub fn is_never(&self) -> bool {
        self.0 == 0
    }

    /// Is `since` expired?
    pub fn is_expired(&self, since: Moment, now: Moment) -> bool {
        !self.is_never() && now.delta_as_millis(since) >= self.0
    }

    /// Create a new TTL based on seconds.
    pub const fn new_seconds(seconds: u64) -> Self {
        Ttl(seconds.saturating_mul(MILLIS))
    }

    pub const fn new_millis(millis: u64) -> Self {
        Ttl(millis)
    }
}
