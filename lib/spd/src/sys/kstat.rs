// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Named 64-bit counters.
//!
//! Counters are bumped from many packet-processing threads at once
//! and read by the admin path, so each one is a relaxed atomic. The
//! values taken as a group are not a consistent snapshot; each
//! individual value is.
use core::fmt;
use core::fmt::Display;
use core::sync::atomic::AtomicU64;
use core::sync::atomic::Ordering;

/// The longest permitted counter name, in bytes.
pub const KSTAT_STRLEN: usize = 31;

/// A provider of named counters.
///
/// Rather than implementing this trait manually, the kstat-macro
/// should be used.
///
/// # Example
///
/// To declare a new provider simply define a struct of named fields
/// with type [`KStatU64`] and derive [`KStatProvider`].
///
/// ```ignore
/// #[derive(KStatProvider)]
/// struct SomeStats {
///     out_polvio: KStatU64,
///     in_polvio: KStatU64,
/// }
/// ```
///
/// To update the values use [`KStatU64::incr()`].
///
/// ```ignore
/// some_val.stats.vals.out_polvio.incr(1);
/// ```
pub trait KStatProvider {
    const NUM_FIELDS: u32;
    const NAMES: &'static [&'static str];
    type Snap;

    fn init(&mut self) -> Result<(), Error>;

    fn new() -> Self;

    fn num_fields(&self) -> u32 {
        Self::NUM_FIELDS
    }

    /// Return a snapshot of the stats. This is how you obtain a copy,
    /// as opposed to the traditional clone().
    fn snapshot(&self) -> Self::Snap;

    /// Every counter as a `(name, value)` pair, in declaration order.
    fn entries(&self) -> Vec<(&'static str, u64)>;
}

/// An initialized [`KStatProvider`], along with the module and name
/// it is reported under.
///
/// ```ignore
/// #[derive(KStatProvider)]
/// pub StatProvider {
///     my_counter: KStatU64,
/// }
///
/// KStatNamed::new("module", "name", StatProvider::new());
/// ```
pub struct KStatNamed<T: KStatProvider> {
    module: String,
    name: String,
    pub vals: Box<T>,
}

impl<T: KStatProvider> KStatNamed<T> {
    pub fn new(
        module: &str,
        name: &str,
        provider: T,
    ) -> Result<KStatNamed<T>, Error> {
        check_name(module)?;
        check_name(name)?;
        let mut vals = Box::new(provider);
        vals.init()?;
        Ok(Self { module: module.to_string(), name: name.to_string(), vals })
    }

    pub fn module(&self) -> &str {
        &self.module
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

fn check_name(name: &str) -> Result<(), Error> {
    if name.contains('\0') {
        return Err(Error::NulChar);
    }

    if name.len() > KSTAT_STRLEN {
        return Err(Error::NameTooLong(name.to_string()));
    }

    Ok(())
}

/// A 64-bit unsigned named counter.
#[derive(Debug, Default)]
pub struct KStatU64 {
    value: AtomicU64,
}

impl KStatU64 {
    pub fn init(&mut self, name: &str) -> Result<(), Error> {
        check_name(name)
    }

    pub fn new() -> Self {
        Self { value: AtomicU64::new(0) }
    }

    #[inline]
    pub fn incr(&self, n: u64) {
        self.value.fetch_add(n, Ordering::Relaxed);
    }

    pub fn val(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// A kstat error.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Error {
    NameTooLong(String),
    NulChar,
}

impl Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::NameTooLong(name) => {
                write!(f, "kstat name too long: {name}")
            }

            Self::NulChar => write!(f, "kstat name contains NUL char"),
        }
    }
}

impl std::error::Error for Error {}
