// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! A counting allocator, so that benchmarks can report how many
//! allocations (and how many bytes) a lookup costs.
//!
//! The cached fast path is expected to make none.

use super::MeasurementInfo;
use criterion::Criterion;
use criterion::Throughput;
use criterion::measurement::Measurement;
use criterion::measurement::ValueFormatter;
use std::alloc::GlobalAlloc;
use std::alloc::Layout;
use std::alloc::System;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::time::Duration;

#[global_allocator]
static COUNTING: Counting = Counting {
    allocs: AtomicU64::new(0),
    bytes: AtomicU64::new(0),
};

// Criterion runs one benchmark at a time, so global counters are
// enough.
struct Counting {
    allocs: AtomicU64,
    bytes: AtomicU64,
}

unsafe impl GlobalAlloc for Counting {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        self.allocs.fetch_add(1, Ordering::Relaxed);
        self.bytes.fetch_add(layout.size() as u64, Ordering::Relaxed);
        unsafe { System.alloc(layout) }
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        unsafe { System.dealloc(ptr, layout) }
    }
}

/// Number of allocations made.
pub struct Allocs;

/// Number of bytes allocated.
pub struct Bytes;

/// An allocation counter usable as a criterion [`Measurement`].
pub trait Counter {
    const LABEL: &'static str;
    const UNIT: &'static str;

    fn read() -> u64;
}

impl Counter for Allocs {
    const LABEL: &'static str = "alloc_ct";
    const UNIT: &'static str = "";

    fn read() -> u64 {
        COUNTING.allocs.load(Ordering::Relaxed)
    }
}

impl Counter for Bytes {
    const LABEL: &'static str = "alloc_sz";
    const UNIT: &'static str = "B";

    fn read() -> u64 {
        COUNTING.bytes.load(Ordering::Relaxed)
    }
}

/// Per-iteration values are small; nothing is ever rescaled.
struct Unscaled(&'static str);

impl ValueFormatter for Unscaled {
    fn scale_values(
        &self,
        _typical: f64,
        _values: &mut [f64],
    ) -> &'static str {
        self.0
    }

    fn scale_throughputs(
        &self,
        _typical: f64,
        _throughput: &Throughput,
        _values: &mut [f64],
    ) -> &'static str {
        self.0
    }

    fn scale_for_machines(&self, _values: &mut [f64]) -> &'static str {
        self.0
    }
}

pub struct AllocMeasure<C> {
    fmt: Unscaled,
    _counter: std::marker::PhantomData<C>,
}

impl<C: Counter> Measurement for AllocMeasure<C> {
    type Intermediate = u64;
    type Value = u64;

    fn start(&self) -> u64 {
        C::read()
    }

    fn end(&self, start: u64) -> u64 {
        C::read() - start
    }

    fn add(&self, v1: &u64, v2: &u64) -> u64 {
        v1 + v2
    }

    fn zero(&self) -> u64 {
        0
    }

    fn to_f64(&self, value: &u64) -> f64 {
        *value as f64
    }

    fn formatter(&self) -> &dyn ValueFormatter {
        &self.fmt
    }
}

impl<C: Counter> MeasurementInfo for AllocMeasure<C> {
    fn label() -> &'static str {
        C::LABEL
    }
}

/// A [`Criterion`] which counts allocations of kind `C` instead of
/// timing. The counts are deterministic, so a handful of short samples
/// is plenty.
pub fn new_crit<C: Counter>() -> Criterion<AllocMeasure<C>> {
    Criterion::default()
        .with_measurement(AllocMeasure {
            fmt: Unscaled(C::UNIT),
            _counter: std::marker::PhantomData,
        })
        .sample_size(10)
        .warm_up_time(Duration::from_nanos(1))
        .measurement_time(Duration::from_micros(10))
        .nresamples(1)
        .without_plots()
}
