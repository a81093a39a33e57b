// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! A versioned, swappable value.
//!
//! Readers take a [`Snapshot`] (an `Arc` of the current value plus
//! the generation it belongs to) and never observe a partially
//! updated value. Writers build a complete new value and swap it in,
//! bumping the generation. A reader which only needs to know whether
//! anything changed can read [`Dynamic::generation()`] without
//! touching the lock at all.

use crate::sys::sync::KMutex;
use crate::sys::sync::KRwLock;
use core::fmt::Debug;
use core::ops::Deref;
use core::sync::atomic::AtomicU64;
use core::sync::atomic::Ordering;
use core::write;
use std::sync::Arc;

#[derive(Clone)]
pub struct Dynamic<T>(Arc<InnerDynamic<T>>);

struct InnerDynamic<T> {
    inner: KRwLock<Arc<T>>,
    generation: AtomicU64,
    // Serializes read-modify-write updates so that two writers never
    // build from the same base value.
    writer: KMutex<()>,
}

#[derive(Debug)]
pub struct Snapshot<T> {
    pub value: Arc<T>,
    pub generation: u64,
}

impl<T> From<T> for Dynamic<T> {
    fn from(value: T) -> Self {
        let inner = KRwLock::new(value.into());

        Self(
            InnerDynamic {
                inner,
                generation: AtomicU64::default(),
                writer: KMutex::new(()),
            }
            .into(),
        )
    }
}

impl<T> Dynamic<T> {
    /// Build a new value from the current one and swap it in.
    ///
    /// If `f` fails the current value and generation are left as they
    /// were and the error is returned.
    pub fn update<R, E>(
        &self,
        f: impl FnOnce(&T) -> Result<(T, R), E>,
    ) -> Result<R, E> {
        let _writer = self.0.writer.lock();
        let current = Arc::clone(&*self.0.inner.read());
        let (next, ret) = f(&current)?;
        self.swap(next.into());
        Ok(ret)
    }

    // Caller must hold the writer lock.
    fn swap(&self, value: Arc<T>) {
        let mut inner = self.0.inner.write();
        *inner = value;
        _ = self.0.generation.fetch_add(1, Ordering::Release);
    }

    pub fn load(&self) -> Snapshot<T> {
        let value_locked = self.0.inner.read();
        let value = Arc::clone(&*value_locked);
        let generation = self.0.generation.load(Ordering::Acquire);

        Snapshot { generation, value }
    }

    /// The number of times the value has been replaced.
    pub fn generation(&self) -> u64 {
        self.0.generation.load(Ordering::Acquire)
    }
}

impl<T: Debug> Debug for Dynamic<T> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let current_val = self.load();
        write!(f, "{current_val:?}")
    }
}

impl<T> Deref for Snapshot<T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        &self.value
    }
}
