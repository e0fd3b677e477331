// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! A lock-wrapped, snapshot-readable value.
//!
//! Readers take a [`Snapshot`] (an `Arc` of the current value) and
//! walk it without holding any lock. Writers replace the whole value,
//! so a snapshot never observes a partial update. This is how the
//! neighbor encap lists and the indirect binding list are read from
//! event paths while configuration mutates them.

use crate::ddi::sync::KRwLock;
use alloc::sync::Arc;
use core::fmt::Debug;
use core::ops::Deref;
use core::sync::atomic::AtomicU64;
use core::sync::atomic::Ordering;

pub struct Dynamic<T> {
    inner: KRwLock<Arc<T>>,
    epoch: AtomicU64,
}

#[derive(Debug)]
pub struct Snapshot<T> {
    pub value: Arc<T>,
    pub epoch: u64,
}

impl<T> From<T> for Dynamic<T> {
    fn from(value: T) -> Self {
        Self { inner: KRwLock::new(value.into()), epoch: AtomicU64::default() }
    }
}

impl<T: Default> Default for Dynamic<T> {
    fn default() -> Self {
        T::default().into()
    }
}

impl<T> Dynamic<T> {
    pub fn store(&self, value: T) {
        let mut inner = self.inner.write();
        *inner = value.into();
        _ = self.epoch.fetch_add(1, Ordering::Relaxed);
    }

    pub fn load(&self) -> Snapshot<T> {
        let value_locked = self.inner.read();
        let value = Arc::clone(&*value_locked);
        let epoch = self.epoch.load(Ordering::Relaxed);

        Snapshot { epoch, value }
    }

    pub fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::Relaxed)
    }
}

impl<T: Clone> Dynamic<T> {
    /// Copy the current value, apply `f` to the copy, and publish it.
    ///
    /// Outstanding snapshots keep the old value. Writers are
    /// serialized by the write lock.
    pub fn update<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        let mut inner = self.inner.write();
        let mut next = T::clone(&inner);
        let ret = f(&mut next);
        *inner = next.into();
        _ = self.epoch.fetch_add(1, Ordering::Relaxed);
        ret
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
