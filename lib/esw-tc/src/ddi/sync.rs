// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Synchronization primitives used by the offload control paths.
//!
//! These keep the driver-style naming (`KMutex`, `KRwLock`) so the
//! lock discipline reads the same as the datapath it models: a
//! `KMutex` is a sleeping driver mutex, a `KRwLock` protects
//! read-mostly tables, and a [`TokenLock`] hands out a single
//! exclusive [`Token`] which callers pass around explicitly to prove
//! they are inside the global reconfiguration section.
//!
//! A poisoned lock is not treated as fatal: the protected state is
//! always left consistent between statements, so the guard is simply
//! recovered.
use core::cell::UnsafeCell;
use core::ops::Deref;
use core::ops::DerefMut;
use std::sync::Condvar;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::PoisonError;
use std::sync::RwLock;
use std::sync::RwLockReadGuard;
use std::sync::RwLockWriteGuard;
use std::thread::ThreadId;

/// A driver mutex wrapping `val`.
///
/// All access from here on out must be done by acquiring a
/// [`KMutexGuard`] via the `lock()` method.
#[derive(Debug, Default)]
pub struct KMutex<T> {
    inner: Mutex<T>,
}

pub struct KMutexGuard<'a, T: 'a> {
    guard: MutexGuard<'a, T>,
}

impl<T> Deref for KMutexGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        self.guard.deref()
    }
}

impl<T> DerefMut for KMutexGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        self.guard.deref_mut()
    }
}

pub struct LockTaken;

impl<T> KMutex<T> {
    pub const fn new(val: T) -> Self {
        KMutex { inner: Mutex::new(val) }
    }

    pub fn into_inner(self) -> T {
        self.inner.into_inner().unwrap_or_else(PoisonError::into_inner)
    }

    /// Acquire the mutex, blocking if it is held. The mutex is
    /// released when the guard is dropped.
    pub fn lock(&self) -> KMutexGuard<'_, T> {
        let guard = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        KMutexGuard { guard }
    }

    pub fn try_lock(&self) -> Result<KMutexGuard<'_, T>, LockTaken> {
        match self.inner.try_lock() {
            Ok(guard) => Ok(KMutexGuard { guard }),
            Err(std::sync::TryLockError::Poisoned(p)) => {
                Ok(KMutexGuard { guard: p.into_inner() })
            }
            Err(std::sync::TryLockError::WouldBlock) => Err(LockTaken),
        }
    }
}

/// A reader/writer lock for read-mostly tables.
#[derive(Debug, Default)]
pub struct KRwLock<T> {
    inner: RwLock<T>,
}

pub struct KRwLockReadGuard<'a, T: 'a> {
    guard: RwLockReadGuard<'a, T>,
}

pub struct KRwLockWriteGuard<'a, T: 'a> {
    guard: RwLockWriteGuard<'a, T>,
}

impl<T> Deref for KRwLockReadGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        self.guard.deref()
    }
}

impl<T> Deref for KRwLockWriteGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        self.guard.deref()
    }
}

impl<T> DerefMut for KRwLockWriteGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        self.guard.deref_mut()
    }
}

impl<T> KRwLock<T> {
    pub const fn new(val: T) -> Self {
        KRwLock { inner: RwLock::new(val) }
    }

    pub fn into_inner(self) -> T {
        self.inner.into_inner().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn read(&self) -> KRwLockReadGuard<'_, T> {
        let guard = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        KRwLockReadGuard { guard }
    }

    pub fn write(&self) -> KRwLockWriteGuard<'_, T> {
        let guard =
            self.inner.write().unwrap_or_else(PoisonError::into_inner);
        KRwLockWriteGuard { guard }
    }
}

#[derive(Debug, Default)]
pub struct KCondvar {
    cv: Condvar,
}

impl KCondvar {
    pub fn new() -> Self {
        Self { cv: Condvar::new() }
    }

    pub fn notify_one(&self) {
        self.cv.notify_one()
    }

    pub fn notify_all(&self) {
        self.cv.notify_all()
    }

    pub fn wait<'a, T: 'a>(
        &self,
        lock: KMutexGuard<'a, T>,
    ) -> KMutexGuard<'a, T> {
        let guard =
            self.cv.wait(lock.guard).unwrap_or_else(PoisonError::into_inner);
        KMutexGuard { guard }
    }
}

/// A mutual exclusion mechanism which loans out access to a single
/// internal token. This is used to ensure at most one thread is present
/// in a critical section *without actively holding a [`KMutex`]*.
///
/// The reconfiguration section (neighbor updates rewriting encap
/// headers and reprogramming flows) is guarded this way: functions
/// which require it take `&Token<'_, T>` as a parameter rather than
/// locking something ambient, so the requirement is visible at every
/// call site and tests can drive contending callers deterministically.
pub struct TokenLock<T> {
    holder: KMutex<Option<ThreadId>>,
    cv: KCondvar,
    inner: UnsafeCell<T>,
}

// SAFETY: Access to `inner` is only granted through a `Token`, and at
// most one `Token` exists at a time.
unsafe impl<T: Send> Send for TokenLock<T> {}
unsafe impl<T: Send> Sync for TokenLock<T> {}

impl<T> TokenLock<T> {
    pub fn new(token: T) -> Self {
        let holder = KMutex::new(None);
        let cv = KCondvar::new();

        Self { holder, cv, inner: UnsafeCell::new(token) }
    }

    pub fn lock(&self) -> Token<'_, T> {
        let mut thread_lock = self.holder.lock();

        while thread_lock.is_some() {
            thread_lock = self.cv.wait(thread_lock);
        }

        *thread_lock = Some(std::thread::current().id());

        Token { lock: self }
    }

    /// Is the token currently loaned out?
    pub fn is_held(&self) -> bool {
        self.holder.lock().is_some()
    }
}

pub struct Token<'a, T> {
    lock: &'a TokenLock<T>,
}

impl<T> Token<'_, T> {
    /// Does this token belong to `lock`?
    pub fn is_from(&self, lock: &TokenLock<T>) -> bool {
        core::ptr::eq(self.lock, lock)
    }
}

impl<T> Deref for Token<'_, T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        // SAFETY: Only the thread indicated by `parent.holder`
        // can have a `Token`, thus we are safe to take a shared ref
        // (no other writers).
        unsafe { &*self.lock.inner.get() }
    }
}

impl<T> DerefMut for Token<'_, T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        // SAFETY: Only the thread indicated by `parent.holder`
        // can have a `Token`, thus there are no other writers.
        // Rust has also guaranteed this is the only &mut to the Token
        // itself, so no other readers.
        unsafe { &mut *self.lock.inner.get() }
    }
}

impl<T> Drop for Token<'_, T> {
    fn drop(&mut self) {
        let mut thread_lock = self.lock.holder.lock();
        *thread_lock = None;
        self.lock.cv.notify_all();
    }
}
