// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Neighbor entries.
//!
//! A neighbor entry stands for one next hop on one device and
//! collects the encap entries whose outer destination MAC depends on
//! resolving it. Entries are refcounted by their encap entries and
//! leave the table when the last one detaches.
//!
//! Lock order: the table's update lock, then an entry's list lock.

use super::encap::EncapEntry;
use super::netdev::NetDev;
use super::netdev::NetDevRef;
use crate::ddi::sync::KMutex;
use crate::ddi::sync::KMutexGuard;
use crate::ddi::sync::KRwLock;
use crate::dynamic::Dynamic;
use crate::dynamic::Snapshot;
use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt;
use core::net::IpAddr;
use core::sync::atomic::AtomicU32;
use core::sync::atomic::Ordering;
use esw_tc_api::TcError;

#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct NeighKey {
    /// The device the next hop is reached through.
    pub dev_ifindex: u32,
    pub dst_ip: IpAddr,
}

impl fmt::Display for NeighKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.dst_ip, self.dev_ifindex)
    }
}

pub struct NeighEntry {
    pub key: NeighKey,
    neigh_dev: NetDevRef,
    encap_list_lock: KMutex<()>,
    encap_list: Dynamic<Vec<Arc<EncapEntry>>>,
    refcnt: AtomicU32,
}

impl fmt::Debug for NeighEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NeighEntry")
            .field("key", &self.key)
            .field("neigh_dev", &self.neigh_dev)
            .field("encaps", &self.encap_list.load().len())
            .field("refcnt", &self.refcnt())
            .finish()
    }
}

impl NeighEntry {
    pub fn neigh_dev(&self) -> &NetDevRef {
        &self.neigh_dev
    }

    pub fn refcnt(&self) -> u32 {
        self.refcnt.load(Ordering::Acquire)
    }

    /// The encap entries currently depending on this neighbor. The
    /// snapshot stays valid while entries are linked and unlinked.
    pub fn encaps(&self) -> Snapshot<Vec<Arc<EncapEntry>>> {
        self.encap_list.load()
    }

    pub(crate) fn link(&self, e: &Arc<EncapEntry>) {
        let _guard = self.encap_list_lock.lock();
        self.encap_list.update(|list| list.push(Arc::clone(e)));
    }

    pub(crate) fn unlink(&self, e: &EncapEntry) {
        let _guard = self.encap_list_lock.lock();
        self.encap_list.update(|list| {
            list.retain(|cur| !core::ptr::eq(Arc::as_ptr(cur), e))
        });
    }

    /// Take a reference unless the entry is already on its way out.
    fn try_hold(&self) -> bool {
        self.refcnt
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |c| {
                if c == 0 { None } else { Some(c + 1) }
            })
            .is_ok()
    }
}

pub struct NeighTable {
    update_lock: KMutex<()>,
    entries: KRwLock<BTreeMap<NeighKey, Arc<NeighEntry>>>,
    capacity: usize,
}

impl NeighTable {
    pub fn new(capacity: usize) -> Self {
        Self {
            update_lock: KMutex::new(()),
            entries: KRwLock::new(BTreeMap::new()),
            capacity,
        }
    }

    /// Serialize entry creation and destruction.
    pub fn lock_update(&self) -> KMutexGuard<'_, ()> {
        self.update_lock.lock()
    }

    /// Find the entry for `key` and take a reference on it.
    pub fn lookup(&self, key: &NeighKey) -> Option<Arc<NeighEntry>> {
        let entries = self.entries.read();
        let nhe = entries.get(key)?;
        if nhe.try_hold() { Some(Arc::clone(nhe)) } else { None }
    }

    /// Create the entry for `key` holding one reference. The caller
    /// holds the update lock and has seen `lookup()` miss.
    pub fn create(
        &self,
        _update: &KMutexGuard<'_, ()>,
        key: NeighKey,
        neigh_dev: &Arc<NetDev>,
    ) -> Result<Arc<NeighEntry>, TcError> {
        let mut entries = self.entries.write();

        if entries.len() >= self.capacity {
            return Err(TcError::ResourceExhausted(format!(
                "neighbor table full ({} entries)",
                self.capacity
            )));
        }

        let nhe = Arc::new(NeighEntry {
            key,
            neigh_dev: neigh_dev.hold(),
            encap_list_lock: KMutex::new(()),
            encap_list: Dynamic::default(),
            refcnt: AtomicU32::new(1),
        });

        // A lingering entry with a zero refcount is about to be removed
        // by its releaser, which will find it already replaced.
        entries.insert(key, Arc::clone(&nhe));
        Ok(nhe)
    }

    /// Drop a reference. The last one removes the entry from the
    /// table under the update lock.
    pub fn release(&self, nhe: &Arc<NeighEntry>) {
        let fast = nhe.refcnt.fetch_update(
            Ordering::AcqRel,
            Ordering::Acquire,
            |c| if c > 1 { Some(c - 1) } else { None },
        );
        if fast.is_ok() {
            return;
        }

        let _update = self.update_lock.lock();
        if nhe.refcnt.fetch_sub(1, Ordering::AcqRel) != 1 {
            return;
        }

        let mut entries = self.entries.write();
        if entries.get(&nhe.key).is_some_and(|cur| Arc::ptr_eq(cur, nhe)) {
            entries.remove(&nhe.key);
        }
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn dump(&self) -> Vec<Arc<NeighEntry>> {
        self.entries.read().values().cloned().collect()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::engine::netdev::NetDevKind;
    use esw_tc_api::MacAddr;

    fn key(last: u8) -> NeighKey {
        NeighKey {
            dev_ifindex: 1,
            dst_ip: IpAddr::from([10, 0, 0, last]),
        }
    }

    fn dev() -> Arc<NetDev> {
        Arc::new(NetDev::new(1, "up0", NetDevKind::Rep, MacAddr::ZERO))
    }

    #[test]
    fn last_release_removes() {
        let table = NeighTable::new(4);
        let dev = dev();
        let nhe = {
            let g = table.lock_update();
            table.create(&g, key(1), &dev).unwrap()
        };
        assert_eq!(dev.holds(), 1);

        let again = table.lookup(&key(1)).unwrap();
        assert!(Arc::ptr_eq(&nhe, &again));
        assert_eq!(nhe.refcnt(), 2);

        table.release(&again);
        assert_eq!(table.len(), 1);
        table.release(&nhe);
        assert_eq!(table.len(), 0);
        assert!(table.lookup(&key(1)).is_none());

        drop(again);
        drop(nhe);
        assert_eq!(dev.holds(), 0);
    }

    #[test]
    fn capacity() {
        let table = NeighTable::new(1);
        let dev = dev();
        let g = table.lock_update();
        table.create(&g, key(1), &dev).unwrap();
        let err = table.create(&g, key(2), &dev).unwrap_err();
        assert!(matches!(err, TcError::ResourceExhausted(_)));
    }
}
