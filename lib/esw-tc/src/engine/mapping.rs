// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Id to key mapping domains.
//!
//! When a rule is offloaded, the parts of its state that the hardware
//! cannot carry on a packet (a tunnel match, encap options, the chain
//! a packet missed in) are stored here and replaced by a small id the
//! hardware stamps onto the packet instead. The receive path maps the
//! id back.
//!
//! Ids are refcounted per key: adding the same key twice yields the
//! same id, and the id is freed when the last user removes it.

use crate::ddi::sync::KRwLock;
use alloc::collections::BTreeMap;
use alloc::string::String;
use esw_tc_api::TcError;

struct MappingEntry<K> {
    key: K,
    refcnt: u32,
}

struct MappingInner<K> {
    by_id: BTreeMap<u32, MappingEntry<K>>,
    by_key: BTreeMap<K, u32>,
    next_id: u32,
}

/// One mapping domain, e.g. tunnel keys.
pub struct Mapping<K> {
    name: String,
    max_id: u32,
    inner: KRwLock<MappingInner<K>>,
}

impl<K: Clone + Ord> Mapping<K> {
    /// Create a domain handing out ids in `1..=max_id`. Zero is never
    /// handed out: the restore paths treat it as "no object".
    pub fn new(name: &str, max_id: u32) -> Self {
        Self {
            name: name.into(),
            max_id,
            inner: KRwLock::new(MappingInner {
                by_id: BTreeMap::new(),
                by_key: BTreeMap::new(),
                next_id: 1,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn len(&self) -> usize {
        self.inner.read().by_id.len()
    }

    /// Map `key` to an id, taking a reference on it.
    pub fn add(&self, key: &K) -> Result<u32, TcError> {
        let mut inner = self.inner.write();

        if let Some(&id) = inner.by_key.get(key) {
            if let Some(entry) = inner.by_id.get_mut(&id) {
                entry.refcnt += 1;
            }
            return Ok(id);
        }

        if inner.by_id.len() as u64 >= u64::from(self.max_id) {
            return Err(TcError::ResourceExhausted(format!(
                "mapping {} full",
                self.name
            )));
        }

        // Find the next free id, wrapping within 1..=max_id.
        let mut id = inner.next_id;
        while inner.by_id.contains_key(&id) {
            id = if id >= self.max_id { 1 } else { id + 1 };
        }
        inner.next_id = if id >= self.max_id { 1 } else { id + 1 };

        inner.by_id.insert(id, MappingEntry { key: key.clone(), refcnt: 1 });
        inner.by_key.insert(key.clone(), id);
        Ok(id)
    }

    /// Drop a reference on `id`, freeing it on the last one.
    pub fn remove(&self, id: u32) -> Result<(), TcError> {
        let mut inner = self.inner.write();
        let Some(entry) = inner.by_id.get_mut(&id) else {
            return Err(TcError::NotFound(format!(
                "mapping {} id {id}",
                self.name
            )));
        };

        entry.refcnt -= 1;
        if entry.refcnt == 0 {
            if let Some(entry) = inner.by_id.remove(&id) {
                inner.by_key.remove(&entry.key);
            }
        }

        Ok(())
    }

    /// Map an id back to its key.
    pub fn find(&self, id: u32) -> Result<K, TcError> {
        self.inner.read().by_id.get(&id).map(|e| e.key.clone()).ok_or_else(
            || TcError::NotFound(format!("mapping {} id {id}", self.name)),
        )
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn refcounted_ids() {
        let m: Mapping<u64> = Mapping::new("test", 8);
        let a = m.add(&100).unwrap();
        let b = m.add(&200).unwrap();
        assert_ne!(a, 0);
        assert_ne!(a, b);
        assert_eq!(m.add(&100).unwrap(), a);
        assert_eq!(m.find(a).unwrap(), 100);

        m.remove(a).unwrap();
        assert_eq!(m.find(a).unwrap(), 100);
        m.remove(a).unwrap();
        assert!(matches!(m.find(a), Err(TcError::NotFound(_))));
        assert!(m.remove(a).is_err());
        assert_eq!(m.len(), 1);
    }

    #[test]
    fn exhaustion_and_wrap() {
        let m: Mapping<u32> = Mapping::new("small", 2);
        let a = m.add(&1).unwrap();
        let _b = m.add(&2).unwrap();
        assert!(matches!(m.add(&3), Err(TcError::ResourceExhausted(_))));
        m.remove(a).unwrap();
        assert_eq!(m.add(&3).unwrap(), a);
    }
}
