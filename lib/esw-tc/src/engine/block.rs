// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Flow blocks and the callback plumbing drivers bind into them.
//!
//! A flow block is the set of classifier rules attached to one hook
//! of one or more devices. A driver wanting to offload those rules
//! binds a callback into the block; the classifier then offers every
//! command on the block to each bound callback. A driver keeps its
//! own list of the blocks it is bound to so it can unwind them.
//!
//! Devices the driver does not own reach it through the
//! [`IndrDevRegistry`]: drivers register an [`IndrSetupCb`] once, and
//! any block bound on any device is offered to them.

use super::netdev::NetDev;
use crate::ddi::sync::KMutex;
use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::sync::Weak;
use alloc::vec::Vec;
use core::fmt;
use esw_tc_api::BlockBinderType;
use esw_tc_api::BlockCommand;
use esw_tc_api::FlowClsOffload;
use esw_tc_api::FlowOffloadAction;
use esw_tc_api::MatchallOffload;
use esw_tc_api::TcError;

/// A setup request delivered to a driver callback.
pub enum TcSetup<'a> {
    Block(&'a mut FlowBlockOffload),
    Ft(&'a mut FlowBlockOffload),
    ClsFlower(&'a mut FlowClsOffload),
    ClsMatchall(&'a mut MatchallOffload),
    /// A standalone action. Carries no payload when the classifier
    /// core has nothing to hand over.
    Act(Option<&'a mut FlowOffloadAction>),
    QdiscMqprio,
    QdiscHtb,
}

impl TcSetup<'_> {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Block(_) => "block",
            Self::Ft(_) => "ft",
            Self::ClsFlower(_) => "flower",
            Self::ClsMatchall(_) => "matchall",
            Self::Act(_) => "act",
            Self::QdiscMqprio => "mqprio",
            Self::QdiscHtb => "htb",
        }
    }
}

impl fmt::Debug for TcSetup<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TcSetup::{}", self.name())
    }
}

pub type BlockCbFn =
    Arc<dyn Fn(TcSetup<'_>) -> Result<(), TcError> + Send + Sync>;

/// Which driver callback a block registration is for.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum CbKind {
    RepTc,
    RepFt,
    IndrTc,
    IndrFt,
}

/// Identifies a registration: the callback plus the private data it
/// was registered with.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct CbId {
    pub kind: CbKind,
    pub ident: usize,
}

impl CbId {
    pub fn new<T>(kind: CbKind, priv_: &Arc<T>) -> Self {
        Self { kind, ident: Arc::as_ptr(priv_) as *const () as usize }
    }
}

/// A callback bound into a block.
pub struct BlockCb {
    id: CbId,
    cb: BlockCbFn,
    release: KMutex<Option<Box<dyn FnOnce() + Send>>>,
}

impl BlockCb {
    pub fn new(id: CbId, cb: BlockCbFn) -> Self {
        Self { id, cb, release: KMutex::new(None) }
    }

    /// Run `release` once the callback is freed.
    pub fn with_release(self, release: Box<dyn FnOnce() + Send>) -> Self {
        *self.release.lock() = Some(release);
        self
    }

    pub fn id(&self) -> CbId {
        self.id
    }

    pub fn call(&self, setup: TcSetup<'_>) -> Result<(), TcError> {
        (self.cb)(setup)
    }
}

impl Drop for BlockCb {
    fn drop(&mut self) {
        if let Some(release) = self.release.lock().take() {
            release();
        }
    }
}

pub struct FlowBlock {
    cbs: KMutex<Vec<Arc<BlockCb>>>,
    max_cbs: usize,
}

impl FlowBlock {
    pub fn new() -> Arc<Self> {
        Self::with_max_cbs(usize::MAX)
    }

    /// A block accepting at most `max_cbs` callbacks.
    pub fn with_max_cbs(max_cbs: usize) -> Arc<Self> {
        Arc::new(Self { cbs: KMutex::new(Vec::new()), max_cbs })
    }

    pub fn lookup(&self, id: CbId) -> bool {
        self.cbs.lock().iter().any(|cb| cb.id == id)
    }

    pub fn add(&self, cb: BlockCb) -> Result<(), TcError> {
        let mut cbs = self.cbs.lock();
        if cbs.iter().any(|c| c.id == cb.id) {
            return Err(TcError::AlreadyExists(format!(
                "block callback {:?}",
                cb.id
            )));
        }
        if cbs.len() >= self.max_cbs {
            return Err(TcError::ResourceExhausted(format!(
                "block full ({} callbacks)",
                self.max_cbs
            )));
        }
        cbs.push(Arc::new(cb));
        Ok(())
    }

    /// Unlink the callback. It is freed, and its release run, once
    /// any in-flight call through it has returned.
    pub fn remove(&self, id: CbId) -> Option<Arc<BlockCb>> {
        let mut cbs = self.cbs.lock();
        let pos = cbs.iter().position(|c| c.id == id)?;
        Some(cbs.remove(pos))
    }

    pub fn num_cbs(&self) -> usize {
        self.cbs.lock().len()
    }

    fn snapshot(&self) -> Vec<Arc<BlockCb>> {
        self.cbs.lock().clone()
    }

    /// Offer a flower command to every bound callback, returning how
    /// many accepted it. The first failure is returned.
    pub fn call_flower(
        &self,
        f: &mut FlowClsOffload,
    ) -> Result<usize, TcError> {
        let mut ok = 0;
        for cb in self.snapshot() {
            cb.call(TcSetup::ClsFlower(&mut *f))?;
            ok += 1;
        }
        Ok(ok)
    }

    pub fn call_matchall(
        &self,
        ma: &mut MatchallOffload,
    ) -> Result<usize, TcError> {
        let mut ok = 0;
        for cb in self.snapshot() {
            cb.call(TcSetup::ClsMatchall(&mut *ma))?;
            ok += 1;
        }
        Ok(ok)
    }
}

struct DriverBlockEntry {
    block: Weak<FlowBlock>,
    id: CbId,
}

/// The blocks a driver has bound one kind of callback into.
#[derive(Default)]
pub struct DriverBlockList {
    entries: KMutex<Vec<DriverBlockEntry>>,
}

impl DriverBlockList {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn contains(&self, block: &Arc<FlowBlock>, id: CbId) -> bool {
        self.entries.lock().iter().any(|e| {
            e.id == id && Weak::ptr_eq(&e.block, &Arc::downgrade(block))
        })
    }

    pub fn add(&self, block: &Arc<FlowBlock>, id: CbId) {
        self.entries
            .lock()
            .push(DriverBlockEntry { block: Arc::downgrade(block), id });
    }

    pub fn remove(&self, block: &Arc<FlowBlock>, id: CbId) {
        let block = Arc::downgrade(block);
        self.entries
            .lock()
            .retain(|e| !(e.id == id && Weak::ptr_eq(&e.block, &block)));
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Take every entry out of the list.
    pub fn drain(&self) -> Vec<(Weak<FlowBlock>, CbId)> {
        self.entries.lock().drain(..).map(|e| (e.block, e.id)).collect()
    }
}

/// A block bind or unbind request.
pub struct FlowBlockOffload {
    pub command: BlockCommand,
    pub binder_type: BlockBinderType,
    pub block: Arc<FlowBlock>,
    pub block_shared: bool,
    /// Set by drivers whose callbacks do their own locking.
    pub unlocked_driver_cb: bool,
    /// The driver list the request was served from.
    pub driver_block_list: Option<Arc<DriverBlockList>>,
}

impl FlowBlockOffload {
    pub fn new(
        command: BlockCommand,
        binder_type: BlockBinderType,
        block: &Arc<FlowBlock>,
    ) -> Self {
        Self {
            command,
            binder_type,
            block: Arc::clone(block),
            block_shared: false,
            unlocked_driver_cb: false,
            driver_block_list: None,
        }
    }
}

/// Bind or unbind a single callback for a driver that needs nothing
/// beyond one callback per block.
pub fn flow_block_cb_setup_simple(
    f: &mut FlowBlockOffload,
    driver_list: &Arc<DriverBlockList>,
    id: CbId,
    cb: BlockCbFn,
    ingress_only: bool,
) -> Result<(), TcError> {
    if ingress_only && f.binder_type != BlockBinderType::ClsactIngress {
        return Err(TcError::NotSupported(format!(
            "{} block binding",
            f.binder_type
        )));
    }

    f.driver_block_list = Some(Arc::clone(driver_list));

    match f.command {
        BlockCommand::Bind => {
            if driver_list.contains(&f.block, id) {
                return Err(TcError::AlreadyExists(format!(
                    "block callback {id:?} busy"
                )));
            }
            f.block.add(BlockCb::new(id, cb))?;
            driver_list.add(&f.block, id);
            Ok(())
        }

        BlockCommand::Unbind => {
            if f.block.remove(id).is_none() {
                return Err(TcError::NotFound(format!(
                    "block callback {id:?}"
                )));
            }
            driver_list.remove(&f.block, id);
            Ok(())
        }
    }
}

/// A driver's hook for devices it does not own.
pub trait IndrSetupCb: Send + Sync {
    /// `netdev` is `None` for requests not tied to any device.
    fn indr_setup(
        &self,
        netdev: Option<&Arc<NetDev>>,
        setup: TcSetup<'_>,
    ) -> Result<(), TcError>;
}

/// The drivers wanting to hear about blocks on foreign devices.
#[derive(Default)]
pub struct IndrDevRegistry {
    drivers: KMutex<Vec<(usize, Arc<dyn IndrSetupCb>)>>,
}

impl IndrDevRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &self,
        ident: usize,
        cb: Arc<dyn IndrSetupCb>,
    ) -> Result<(), TcError> {
        let mut drivers = self.drivers.lock();
        if drivers.iter().any(|(i, _)| *i == ident) {
            return Err(TcError::AlreadyExists(format!(
                "indirect callback {ident:#x}"
            )));
        }
        drivers.push((ident, cb));
        Ok(())
    }

    pub fn unregister(&self, ident: usize) -> Result<(), TcError> {
        let mut drivers = self.drivers.lock();
        let Some(pos) = drivers.iter().position(|(i, _)| *i == ident) else {
            return Err(TcError::NotFound(format!(
                "indirect callback {ident:#x}"
            )));
        };
        drivers.remove(pos);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.drivers.lock().len()
    }

    fn snapshot(&self) -> Vec<Arc<dyn IndrSetupCb>> {
        self.drivers.lock().iter().map(|(_, cb)| Arc::clone(cb)).collect()
    }

    /// Offer a block request on a foreign device to every registered
    /// driver. Returns the number of drivers which took it; if none
    /// did, the first error other than "not supported" is returned.
    pub fn setup_block(
        &self,
        netdev: &Arc<NetDev>,
        f: &mut FlowBlockOffload,
        ft: bool,
    ) -> Result<usize, TcError> {
        let mut ok = 0;
        let mut first_err = None;

        for cb in self.snapshot() {
            let setup =
                if ft { TcSetup::Ft(&mut *f) } else { TcSetup::Block(&mut *f) };
            match cb.indr_setup(Some(netdev), setup) {
                Ok(()) => ok += 1,
                Err(e) if e.is_not_supported() => {}
                Err(e) => {
                    first_err.get_or_insert(e);
                }
            }
        }

        match (ok, first_err) {
            (0, Some(e)) => Err(e),
            (0, None) => Err(TcError::not_supported("no driver took block")),
            (n, _) => Ok(n),
        }
    }

    /// Offer a standalone action to every registered driver, with the
    /// same result convention as [`Self::setup_block`].
    pub fn setup_action(
        &self,
        act: &mut FlowOffloadAction,
    ) -> Result<usize, TcError> {
        let mut ok = 0;
        let mut first_err = None;

        for cb in self.snapshot() {
            match cb.indr_setup(None, TcSetup::Act(Some(&mut *act))) {
                Ok(()) => ok += 1,
                Err(e) if e.is_not_supported() => {}
                Err(e) => {
                    first_err.get_or_insert(e);
                }
            }
        }

        match (ok, first_err) {
            (0, Some(e)) => Err(e),
            (0, None) => {
                Err(TcError::not_supported("no driver took action"))
            }
            (n, _) => Ok(n),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use core::sync::atomic::AtomicU32;
    use core::sync::atomic::Ordering;

    fn counting_cb(hits: &Arc<AtomicU32>) -> BlockCbFn {
        let hits = Arc::clone(hits);
        Arc::new(move |setup: TcSetup<'_>| match setup {
            TcSetup::ClsFlower(_) => {
                hits.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
            _ => Err(TcError::not_supported("test")),
        })
    }

    #[test]
    fn setup_simple_bind_unbind() {
        let owner = Arc::new(());
        let id = CbId::new(CbKind::RepTc, &owner);
        let hits = Arc::new(AtomicU32::new(0));
        let list = DriverBlockList::new();
        let block = FlowBlock::new();

        let mut bo = FlowBlockOffload::new(
            BlockCommand::Bind,
            BlockBinderType::ClsactIngress,
            &block,
        );
        flow_block_cb_setup_simple(
            &mut bo,
            &list,
            id,
            counting_cb(&hits),
            true,
        )
        .unwrap();
        assert!(bo.driver_block_list.is_some());
        assert_eq!(block.num_cbs(), 1);
        assert_eq!(list.len(), 1);

        let err = flow_block_cb_setup_simple(
            &mut bo,
            &list,
            id,
            counting_cb(&hits),
            true,
        )
        .unwrap_err();
        assert!(matches!(err, TcError::AlreadyExists(_)));

        let mut f = FlowClsOffload::new(esw_tc_api::ClsCommand::Replace, 1);
        assert_eq!(block.call_flower(&mut f).unwrap(), 1);
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        bo.command = BlockCommand::Unbind;
        flow_block_cb_setup_simple(
            &mut bo,
            &list,
            id,
            counting_cb(&hits),
            true,
        )
        .unwrap();
        assert_eq!(block.num_cbs(), 0);
        assert_eq!(list.len(), 0);

        let err = flow_block_cb_setup_simple(
            &mut bo,
            &list,
            id,
            counting_cb(&hits),
            true,
        )
        .unwrap_err();
        assert!(matches!(err, TcError::NotFound(_)));
    }

    #[test]
    fn setup_simple_ingress_only() {
        let owner = Arc::new(());
        let id = CbId::new(CbKind::RepTc, &owner);
        let hits = Arc::new(AtomicU32::new(0));
        let list = DriverBlockList::new();
        let block = FlowBlock::new();
        let mut bo = FlowBlockOffload::new(
            BlockCommand::Bind,
            BlockBinderType::ClsactEgress,
            &block,
        );
        let err = flow_block_cb_setup_simple(
            &mut bo,
            &list,
            id,
            counting_cb(&hits),
            true,
        )
        .unwrap_err();
        assert!(err.is_not_supported());
        assert_eq!(block.num_cbs(), 0);
    }

    #[test]
    fn release_runs_when_freed() {
        let owner = Arc::new(());
        let id = CbId::new(CbKind::IndrTc, &owner);
        let released = Arc::new(AtomicU32::new(0));
        let r = Arc::clone(&released);
        let block = FlowBlock::new();
        let hits = Arc::new(AtomicU32::new(0));

        block
            .add(BlockCb::new(id, counting_cb(&hits)).with_release(Box::new(
                move || {
                    r.fetch_add(1, Ordering::SeqCst);
                },
            )))
            .unwrap();

        let cb = block.remove(id).unwrap();
        assert_eq!(released.load(Ordering::SeqCst), 0);
        drop(cb);
        assert_eq!(released.load(Ordering::SeqCst), 1);
    }
}
