// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Encap entries and their binding to neighbor entries.
//!
//! An encap entry is a prebuilt outer header shared by every offloaded
//! flow tunneling to the same destination. Its destination MAC comes
//! from neighbor resolution, so each entry is attached to the
//! neighbor entry of its next hop. When the neighbor changes state
//! the flows using the entry are taken off the stale header and,
//! once the neighbor is reachable again, reprogrammed with a rebuilt
//! one. The hardware reformat context embeds the header bytes, so any
//! change means tear down and rebuild rather than patching in place.
//!
//! All three operations run under the switch-wide encap table lock.
//! Attach and detach are handed the guard by their caller, while
//! `update_flows()` takes it itself inside the reconfiguration
//! section, so a rebuild never overlaps an attach or detach.

use super::esw::TcFlow;
use super::neigh::NeighEntry;
use super::neigh::NeighKey;
use super::netdev::NetDev;
use super::rep::Rtnl;
use super::rep::TcRep;
use super::tun_entropy::ReformatType;
use crate::ddi::sync::KMutex;
use crate::ddi::sync::KMutexGuard;
use crate::ddi::sync::Token;
use crate::provider::LogLevel;
use alloc::sync::Arc;
use alloc::sync::Weak;
use alloc::vec::Vec;
use bitflags::bitflags;
use core::fmt;
use esw_tc_api::ETH_ALEN;
use esw_tc_api::MacAddr;
use esw_tc_api::TcError;

/// Proof of holding the switch-wide encap table lock, handed out by
/// [`TcRep::encap_tbl_lock()`] only.
///
/// The guard of any other lock is refused at compile time:
///
/// ```compile_fail
/// use esw_tc::ddi::sync::KMutex;
/// use esw_tc::engine::encap::EncapTblGuard;
///
/// let other = KMutex::new(());
/// let _tbl: EncapTblGuard<'_> = other.lock();
/// ```
pub struct EncapTblGuard<'a> {
    lock: &'a KMutex<()>,
    _guard: KMutexGuard<'a, ()>,
}

impl EncapTblGuard<'_> {
    /// Is this the encap table lock of `rep`?
    pub fn is_from(&self, rep: &TcRep) -> bool {
        core::ptr::eq(self.lock, &rep.encap_tbl_lock)
    }
}

impl fmt::Debug for EncapTblGuard<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EncapTblGuard").finish_non_exhaustive()
    }
}

const ETH_DST_OFF: usize = 0;
const ETH_SRC_OFF: usize = ETH_ALEN;

bitflags! {
    #[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
    pub struct EncapFlags: u8 {
        /// The header is complete and flows using it are programmed
        /// with it.
        const VALID = 1 << 0;
    }
}

#[derive(Debug)]
struct EncapState {
    flags: EncapFlags,
    h_dest: MacAddr,
    /// The outer headers, starting with the Ethernet header.
    header: Vec<u8>,
}

pub struct EncapEntry {
    pub reformat_type: ReformatType,
    /// The device the outer packet is routed out of; its address is
    /// the header's source MAC.
    pub route_dev_ifindex: u32,
    state: KMutex<EncapState>,
    nhe: KMutex<Option<Weak<NeighEntry>>>,
    flows: KMutex<Vec<Weak<TcFlow>>>,
}

impl fmt::Debug for EncapEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EncapEntry")
            .field("reformat_type", &self.reformat_type)
            .field("route_dev_ifindex", &self.route_dev_ifindex)
            .field("flags", &self.flags())
            .field("h_dest", &self.h_dest())
            .field("attached", &self.is_attached())
            .finish()
    }
}

impl EncapEntry {
    pub fn new(
        reformat_type: ReformatType,
        route_dev_ifindex: u32,
        header: Vec<u8>,
    ) -> Arc<Self> {
        Arc::new(Self {
            reformat_type,
            route_dev_ifindex,
            state: KMutex::new(EncapState {
                flags: EncapFlags::empty(),
                h_dest: MacAddr::ZERO,
                header,
            }),
            nhe: KMutex::new(None),
            flows: KMutex::new(Vec::new()),
        })
    }

    pub fn flags(&self) -> EncapFlags {
        self.state.lock().flags
    }

    pub fn is_valid(&self) -> bool {
        self.flags().contains(EncapFlags::VALID)
    }

    pub fn h_dest(&self) -> MacAddr {
        self.state.lock().h_dest
    }

    pub fn header(&self) -> Vec<u8> {
        self.state.lock().header.clone()
    }

    pub fn is_attached(&self) -> bool {
        self.nhe.lock().is_some()
    }

    /// The neighbor entry this encap is attached to.
    pub fn nhe(&self) -> Option<Arc<NeighEntry>> {
        self.nhe.lock().as_ref().and_then(Weak::upgrade)
    }

    /// Record `flow` as using this entry.
    pub fn add_flow(&self, flow: &Arc<TcFlow>) {
        let mut flows = self.flows.lock();
        flows.retain(|f| f.strong_count() > 0);
        flows.push(Arc::downgrade(flow));
    }

    pub fn num_flows(&self) -> usize {
        self.flows.lock().iter().filter(|f| f.strong_count() > 0).count()
    }

    /// A point-in-time list of the live flows using this entry. The
    /// references are held until the list is dropped.
    fn take_all_flows(&self) -> Vec<Arc<TcFlow>> {
        self.flows.lock().iter().filter_map(Weak::upgrade).collect()
    }

    fn set_valid(&self, valid: bool) {
        self.state.lock().flags.set(EncapFlags::VALID, valid);
    }

    fn set_h_dest(&self, ha: MacAddr) {
        let mut state = self.state.lock();
        state.h_dest = ha;
        if let Some(dst) =
            state.header.get_mut(ETH_DST_OFF..ETH_DST_OFF + ETH_ALEN)
        {
            dst.copy_from_slice(&ha.bytes());
        }
    }

    fn set_h_source(&self, ha: MacAddr) {
        let mut state = self.state.lock();
        if let Some(src) =
            state.header.get_mut(ETH_SRC_OFF..ETH_SRC_OFF + ETH_ALEN)
        {
            src.copy_from_slice(&ha.bytes());
        }
    }
}

impl TcRep {
    /// Take the switch-wide encap table lock.
    pub fn encap_tbl_lock(&self) -> EncapTblGuard<'_> {
        EncapTblGuard {
            lock: &self.encap_tbl_lock,
            _guard: self.encap_tbl_lock.lock(),
        }
    }

    /// Attach `e` to the neighbor entry for `m_neigh`, creating the
    /// entry on first use. `tbl` must be this switch's encap table
    /// lock.
    pub fn encap_entry_attach(
        &self,
        tbl: &EncapTblGuard<'_>,
        e: &Arc<EncapEntry>,
        m_neigh: &NeighKey,
        neigh_dev: &Arc<NetDev>,
    ) -> Result<(), TcError> {
        if !tbl.is_from(self) {
            return Err(TcError::Invalid(format!(
                "{}: encap table guard belongs to another switch",
                self.name()
            )));
        }

        if e.is_attached() {
            return Err(TcError::AlreadyExists(format!(
                "encap entry already attached to neighbor {m_neigh}"
            )));
        }

        let tun_entropy = &self.uplink.tun_entropy;
        tun_entropy.refcount_inc(e.reformat_type)?;

        let update = self.neigh.lock_update();
        let nhe = match self.neigh.lookup(m_neigh) {
            Some(nhe) => nhe,
            None => match self.neigh.create(&update, *m_neigh, neigh_dev) {
                Ok(nhe) => nhe,
                Err(err) => {
                    drop(update);
                    tun_entropy.refcount_dec(e.reformat_type);
                    return Err(err);
                }
            },
        };

        *e.nhe.lock() = Some(Arc::downgrade(&nhe));
        nhe.link(e);
        Ok(())
    }

    /// Undo [`Self::encap_entry_attach`]. Detaching an entry which is
    /// not attached does nothing.
    pub fn encap_entry_detach(&self, tbl: &EncapTblGuard<'_>, e: &EncapEntry) {
        if !tbl.is_from(self) {
            self.log.log(
                LogLevel::Error,
                &format!(
                    "{}: refusing encap detach under another switch's \
                     table lock",
                    self.name()
                ),
            );
            return;
        }

        let Some(weak) = e.nhe.lock().take() else {
            return;
        };

        if let Some(nhe) = weak.upgrade() {
            nhe.unlink(e);
            self.neigh.release(&nhe);
        }

        self.uplink.tun_entropy.refcount_dec(e.reformat_type);
    }

    /// Bring the flows using `e` in line with its neighbor being
    /// `neigh_connected` at `ha`.
    pub fn update_flows(
        &self,
        rtnl: &Token<'_, Rtnl>,
        e: &EncapEntry,
        neigh_connected: bool,
        ha: MacAddr,
    ) {
        debug_assert!(rtnl.is_from(&self.rtnl));

        let tbl = self.encap_tbl_lock();
        let encap_connected = e.is_valid();

        if encap_connected == neigh_connected && e.h_dest() == ha {
            return;
        }

        let flow_list = e.take_all_flows();
        let installer = &self.svc.installer;

        if e.is_valid() && (!neigh_connected || e.h_dest() != ha) {
            e.set_valid(false);
            installer.encap_flows_del(e, &flow_list);
        }

        if neigh_connected && !e.is_valid() {
            e.set_h_dest(ha);

            match self.devs.get(e.route_dev_ifindex) {
                Some(route_dev) => e.set_h_source(route_dev.dev_addr()),
                None => self.log.log(
                    LogLevel::Warn,
                    &format!(
                        "{}: encap route device {} is gone, keeping \
                         source MAC",
                        self.name(),
                        e.route_dev_ifindex
                    ),
                ),
            }

            match installer.encap_flows_add(e, &flow_list) {
                Ok(()) => e.set_valid(true),
                Err(err) => self.log.log(
                    LogLevel::Warn,
                    &format!(
                        "{}: failed to offload {} encap flow(s) to {ha}: \
                         {err}",
                        self.name(),
                        flow_list.len()
                    ),
                ),
            }
        }

        drop(tbl);
        drop(flow_list);
    }

    /// Handle a neighbor state change: reprogram the flows of every
    /// encap entry depending on `key`.
    pub fn neigh_update(
        &self,
        rtnl: &Token<'_, Rtnl>,
        key: &NeighKey,
        neigh_connected: bool,
        ha: MacAddr,
    ) {
        let Some(nhe) = self.neigh.lookup(key) else {
            return;
        };

        for e in nhe.encaps().iter() {
            self.update_flows(rtnl, e, neigh_connected, ha);
        }

        self.neigh.release(&nhe);
    }
}
