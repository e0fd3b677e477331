// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Embedded-switch services the representor glue drives but does not
//! implement: rule compilation and installation, conntrack restore,
//! sampling, and internal-port forwarding.

use super::encap::EncapEntry;
use super::netdev::NetDev;
use super::skb::SkBuff;
use alloc::sync::Arc;
use esw_tc_api::FlowClsOffload;
use esw_tc_api::MatchallOffload;
use esw_tc_api::SampleObj;
use esw_tc_api::TcError;
use esw_tc_api::TcFlags;

/// An offloaded rule handle, owned by the installer. Encap entries
/// track the flows using them so a neighbor change can reprogram them.
#[derive(Debug, Eq, PartialEq)]
pub struct TcFlow {
    pub cookie: u64,
}

impl TcFlow {
    pub fn new(cookie: u64) -> Arc<Self> {
        Arc::new(Self { cookie })
    }
}

/// Compiles classifier commands into hardware rules.
///
/// `filter_dev` is the device the rule was attached to: the
/// representor itself, or the foreign device of an indirect binding.
pub trait TcInstaller: Send + Sync {
    fn configure_flower(
        &self,
        filter_dev: &Arc<NetDev>,
        f: &mut FlowClsOffload,
        flags: TcFlags,
    ) -> Result<(), TcError>;

    fn delete_flower(
        &self,
        filter_dev: &Arc<NetDev>,
        f: &mut FlowClsOffload,
        flags: TcFlags,
    ) -> Result<(), TcError>;

    fn stats_flower(
        &self,
        filter_dev: &Arc<NetDev>,
        f: &mut FlowClsOffload,
        flags: TcFlags,
    ) -> Result<(), TcError>;

    fn configure_matchall(
        &self,
        filter_dev: &Arc<NetDev>,
        ma: &mut MatchallOffload,
    ) -> Result<(), TcError>;

    fn delete_matchall(
        &self,
        filter_dev: &Arc<NetDev>,
        ma: &mut MatchallOffload,
    ) -> Result<(), TcError>;

    /// Fill in `ma.stats`. Counters are best effort.
    fn stats_matchall(
        &self,
        filter_dev: &Arc<NetDev>,
        ma: &mut MatchallOffload,
    );

    /// Move `flows` off the encap entry's (now stale) header onto a
    /// slow path.
    fn encap_flows_del(&self, e: &EncapEntry, flows: &[Arc<TcFlow>]);

    /// Reprogram `flows` with the encap entry's current header.
    fn encap_flows_add(
        &self,
        e: &EncapEntry,
        flows: &[Arc<TcFlow>],
    ) -> Result<(), TcError>;

    /// Reinstall every offloaded rule, e.g. after the port affinity
    /// changed.
    fn reoffload_flows(&self);

    /// Bring up per-uplink classifier state.
    fn esw_init(&self) -> Result<(), TcError>;

    fn esw_cleanup(&self);
}

/// Restores conntrack state onto a packet resuming in software.
pub trait CtRestore: Send + Sync {
    fn restore(
        &self,
        skb: &mut SkBuff,
        zone_restore_id: u32,
    ) -> Result<(), TcError>;
}

/// Hands a sampled copy to the sampling subsystem.
pub trait Sampler: Send + Sync {
    fn sample(&self, skb: &SkBuff, obj: &SampleObj);
}

/// Resolves internal-port metadata to the device a packet goes to.
pub trait IntPortFwd: Send + Sync {
    /// On success `skb.dev` is the target device and the return
    /// value says whether to transmit out of it (true) or receive on
    /// it (false).
    fn dev_fwd(
        &self,
        skb: &mut SkBuff,
        metadata: u32,
    ) -> Result<bool, TcError>;
}

/// The switch services a representor is built with.
#[derive(Clone)]
pub struct EswServices {
    pub installer: Arc<dyn TcInstaller>,
    pub ct: Arc<dyn CtRestore>,
    pub sampler: Arc<dyn Sampler>,
    pub int_port: Arc<dyn IntPortFwd>,
}
