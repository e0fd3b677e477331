// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! The switch port representor and its offload lifecycle.

use super::act::ActRegistry;
use super::block::DriverBlockList;
use super::block::IndrDevRegistry;
use super::block::IndrSetupCb;
use super::block::TcSetup;
use super::esw::EswServices;
use super::indr::IndrBlockPriv;
use super::mapping::Mapping;
use super::neigh::NeighTable;
use super::netdev::NetDev;
use super::netdev::NetDevTable;
use super::tun_entropy::TunEntropy;
use crate::cfg::EswTcCfg;
use crate::ddi::sync::KMutex;
use crate::ddi::sync::TokenLock;
use crate::ddi::work::DeferredWork;
use crate::dynamic::Dynamic;
use crate::provider::LogLevel;
use crate::provider::LogProvider;
use crate::provider::Providers;
use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::sync::Weak;
use alloc::vec::Vec;
use esw_tc_api::ENC_OPTS_BITS;
use esw_tc_api::FLOW_ID_MASK;
use esw_tc_api::MappedObject;
use esw_tc_api::NotifyResult;
use esw_tc_api::TUNNEL_INFO_BITS;
use esw_tc_api::TcError;
use esw_tc_api::TunnelEncOptsKey;
use esw_tc_api::TunnelMatchKey;

/// The global reconfiguration section. Operations which reprogram
/// shared switch state take a `&Token<'_, Rtnl>`.
#[derive(Debug, Default)]
pub struct Rtnl;

/// State shared by everything offloaded through the uplink.
pub struct UplinkPriv {
    pub tun_entropy: TunEntropy,
    pub tunnel_mapping: Mapping<TunnelMatchKey>,
    pub tunnel_enc_opts_mapping: Mapping<TunnelEncOptsKey>,
    pub(crate) indr_list_lock: KMutex<()>,
    pub(crate) indr_block_priv_list: Dynamic<Vec<Arc<IndrBlockPriv>>>,
    reoffload_flows_work: KMutex<Option<DeferredWork>>,
}

impl UplinkPriv {
    fn new(cfg: &EswTcCfg) -> Self {
        Self {
            tun_entropy: TunEntropy::new(cfg.tun_entropy_enabled),
            tunnel_mapping: Mapping::new(
                "tunnel",
                (1 << TUNNEL_INFO_BITS) - 1,
            ),
            tunnel_enc_opts_mapping: Mapping::new(
                "tunnel-enc-opts",
                (1 << ENC_OPTS_BITS) - 1,
            ),
            indr_list_lock: KMutex::new(()),
            indr_block_priv_list: Dynamic::default(),
            reoffload_flows_work: KMutex::new(None),
        }
    }
}

pub struct TcRep {
    me: Weak<TcRep>,
    pub(crate) netdev: Arc<NetDev>,
    pub(crate) cfg: EswTcCfg,
    pub(crate) log: Box<dyn LogProvider>,
    pub(crate) devs: Arc<NetDevTable>,
    pub(crate) svc: EswServices,
    pub(crate) rtnl: Arc<TokenLock<Rtnl>>,
    pub(crate) uplink: UplinkPriv,
    /// Objects the flow tag (`reg_c0`) of a punted packet maps to.
    pub(crate) obj_pool: Mapping<MappedObject>,
    pub(crate) acts: ActRegistry,
    pub(crate) neigh: NeighTable,
    pub(crate) encap_tbl_lock: KMutex<()>,
    pub(crate) block_tc_cb_list: Arc<DriverBlockList>,
    pub(crate) block_ft_cb_list: Arc<DriverBlockList>,
    pub(crate) indr_block_cb_list: Arc<DriverBlockList>,
}

impl TcRep {
    pub fn new(
        netdev: Arc<NetDev>,
        cfg: EswTcCfg,
        devs: Arc<NetDevTable>,
        svc: EswServices,
        rtnl: Arc<TokenLock<Rtnl>>,
        providers: Providers,
    ) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            netdev,
            uplink: UplinkPriv::new(&cfg),
            neigh: NeighTable::new(cfg.max_neigh_entries),
            cfg,
            log: providers.log,
            devs,
            svc,
            rtnl,
            // The default flow tag is reserved for "nothing matched".
            obj_pool: Mapping::new("reg-c0-obj", FLOW_ID_MASK - 1),
            acts: ActRegistry::new(),
            encap_tbl_lock: KMutex::new(()),
            block_tc_cb_list: DriverBlockList::new(),
            block_ft_cb_list: DriverBlockList::new(),
            indr_block_cb_list: DriverBlockList::new(),
        })
    }

    pub(crate) fn arc(&self) -> Result<Arc<Self>, TcError> {
        self.me.upgrade().ok_or_else(|| {
            TcError::NoDevice(format!("{} is being torn down", self.name()))
        })
    }

    pub fn name(&self) -> &str {
        &self.netdev.name
    }

    pub fn netdev(&self) -> &Arc<NetDev> {
        &self.netdev
    }

    pub fn cfg(&self) -> &EswTcCfg {
        &self.cfg
    }

    pub fn log(&self) -> &dyn LogProvider {
        &*self.log
    }

    pub fn devs(&self) -> &Arc<NetDevTable> {
        &self.devs
    }

    pub fn rtnl(&self) -> &Arc<TokenLock<Rtnl>> {
        &self.rtnl
    }

    pub fn uplink(&self) -> &UplinkPriv {
        &self.uplink
    }

    pub fn obj_pool(&self) -> &Mapping<MappedObject> {
        &self.obj_pool
    }

    pub fn acts(&self) -> &ActRegistry {
        &self.acts
    }

    pub fn neigh(&self) -> &NeighTable {
        &self.neigh
    }

    pub fn block_tc_cb_list(&self) -> &Arc<DriverBlockList> {
        &self.block_tc_cb_list
    }

    pub fn block_ft_cb_list(&self) -> &Arc<DriverBlockList> {
        &self.block_ft_cb_list
    }

    /// Bring up the uplink's shared classifier state.
    pub fn tc_init(&self) -> Result<(), TcError> {
        self.svc.installer.esw_init()
    }

    pub fn tc_cleanup(&self) {
        self.svc.installer.esw_cleanup();
    }

    /// Start the worker which reoffloads flows after a port affinity
    /// change.
    pub fn tc_enable(&self) -> Result<(), TcError> {
        let mut work = self.uplink.reoffload_flows_work.lock();
        if work.is_some() {
            return Ok(());
        }

        let me = self.me.clone();
        let name = format!("{}-reoffload", self.name());
        *work = Some(DeferredWork::new(&name, move || {
            if let Some(rep) = me.upgrade() {
                rep.svc.installer.reoffload_flows();
            }
        })?);

        Ok(())
    }

    /// Stop the reoffload worker, dropping a pending run and waiting
    /// for one in progress.
    pub fn tc_disable(&self) {
        let work = self.uplink.reoffload_flows_work.lock().take();
        if let Some(work) = work {
            work.cancel_sync();
        }
    }

    /// The switch moved this port to another physical port. Flows
    /// are reoffloaded in the background; the event is always
    /// acknowledged.
    pub fn event_port_affinity(&self) -> NotifyResult {
        match self.uplink.reoffload_flows_work.lock().as_ref() {
            Some(work) => {
                work.queue();
            }
            None => self.log.log(
                LogLevel::Debug,
                &format!(
                    "{}: port affinity changed while offload is disabled",
                    self.name()
                ),
            ),
        }

        NotifyResult::Ok
    }

    /// Wait for a queued reoffload to finish.
    pub fn flush_reoffload(&self) {
        if let Some(work) = self.uplink.reoffload_flows_work.lock().as_ref() {
            work.flush();
        }
    }

    /// Number of completed reoffload runs, `None` while disabled.
    #[cfg(any(feature = "test-help", test))]
    pub fn reoffload_runs(&self) -> Option<u64> {
        self.uplink.reoffload_flows_work.lock().as_ref().map(|w| w.runs())
    }

    fn indr_ident(&self) -> usize {
        self as *const Self as usize
    }

    /// Ask to hear about blocks bound on devices this driver does not
    /// own.
    pub fn netdevice_event_register(
        &self,
        reg: &IndrDevRegistry,
    ) -> Result<(), TcError> {
        {
            let _guard = self.uplink.indr_list_lock.lock();
            self.uplink.indr_block_priv_list.store(Vec::new());
        }

        let me: Arc<dyn IndrSetupCb> = self.arc()?;
        reg.register(self.indr_ident(), me)
    }

    /// Stop hearing about foreign devices and release every remaining
    /// indirect binding.
    pub fn netdevice_event_unregister(&self, reg: &IndrDevRegistry) {
        if let Err(e) = reg.unregister(self.indr_ident()) {
            self.log.log(
                LogLevel::Warn,
                &format!("{}: indirect unregister: {e}", self.name()),
            );
        }

        for (block, id) in self.indr_block_cb_list.drain() {
            if let Some(block) = block.upgrade() {
                // Freeing the callback unlinks its binding.
                drop(block.remove(id));
            }
        }

        let _guard = self.uplink.indr_list_lock.lock();
        self.uplink.indr_block_priv_list.store(Vec::new());
    }
}

impl IndrSetupCb for TcRep {
    fn indr_setup(
        &self,
        netdev: Option<&Arc<NetDev>>,
        setup: TcSetup<'_>,
    ) -> Result<(), TcError> {
        self.indr_setup_cb(netdev, setup)
    }
}
