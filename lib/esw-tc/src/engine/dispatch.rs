// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Classifier dispatch for blocks bound on the representor itself.
//!
//! Two callbacks are bound: the tc callback, for rules attached to
//! the representor's ingress hook, and the flow-table callback, for
//! rules pushed down by the post-offload flow table. The flow table
//! shares the switch's chain and priority space with tc, so its rules
//! are moved into a reserved chain (see [`TcRep::ft_remap`]) and then
//! take the tc path.

use super::block::BlockCbFn;
use super::block::CbId;
use super::block::CbKind;
use super::block::TcSetup;
use super::block::flow_block_cb_setup_simple;
use super::netdev::NetDev;
use super::rep::TcRep;
use alloc::sync::Arc;
use esw_tc_api::ClsCommand;
use esw_tc_api::FlowClsOffload;
use esw_tc_api::MatchallCommand;
use esw_tc_api::MatchallOffload;
use esw_tc_api::TcError;
use esw_tc_api::TcFlags;

impl TcRep {
    /// Route a flower command to the installer.
    pub(crate) fn setup_tc_cls_flower(
        &self,
        filter_dev: &Arc<NetDev>,
        f: &mut FlowClsOffload,
        flags: TcFlags,
    ) -> Result<(), TcError> {
        let installer = &self.svc.installer;

        match f.command {
            ClsCommand::Replace => {
                installer.configure_flower(filter_dev, f, flags)
            }
            ClsCommand::Destroy => {
                installer.delete_flower(filter_dev, f, flags)
            }
            ClsCommand::Stats => installer.stats_flower(filter_dev, f, flags),
            cmd => Err(TcError::NotSupported(format!("flower {cmd:?}"))),
        }
    }

    fn setup_tc_cls_matchall(
        &self,
        ma: &mut MatchallOffload,
    ) -> Result<(), TcError> {
        let installer = &self.svc.installer;

        match ma.command {
            MatchallCommand::Replace => {
                installer.configure_matchall(&self.netdev, ma)
            }
            MatchallCommand::Destroy => {
                installer.delete_matchall(&self.netdev, ma)
            }
            MatchallCommand::Stats => {
                installer.stats_matchall(&self.netdev, ma);
                Ok(())
            }
        }
    }

    /// The tc callback bound into the representor's ingress block.
    pub fn setup_tc_cb(&self, setup: TcSetup<'_>) -> Result<(), TcError> {
        let flags = TcFlags::INGRESS | TcFlags::ESW_OFFLOAD;

        if !self.netdev.is_present() {
            return Err(TcError::NotSupported(format!(
                "{} is not present",
                self.name()
            )));
        }

        match setup {
            TcSetup::ClsFlower(f) => {
                self.setup_tc_cls_flower(&self.netdev, f, flags)
            }
            TcSetup::ClsMatchall(ma) => self.setup_tc_cls_matchall(ma),
            other => Err(TcError::NotSupported(format!(
                "{} on tc block",
                other.name()
            ))),
        }
    }

    /// Build the copy of a flow-table rule that goes into the reserved
    /// chain.
    ///
    /// Flow-table rules may use any priority, but the switch only has
    /// `1..prio_range` and priority zero is not usable, so priorities
    /// are shifted up by one. Only chain 0 of the flow table is
    /// offloaded.
    pub(crate) fn ft_remap(
        &self,
        f: &FlowClsOffload,
    ) -> Result<FlowClsOffload, TcError> {
        let chains = &self.cfg.chains;

        if !chains.prios_supported {
            return Err(TcError::NotSupported(
                "chain priorities are not supported".into(),
            ));
        }

        if f.common.prio >= chains.prio_range || f.common.chain_index != 0 {
            return Err(TcError::NotSupported(format!(
                "ft rule chain {} prio {} (range {})",
                f.common.chain_index, f.common.prio, chains.prio_range
            )));
        }

        let mut tmp = f.clone();
        tmp.common.chain_index = chains.nf_ft_chain;
        tmp.common.prio += 1;
        Ok(tmp)
    }

    /// The flow-table callback bound into the representor's ft block.
    pub fn setup_ft_cb(&self, setup: TcSetup<'_>) -> Result<(), TcError> {
        let flags =
            TcFlags::INGRESS | TcFlags::ESW_OFFLOAD | TcFlags::FT_OFFLOAD;

        match setup {
            TcSetup::ClsFlower(f) => {
                let mut tmp = self.ft_remap(f)?;
                let res =
                    self.setup_tc_cls_flower(&self.netdev, &mut tmp, flags);
                f.stats = tmp.stats;
                res
            }
            other => Err(TcError::NotSupported(format!(
                "{} on ft block",
                other.name()
            ))),
        }
    }

    /// Handle a setup request on the representor itself: bind or
    /// unbind one of its callbacks into a block.
    pub fn setup_tc(&self, setup: TcSetup<'_>) -> Result<(), TcError> {
        let me = self.arc()?;

        match setup {
            TcSetup::Block(f) => {
                f.unlocked_driver_cb = true;
                let id = CbId::new(CbKind::RepTc, &me);
                let cb: BlockCbFn =
                    Arc::new(move |setup: TcSetup<'_>| me.setup_tc_cb(setup));
                flow_block_cb_setup_simple(
                    f,
                    &self.block_tc_cb_list,
                    id,
                    cb,
                    true,
                )
            }
            TcSetup::Ft(f) => {
                f.unlocked_driver_cb = true;
                let id = CbId::new(CbKind::RepFt, &me);
                let cb: BlockCbFn =
                    Arc::new(move |setup: TcSetup<'_>| me.setup_ft_cb(setup));
                flow_block_cb_setup_simple(
                    f,
                    &self.block_ft_cb_list,
                    id,
                    cb,
                    true,
                )
            }
            other => Err(TcError::NotSupported(format!(
                "{} setup on {}",
                other.name(),
                self.name()
            ))),
        }
    }
}

#[cfg(test)]
pub(crate) mod test {
    use super::*;
    use crate::cfg::EswTcCfg;
    use crate::ddi::sync::TokenLock;
    use crate::engine::encap::EncapEntry;
    use crate::engine::esw::CtRestore;
    use crate::engine::esw::EswServices;
    use crate::engine::esw::IntPortFwd;
    use crate::engine::esw::Sampler;
    use crate::engine::esw::TcFlow;
    use crate::engine::esw::TcInstaller;
    use crate::engine::netdev::NetDevKind;
    use crate::engine::netdev::NetDevTable;
    use crate::engine::rep::Rtnl;
    use crate::engine::skb::SkBuff;
    use crate::provider::PrintlnLog;
    use crate::provider::Providers;
    use alloc::boxed::Box;
    use alloc::vec::Vec;
    use esw_tc_api::MacAddr;
    use esw_tc_api::SampleObj;
    use std::sync::Mutex;

    /// Records the (chain, prio, flags) of every flower command.
    #[derive(Default)]
    pub(crate) struct Recorder {
        pub(crate) seen: Mutex<Vec<(u32, u32, TcFlags)>>,
    }

    impl TcInstaller for Recorder {
        fn configure_flower(
            &self,
            _dev: &Arc<NetDev>,
            f: &mut FlowClsOffload,
            flags: TcFlags,
        ) -> Result<(), TcError> {
            let c = &f.common;
            self.seen.lock().unwrap().push((c.chain_index, c.prio, flags));
            f.stats.pkts = 7;
            Ok(())
        }

        fn delete_flower(
            &self,
            _dev: &Arc<NetDev>,
            _f: &mut FlowClsOffload,
            _flags: TcFlags,
        ) -> Result<(), TcError> {
            Err(TcError::NotFound("no such rule".into()))
        }

        fn stats_flower(
            &self,
            _dev: &Arc<NetDev>,
            _f: &mut FlowClsOffload,
            _flags: TcFlags,
        ) -> Result<(), TcError> {
            Ok(())
        }

        fn configure_matchall(
            &self,
            _dev: &Arc<NetDev>,
            _ma: &mut MatchallOffload,
        ) -> Result<(), TcError> {
            Ok(())
        }

        fn delete_matchall(
            &self,
            _dev: &Arc<NetDev>,
            _ma: &mut MatchallOffload,
        ) -> Result<(), TcError> {
            Ok(())
        }

        fn stats_matchall(&self, _dev: &Arc<NetDev>, ma: &mut MatchallOffload) {
            ma.stats.bytes = 64;
        }

        fn encap_flows_del(&self, _e: &EncapEntry, _flows: &[Arc<TcFlow>]) {}

        fn encap_flows_add(
            &self,
            _e: &EncapEntry,
            _flows: &[Arc<TcFlow>],
        ) -> Result<(), TcError> {
            Ok(())
        }

        fn reoffload_flows(&self) {}

        fn esw_init(&self) -> Result<(), TcError> {
            Ok(())
        }

        fn esw_cleanup(&self) {}
    }

    struct Nop;

    impl CtRestore for Nop {
        fn restore(&self, _: &mut SkBuff, _: u32) -> Result<(), TcError> {
            Ok(())
        }
    }

    impl Sampler for Nop {
        fn sample(&self, _: &SkBuff, _: &SampleObj) {}
    }

    impl IntPortFwd for Nop {
        fn dev_fwd(&self, _: &mut SkBuff, _: u32) -> Result<bool, TcError> {
            Err(TcError::not_supported("nop"))
        }
    }

    pub(crate) fn new_rep(cfg: EswTcCfg) -> (Arc<TcRep>, Arc<Recorder>) {
        let devs = Arc::new(NetDevTable::new());
        let netdev = devs.register(NetDev::new(
            1,
            "pf0vf0",
            NetDevKind::Rep,
            MacAddr::from([2, 0, 0, 0, 0, 1]),
        ));
        let rec = Arc::new(Recorder::default());
        let nop = Arc::new(Nop);
        let svc = EswServices {
            installer: rec.clone(),
            ct: nop.clone(),
            sampler: nop.clone(),
            int_port: nop,
        };
        let rep = TcRep::new(
            netdev,
            cfg,
            devs,
            svc,
            Arc::new(TokenLock::new(Rtnl)),
            Providers { log: Box::new(PrintlnLog) },
        );
        (rep, rec)
    }

    #[test]
    fn ft_remap_shifts_prio_into_reserved_chain() {
        let mut cfg = EswTcCfg::default();
        cfg.chains.prio_range = 10;
        let nf_ft_chain = cfg.chains.nf_ft_chain;
        let (rep, rec) = new_rep(cfg);

        let mut f =
            FlowClsOffload::new(ClsCommand::Replace, 1).with_chain_prio(0, 5);
        rep.setup_ft_cb(TcSetup::ClsFlower(&mut f)).unwrap();

        let seen = rec.seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].0, nf_ft_chain);
        assert_eq!(seen[0].1, 6);
        assert!(seen[0].2.contains(TcFlags::FT_OFFLOAD));
        assert_eq!(f.common.chain_index, 0);
        assert_eq!(f.common.prio, 5);
        assert_eq!(f.stats.pkts, 7);
    }

    #[test]
    fn ft_remap_rejects() {
        let mut cfg = EswTcCfg::default();
        cfg.chains.prio_range = 10;
        let (rep, rec) = new_rep(cfg);

        let mut f =
            FlowClsOffload::new(ClsCommand::Replace, 1).with_chain_prio(1, 1);
        assert!(rep.setup_ft_cb(TcSetup::ClsFlower(&mut f)).is_err());

        let mut f =
            FlowClsOffload::new(ClsCommand::Replace, 1).with_chain_prio(0, 10);
        let err = rep.setup_ft_cb(TcSetup::ClsFlower(&mut f)).unwrap_err();
        assert!(err.is_not_supported());

        let mut cfg = EswTcCfg::default();
        cfg.chains.prios_supported = false;
        let (rep2, _) = new_rep(cfg);
        let mut f = FlowClsOffload::new(ClsCommand::Replace, 1);
        assert!(rep2.setup_ft_cb(TcSetup::ClsFlower(&mut f)).is_err());

        assert!(rec.seen.lock().unwrap().is_empty());
    }

    #[test]
    fn tc_cb_requires_present_device() {
        let (rep, rec) = new_rep(EswTcCfg::default());
        rep.netdev().set_present(false);
        let mut f = FlowClsOffload::new(ClsCommand::Replace, 1);
        let err = rep.setup_tc_cb(TcSetup::ClsFlower(&mut f)).unwrap_err();
        assert!(err.is_not_supported());
        assert!(rec.seen.lock().unwrap().is_empty());
    }

    #[test]
    fn tc_cb_commands() {
        let (rep, rec) = new_rep(EswTcCfg::default());

        let mut f = FlowClsOffload::new(ClsCommand::Destroy, 1);
        let err = rep.setup_tc_cb(TcSetup::ClsFlower(&mut f)).unwrap_err();
        assert!(matches!(err, TcError::NotFound(_)));

        let mut f = FlowClsOffload::new(ClsCommand::TmpltCreate, 1);
        let err = rep.setup_tc_cb(TcSetup::ClsFlower(&mut f)).unwrap_err();
        assert!(err.is_not_supported());

        let mut ma = MatchallOffload::new(MatchallCommand::Stats, 2);
        rep.setup_tc_cb(TcSetup::ClsMatchall(&mut ma)).unwrap();
        assert_eq!(ma.stats.bytes, 64);

        let mut f = FlowClsOffload::new(ClsCommand::Replace, 1);
        rep.setup_tc_cb(TcSetup::ClsFlower(&mut f)).unwrap();
        let seen = rec.seen.lock().unwrap();
        assert_eq!(seen[0].2, TcFlags::INGRESS | TcFlags::ESW_OFFLOAD);
    }
}
