// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Common routines for integration tests.
//!
//! The switch services behind a representor are replaced by mocks
//! which record what they were asked to do and can be told to fail.

// This type of pedantry is more trouble than it's worth here.
#![allow(dead_code)]

use slog::Drain;
use std::collections::BTreeSet;
use std::sync::Mutex;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU32;

// Let's make our lives easier and pub use a bunch of stuff.
pub use esw_tc::api::*;
pub use esw_tc::cfg::EswTcCfg;
pub use esw_tc::ddi::sync::TokenLock;
pub use esw_tc::engine::act::ActCaps;
pub use esw_tc::engine::act::TcAct;
pub use esw_tc::engine::block::FlowBlock;
pub use esw_tc::engine::block::FlowBlockOffload;
pub use esw_tc::engine::block::IndrDevRegistry;
pub use esw_tc::engine::block::TcSetup;
pub use esw_tc::engine::encap::EncapEntry;
pub use esw_tc::engine::esw::CtRestore;
pub use esw_tc::engine::esw::EswServices;
pub use esw_tc::engine::esw::IntPortFwd;
pub use esw_tc::engine::esw::Sampler;
pub use esw_tc::engine::esw::TcFlow;
pub use esw_tc::engine::esw::TcInstaller;
pub use esw_tc::engine::neigh::NeighKey;
pub use esw_tc::engine::netdev::MacvlanMode;
pub use esw_tc::engine::netdev::NetDev;
pub use esw_tc::engine::netdev::NetDevKind;
pub use esw_tc::engine::netdev::NetDevTable;
pub use esw_tc::engine::netdev::TunnelKind;
pub use esw_tc::engine::rep::Rtnl;
pub use esw_tc::engine::rep::TcRep;
pub use esw_tc::engine::skb::Cqe64;
pub use esw_tc::engine::skb::IPSEC_RX_FLOW_MARKER;
pub use esw_tc::engine::skb::RxSink;
pub use esw_tc::engine::skb::SkBuff;
pub use esw_tc::engine::skb::TunnelFlags;
pub use esw_tc::engine::tun_entropy::ReformatType;
pub use esw_tc::print::print_acts_into;
pub use esw_tc::print::print_indr_bindings;
pub use esw_tc::print::print_neigh_table;
pub use esw_tc::provider::Providers;
pub use esw_tc::provider::SlogLog;
pub use std::net::IpAddr;
pub use std::net::Ipv4Addr;
pub use std::net::Ipv6Addr;
pub use std::sync::Arc;
pub use std::sync::atomic::Ordering;

pub const REP_IFINDEX: u32 = 1;
pub const REP_NAME: &str = "pf0vf0";
pub const REP_MAC: MacAddr = MacAddr::from_const([2, 0, 0, 0, 0, 1]);

/// The counters every installed rule reports.
pub const MOCK_STATS: FlowStats =
    FlowStats { pkts: 7, bytes: 700, drops: 0, lastused: 42 };

/// A terminal logger filtered by `RUST_LOG`.
pub fn test_logger() -> slog::Logger {
    let decorator = slog_term::TermDecorator::new().build();
    let drain = slog_term::FullFormat::new(decorator).build().fuse();
    let drain = slog_envlogger::new(drain).ignore_res();
    let drain = slog_async::Async::new(drain).build().fuse();
    slog::Logger::root(drain, slog::o!("unit" => "esw-tc-test"))
}

/// One flower command as seen by the installer.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct FlowerCall {
    pub filter_ifindex: u32,
    pub command: ClsCommand,
    pub chain: u32,
    pub prio: u32,
    pub flags: TcFlags,
}

/// Records installer calls. Rules are tracked by cookie so a destroy
/// of a rule never installed fails like it would in hardware.
#[derive(Debug, Default)]
pub struct MockInstaller {
    pub flower: Mutex<Vec<FlowerCall>>,
    pub installed: Mutex<BTreeSet<u64>>,
    pub encap_adds: AtomicU32,
    pub encap_dels: AtomicU32,
    pub reoffloads: AtomicU32,
    pub esw_inits: AtomicU32,
    pub esw_cleanups: AtomicU32,
    pub fail_configure: AtomicBool,
    pub fail_encap_add: AtomicBool,
}

impl MockInstaller {
    pub fn flower_calls(&self) -> Vec<FlowerCall> {
        self.flower.lock().unwrap().clone()
    }

    pub fn encap_adds(&self) -> u32 {
        self.encap_adds.load(Ordering::SeqCst)
    }

    pub fn encap_dels(&self) -> u32 {
        self.encap_dels.load(Ordering::SeqCst)
    }

    pub fn reoffloads(&self) -> u32 {
        self.reoffloads.load(Ordering::SeqCst)
    }

    fn record(
        &self,
        filter_dev: &Arc<NetDev>,
        f: &FlowClsOffload,
        flags: TcFlags,
    ) {
        self.flower.lock().unwrap().push(FlowerCall {
            filter_ifindex: filter_dev.ifindex,
            command: f.command,
            chain: f.common.chain_index,
            prio: f.common.prio,
            flags,
        });
    }
}

impl TcInstaller for MockInstaller {
    fn configure_flower(
        &self,
        filter_dev: &Arc<NetDev>,
        f: &mut FlowClsOffload,
        flags: TcFlags,
    ) -> Result<(), TcError> {
        self.record(filter_dev, f, flags);
        if self.fail_configure.load(Ordering::SeqCst) {
            return Err(TcError::ResourceExhausted("mock rule table".into()));
        }
        self.installed.lock().unwrap().insert(f.cookie);
        f.stats = MOCK_STATS;
        Ok(())
    }

    fn delete_flower(
        &self,
        filter_dev: &Arc<NetDev>,
        f: &mut FlowClsOffload,
        flags: TcFlags,
    ) -> Result<(), TcError> {
        self.record(filter_dev, f, flags);
        if self.installed.lock().unwrap().remove(&f.cookie) {
            Ok(())
        } else {
            Err(TcError::not_found(format!("rule {:#x}", f.cookie)))
        }
    }

    fn stats_flower(
        &self,
        filter_dev: &Arc<NetDev>,
        f: &mut FlowClsOffload,
        flags: TcFlags,
    ) -> Result<(), TcError> {
        self.record(filter_dev, f, flags);
        if !self.installed.lock().unwrap().contains(&f.cookie) {
            return Err(TcError::not_found(format!("rule {:#x}", f.cookie)));
        }
        f.stats = MOCK_STATS;
        Ok(())
    }

    fn configure_matchall(
        &self,
        _filter_dev: &Arc<NetDev>,
        ma: &mut MatchallOffload,
    ) -> Result<(), TcError> {
        self.installed.lock().unwrap().insert(ma.cookie);
        Ok(())
    }

    fn delete_matchall(
        &self,
        _filter_dev: &Arc<NetDev>,
        ma: &mut MatchallOffload,
    ) -> Result<(), TcError> {
        if self.installed.lock().unwrap().remove(&ma.cookie) {
            Ok(())
        } else {
            Err(TcError::not_found(format!("matchall {:#x}", ma.cookie)))
        }
    }

    fn stats_matchall(
        &self,
        _filter_dev: &Arc<NetDev>,
        ma: &mut MatchallOffload,
    ) {
        ma.stats = MOCK_STATS;
    }

    fn encap_flows_del(&self, _e: &EncapEntry, _flows: &[Arc<TcFlow>]) {
        self.encap_dels.fetch_add(1, Ordering::SeqCst);
    }

    fn encap_flows_add(
        &self,
        _e: &EncapEntry,
        _flows: &[Arc<TcFlow>],
    ) -> Result<(), TcError> {
        if self.fail_encap_add.load(Ordering::SeqCst) {
            return Err(TcError::ResourceExhausted("mock reformat".into()));
        }
        self.encap_adds.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn reoffload_flows(&self) {
        self.reoffloads.fetch_add(1, Ordering::SeqCst);
    }

    fn esw_init(&self) -> Result<(), TcError> {
        self.esw_inits.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn esw_cleanup(&self) {
        self.esw_cleanups.fetch_add(1, Ordering::SeqCst);
    }
}

/// Conntrack restore which records zones and sets the packet's zone.
#[derive(Debug, Default)]
pub struct MockCt {
    pub zones: Mutex<Vec<u32>>,
    pub fail: AtomicBool,
}

impl CtRestore for MockCt {
    fn restore(
        &self,
        skb: &mut SkBuff,
        zone_restore_id: u32,
    ) -> Result<(), TcError> {
        self.zones.lock().unwrap().push(zone_restore_id);
        if self.fail.load(Ordering::SeqCst) {
            return Err(TcError::not_found(format!(
                "zone restore id {zone_restore_id}"
            )));
        }
        skb.ct_zone = u16::try_from(zone_restore_id).ok();
        Ok(())
    }
}

/// One sampled packet.
#[derive(Clone, Debug)]
pub struct Sampled {
    pub dev_ifindex: u32,
    pub obj: SampleObj,
    pub tunneled: bool,
}

#[derive(Debug, Default)]
pub struct MockSampler {
    pub samples: Mutex<Vec<Sampled>>,
}

impl MockSampler {
    pub fn samples(&self) -> Vec<Sampled> {
        self.samples.lock().unwrap().clone()
    }
}

impl Sampler for MockSampler {
    fn sample(&self, skb: &SkBuff, obj: &SampleObj) {
        self.samples.lock().unwrap().push(Sampled {
            dev_ifindex: skb.dev.ifindex,
            obj: *obj,
            tunneled: skb.tun_dst.is_some(),
        });
    }
}

/// Resolves every metadata value to one configured device.
#[derive(Debug, Default)]
pub struct MockIntPort {
    pub target: Mutex<Option<(Arc<NetDev>, bool)>>,
    pub seen: Mutex<Vec<u32>>,
}

impl MockIntPort {
    /// Forward to `dev`, transmitting out of it if `tx`.
    pub fn set_target(&self, dev: &Arc<NetDev>, tx: bool) {
        *self.target.lock().unwrap() = Some((Arc::clone(dev), tx));
    }
}

impl IntPortFwd for MockIntPort {
    fn dev_fwd(
        &self,
        skb: &mut SkBuff,
        metadata: u32,
    ) -> Result<bool, TcError> {
        self.seen.lock().unwrap().push(metadata);
        match &*self.target.lock().unwrap() {
            Some((dev, tx)) => {
                skb.dev = Arc::clone(dev);
                Ok(*tx)
            }
            None => {
                Err(TcError::not_found(format!("int port metadata {metadata}")))
            }
        }
    }
}

/// A standalone action handler with configurable capabilities.
#[derive(Debug, Default)]
pub struct MockAct {
    pub caps: ActCaps,
    pub offload_fails: bool,
    pub offloads: AtomicU32,
    pub destroys: AtomicU32,
    pub stats: AtomicU32,
}

impl MockAct {
    pub fn new(caps: ActCaps) -> Arc<Self> {
        Arc::new(Self { caps, ..Default::default() })
    }

    pub fn failing(caps: ActCaps) -> Arc<Self> {
        Arc::new(Self { caps, offload_fails: true, ..Default::default() })
    }

    pub fn offloads(&self) -> u32 {
        self.offloads.load(Ordering::SeqCst)
    }
}

impl TcAct for MockAct {
    fn caps(&self) -> ActCaps {
        self.caps
    }

    fn offload_action(
        &self,
        _fl_act: &mut FlowOffloadAction,
        act: &FlowActionEntry,
    ) -> Result<(), TcError> {
        self.offloads.fetch_add(1, Ordering::SeqCst);
        if self.offload_fails {
            return Err(TcError::Invalid(format!("mock {}", act.id)));
        }
        Ok(())
    }

    fn destroy_action(
        &self,
        _fl_act: &mut FlowOffloadAction,
    ) -> Result<(), TcError> {
        self.destroys.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn stats_action(
        &self,
        fl_act: &mut FlowOffloadAction,
    ) -> Result<(), TcError> {
        self.stats.fetch_add(1, Ordering::SeqCst);
        fl_act.stats = MOCK_STATS;
        Ok(())
    }
}

/// Collects packets by where they ended up.
#[derive(Debug, Default)]
pub struct RecordingRxSink {
    pub received: Vec<SkBuff>,
    pub xmitted: Vec<SkBuff>,
    pub freed: Vec<SkBuff>,
}

impl RecordingRxSink {
    pub fn total(&self) -> usize {
        self.received.len() + self.xmitted.len() + self.freed.len()
    }
}

impl RxSink for RecordingRxSink {
    fn gro_receive(&mut self, skb: SkBuff) {
        self.received.push(skb);
    }

    fn queue_xmit(&mut self, skb: SkBuff) {
        self.xmitted.push(skb);
    }

    fn free_skb(&mut self, skb: SkBuff) {
        self.freed.push(skb);
    }
}

/// A representor wired to mock switch services.
pub struct TestRep {
    pub rep: Arc<TcRep>,
    pub devs: Arc<NetDevTable>,
    pub installer: Arc<MockInstaller>,
    pub ct: Arc<MockCt>,
    pub sampler: Arc<MockSampler>,
    pub int_port: Arc<MockIntPort>,
}

impl TestRep {
    pub fn new(cfg: EswTcCfg) -> Self {
        let devs = Arc::new(NetDevTable::new());
        let netdev = devs.register(NetDev::new(
            REP_IFINDEX,
            REP_NAME,
            NetDevKind::Rep,
            REP_MAC,
        ));

        let installer = Arc::new(MockInstaller::default());
        let ct = Arc::new(MockCt::default());
        let sampler = Arc::new(MockSampler::default());
        let int_port = Arc::new(MockIntPort::default());
        let svc = EswServices {
            installer: installer.clone(),
            ct: ct.clone(),
            sampler: sampler.clone(),
            int_port: int_port.clone(),
        };

        let rep = TcRep::new(
            netdev,
            cfg,
            devs.clone(),
            svc,
            Arc::new(TokenLock::new(Rtnl)),
            Providers { log: Box::new(SlogLog::new(test_logger())) },
        );

        Self { rep, devs, installer, ct, sampler, int_port }
    }

    /// Register another device next to the representor.
    pub fn add_dev(
        &self,
        ifindex: u32,
        name: &str,
        kind: NetDevKind,
    ) -> Arc<NetDev> {
        let mac = MacAddr::from([2, 0, 0, 0, 1, ifindex as u8]);
        self.devs.register(NetDev::new(ifindex, name, kind, mac))
    }

    /// A packet arriving on the representor.
    pub fn skb(&self) -> SkBuff {
        SkBuff::new(self.rep.netdev().clone(), vec![0; 64])
    }

    /// Offer a block command for `dev` through the representor's
    /// indirect callback.
    pub fn indr_block(
        &self,
        dev: &Arc<NetDev>,
        block: &Arc<FlowBlock>,
        command: BlockCommand,
        binder_type: BlockBinderType,
    ) -> Result<(), TcError> {
        let mut bo = FlowBlockOffload::new(command, binder_type, block);
        self.rep.indr_setup_cb(Some(dev), TcSetup::Block(&mut bo))
    }
}

/// The completion of a packet punted with flow tag `reg_c0` and
/// metadata `reg_c1`.
pub fn cqe(reg_c0: u32, reg_c1: u32) -> Cqe64 {
    Cqe64 { sop_drop_qpn: reg_c0, ft_metadata: reg_c1 }
}

/// A tunnel match key on IPv4 outer addresses.
pub fn v4_tunnel_key(filter_ifindex: u32) -> TunnelMatchKey {
    TunnelMatchKey {
        addrs: TunnelAddrs::V4 {
            src: Ipv4Addr::new(192, 168, 1, 1),
            dst: Ipv4Addr::new(192, 168, 1, 2),
        },
        tos: 0,
        ttl: 64,
        tp_src: 49152,
        tp_dst: 4789,
        key_id: 100,
        filter_ifindex,
    }
}

/// A tunnel match key on IPv6 outer addresses.
pub fn v6_tunnel_key(filter_ifindex: u32) -> TunnelMatchKey {
    TunnelMatchKey {
        addrs: TunnelAddrs::V6 {
            src: "fd00::1".parse().unwrap(),
            dst: "fd00::2".parse().unwrap(),
        },
        tos: 0,
        ttl: 64,
        tp_src: 49153,
        tp_dst: 6081,
        key_id: 200,
        filter_ifindex,
    }
}

/// Assert the last packet handed to `rx` was dropped, and that it is
/// the only one.
#[macro_export]
macro_rules! assert_drop {
    ($rx:expr) => {
        let rx = &$rx;
        assert_eq!(
            rx.freed.len(),
            1,
            "expected one drop, got: received {}, xmitted {}, freed {}",
            rx.received.len(),
            rx.xmitted.len(),
            rx.freed.len(),
        );
        assert!(rx.received.is_empty() && rx.xmitted.is_empty());
    };
}

/// Assert exactly one packet was delivered up the stack.
#[macro_export]
macro_rules! assert_received {
    ($rx:expr) => {
        let rx = &$rx;
        assert_eq!(
            (rx.received.len(), rx.xmitted.len(), rx.freed.len()),
            (1, 0, 0),
            "expected one received packet"
        );
    };
}
