// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Indirect offload: block bindings on devices the representor does
//! not own, and standalone actions.

use esw_tc_test_utils as common;

use common::*;

const VXLAN_IFINDEX: u32 = 7;

fn vxlan(t: &TestRep) -> Arc<NetDev> {
    t.add_dev(VXLAN_IFINDEX, "vxlan0", NetDevKind::Tunnel(TunnelKind::Vxlan))
}

fn ingress() -> BlockBinderType {
    BlockBinderType::ClsactIngress
}

fn egress() -> BlockBinderType {
    BlockBinderType::ClsactEgress
}

#[test]
fn bind_unbind_state_machine() {
    let t = TestRep::new(EswTcCfg::default());
    let dev = vxlan(&t);
    let block = FlowBlock::new();

    t.indr_block(&dev, &block, BlockCommand::Bind, ingress()).unwrap();
    assert!(t.rep.indr_block_priv_lookup(&dev, ingress()).is_some());
    assert_eq!(block.num_cbs(), 1);

    let err = t
        .indr_block(&dev, &block, BlockCommand::Bind, ingress())
        .unwrap_err();
    assert!(matches!(err, TcError::AlreadyExists(_)));

    t.indr_block(&dev, &block, BlockCommand::Unbind, ingress()).unwrap();
    assert!(t.rep.indr_block_priv_lookup(&dev, ingress()).is_none());
    assert_eq!(block.num_cbs(), 0);
    assert_eq!(t.rep.indr_bindings().len(), 0);

    let err = t
        .indr_block(&dev, &block, BlockCommand::Unbind, ingress())
        .unwrap_err();
    assert!(matches!(err, TcError::NotFound(_)));

    t.indr_block(&dev, &block, BlockCommand::Bind, ingress()).unwrap();
    assert_eq!(t.rep.indr_bindings().len(), 1);
}

#[test]
fn concurrent_binds_of_one_pair() {
    const THREADS: usize = 8;

    let t = TestRep::new(EswTcCfg::default());
    let dev = vxlan(&t);
    let block = FlowBlock::new();
    let barrier = std::sync::Barrier::new(THREADS);

    let results: Vec<Result<(), TcError>> = std::thread::scope(|s| {
        let handles: Vec<_> = (0..THREADS)
            .map(|_| {
                s.spawn(|| {
                    barrier.wait();
                    t.indr_block(&dev, &block, BlockCommand::Bind, ingress())
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
    for err in results.into_iter().filter_map(Result::err) {
        assert!(matches!(err, TcError::AlreadyExists(_)));
    }
    assert_eq!(t.rep.indr_bindings().len(), 1);
    assert_eq!(block.num_cbs(), 1);
}

#[test]
fn binding_does_not_keep_device_alive() {
    let t = TestRep::new(EswTcCfg::default());
    let dev = vxlan(&t);
    let block = FlowBlock::new();
    t.indr_block(&dev, &block, BlockCommand::Bind, ingress()).unwrap();

    let indr = t.rep.indr_block_priv_lookup(&dev, ingress()).unwrap();
    assert_eq!(indr.ifindex, VXLAN_IFINDEX);
    assert_eq!(indr.name, "vxlan0");
    assert!(indr.netdev().is_some());

    let weak = Arc::downgrade(&dev);
    t.devs.unregister(VXLAN_IFINDEX);
    drop(dev);
    assert!(weak.upgrade().is_none());
    assert!(indr.netdev().is_none());
    drop(indr);

    // Rules arriving after the device went away are refused.
    let mut f = FlowClsOffload::new(ClsCommand::Replace, 1);
    let err = block.call_flower(&mut f).unwrap_err();
    assert!(matches!(err, TcError::NoDevice(_)));
    assert!(t.installer.flower_calls().is_empty());

    // The binding is still released with its block.
    assert_eq!(t.rep.indr_bindings().len(), 1);
    drop(block);
    assert_eq!(t.rep.indr_bindings().len(), 0);
}

#[test]
fn rules_on_bound_device() {
    let t = TestRep::new(EswTcCfg::default());
    let dev = vxlan(&t);
    let block = FlowBlock::new();
    t.indr_block(&dev, &block, BlockCommand::Bind, ingress()).unwrap();

    let mut f =
        FlowClsOffload::new(ClsCommand::Replace, 1).with_chain_prio(0, 2);
    assert_eq!(block.call_flower(&mut f).unwrap(), 1);

    let calls = t.installer.flower_calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].filter_ifindex, VXLAN_IFINDEX);
    assert_eq!(calls[0].flags, TcFlags::INGRESS | TcFlags::ESW_OFFLOAD);
    assert_eq!((calls[0].chain, calls[0].prio), (0, 2));

    // Only flower commands go through an indirect binding.
    let mut ma = MatchallOffload::new(MatchallCommand::Replace, 2);
    assert!(block.call_matchall(&mut ma).unwrap_err().is_not_supported());

    t.rep.netdev().set_present(false);
    let mut f = FlowClsOffload::new(ClsCommand::Replace, 3);
    assert!(block.call_flower(&mut f).unwrap_err().is_not_supported());
    assert_eq!(t.installer.flower_calls().len(), 1);
}

#[test]
fn ft_rules_on_bound_device() {
    let mut cfg = EswTcCfg::default();
    cfg.chains.prio_range = 10;
    let nf_ft_chain = cfg.chains.nf_ft_chain;
    let t = TestRep::new(cfg);
    let dev = vxlan(&t);
    let block = FlowBlock::new();

    let mut bo = FlowBlockOffload::new(BlockCommand::Bind, ingress(), &block);
    t.rep.indr_setup_cb(Some(&dev), TcSetup::Ft(&mut bo)).unwrap();
    assert!(bo.unlocked_driver_cb);

    let mut f =
        FlowClsOffload::new(ClsCommand::Replace, 1).with_chain_prio(0, 5);
    block.call_flower(&mut f).unwrap();
    assert_eq!(f.stats, MOCK_STATS);

    let calls = t.installer.flower_calls();
    assert_eq!(calls[0].filter_ifindex, VXLAN_IFINDEX);
    assert_eq!((calls[0].chain, calls[0].prio), (nf_ft_chain, 6));
    assert_eq!(
        calls[0].flags,
        TcFlags::EGRESS | TcFlags::ESW_OFFLOAD | TcFlags::FT_OFFLOAD
    );

    let mut f =
        FlowClsOffload::new(ClsCommand::Replace, 2).with_chain_prio(1, 5);
    assert!(block.call_flower(&mut f).unwrap_err().is_not_supported());

    bo.command = BlockCommand::Unbind;
    t.rep.indr_setup_cb(Some(&dev), TcSetup::Ft(&mut bo)).unwrap();
    assert_eq!(block.num_cbs(), 0);
}

#[test]
fn device_eligibility() {
    let t = TestRep::new(EswTcCfg::default());
    let block = FlowBlock::new();
    let bind = |dev: &Arc<NetDev>| {
        t.indr_block(dev, &block, BlockCommand::Bind, ingress())
    };

    let gre = t.add_dev(10, "gre0", NetDevKind::Tunnel(TunnelKind::Gretap));
    bind(&gre).unwrap();

    let vlan = t.add_dev(
        11,
        "pf0vf0.100",
        NetDevKind::Vlan { real_ifindex: REP_IFINDEX },
    );
    bind(&vlan).unwrap();

    let passthru = t.add_dev(
        12,
        "macvtap0",
        NetDevKind::Macvlan {
            real_ifindex: REP_IFINDEX,
            mode: MacvlanMode::Passthru,
        },
    );
    bind(&passthru).unwrap();

    let ineligible = [
        t.add_dev(20, "eth9", NetDevKind::Other),
        t.add_dev(21, "tun9", NetDevKind::Tunnel(TunnelKind::Unsupported)),
        t.add_dev(22, "eth9.100", NetDevKind::Vlan { real_ifindex: 99 }),
        t.add_dev(
            23,
            "macvlan9",
            NetDevKind::Macvlan {
                real_ifindex: 99,
                mode: MacvlanMode::Passthru,
            },
        ),
        t.add_dev(
            24,
            "macvlan0",
            NetDevKind::Macvlan {
                real_ifindex: REP_IFINDEX,
                mode: MacvlanMode::Bridge,
            },
        ),
    ];

    for dev in &ineligible {
        let err = bind(dev).unwrap_err();
        assert!(err.is_not_supported(), "{}: {err}", dev.name);
    }

    assert_eq!(t.rep.indr_bindings().len(), 3);
    assert_eq!(block.num_cbs(), 3);
}

#[test]
fn egress_only_for_ovs_internal_port() {
    let t = TestRep::new(EswTcCfg::default());
    let dev = vxlan(&t);
    let ovs = t.add_dev(30, "br-int", NetDevKind::OvsMaster);
    let block = FlowBlock::new();

    let err =
        t.indr_block(&dev, &block, BlockCommand::Bind, egress()).unwrap_err();
    assert!(err.is_not_supported());

    let err = t
        .indr_block(&dev, &block, BlockCommand::Bind, BlockBinderType::Unspec)
        .unwrap_err();
    assert!(err.is_not_supported());

    // Internal ports need switch support in either direction.
    for binder in [ingress(), egress()] {
        let err =
            t.indr_block(&ovs, &block, BlockCommand::Bind, binder).unwrap_err();
        assert!(err.is_not_supported());
    }
    assert_eq!(block.num_cbs(), 0);

    let mut cfg = EswTcCfg::default();
    cfg.int_port_supported = true;
    let t = TestRep::new(cfg);
    let ovs = t.add_dev(30, "br-int", NetDevKind::OvsMaster);
    t.indr_block(&ovs, &block, BlockCommand::Bind, egress()).unwrap();
    t.indr_block(&ovs, &block, BlockCommand::Bind, ingress()).unwrap();
    assert_eq!(t.rep.indr_bindings().len(), 2);

    let mut f = FlowClsOffload::new(ClsCommand::Replace, 1);
    assert_eq!(block.call_flower(&mut f).unwrap(), 2);
    let flags: Vec<TcFlags> =
        t.installer.flower_calls().iter().map(|c| c.flags).collect();
    assert!(flags.contains(&(TcFlags::EGRESS | TcFlags::ESW_OFFLOAD)));
    assert!(flags.contains(&(TcFlags::INGRESS | TcFlags::ESW_OFFLOAD)));
}

#[test]
fn failed_block_registration_unlinks_binding() {
    let t = TestRep::new(EswTcCfg::default());
    let dev = vxlan(&t);

    let full = FlowBlock::with_max_cbs(0);
    let err = t
        .indr_block(&dev, &full, BlockCommand::Bind, ingress())
        .unwrap_err();
    assert!(matches!(err, TcError::ResourceExhausted(_)));
    assert!(t.rep.indr_block_priv_lookup(&dev, ingress()).is_none());
    assert_eq!(t.rep.indr_bindings().len(), 0);

    let block = FlowBlock::new();
    t.indr_block(&dev, &block, BlockCommand::Bind, ingress()).unwrap();
}

#[test]
fn freeing_block_releases_binding() {
    let t = TestRep::new(EswTcCfg::default());
    let dev = vxlan(&t);
    let block = FlowBlock::new();
    t.indr_block(&dev, &block, BlockCommand::Bind, ingress()).unwrap();
    assert_eq!(t.rep.indr_bindings().len(), 1);

    drop(block);
    assert_eq!(t.rep.indr_bindings().len(), 0);
}

#[test]
fn unregister_releases_every_binding() {
    let t = TestRep::new(EswTcCfg::default());
    let reg = IndrDevRegistry::new();
    t.rep.netdevice_event_register(&reg).unwrap();
    assert_eq!(reg.len(), 1);

    let dev = vxlan(&t);
    let gre = t.add_dev(10, "gre0", NetDevKind::Tunnel(TunnelKind::Gretap));
    let block = FlowBlock::new();
    for d in [&dev, &gre] {
        let mut bo =
            FlowBlockOffload::new(BlockCommand::Bind, ingress(), &block);
        assert_eq!(reg.setup_block(d, &mut bo, false).unwrap(), 1);
    }

    // An ineligible device is refused by every driver.
    let other = t.add_dev(20, "eth9", NetDevKind::Other);
    let mut bo = FlowBlockOffload::new(BlockCommand::Bind, ingress(), &block);
    assert!(reg.setup_block(&other, &mut bo, false).is_err());

    assert_eq!(t.rep.indr_bindings().len(), 2);
    assert_eq!(block.num_cbs(), 2);

    t.rep.netdevice_event_unregister(&reg);
    assert_eq!(reg.len(), 0);
    assert_eq!(t.rep.indr_bindings().len(), 0);
    assert_eq!(block.num_cbs(), 0);

    // A second unregister only logs.
    t.rep.netdevice_event_unregister(&reg);
}

#[test]
fn setup_types_by_device() {
    let t = TestRep::new(EswTcCfg::default());
    let dev = vxlan(&t);
    let block = FlowBlock::new();

    let mut f = FlowClsOffload::new(ClsCommand::Replace, 1);
    let err = t
        .rep
        .indr_setup_cb(Some(&dev), TcSetup::ClsFlower(&mut f))
        .unwrap_err();
    assert!(err.is_not_supported());

    let mut bo = FlowBlockOffload::new(BlockCommand::Bind, ingress(), &block);
    let err = t.rep.indr_setup_cb(None, TcSetup::Block(&mut bo)).unwrap_err();
    assert!(err.is_not_supported());

    let err = t.rep.indr_setup_cb(None, TcSetup::Act(None)).unwrap_err();
    assert!(err.is_not_supported());
}

fn police(command: FlowActCommand) -> FlowOffloadAction {
    FlowOffloadAction::new(command, FlowActionId::Police, 1)
}

fn act(t: &TestRep, fl_act: &mut FlowOffloadAction) -> Result<(), TcError> {
    t.rep.indr_setup_cb(None, TcSetup::Act(Some(fl_act)))
}

#[test]
fn standalone_action_replace() {
    let t = TestRep::new(EswTcCfg::default());
    let handler = MockAct::new(ActCaps::OFFLOAD);

    // No handler.
    assert!(act(&t, &mut police(FlowActCommand::Replace))
        .unwrap_err()
        .is_not_supported());

    t.rep
        .acts()
        .register(FlowActionId::Police, FlowNamespace::Fdb, handler.clone())
        .unwrap();
    act(&t, &mut police(FlowActCommand::Replace)).unwrap();
    assert_eq!(handler.offloads(), 1);

    // Two actions are refused whatever handlers exist.
    let mut two = police(FlowActCommand::Replace);
    two.action.push(FlowActionEntry::new(FlowActionId::Police));
    assert!(act(&t, &mut two).unwrap_err().is_not_supported());
    assert_eq!(handler.offloads(), 1);

    let reg = IndrDevRegistry::new();
    t.rep.netdevice_event_register(&reg).unwrap();
    let mut fl_act = police(FlowActCommand::Replace);
    assert_eq!(reg.setup_action(&mut fl_act).unwrap(), 1);
    t.rep.netdevice_event_unregister(&reg);
}

#[test]
fn standalone_action_needs_capability() {
    let t = TestRep::new(EswTcCfg::default());
    let acts = t.rep.acts();

    let no_offload = MockAct::new(ActCaps::STATS);
    acts.register(FlowActionId::Police, FlowNamespace::Fdb, no_offload)
        .unwrap();
    assert!(act(&t, &mut police(FlowActCommand::Replace))
        .unwrap_err()
        .is_not_supported());
    assert!(act(&t, &mut police(FlowActCommand::Destroy))
        .unwrap_err()
        .is_not_supported());

    let mut stats = police(FlowActCommand::Stats);
    act(&t, &mut stats).unwrap();
    assert_eq!(stats.stats, MOCK_STATS);

    acts.unregister(FlowActionId::Police, FlowNamespace::Fdb);
    let failing = MockAct::failing(ActCaps::OFFLOAD | ActCaps::DESTROY);
    acts.register(FlowActionId::Police, FlowNamespace::Fdb, failing.clone())
        .unwrap();
    assert!(act(&t, &mut police(FlowActCommand::Replace))
        .unwrap_err()
        .is_not_supported());
    assert_eq!(failing.offloads(), 1);

    act(&t, &mut police(FlowActCommand::Destroy)).unwrap();
    assert_eq!(failing.destroys.load(Ordering::SeqCst), 1);
}

#[test]
fn standalone_action_namespace_follows_switch_mode() {
    let mut cfg = EswTcCfg::default();
    cfg.eswitch_mode = EswitchMode::Legacy;
    let t = TestRep::new(cfg);
    let acts = t.rep.acts();

    let fdb = MockAct::new(ActCaps::OFFLOAD);
    acts.register(FlowActionId::Police, FlowNamespace::Fdb, fdb.clone())
        .unwrap();
    assert!(act(&t, &mut police(FlowActCommand::Replace))
        .unwrap_err()
        .is_not_supported());

    let kernel = MockAct::new(ActCaps::OFFLOAD);
    acts.register(FlowActionId::Police, FlowNamespace::Kernel, kernel.clone())
        .unwrap();
    act(&t, &mut police(FlowActCommand::Replace)).unwrap();
    assert_eq!(kernel.offloads(), 1);
    assert_eq!(fdb.offloads(), 0);

    let mut out = Vec::new();
    print_acts_into(&mut out, &t.rep).unwrap();
    let out = String::from_utf8(out).unwrap();
    assert!(out.contains("Police"));
    assert!(out.contains("FDB"));
    assert!(out.contains("KERNEL"));
}
