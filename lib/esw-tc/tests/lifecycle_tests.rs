// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

use esw_tc_test_utils as common;

use common::*;

#[test]
fn init_and_cleanup_reach_installer() {
    let t = TestRep::new(EswTcCfg::default());
    t.rep.tc_init().unwrap();
    t.rep.tc_cleanup();
    assert_eq!(t.installer.esw_inits.load(Ordering::SeqCst), 1);
    assert_eq!(t.installer.esw_cleanups.load(Ordering::SeqCst), 1);
}

#[test]
fn port_affinity_reoffloads_in_background() {
    let t = TestRep::new(EswTcCfg::default());
    assert_eq!(t.rep.reoffload_runs(), None);

    t.rep.tc_enable().unwrap();
    t.rep.tc_enable().unwrap();
    assert_eq!(t.rep.reoffload_runs(), Some(0));

    assert_eq!(t.rep.event_port_affinity(), NotifyResult::Ok);
    t.rep.flush_reoffload();
    assert_eq!(t.installer.reoffloads(), 1);
    assert_eq!(t.rep.reoffload_runs(), Some(1));

    t.rep.tc_disable();
    assert_eq!(t.rep.reoffload_runs(), None);

    // Still acknowledged, nothing runs.
    assert_eq!(t.rep.event_port_affinity(), NotifyResult::Ok);
    t.rep.flush_reoffload();
    assert_eq!(t.installer.reoffloads(), 1);

    t.rep.tc_enable().unwrap();
    t.rep.event_port_affinity();
    t.rep.flush_reoffload();
    assert_eq!(t.installer.reoffloads(), 2);
}

#[test]
fn disable_without_enable() {
    let t = TestRep::new(EswTcCfg::default());
    t.rep.tc_disable();
    t.rep.flush_reoffload();
    assert_eq!(t.installer.reoffloads(), 0);
}
