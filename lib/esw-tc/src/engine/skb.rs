// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! The receive-side packet model: the completion the hardware hands
//! back, the packet buffer whose software state gets rebuilt, and the
//! sink the packet finally goes to.

use super::netdev::NetDev;
use super::netdev::NetDevRef;
use alloc::sync::Arc;
use alloc::vec::Vec;
use bitflags::bitflags;
use core::net::IpAddr;
use esw_tc_api::TUN_OPTS_MAX;
use esw_tc_api::TunOptType;

/// Set in `ft_metadata` when the packet was decrypted by an inline
/// IPsec receive rule.
pub const IPSEC_RX_FLOW_MARKER: u32 = 1 << 31;

/// The fields of a receive completion the restore path reads.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct Cqe64 {
    /// The flow tag (`reg_c0`) lives in the low bits.
    pub sop_drop_qpn: u32,
    /// Flow-table metadata (`reg_c1`, or IPsec markers).
    pub ft_metadata: u32,
}

impl Cqe64 {
    pub fn is_ipsec_rx_flow(&self) -> bool {
        self.ft_metadata & IPSEC_RX_FLOW_MARKER != 0
    }
}

bitflags! {
    #[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
    pub struct TunnelFlags: u16 {
        /// The tunnel carried a key (VNI, GRE key).
        const KEY = 1 << 0;
        const GENEVE_OPT = 1 << 1;
        const VXLAN_OPT = 1 << 2;
        const ERSPAN_OPT = 1 << 3;
    }
}

impl TunnelFlags {
    pub fn for_opt_type(t: TunOptType) -> Self {
        match t {
            TunOptType::Geneve => Self::GENEVE_OPT,
            TunOptType::Vxlan => Self::VXLAN_OPT,
            TunOptType::Erspan => Self::ERSPAN_OPT,
        }
    }
}

/// Outer header state a decapsulated packet carries up the stack.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct IpTunnelKey {
    pub src: IpAddr,
    pub dst: IpAddr,
    pub tos: u8,
    pub ttl: u8,
    pub tp_src: u16,
    pub tp_dst: u16,
    pub tun_id: u64,
    pub tun_flags: TunnelFlags,
}

/// A metadata destination attached to a received packet.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TunDst {
    pub key: IpTunnelKey,
    pub options: heapless::Vec<u8, TUN_OPTS_MAX>,
}

/// The classifier extension: the chain software classification
/// resumes in.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct TcSkbExt {
    pub chain: u32,
}

/// A received packet.
#[derive(Debug)]
pub struct SkBuff {
    /// The device the packet is currently attributed to.
    pub dev: Arc<NetDev>,
    pub mark: u32,
    pub tun_dst: Option<TunDst>,
    pub tc_ext: Option<TcSkbExt>,
    /// Conntrack zone restored onto the packet.
    pub ct_zone: Option<u16>,
    pub data: Vec<u8>,
}

impl SkBuff {
    pub fn new(dev: Arc<NetDev>, data: Vec<u8>) -> Self {
        Self {
            dev,
            mark: 0,
            tun_dst: None,
            tc_ext: None,
            ct_zone: None,
            data,
        }
    }

    /// Attach the classifier extension, replacing any earlier one.
    pub fn ext_add_tc(&mut self, chain: u32) {
        self.tc_ext = Some(TcSkbExt { chain });
    }
}

/// Per-packet forwarding state threaded through the restore path.
///
/// If a forwarding device gets recorded, the hold on it is kept until
/// [`TcUpdatePriv::post_napi_receive`].
#[derive(Debug, Default)]
pub struct TcUpdatePriv {
    pub fwd_dev: Option<NetDevRef>,
}

impl TcUpdatePriv {
    /// Release the forwarding device taken during restore.
    pub fn post_napi_receive(&mut self) {
        self.fwd_dev = None;
    }
}

/// Where a received packet finally goes.
pub trait RxSink {
    /// Deliver to the local stack.
    fn gro_receive(&mut self, skb: SkBuff);

    /// Transmit out of the packet's current device.
    fn queue_xmit(&mut self, skb: SkBuff);

    /// Drop the packet.
    fn free_skb(&mut self, skb: SkBuff);
}
