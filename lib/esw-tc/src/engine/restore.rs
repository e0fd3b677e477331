// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Rebuild the software state of a packet that hardware punted to the
//! representor partway through classification.
//!
//! Hardware stamps two registers onto such a packet. The flow tag
//! (`reg_c0`) names a mapped object: the chain the packet missed in, a
//! sample, an internal port, or an action miss. The flow-table
//! metadata (`reg_c1`) carries the tunnel id and conntrack zone
//! restore id. Restoring means turning these back into a classifier
//! extension, conntrack state, a tunnel metadata destination, and the
//! device the packet should appear to arrive on.
//!
//! A packet whose restore fails is dropped; errors never leave this
//! path.

use super::rep::TcRep;
use super::skb::Cqe64;
use super::skb::IpTunnelKey;
use super::skb::RxSink;
use super::skb::SkBuff;
use super::skb::TcUpdatePriv;
use super::skb::TunDst;
use super::skb::TunnelFlags;
use crate::provider::LogLevel;
use core::net::IpAddr;
use esw_tc_api::DEFAULT_FLOW_TAG;
use esw_tc_api::FLOW_ID_MASK;
use esw_tc_api::MappedObject;
use esw_tc_api::SampleObj;
use esw_tc_api::TunnelAddrs;
use esw_tc_api::TunnelEncOptsKey;
use esw_tc_api::reg_c1_tunnel_id;
use esw_tc_api::reg_c1_zone_restore_id;
use esw_tc_api::split_tunnel_id;

impl TcRep {
    fn restore_debug(&self, msg: &str) {
        self.log.log(LogLevel::Debug, &format!("{}: {msg}", self.name()));
    }

    /// Attach tunnel metadata for `tunnel_id` to `skb` and move it to
    /// the tunnel device the originating filter was attached to.
    ///
    /// A zero tunnel id means the packet was not tunneled.
    pub(crate) fn restore_tunnel(
        &self,
        skb: &mut SkBuff,
        tc_priv: &mut TcUpdatePriv,
        tunnel_id: u32,
    ) -> bool {
        let (tun_id, enc_opts_id) = split_tunnel_id(tunnel_id);

        if tun_id == 0 {
            return true;
        }

        let key = match self.uplink.tunnel_mapping.find(tun_id) {
            Ok(key) => key,
            Err(_) => {
                self.restore_debug(&format!(
                    "Couldn't find tunnel for tun_id: {tun_id}, \
                     err: not found"
                ));
                return false;
            }
        };

        let mut enc_opts = TunnelEncOptsKey::default();
        if enc_opts_id != 0 {
            match self.uplink.tunnel_enc_opts_mapping.find(enc_opts_id) {
                Ok(opts) => enc_opts = opts,
                Err(_) => {
                    self.restore_debug(&format!(
                        "Couldn't find tunnel (opts) for tun_id: \
                         {enc_opts_id}, err: not found"
                    ));
                    return false;
                }
            }
        }

        let (src, dst) = match key.addrs {
            TunnelAddrs::V4 { src, dst } => {
                (IpAddr::V4(src), IpAddr::V4(dst))
            }
            TunnelAddrs::V6 { src, dst } => {
                (IpAddr::V6(src), IpAddr::V6(dst))
            }
            TunnelAddrs::Other(addr_type) => {
                self.restore_debug(&format!(
                    "Couldn't restore tunnel, unsupported addr_type: \
                     {addr_type}"
                ));
                return false;
            }
        };

        let mut tun_flags = TunnelFlags::KEY;
        if !enc_opts.is_empty() {
            tun_flags |= TunnelFlags::for_opt_type(enc_opts.dst_opt_type);
        }

        let tun_dst = TunDst {
            key: IpTunnelKey {
                src,
                dst,
                tos: key.tos,
                ttl: key.ttl,
                tp_src: key.tp_src,
                tp_dst: key.tp_dst,
                tun_id: u64::from(key.key_id),
                tun_flags,
            },
            options: enc_opts.data,
        };

        let Some(dev) = self.devs.get_held(key.filter_ifindex) else {
            self.restore_debug(&format!(
                "Couldn't find tunnel device with ifindex: {}",
                key.filter_ifindex
            ));
            return false;
        };

        // The packet now appears to arrive on the tunnel device, which
        // stays held until the packet has been handed up.
        skb.dev = dev.dev().clone();
        tc_priv.fwd_dev = Some(dev);
        skb.tun_dst = Some(tun_dst);

        true
    }

    fn restore_skb_chain(
        &self,
        skb: &mut SkBuff,
        chain: u32,
        reg_c1: u32,
        tc_priv: &mut TcUpdatePriv,
    ) -> bool {
        if chain != 0 {
            skb.ext_add_tc(chain);

            let zone_restore_id = reg_c1_zone_restore_id(reg_c1);
            if let Err(e) = self.svc.ct.restore(skb, zone_restore_id) {
                self.restore_debug(&format!(
                    "failed to restore ct zone {zone_restore_id}: {e}"
                ));
                return false;
            }
        }

        self.restore_tunnel(skb, tc_priv, reg_c1_tunnel_id(reg_c1))
    }

    fn restore_skb_sample(
        &self,
        skb: &mut SkBuff,
        sample: &SampleObj,
        tc_priv: &mut TcUpdatePriv,
    ) {
        if !self.restore_tunnel(skb, tc_priv, sample.tunnel_id) {
            self.restore_debug(&format!(
                "Failed to restore tunnel info for sampled packet, \
                 tunnel_id: {}",
                sample.tunnel_id
            ));
            return;
        }

        self.svc.sampler.sample(skb, sample);
        tc_priv.post_napi_receive();
    }

    fn restore_skb_int_port(
        &self,
        skb: &mut SkBuff,
        metadata: u32,
        tc_priv: &mut TcUpdatePriv,
        forward_tx: &mut bool,
        reg_c1: u32,
    ) -> bool {
        let tunnel_id = reg_c1_tunnel_id(reg_c1);

        // Tunnel restore moves the packet to the tunnel device; the
        // internal port forward would move it again.
        if tunnel_id != 0 {
            return self.restore_tunnel(skb, tc_priv, tunnel_id);
        }

        match self.svc.int_port.dev_fwd(skb, metadata) {
            Ok(tx) => {
                *forward_tx = tx;
                tc_priv.fwd_dev = Some(skb.dev.hold());
                true
            }

            Err(e) => {
                self.restore_debug(&format!(
                    "internal port forward of metadata {metadata}: {e}"
                ));
                false
            }
        }
    }

    /// Rebuild `skb` per the registers in `cqe` and hand it to `rx`.
    ///
    /// The packet is either delivered up the stack, transmitted from
    /// an internal port, or freed. Devices held during restore are
    /// released before this returns.
    pub fn rep_tc_receive(
        &self,
        cqe: &Cqe64,
        mut skb: SkBuff,
        rx: &mut dyn RxSink,
    ) {
        let mut tc_priv = TcUpdatePriv::default();
        let mut forward_tx = false;
        let reg_c0 = cqe.sop_drop_qpn & FLOW_ID_MASK;

        if reg_c0 != 0 && reg_c0 != DEFAULT_FLOW_TAG {
            // Clear the flow tag from the mark.
            skb.mark = 0;
            let reg_c1 = cqe.ft_metadata;

            let mapped_obj = match self.obj_pool.find(reg_c0) {
                Ok(obj) => obj,
                Err(_) => {
                    self.restore_debug(&format!(
                        "Couldn't find mapped object for reg_c0: {reg_c0}"
                    ));
                    rx.free_skb(skb);
                    return;
                }
            };

            match mapped_obj {
                MappedObject::Chain(chain) => {
                    if !self.restore_skb_chain(
                        &mut skb,
                        chain,
                        reg_c1,
                        &mut tc_priv,
                    ) && !cqe.is_ipsec_rx_flow()
                    {
                        rx.free_skb(skb);
                        return;
                    }
                }

                MappedObject::Sample(sample) => {
                    self.restore_skb_sample(&mut skb, &sample, &mut tc_priv);
                    rx.free_skb(skb);
                    return;
                }

                MappedObject::IntPortMetadata(metadata) => {
                    if !self.restore_skb_int_port(
                        &mut skb,
                        metadata,
                        &mut tc_priv,
                        &mut forward_tx,
                        reg_c1,
                    ) {
                        rx.free_skb(skb);
                        return;
                    }
                }

                MappedObject::ActMiss(cookie) => {
                    self.restore_debug(&format!(
                        "Unsupported mapped object type: act miss \
                         (cookie {cookie:#x})"
                    ));
                    rx.free_skb(skb);
                    return;
                }
            }
        }

        if forward_tx {
            rx.queue_xmit(skb);
        } else {
            rx.gro_receive(skb);
        }

        tc_priv.post_napi_receive();
    }
}
