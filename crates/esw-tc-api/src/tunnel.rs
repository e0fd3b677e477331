// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Tunnel match keys and the objects a hardware tag maps back to.
//!
//! When the switch punts a packet to software after partially
//! processing it, the completion carries two metadata registers:
//!
//! * `reg_c0`: the flow tag, an id in the mapped-object pool
//!   ([`MappedObject`]).
//! * `reg_c1`: a packed word holding a conntrack zone restore id in
//!   the low [`ZONE_ID_BITS`] and, above it, a tunnel id made of a
//!   tunnel-key id and an encap-options id.
//!
//! ```text
//!  31      31 30          19 18         8 7          0
//! +----------+--------------+------------+------------+
//! | reserved |  tun key id  | enc opts id|  zone id   |
//! +----------+--------------+------------+------------+
//! ```

use core::net::Ipv4Addr;
use core::net::Ipv6Addr;
use serde::Deserialize;
use serde::Serialize;

/// Only the low bits of the completion's flow tag carry the id.
pub const FLOW_ID_MASK: u32 = 0x00FF_FFFF;

/// The tag stamped by the default (catch-all) rule, meaning nothing
/// was classified.
pub const DEFAULT_FLOW_TAG: u32 = 0x00FF_FFFF;

pub const ZONE_ID_BITS: u32 = 8;
pub const ZONE_ID_MASK: u32 = (1 << ZONE_ID_BITS) - 1;

/// Offset of the tunnel id within `reg_c1`.
pub const TUN_OFFSET: u32 = ZONE_ID_BITS;

pub const ENC_OPTS_BITS: u32 = 11;
pub const ENC_OPTS_BITS_MASK: u32 = (1 << ENC_OPTS_BITS) - 1;
pub const TUNNEL_INFO_BITS: u32 = 12;
pub const TUNNEL_ID_BITS: u32 = TUNNEL_INFO_BITS + ENC_OPTS_BITS;
pub const TUNNEL_ID_MASK: u32 = (1 << TUNNEL_ID_BITS) - 1;

/// Largest tunnel option blob we carry.
pub const TUN_OPTS_MAX: usize = 255;

/// Extract the tunnel id from `reg_c1`.
pub const fn reg_c1_tunnel_id(reg_c1: u32) -> u32 {
    (reg_c1 >> TUN_OFFSET) & TUNNEL_ID_MASK
}

/// Extract the conntrack zone restore id from `reg_c1`.
pub const fn reg_c1_zone_restore_id(reg_c1: u32) -> u32 {
    reg_c1 & ZONE_ID_MASK
}

/// Split a tunnel id into its `(tunnel key id, encap options id)`.
pub const fn split_tunnel_id(tunnel_id: u32) -> (u32, u32) {
    (tunnel_id >> ENC_OPTS_BITS, tunnel_id & ENC_OPTS_BITS_MASK)
}

/// Build a tunnel id out of a tunnel key id and an encap options id.
pub const fn make_tunnel_id(tun_id: u32, enc_opts_id: u32) -> u32 {
    ((tun_id << ENC_OPTS_BITS) | (enc_opts_id & ENC_OPTS_BITS_MASK))
        & TUNNEL_ID_MASK
}

/// Build a `reg_c1` value out of a tunnel id and a zone restore id.
pub const fn make_reg_c1(tunnel_id: u32, zone_restore_id: u32) -> u32 {
    ((tunnel_id & TUNNEL_ID_MASK) << TUN_OFFSET)
        | (zone_restore_id & ZONE_ID_MASK)
}

/// The outer addresses of a tunnel match, tagged by address family.
#[derive(
    Clone, Copy, Debug, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd,
    Serialize,
)]
pub enum TunnelAddrs {
    V4 { src: Ipv4Addr, dst: Ipv4Addr },
    V6 { src: Ipv6Addr, dst: Ipv6Addr },
    /// Any other dissector address type, by raw value.
    Other(u16),
}

/// The tunnel (outer header) part of a rule's match, as recorded in
/// the tunnel mapping when the rule was offloaded.
#[derive(
    Clone, Copy, Debug, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd,
    Serialize,
)]
pub struct TunnelMatchKey {
    pub addrs: TunnelAddrs,
    pub tos: u8,
    pub ttl: u8,
    pub tp_src: u16,
    pub tp_dst: u16,
    pub key_id: u32,
    /// The ifindex of the tunnel device the filter was attached to.
    pub filter_ifindex: u32,
}

/// Type of the encap options blob.
#[derive(
    Clone, Copy, Debug, Default, Deserialize, Eq, Hash, Ord, PartialEq,
    PartialOrd, Serialize,
)]
pub enum TunOptType {
    #[default]
    Geneve,
    Vxlan,
    Erspan,
}

/// Encap (e.g. Geneve) options matched by a rule.
#[derive(Clone, Debug, Default, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct TunnelEncOptsKey {
    pub data: heapless::Vec<u8, TUN_OPTS_MAX>,
    pub dst_opt_type: TunOptType,
}

impl TunnelEncOptsKey {
    /// Build a key from raw option bytes.
    ///
    /// Returns `None` if `data` is longer than [`TUN_OPTS_MAX`].
    pub fn new(data: &[u8], dst_opt_type: TunOptType) -> Option<Self> {
        let data = heapless::Vec::from_slice(data).ok()?;
        Some(Self { data, dst_opt_type })
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Parameters of a sample action, recorded when it was offloaded.
#[derive(
    Clone, Copy, Debug, Default, Deserialize, Eq, Hash, Ord, PartialEq,
    PartialOrd, Serialize,
)]
pub struct SampleObj {
    pub group_id: u32,
    pub rate: u32,
    pub trunc_size: u32,
    /// Tunnel id of the sampled flow, zero when not tunneled.
    pub tunnel_id: u32,
}

/// What a flow tag (`reg_c0`) maps back to.
#[derive(
    Clone, Copy, Debug, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd,
    Serialize,
)]
pub enum MappedObject {
    /// The packet missed in hardware while in this chain; software
    /// continues from it.
    Chain(u32),
    /// The packet is a copy made by a sample action.
    Sample(SampleObj),
    /// The packet is to be forwarded to an internal port.
    IntPortMetadata(u32),
    /// The packet missed on an action of a rule, by rule cookie.
    ActMiss(u64),
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn reg_c1_layout() {
        let tunnel_id = make_tunnel_id(0x5A5, 0x3);
        let reg_c1 = make_reg_c1(tunnel_id, 0x42);
        assert_eq!(reg_c1_zone_restore_id(reg_c1), 0x42);
        assert_eq!(reg_c1_tunnel_id(reg_c1), tunnel_id);
        assert_eq!(split_tunnel_id(tunnel_id), (0x5A5, 0x3));
    }

    #[test]
    fn tunnel_id_masks_high_bits() {
        let tunnel_id = make_tunnel_id(u32::MAX, 0);
        let (tun_id, opts) = split_tunnel_id(tunnel_id);
        assert_eq!(tun_id, (1 << TUNNEL_INFO_BITS) - 1);
        assert_eq!(opts, 0);
    }

    #[test]
    fn enc_opts_too_long() {
        let long = [0u8; TUN_OPTS_MAX + 1];
        assert!(TunnelEncOptsKey::new(&long, TunOptType::Geneve).is_none());
        let key = TunnelEncOptsKey::new(&[1, 2, 3, 4], TunOptType::Geneve)
            .unwrap();
        assert_eq!(key.len(), 4);
    }
}
