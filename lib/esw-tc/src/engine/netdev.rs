// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Network devices as seen by the offload glue.
//!
//! Only the properties the eligibility checks and the receive path
//! consult are modeled: what kind of device it is, which device a
//! stacked device sits on, its hardware address, whether it is
//! present, and a hold count.

use crate::ddi::sync::KMutex;
use crate::ddi::sync::KRwLock;
use alloc::collections::BTreeMap;
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt;
use core::ops::Deref;
use core::sync::atomic::AtomicBool;
use core::sync::atomic::AtomicU32;
use core::sync::atomic::Ordering;
use esw_tc_api::MacAddr;
use serde::Deserialize;
use serde::Serialize;

#[derive(
    Clone, Copy, Debug, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd,
    Serialize,
)]
pub enum TunnelKind {
    Vxlan,
    Geneve,
    Gretap,
    Ip6Gretap,
    BareUdp,
    Mplsoudp,
    /// Some other tunnel type the switch cannot terminate.
    Unsupported,
}

impl TunnelKind {
    /// Can the switch decapsulate this tunnel type?
    pub fn offloadable(self) -> bool {
        !matches!(self, Self::Unsupported)
    }
}

#[derive(
    Clone, Copy, Debug, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd,
    Serialize,
)]
pub enum MacvlanMode {
    Private,
    Vepa,
    Bridge,
    Passthru,
    Source,
}

#[derive(
    Clone, Copy, Debug, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd,
    Serialize,
)]
pub enum NetDevKind {
    /// A switch port representor.
    Rep,
    Tunnel(TunnelKind),
    Vlan { real_ifindex: u32 },
    /// The internal port of a virtual switch.
    OvsMaster,
    Macvlan { real_ifindex: u32, mode: MacvlanMode },
    Other,
}

impl fmt::Display for NetDevKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Rep => write!(f, "rep"),
            Self::Tunnel(k) => write!(f, "tunnel({k:?})"),
            Self::Vlan { real_ifindex } => write!(f, "vlan@{real_ifindex}"),
            Self::OvsMaster => write!(f, "ovs-master"),
            Self::Macvlan { real_ifindex, mode } => {
                write!(f, "macvlan@{real_ifindex}({mode:?})")
            }
            Self::Other => write!(f, "other"),
        }
    }
}

pub struct NetDev {
    pub ifindex: u32,
    pub name: String,
    pub kind: NetDevKind,
    dev_addr: KMutex<MacAddr>,
    present: AtomicBool,
    holds: AtomicU32,
}

impl fmt::Debug for NetDev {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NetDev")
            .field("ifindex", &self.ifindex)
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("present", &self.is_present())
            .field("holds", &self.holds())
            .finish()
    }
}

impl NetDev {
    pub fn new(
        ifindex: u32,
        name: &str,
        kind: NetDevKind,
        dev_addr: MacAddr,
    ) -> Self {
        Self {
            ifindex,
            name: name.into(),
            kind,
            dev_addr: KMutex::new(dev_addr),
            present: AtomicBool::new(true),
            holds: AtomicU32::new(0),
        }
    }

    pub fn dev_addr(&self) -> MacAddr {
        *self.dev_addr.lock()
    }

    pub fn set_dev_addr(&self, addr: MacAddr) {
        *self.dev_addr.lock() = addr;
    }

    /// A device which is registered but detached (e.g. during a
    /// reset) is not present and accepts no offload commands.
    pub fn is_present(&self) -> bool {
        self.present.load(Ordering::Acquire)
    }

    pub fn set_present(&self, present: bool) {
        self.present.store(present, Ordering::Release);
    }

    /// Outstanding [`NetDevRef`]s.
    pub fn holds(&self) -> u32 {
        self.holds.load(Ordering::Acquire)
    }

    /// Take a counted reference on the device.
    pub fn hold(self: &Arc<Self>) -> NetDevRef {
        self.holds.fetch_add(1, Ordering::AcqRel);
        NetDevRef { dev: Arc::clone(self) }
    }

    /// The device a VLAN or macvlan sits on.
    pub fn real_ifindex(&self) -> Option<u32> {
        match self.kind {
            NetDevKind::Vlan { real_ifindex } => Some(real_ifindex),
            NetDevKind::Macvlan { real_ifindex, .. } => Some(real_ifindex),
            _ => None,
        }
    }

    pub fn is_vlan(&self) -> bool {
        matches!(self.kind, NetDevKind::Vlan { .. })
    }

    pub fn is_macvlan(&self) -> bool {
        matches!(self.kind, NetDevKind::Macvlan { .. })
    }

    pub fn is_ovs_master(&self) -> bool {
        matches!(self.kind, NetDevKind::OvsMaster)
    }

    /// Is this a tunnel device the switch can decapsulate for?
    pub fn tun_device_to_offload(&self) -> bool {
        matches!(self.kind, NetDevKind::Tunnel(k) if k.offloadable())
    }
}

/// A held device reference. The hold is released on drop.
pub struct NetDevRef {
    dev: Arc<NetDev>,
}

impl NetDevRef {
    pub fn dev(&self) -> &Arc<NetDev> {
        &self.dev
    }
}

impl Clone for NetDevRef {
    fn clone(&self) -> Self {
        self.dev.hold()
    }
}

impl Deref for NetDevRef {
    type Target = NetDev;

    fn deref(&self) -> &NetDev {
        &self.dev
    }
}

impl fmt::Debug for NetDevRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NetDevRef({}:{})", self.dev.ifindex, self.dev.name)
    }
}

impl Drop for NetDevRef {
    fn drop(&mut self) {
        self.dev.holds.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Devices by ifindex.
#[derive(Default)]
pub struct NetDevTable {
    devs: KRwLock<BTreeMap<u32, Arc<NetDev>>>,
}

impl NetDevTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `dev`, replacing any device with the same ifindex.
    pub fn register(&self, dev: NetDev) -> Arc<NetDev> {
        let dev = Arc::new(dev);
        self.devs.write().insert(dev.ifindex, Arc::clone(&dev));
        dev
    }

    pub fn unregister(&self, ifindex: u32) -> Option<Arc<NetDev>> {
        self.devs.write().remove(&ifindex)
    }

    /// Look up a device without taking a hold.
    pub fn get(&self, ifindex: u32) -> Option<Arc<NetDev>> {
        self.devs.read().get(&ifindex).cloned()
    }

    /// Look up a device and take a hold on it.
    pub fn get_held(&self, ifindex: u32) -> Option<NetDevRef> {
        self.devs.read().get(&ifindex).map(|d| d.hold())
    }

    pub fn all(&self) -> Vec<Arc<NetDev>> {
        self.devs.read().values().cloned().collect()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn hold_and_release() {
        let table = NetDevTable::new();
        let dev = table.register(NetDev::new(
            4,
            "vxlan0",
            NetDevKind::Tunnel(TunnelKind::Vxlan),
            MacAddr::ZERO,
        ));

        let held = table.get_held(4).unwrap();
        let held2 = held.clone();
        assert_eq!(dev.holds(), 2);
        drop(held);
        drop(held2);
        assert_eq!(dev.holds(), 0);
        assert!(table.get_held(5).is_none());
    }

    #[test]
    fn tunnel_offloadable() {
        let vx = NetDev::new(
            1,
            "vx",
            NetDevKind::Tunnel(TunnelKind::Vxlan),
            MacAddr::ZERO,
        );
        let ipip = NetDev::new(
            2,
            "ipip",
            NetDevKind::Tunnel(TunnelKind::Unsupported),
            MacAddr::ZERO,
        );
        assert!(vx.tun_device_to_offload());
        assert!(!ipip.tun_device_to_offload());
    }
}
