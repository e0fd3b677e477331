// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Indirect offload: blocks bound on devices stacked on or steered
//! through the representor, and standalone actions.
//!
//! A binding exists per (device, hook) pair. Its block callback
//! forwards flower commands to the same installer path as the
//! representor's own callbacks, with the foreign device as the filter
//! device and the direction taken from the hook.

use super::act::ActCaps;
use super::block::BlockCb;
use super::block::BlockCbFn;
use super::block::CbId;
use super::block::CbKind;
use super::block::FlowBlockOffload;
use super::block::TcSetup;
use super::netdev::MacvlanMode;
use super::netdev::NetDev;
use super::netdev::NetDevKind;
use super::rep::TcRep;
use crate::dynamic::Snapshot;
use crate::provider::LogLevel;
use alloc::boxed::Box;
use alloc::string::String;
use alloc::sync::Arc;
use alloc::sync::Weak;
use alloc::vec::Vec;
use core::fmt;
use esw_tc_api::BlockBinderType;
use esw_tc_api::BlockCommand;
use esw_tc_api::FlowActCommand;
use esw_tc_api::FlowClsOffload;
use esw_tc_api::FlowOffloadAction;
use esw_tc_api::TcError;
use esw_tc_api::TcFlags;

/// One indirect binding.
///
/// The bound device is not owned by the binding; its identity is
/// copied out for lookups and dumps.
pub struct IndrBlockPriv {
    netdev: Weak<NetDev>,
    pub ifindex: u32,
    pub name: String,
    pub kind: NetDevKind,
    pub binder_type: BlockBinderType,
    rpriv: Weak<TcRep>,
}

impl fmt::Debug for IndrBlockPriv {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IndrBlockPriv")
            .field("netdev", &self.name)
            .field("binder_type", &self.binder_type)
            .finish()
    }
}

impl IndrBlockPriv {
    /// The bound device, while it still exists.
    pub fn netdev(&self) -> Option<Arc<NetDev>> {
        self.netdev.upgrade()
    }

    fn is_for(
        &self,
        netdev: &Arc<NetDev>,
        binder_type: BlockBinderType,
    ) -> bool {
        core::ptr::eq(self.netdev.as_ptr(), Arc::as_ptr(netdev))
            && self.binder_type == binder_type
    }

    fn filter_dev(&self) -> Result<Arc<NetDev>, TcError> {
        self.netdev().ok_or_else(|| {
            TcError::NoDevice(format!("{} binding device is gone", self.name))
        })
    }

    fn rep(&self) -> Result<Arc<TcRep>, TcError> {
        self.rpriv.upgrade().ok_or_else(|| {
            TcError::NoDevice(format!(
                "representor for {} binding is gone",
                self.name
            ))
        })
    }

    fn setup_tc_cb(&self, setup: TcSetup<'_>) -> Result<(), TcError> {
        let mut flags = TcFlags::ESW_OFFLOAD;
        flags |= if self.binder_type == BlockBinderType::ClsactEgress {
            TcFlags::EGRESS
        } else {
            TcFlags::INGRESS
        };

        match setup {
            TcSetup::ClsFlower(f) => {
                let netdev = self.filter_dev()?;
                self.rep()?.indr_offload(&netdev, f, flags)
            }
            other => Err(TcError::NotSupported(format!(
                "{} on indirect tc block",
                other.name()
            ))),
        }
    }

    fn setup_ft_cb(&self, setup: TcSetup<'_>) -> Result<(), TcError> {
        let flags =
            TcFlags::EGRESS | TcFlags::ESW_OFFLOAD | TcFlags::FT_OFFLOAD;

        match setup {
            TcSetup::ClsFlower(f) => {
                let netdev = self.filter_dev()?;
                let rep = self.rep()?;
                let mut tmp = rep.ft_remap(f)?;
                let res = rep.indr_offload(&netdev, &mut tmp, flags);
                f.stats = tmp.stats;
                res
            }
            other => Err(TcError::NotSupported(format!(
                "{} on indirect ft block",
                other.name()
            ))),
        }
    }
}

impl TcRep {
    /// The binding for `netdev` on hook `binder_type`, if any.
    pub fn indr_block_priv_lookup(
        &self,
        netdev: &Arc<NetDev>,
        binder_type: BlockBinderType,
    ) -> Option<Arc<IndrBlockPriv>> {
        self.uplink
            .indr_block_priv_list
            .load()
            .iter()
            .find(|p| p.is_for(netdev, binder_type))
            .cloned()
    }

    /// All current indirect bindings.
    pub fn indr_bindings(&self) -> Snapshot<Vec<Arc<IndrBlockPriv>>> {
        self.uplink.indr_block_priv_list.load()
    }

    /// Link a new binding, unless its (device, hook) pair is already
    /// bound.
    fn indr_block_link(
        &self,
        netdev: &Arc<NetDev>,
        indr: &Arc<IndrBlockPriv>,
    ) -> Result<(), TcError> {
        let _guard = self.uplink.indr_list_lock.lock();
        let list = &self.uplink.indr_block_priv_list;
        if list.load().iter().any(|p| p.is_for(netdev, indr.binder_type)) {
            return Err(TcError::AlreadyExists(format!(
                "{} {} binding",
                indr.name, indr.binder_type
            )));
        }

        list.update(|list| list.insert(0, Arc::clone(indr)));
        Ok(())
    }

    /// Unlink a binding. Called when its block callback is freed.
    fn indr_block_unbind(&self, indr: &IndrBlockPriv) {
        let _guard = self.uplink.indr_list_lock.lock();
        self.uplink.indr_block_priv_list.update(|list| {
            list.retain(|p| !core::ptr::eq(Arc::as_ptr(p), indr))
        });
    }

    pub(crate) fn indr_offload(
        &self,
        netdev: &Arc<NetDev>,
        f: &mut FlowClsOffload,
        flags: TcFlags,
    ) -> Result<(), TcError> {
        if !self.netdev.is_present() {
            return Err(TcError::NotSupported(format!(
                "{} is not present",
                self.name()
            )));
        }

        self.setup_tc_cls_flower(netdev, f, flags)
    }

    /// Can rules on `netdev` be offloaded through this representor?
    fn indr_dev_eligible(&self, netdev: &NetDev) -> Result<(), TcError> {
        let rep_ifindex = self.netdev.ifindex;
        let vlan_on_rep =
            netdev.is_vlan() && netdev.real_ifindex() == Some(rep_ifindex);

        if netdev.tun_device_to_offload()
            || vlan_on_rep
            || netdev.is_ovs_master()
        {
            return Ok(());
        }

        match netdev.kind {
            NetDevKind::Macvlan { real_ifindex, mode }
                if real_ifindex == rep_ifindex =>
            {
                if mode == MacvlanMode::Passthru {
                    return Ok(());
                }

                self.log.log(
                    LogLevel::Warn,
                    &format!(
                        "{}: Offloading ingress filter is supported only \
                         with macvlan passthru mode",
                        netdev.name
                    ),
                );
                Err(TcError::NotSupported(format!(
                    "{}: macvlan mode {mode:?}",
                    netdev.name
                )))
            }

            _ => Err(TcError::NotSupported(format!(
                "{} ({}) cannot be offloaded through {}",
                netdev.name,
                netdev.kind,
                self.name()
            ))),
        }
    }

    fn indr_setup_block(
        &self,
        netdev: &Arc<NetDev>,
        f: &mut FlowBlockOffload,
        kind: CbKind,
    ) -> Result<(), TcError> {
        let is_ovs_int_port = netdev.is_ovs_master();

        self.indr_dev_eligible(netdev)?;

        match f.binder_type {
            BlockBinderType::ClsactIngress => {}
            BlockBinderType::ClsactEgress if is_ovs_int_port => {}
            other => {
                return Err(TcError::NotSupported(format!(
                    "{other} binding on {}",
                    netdev.name
                )));
            }
        }

        if is_ovs_int_port && !self.cfg.int_port_supported {
            return Err(TcError::NotSupported(format!(
                "{}: internal port offload is not supported",
                netdev.name
            )));
        }

        f.unlocked_driver_cb = true;
        f.driver_block_list = Some(Arc::clone(&self.indr_block_cb_list));

        match f.command {
            BlockCommand::Bind => {
                let indr = Arc::new(IndrBlockPriv {
                    netdev: Arc::downgrade(netdev),
                    ifindex: netdev.ifindex,
                    name: netdev.name.clone(),
                    kind: netdev.kind,
                    binder_type: f.binder_type,
                    rpriv: self.arc().map(|r| Arc::downgrade(&r))?,
                });
                self.indr_block_link(netdev, &indr)?;

                let id = CbId::new(kind, &indr);
                let cb_priv = Arc::clone(&indr);
                let cb: BlockCbFn = match kind {
                    CbKind::IndrFt => Arc::new(move |setup: TcSetup<'_>| {
                        cb_priv.setup_ft_cb(setup)
                    }),
                    _ => Arc::new(move |setup: TcSetup<'_>| {
                        cb_priv.setup_tc_cb(setup)
                    }),
                };

                let rel_priv = Arc::clone(&indr);
                let release = Box::new(move || {
                    if let Ok(rep) = rel_priv.rep() {
                        rep.indr_block_unbind(&rel_priv);
                    }
                });

                if let Err(e) =
                    f.block.add(BlockCb::new(id, cb).with_release(release))
                {
                    self.indr_block_unbind(&indr);
                    return Err(e);
                }
                self.indr_block_cb_list.add(&f.block, id);
                Ok(())
            }

            BlockCommand::Unbind => {
                let Some(indr) =
                    self.indr_block_priv_lookup(netdev, f.binder_type)
                else {
                    return Err(TcError::NotFound(format!(
                        "{} {} binding",
                        netdev.name, f.binder_type
                    )));
                };

                let id = CbId::new(kind, &indr);
                let Some(block_cb) = f.block.remove(id) else {
                    return Err(TcError::NotFound(format!(
                        "{} {} block callback",
                        netdev.name, f.binder_type
                    )));
                };

                self.indr_block_cb_list.remove(&f.block, id);
                // Freeing the callback unlinks the binding.
                drop(block_cb);
                Ok(())
            }
        }
    }

    fn indr_replace_act(
        &self,
        fl_act: &mut FlowOffloadAction,
    ) -> Result<(), TcError> {
        // Undoing a partially offloaded multi-action set is not
        // supported, and nothing offloads one standalone.
        if !fl_act.has_one_action() {
            return Err(TcError::NotSupported(format!(
                "standalone offload of {} actions",
                fl_act.action.len()
            )));
        }

        let ns = self.cfg.eswitch_mode.flow_namespace();
        let actions = fl_act.action.clone();
        let mut add = false;

        for action in &actions {
            let Some(act) = self.acts.get(action.id, ns) else {
                continue;
            };

            if !act.caps().contains(ActCaps::OFFLOAD) {
                continue;
            }

            if act.offload_action(fl_act, action).is_ok() {
                add = true;
            }
        }

        if add {
            Ok(())
        } else {
            Err(TcError::NotSupported(format!(
                "no {ns} handler offloaded {}",
                fl_act.id
            )))
        }
    }

    fn indr_act_handler(
        &self,
        fl_act: &FlowOffloadAction,
        cap: ActCaps,
    ) -> Result<Arc<dyn super::act::TcAct>, TcError> {
        let ns = self.cfg.eswitch_mode.flow_namespace();
        self.acts
            .get(fl_act.id, ns)
            .filter(|act| act.caps().contains(cap))
            .ok_or_else(|| {
                TcError::NotSupported(format!(
                    "no {ns} {} handler for {cap:?}",
                    fl_act.id
                ))
            })
    }

    fn indr_setup_act(
        &self,
        fl_act: &mut FlowOffloadAction,
    ) -> Result<(), TcError> {
        match fl_act.command {
            FlowActCommand::Replace => self.indr_replace_act(fl_act),
            FlowActCommand::Destroy => self
                .indr_act_handler(fl_act, ActCaps::DESTROY)?
                .destroy_action(fl_act),
            FlowActCommand::Stats => self
                .indr_act_handler(fl_act, ActCaps::STATS)?
                .stats_action(fl_act),
        }
    }

    fn indr_no_dev_setup(&self, setup: TcSetup<'_>) -> Result<(), TcError> {
        match setup {
            TcSetup::Act(Some(fl_act)) => self.indr_setup_act(fl_act),
            TcSetup::Act(None) => {
                Err(TcError::NotSupported("action setup without data".into()))
            }
            other => Err(TcError::NotSupported(format!(
                "{} setup without a device",
                other.name()
            ))),
        }
    }

    /// The callback registered with the indirect-device registry.
    pub fn indr_setup_cb(
        &self,
        netdev: Option<&Arc<NetDev>>,
        setup: TcSetup<'_>,
    ) -> Result<(), TcError> {
        let Some(netdev) = netdev else {
            return self.indr_no_dev_setup(setup);
        };

        match setup {
            TcSetup::Block(f) => {
                self.indr_setup_block(netdev, f, CbKind::IndrTc)
            }
            TcSetup::Ft(f) => self.indr_setup_block(netdev, f, CbKind::IndrFt),
            other => Err(TcError::NotSupported(format!(
                "{} setup on {}",
                other.name(),
                netdev.name
            ))),
        }
    }
}
