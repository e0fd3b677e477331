// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Action handlers, keyed by action id and flow namespace.
//!
//! Most actions are only ever compiled as part of a rule. A few (e.g.
//! police) can also be created standalone and shared between rules by
//! index; their handlers implement the standalone operations and
//! advertise which ones through [`ActCaps`].

use crate::ddi::sync::KRwLock;
use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec::Vec;
use bitflags::bitflags;
use esw_tc_api::FlowActionEntry;
use esw_tc_api::FlowActionId;
use esw_tc_api::FlowNamespace;
use esw_tc_api::FlowOffloadAction;
use esw_tc_api::TcError;

bitflags! {
    /// The standalone operations a handler implements.
    #[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
    pub struct ActCaps: u8 {
        const OFFLOAD = 1 << 0;
        const DESTROY = 1 << 1;
        const STATS = 1 << 2;
    }
}

pub trait TcAct: Send + Sync {
    fn caps(&self) -> ActCaps;

    /// Offload `act`, one entry of `fl_act`.
    fn offload_action(
        &self,
        _fl_act: &mut FlowOffloadAction,
        act: &FlowActionEntry,
    ) -> Result<(), TcError> {
        Err(TcError::not_supported(format!("offload {}", act.id)))
    }

    fn destroy_action(
        &self,
        fl_act: &mut FlowOffloadAction,
    ) -> Result<(), TcError> {
        Err(TcError::not_supported(format!("destroy {}", fl_act.id)))
    }

    /// Fill in `fl_act.stats`.
    fn stats_action(
        &self,
        fl_act: &mut FlowOffloadAction,
    ) -> Result<(), TcError> {
        Err(TcError::not_supported(format!("stats {}", fl_act.id)))
    }
}

#[derive(Default)]
pub struct ActRegistry {
    acts: KRwLock<BTreeMap<(FlowActionId, FlowNamespace), Arc<dyn TcAct>>>,
}

impl ActRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &self,
        id: FlowActionId,
        ns: FlowNamespace,
        act: Arc<dyn TcAct>,
    ) -> Result<(), TcError> {
        let mut acts = self.acts.write();
        if acts.contains_key(&(id, ns)) {
            return Err(TcError::AlreadyExists(format!(
                "{id} action handler in {ns}"
            )));
        }
        acts.insert((id, ns), act);
        Ok(())
    }

    pub fn unregister(
        &self,
        id: FlowActionId,
        ns: FlowNamespace,
    ) -> Option<Arc<dyn TcAct>> {
        self.acts.write().remove(&(id, ns))
    }

    pub fn get(
        &self,
        id: FlowActionId,
        ns: FlowNamespace,
    ) -> Option<Arc<dyn TcAct>> {
        self.acts.read().get(&(id, ns)).cloned()
    }

    pub fn dump(&self) -> Vec<(FlowActionId, FlowNamespace, ActCaps)> {
        self.acts
            .read()
            .iter()
            .map(|((id, ns), act)| (*id, *ns, act.caps()))
            .collect()
    }
}
