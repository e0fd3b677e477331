// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Tunnel entropy accounting.
//!
//! The port computes outer source-port entropy for every tunnel type
//! or for none. UDP-based encaps (VXLAN, L3 tunnels) want it on; NVGRE
//! needs it off because the GRE key is not a place the hardware may
//! write entropy into. Every attached encap entry holds a reference
//! of its reformat type so the port is never switched out from under
//! a user.

use crate::ddi::sync::KMutex;
use alloc::collections::BTreeMap;
use esw_tc_api::TcError;
use serde::Deserialize;
use serde::Serialize;

/// How an encap entry rewrites the packet.
#[derive(
    Clone, Copy, Debug, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd,
    Serialize,
)]
pub enum ReformatType {
    L2ToVxlan,
    L2ToNvgre,
    L2ToL2Tunnel,
    L2ToL3Tunnel,
}

impl ReformatType {
    fn wants_entropy(self) -> bool {
        matches!(self, Self::L2ToVxlan | Self::L2ToL3Tunnel)
    }
}

#[derive(Debug)]
struct TunEntropyState {
    /// Current port setting.
    enabled: bool,
    /// Setting to return to once no user needs it off.
    default_enabled: bool,
    num_enabling_entries: u32,
    num_disabling_entries: u32,
    refcnt: BTreeMap<ReformatType, u32>,
}

#[derive(Debug)]
pub struct TunEntropy {
    state: KMutex<TunEntropyState>,
}

impl TunEntropy {
    pub fn new(enabled: bool) -> Self {
        Self {
            state: KMutex::new(TunEntropyState {
                enabled,
                default_enabled: enabled,
                num_enabling_entries: 0,
                num_disabling_entries: 0,
                refcnt: BTreeMap::new(),
            }),
        }
    }

    /// Take a reference for an encap of `reformat_type`.
    pub fn refcount_inc(
        &self,
        reformat_type: ReformatType,
    ) -> Result<(), TcError> {
        let mut state = self.state.lock();

        if reformat_type.wants_entropy() {
            if !state.enabled {
                return Err(TcError::NotSupported(format!(
                    "tunnel entropy is disabled, cannot offload \
                     {reformat_type:?}"
                )));
            }
            state.num_enabling_entries += 1;
        } else if reformat_type == ReformatType::L2ToNvgre {
            // Only the first GRE user turns entropy off.
            if state.num_disabling_entries == 0 && state.enabled {
                if state.num_enabling_entries > 0 {
                    return Err(TcError::NotSupported(format!(
                        "{} encap(s) need tunnel entropy, cannot offload \
                         {reformat_type:?}",
                        state.num_enabling_entries
                    )));
                }
                state.enabled = false;
            }
            state.num_disabling_entries += 1;
        }

        *state.refcnt.entry(reformat_type).or_default() += 1;
        Ok(())
    }

    /// Drop a reference taken by [`Self::refcount_inc`].
    pub fn refcount_dec(&self, reformat_type: ReformatType) {
        let mut state = self.state.lock();

        match state.refcnt.get_mut(&reformat_type) {
            Some(cnt) if *cnt > 0 => *cnt -= 1,
            _ => return,
        }

        if reformat_type.wants_entropy() {
            state.num_enabling_entries -= 1;
        } else if reformat_type == ReformatType::L2ToNvgre {
            state.num_disabling_entries -= 1;
            if state.num_disabling_entries == 0 {
                state.enabled = state.default_enabled;
            }
        }
    }

    /// References currently held for `reformat_type`.
    pub fn refcount(&self, reformat_type: ReformatType) -> u32 {
        self.state.lock().refcnt.get(&reformat_type).copied().unwrap_or(0)
    }

    pub fn enabled(&self) -> bool {
        self.state.lock().enabled
    }
}
