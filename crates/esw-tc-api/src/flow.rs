// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Classifier command descriptors handed to the offload driver.

use alloc::vec::Vec;
use bitflags::bitflags;
use core::fmt;
use core::fmt::Display;
use serde::Deserialize;
use serde::Serialize;

bitflags! {
    /// Where a classifier rule is to be offloaded, and on which side
    /// of the device it was attached.
    #[derive(
        Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize,
    )]
    pub struct TcFlags: u32 {
        const INGRESS = 1 << 0;
        const EGRESS = 1 << 1;
        const NIC_OFFLOAD = 1 << 2;
        const ESW_OFFLOAD = 1 << 3;
        /// The rule came from the post-offload flow table and lives
        /// in the reserved flow-table chain.
        const FT_OFFLOAD = 1 << 4;
    }
}

/// Hardware counters for a rule or action.
#[derive(
    Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize,
)]
pub struct FlowStats {
    pub pkts: u64,
    pub bytes: u64,
    pub drops: u64,
    pub lastused: u64,
}

#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub enum ClsCommand {
    Replace,
    Destroy,
    Stats,
    TmpltCreate,
    TmpltDestroy,
}

/// Fields shared by every classifier command.
#[derive(
    Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize,
)]
pub struct ClsCommon {
    pub chain_index: u32,
    pub prio: u32,
    pub protocol: u16,
}

#[derive(
    Clone, Copy, Debug, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd,
    Serialize,
)]
pub enum FlowActionId {
    Accept,
    Drop,
    Trap,
    Goto,
    Redirect,
    Mirred,
    RedirectIngress,
    MirredIngress,
    VlanPush,
    VlanPop,
    VlanMangle,
    TunnelEncap,
    TunnelDecap,
    Mangle,
    Add,
    Csum,
    Mark,
    Ptype,
    Priority,
    Police,
    Sample,
    Ct,
    CtMetadata,
    MplsPush,
    MplsPop,
    MplsMangle,
}

impl Display for FlowActionId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

/// One entry of a rule's action list.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct FlowActionEntry {
    pub id: FlowActionId,
    /// Index of a shared (standalone) action, zero if the action is
    /// private to the rule.
    pub hw_index: u32,
}

impl FlowActionEntry {
    pub fn new(id: FlowActionId) -> Self {
        Self { id, hw_index: 0 }
    }
}

/// The match and action parts of a rule. The match is carried
/// opaquely; compiling it is the installer's business.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct FlowRule {
    pub matches: Vec<u8>,
    pub actions: Vec<FlowActionEntry>,
}

/// A flower classifier command.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct FlowClsOffload {
    pub common: ClsCommon,
    pub command: ClsCommand,
    /// Identifies the rule across replace/destroy/stats.
    pub cookie: u64,
    pub rule: FlowRule,
    pub stats: FlowStats,
}

impl FlowClsOffload {
    pub fn new(command: ClsCommand, cookie: u64) -> Self {
        Self {
            common: ClsCommon::default(),
            command,
            cookie,
            rule: FlowRule::default(),
            stats: FlowStats::default(),
        }
    }

    pub fn with_chain_prio(mut self, chain_index: u32, prio: u32) -> Self {
        self.common.chain_index = chain_index;
        self.common.prio = prio;
        self
    }
}

#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub enum MatchallCommand {
    Replace,
    Destroy,
    Stats,
}

/// A match-all classifier command.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct MatchallOffload {
    pub common: ClsCommon,
    pub command: MatchallCommand,
    pub cookie: u64,
    pub rule: FlowRule,
    pub stats: FlowStats,
}

impl MatchallOffload {
    pub fn new(command: MatchallCommand, cookie: u64) -> Self {
        Self {
            common: ClsCommon::default(),
            command,
            cookie,
            rule: FlowRule::default(),
            stats: FlowStats::default(),
        }
    }
}

#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub enum FlowActCommand {
    Replace,
    Destroy,
    Stats,
}

/// A standalone action command, not tied to any rule or device.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct FlowOffloadAction {
    pub command: FlowActCommand,
    pub id: FlowActionId,
    pub index: u32,
    pub action: Vec<FlowActionEntry>,
    pub stats: FlowStats,
}

impl FlowOffloadAction {
    pub fn new(command: FlowActCommand, id: FlowActionId, index: u32) -> Self {
        Self {
            command,
            id,
            index,
            action: vec![FlowActionEntry { id, hw_index: index }],
            stats: FlowStats::default(),
        }
    }

    pub fn has_one_action(&self) -> bool {
        self.action.len() == 1
    }
}

/// Which hook of a device a flow block is attached to.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub enum BlockBinderType {
    Unspec,
    ClsactIngress,
    ClsactEgress,
    RedEarlyDrop,
    RedMark,
}

impl Display for BlockBinderType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match self {
            Self::Unspec => "unspec",
            Self::ClsactIngress => "ingress",
            Self::ClsactEgress => "egress",
            Self::RedEarlyDrop => "red-early-drop",
            Self::RedMark => "red-mark",
        };
        write!(f, "{s}")
    }
}

#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub enum BlockCommand {
    Bind,
    Unbind,
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn offload_action_defaults_to_single_entry() {
        let act = FlowOffloadAction::new(
            FlowActCommand::Replace,
            FlowActionId::Police,
            3,
        );
        assert!(act.has_one_action());
        assert_eq!(act.action[0].hw_index, 3);
    }
}
