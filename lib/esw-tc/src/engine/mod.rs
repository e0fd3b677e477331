// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! The representor offload engine.
//!
//! * [`dispatch`]: classifier and flow-table callbacks bound on the
//!   representor itself.
//! * [`indr`]: indirect block bindings on foreign devices and the
//!   standalone action paths.
//! * [`encap`] and [`neigh`]: encap entries bound to neighbor entries,
//!   and the reprogramming done when a neighbor changes.
//! * [`restore`]: rebuilding software state for packets the switch
//!   hands back mid-pipeline.
//! * [`rep`]: the representor and its lifecycle.

pub mod act;
pub mod block;
pub mod dispatch;
pub mod encap;
pub mod esw;
pub mod indr;
pub mod mapping;
pub mod neigh;
pub mod netdev;
pub mod rep;
pub mod restore;
pub mod skb;
pub mod tun_entropy;

