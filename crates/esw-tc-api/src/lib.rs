// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

#![no_std]
#![deny(unreachable_patterns)]
#![deny(unused_must_use)]

#[cfg(any(feature = "std", test))]
#[macro_use]
extern crate std;

#[macro_use]
extern crate alloc;

use core::fmt;
use core::fmt::Display;
use serde::Deserialize;
use serde::Serialize;

pub mod cmd;
pub mod flow;
pub mod mac;
pub mod tunnel;

pub use cmd::*;
pub use flow::*;
pub use mac::*;
pub use tunnel::*;

/// Flow namespace an action handler is registered under.
#[derive(
    Clone, Copy, Debug, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd,
    Serialize,
)]
pub enum FlowNamespace {
    /// The embedded switch (FDB) tables, used in switchdev mode.
    Fdb,
    /// The NIC's own receive tables, used in legacy mode.
    Kernel,
}

impl Display for FlowNamespace {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match self {
            Self::Fdb => "FDB",
            Self::Kernel => "KERNEL",
        };
        write!(f, "{s}")
    }
}

/// Operating mode of the embedded switch.
#[derive(
    Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize,
)]
#[serde(rename_all = "lowercase")]
pub enum EswitchMode {
    #[default]
    Offloads,
    Legacy,
}

impl EswitchMode {
    /// The namespace standalone actions are offloaded into.
    pub fn flow_namespace(self) -> FlowNamespace {
        match self {
            Self::Offloads => FlowNamespace::Fdb,
            Self::Legacy => FlowNamespace::Kernel,
        }
    }
}
