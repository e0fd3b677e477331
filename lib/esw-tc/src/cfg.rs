// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Representor offload configuration.
//!
//! These are the device capabilities and switch parameters the
//! dispatcher consults. A driver fills them in from firmware caps;
//! tests usually start from [`EswTcCfg::default()`] and flip the one
//! knob they care about.

use esw_tc_api::EswitchMode;
use serde::Deserialize;
use serde::Serialize;

/// Highest user-visible chain index.
pub const DEFAULT_MAX_CHAIN: u32 = 3;

/// Number of user-visible priorities in a chain.
pub const DEFAULT_PRIO_RANGE: u32 = 16;

/// Flow-table offloads are steered into the chain right above the
/// user-visible range.
pub const DEFAULT_NF_FT_CHAIN: u32 = DEFAULT_MAX_CHAIN + 1;

pub const DEFAULT_MAX_NEIGH_ENTRIES: usize = 1024;

/// Chain and priority parameters of the switch's flow tables.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(default)]
pub struct ChainsCfg {
    /// Whether the device can offload rules at a non-default
    /// priority.
    pub prios_supported: bool,
    /// Priorities `1..prio_range` are usable once the flow-table
    /// offload shifts the priority up by one.
    pub prio_range: u32,
    /// Reserved chain flow-table offloads are remapped into.
    pub nf_ft_chain: u32,
}

impl Default for ChainsCfg {
    fn default() -> Self {
        Self {
            prios_supported: true,
            prio_range: DEFAULT_PRIO_RANGE,
            nf_ft_chain: DEFAULT_NF_FT_CHAIN,
        }
    }
}

#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(default)]
pub struct EswTcCfg {
    pub eswitch_mode: EswitchMode,
    pub chains: ChainsCfg,
    /// The switch can forward to internal (virtual-switch) ports.
    pub int_port_supported: bool,
    /// Firmware computes tunnel source-port entropy by default.
    pub tun_entropy_enabled: bool,
    /// Upper bound on neighbor entries; creating one more fails with
    /// a resource-exhausted error.
    pub max_neigh_entries: usize,
}

impl Default for EswTcCfg {
    fn default() -> Self {
        Self {
            eswitch_mode: EswitchMode::default(),
            chains: ChainsCfg::default(),
            int_port_supported: false,
            tun_entropy_enabled: true,
            max_neigh_entries: DEFAULT_MAX_NEIGH_ENTRIES,
        }
    }
}

#[cfg(feature = "std")]
impl EswTcCfg {
    /// Parse a TOML document. Missing keys take their default value.
    pub fn from_toml(s: &str) -> Result<Self, esw_tc_api::TcError> {
        toml::from_str(s)
            .map_err(|e| esw_tc_api::TcError::Invalid(format!("config: {e}")))
    }
}

#[cfg(all(test, feature = "std"))]
mod test {
    use super::*;

    #[test]
    fn partial_toml() {
        let cfg = EswTcCfg::from_toml(
            r#"
            eswitch_mode = "legacy"
            int_port_supported = true

            [chains]
            prio_range = 8
            "#,
        )
        .unwrap();

        assert_eq!(cfg.eswitch_mode, EswitchMode::Legacy);
        assert!(cfg.int_port_supported);
        assert_eq!(cfg.chains.prio_range, 8);
        assert!(cfg.chains.prios_supported);
        assert_eq!(cfg.chains.nf_ft_chain, DEFAULT_NF_FT_CHAIN);
        assert_eq!(cfg.max_neigh_entries, DEFAULT_MAX_NEIGH_ENTRIES);
    }

    #[test]
    fn bad_toml() {
        let err = EswTcCfg::from_toml("eswitch_mode = \"bogus\"").unwrap_err();
        assert!(matches!(err, esw_tc_api::TcError::Invalid(_)));
    }
}
