// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Traffic-control offload glue for an embedded-switch port
//! representor.
//!
//! A representor is the host-side network device standing in for one
//! port of the NIC's embedded switch. This crate sits between the
//! host's traffic-control subsystem and the switch: it accepts
//! classifier commands bound to the representor (or, indirectly, to
//! tunnel, VLAN, macvlan and virtual-switch devices stacked on it),
//! keeps encapsulation entries in step with neighbor reachability,
//! and restores software packet state from the metadata the hardware
//! attaches to packets it punts back to the host.
//!
//! Everything that actually programs hardware sits behind the traits
//! in `engine::esw`. The engine and its locks are built on the host
//! threading primitives and need the `std` feature; without it only
//! the configuration and log provider types are available.

#![cfg_attr(not(feature = "std"), no_std)]
#![allow(clippy::len_without_is_empty)]
#![deny(unreachable_patterns)]
#![deny(unused_must_use)]

#[cfg_attr(feature = "std", macro_use)]
extern crate alloc;

#[macro_use]
extern crate cfg_if;

pub use esw_tc_api as api;

pub mod cfg;
#[cfg(feature = "std")]
pub mod ddi;
#[cfg(feature = "std")]
pub mod dynamic;
#[cfg(feature = "std")]
pub mod engine;
#[cfg(feature = "std")]
pub mod print;
pub mod provider;
