// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

use alloc::string::String;
use core::ffi::c_int;
use serde::Deserialize;
use serde::Serialize;
use thiserror::Error;

/// Errors surfaced by the offload control paths.
///
/// Every control-path failure reaches the caller as one of these. The
/// receive path never returns them; it maps a failed restore to a
/// packet drop instead.
#[derive(Clone, Debug, Deserialize, Eq, Error, PartialEq, Serialize)]
pub enum TcError {
    /// The command, device, or object kind is not handled here. Always
    /// safe to surface; callers typically fall back to software.
    #[error("not supported: {0}")]
    NotSupported(String),

    /// A lookup in a mapping, binding, or callback table missed.
    #[error("not found: {0}")]
    NotFound(String),

    /// A registration for the same key is already present.
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// An allocation or a refcount acquisition failed. Any partial
    /// state acquired by the same operation has been rolled back.
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    /// The descriptor was malformed; nothing was changed.
    #[error("invalid argument: {0}")]
    Invalid(String),

    /// The device backing the operation is gone.
    #[error("no such device: {0}")]
    NoDevice(String),
}

impl TcError {
    pub fn not_supported(msg: impl Into<String>) -> Self {
        Self::NotSupported(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    /// Convert to an errno value.
    pub fn to_errno(&self) -> c_int {
        match self {
            Self::NotSupported(_) => libc::EOPNOTSUPP,
            Self::NotFound(_) => libc::ENOENT,
            Self::AlreadyExists(_) => libc::EEXIST,
            Self::ResourceExhausted(_) => libc::ENOMEM,
            Self::Invalid(_) => libc::EINVAL,
            Self::NoDevice(_) => libc::ENODEV,
        }
    }

    pub fn is_not_supported(&self) -> bool {
        matches!(self, Self::NotSupported(_))
    }
}

/// Result of a device event notifier.
///
/// Notifiers acknowledge an event regardless of what they did with it.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum NotifyResult {
    Ok,
}
