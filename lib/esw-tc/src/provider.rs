// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Providers let the offload glue run in different contexts by
//! plugging in implementations of core services. Today that is only
//! logging: a driver embedding this crate routes messages to its own
//! log, while tests print them or hand them to `slog`.

use alloc::boxed::Box;
use core::fmt;
use core::fmt::Display;

/// The set of all platform-specific providers required by a
/// representor.
pub struct Providers {
    pub log: Box<dyn LogProvider>,
}

/// A logging provider provides the means to log messages to some
/// destination based on the context in which the representor is
/// running.
///
/// Logging levels are provided by [`LogLevel`]. These levels will map
/// to the underlying provider with varying degrees of success.
pub trait LogProvider: Send + Sync {
    /// Log a message at the specified level.
    fn log(&self, level: LogLevel, msg: &str);
}

#[derive(Clone, Copy, Debug, Eq, Ord, PartialEq, PartialOrd)]
pub enum LogLevel {
    /// Per-packet diagnostics, e.g. a receive-path lookup miss.
    Debug,
    Note,
    Warn,
    Error,
}

impl Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let level_s = match self {
            Self::Debug => "[DEBUG]",
            Self::Note => "[NOTE]",
            Self::Warn => "[WARN]",
            Self::Error => "[ERROR]",
        };
        write!(f, "{level_s}")
    }
}

/// Discard everything.
#[derive(Clone, Copy, Debug, Default)]
pub struct NullLog;

impl LogProvider for NullLog {
    fn log(&self, _level: LogLevel, _msg: &str) {}
}

cfg_if! {
    if #[cfg(any(feature = "std", test))] {
        #[derive(Clone, Copy)]
        pub struct PrintlnLog;

        impl LogProvider for PrintlnLog {
            fn log(&self, level: LogLevel, msg: &str) {
                println!("{level} {msg}");
            }
        }
    }
}

#[cfg(feature = "std")]
pub use slog_log::SlogLog;

#[cfg(feature = "std")]
mod slog_log {
    use super::LogLevel;
    use super::LogProvider;

    /// Forward messages to a [`slog::Logger`].
    #[derive(Clone)]
    pub struct SlogLog {
        log: slog::Logger,
    }

    impl SlogLog {
        pub fn new(log: slog::Logger) -> Self {
            Self { log }
        }
    }

    impl LogProvider for SlogLog {
        fn log(&self, level: LogLevel, msg: &str) {
            match level {
                LogLevel::Debug => slog::debug!(self.log, "{msg}"),
                LogLevel::Note => slog::info!(self.log, "{msg}"),
                LogLevel::Warn => slog::warn!(self.log, "{msg}"),
                LogLevel::Error => slog::error!(self.log, "{msg}"),
            }
        }
    }
}
