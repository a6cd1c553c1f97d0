// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Common error-handling support.
//!
//! The runtime distinguishes errors that are part of normal API traffic
//! (status codes) from errors that end initialization (bad configuration,
//! an OS call failing underneath us). The former travel as
//! [`abi::Status`]; the latter carry a diagnostic, because the only
//! sensible reaction is to show it to a human.

use core::fmt;

use abi::Status;

/// Result alias used throughout the crate.
pub type Result<T> = core::result::Result<T, Error>;

#[derive(Clone, Debug, PartialEq)]
pub enum Error {
    /// One of the closed set of API status codes.
    Code(Status),
    /// Fatal configuration problem found during initialization. Not
    /// recoverable; the diagnostic names the offending key or value.
    Config(String),
    /// An OS call failed during initialization.
    Env {
        /// Which call, e.g. `"mmap"`.
        op: &'static str,
        errno: i32,
    },
}

impl Error {
    /// Collapses this error to its API status code. Configuration and
    /// environment errors only occur during initialization and have no
    /// dedicated code, so they report as the nearest thing.
    pub fn status(&self) -> Status {
        match self {
            Error::Code(s) => *s,
            Error::Config(_) => Status::InvalidParameter,
            Error::Env { .. } => Status::Unknown,
        }
    }

    /// The negative code for this error, for callers bridging to the
    /// language-neutral surface.
    pub fn code(&self) -> i32 {
        self.status().code()
    }

    pub(crate) fn last_os(op: &'static str) -> Self {
        Error::Env {
            op,
            errno: std::io::Error::last_os_error().raw_os_error().unwrap_or(0),
        }
    }
}

impl From<Status> for Error {
    fn from(s: Status) -> Self {
        Error::Code(s)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Code(s) => write!(f, "{s}"),
            Error::Config(msg) => write!(f, "configuration error: {msg}"),
            Error::Env { op, errno } => {
                write!(f, "{op} failed: {}", std::io::Error::from_raw_os_error(*errno))
            }
        }
    }
}

impl std::error::Error for Error {}
