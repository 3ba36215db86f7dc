// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Error types shared by the reactor, transport mux and control plane.
//!
//! One `ErrorKind` enumeration carries every discriminant the test layer can
//! observe through `Result` events, plus the kinds internal layers report
//! (framing violations, fatal reactor failures). OS-level failures keep the
//! original `errno` so it can be mirrored into `Result{os_errno, os_text}`
//! events without re-deriving it from a formatted string.

use std::fmt;
use std::io;

/// Stable error discriminants.
///
/// The first group is observable by the test layer in `Result` events; the
/// second group never crosses the port boundary but uses the same plumbing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    // ========================================================================
    // Port-visible kinds
    // ========================================================================
    /// Socket-level failure (create/bind/listen/connect/send/recv).
    Socket,
    /// Host name could not be resolved or is not usable.
    Hostname,
    /// Operation referred to a connection id that is not live.
    InvalidConnection,
    /// Malformed caller input (option value, duration, parameter name).
    InvalidArgument,
    /// Operation would block; partial progress may have been made.
    TemporarilyUnavailable,
    /// Requested protocol or protocol combination is not available.
    UnsupportedProtocol,
    /// Allocation failed or a resource limit was hit.
    InsufficientMemory,
    /// Catch-all for failures with no more specific kind.
    General,
    /// Pseudo-error reported in extended-events mode: operation completed.
    Available,

    // ========================================================================
    // Internal kinds
    // ========================================================================
    /// Peer violated the wire contract (bad frame, message in wrong state).
    Protocol,
    /// The reactor's blocking primitive failed; the process cannot continue.
    Fatal,
    /// Local address already in use (bind/listen).
    AddressInUse,
}

impl ErrorKind {
    /// Short stable name, used in logs and `Result` event rendering.
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::Socket => "socket error",
            ErrorKind::Hostname => "hostname error",
            ErrorKind::InvalidConnection => "invalid connection",
            ErrorKind::InvalidArgument => "invalid input parameter",
            ErrorKind::TemporarilyUnavailable => "temporarily unavailable",
            ErrorKind::UnsupportedProtocol => "unsupported protocol",
            ErrorKind::InsufficientMemory => "insufficient memory",
            ErrorKind::General => "general error",
            ErrorKind::Available => "available",
            ErrorKind::Protocol => "protocol error",
            ErrorKind::Fatal => "fatal error",
            ErrorKind::AddressInUse => "address already in use",
        }
    }
}

/// Error value carried on every fallible path of the crate.
#[derive(Debug, Clone)]
pub struct Error {
    kind: ErrorKind,
    message: String,
    os_errno: Option<i32>,
}

impl Error {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            os_errno: None,
        }
    }

    pub fn with_errno(kind: ErrorKind, message: impl Into<String>, errno: i32) -> Self {
        Self {
            kind,
            message: message.into(),
            os_errno: Some(errno),
        }
    }

    /// Build from the calling thread's current `errno`.
    pub fn last_os(kind: ErrorKind, message: impl Into<String>) -> Self {
        let errno = io::Error::last_os_error().raw_os_error().unwrap_or(0);
        Self::with_errno(kind, message, errno)
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn os_errno(&self) -> Option<i32> {
        self.os_errno
    }

    /// Human-readable rendering of the OS errno, if one was captured.
    pub fn os_text(&self) -> Option<String> {
        self.os_errno
            .map(|e| io::Error::from_raw_os_error(e).to_string())
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.os_errno {
            Some(errno) => write!(
                f,
                "{}: {} (errno {}: {})",
                self.kind.as_str(),
                self.message,
                errno,
                io::Error::from_raw_os_error(errno)
            ),
            None => write!(f, "{}: {}", self.kind.as_str(), self.message),
        }
    }
}

impl std::error::Error for Error {}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        let kind = match e.kind() {
            io::ErrorKind::AddrInUse => ErrorKind::AddressInUse,
            io::ErrorKind::WouldBlock => ErrorKind::TemporarilyUnavailable,
            io::ErrorKind::InvalidInput => ErrorKind::InvalidArgument,
            io::ErrorKind::OutOfMemory => ErrorKind::InsufficientMemory,
            io::ErrorKind::Unsupported => ErrorKind::UnsupportedProtocol,
            _ => ErrorKind::Socket,
        };
        Self {
            kind,
            message: e.to_string(),
            os_errno: e.raw_os_error(),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_preserved() {
        let e = Error::new(ErrorKind::Hostname, "no such host");
        assert_eq!(e.kind(), ErrorKind::Hostname);
        assert!(e.os_errno().is_none());
    }

    #[test]
    fn test_errno_round_trip() {
        let e = Error::with_errno(ErrorKind::Socket, "connect failed", libc::ECONNREFUSED);
        assert_eq!(e.os_errno(), Some(libc::ECONNREFUSED));
        assert!(e.os_text().is_some());
        let rendered = format!("{}", e);
        assert!(rendered.contains("connect failed"));
    }

    #[test]
    fn test_from_io_error_maps_kinds() {
        let e: Error = io::Error::new(io::ErrorKind::AddrInUse, "bind").into();
        assert_eq!(e.kind(), ErrorKind::AddressInUse);
        let e: Error = io::Error::new(io::ErrorKind::WouldBlock, "send").into();
        assert_eq!(e.kind(), ErrorKind::TemporarilyUnavailable);
    }
}
