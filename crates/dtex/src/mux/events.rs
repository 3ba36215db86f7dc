// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Events the transport mux delivers to the test layer.
//!
//! A single tagged union covers connection lifecycle, inbound messages,
//! SCTP notifications and operation results. In extended-events mode every
//! boundary operation (listen/connect/close) additionally mirrors its
//! return as a `Result` event, with `ErrorKind::Available` standing in for
//! "completed successfully".

use std::net::SocketAddr;

use crate::error::{Error, ErrorKind};
use crate::pool::ConnId;

/// Protocol of a connection, as witnessed in events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Proto {
    Udp,
    Tcp,
    /// TLS layered over TCP.
    Tls,
    Sctp,
    /// DTLS layered over UDP.
    DtlsUdp,
    /// DTLS layered over SCTP.
    DtlsSctp,
    /// Adopted local stream (control connection rendezvous).
    Unix,
}

impl Proto {
    pub fn secured(self) -> bool {
        matches!(self, Proto::Tls | Proto::DtlsUdp | Proto::DtlsSctp)
    }

    pub fn is_datagram(self) -> bool {
        matches!(self, Proto::Udp | Proto::DtlsUdp)
    }
}

/// Outcome record mirrored to the test layer.
#[derive(Debug, Clone)]
pub struct OpResult {
    pub kind: ErrorKind,
    pub conn: Option<ConnId>,
    pub os_errno: Option<i32>,
    pub os_text: Option<String>,
}

impl OpResult {
    pub fn available(conn: ConnId) -> Self {
        Self {
            kind: ErrorKind::Available,
            conn: Some(conn),
            os_errno: None,
            os_text: None,
        }
    }

    pub fn from_error(e: &Error, conn: Option<ConnId>) -> Self {
        Self {
            kind: e.kind(),
            conn,
            os_errno: e.os_errno(),
            os_text: e.os_text(),
        }
    }
}

/// Typed SCTP notification, decoded from the kernel's notification stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SctpEventKind {
    AssocChange {
        state: u16,
        error: u16,
        outbound_streams: u16,
        inbound_streams: u16,
    },
    PeerAddrChange {
        state: u32,
        error: u32,
    },
    SendFailed {
        error: u32,
    },
    RemoteError {
        error: u16,
    },
    Shutdown,
    PartialDelivery {
        indication: u32,
    },
    AdaptationIndication {
        indication: u32,
    },
    Authentication {
        indication: u32,
    },
    SenderDry,
}

/// Tagged event union delivered in arrival order, per connection.
#[derive(Debug, Clone)]
pub enum PortEvent {
    ConnectionOpened {
        conn: ConnId,
        local: Option<SocketAddr>,
        remote: Option<SocketAddr>,
        proto: Proto,
    },
    ConnectionClosed {
        conn: ConnId,
        local: Option<SocketAddr>,
        remote: Option<SocketAddr>,
        proto: Proto,
        user_tag: i64,
    },
    Receive {
        conn: ConnId,
        local: Option<SocketAddr>,
        remote: Option<SocketAddr>,
        proto: Proto,
        payload: Vec<u8>,
        user_tag: i64,
    },
    Sctp {
        conn: ConnId,
        kind: SctpEventKind,
    },
    Result(OpResult),
}
