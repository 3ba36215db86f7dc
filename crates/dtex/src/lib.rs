// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! # DTEX: distributed test-execution runtime
//!
//! The runtime substrate of a distributed test system: host controllers,
//! one main test component and any number of parallel test components
//! cooperate over a length-framed control protocol, while user traffic
//! flows through a single-threaded, readiness-driven transport multiplexer
//! speaking TCP, UDP and SCTP, with TLS/DTLS layered on demand.
//!
//! ## Architecture
//!
//! ```text
//! +--------------------------------------------------------------------+
//! |                        Test layer (external)                       |
//! +--------------------------------------------------------------------+
//! |  control::Endpoint          |  mux::TransportMux                   |
//! |  role state machine         |  listen/connect/send/close           |
//! |  control codec (framed)     |  framing, TLS/DTLS, SCTP events      |
//! +--------------------------------------------------------------------+
//! |  reactor::Reactor (epoll / poll)  |  timer::TimerRegistry          |
//! +--------------------------------------------------------------------+
//! |  pool::SocketPool  |  buffer::ByteBuffer  |  config / error        |
//! +--------------------------------------------------------------------+
//! ```
//!
//! One thread, one blocking call: [`reactor::Reactor::take_snapshot`]
//! waits for readiness or the earliest timer and dispatches handlers; the
//! mux is the canonical handler and the control endpoint is its first
//! client. Everything above the reactor is event-driven and non-blocking.
//!
//! ## Key types
//!
//! | Type | Description |
//! |------|-------------|
//! | [`reactor::Reactor`] | Readiness loop over descriptors and timers |
//! | [`timer::TimerRegistry`] | Active-timer list, guard timer, deadlines |
//! | [`mux::TransportMux`] | Socket pool + framing + security layering |
//! | [`control::Endpoint`] | Component lifecycle against the controller |
//! | [`buffer::ByteBuffer`] | Framed byte buffer with codec primitives |
//! | [`config::Options`] | Process-wide runtime parameters |

/// Byte buffer with framing and length-prefixed primitive encoding.
pub mod buffer;
/// Process-wide configuration: constants and runtime options.
pub mod config;
/// Control plane: codec and endpoint state machine.
pub mod control;
/// Error kinds and results shared across the crate.
pub mod error;
/// Socket pool with delayed connection-id reuse.
pub mod pool;
/// Single-threaded readiness reactor (epoll or poll backend).
pub mod reactor;
/// Timer registry driving the reactor's deadline.
pub mod timer;
/// Transport multiplexer over TCP/UDP/SCTP with TLS/DTLS layering.
pub mod mux;

pub use buffer::ByteBuffer;
pub use config::Options;
pub use control::{ComponentState, Endpoint, Role, TestHarness, Verdict};
pub use error::{Error, ErrorKind, Result};
pub use mux::events::{PortEvent, Proto};
pub use mux::{ConnectOutcome, SendStatus, TransportMux};
pub use pool::ConnId;
pub use reactor::Reactor;
pub use timer::{TimeoutStatus, TimerRegistry};
