// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Control plane: the protocol between a test component and the central
//! controller.
//!
//! [`codec`] owns the wire format (framed, tagged, length-prefixed fields);
//! [`endpoint`] owns the role state machine and the single control socket.

pub mod codec;
pub mod endpoint;

pub use codec::{MsgType, Verdict};
pub use endpoint::{ComponentState, Endpoint, NullHarness, Role, TestHarness};
