// SPDX-FileCopyrightText: 2025 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Common data model shared by the transport and core client crates: agent
//! identifiers, the protocol error taxonomy, wire timestamps and the
//! cryptographic primitives that root an agent identity.

pub mod crypto;
pub mod errors;
pub mod identifiers;
pub mod time;

pub use errors::{AcpError, ErrorCode};
pub use identifiers::{Aid, GroupId, RequestId, SessionId};
pub use time::TimeStamp;

/// Name and version reported to the access point during sign-in.
pub const CLIENT_INFO: &str = concat!("acp-sdk-rs/", env!("CARGO_PKG_VERSION"));

pub const DEFAULT_PORT_HTTPS: u16 = 443;
pub const DEFAULT_PORT_HEARTBEAT: u16 = 9522;
