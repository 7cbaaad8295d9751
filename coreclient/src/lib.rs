// SPDX-FileCopyrightText: 2025 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Core client of the agent communication protocol.
//!
//! The [`identity::IdentityManager`] creates and loads agent identities;
//! loading yields an [`AgentRuntime`] which owns the session manager, the
//! group client and the lifecycle supervisor. Typical use:
//!
//! ```no_run
//! # async fn example() -> Result<(), acpcommon::AcpError> {
//! use acpcoreclient::identity::{IdentityManager, IdentityManagerConfig};
//! use std::sync::Arc;
//!
//! let config = IdentityManagerConfig::new("/var/lib/acp", "ca.ex.com", "ap.ex.com");
//! let manager = Arc::new(IdentityManager::new(config));
//!
//! let aid = "alice.ex.com".parse().unwrap();
//! manager.create_aid(&aid, "seed-password").await?;
//! let agent = manager.load_aid(&aid, "seed-password").await?;
//! agent.online().await?;
//! # Ok(())
//! # }
//! ```

mod channel;
pub mod descriptor;
pub mod groups;
pub mod handlers;
pub mod identity;
pub mod sessions;
pub mod store;
pub mod supervisor;

mod runtime;

pub use channel::ChannelSlot;
pub use runtime::AgentRuntime;
pub use supervisor::AgentState;

pub use acpcommon::{AcpError, ErrorCode, identifiers::Aid};
