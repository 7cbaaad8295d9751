// SPDX-FileCopyrightText: 2025 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Group messaging: the protocol engine layered over raw message-channel
//! frames, the typed RPC facade, the per-group store with its cursors,
//! and the incremental sync engine.

mod client;
mod ops;
mod store;

pub use client::{GroupClient, GroupRawHook};
pub use ops::{GroupUrl, parse_group_url};
pub use store::{
    AppendOutcome, CursorPosition, GroupCursor, GroupIndexEntry, GroupStore, GroupSyncOutcome,
};

use acpcommon::TimeStamp;
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GroupVisibility {
    Public,
    Private,
}

/// Server-authoritative group metadata, cached locally.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupInfo {
    pub group_id: String,
    pub name: String,
    pub visibility: GroupVisibility,
    pub creator: String,
    #[serde(default)]
    pub member_count: u64,
    #[serde(default)]
    pub join_mode: Option<String>,
    #[serde(default)]
    pub admins: Vec<String>,
    #[serde(default)]
    pub rules: Value,
    #[serde(default)]
    pub announcement: Option<String>,
    #[serde(default)]
    pub duty_policy: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupMember {
    pub agent_id: String,
    #[serde(default)]
    pub role: Option<String>,
    #[serde(default)]
    pub joined_at: Option<TimeStamp>,
}

/// A message in a group. `msg_id` is assigned by the server and is
/// strictly monotonic per group.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GroupMessage {
    pub msg_id: u64,
    pub sender: String,
    pub content: String,
    #[serde(default = "default_content_type")]
    pub content_type: String,
    pub timestamp: TimeStamp,
    #[serde(default)]
    pub metadata: Value,
}

fn default_content_type() -> String {
    "text".to_string()
}

/// A membership or administrative event; its id space is separate from
/// the message ids.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GroupEvent {
    pub event_id: u64,
    pub event_type: String,
    pub actor: String,
    #[serde(default)]
    pub target: Option<String>,
    #[serde(default)]
    pub data: Value,
    pub timestamp: TimeStamp,
}

/// Push payload carrying a contiguous slice of the group's message log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupMessageBatch {
    pub group_id: String,
    pub start_msg_id: u64,
    pub latest_msg_id: u64,
    pub count: u64,
    pub messages: Vec<GroupMessage>,
}

/// Response of the `pull_messages` RPC.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PulledMessages {
    #[serde(default)]
    pub messages: Vec<GroupMessage>,
    #[serde(default)]
    pub has_more: bool,
}

/// Response of the `pull_events` RPC.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PulledEvents {
    #[serde(default)]
    pub events: Vec<GroupEvent>,
    #[serde(default)]
    pub has_more: bool,
}
