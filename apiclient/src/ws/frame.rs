// SPDX-FileCopyrightText: 2025 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Wire frames of the message channel. Every frame is a JSON object
//! `{cmd, data}`; `data` carries a `request_id` and a millisecond
//! `timestamp` besides the command-specific fields.

use acpcommon::{RequestId, TimeStamp};
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub mod cmd {
    pub const CREATE_SESSION_REQ: &str = "create_session_req";
    pub const CREATE_SESSION_ACK: &str = "create_session_ack";
    pub const INVITE_AGENT_REQ: &str = "invite_agent_req";
    pub const INVITE_AGENT_ACK: &str = "invite_agent_ack";
    pub const JOIN_SESSION_REQ: &str = "join_session_req";
    pub const LEAVE_SESSION_REQ: &str = "leave_session_req";
    pub const CLOSE_SESSION_REQ: &str = "close_session_req";
    pub const SESSION_MESSAGE: &str = "session_message";
    pub const GET_MEMBER_LIST_REQ: &str = "get_member_list_req";
    pub const GET_MEMBER_LIST_ACK: &str = "get_member_list_ack";
    pub const EJECT_AGENT_REQ: &str = "eject_agent_req";
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Frame {
    pub cmd: String,
    pub data: Value,
}

impl Frame {
    /// Builds a frame, stamping `request_id` and `timestamp` into `data`.
    pub fn new(cmd: &str, mut data: Value, request_id: &RequestId) -> Self {
        if let Some(object) = data.as_object_mut() {
            object.insert(
                "request_id".to_string(),
                Value::String(request_id.to_string()),
            );
            object.insert(
                "timestamp".to_string(),
                Value::Number(TimeStamp::now().as_millis().into()),
            );
        }
        Self {
            cmd: cmd.to_string(),
            data,
        }
    }

    pub fn request_id(&self) -> Option<&str> {
        self.data.get("request_id").and_then(Value::as_str)
    }

    pub fn is_ack(&self) -> bool {
        self.cmd.ends_with("_ack")
    }

    /// Numeric status code carried by ack frames; 200 when absent.
    pub fn status_code(&self) -> u16 {
        self.data
            .get("status_code")
            .and_then(Value::as_u64)
            .map(|code| code as u16)
            .unwrap_or(200)
    }
}

/// Parsed view of a `session_message` frame. `message` is the payload
/// exactly as it appeared on the wire: URL-encoded JSON blocks for P2P
/// text, raw JSON for group protocol frames.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SessionMessage {
    #[serde(default)]
    pub session_id: String,
    pub sender: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub receiver: Option<String>,
    pub message: String,
    #[serde(default)]
    pub timestamp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instruction: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
}

impl SessionMessage {
    pub fn from_frame(frame: &Frame) -> Option<Self> {
        if frame.cmd != cmd::SESSION_MESSAGE {
            return None;
        }
        serde_json::from_value(frame.data.clone()).ok()
    }

    pub fn into_frame(self) -> Frame {
        Frame {
            cmd: cmd::SESSION_MESSAGE.to_string(),
            data: serde_json::to_value(self).unwrap_or_default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_stamps_request_id_and_timestamp() {
        let request_id = RequestId::random();
        let frame = Frame::new(
            cmd::CREATE_SESSION_REQ,
            serde_json::json!({ "type": "public" }),
            &request_id,
        );
        assert_eq!(frame.request_id(), Some(request_id.as_str()));
        assert!(frame.data.get("timestamp").unwrap().as_i64().unwrap() > 0);
        assert!(!frame.is_ack());
    }

    #[test]
    fn session_message_round_trip() {
        let message = SessionMessage {
            session_id: "s1".to_string(),
            sender: "alice.ex.com".to_string(),
            receiver: Some("bob.ex.com".to_string()),
            message: "%5B%7B%22type%22%3A%22text%22%7D%5D".to_string(),
            timestamp: 1_700_000_000_000,
            instruction: None,
            request_id: None,
        };
        let frame = message.clone().into_frame();
        assert_eq!(SessionMessage::from_frame(&frame).unwrap(), message);
    }
}
