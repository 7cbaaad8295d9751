// SPDX-FileCopyrightText: 2025 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Typed facade over the group RPC transport. Each method validates its
//! inputs, formats the params object and surfaces server errors
//! verbatim.

use acpcommon::{
    AcpError, ErrorCode,
    identifiers::{Aid, GroupId},
};
use serde_json::{Value, json};

use super::{
    GroupClient, GroupInfo, GroupMember, GroupVisibility, PulledEvents, PulledMessages,
    client::PULL_PAGE_SIZE, store::GroupCursor,
};

/// Parsed form of a group join URL:
/// `https://<target_aid>/<group_id>?code=<c>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupUrl {
    pub target_aid: Aid,
    pub group_id: GroupId,
    pub code: Option<String>,
}

pub fn parse_group_url(input: &str) -> Result<GroupUrl, AcpError> {
    let url = url::Url::parse(input)
        .map_err(|error| invalid(format!("bad group url: {error}")))?;
    let target_aid: Aid = url
        .host_str()
        .ok_or_else(|| invalid("group url without host"))?
        .parse()
        .map_err(|_| invalid("group url host is not an aid"))?;
    let group_id = url
        .path_segments()
        .and_then(|mut segments| segments.next())
        .filter(|segment| !segment.is_empty())
        .ok_or_else(|| invalid("group url without group id"))?;
    let code = url
        .query_pairs()
        .find(|(key, _)| key == "code")
        .map(|(_, value)| value.into_owned());
    Ok(GroupUrl {
        target_aid,
        group_id: GroupId::new(group_id),
        code,
    })
}

fn invalid(message: impl Into<String>) -> AcpError {
    AcpError::new(ErrorCode::InvalidArgument, message)
}

fn require(condition: bool, message: &str) -> Result<(), AcpError> {
    if condition { Ok(()) } else { Err(invalid(message)) }
}

fn decode<T: serde::de::DeserializeOwned>(value: Value, what: &str) -> Result<T, AcpError> {
    serde_json::from_value(value).map_err(|error| {
        AcpError::new(
            ErrorCode::NetworkError,
            format!("malformed {what} response: {error}"),
        )
    })
}

impl GroupClient {
    // --- lifecycle ------------------------------------------------------

    /// Tells the authority this agent is reachable for group traffic.
    pub async fn register_online(&self) -> Result<(), AcpError> {
        self.send_rpc("register_online", json!({ "agent_id": self.inner.aid.to_string() }))
            .await
            .map(|_| ())
    }

    pub async fn unregister_online(&self) -> Result<(), AcpError> {
        self.send_rpc("unregister_online", json!({ "agent_id": self.inner.aid.to_string() }))
            .await
            .map(|_| ())
    }

    /// Presence keepalive; one timer serves all online groups.
    pub async fn group_heartbeat(&self) -> Result<(), AcpError> {
        self.send_rpc("heartbeat", json!({ "agent_id": self.inner.aid.to_string() }))
            .await
            .map(|_| ())
    }

    /// Drops every membership this agent holds with the authority.
    pub async fn unregister_membership(&self) -> Result<(), AcpError> {
        self.send_rpc(
            "unregister_membership",
            json!({ "agent_id": self.inner.aid.to_string() }),
        )
        .await
        .map(|_| ())
    }

    // --- group CRUD -----------------------------------------------------

    pub async fn create_group(
        &self,
        name: &str,
        visibility: GroupVisibility,
    ) -> Result<GroupInfo, AcpError> {
        require(!name.trim().is_empty(), "group name must not be empty")?;
        let data = self
            .send_rpc(
                "create_group",
                json!({ "name": name, "visibility": visibility }),
            )
            .await?;
        let info: GroupInfo = decode(data, "create_group")?;
        self.inner
            .store
            .register_group(&GroupId::new(info.group_id.clone()), &info.name)
            .await?;
        Ok(info)
    }

    pub async fn get_group_info(&self, group_id: &GroupId) -> Result<GroupInfo, AcpError> {
        let data = self
            .send_rpc("get_group_info", json!({ "group_id": group_id.to_string() }))
            .await?;
        decode(data, "get_group_info")
    }

    pub async fn list_my_groups(&self) -> Result<Vec<GroupInfo>, AcpError> {
        let data = self
            .send_rpc("list_my_groups", json!({ "agent_id": self.inner.aid.to_string() }))
            .await?;
        decode(
            data.get("groups").cloned().unwrap_or(Value::Array(vec![])),
            "list_my_groups",
        )
    }

    pub async fn search_groups(&self, query: &str, page: u64) -> Result<Value, AcpError> {
        require(!query.trim().is_empty(), "search query must not be empty")?;
        self.send_rpc("search_groups", json!({ "query": query, "page": page }))
            .await
    }

    pub async fn dissolve_group(&self, group_id: &GroupId) -> Result<(), AcpError> {
        self.send_rpc("dissolve_group", json!({ "group_id": group_id.to_string() }))
            .await?;
        self.inner.store.remove_group(group_id).await
    }

    pub async fn suspend_group(&self, group_id: &GroupId) -> Result<(), AcpError> {
        self.send_rpc("suspend_group", json!({ "group_id": group_id.to_string() }))
            .await
            .map(|_| ())
    }

    pub async fn resume_group(&self, group_id: &GroupId) -> Result<(), AcpError> {
        self.send_rpc("resume_group", json!({ "group_id": group_id.to_string() }))
            .await
            .map(|_| ())
    }

    pub async fn update_group_meta(
        &self,
        group_id: &GroupId,
        meta: Value,
    ) -> Result<(), AcpError> {
        require(meta.is_object(), "group meta must be an object")?;
        self.send_rpc(
            "update_group_meta",
            json!({ "group_id": group_id.to_string(), "meta": meta }),
        )
        .await
        .map(|_| ())
    }

    // --- membership -----------------------------------------------------

    /// Joins via a group URL; the URL decides the target authority.
    pub async fn join_by_url(&self, group_url: &str) -> Result<(), AcpError> {
        let parsed = parse_group_url(group_url)?;
        let params = json!({
            "group_id": parsed.group_id.to_string(),
            "agent_id": self.inner.aid.to_string(),
            "code": parsed.code,
        });
        self.send_rpc_to(&parsed.target_aid, "join_by_url", params)
            .await
            .map(|_| ())
    }

    pub async fn request_join(
        &self,
        group_id: &GroupId,
        reason: &str,
    ) -> Result<(), AcpError> {
        self.send_rpc(
            "request_join",
            json!({
                "group_id": group_id.to_string(),
                "agent_id": self.inner.aid.to_string(),
                "reason": reason,
            }),
        )
        .await
        .map(|_| ())
    }

    pub async fn use_invite_code(
        &self,
        group_id: &GroupId,
        code: &str,
    ) -> Result<(), AcpError> {
        require(!code.is_empty(), "invite code must not be empty")?;
        self.send_rpc(
            "use_invite_code",
            json!({
                "group_id": group_id.to_string(),
                "agent_id": self.inner.aid.to_string(),
                "code": code,
            }),
        )
        .await
        .map(|_| ())
    }

    pub async fn review_join_request(
        &self,
        group_id: &GroupId,
        requester: &Aid,
        approve: bool,
        reason: Option<&str>,
    ) -> Result<(), AcpError> {
        self.send_rpc(
            "review_join_request",
            json!({
                "group_id": group_id.to_string(),
                "requester": requester.to_string(),
                "approve": approve,
                "reason": reason,
            }),
        )
        .await
        .map(|_| ())
    }

    pub async fn batch_review_join_requests(
        &self,
        group_id: &GroupId,
        decisions: &[(Aid, bool)],
    ) -> Result<(), AcpError> {
        require(!decisions.is_empty(), "no review decisions given")?;
        let reviews: Vec<Value> = decisions
            .iter()
            .map(|(requester, approve)| {
                json!({ "requester": requester.to_string(), "approve": approve })
            })
            .collect();
        self.send_rpc(
            "batch_review_join_requests",
            json!({ "group_id": group_id.to_string(), "reviews": reviews }),
        )
        .await
        .map(|_| ())
    }

    pub async fn leave_group(&self, group_id: &GroupId) -> Result<(), AcpError> {
        self.send_rpc(
            "leave_group",
            json!({
                "group_id": group_id.to_string(),
                "agent_id": self.inner.aid.to_string(),
            }),
        )
        .await?;
        self.leave_group_session(group_id).await?;
        self.inner.store.remove_group(group_id).await
    }

    pub async fn get_members(&self, group_id: &GroupId) -> Result<Vec<GroupMember>, AcpError> {
        let data = self
            .send_rpc("get_members", json!({ "group_id": group_id.to_string() }))
            .await?;
        decode(
            data.get("members").cloned().unwrap_or(Value::Array(vec![])),
            "get_members",
        )
    }

    pub async fn add_member(&self, group_id: &GroupId, agent_id: &Aid) -> Result<(), AcpError> {
        self.send_rpc(
            "add_member",
            json!({ "group_id": group_id.to_string(), "agent_id": agent_id.to_string() }),
        )
        .await
        .map(|_| ())
    }

    pub async fn remove_member(
        &self,
        group_id: &GroupId,
        agent_id: &Aid,
    ) -> Result<(), AcpError> {
        self.send_rpc(
            "remove_member",
            json!({ "group_id": group_id.to_string(), "agent_id": agent_id.to_string() }),
        )
        .await
        .map(|_| ())
    }

    pub async fn change_member_role(
        &self,
        group_id: &GroupId,
        agent_id: &Aid,
        role: &str,
    ) -> Result<(), AcpError> {
        require(
            matches!(role, "member" | "admin" | "master"),
            "unknown member role",
        )?;
        self.send_rpc(
            "change_member_role",
            json!({
                "group_id": group_id.to_string(),
                "agent_id": agent_id.to_string(),
                "role": role,
            }),
        )
        .await
        .map(|_| ())
    }

    pub async fn ban_agent(&self, group_id: &GroupId, agent_id: &Aid) -> Result<(), AcpError> {
        self.send_rpc(
            "ban_agent",
            json!({ "group_id": group_id.to_string(), "agent_id": agent_id.to_string() }),
        )
        .await
        .map(|_| ())
    }

    pub async fn unban_agent(&self, group_id: &GroupId, agent_id: &Aid) -> Result<(), AcpError> {
        self.send_rpc(
            "unban_agent",
            json!({ "group_id": group_id.to_string(), "agent_id": agent_id.to_string() }),
        )
        .await
        .map(|_| ())
    }

    pub async fn get_banlist(&self, group_id: &GroupId) -> Result<Vec<String>, AcpError> {
        let data = self
            .send_rpc("get_banlist", json!({ "group_id": group_id.to_string() }))
            .await?;
        decode(
            data.get("banned").cloned().unwrap_or(Value::Array(vec![])),
            "get_banlist",
        )
    }

    pub async fn transfer_master(
        &self,
        group_id: &GroupId,
        new_master: &Aid,
    ) -> Result<(), AcpError> {
        self.send_rpc(
            "transfer_master",
            json!({ "group_id": group_id.to_string(), "agent_id": new_master.to_string() }),
        )
        .await
        .map(|_| ())
    }

    pub async fn get_master(&self, group_id: &GroupId) -> Result<String, AcpError> {
        let data = self
            .send_rpc("get_master", json!({ "group_id": group_id.to_string() }))
            .await?;
        Ok(data
            .get("master")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string())
    }

    // --- invite codes ---------------------------------------------------

    pub async fn create_invite_code(
        &self,
        group_id: &GroupId,
        expire_seconds: Option<u64>,
        max_uses: Option<u64>,
    ) -> Result<String, AcpError> {
        let data = self
            .send_rpc(
                "create_invite_code",
                json!({
                    "group_id": group_id.to_string(),
                    "expire_seconds": expire_seconds,
                    "max_uses": max_uses,
                }),
            )
            .await?;
        data.get("code")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| {
                AcpError::new(ErrorCode::NetworkError, "create_invite_code without code")
            })
    }

    pub async fn list_invite_codes(&self, group_id: &GroupId) -> Result<Value, AcpError> {
        self.send_rpc("list_invite_codes", json!({ "group_id": group_id.to_string() }))
            .await
    }

    pub async fn revoke_invite_code(
        &self,
        group_id: &GroupId,
        code: &str,
    ) -> Result<(), AcpError> {
        require(!code.is_empty(), "invite code must not be empty")?;
        self.send_rpc(
            "revoke_invite_code",
            json!({ "group_id": group_id.to_string(), "code": code }),
        )
        .await
        .map(|_| ())
    }

    // --- rules & metadata -----------------------------------------------

    pub async fn get_rules(&self, group_id: &GroupId) -> Result<Value, AcpError> {
        self.send_rpc("get_rules", json!({ "group_id": group_id.to_string() }))
            .await
    }

    pub async fn update_rules(&self, group_id: &GroupId, rules: Value) -> Result<(), AcpError> {
        self.send_rpc(
            "update_rules",
            json!({ "group_id": group_id.to_string(), "rules": rules }),
        )
        .await
        .map(|_| ())
    }

    pub async fn get_join_requirements(&self, group_id: &GroupId) -> Result<Value, AcpError> {
        self.send_rpc(
            "get_join_requirements",
            json!({ "group_id": group_id.to_string() }),
        )
        .await
    }

    pub async fn update_join_requirements(
        &self,
        group_id: &GroupId,
        requirements: Value,
    ) -> Result<(), AcpError> {
        self.send_rpc(
            "update_join_requirements",
            json!({ "group_id": group_id.to_string(), "requirements": requirements }),
        )
        .await
        .map(|_| ())
    }

    pub async fn get_announcement(&self, group_id: &GroupId) -> Result<String, AcpError> {
        let data = self
            .send_rpc("get_announcement", json!({ "group_id": group_id.to_string() }))
            .await?;
        Ok(data
            .get("announcement")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string())
    }

    pub async fn update_announcement(
        &self,
        group_id: &GroupId,
        announcement: &str,
    ) -> Result<(), AcpError> {
        self.send_rpc(
            "update_announcement",
            json!({ "group_id": group_id.to_string(), "announcement": announcement }),
        )
        .await
        .map(|_| ())
    }

    pub async fn get_admins(&self, group_id: &GroupId) -> Result<Vec<String>, AcpError> {
        let data = self
            .send_rpc("get_admins", json!({ "group_id": group_id.to_string() }))
            .await?;
        decode(
            data.get("admins").cloned().unwrap_or(Value::Array(vec![])),
            "get_admins",
        )
    }

    // --- messaging ------------------------------------------------------

    pub async fn send_group_message(
        &self,
        group_id: &GroupId,
        content: &str,
        content_type: &str,
    ) -> Result<u64, AcpError> {
        require(!content.is_empty(), "message content must not be empty")?;
        let data = self
            .send_rpc(
                "send_group_message",
                json!({
                    "group_id": group_id.to_string(),
                    "sender": self.inner.aid.to_string(),
                    "content": content,
                    "content_type": content_type,
                }),
            )
            .await?;
        Ok(data.get("msg_id").and_then(Value::as_u64).unwrap_or(0))
    }

    /// Pulls up to `limit` (at most 50) messages after `after`.
    pub async fn pull_messages(
        &self,
        group_id: &GroupId,
        after: u64,
        limit: u64,
    ) -> Result<PulledMessages, AcpError> {
        require(limit > 0, "pull limit must be positive")?;
        let data = self
            .send_rpc(
                "pull_messages",
                json!({
                    "group_id": group_id.to_string(),
                    "after": after,
                    "limit": limit.min(PULL_PAGE_SIZE),
                }),
            )
            .await?;
        decode(data, "pull_messages")
    }

    /// Acknowledges messages up to `msg_id` and advances the local
    /// cursor.
    pub async fn ack_messages(&self, group_id: &GroupId, msg_id: u64) -> Result<(), AcpError> {
        self.send_rpc(
            "ack_messages",
            json!({ "group_id": group_id.to_string(), "msg_id": msg_id }),
        )
        .await?;
        self.inner.store.advance_current(group_id, msg_id).await
    }

    pub async fn pull_events(
        &self,
        group_id: &GroupId,
        after: u64,
        limit: u64,
    ) -> Result<PulledEvents, AcpError> {
        require(limit > 0, "pull limit must be positive")?;
        let data = self
            .send_rpc(
                "pull_events",
                json!({
                    "group_id": group_id.to_string(),
                    "after": after,
                    "limit": limit.min(PULL_PAGE_SIZE),
                }),
            )
            .await?;
        decode(data, "pull_events")
    }

    pub async fn ack_events(&self, group_id: &GroupId, event_id: u64) -> Result<(), AcpError> {
        self.send_rpc(
            "ack_events",
            json!({ "group_id": group_id.to_string(), "event_id": event_id }),
        )
        .await?;
        self.inner.store.advance_event_current(group_id, event_id).await
    }

    /// The server's view of this agent's cursor.
    pub async fn get_cursor(&self, group_id: &GroupId) -> Result<GroupCursor, AcpError> {
        let data = self
            .send_rpc("get_cursor", json!({ "group_id": group_id.to_string() }))
            .await?;
        decode(data, "get_cursor")
    }

    // --- broadcast control ----------------------------------------------

    pub async fn acquire_broadcast_lock(&self, group_id: &GroupId) -> Result<bool, AcpError> {
        let data = self
            .send_rpc(
                "acquire_broadcast_lock",
                json!({
                    "group_id": group_id.to_string(),
                    "agent_id": self.inner.aid.to_string(),
                }),
            )
            .await?;
        Ok(data.get("acquired").and_then(Value::as_bool).unwrap_or(false))
    }

    pub async fn release_broadcast_lock(&self, group_id: &GroupId) -> Result<(), AcpError> {
        self.send_rpc(
            "release_broadcast_lock",
            json!({
                "group_id": group_id.to_string(),
                "agent_id": self.inner.aid.to_string(),
            }),
        )
        .await
        .map(|_| ())
    }

    pub async fn check_broadcast_permission(
        &self,
        group_id: &GroupId,
    ) -> Result<bool, AcpError> {
        let data = self
            .send_rpc(
                "check_broadcast_permission",
                json!({
                    "group_id": group_id.to_string(),
                    "agent_id": self.inner.aid.to_string(),
                }),
            )
            .await?;
        Ok(data.get("allowed").and_then(Value::as_bool).unwrap_or(false))
    }

    // --- sync diagnostics -----------------------------------------------

    pub async fn get_sync_status(&self, group_id: &GroupId) -> Result<Value, AcpError> {
        self.send_rpc("get_sync_status", json!({ "group_id": group_id.to_string() }))
            .await
    }

    pub async fn get_sync_log(&self, group_id: &GroupId) -> Result<Value, AcpError> {
        self.send_rpc("get_sync_log", json!({ "group_id": group_id.to_string() }))
            .await
    }

    pub async fn get_checksum(&self, group_id: &GroupId) -> Result<Value, AcpError> {
        self.send_rpc("get_checksum", json!({ "group_id": group_id.to_string() }))
            .await
    }

    pub async fn get_message_checksum(
        &self,
        group_id: &GroupId,
        msg_id: u64,
    ) -> Result<Value, AcpError> {
        self.send_rpc(
            "get_message_checksum",
            json!({ "group_id": group_id.to_string(), "msg_id": msg_id }),
        )
        .await
    }

    pub async fn get_file(&self, group_id: &GroupId, file_name: &str) -> Result<Value, AcpError> {
        require(!file_name.is_empty(), "file name must not be empty")?;
        self.send_rpc(
            "get_file",
            json!({ "group_id": group_id.to_string(), "file_name": file_name }),
        )
        .await
    }

    // --- analytics ------------------------------------------------------

    pub async fn generate_digest(
        &self,
        group_id: &GroupId,
        range: Option<(u64, u64)>,
    ) -> Result<Value, AcpError> {
        let range = range.map(|(from, to)| json!({ "from": from, "to": to }));
        self.send_rpc(
            "generate_digest",
            json!({ "group_id": group_id.to_string(), "range": range }),
        )
        .await
    }

    pub async fn get_digest(&self, group_id: &GroupId) -> Result<Value, AcpError> {
        self.send_rpc("get_digest", json!({ "group_id": group_id.to_string() }))
            .await
    }

    pub async fn get_summary(&self, group_id: &GroupId) -> Result<Value, AcpError> {
        self.send_rpc("get_summary", json!({ "group_id": group_id.to_string() }))
            .await
    }

    pub async fn get_metrics(&self, group_id: &GroupId) -> Result<Value, AcpError> {
        self.send_rpc("get_metrics", json!({ "group_id": group_id.to_string() }))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_full_group_url() {
        let parsed = parse_group_url("https://group.ex.com/g42?code=secret").unwrap();
        assert_eq!(parsed.target_aid.to_string(), "group.ex.com");
        assert_eq!(parsed.group_id.as_str(), "g42");
        assert_eq!(parsed.code.as_deref(), Some("secret"));
    }

    #[test]
    fn parse_group_url_without_code() {
        let parsed = parse_group_url("https://group.ex.com/g42").unwrap();
        assert_eq!(parsed.code, None);
    }

    #[test]
    fn reject_malformed_group_urls() {
        assert!(parse_group_url("not a url").is_err());
        assert!(parse_group_url("https://group.ex.com/").is_err());
        assert!(parse_group_url("https://192.168.0.1/g42").is_err());
    }
}
