// SPDX-FileCopyrightText: 2025 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Point-to-point sessions: creation, invitations, membership and the
//! message log. A session is a server-side rendezvous; the local state
//! mirrors the expected post-state of each command.

use std::{
    collections::HashMap,
    sync::atomic::{AtomicU64, Ordering},
    time::Duration,
};

use acpcommon::{
    AcpError, ErrorCode, RequestId, TimeStamp,
    identifiers::{Aid, SessionId},
};
use acpapiclient::ws::{Frame, SessionMessage, cmd};
use percent_encoding::{NON_ALPHANUMERIC, percent_decode_str, utf8_percent_encode};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::{channel::ChannelSlot, store::CertKeyStore};

const SESSION_ACK_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionRole {
    Owner,
    Member,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SessionMember {
    pub agent_id: String,
    pub role: SessionRole,
    pub joined_at: TimeStamp,
}

/// How the local side came to know the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionKind {
    /// Created here, server-assigned id.
    Created,
    /// Auto-created on first message from a peer.
    Incoming,
    /// Created here while offline; the server will not route it.
    Orphan,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub session_id: SessionId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub identifying_code: Option<String>,
    pub kind: SessionKind,
    pub members: Vec<SessionMember>,
    pub closed: bool,
}

impl Session {
    fn has_member(&self, agent_id: &str) -> bool {
        self.members.iter().any(|m| m.agent_id == agent_id)
    }
}

/// One block of a P2P message. The wire payload is the URL-encoded JSON
/// array of blocks.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MessageBlock {
    Text { text: String },
    Image { url: String },
    File { url: String, name: String },
}

impl MessageBlock {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }
}

/// A message delivered to the application layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IncomingMessage {
    pub session_id: SessionId,
    pub sender: String,
    pub blocks: Vec<MessageBlock>,
    pub timestamp: TimeStamp,
}

/// Record format of the per-session JSONL log.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct SessionLogRecord {
    sender: String,
    blocks: Vec<MessageBlock>,
    timestamp: TimeStamp,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct SessionIndexEntry {
    session_id: SessionId,
    kind: SessionKind,
    closed: bool,
}

/// Manages the sessions of one agent. Holds a channel capability, not a
/// reference to the runtime that owns it.
#[derive(Clone)]
pub struct SessionManager {
    aid: Aid,
    channel: ChannelSlot,
    store: CertKeyStore,
    sessions: std::sync::Arc<Mutex<HashMap<SessionId, Session>>>,
    local_counter: std::sync::Arc<AtomicU64>,
}

impl SessionManager {
    /// Creates the session manager for `aid`, sending through whatever
    /// channel is installed in `channel`.
    pub fn new(aid: Aid, channel: ChannelSlot, store: CertKeyStore) -> Self {
        Self {
            aid,
            channel,
            store,
            sessions: Default::default(),
            local_counter: Default::default(),
        }
    }

    /// Creates a session with the given members. When the channel is up
    /// the server assigns the id; otherwise a local orphan session is
    /// created which the server will not route.
    pub async fn create_session(&self, members: &[Aid]) -> Result<SessionId, AcpError> {
        let (session_id, kind) = if self.channel.is_connected() {
            let request_id = RequestId::random();
            let frame = Frame::new(
                cmd::CREATE_SESSION_REQ,
                serde_json::json!({ "type": "public" }),
                &request_id,
            );
            let ack = self
                .channel
                .send_and_wait_ack(&frame, cmd::CREATE_SESSION_ACK, &request_id, SESSION_ACK_TIMEOUT)
                .await?;
            let session_id = ack
                .data
                .get("session_id")
                .and_then(Value::as_str)
                .ok_or_else(|| {
                    AcpError::new(ErrorCode::NetworkError, "create_session_ack without session_id")
                })?;
            (SessionId::new(session_id), SessionKind::Created)
        } else {
            let counter = self.local_counter.fetch_add(1, Ordering::Relaxed);
            (
                SessionId::local(TimeStamp::now().as_millis(), counter),
                SessionKind::Orphan,
            )
        };

        let session = Session {
            session_id: session_id.clone(),
            identifying_code: None,
            kind,
            members: vec![SessionMember {
                agent_id: self.aid.to_string(),
                role: SessionRole::Owner,
                joined_at: TimeStamp::now(),
            }],
            closed: false,
        };
        self.sessions
            .lock()
            .await
            .insert(session_id.clone(), session);
        self.persist_index().await;
        info!(session_id = %session_id, ?kind, "session created");

        for member in members {
            if member == &self.aid {
                continue;
            }
            if let Err(error) = self.invite_agent(&session_id, member).await {
                warn!(%member, %error, "invite failed during session creation");
            }
        }
        Ok(session_id)
    }

    /// Invites an agent, optimistically adding it to the local roster.
    /// The addition is kept even when the ack reports a failure; the ack
    /// status is surfaced to the caller.
    pub async fn invite_agent(
        &self,
        session_id: &SessionId,
        agent_id: &Aid,
    ) -> Result<u16, AcpError> {
        {
            let mut sessions = self.sessions.lock().await;
            let session = sessions
                .get_mut(session_id)
                .ok_or_else(|| session_not_found(session_id))?;
            if session.closed {
                return Err(session_closed(session_id));
            }
            if !session.has_member(&agent_id.to_string()) {
                session.members.push(SessionMember {
                    agent_id: agent_id.to_string(),
                    role: SessionRole::Member,
                    joined_at: TimeStamp::now(),
                });
            }
        }

        let request_id = RequestId::random();
        let frame = Frame::new(
            cmd::INVITE_AGENT_REQ,
            serde_json::json!({
                "session_id": session_id.to_string(),
                "agent_id": agent_id.to_string(),
                "inviter": self.aid.to_string(),
            }),
            &request_id,
        );
        let ack = self
            .channel
            .send_and_wait_ack(&frame, cmd::INVITE_AGENT_ACK, &request_id, SESSION_ACK_TIMEOUT)
            .await?;
        let status = ack.status_code();
        if status != 200 {
            warn!(%session_id, %agent_id, status, "invite not accepted by server");
        }
        Ok(status)
    }

    /// Joins a session the agent was invited to (usually over the
    /// heartbeat channel).
    pub async fn join_session(
        &self,
        session_id: &SessionId,
        invite_code: &str,
    ) -> Result<(), AcpError> {
        let request_id = RequestId::random();
        let frame = Frame::new(
            cmd::JOIN_SESSION_REQ,
            serde_json::json!({
                "session_id": session_id.to_string(),
                "invite_code": invite_code,
                "agent_id": self.aid.to_string(),
            }),
            &request_id,
        );
        self.channel.send_frame(&frame).await?;

        let mut sessions = self.sessions.lock().await;
        sessions
            .entry(session_id.clone())
            .or_insert_with(|| Session {
                session_id: session_id.clone(),
                identifying_code: Some(invite_code.to_string()),
                kind: SessionKind::Incoming,
                members: vec![SessionMember {
                    agent_id: self.aid.to_string(),
                    role: SessionRole::Member,
                    joined_at: TimeStamp::now(),
                }],
                closed: false,
            });
        drop(sessions);
        self.persist_index().await;
        Ok(())
    }

    pub async fn leave_session(&self, session_id: &SessionId) -> Result<(), AcpError> {
        let request_id = RequestId::random();
        let frame = Frame::new(
            cmd::LEAVE_SESSION_REQ,
            serde_json::json!({
                "session_id": session_id.to_string(),
                "agent_id": self.aid.to_string(),
            }),
            &request_id,
        );
        self.channel.send_frame(&frame).await?;
        self.sessions.lock().await.remove(session_id);
        self.persist_index().await;
        Ok(())
    }

    /// Closes a session. The closed flag is terminal; subsequent sends
    /// fail with `SESSION_CLOSED`.
    pub async fn close_session(&self, session_id: &SessionId) -> Result<(), AcpError> {
        {
            let mut sessions = self.sessions.lock().await;
            let session = sessions
                .get_mut(session_id)
                .ok_or_else(|| session_not_found(session_id))?;
            session.closed = true;
        }
        let request_id = RequestId::random();
        let frame = Frame::new(
            cmd::CLOSE_SESSION_REQ,
            serde_json::json!({ "session_id": session_id.to_string() }),
            &request_id,
        );
        // Closing locally succeeds even when the server is unreachable.
        if let Err(error) = self.channel.send_frame(&frame).await {
            warn!(%session_id, %error, "close_session not delivered");
        }
        self.persist_index().await;
        Ok(())
    }

    pub async fn eject_agent(
        &self,
        session_id: &SessionId,
        agent_id: &Aid,
    ) -> Result<(), AcpError> {
        let request_id = RequestId::random();
        let frame = Frame::new(
            cmd::EJECT_AGENT_REQ,
            serde_json::json!({
                "session_id": session_id.to_string(),
                "agent_id": agent_id.to_string(),
            }),
            &request_id,
        );
        self.channel.send_frame(&frame).await?;
        let mut sessions = self.sessions.lock().await;
        if let Some(session) = sessions.get_mut(session_id) {
            session
                .members
                .retain(|member| member.agent_id != agent_id.to_string());
        }
        Ok(())
    }

    /// Fetches the authoritative roster and refreshes the local mirror.
    pub async fn get_member_list(
        &self,
        session_id: &SessionId,
    ) -> Result<Vec<SessionMember>, AcpError> {
        let request_id = RequestId::random();
        let frame = Frame::new(
            cmd::GET_MEMBER_LIST_REQ,
            serde_json::json!({ "session_id": session_id.to_string() }),
            &request_id,
        );
        let ack = self
            .channel
            .send_and_wait_ack(&frame, cmd::GET_MEMBER_LIST_ACK, &request_id, SESSION_ACK_TIMEOUT)
            .await?;
        let members: Vec<SessionMember> = ack
            .data
            .get("members")
            .cloned()
            .map(serde_json::from_value)
            .transpose()
            .map_err(|error| {
                AcpError::new(ErrorCode::NetworkError, format!("malformed roster: {error}"))
            })?
            .unwrap_or_default();

        let mut sessions = self.sessions.lock().await;
        if let Some(session) = sessions.get_mut(session_id) {
            session.members = members.clone();
        }
        Ok(members)
    }

    /// Sends a message into the session. `instruction` is an opaque
    /// sidecar carried verbatim in the frame.
    pub async fn send_message(
        &self,
        session_id: &SessionId,
        blocks: &[MessageBlock],
        instruction: Option<Value>,
    ) -> Result<(), AcpError> {
        {
            let sessions = self.sessions.lock().await;
            let session = sessions
                .get(session_id)
                .ok_or_else(|| session_not_found(session_id))?;
            if session.closed {
                return Err(session_closed(session_id));
            }
        }

        let json = serde_json::to_string(blocks)
            .map_err(|error| AcpError::new(ErrorCode::Internal, error.to_string()))?;
        let encoded: String = utf8_percent_encode(&json, NON_ALPHANUMERIC).to_string();
        let message = SessionMessage {
            session_id: session_id.to_string(),
            sender: self.aid.to_string(),
            receiver: None,
            message: encoded,
            timestamp: TimeStamp::now().as_millis(),
            instruction,
            request_id: Some(RequestId::random().to_string()),
        };

        self.append_log(session_id, &self.aid.to_string(), blocks)
            .await;
        self.channel.send_frame(&message.into_frame()).await
    }

    /// Routes a `session_message` that was not claimed by the group hook.
    /// Unknown sessions are auto-created with the sender as peer.
    pub async fn handle_incoming(&self, message: &SessionMessage) -> Option<IncomingMessage> {
        let session_id = SessionId::new(message.session_id.clone());
        let mut created = false;
        {
            let mut sessions = self.sessions.lock().await;
            sessions.entry(session_id.clone()).or_insert_with(|| {
                created = true;
                Session {
                    session_id: session_id.clone(),
                    identifying_code: None,
                    kind: SessionKind::Incoming,
                    members: vec![
                        SessionMember {
                            agent_id: message.sender.clone(),
                            role: SessionRole::Owner,
                            joined_at: TimeStamp::now(),
                        },
                        SessionMember {
                            agent_id: self.aid.to_string(),
                            role: SessionRole::Member,
                            joined_at: TimeStamp::now(),
                        },
                    ],
                    closed: false,
                }
            });
        }
        if created {
            debug!(%session_id, sender = %message.sender, "incoming session auto-created");
            self.persist_index().await;
        }

        let blocks = decode_blocks(&message.message);
        self.append_log(&session_id, &message.sender, &blocks).await;
        Some(IncomingMessage {
            session_id,
            sender: message.sender.clone(),
            blocks,
            timestamp: TimeStamp::from_millis(message.timestamp),
        })
    }

    pub async fn get_session(&self, session_id: &SessionId) -> Option<Session> {
        self.sessions.lock().await.get(session_id).cloned()
    }

    pub async fn list_sessions(&self) -> Vec<Session> {
        self.sessions.lock().await.values().cloned().collect()
    }

    pub async fn read_log(&self, session_id: &SessionId) -> Vec<IncomingMessage> {
        let path = self
            .store
            .session_log_path(&self.aid, session_id.as_str());
        let records: Vec<SessionLogRecord> = self.store.read_jsonl(&path).await.unwrap_or_default();
        records
            .into_iter()
            .map(|record| IncomingMessage {
                session_id: session_id.clone(),
                sender: record.sender,
                blocks: record.blocks,
                timestamp: record.timestamp,
            })
            .collect()
    }

    async fn append_log(&self, session_id: &SessionId, sender: &str, blocks: &[MessageBlock]) {
        let record = SessionLogRecord {
            sender: sender.to_string(),
            blocks: blocks.to_vec(),
            timestamp: TimeStamp::now(),
        };
        let path = self
            .store
            .session_log_path(&self.aid, session_id.as_str());
        // Persistence failures never abort the wire protocol.
        if let Err(error) = self.store.append_jsonl(&path, &[record]).await {
            warn!(%session_id, %error, "failed to persist session message");
        }
    }

    async fn persist_index(&self) {
        let entries: Vec<SessionIndexEntry> = self
            .sessions
            .lock()
            .await
            .values()
            .map(|session| SessionIndexEntry {
                session_id: session.session_id.clone(),
                kind: session.kind,
                closed: session.closed,
            })
            .collect();
        let path = self.store.session_index_path(&self.aid);
        if let Err(error) = self.store.write_json_atomic(&path, &entries).await {
            warn!(%error, "failed to persist session index");
        }
    }
}

fn session_not_found(session_id: &SessionId) -> AcpError {
    AcpError::new(ErrorCode::SessionNotFound, format!("unknown session {session_id}"))
}

fn session_closed(session_id: &SessionId) -> AcpError {
    AcpError::new(ErrorCode::SessionClosed, format!("session {session_id} is closed"))
}

/// Decodes the URL-encoded JSON block array. Payloads that do not parse
/// stay visible as a single text block instead of being dropped.
fn decode_blocks(encoded: &str) -> Vec<MessageBlock> {
    let decoded = percent_decode_str(encoded).decode_utf8_lossy();
    match serde_json::from_str::<Vec<MessageBlock>>(&decoded) {
        Ok(blocks) => blocks,
        Err(_) => vec![MessageBlock::text(decoded)],
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> (tempfile::TempDir, SessionManager) {
        let dir = tempfile::tempdir().unwrap();
        let aid: Aid = "alice.ex.com".parse().unwrap();
        let store = CertKeyStore::new(dir.path());
        let manager = SessionManager::new(aid, ChannelSlot::new(), store);
        (dir, manager)
    }

    #[tokio::test]
    async fn offline_create_falls_back_to_orphan_session() {
        let (_dir, manager) = manager();
        let session_id = manager.create_session(&[]).await.unwrap();
        assert!(session_id.is_local());
        let session = manager.get_session(&session_id).await.unwrap();
        assert_eq!(session.kind, SessionKind::Orphan);
        assert_eq!(session.members.len(), 1);
        assert_eq!(session.members[0].role, SessionRole::Owner);
    }

    #[tokio::test]
    async fn closed_session_refuses_sends() {
        let (_dir, manager) = manager();
        let session_id = manager.create_session(&[]).await.unwrap();
        manager.close_session(&session_id).await.unwrap();

        let err = manager
            .send_message(&session_id, &[MessageBlock::text("hello")], None)
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::SessionClosed);
    }

    #[tokio::test]
    async fn incoming_message_auto_creates_session() {
        let (_dir, manager) = manager();
        let wire = SessionMessage {
            session_id: "s1".to_string(),
            sender: "bob.ex.com".to_string(),
            receiver: Some("alice.ex.com".to_string()),
            message: utf8_percent_encode(
                "[{\"type\":\"text\",\"text\":\"hello\"}]",
                NON_ALPHANUMERIC,
            )
            .to_string(),
            timestamp: 1_700_000_000_000,
            instruction: None,
            request_id: None,
        };

        let incoming = manager.handle_incoming(&wire).await.unwrap();
        assert_eq!(incoming.sender, "bob.ex.com");
        assert_eq!(incoming.blocks, vec![MessageBlock::text("hello")]);

        let session = manager
            .get_session(&SessionId::new("s1"))
            .await
            .unwrap();
        assert_eq!(session.kind, SessionKind::Incoming);
        assert!(session.has_member("bob.ex.com"));
        assert!(session.has_member("alice.ex.com"));

        // The message was persisted.
        let log = manager.read_log(&SessionId::new("s1")).await;
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].blocks, vec![MessageBlock::text("hello")]);
    }

    #[tokio::test]
    async fn unparseable_payload_survives_as_text() {
        let blocks = decode_blocks("not%20json");
        assert_eq!(blocks, vec![MessageBlock::text("not json")]);
    }
}
