// SPDX-FileCopyrightText: 2025 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

//! The group protocol engine. It speaks a request/response protocol over
//! raw (non-URL-encoded) `session_message` frames exchanged with the
//! group authority, persists incoming batches through the store and
//! keeps per-group presence alive with a shared heartbeat timer.

use std::{
    collections::{HashMap, HashSet},
    sync::{
        Arc, Mutex as StdMutex, RwLock as StdRwLock,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use acpcommon::{
    AcpError, ErrorCode, RequestId,
    identifiers::{Aid, GroupId, SessionId},
};
use acpapiclient::ws::{RawMessageHook, SessionMessage};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{GroupEvent, GroupMessageBatch, GroupStore};
use crate::{channel::ChannelSlot, handlers::HandlerRegistry};

const RPC_TIMEOUT: Duration = Duration::from_secs(30);
const MAX_INFLIGHT_RPCS: usize = 256;
const GROUP_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(180);
pub(crate) const PULL_PAGE_SIZE: u64 = 50;

pub(crate) type RpcWaiter = oneshot::Sender<Result<Value, AcpError>>;

pub(crate) struct GroupClientInner {
    pub(crate) aid: Aid,
    /// Authority the RPCs go to; defaults to `group.<issuer>`.
    pub(crate) authority: StdRwLock<Aid>,
    /// Senders whose raw frames the hook claims.
    authorities: StdRwLock<HashSet<String>>,
    /// The dedicated session with the authority.
    pub(crate) session: StdRwLock<Option<SessionId>>,
    pub(crate) channel: ChannelSlot,
    pub(crate) store: GroupStore,
    pub(crate) waiters: StdMutex<HashMap<String, RpcWaiter>>,
    online_groups: StdMutex<HashSet<GroupId>>,
    /// Presence registered with the authority for the current connection.
    registered_online: AtomicBool,
    handlers: HandlerRegistry,
    inbound: mpsc::UnboundedSender<SessionMessage>,
    heartbeat: StdMutex<Option<CancellationToken>>,
    #[cfg(test)]
    pub(crate) acks: StdMutex<Vec<(String, u64)>>,
}

/// Engine handle. Cloning shares the engine.
#[derive(Clone)]
pub struct GroupClient {
    pub(crate) inner: Arc<GroupClientInner>,
}

/// Pre-dispatch hook claiming frames whose sender is a group authority.
pub struct GroupRawHook {
    inner: Arc<GroupClientInner>,
}

impl RawMessageHook for GroupRawHook {
    fn intercept(&self, message: &SessionMessage) -> bool {
        let claimed = self
            .inner
            .authorities
            .read()
            .expect("poisoned")
            .contains(&message.sender);
        if claimed {
            let _ = self.inner.inbound.send(message.clone());
        }
        claimed
    }
}

impl GroupClient {
    /// Creates the engine and starts its inbound dispatch task. It stays
    /// idle until [`GroupClient::init`] binds it to an authority session.
    pub fn new(
        aid: Aid,
        channel: ChannelSlot,
        store: GroupStore,
        handlers: HandlerRegistry,
    ) -> Self {
        let authority = aid.group_authority();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let inner = Arc::new(GroupClientInner {
            aid,
            authorities: StdRwLock::new(HashSet::from([authority.to_string()])),
            authority: StdRwLock::new(authority),
            session: StdRwLock::new(None),
            channel,
            store,
            waiters: StdMutex::new(HashMap::new()),
            online_groups: StdMutex::new(HashSet::new()),
            registered_online: AtomicBool::new(false),
            handlers,
            inbound: inbound_tx,
            heartbeat: StdMutex::new(None),
            #[cfg(test)]
            acks: StdMutex::new(Vec::new()),
        });
        tokio::spawn(inbound_loop(inner.clone(), inbound_rx));
        Self { inner }
    }

    /// Binds the engine to its authority session. Cross-AP groups pass an
    /// explicit `target`; otherwise the authority is derived from the
    /// agent's issuer.
    pub fn init(&self, target: Option<Aid>, session_id: SessionId) {
        if let Some(target) = target {
            self.inner
                .authorities
                .write()
                .expect("poisoned")
                .insert(target.to_string());
            *self.inner.authority.write().expect("poisoned") = target;
        }
        *self.inner.session.write().expect("poisoned") = Some(session_id);
    }

    /// The hook to install on the message channel.
    pub fn raw_hook(&self) -> Arc<dyn RawMessageHook> {
        Arc::new(GroupRawHook {
            inner: self.inner.clone(),
        })
    }

    pub fn store(&self) -> &GroupStore {
        &self.inner.store
    }

    pub fn authority(&self) -> Aid {
        self.inner.authority.read().expect("poisoned").clone()
    }

    pub fn online_groups(&self) -> Vec<GroupId> {
        self.inner
            .online_groups
            .lock()
            .expect("poisoned")
            .iter()
            .cloned()
            .collect()
    }

    /// Sends one RPC to the group authority and waits for its response.
    pub async fn send_rpc(&self, method: &str, params: Value) -> Result<Value, AcpError> {
        let target = self.authority();
        self.send_rpc_to(&target, method, params).await
    }

    /// Sends one RPC to an explicit target authority.
    pub async fn send_rpc_to(
        &self,
        target: &Aid,
        method: &str,
        params: Value,
    ) -> Result<Value, AcpError> {
        let session_id = self
            .inner
            .session
            .read()
            .expect("poisoned")
            .clone()
            .ok_or_else(|| {
                AcpError::new(ErrorCode::NotInitialized, "group client not initialized")
            })?;

        let request_id = RequestId::random();
        let rx = self.inner.register_waiter(&request_id)?;
        let payload = serde_json::json!({
            "type": "group_rpc_req",
            "method": method,
            "request_id": request_id.to_string(),
            "params": params,
        });
        if let Err(error) = self.inner.channel.send_raw(&payload, target, &session_id).await {
            self.inner.remove_waiter(request_id.as_str());
            return Err(error);
        }

        match tokio::time::timeout(RPC_TIMEOUT, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(AcpError::new(
                ErrorCode::WsTimeout,
                format!("rpc {method} aborted by disconnect"),
            )),
            Err(_) => {
                self.inner.remove_waiter(request_id.as_str());
                Err(AcpError::new(
                    ErrorCode::WsTimeout,
                    format!("rpc {method} timed out"),
                ))
            }
        }
    }

    /// Brings a group online: records presence with the authority (once
    /// per connection), catches up the local log and makes sure the
    /// shared heartbeat timer runs.
    pub async fn join_group_session(&self, group_id: &GroupId) -> Result<(), AcpError> {
        if !self.inner.registered_online.swap(true, Ordering::SeqCst) {
            if let Err(error) = self.register_online().await {
                self.inner.registered_online.store(false, Ordering::SeqCst);
                return Err(error);
            }
        }

        let last = self.inner.store.last_msg_id(group_id).await?;
        self.pull_and_store(group_id, last, PULL_PAGE_SIZE).await?;

        self.inner
            .online_groups
            .lock()
            .expect("poisoned")
            .insert(group_id.clone());
        self.ensure_heartbeat();
        info!(group_id = %group_id, "group session joined");
        Ok(())
    }

    /// Takes a group offline. The last group out unregisters presence and
    /// stops the heartbeat timer.
    pub async fn leave_group_session(&self, group_id: &GroupId) -> Result<(), AcpError> {
        let now_empty = {
            let mut online = self.inner.online_groups.lock().expect("poisoned");
            online.remove(group_id);
            online.is_empty()
        };
        if now_empty {
            self.stop_heartbeat();
            self.inner.registered_online.store(false, Ordering::SeqCst);
            if let Err(error) = self.unregister_online().await {
                warn!(%error, "unregister_online failed");
            }
        }
        Ok(())
    }

    /// Cold-start catch-up: pull pages of at most `limit` messages, store
    /// and ack each page, until the server reports no more.
    pub async fn pull_and_store(
        &self,
        group_id: &GroupId,
        mut after: u64,
        limit: u64,
    ) -> Result<u64, AcpError> {
        let limit = limit.clamp(1, PULL_PAGE_SIZE);
        let mut total: u64 = 0;
        loop {
            let page = self.pull_messages(group_id, after, limit).await?;
            let has_more = page.has_more;
            if page.messages.is_empty() {
                break;
            }
            let outcome = self
                .inner
                .store
                .append_messages(group_id, page.messages)
                .await?;
            total += outcome.appended as u64;
            if outcome.last_id > after {
                after = outcome.last_id;
                self.ack_messages(group_id, outcome.last_id).await?;
            }
            if !has_more {
                break;
            }
        }
        Ok(total)
    }

    /// Re-records presence for every group that was online before a
    /// reconnect. The server has expired the presence record by now.
    pub(crate) async fn rejoin_after_reconnect(&self) {
        self.inner.registered_online.store(false, Ordering::SeqCst);
        let groups = self.online_groups();
        for group_id in groups {
            if let Err(error) = self.join_group_session(&group_id).await {
                error!(group_id = %group_id, %error, "group rejoin failed");
            }
        }
    }

    fn ensure_heartbeat(&self) {
        let mut heartbeat = self.inner.heartbeat.lock().expect("poisoned");
        if heartbeat.is_some() {
            return;
        }
        let cancel = CancellationToken::new();
        *heartbeat = Some(cancel.clone());

        let client = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(GROUP_HEARTBEAT_INTERVAL);
            // Skip the immediate first tick; presence was just recorded.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = ticker.tick() => {
                        if let Err(error) = client.group_heartbeat().await {
                            warn!(%error, "group heartbeat failed");
                        }
                    }
                }
            }
        });
    }

    fn stop_heartbeat(&self) {
        if let Some(cancel) = self.inner.heartbeat.lock().expect("poisoned").take() {
            cancel.cancel();
        }
    }
}

impl GroupClientInner {
    fn register_waiter(
        &self,
        request_id: &RequestId,
    ) -> Result<oneshot::Receiver<Result<Value, AcpError>>, AcpError> {
        let mut waiters = self.waiters.lock().expect("poisoned");
        if waiters.len() >= MAX_INFLIGHT_RPCS {
            return Err(AcpError::new(
                ErrorCode::WsSendFailed,
                format!("too many group rpcs in flight ({MAX_INFLIGHT_RPCS})"),
            ));
        }
        let (tx, rx) = oneshot::channel();
        waiters.insert(request_id.to_string(), tx);
        Ok(rx)
    }

    fn remove_waiter(&self, request_id: &str) {
        self.waiters.lock().expect("poisoned").remove(request_id);
    }
}

async fn inbound_loop(
    inner: Arc<GroupClientInner>,
    mut inbound: mpsc::UnboundedReceiver<SessionMessage>,
) {
    while let Some(message) = inbound.recv().await {
        let payload: Value = match serde_json::from_str(&message.message) {
            Ok(payload) => payload,
            Err(error) => {
                warn!(%error, sender = %message.sender, "undecodable group frame");
                continue;
            }
        };
        dispatch(&inner, payload).await;
    }
}

async fn dispatch(inner: &Arc<GroupClientInner>, payload: Value) {
    let Some(frame_type) = payload
        .get("type")
        .and_then(Value::as_str)
        .map(str::to_string)
    else {
        warn!("group frame without type");
        return;
    };
    match frame_type.as_str() {
        "group_rpc_resp" => handle_rpc_resp(inner, &payload),
        "new_message" => {
            let group_id = group_id_of(&payload);
            let latest = field_u64(&payload, "latest_msg_id");
            let sender = field_str(&payload, "sender");
            let preview = field_str(&payload, "preview");
            if let Err(error) = inner.store.advance_latest(&group_id, latest).await {
                warn!(%error, "failed to record latest msg id");
            }
            inner
                .handlers
                .with_group_handler(|h| h.on_new_message(&group_id, latest, &sender, &preview));
        }
        "new_event" => {
            let group_id = group_id_of(&payload);
            let latest = field_u64(&payload, "latest_event_id");
            let event_type = field_str(&payload, "event_type");
            let summary = field_str(&payload, "summary");
            if let Err(error) = inner.store.advance_event_latest(&group_id, latest).await {
                warn!(%error, "failed to record latest event id");
            }
            inner.handlers.with_group_handler(|h| {
                h.on_new_event(&group_id, latest, &event_type, &summary)
            });
        }
        "group_message_batch" => match serde_json::from_value::<GroupMessageBatch>(payload) {
            Ok(batch) => handle_batch(inner, batch).await,
            Err(error) => warn!(%error, "malformed group_message_batch"),
        },
        "group_event" => {
            let group_id = group_id_of(&payload);
            match payload
                .get("event")
                .cloned()
                .map(serde_json::from_value::<GroupEvent>)
            {
                Some(Ok(event)) => {
                    if let Err(error) = inner
                        .store
                        .append_events(&group_id, vec![event.clone()])
                        .await
                    {
                        warn!(%error, "failed to persist group event");
                    }
                    inner
                        .handlers
                        .with_group_handler(|h| h.on_group_event(&group_id, &event));
                }
                _ => warn!("malformed group_event"),
            }
        }
        "group_invite" => {
            let group_id = group_id_of(&payload);
            let inviter = field_str(&payload, "inviter");
            inner
                .handlers
                .with_group_handler(|h| h.on_group_invite(&group_id, &inviter, &payload));
        }
        "join_approved" => {
            let group_id = group_id_of(&payload);
            // Fetch the group info and register it locally before telling
            // the application.
            let inner = inner.clone();
            tokio::spawn(async move {
                let client = GroupClient { inner: inner.clone() };
                match client.get_group_info(&group_id).await {
                    Ok(info) => {
                        if let Err(error) =
                            inner.store.register_group(&group_id, &info.name).await
                        {
                            warn!(%error, "failed to register approved group");
                        }
                    }
                    Err(error) => {
                        warn!(%error, group_id = %group_id, "group info fetch failed");
                        let _ = inner.store.register_group(&group_id, "").await;
                    }
                }
                inner
                    .handlers
                    .with_group_handler(|h| h.on_join_approved(&group_id));
            });
        }
        "join_rejected" => {
            let group_id = group_id_of(&payload);
            let reason = field_str(&payload, "reason");
            inner
                .handlers
                .with_group_handler(|h| h.on_join_rejected(&group_id, &reason));
        }
        "join_request_received" => {
            let group_id = group_id_of(&payload);
            let requester = field_str(&payload, "requester");
            inner
                .handlers
                .with_group_handler(|h| h.on_join_request_received(&group_id, &requester));
        }
        other => debug!(frame_type = other, "ignoring unknown group frame"),
    }
}

fn handle_rpc_resp(inner: &Arc<GroupClientInner>, payload: &Value) {
    let Some(request_id) = payload.get("request_id").and_then(Value::as_str) else {
        warn!("group_rpc_resp without request_id");
        return;
    };
    let waiter = inner
        .waiters
        .lock()
        .expect("poisoned")
        .remove(request_id);
    let Some(waiter) = waiter else {
        // Late responses after a timeout are logged and dropped.
        debug!(request_id, "dropping late group rpc response");
        return;
    };

    let status = payload.get("status").and_then(Value::as_str).unwrap_or("err");
    let result = if status == "ok" {
        Ok(payload.get("data").cloned().unwrap_or(Value::Null))
    } else {
        let code = payload
            .pointer("/error/code")
            .and_then(Value::as_u64)
            .and_then(|code| ErrorCode::try_from(code as u16).ok())
            .unwrap_or(ErrorCode::Internal);
        let message = payload
            .pointer("/error/message")
            .and_then(Value::as_str)
            .unwrap_or("group rpc failed")
            .to_string();
        Err(AcpError::new(code, message))
    };
    let _ = waiter.send(result);
}

/// Stores a pushed batch and acks the highest id it carried, exactly
/// once. The local device may still be behind the global latest; the
/// next pull or notify resolves that.
async fn handle_batch(inner: &Arc<GroupClientInner>, batch: GroupMessageBatch) {
    let group_id = GroupId::new(batch.group_id.clone());
    let outcome = match inner
        .store
        .append_messages(&group_id, batch.messages.clone())
        .await
    {
        Ok(outcome) => outcome,
        Err(error) => {
            // Persistence failures never abort the wire protocol; the
            // in-memory state stays authoritative for this session.
            error!(%error, group_id = %group_id, "failed to persist batch");
            return;
        }
    };
    if let Err(error) = inner.store.advance_latest(&group_id, batch.latest_msg_id).await {
        warn!(%error, "failed to advance latest cursor");
    }

    inner
        .handlers
        .with_group_handler(|h| h.on_group_message_batch(&group_id, &batch));

    debug!(
        group_id = %group_id,
        appended = outcome.appended,
        last_id = outcome.last_id,
        "batch persisted"
    );
    let highest = batch.messages.iter().map(|m| m.msg_id).max();
    if let Some(highest) = highest {
        #[cfg(test)]
        inner
            .acks
            .lock()
            .expect("poisoned")
            .push((group_id.to_string(), highest));
        // The ack goes through the same rpc path; run it off the inbound
        // loop so the response can be dispatched.
        let inner = inner.clone();
        tokio::spawn(async move {
            let client = GroupClient { inner };
            if let Err(error) = client.ack_messages(&group_id, highest).await {
                warn!(%error, group_id = %group_id, "batch ack failed");
            }
        });
    }
}

fn group_id_of(payload: &Value) -> GroupId {
    GroupId::new(field_str(payload, "group_id"))
}

fn field_str(payload: &Value, field: &str) -> String {
    payload
        .get(field)
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

fn field_u64(payload: &Value, field: &str) -> u64 {
    payload.get(field).and_then(Value::as_u64).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use acpcommon::TimeStamp;

    use super::*;
    use crate::{handlers::GroupEventHandler, store::CertKeyStore};

    fn client() -> (tempfile::TempDir, GroupClient) {
        let dir = tempfile::tempdir().unwrap();
        let aid: Aid = "alice.ex.com".parse().unwrap();
        let files = CertKeyStore::new(dir.path());
        let store = GroupStore::new(aid.clone(), files);
        let client = GroupClient::new(
            aid,
            ChannelSlot::new(),
            store,
            HandlerRegistry::default(),
        );
        (dir, client)
    }

    fn batch_payload(group_id: &str, ids: &[u64]) -> Value {
        let messages: Vec<Value> = ids
            .iter()
            .map(|id| {
                serde_json::json!({
                    "msg_id": id,
                    "sender": "bob.ex.com",
                    "content": format!("m{id}"),
                    "content_type": "text",
                    "timestamp": 1_700_000_000_000i64 + *id as i64,
                })
            })
            .collect();
        serde_json::json!({
            "type": "group_message_batch",
            "group_id": group_id,
            "start_msg_id": ids.first().copied().unwrap_or(0),
            "latest_msg_id": ids.last().copied().unwrap_or(0),
            "count": ids.len(),
            "messages": messages,
        })
    }

    #[derive(Default)]
    struct RecordingHandler {
        batches: Mutex<Vec<(String, u64)>>,
    }

    impl GroupEventHandler for RecordingHandler {
        fn on_group_message_batch(
            &self,
            group_id: &GroupId,
            batch: &GroupMessageBatch,
        ) -> anyhow::Result<()> {
            self.batches
                .lock()
                .unwrap()
                .push((group_id.to_string(), batch.count));
            Ok(())
        }
    }

    #[tokio::test]
    async fn default_authority_derivation() {
        let (_dir, client) = client();
        assert_eq!(client.authority().to_string(), "group.ex.com");
    }

    #[tokio::test]
    async fn cross_ap_target_overrides_the_authority() {
        let (_dir, client) = client();
        let target: Aid = "group.other.org".parse().unwrap();
        client.init(Some(target.clone()), SessionId::new("gs1"));
        assert_eq!(client.authority(), target);
    }

    #[tokio::test]
    async fn rpc_without_init_is_rejected() {
        let (_dir, client) = client();
        let err = client
            .send_rpc("get_group_info", serde_json::json!({}))
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::NotInitialized);
    }

    #[tokio::test]
    async fn batch_is_stored_in_order_and_acked_once() {
        let (_dir, client) = client();
        let handler = Arc::new(RecordingHandler::default());
        // Pre-register interest through the registry the client holds.
        client
            .inner
            .handlers
            .set_group_event_handler(handler.clone());

        // Cursor starts at 100.
        let group = GroupId::new("g1");
        client
            .inner
            .store
            .append_messages(
                &group,
                (1..=100)
                    .map(|id| super::super::GroupMessage {
                        msg_id: id,
                        sender: "bob.ex.com".to_string(),
                        content: String::new(),
                        content_type: "text".to_string(),
                        timestamp: TimeStamp::from_millis(id as i64),
                        metadata: Value::Null,
                    })
                    .collect(),
            )
            .await
            .unwrap();

        dispatch(&client.inner, batch_payload("g1", &[101, 102, 103])).await;

        let stored = client.inner.store.read_messages(&group, 100, 10).await.unwrap();
        let ids: Vec<u64> = stored.iter().map(|m| m.msg_id).collect();
        assert_eq!(ids, vec![101, 102, 103]);

        let acks = client.inner.acks.lock().unwrap().clone();
        assert_eq!(acks, vec![("g1".to_string(), 103)]);

        let batches = handler.batches.lock().unwrap().clone();
        assert_eq!(batches, vec![("g1".to_string(), 3)]);
    }

    #[tokio::test]
    async fn duplicate_batch_appends_nothing() {
        let (_dir, client) = client();
        let group = GroupId::new("g1");
        dispatch(&client.inner, batch_payload("g1", &[1, 2])).await;
        dispatch(&client.inner, batch_payload("g1", &[1, 2])).await;

        let stored = client.inner.store.read_messages(&group, 0, 10).await.unwrap();
        assert_eq!(stored.len(), 2);
    }

    #[tokio::test]
    async fn rpc_response_resolves_its_waiter() {
        let (_dir, client) = client();
        let request_id = RequestId::random();
        let rx = client.inner.register_waiter(&request_id).unwrap();

        handle_rpc_resp(
            &client.inner,
            &serde_json::json!({
                "type": "group_rpc_resp",
                "request_id": request_id.to_string(),
                "status": "ok",
                "data": { "answer": 42 },
            }),
        );
        let result = rx.await.unwrap().unwrap();
        assert_eq!(result.pointer("/answer").and_then(Value::as_u64), Some(42));
    }

    #[tokio::test]
    async fn rpc_error_carries_the_server_code() {
        let (_dir, client) = client();
        let request_id = RequestId::random();
        let rx = client.inner.register_waiter(&request_id).unwrap();

        handle_rpc_resp(
            &client.inner,
            &serde_json::json!({
                "type": "group_rpc_resp",
                "request_id": request_id.to_string(),
                "status": "err",
                "error": { "code": 4004, "message": "no such group" },
            }),
        );
        let error = rx.await.unwrap().unwrap_err();
        assert_eq!(error.code(), ErrorCode::GroupNotFound);
        assert_eq!(error.message, "no such group");
    }

    #[tokio::test]
    async fn hook_claims_only_authority_frames() {
        let (_dir, client) = client();
        let hook = client.raw_hook();

        let from_authority = SessionMessage {
            session_id: "gs1".to_string(),
            sender: "group.ex.com".to_string(),
            receiver: None,
            message: "{\"type\":\"new_message\",\"group_id\":\"g1\"}".to_string(),
            timestamp: 0,
            instruction: None,
            request_id: None,
        };
        assert!(hook.intercept(&from_authority));

        let from_peer = SessionMessage {
            sender: "bob.ex.com".to_string(),
            ..from_authority
        };
        assert!(!hook.intercept(&from_peer));
    }
}
