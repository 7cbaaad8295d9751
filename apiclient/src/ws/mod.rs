// SPDX-FileCopyrightText: 2025 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

//! The WebSocket message channel.
//!
//! One channel per online agent. A single connection task owns the
//! socket; outbound frames flow through an mpsc queue (preserving
//! submission order) and request/ack correlation happens in one
//! dispatcher that maps `request_id` to a completion slot. On unclean
//! close the task runs the fast-retry policy and finally raises a
//! reauth-needed event for the supervisor.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, RwLock},
    time::Duration,
};

use acpcommon::{
    AcpError, ErrorCode, RequestId,
    identifiers::{Aid, SessionId},
};
use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::{
    net::TcpStream,
    sync::{broadcast, mpsc, oneshot, watch},
    task::JoinHandle,
    time::{sleep, timeout},
};
use tokio_tungstenite::{
    MaybeTlsStream, WebSocketStream, connect_async_tls_with_config,
    tungstenite::protocol::Message,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub mod frame;
mod tls;

pub use frame::{Frame, SessionMessage, cmd};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const FAST_RETRIES: u32 = 5;
const MAX_PENDING_WAITERS: usize = 256;
const OUTBOUND_QUEUE: usize = 128;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelStatus {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Error,
}

#[derive(Debug, Clone)]
pub enum ChannelEvent {
    /// A `session_message` that was not claimed by the raw hook.
    SessionMessage(SessionMessage),
    /// Any other frame that is not an ack.
    Frame(Frame),
    /// Fast retries are exhausted; a fresh sign-in is required.
    ReauthNeeded,
}

#[derive(Error, Debug)]
pub enum WsError {
    #[error("websocket connect failed: {0}")]
    ConnectFailed(String),
    #[error("websocket is disconnected")]
    Disconnected,
    #[error("websocket send failed: {0}")]
    SendFailed(String),
    #[error("timed out waiting for ack")]
    Timeout,
}

impl From<WsError> for AcpError {
    fn from(error: WsError) -> Self {
        let code = match &error {
            WsError::ConnectFailed(_) => ErrorCode::WsConnectFailed,
            WsError::Disconnected => ErrorCode::WsDisconnected,
            WsError::SendFailed(_) => ErrorCode::WsSendFailed,
            WsError::Timeout => ErrorCode::WsTimeout,
        };
        AcpError::new(code, error.to_string())
    }
}

/// Hook run on every incoming `session_message` before normal dispatch.
/// Returning `true` claims the message and skips dispatch. The group
/// client registers itself here to pick raw protocol frames out of the
/// stream.
pub trait RawMessageHook: Send + Sync {
    fn intercept(&self, message: &SessionMessage) -> bool;
}

#[derive(Debug, Clone)]
pub struct MessageChannelConfig {
    /// `host[:port]`, no scheme.
    pub message_server: String,
    pub aid: Aid,
    pub signature: String,
    pub use_tls: bool,
    /// Accept self-signed certificates; test servers only.
    pub danger_accept_invalid_certs: bool,
}

impl MessageChannelConfig {
    fn url(&self) -> String {
        let scheme = if self.use_tls { "wss" } else { "ws" };
        let agent_id: String =
            url::form_urlencoded::byte_serialize(self.aid.to_string().as_bytes()).collect();
        let signature: String =
            url::form_urlencoded::byte_serialize(self.signature.as_bytes()).collect();
        format!(
            "{scheme}://{}/session?agent_id={agent_id}&signature={signature}",
            self.message_server
        )
    }
}

struct Waiter {
    expected_cmd: String,
    tx: oneshot::Sender<Frame>,
}

struct ChannelInner {
    status: watch::Sender<ChannelStatus>,
    events: broadcast::Sender<ChannelEvent>,
    outbound: mpsc::Sender<Message>,
    waiters: Mutex<HashMap<String, Waiter>>,
    raw_hook: RwLock<Option<Arc<dyn RawMessageHook>>>,
    cancel: CancellationToken,
}

/// Handle to a live message channel.
pub struct MessageChannel {
    config: MessageChannelConfig,
    inner: Arc<ChannelInner>,
    handle: JoinHandle<()>,
}

impl MessageChannel {
    /// Establishes the WebSocket connection and spawns the connection
    /// task. Fails with [`WsError::ConnectFailed`] if the first
    /// connection cannot be made within the connect timeout.
    pub async fn connect(config: MessageChannelConfig) -> Result<Self, WsError> {
        let (status, _) = watch::channel(ChannelStatus::Connecting);
        let (events, _) = broadcast::channel(256);
        let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_QUEUE);

        let stream = open_stream(&config).await?;
        info!(aid = %config.aid, server = %config.message_server, "message channel connected");

        let inner = Arc::new(ChannelInner {
            status,
            events,
            outbound: outbound_tx,
            waiters: Mutex::new(HashMap::new()),
            raw_hook: RwLock::new(None),
            cancel: CancellationToken::new(),
        });
        inner.status.send_replace(ChannelStatus::Connected);

        let task = ConnectionTask {
            config: config.clone(),
            inner: inner.clone(),
            outbound: outbound_rx,
        };
        let handle = tokio::spawn(task.run(stream));

        Ok(Self {
            config,
            inner,
            handle,
        })
    }

    pub fn status(&self) -> watch::Receiver<ChannelStatus> {
        self.inner.status.subscribe()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ChannelEvent> {
        self.inner.events.subscribe()
    }

    /// Installs the pre-dispatch hook for raw protocol frames.
    pub fn set_raw_hook(&self, hook: Arc<dyn RawMessageHook>) {
        *self.inner.raw_hook.write().expect("poisoned") = Some(hook);
    }

    /// Sends a frame without waiting for a response.
    pub async fn send_frame(&self, frame: &Frame) -> Result<(), WsError> {
        self.inner.send_frame(frame).await
    }

    /// Sends a `session_message` whose payload is raw JSON, not
    /// URL-encoded. Group protocol frames go through here.
    pub async fn send_raw(
        &self,
        payload: &serde_json::Value,
        receiver: &Aid,
        session_id: &SessionId,
    ) -> Result<(), WsError> {
        let message = SessionMessage {
            session_id: session_id.to_string(),
            sender: self.config.aid.to_string(),
            receiver: Some(receiver.to_string()),
            message: payload.to_string(),
            timestamp: acpcommon::TimeStamp::now().as_millis(),
            instruction: None,
            request_id: Some(RequestId::random().to_string()),
        };
        self.send_frame(&message.into_frame()).await
    }

    /// Sends a request frame and suspends until the matching ack arrives
    /// or the timeout elapses. Waiters with distinct request ids are
    /// independent; each receives only its own ack.
    pub async fn send_and_wait_ack(
        &self,
        frame: &Frame,
        expected_cmd: &str,
        request_id: &RequestId,
        wait: Duration,
    ) -> Result<Frame, WsError> {
        let rx = self
            .inner
            .register_waiter(request_id.as_str(), expected_cmd)?;
        if let Err(error) = self.inner.send_frame(frame).await {
            self.inner.remove_waiter(request_id.as_str());
            return Err(error);
        }
        match timeout(wait, rx).await {
            Ok(Ok(ack)) => Ok(ack),
            // Waiter dropped during reconnect.
            Ok(Err(_)) => Err(WsError::Timeout),
            Err(_) => {
                self.inner.remove_waiter(request_id.as_str());
                Err(WsError::Timeout)
            }
        }
    }

    /// Closes the channel. The connection task observes the flag, sends
    /// a close frame and drops all pending waiters.
    pub fn close(&self) {
        self.inner.cancel.cancel();
    }

    /// Waits for the connection task to finish after [`Self::close`].
    pub async fn join(self) -> Result<(), tokio::task::JoinError> {
        self.handle.await
    }

    pub fn aid(&self) -> &Aid {
        &self.config.aid
    }
}

impl ChannelInner {
    fn register_waiter(
        &self,
        request_id: &str,
        expected_cmd: &str,
    ) -> Result<oneshot::Receiver<Frame>, WsError> {
        let mut waiters = self.waiters.lock().expect("poisoned");
        if waiters.len() >= MAX_PENDING_WAITERS {
            return Err(WsError::SendFailed(format!(
                "too many requests in flight ({MAX_PENDING_WAITERS})"
            )));
        }
        let (tx, rx) = oneshot::channel();
        waiters.insert(
            request_id.to_string(),
            Waiter {
                expected_cmd: expected_cmd.to_string(),
                tx,
            },
        );
        Ok(rx)
    }

    fn remove_waiter(&self, request_id: &str) {
        self.waiters.lock().expect("poisoned").remove(request_id);
    }

    /// Resolves every pending waiter by dropping its completion slot.
    fn flush_waiters(&self) {
        let mut waiters = self.waiters.lock().expect("poisoned");
        let flushed = waiters.len();
        waiters.clear();
        if flushed > 0 {
            debug!(flushed, "dropped in-flight waiters on disconnect");
        }
    }

    async fn send_frame(&self, frame: &Frame) -> Result<(), WsError> {
        let text = serde_json::to_string(frame)
            .map_err(|e| WsError::SendFailed(e.to_string()))?;
        self.outbound
            .send(Message::Text(text))
            .await
            .map_err(|_| WsError::Disconnected)
    }

    /// Dispatches one incoming text frame: acks wake their waiter,
    /// session messages run through the raw hook, everything else is
    /// broadcast.
    fn dispatch_incoming(&self, text: &str) {
        let frame: Frame = match serde_json::from_str(text) {
            Ok(frame) => frame,
            Err(error) => {
                warn!(%error, "undecodable frame");
                return;
            }
        };

        if frame.is_ack() {
            let Some(request_id) = frame.request_id().map(str::to_string) else {
                warn!(cmd = %frame.cmd, "ack without request_id");
                return;
            };
            let waiter = self
                .waiters
                .lock()
                .expect("poisoned")
                .remove(&request_id);
            match waiter {
                Some(waiter) if waiter.expected_cmd == frame.cmd => {
                    let _ = waiter.tx.send(frame);
                }
                Some(waiter) => {
                    warn!(cmd = %frame.cmd, expected = %waiter.expected_cmd,
                        "ack command mismatch");
                }
                // Late or duplicate ack.
                None => debug!(cmd = %frame.cmd, %request_id, "dropping unmatched ack"),
            }
            return;
        }

        if frame.cmd == cmd::SESSION_MESSAGE {
            let Some(message) = SessionMessage::from_frame(&frame) else {
                warn!("malformed session_message");
                return;
            };
            let hook = self.raw_hook.read().expect("poisoned").clone();
            if let Some(hook) = hook {
                if hook.intercept(&message) {
                    return;
                }
            }
            let _ = self.events.send(ChannelEvent::SessionMessage(message));
            return;
        }

        let _ = self.events.send(ChannelEvent::Frame(frame));
    }
}

struct ConnectionTask {
    config: MessageChannelConfig,
    inner: Arc<ChannelInner>,
    outbound: mpsc::Receiver<Message>,
}

enum IoExit {
    Cancelled,
    StreamClosed,
}

impl ConnectionTask {
    async fn run(mut self, first_stream: WsStream) {
        let mut stream = Some(first_stream);
        loop {
            let current = match stream.take() {
                Some(stream) => stream,
                None => match self.reconnect().await {
                    Some(stream) => stream,
                    None => return,
                },
            };

            self.inner.status.send_replace(ChannelStatus::Connected);
            match self.run_io(current).await {
                IoExit::Cancelled => {
                    self.inner.status.send_replace(ChannelStatus::Disconnected);
                    self.inner.flush_waiters();
                    return;
                }
                IoExit::StreamClosed => {
                    self.inner.status.send_replace(ChannelStatus::Reconnecting);
                    self.inner.flush_waiters();
                }
            }
        }
    }

    /// Fast-retry sequence. Returns `None` when retries are exhausted
    /// (after signalling the supervisor) or the channel is cancelled.
    async fn reconnect(&self) -> Option<WsStream> {
        for attempt in 1..=FAST_RETRIES {
            let delay = Duration::from_secs(attempt as u64);
            tokio::select! {
                _ = self.inner.cancel.cancelled() => {
                    self.inner.status.send_replace(ChannelStatus::Disconnected);
                    return None;
                }
                _ = sleep(delay) => {}
            }
            match open_stream(&self.config).await {
                Ok(stream) => {
                    info!(attempt, "message channel reconnected");
                    return Some(stream);
                }
                Err(error) => {
                    warn!(attempt, %error, "fast retry failed");
                }
            }
        }
        // The signature may have been revoked; only a fresh sign-in can
        // tell.
        warn!("fast retries exhausted, requesting re-authentication");
        let _ = self.inner.events.send(ChannelEvent::ReauthNeeded);
        self.inner.status.send_replace(ChannelStatus::Error);
        None
    }

    async fn run_io(&mut self, stream: WsStream) -> IoExit {
        let (mut sink, mut source) = stream.split();
        loop {
            tokio::select! {
                _ = self.inner.cancel.cancelled() => {
                    let _ = sink.send(Message::Close(None)).await;
                    return IoExit::Cancelled;
                }
                outgoing = self.outbound.recv() => {
                    match outgoing {
                        Some(message) => {
                            if let Err(error) = sink.send(message).await {
                                error!(%error, "websocket send failed");
                                return IoExit::StreamClosed;
                            }
                        }
                        // All senders dropped; the channel handle is gone.
                        None => return IoExit::Cancelled,
                    }
                }
                incoming = source.next() => {
                    match incoming {
                        Some(Ok(Message::Text(text))) => {
                            self.inner.dispatch_incoming(&text);
                        }
                        Some(Ok(Message::Ping(_)) | Ok(Message::Pong(_))) => {}
                        Some(Ok(Message::Close(_))) | None => {
                            info!("websocket closed by server");
                            return IoExit::StreamClosed;
                        }
                        Some(Ok(_)) => {}
                        Some(Err(error)) => {
                            error!(%error, "websocket read failed");
                            return IoExit::StreamClosed;
                        }
                    }
                }
            }
        }
    }
}

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

async fn open_stream(config: &MessageChannelConfig) -> Result<WsStream, WsError> {
    let connector = tls::connector(config)?;
    let connect = connect_async_tls_with_config(config.url(), None, false, connector);
    match timeout(CONNECT_TIMEOUT, connect).await {
        Ok(Ok((stream, _response))) => Ok(stream),
        Ok(Err(error)) => Err(WsError::ConnectFailed(error.to_string())),
        Err(_) => Err(WsError::ConnectFailed("connect timeout".to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_inner() -> (Arc<ChannelInner>, mpsc::Receiver<Message>) {
        let (status, _) = watch::channel(ChannelStatus::Connected);
        let (events, _) = broadcast::channel(16);
        let (outbound, outbound_rx) = mpsc::channel(16);
        (
            Arc::new(ChannelInner {
                status,
                events,
                outbound,
                waiters: Mutex::new(HashMap::new()),
                raw_hook: RwLock::new(None),
                cancel: CancellationToken::new(),
            }),
            outbound_rx,
        )
    }

    fn ack(cmd: &str, request_id: &str) -> String {
        serde_json::json!({
            "cmd": cmd,
            "data": { "request_id": request_id, "status_code": 200 },
        })
        .to_string()
    }

    #[tokio::test]
    async fn waiters_with_distinct_request_ids_are_independent() {
        let (inner, _outbound) = test_inner();
        let rx_a = inner.register_waiter("aaaa", "create_session_ack").unwrap();
        let rx_b = inner.register_waiter("bbbb", "create_session_ack").unwrap();

        inner.dispatch_incoming(&ack("create_session_ack", "bbbb"));
        let frame_b = rx_b.await.unwrap();
        assert_eq!(frame_b.request_id(), Some("bbbb"));

        inner.dispatch_incoming(&ack("create_session_ack", "aaaa"));
        let frame_a = rx_a.await.unwrap();
        assert_eq!(frame_a.request_id(), Some("aaaa"));
    }

    #[tokio::test]
    async fn duplicate_acks_are_dropped() {
        let (inner, _outbound) = test_inner();
        let rx = inner.register_waiter("cccc", "invite_agent_ack").unwrap();
        inner.dispatch_incoming(&ack("invite_agent_ack", "cccc"));
        // Second ack for the same request id finds no waiter.
        inner.dispatch_incoming(&ack("invite_agent_ack", "cccc"));
        assert!(rx.await.is_ok());
    }

    #[tokio::test]
    async fn mismatched_ack_command_does_not_resolve_the_waiter() {
        let (inner, _outbound) = test_inner();
        let rx = inner.register_waiter("dddd", "create_session_ack").unwrap();
        inner.dispatch_incoming(&ack("get_member_list_ack", "dddd"));
        // The waiter was consumed but its slot dropped without a frame.
        assert!(rx.await.is_err());
    }

    #[tokio::test]
    async fn waiter_table_is_bounded() {
        let (inner, _outbound) = test_inner();
        for i in 0..MAX_PENDING_WAITERS {
            inner
                .register_waiter(&format!("req-{i}"), "create_session_ack")
                .unwrap();
        }
        let overflow = inner.register_waiter("one-too-many", "create_session_ack");
        assert!(matches!(overflow, Err(WsError::SendFailed(_))));
    }

    struct ClaimAll;
    impl RawMessageHook for ClaimAll {
        fn intercept(&self, _message: &SessionMessage) -> bool {
            true
        }
    }

    #[tokio::test]
    async fn raw_hook_claims_session_messages() {
        let (inner, _outbound) = test_inner();
        let mut events = inner.events.subscribe();
        *inner.raw_hook.write().unwrap() = Some(Arc::new(ClaimAll));

        let text = serde_json::json!({
            "cmd": "session_message",
            "data": {
                "session_id": "s1",
                "sender": "group.ex.com",
                "message": "{\"type\":\"new_message\"}",
                "timestamp": 0,
            },
        })
        .to_string();
        inner.dispatch_incoming(&text);
        // Nothing was broadcast.
        assert!(matches!(
            events.try_recv(),
            Err(broadcast::error::TryRecvError::Empty)
        ));
    }

    #[test]
    fn url_encodes_query_params() {
        let config = MessageChannelConfig {
            message_server: "msg.ex.com".to_string(),
            aid: "alice.ex.com".parse().unwrap(),
            signature: "a+b/c=".to_string(),
            use_tls: true,
            danger_accept_invalid_certs: false,
        };
        assert_eq!(
            config.url(),
            "wss://msg.ex.com/session?agent_id=alice.ex.com&signature=a%2Bb%2Fc%3D"
        );
    }
}
