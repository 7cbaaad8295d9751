// SPDX-FileCopyrightText: 2025 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

//! The lifecycle supervisor. One serialized state machine per agent
//! drives sign-in, channel bring-up and recovery. Every trigger, whether
//! a user call or a transport failure, arrives as an event on a single
//! queue, so reconnects cannot re-enter each other.

use std::sync::Arc;

use acpcommon::{AcpError, ErrorCode, crypto, identifiers::Aid};
use acpapiclient::{
    heartbeat::{HeartbeatChannel, HeartbeatEvent},
    ws::{ChannelEvent, MessageChannel, MessageChannelConfig},
};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    channel::ChannelSlot,
    groups::GroupClient,
    handlers::{HandlerRegistry, InviteDecision},
    identity::{AgentIdentity, ConnectionConfig, IdentityManagerConfig, online_handshake},
    sessions::SessionManager,
};
use acpcommon::identifiers::SessionId;

/// Connection state of an agent runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AgentState {
    Offline,
    Connecting,
    Authenticating,
    Online,
    Reconnecting,
    Error,
}

/// Re-authentication attempts before the supervisor gives up.
const REAUTH_ATTEMPTS: u32 = 6;

pub(crate) enum Trigger {
    Online(oneshot::Sender<Result<(), AcpError>>),
    Offline(oneshot::Sender<()>),
    HeartbeatDead,
    ReauthNeeded,
}

/// Handle to the supervisor task.
pub(crate) struct Supervisor {
    triggers: mpsc::UnboundedSender<Trigger>,
    state: watch::Receiver<AgentState>,
}

impl Supervisor {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn spawn(
        identity: Arc<AgentIdentity>,
        config: IdentityManagerConfig,
        channel: ChannelSlot,
        sessions: SessionManager,
        groups: GroupClient,
        handlers: HandlerRegistry,
        invalidated: CancellationToken,
    ) -> Self {
        let (state_tx, state_rx) = watch::channel(AgentState::Offline);
        let (triggers_tx, triggers_rx) = mpsc::unbounded_channel();
        let task = SupervisorTask {
            identity,
            config,
            channel,
            sessions,
            groups,
            handlers,
            state: state_tx,
            triggers: triggers_tx.clone(),
            invalidated,
            connection: None,
        };
        tokio::spawn(task.run(triggers_rx));
        Self {
            triggers: triggers_tx,
            state: state_rx,
        }
    }

    pub(crate) async fn online(&self) -> Result<(), AcpError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.triggers
            .send(Trigger::Online(reply_tx))
            .map_err(|_| AcpError::new(ErrorCode::NotInitialized, "supervisor stopped"))?;
        reply_rx
            .await
            .map_err(|_| AcpError::new(ErrorCode::NotInitialized, "supervisor stopped"))?
    }

    pub(crate) async fn offline(&self) {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self.triggers.send(Trigger::Offline(reply_tx)).is_ok() {
            let _ = reply_rx.await;
        }
    }

    pub(crate) fn state(&self) -> AgentState {
        *self.state.borrow()
    }

    pub(crate) fn subscribe(&self) -> watch::Receiver<AgentState> {
        self.state.clone()
    }
}

struct Connection {
    heartbeat: Arc<HeartbeatChannel>,
    channel: Arc<MessageChannel>,
    pumps: CancellationToken,
    message_signature: String,
}

struct SupervisorTask {
    identity: Arc<AgentIdentity>,
    config: IdentityManagerConfig,
    channel: ChannelSlot,
    sessions: SessionManager,
    groups: GroupClient,
    handlers: HandlerRegistry,
    state: watch::Sender<AgentState>,
    triggers: mpsc::UnboundedSender<Trigger>,
    invalidated: CancellationToken,
    connection: Option<Connection>,
}

impl SupervisorTask {
    async fn run(mut self, mut triggers: mpsc::UnboundedReceiver<Trigger>) {
        loop {
            tokio::select! {
                _ = self.invalidated.cancelled() => {
                    self.teardown().await;
                    self.set_state(AgentState::Offline);
                    return;
                }
                trigger = triggers.recv() => {
                    match trigger {
                        Some(trigger) => self.handle(trigger).await,
                        None => {
                            self.teardown().await;
                            return;
                        }
                    }
                }
            }
        }
    }

    async fn handle(&mut self, trigger: Trigger) {
        match trigger {
            Trigger::Online(reply) => {
                if self.state() == AgentState::Online {
                    let _ = reply.send(Ok(()));
                    return;
                }
                let result = self.go_online().await;
                if let Err(error) = &result {
                    error!(%error, "online failed");
                    self.set_state(if error.code() == ErrorCode::CertError {
                        AgentState::Error
                    } else {
                        AgentState::Offline
                    });
                }
                let _ = reply.send(result);
            }
            Trigger::Offline(reply) => {
                self.sign_out().await;
                self.teardown().await;
                self.set_state(AgentState::Offline);
                let _ = reply.send(());
            }
            Trigger::HeartbeatDead | Trigger::ReauthNeeded => {
                // Stale triggers from an already-replaced connection are
                // dropped here; the queue serialises recoveries.
                if self.state() != AgentState::Online {
                    debug!("ignoring reconnect trigger outside Online");
                    return;
                }
                self.recover().await;
            }
        }
    }

    fn state(&self) -> AgentState {
        *self.state.borrow()
    }

    fn set_state(&self, state: AgentState) {
        let changed = self.state.send_replace(state) != state;
        if changed {
            info!(?state, aid = %self.identity.aid(), "agent state changed");
            self.handlers.dispatch_state_change(state);
        }
    }

    async fn go_online(&mut self) -> Result<(), AcpError> {
        self.set_state(AgentState::Connecting);
        self.set_state(AgentState::Authenticating);
        let connection_config = online_handshake(&self.config, &self.identity).await?;
        self.bring_up(connection_config).await?;
        self.set_state(AgentState::Online);
        Ok(())
    }

    /// Tears the dead connection down and runs the re-auth loop: fresh
    /// sign-in, fresh signature, fresh channels.
    async fn recover(&mut self) {
        self.set_state(AgentState::Reconnecting);
        self.teardown().await;

        let mut delay = backoff();
        for attempt in 1..=REAUTH_ATTEMPTS {
            if self.invalidated.is_cancelled() {
                return;
            }
            tokio::time::sleep(delay.next().expect("infinite")).await;

            match online_handshake(&self.config, &self.identity).await {
                Ok(connection_config) => match self.bring_up(connection_config).await {
                    Ok(()) => {
                        self.set_state(AgentState::Online);
                        return;
                    }
                    Err(error) => {
                        warn!(attempt, %error, "channel bring-up failed");
                    }
                },
                Err(error) if error.code() == ErrorCode::CertError => {
                    // Identity corruption is fatal, never retried.
                    error!(%error, "fatal error during re-authentication");
                    self.set_state(AgentState::Error);
                    return;
                }
                Err(error) => {
                    warn!(attempt, %error, "re-authentication failed");
                }
            }
        }
        error!("re-authentication attempts exhausted");
        self.set_state(AgentState::Error);
    }

    async fn bring_up(&mut self, connection: ConnectionConfig) -> Result<(), AcpError> {
        let aid = self.identity.aid().clone();
        let sign_cookie = sign_cookie(&aid, &connection.message_signature);

        let heartbeat = HeartbeatChannel::spawn(
            &connection.heartbeat_server,
            aid.clone(),
            sign_cookie,
        )
        .await
        .map_err(|error| AcpError::new(ErrorCode::HbAuthFailed, error.to_string()))?;
        let heartbeat = Arc::new(heartbeat);

        let channel = MessageChannel::connect(MessageChannelConfig {
            message_server: connection.message_server.clone(),
            aid: aid.clone(),
            signature: connection.message_signature.clone(),
            use_tls: self.config.use_tls,
            danger_accept_invalid_certs: self.config.danger_accept_invalid_certs,
        })
        .await
        .map_err(AcpError::from)?;
        let channel = Arc::new(channel);

        channel.set_raw_hook(self.groups.raw_hook());
        self.channel.install(channel.clone());

        let pumps = CancellationToken::new();
        tokio::spawn(pump_channel_events(
            channel.subscribe(),
            self.sessions.clone(),
            self.handlers.clone(),
            self.triggers.clone(),
            pumps.clone(),
        ));
        tokio::spawn(pump_heartbeat_events(
            heartbeat.clone(),
            self.sessions.clone(),
            self.handlers.clone(),
            self.triggers.clone(),
            pumps.clone(),
        ));

        self.connection = Some(Connection {
            heartbeat,
            channel,
            pumps,
            message_signature: connection.message_signature,
        });

        // P2P sessions are held server-side; group presence has expired
        // and must be re-recorded.
        self.groups.rejoin_after_reconnect().await;
        Ok(())
    }

    /// Best-effort token invalidation on a deliberate offline.
    async fn sign_out(&self) {
        let Some(connection) = &self.connection else {
            return;
        };
        let Ok(ap) = self.config.api_client(&self.config.ap_base) else {
            return;
        };
        if let Err(error) = ap
            .sign_out(self.identity.aid(), &connection.message_signature)
            .await
        {
            debug!(%error, "sign_out failed");
        }
    }

    async fn teardown(&mut self) {
        self.channel.clear();
        if let Some(connection) = self.connection.take() {
            connection.pumps.cancel();
            connection.heartbeat.stop();
            connection.channel.close();
        }
    }
}

/// Low 64 bits of `sha256(aid || signature)`; stable per sign-in and
/// echoed in heartbeat frames.
fn sign_cookie(aid: &Aid, signature: &str) -> u64 {
    let digest = crypto::sha256(format!("{aid}{signature}").as_bytes());
    u64::from_be_bytes(digest[..8].try_into().expect("sha256 is 32 bytes"))
}

/// Fibonacci delays for the re-auth loop, in seconds.
fn backoff() -> impl Iterator<Item = std::time::Duration> {
    let mut pair = (1u64, 1u64);
    std::iter::from_fn(move || {
        let delay = pair.0;
        pair = (pair.1, pair.0 + pair.1);
        Some(std::time::Duration::from_secs(delay.min(60)))
    })
}

async fn pump_channel_events(
    mut events: broadcast::Receiver<ChannelEvent>,
    sessions: SessionManager,
    handlers: HandlerRegistry,
    triggers: mpsc::UnboundedSender<Trigger>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            event = events.recv() => match event {
                Ok(ChannelEvent::SessionMessage(message)) => {
                    if let Some(incoming) = sessions.handle_incoming(&message).await {
                        handlers.dispatch_message(&incoming);
                    }
                }
                Ok(ChannelEvent::ReauthNeeded) => {
                    let _ = triggers.send(Trigger::ReauthNeeded);
                }
                Ok(ChannelEvent::Frame(frame)) => {
                    debug!(cmd = %frame.cmd, "unhandled channel frame");
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "channel event pump lagged");
                }
                Err(broadcast::error::RecvError::Closed) => return,
            }
        }
    }
}

async fn pump_heartbeat_events(
    heartbeat: Arc<HeartbeatChannel>,
    sessions: SessionManager,
    handlers: HandlerRegistry,
    triggers: mpsc::UnboundedSender<Trigger>,
    cancel: CancellationToken,
) {
    let mut events = heartbeat.subscribe();
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            event = events.recv() => match event {
                Ok(HeartbeatEvent::Beat { .. }) => {}
                Ok(HeartbeatEvent::Dead) => {
                    let _ = triggers.send(Trigger::HeartbeatDead);
                    return;
                }
                Ok(HeartbeatEvent::Invite(invite)) => {
                    if handlers.dispatch_invite(&invite) != InviteDecision::Accept {
                        continue;
                    }
                    if let Err(error) = heartbeat.accept_invite(invite.clone()).await {
                        warn!(%error, "invite response failed");
                    }
                    let session_id = SessionId::new(invite.session_id.clone());
                    if let Err(error) =
                        sessions.join_session(&session_id, &invite.invite_code).await
                    {
                        warn!(%error, session_id = %session_id, "invited join failed");
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "heartbeat event pump lagged");
                }
                Err(broadcast::error::RecvError::Closed) => return,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sign_cookie_is_stable_per_signature() {
        let aid: Aid = "alice.ex.com".parse().unwrap();
        let a = sign_cookie(&aid, "token-1");
        let b = sign_cookie(&aid, "token-1");
        let c = sign_cookie(&aid, "token-2");
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn backoff_is_fibonacci_capped() {
        let delays: Vec<u64> = backoff().take(7).map(|d| d.as_secs()).collect();
        assert_eq!(delays, vec![1, 1, 2, 3, 5, 8, 13]);
    }
}
