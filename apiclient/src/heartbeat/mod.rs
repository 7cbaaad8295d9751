// SPDX-FileCopyrightText: 2025 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

//! UDP keepalive channel to the heartbeat server.
//!
//! A background task beats every five seconds (or at the server-provided
//! cadence) and listens for relayed session invitations. Three
//! consecutive missed responses mark the channel dead; the supervisor
//! reacts by reconnecting.

use std::time::Duration;

use acpcommon::identifiers::Aid;
use thiserror::Error;
use tokio::{
    net::UdpSocket,
    sync::{broadcast, mpsc},
    task::JoinHandle,
    time::interval,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub mod wire;

pub use wire::InviteReq;

use wire::HeartbeatMessage;

const DEFAULT_BEAT_INTERVAL: Duration = Duration::from_secs(5);
const MAX_MISSED_RESPONSES: u32 = 3;
const MAX_DATAGRAM: usize = 2048;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeartbeatEvent {
    /// The server acknowledged a beat.
    Beat { seq: u64 },
    /// Three consecutive responses were missed; the channel stopped.
    Dead,
    /// A session invitation was relayed by the server.
    Invite(InviteReq),
}

#[derive(Error, Debug)]
pub enum HeartbeatError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("heartbeat channel is stopped")]
    Stopped,
}

enum Command {
    AcceptInvite(InviteReq),
}

/// Handle to a running heartbeat channel. Dropping the handle does not
/// stop the channel; call [`HeartbeatChannel::stop`].
pub struct HeartbeatChannel {
    events: broadcast::Sender<HeartbeatEvent>,
    commands: mpsc::Sender<Command>,
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl HeartbeatChannel {
    /// Binds a local UDP socket and starts beating against
    /// `heartbeat_server` (`host:port`).
    pub async fn spawn(
        heartbeat_server: &str,
        aid: Aid,
        sign_cookie: u64,
    ) -> Result<Self, HeartbeatError> {
        let socket = UdpSocket::bind("0.0.0.0:0").await?;
        socket.connect(heartbeat_server).await?;
        info!(%aid, server = heartbeat_server, "heartbeat channel up");

        let (events, _) = broadcast::channel(64);
        let (commands_tx, commands_rx) = mpsc::channel(16);
        let cancel = CancellationToken::new();

        let task = BeatTask {
            socket,
            aid,
            sign_cookie,
            events: events.clone(),
            commands: commands_rx,
            cancel: cancel.clone(),
        };
        let handle = tokio::spawn(task.run());

        Ok(Self {
            events,
            commands: commands_tx,
            cancel,
            handle,
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<HeartbeatEvent> {
        self.events.subscribe()
    }

    /// Replies to a relayed invitation with an `INVITE_RESP`, accepting it
    /// on the message channel.
    pub async fn accept_invite(&self, invite: InviteReq) -> Result<(), HeartbeatError> {
        self.commands
            .send(Command::AcceptInvite(invite))
            .await
            .map_err(|_| HeartbeatError::Stopped)
    }

    /// Stops the send loop. The stop flag is observed before the next
    /// tick.
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    pub async fn join(self) -> Result<(), tokio::task::JoinError> {
        self.handle.await
    }
}

struct BeatTask {
    socket: UdpSocket,
    aid: Aid,
    sign_cookie: u64,
    events: broadcast::Sender<HeartbeatEvent>,
    commands: mpsc::Receiver<Command>,
    cancel: CancellationToken,
}

impl BeatTask {
    async fn run(mut self) {
        let mut ticker = interval(DEFAULT_BEAT_INTERVAL);
        let mut seq: u64 = 0;
        let mut misses: u32 = 0;
        let mut awaiting_response = false;
        let mut buf = [0u8; MAX_DATAGRAM];

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    debug!(aid = %self.aid, "heartbeat channel stopped");
                    return;
                }
                _ = ticker.tick() => {
                    if awaiting_response {
                        misses += 1;
                        if misses >= MAX_MISSED_RESPONSES {
                            warn!(aid = %self.aid, misses, "heartbeat dead");
                            let _ = self.events.send(HeartbeatEvent::Dead);
                            return;
                        }
                    }
                    seq += 1;
                    let req = HeartbeatMessage::HeartbeatReq {
                        aid: self.aid.to_string(),
                        sign_cookie: self.sign_cookie,
                    };
                    if let Err(error) = self.socket.send(&wire::encode(&req, seq)).await {
                        error!(%error, "heartbeat send failed");
                        misses += 1;
                    } else {
                        awaiting_response = true;
                    }
                }
                received = self.socket.recv(&mut buf) => {
                    match received {
                        Ok(len) => {
                            if let Some(next_beat) =
                                self.handle_datagram(&buf[..len], seq)
                            {
                                awaiting_response = false;
                                misses = 0;
                                if next_beat > 0 {
                                    ticker = interval(Duration::from_secs(next_beat));
                                    // The first tick of a fresh interval fires
                                    // immediately; consume it.
                                    ticker.tick().await;
                                }
                            }
                        }
                        Err(error) => {
                            error!(%error, "heartbeat recv failed");
                        }
                    }
                }
                command = self.commands.recv() => {
                    match command {
                        Some(Command::AcceptInvite(invite)) => {
                            seq += 1;
                            let resp = HeartbeatMessage::InviteResp {
                                aid: self.aid.to_string(),
                                inviter: invite.inviter,
                                session_id: invite.session_id,
                                sign_cookie: self.sign_cookie,
                            };
                            if let Err(error) =
                                self.socket.send(&wire::encode(&resp, seq)).await
                            {
                                error!(%error, "invite response send failed");
                            }
                        }
                        None => {
                            // All handles dropped; nothing left to serve.
                            return;
                        }
                    }
                }
            }
        }
    }

    /// Returns `Some(next_beat)` when the datagram acknowledged a beat.
    fn handle_datagram(&self, datagram: &[u8], seq: u64) -> Option<u64> {
        match wire::decode(datagram) {
            Ok((_, HeartbeatMessage::HeartbeatResp { next_beat })) => {
                let _ = self.events.send(HeartbeatEvent::Beat { seq });
                Some(next_beat)
            }
            Ok((_, HeartbeatMessage::InviteReq(invite))) => {
                info!(inviter = %invite.inviter, session_id = %invite.session_id,
                    "invite received over heartbeat");
                let _ = self.events.send(HeartbeatEvent::Invite(invite));
                None
            }
            Ok((header, _)) => {
                debug!(msg_type = header.msg_type, "unexpected heartbeat message");
                None
            }
            Err(error) => {
                warn!(%error, "undecodable heartbeat datagram");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Minimal in-process heartbeat server answering every request.
    async fn spawn_fake_server(next_beat: u64) -> std::net::SocketAddr {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();
        tokio::spawn(async move {
            let mut buf = [0u8; MAX_DATAGRAM];
            loop {
                let Ok((len, peer)) = socket.recv_from(&mut buf).await else {
                    return;
                };
                let Ok((header, message)) = wire::decode(&buf[..len]) else {
                    continue;
                };
                if matches!(message, HeartbeatMessage::HeartbeatReq { .. }) {
                    let resp = HeartbeatMessage::HeartbeatResp { next_beat };
                    let _ = socket
                        .send_to(&wire::encode(&resp, header.seq), peer)
                        .await;
                }
            }
        });
        addr
    }

    #[tokio::test]
    async fn beats_are_acknowledged() {
        let addr = spawn_fake_server(0).await;
        let aid: Aid = "alice.ex.com".parse().unwrap();
        let channel = HeartbeatChannel::spawn(&addr.to_string(), aid, 1)
            .await
            .unwrap();
        let mut events = channel.subscribe();

        let event = tokio::time::timeout(Duration::from_secs(3), events.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(event, HeartbeatEvent::Beat { .. }));
        channel.stop();
    }

    #[tokio::test]
    async fn missed_responses_mark_the_channel_dead() {
        tokio::time::pause();
        // Socket with nothing listening on the other side.
        let sink = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = sink.local_addr().unwrap();
        let aid: Aid = "alice.ex.com".parse().unwrap();
        let channel = HeartbeatChannel::spawn(&addr.to_string(), aid, 1)
            .await
            .unwrap();
        let mut events = channel.subscribe();

        // Advance past enough ticks for the miss-of-3 rule to fire.
        for _ in 0..5 {
            tokio::time::advance(DEFAULT_BEAT_INTERVAL).await;
        }
        let event = events.recv().await.unwrap();
        assert_eq!(event, HeartbeatEvent::Dead);
    }
}
