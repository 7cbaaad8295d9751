// SPDX-FileCopyrightText: 2025 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Live-channel tests against an in-process message server.

use std::{net::SocketAddr, sync::Arc, time::Duration};

use acpcommon::identifiers::{Aid, GroupId, SessionId};
use acpapiclient::ws::{Frame, MessageChannel, MessageChannelConfig};
use futures_util::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio::{net::TcpListener, sync::mpsc};
use tokio_tungstenite::tungstenite::protocol::Message;

use acpcoreclient::{
    ChannelSlot,
    groups::{GroupClient, GroupStore},
    handlers::HandlerRegistry,
    identity::{IdentityManager, IdentityManagerConfig},
    sessions::{SessionKind, SessionManager, SessionRole},
    store::CertKeyStore,
    supervisor::AgentState,
};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

struct FakeServer {
    from_client: mpsc::UnboundedReceiver<Frame>,
    to_client: mpsc::UnboundedSender<Frame>,
}

/// Accepts a single WebSocket connection and bridges frames to the test.
async fn spawn_server() -> (SocketAddr, FakeServer) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (in_tx, from_client) = mpsc::unbounded_channel();
    let (to_client, mut out_rx) = mpsc::unbounded_channel::<Frame>();

    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let ws = tokio_tungstenite::accept_async(stream).await.unwrap();
        let (mut sink, mut source) = ws.split();
        loop {
            tokio::select! {
                frame = out_rx.recv() => match frame {
                    Some(frame) => {
                        let text = serde_json::to_string(&frame).unwrap();
                        if sink.send(Message::Text(text)).await.is_err() {
                            return;
                        }
                    }
                    None => return,
                },
                incoming = source.next() => match incoming {
                    Some(Ok(Message::Text(text))) => {
                        if let Ok(frame) = serde_json::from_str::<Frame>(&text) {
                            let _ = in_tx.send(frame);
                        }
                    }
                    Some(Ok(_)) => {}
                    _ => return,
                },
            }
        }
    });
    (addr, FakeServer { from_client, to_client })
}

async fn connect(addr: SocketAddr, aid: &Aid) -> Arc<MessageChannel> {
    Arc::new(
        MessageChannel::connect(MessageChannelConfig {
            message_server: addr.to_string(),
            aid: aid.clone(),
            signature: "test-signature".to_string(),
            use_tls: false,
            danger_accept_invalid_certs: false,
        })
        .await
        .unwrap(),
    )
}

#[tokio::test]
async fn session_round_trip_with_server_assigned_id() {
    init_tracing();
    let (addr, mut server) = spawn_server().await;
    let aid: Aid = "alice.ex.com".parse().unwrap();
    let bob: Aid = "bob.ex.com".parse().unwrap();

    let channel = connect(addr, &aid).await;
    let slot = ChannelSlot::new();
    slot.install(channel.clone());

    let dir = tempfile::tempdir().unwrap();
    let sessions = SessionManager::new(aid, slot, CertKeyStore::new(dir.path()));

    // Server brain: assign "s1", accept the invite.
    let to_client = server.to_client.clone();
    tokio::spawn(async move {
        while let Some(frame) = server.from_client.recv().await {
            let request_id = frame.request_id().unwrap_or_default().to_string();
            match frame.cmd.as_str() {
                "create_session_req" => {
                    let _ = to_client.send(Frame {
                        cmd: "create_session_ack".to_string(),
                        data: json!({
                            "request_id": request_id,
                            "session_id": "s1",
                            "status_code": 200,
                        }),
                    });
                }
                "invite_agent_req" => {
                    let _ = to_client.send(Frame {
                        cmd: "invite_agent_ack".to_string(),
                        data: json!({ "request_id": request_id, "status_code": 200 }),
                    });
                }
                _ => {}
            }
        }
    });

    let session_id = sessions.create_session(&[bob]).await.unwrap();
    assert_eq!(session_id.as_str(), "s1");

    let session = sessions.get_session(&session_id).await.unwrap();
    assert_eq!(session.kind, SessionKind::Created);
    assert_eq!(session.members.len(), 2);
    assert_eq!(session.members[0].role, SessionRole::Owner);
    assert!(session.members.iter().any(|m| m.agent_id == "bob.ex.com"));
}

#[tokio::test]
async fn pushed_batch_is_stored_and_acked_over_the_wire() {
    init_tracing();
    let (addr, mut server) = spawn_server().await;
    let aid: Aid = "alice.ex.com".parse().unwrap();

    let channel = connect(addr, &aid).await;
    let slot = ChannelSlot::new();

    let dir = tempfile::tempdir().unwrap();
    let files = CertKeyStore::new(dir.path());
    let store = GroupStore::new(aid.clone(), files);
    let groups = GroupClient::new(aid, slot.clone(), store, HandlerRegistry::default());
    groups.init(None, SessionId::new("gs1"));
    channel.set_raw_hook(groups.raw_hook());
    slot.install(channel.clone());

    // Cursor starts at 100.
    let group = GroupId::new("g1");
    groups
        .store()
        .append_messages(
            &group,
            vec![acpcoreclient::groups::GroupMessage {
                msg_id: 100,
                sender: "bob.ex.com".to_string(),
                content: "seed".to_string(),
                content_type: "text".to_string(),
                timestamp: acpcommon::TimeStamp::from_millis(1),
                metadata: Value::Null,
            }],
        )
        .await
        .unwrap();

    // Server brain: once the client reports ready, push the batch; then
    // answer the ack rpc.
    let to_client = server.to_client.clone();
    tokio::spawn(async move {
        let batch = json!({
            "type": "group_message_batch",
            "group_id": "g1",
            "start_msg_id": 101,
            "latest_msg_id": 103,
            "count": 3,
            "messages": (101..=103u64).map(|id| json!({
                "msg_id": id,
                "sender": "bob.ex.com",
                "content": format!("m{id}"),
                "content_type": "text",
                "timestamp": 1_700_000_000_000i64 + id as i64,
            })).collect::<Vec<_>>(),
        });
        while let Some(frame) = server.from_client.recv().await {
            if frame.cmd == "client_ready" {
                let _ = to_client.send(Frame {
                    cmd: "session_message".to_string(),
                    data: json!({
                        "session_id": "gs1",
                        "sender": "group.ex.com",
                        "message": batch.to_string(),
                        "timestamp": 0,
                    }),
                });
                continue;
            }
            if frame.cmd != "session_message" {
                continue;
            }
            let message: Value = frame
                .data
                .get("message")
                .and_then(Value::as_str)
                .and_then(|raw| serde_json::from_str(raw).ok())
                .unwrap_or(Value::Null);
            if message.get("type").and_then(Value::as_str) == Some("group_rpc_req")
                && message.get("method").and_then(Value::as_str) == Some("ack_messages")
            {
                assert_eq!(
                    message.pointer("/params/msg_id").and_then(Value::as_u64),
                    Some(103)
                );
                let response = json!({
                    "type": "group_rpc_resp",
                    "request_id": message.get("request_id").cloned(),
                    "status": "ok",
                    "data": {},
                });
                let _ = to_client.send(Frame {
                    cmd: "session_message".to_string(),
                    data: json!({
                        "session_id": "gs1",
                        "sender": "group.ex.com",
                        "message": response.to_string(),
                        "timestamp": 0,
                    }),
                });
            }
        }
    });

    // The hook is installed; tell the server to push.
    channel
        .send_frame(&Frame {
            cmd: "client_ready".to_string(),
            data: json!({}),
        })
        .await
        .unwrap();

    // Wait for the batch to land and the acked cursor to advance.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let cursor = groups.store().cursor(&group).await.unwrap();
        if cursor.msg_cursor.current_msg_id == 103 {
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "batch was not stored and acked in time"
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    let stored = groups.store().read_messages(&group, 100, 10).await.unwrap();
    let ids: Vec<u64> = stored.iter().map(|m| m.msg_id).collect();
    assert_eq!(ids, vec![101, 102, 103]);
    let cursor = groups.store().cursor(&group).await.unwrap();
    assert_eq!(cursor.msg_cursor.latest_msg_id, 103);
    assert_eq!(cursor.msg_cursor.unread_count, 0);
}

/// Answers every heartbeat request so the channel stays alive.
async fn spawn_heartbeat_server() -> SocketAddr {
    use acpapiclient::heartbeat::wire;

    let socket = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let addr = socket.local_addr().unwrap();
    tokio::spawn(async move {
        let mut buf = [0u8; 2048];
        while let Ok((len, peer)) = socket.recv_from(&mut buf).await {
            if let Ok((header, wire::HeartbeatMessage::HeartbeatReq { .. })) =
                wire::decode(&buf[..len])
            {
                let resp = wire::HeartbeatMessage::HeartbeatResp { next_beat: 0 };
                let _ = socket
                    .send_to(&wire::encode(&resp, header.seq), peer)
                    .await;
            }
        }
    });
    addr
}

#[tokio::test]
async fn full_online_flow_reaches_online_state() {
    use wiremock::{
        Mock, MockServer, ResponseTemplate,
        matchers::{body_partial_json, method, path},
    };

    init_tracing();

    // The access point and certificate authority share one mock server.
    let ap = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/accesspoint/sign_cert"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "certificate": "-----BEGIN CERTIFICATE-----\nAA==\n-----END CERTIFICATE-----\n",
        })))
        .mount(&ap)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/accesspoint/sign_in"))
        .and(body_partial_json(json!({ "client_info": acpcommon::CLIENT_INFO })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "nonce": "n-1" })))
        .mount(&ap)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/accesspoint/sign_in"))
        .and(body_partial_json(json!({ "nonce": "n-1" })))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!({ "signature": "sig-token" })),
        )
        .mount(&ap)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/accesspoint/sign_out"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
        .mount(&ap)
        .await;

    // Entry points route to the in-process heartbeat and message servers.
    let hb_addr = spawn_heartbeat_server().await;
    let (ws_addr, _server) = spawn_server().await;
    let entry = json!({
        "heartbeat_server": hb_addr.to_string(),
        "message_server": ws_addr.to_string(),
    })
    .to_string();
    Mock::given(method("POST"))
        .and(path("/api/accesspoint/get_accesspoint_config"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "config": entry })))
        .mount(&ap)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let base = ap.uri().trim_start_matches("http://").to_string();
    let mut config = IdentityManagerConfig::new(dir.path(), base.clone(), base);
    config.use_tls = false;
    let manager = Arc::new(IdentityManager::new(config));

    let aid: Aid = "alice.ex.com".parse().unwrap();
    manager.create_aid(&aid, "pw").await.unwrap();
    let agent = manager.load_aid(&aid, "pw").await.unwrap();
    assert_eq!(agent.state(), AgentState::Offline);

    agent.online().await.unwrap();
    assert_eq!(agent.state(), AgentState::Online);

    agent.offline().await;
    assert_eq!(agent.state(), AgentState::Offline);
}
