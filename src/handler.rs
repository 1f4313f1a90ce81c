//! WebSocket connection handler.
//!
//! One task per connection: wait for `register`, bind the connection to a peer
//! id, then forward every inbound frame to the relay state until the socket
//! closes. Outbound traffic goes through an unbounded channel drained by a
//! dedicated writer task, so the relay never awaits a slow socket.

use axum::extract::ws::{Message, WebSocket};
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::accounts::{run_blocking, Profile};
use crate::protocol::{ClientMessage, PeerId, ServerMessage};
use crate::registry::ClientSender;
use crate::state::RelayState;

type WsSink = SplitSink<WebSocket, Message>;

/// Serialize and write one frame. Returns false once the socket is gone.
async fn send_frame(sink: &mut WsSink, message: &ServerMessage) -> bool {
    match serde_json::to_string(message) {
        Ok(json) => sink.send(Message::Text(json)).await.is_ok(),
        Err(e) => {
            tracing::error!("Failed to serialize server message: {}", e);
            true
        }
    }
}

/// Refuse a connection: send one `error` frame, then close.
pub async fn reject(socket: WebSocket, reason: &str) {
    let (mut sink, _) = socket.split();
    tracing::info!(reason, "Rejecting connection");
    let _ = send_frame(
        &mut sink,
        &ServerMessage::Error {
            message: reason.to_string(),
        },
    )
    .await;
    let _ = sink.send(Message::Close(None)).await;
}

/// Pick the name shown in rosters. A stored profile wins over the requested
/// name; a blank name falls back to `User_<id prefix>`.
fn resolve_display_name(
    id: &str,
    requested: &str,
    profile: Option<Profile>,
) -> (String, Option<String>) {
    if let Some(profile) = profile {
        if !profile.display_name.trim().is_empty() {
            return (profile.display_name, profile.avatar_url);
        }
    }

    let trimmed = requested.trim();
    if trimmed.is_empty() {
        let prefix: String = id.chars().take(8).collect();
        (format!("User_{}", prefix), None)
    } else {
        (trimmed.to_string(), None)
    }
}

/// Tears the peer down however the session ends, including when the
/// connection future is dropped mid-await.
struct SessionGuard {
    state: RelayState,
    id: PeerId,
    sender: ClientSender,
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.state.teardown(&self.id, &self.sender);
    }
}

/// Handle a single WebSocket connection.
///
/// `identity` is the peer id resolved from a session token, if the client
/// presented one. Without it a fresh id is minted.
pub async fn handle_websocket(socket: WebSocket, state: RelayState, identity: Option<PeerId>) {
    let (mut ws_sender, mut ws_receiver) = socket.split();

    // ── Step 1: Wait for Registration ─────────────────────────────────────

    let requested_name = loop {
        let frame = match ws_receiver.next().await {
            Some(Ok(frame)) => frame,
            Some(Err(_)) | None => return,
        };

        let reply = match frame {
            Message::Text(text) => match serde_json::from_str::<ClientMessage>(&text) {
                Ok(ClientMessage::Register { display_name }) => break display_name,
                Ok(ClientMessage::Heartbeat) => ServerMessage::HeartbeatAck,
                Ok(_) => ServerMessage::Error {
                    message: "Must register first".to_string(),
                },
                Err(e) => {
                    tracing::warn!("Failed to parse client message: {}", e);
                    ServerMessage::Error {
                        message: format!("Invalid message format: {}", e),
                    }
                }
            },
            Message::Close(_) => return,
            _ => continue,
        };

        if !send_frame(&mut ws_sender, &reply).await {
            return;
        }
    };

    // ── Step 2: Resolve Identity ──────────────────────────────────────────

    let profile = match &identity {
        Some(id) => {
            let lookup = id.clone();
            run_blocking(state.accounts.clone(), move |store| store.fetch_profile(&lookup))
                .await
                .unwrap_or_else(|e| {
                    tracing::warn!(peer = id.as_str(), error = %e, "Profile lookup failed");
                    None
                })
        }
        None => None,
    };
    let peer_id = identity.unwrap_or_else(|| Uuid::new_v4().simple().to_string());
    let (display_name, avatar_url) = resolve_display_name(&peer_id, &requested_name, profile);

    // ── Step 3: Spawn Writer, Register ────────────────────────────────────

    let (tx, mut rx) = mpsc::unbounded_channel::<ServerMessage>();

    let writer = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if !send_frame(&mut ws_sender, &msg).await {
                break;
            }
        }
    });

    state.register_peer(&peer_id, &display_name, avatar_url, tx.clone());
    let guard = SessionGuard {
        state: state.clone(),
        id: peer_id.clone(),
        sender: tx.clone(),
    };

    // ── Step 4: Process Messages ──────────────────────────────────────────

    while let Some(frame) = ws_receiver.next().await {
        match frame {
            Ok(Message::Text(text)) => match serde_json::from_str::<ClientMessage>(&text) {
                Ok(msg) => {
                    if !handle_client_message(&state, &peer_id, &tx, msg) {
                        break;
                    }
                }
                Err(e) => {
                    tracing::warn!(
                        peer = peer_id.as_str(),
                        error = %e,
                        "Failed to parse client message"
                    );
                    let _ = tx.send(ServerMessage::Error {
                        message: format!("Invalid message format: {}", e),
                    });
                }
            },
            Ok(Message::Close(_)) => {
                tracing::info!(peer = peer_id.as_str(), "Client sent close frame");
                break;
            }
            Err(e) => {
                tracing::warn!(peer = peer_id.as_str(), error = %e, "WebSocket error");
                break;
            }
            _ => {} // Binary, Ping, Pong
        }
    }

    // ── Step 5: Cleanup ───────────────────────────────────────────────────

    drop(guard);
    writer.abort();
    tracing::info!(peer = peer_id.as_str(), "WebSocket disconnected");
}

/// Handle a parsed client message from a registered session. Replies to the
/// sender go through its own channel, not the registry, so a replaced
/// session never receives the newer session's traffic.
///
/// Returns false once `reply` no longer owns `from`; the session must stop.
fn handle_client_message(
    state: &RelayState,
    from: &str,
    reply: &ClientSender,
    msg: ClientMessage,
) -> bool {
    if !state.owns_session(from, reply) {
        tracing::info!(peer = from, "Session superseded, closing");
        return false;
    }

    match msg {
        ClientMessage::Register { .. } => {
            let _ = reply.send(ServerMessage::Error {
                message: "Already registered".to_string(),
            });
        }

        ClientMessage::Heartbeat => {
            state.heartbeat(from);
            let _ = reply.send(ServerMessage::HeartbeatAck);
        }

        ClientMessage::GetUsers => {
            let _ = reply.send(ServerMessage::UserList {
                users: state.roster(from),
            });
        }

        ClientMessage::CallRequest { target_id } => {
            if let Err(e) = state.request_call(from, &target_id) {
                tracing::debug!(peer = from, target = target_id.as_str(), error = %e, "Call refused");
                let _ = reply.send(ServerMessage::CallError {
                    message: e.to_string(),
                });
            }
        }

        ClientMessage::CallAccept => {
            if let Err(e) = state.accept_call(from) {
                let _ = reply.send(ServerMessage::CallError {
                    message: e.to_string(),
                });
            }
        }

        ClientMessage::CallDecline => {
            if state.decline_call(from).is_none() {
                tracing::debug!(peer = from, "Nothing to decline");
            }
        }

        ClientMessage::CallEnd => {
            if state.end_call(from).is_none() {
                tracing::debug!(peer = from, "No call to end");
            }
        }

        ClientMessage::Signal { target_id, payload } => {
            state.relay_signal(from, &target_id, payload);
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::RelayConfig;
    use serde_json::json;

    fn profile(name: &str) -> Profile {
        Profile {
            display_name: name.to_string(),
            avatar_url: Some("/avatars/x.png".to_string()),
        }
    }

    #[test]
    fn test_requested_name_is_trimmed() {
        let (name, avatar) = resolve_display_name("abcdef123456", "  Alice ", None);
        assert_eq!(name, "Alice");
        assert_eq!(avatar, None);
    }

    #[test]
    fn test_blank_name_falls_back_to_id_prefix() {
        let (name, _) = resolve_display_name("abcdef123456", "   ", None);
        assert_eq!(name, "User_abcdef12");

        let (short, _) = resolve_display_name("42", "", None);
        assert_eq!(short, "User_42");
    }

    #[test]
    fn test_profile_overrides_requested_name() {
        let (name, avatar) = resolve_display_name("7", "Guest", Some(profile("carol")));
        assert_eq!(name, "carol");
        assert_eq!(avatar.as_deref(), Some("/avatars/x.png"));
    }

    fn session(state: &RelayState, id: &str) -> (ClientSender, mpsc::UnboundedReceiver<ServerMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        state.register_peer(id, id, None, tx.clone());
        (tx, rx)
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<ServerMessage>) -> Vec<ServerMessage> {
        let mut out = Vec::new();
        while let Ok(msg) = rx.try_recv() {
            out.push(msg);
        }
        out
    }

    #[test]
    fn test_second_register_is_an_error() {
        let state = RelayState::new(RelayConfig::default());
        let (tx, mut rx) = session(&state, "a");
        drain(&mut rx);

        handle_client_message(
            &state,
            "a",
            &tx,
            ClientMessage::Register {
                display_name: "again".to_string(),
            },
        );
        assert_eq!(
            drain(&mut rx),
            vec![ServerMessage::Error {
                message: "Already registered".to_string()
            }]
        );
    }

    #[test]
    fn test_heartbeat_and_get_users_reply_to_sender() {
        let state = RelayState::new(RelayConfig::default());
        let (tx, mut rx) = session(&state, "a");
        let (_b, _b_rx) = session(&state, "b");
        drain(&mut rx);

        handle_client_message(&state, "a", &tx, ClientMessage::Heartbeat);
        handle_client_message(&state, "a", &tx, ClientMessage::GetUsers);

        let msgs = drain(&mut rx);
        assert_eq!(msgs[0], ServerMessage::HeartbeatAck);
        match &msgs[1] {
            ServerMessage::UserList { users } => {
                assert_eq!(users.len(), 1);
                assert_eq!(users[0].id, "b");
            }
            other => panic!("Expected UserList, got {:?}", other),
        }
    }

    #[test]
    fn test_refused_call_replies_call_error() {
        let state = RelayState::new(RelayConfig::default());
        let (tx, mut rx) = session(&state, "a");
        drain(&mut rx);

        handle_client_message(
            &state,
            "a",
            &tx,
            ClientMessage::CallRequest {
                target_id: "ghost".to_string(),
            },
        );
        assert_eq!(
            drain(&mut rx),
            vec![ServerMessage::CallError {
                message: "User 'ghost' is not online".to_string()
            }]
        );

        handle_client_message(&state, "a", &tx, ClientMessage::CallAccept);
        assert!(matches!(
            drain(&mut rx).as_slice(),
            [ServerMessage::CallError { .. }]
        ));
    }

    #[test]
    fn test_decline_and_end_without_call_are_silent() {
        let state = RelayState::new(RelayConfig::default());
        let (tx, mut rx) = session(&state, "a");
        drain(&mut rx);

        handle_client_message(&state, "a", &tx, ClientMessage::CallDecline);
        handle_client_message(&state, "a", &tx, ClientMessage::CallEnd);
        assert!(drain(&mut rx).is_empty());
    }

    #[test]
    fn test_signal_is_relayed_with_sender_id() {
        let state = RelayState::new(RelayConfig::default());
        let (a_tx, _a_rx) = session(&state, "a");
        let (_b_tx, mut b_rx) = session(&state, "b");
        drain(&mut b_rx);

        handle_client_message(
            &state,
            "a",
            &a_tx,
            ClientMessage::Signal {
                target_id: "b".to_string(),
                payload: json!({ "type": "offer", "sdp": "v=0" }),
            },
        );
        assert_eq!(
            drain(&mut b_rx),
            vec![ServerMessage::Signal {
                sender_id: "a".to_string(),
                payload: json!({ "type": "offer", "sdp": "v=0" }),
            }]
        );
    }

    #[test]
    fn test_superseded_session_is_ignored() {
        let state = RelayState::new(RelayConfig::default());
        let (old_tx, mut old_rx) = session(&state, "a");
        let (_new_tx, _new_rx) = session(&state, "a");
        let (_b_tx, mut b_rx) = session(&state, "b");
        drain(&mut b_rx);

        let before = state.peer("a").unwrap().last_heartbeat;
        assert!(!handle_client_message(
            &state,
            "a",
            &old_tx,
            ClientMessage::CallRequest {
                target_id: "b".to_string(),
            },
        ));
        assert!(!handle_client_message(&state, "a", &old_tx, ClientMessage::Heartbeat));
        assert!(!handle_client_message(
            &state,
            "a",
            &old_tx,
            ClientMessage::Signal {
                target_id: "b".to_string(),
                payload: json!("hijack"),
            },
        ));

        let a = state.peer("a").unwrap();
        assert_eq!(a.state, crate::registry::CallState::Available);
        assert_eq!(a.last_heartbeat, before);
        assert_eq!(state.peer("b").unwrap().state, crate::registry::CallState::Available);
        assert!(drain(&mut b_rx).is_empty());

        assert!(drain(&mut old_rx).iter().any(|m| matches!(
            m,
            ServerMessage::Error { message } if message == "Signed in from another connection"
        )));
    }

    #[test]
    fn test_current_session_keeps_running() {
        let state = RelayState::new(RelayConfig::default());
        let (tx, _rx) = session(&state, "a");
        assert!(handle_client_message(&state, "a", &tx, ClientMessage::Heartbeat));
    }

    #[test]
    fn test_session_guard_tears_down_on_drop() {
        let state = RelayState::new(RelayConfig::default());
        let (tx, _rx) = session(&state, "a");

        let guard = SessionGuard {
            state: state.clone(),
            id: "a".to_string(),
            sender: tx,
        };
        assert!(state.is_registered("a"));
        drop(guard);
        assert!(!state.is_registered("a"));
    }
}
