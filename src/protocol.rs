//! Relay protocol message definitions.
//!
//! The relay speaks a simple JSON-over-WebSocket protocol. Every frame is a
//! JSON object carrying a snake_case `type` tag; field names are camelCase.
//! Signal payloads are opaque to the relay and are forwarded verbatim.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Identifier of a registered peer.
pub type PeerId = String;

// ── Client → Relay ────────────────────────────────────────────────────────────

/// Messages sent from a client to the relay server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ClientMessage {
    /// Announce this connection. Must be sent first after connecting.
    /// A missing name is treated like a blank one.
    Register {
        #[serde(default)]
        display_name: String,
    },

    /// Keep-alive. The only message that refreshes liveness.
    Heartbeat,

    /// Ask for the current roster.
    GetUsers,

    /// Ring another peer.
    CallRequest { target_id: PeerId },

    /// Accept the incoming call.
    CallAccept,

    /// Decline the incoming call.
    CallDecline,

    /// Hang up (or cancel an outgoing call that has not been answered yet).
    CallEnd,

    /// Relay a negotiation payload (SDP offer/answer, ICE candidate) to a peer.
    Signal { target_id: PeerId, payload: Value },
}

// ── Relay → Client ────────────────────────────────────────────────────────────

/// Messages sent from the relay server to a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ServerMessage {
    /// Registration succeeded; carries the assigned identity and the roster.
    Registered {
        user_id: PeerId,
        display_name: String,
        color: String,
        users: Vec<PeerSummary>,
    },

    HeartbeatAck,

    /// Full roster as seen by the recipient (the recipient itself excluded).
    UserList { users: Vec<PeerSummary> },

    /// Someone is ringing the recipient.
    IncomingCall {
        caller_id: PeerId,
        caller_name: String,
        caller_color: String,
    },

    /// The callee picked up.
    CallAccepted {
        callee_id: PeerId,
        callee_name: String,
    },

    /// The callee declined.
    CallDeclined { decliner_id: PeerId, message: String },

    /// The partner hung up.
    CallEnded { peer_id: PeerId, message: String },

    /// The partner's connection went away mid-call.
    PeerDisconnected { peer_id: PeerId, message: String },

    /// A call operation was refused; nothing changed.
    CallError { message: String },

    /// A negotiation payload forwarded from another peer.
    Signal { sender_id: PeerId, payload: Value },

    /// Malformed input or internal failure.
    Error { message: String },
}

// ── Supporting Types ──────────────────────────────────────────────────────────

/// Call status of a peer as shown in the roster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PeerStatus {
    Available,
    Calling,
    Receiving,
    InCall,
}

/// One roster entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerSummary {
    pub id: PeerId,
    pub display_name: String,
    pub status: PeerStatus,
    pub color: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar_url: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_register_uses_camel_case_fields() {
        let parsed: ClientMessage =
            serde_json::from_str(r#"{"type":"register","displayName":"Alice"}"#).unwrap();
        assert_eq!(
            parsed,
            ClientMessage::Register {
                display_name: "Alice".to_string()
            }
        );
    }

    #[test]
    fn test_register_without_name() {
        let parsed: ClientMessage = serde_json::from_str(r#"{"type":"register"}"#).unwrap();
        assert_eq!(
            parsed,
            ClientMessage::Register {
                display_name: String::new()
            }
        );
    }

    #[test]
    fn test_unit_variants_parse_from_bare_tag() {
        let cases = [
            ("heartbeat", ClientMessage::Heartbeat),
            ("get_users", ClientMessage::GetUsers),
            ("call_accept", ClientMessage::CallAccept),
            ("call_decline", ClientMessage::CallDecline),
            ("call_end", ClientMessage::CallEnd),
        ];
        for (tag, expected) in cases {
            let parsed: ClientMessage =
                serde_json::from_value(json!({ "type": tag })).unwrap();
            assert_eq!(parsed, expected, "tag {}", tag);
        }
    }

    #[test]
    fn test_call_request_requires_target() {
        let ok: ClientMessage =
            serde_json::from_str(r#"{"type":"call_request","targetId":"bob"}"#).unwrap();
        assert_eq!(
            ok,
            ClientMessage::CallRequest {
                target_id: "bob".to_string()
            }
        );

        let missing = serde_json::from_str::<ClientMessage>(r#"{"type":"call_request"}"#);
        assert!(missing.is_err());
    }

    #[test]
    fn test_unknown_type_is_rejected() {
        assert!(serde_json::from_str::<ClientMessage>(r#"{"type":"teleport"}"#).is_err());
        assert!(serde_json::from_str::<ClientMessage>(r#"{"targetId":"bob"}"#).is_err());
        assert!(serde_json::from_str::<ClientMessage>("not json").is_err());
    }

    #[test]
    fn test_signal_payload_is_opaque() {
        let frame = json!({
            "type": "signal",
            "targetId": "bob",
            "payload": { "sdp": "v=0\r\n", "candidates": [1, 2, 3], "nested": { "x": null } }
        });
        let parsed: ClientMessage = serde_json::from_value(frame.clone()).unwrap();
        match parsed {
            ClientMessage::Signal { target_id, payload } => {
                assert_eq!(target_id, "bob");
                assert_eq!(payload, frame["payload"]);
            }
            other => panic!("Wrong variant: {:?}", other),
        }
    }

    #[test]
    fn test_outbound_signal_is_annotated_with_sender() {
        let msg = ServerMessage::Signal {
            sender_id: "alice".to_string(),
            payload: json!({ "type": "offer" }),
        };
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value["type"], "signal");
        assert_eq!(value["senderId"], "alice");
        assert_eq!(value["payload"]["type"], "offer");
    }

    #[test]
    fn test_user_list_serialization() {
        let msg = ServerMessage::UserList {
            users: vec![PeerSummary {
                id: "bob".to_string(),
                display_name: "Bob".to_string(),
                status: PeerStatus::InCall,
                color: "#0088cc".to_string(),
                avatar_url: None,
            }],
        };
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value["type"], "user_list");
        assert_eq!(value["users"][0]["displayName"], "Bob");
        assert_eq!(value["users"][0]["status"], "in_call");
        assert!(value["users"][0].get("avatarUrl").is_none());
    }

    #[test]
    fn test_server_message_tags() {
        let cases = vec![
            (ServerMessage::HeartbeatAck, "heartbeat_ack"),
            (
                ServerMessage::IncomingCall {
                    caller_id: "a".to_string(),
                    caller_name: "A".to_string(),
                    caller_color: "#fff".to_string(),
                },
                "incoming_call",
            ),
            (
                ServerMessage::CallAccepted {
                    callee_id: "b".to_string(),
                    callee_name: "B".to_string(),
                },
                "call_accepted",
            ),
            (
                ServerMessage::CallError {
                    message: "busy".to_string(),
                },
                "call_error",
            ),
            (
                ServerMessage::PeerDisconnected {
                    peer_id: "a".to_string(),
                    message: "gone".to_string(),
                },
                "peer_disconnected",
            ),
        ];
        for (msg, tag) in cases {
            let value = serde_json::to_value(&msg).unwrap();
            assert_eq!(value["type"], tag);
        }
    }
}
