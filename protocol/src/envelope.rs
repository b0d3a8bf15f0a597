//! The wire envelope exchanged over the WebSocket stream.
//!
//! Every frame is one JSON object carrying `protocol_version`, `sender`,
//! `timestamp`, and a `type`-tagged body (spec.md §4.5). The body is an
//! internally-tagged enum flattened into the envelope, mirroring the
//! teacher's `WsMessage` tagging style but carrying the fuller field set the
//! chat protocol needs.

use chrono::Local;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::EnvelopeError;

/// Current protocol version stamped on every envelope.
pub const PROTOCOL_VERSION: &str = "1.0";

/// Sender name used for every message the server originates itself.
pub const SERVER_SENDER: &str = "Server";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub protocol_version: String,
    pub sender: String,
    pub timestamp: String,
    #[serde(flatten)]
    pub body: Body,
}

impl Envelope {
    /// Builds an envelope stamped with the current time and protocol version.
    pub fn new(sender: impl Into<String>, body: Body) -> Self {
        Self {
            protocol_version: PROTOCOL_VERSION.to_string(),
            sender: sender.into(),
            timestamp: Local::now().to_rfc3339(),
            body,
        }
    }

    /// Builds a server-originated envelope (`sender` = `"Server"`).
    pub fn from_server(body: Body) -> Self {
        Self::new(SERVER_SENDER, body)
    }

    /// Serializes to the on-the-wire JSON text frame.
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).expect("Envelope fields always serialize")
    }

    /// Parses a text frame. A malformed payload never errors outward — per
    /// spec.md §4.5/§7, it is coerced into a synthetic `system_message`
    /// rather than propagated.
    pub fn from_json(raw: &str) -> Envelope {
        match serde_json::from_str::<Envelope>(raw) {
            Ok(envelope) => envelope,
            Err(_) => Envelope::from_server(Body::SystemMessage {
                message: "[Malformed Message]".to_string(),
            }),
        }
    }

    /// Strict parse that does report the error, for callers (like tests)
    /// that want to distinguish malformed input from a real system message.
    pub fn try_from_json(raw: &str) -> Result<Envelope, EnvelopeError> {
        Ok(serde_json::from_str(raw)?)
    }

    pub fn type_name(&self) -> &'static str {
        self.body.type_name()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Body {
    Register {
        username: String,
    },
    RegisterError {
        message: String,
    },
    ConnectRequest {
        target: String,
        message: String,
    },
    ConnectAccept {
        target: String,
        message: String,
    },
    ConnectDeny {
        target: String,
        message: String,
    },
    ConnectBusy {
        target: String,
        message: String,
    },
    ConnectError {
        message: String,
    },
    TunnelValidate {
        message: String,
    },
    TunnelSecret {
        secret: String,
    },
    TunnelOkKeyInit {
        message: String,
    },
    TunnelFailed {
        message: String,
    },
    KeyShare {
        target: String,
        key: String,
        message: String,
    },
    EncryptedMessage {
        target: String,
        payload_b64: String,
    },
    TunnelExit {
        target: String,
        message: String,
    },
    UserDisconnected {
        username: String,
        message: String,
    },
    ChatMessage {
        message: String,
    },
    SystemMessage {
        message: String,
    },
    SystemRequest {
        need: String,
    },
    SystemResponse {
        #[serde(skip_serializing_if = "Option::is_none", default)]
        response_need: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none", default)]
        res_info: Option<Value>,
    },
}

impl Body {
    pub fn type_name(&self) -> &'static str {
        match self {
            Body::Register { .. } => "register",
            Body::RegisterError { .. } => "register_error",
            Body::ConnectRequest { .. } => "connect_request",
            Body::ConnectAccept { .. } => "connect_accept",
            Body::ConnectDeny { .. } => "connect_deny",
            Body::ConnectBusy { .. } => "connect_busy",
            Body::ConnectError { .. } => "connect_error",
            Body::TunnelValidate { .. } => "tunnel_validate",
            Body::TunnelSecret { .. } => "tunnel_secret",
            Body::TunnelOkKeyInit { .. } => "tunnel_ok_key_init",
            Body::TunnelFailed { .. } => "tunnel_failed",
            Body::KeyShare { .. } => "key_share",
            Body::EncryptedMessage { .. } => "encrypted_message",
            Body::TunnelExit { .. } => "tunnel_exit",
            Body::UserDisconnected { .. } => "user_disconnected",
            Body::ChatMessage { .. } => "chat_message",
            Body::SystemMessage { .. } => "system_message",
            Body::SystemRequest { .. } => "system_request",
            Body::SystemResponse { .. } => "system_response",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_every_declared_field() {
        let original = Envelope::new(
            "alice",
            Body::ConnectRequest {
                target: "bob".to_string(),
                message: "hi".to_string(),
            },
        );
        let json = original.to_json();
        let decoded = Envelope::try_from_json(&json).unwrap();
        assert_eq!(decoded.protocol_version, original.protocol_version);
        assert_eq!(decoded.sender, original.sender);
        assert_eq!(decoded.timestamp, original.timestamp);
        assert_eq!(decoded.type_name(), "connect_request");
        match decoded.body {
            Body::ConnectRequest { target, message } => {
                assert_eq!(target, "bob");
                assert_eq!(message, "hi");
            }
            other => panic!("unexpected body: {other:?}"),
        }
    }

    #[test]
    fn malformed_json_becomes_synthetic_system_message() {
        let envelope = Envelope::from_json("{not json");
        assert_eq!(envelope.type_name(), "system_message");
        assert_eq!(envelope.sender, SERVER_SENDER);
        match envelope.body {
            Body::SystemMessage { message } => assert_eq!(message, "[Malformed Message]"),
            other => panic!("unexpected body: {other:?}"),
        }
    }

    #[test]
    fn unknown_type_is_rejected_by_strict_parse_but_tolerated_by_lenient_parse() {
        let raw = r#"{"protocol_version":"1.0","sender":"x","timestamp":"now","type":"made_up"}"#;
        assert!(Envelope::try_from_json(raw).is_err());
        let lenient = Envelope::from_json(raw);
        assert_eq!(lenient.type_name(), "system_message");
    }

    #[test]
    fn system_response_omits_absent_optional_fields() {
        let envelope = Envelope::from_server(Body::SystemResponse {
            response_need: Some("list_users".to_string()),
            res_info: Some(Value::Array(vec![Value::String("alice".to_string())])),
        });
        let json = envelope.to_json();
        assert!(json.contains("\"response_need\":\"list_users\""));
        assert!(json.contains("\"res_info\":[\"alice\"]"));
    }
}
