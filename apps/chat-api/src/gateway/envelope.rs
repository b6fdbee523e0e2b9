//! Wire envelope exchanged between clients, the hub, and the relay bus.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::auth::jwt::Identity;

/// What an envelope asks the hub to do, decided once at decode time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum EnvelopeKind {
    Join,
    Leave,
    Message,
    /// Any other `type` value. Routed to the single default-drop rule.
    Unknown(String),
}

impl From<String> for EnvelopeKind {
    fn from(raw: String) -> Self {
        match raw.as_str() {
            "join" => Self::Join,
            "leave" => Self::Leave,
            "message" => Self::Message,
            _ => Self::Unknown(raw),
        }
    }
}

impl From<EnvelopeKind> for String {
    fn from(kind: EnvelopeKind) -> Self {
        kind.as_str().to_string()
    }
}

impl EnvelopeKind {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Join => "join",
            Self::Leave => "leave",
            Self::Message => "message",
            Self::Unknown(raw) => raw,
        }
    }
}

/// `{type, room_id, user_id, username, content, data}` on the wire. Empty
/// fields are omitted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: EnvelopeKind,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub room_id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub user_id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub username: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub content: String,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub data: Value,
}

impl Envelope {
    pub fn new(kind: EnvelopeKind, room_id: impl Into<String>) -> Self {
        Self {
            kind,
            room_id: room_id.into(),
            user_id: String::new(),
            username: String::new(),
            content: String::new(),
            data: Value::Null,
        }
    }

    pub fn message(room_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            ..Self::new(EnvelopeKind::Message, room_id)
        }
    }

    /// The departure notice broadcast when a session disconnects without an
    /// explicit leave.
    pub fn departure(room_id: impl Into<String>, sender: &Identity) -> Self {
        Self::new(EnvelopeKind::Leave, room_id).stamped(sender)
    }

    /// Overwrite the sender fields with a verified identity.
    pub fn stamped(mut self, sender: &Identity) -> Self {
        self.user_id = sender.user_id.clone();
        self.username = sender.username.clone();
        self
    }

    /// Decode a client frame (text or binary payload).
    pub fn decode(frame: impl AsRef<[u8]>) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(frame.as_ref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn alice() -> Identity {
        Identity {
            user_id: "usr_alice".into(),
            username: "alice".into(),
        }
    }

    #[test]
    fn decodes_known_kinds() {
        let env = Envelope::decode(r#"{"type":"join","room_id":"general"}"#).unwrap();
        assert_eq!(env.kind, EnvelopeKind::Join);
        assert_eq!(env.room_id, "general");
        assert!(env.data.is_null());
    }

    #[test]
    fn unknown_kind_is_kept_not_rejected() {
        let env = Envelope::decode(r#"{"type":"typing","room_id":"general"}"#).unwrap();
        assert_eq!(env.kind, EnvelopeKind::Unknown("typing".into()));
    }

    #[test]
    fn malformed_frames_fail_to_decode() {
        assert!(Envelope::decode("not json").is_err());
        assert!(Envelope::decode(r#"{"room_id":"general"}"#).is_err());
    }

    #[test]
    fn stamping_discards_client_supplied_sender() {
        let env = Envelope::decode(
            r#"{"type":"message","room_id":"general","user_id":"usr_mallory","username":"admin","content":"hi"}"#,
        )
        .unwrap()
        .stamped(&alice());

        assert_eq!(env.user_id, "usr_alice");
        assert_eq!(env.username, "alice");
        assert_eq!(env.content, "hi");
    }

    #[test]
    fn serializes_wire_shape_without_empty_fields() {
        let env = Envelope::departure("general", &alice());
        let json = serde_json::to_value(&env).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "type": "leave",
                "room_id": "general",
                "user_id": "usr_alice",
                "username": "alice",
            })
        );
    }

    #[test]
    fn opaque_data_passes_through() {
        let env = Envelope::decode(
            r#"{"type":"message","room_id":"r","content":"x","data":{"reply_to":"42"}}"#,
        )
        .unwrap();
        let json = serde_json::to_value(&env).unwrap();
        assert_eq!(json["data"]["reply_to"], "42");
    }
}
