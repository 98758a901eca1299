//! Relay protocol message definitions.
//!
//! The relay speaks a small JSON-over-WebSocket protocol. Every frame is an
//! object tagged by `type`. Negotiation payloads (`offer`, `answer`,
//! `candidate`, `data`, ...) are opaque to the relay: they are captured as raw
//! JSON fields and re-emitted untouched when the message is forwarded.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::ProtocolError;

/// Type-specific fields of a negotiation message, kept exactly as received.
pub type Payload = Map<String, Value>;

/// Tags a client is allowed to send, including the legacy aliases.
const CLIENT_MESSAGE_TYPES: &[&str] = &[
    "offer",
    "mediaOffer",
    "answer",
    "mediaAnswer",
    "iceCandidate",
    "hangup",
    "requestRoster",
    "requestUserList",
];

// ── Client → Relay ────────────────────────────────────────────────────────────

/// Messages sent from a client to the relay.
///
/// `from` is accepted for compatibility but never trusted: the relay stamps
/// forwarded messages with the sender's assigned identifier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ClientMessage {
    /// SDP offer for `to`. Opens a call record once delivered.
    #[serde(alias = "mediaOffer")]
    Offer {
        to: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        from: Option<String>,
        #[serde(flatten)]
        payload: Payload,
    },

    /// SDP answer for `to`.
    #[serde(alias = "mediaAnswer")]
    Answer {
        to: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        from: Option<String>,
        #[serde(flatten)]
        payload: Payload,
    },

    /// Trickle ICE candidate for `to`.
    IceCandidate {
        to: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        from: Option<String>,
        #[serde(flatten)]
        payload: Payload,
    },

    /// End the call. `to` may be omitted, in which case the relay finds the
    /// counterpart from the open call record.
    Hangup {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        to: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        from: Option<String>,
        #[serde(flatten)]
        payload: Payload,
    },

    /// Ask the relay to broadcast the current roster.
    #[serde(alias = "requestUserList")]
    RequestRoster,
}

impl ClientMessage {
    /// Wire name of this message kind, for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            ClientMessage::Offer { .. } => "offer",
            ClientMessage::Answer { .. } => "answer",
            ClientMessage::IceCandidate { .. } => "iceCandidate",
            ClientMessage::Hangup { .. } => "hangup",
            ClientMessage::RequestRoster => "requestRoster",
        }
    }
}

#[derive(Deserialize)]
struct TagOnly {
    #[serde(rename = "type")]
    kind: Option<String>,
}

/// Decode one text frame.
///
/// Frames whose `type` is not a client message kind are reported as
/// [`ProtocolError::UnknownType`]; every other failure is `Malformed`.
pub fn decode(text: &str) -> Result<ClientMessage, ProtocolError> {
    serde_json::from_str::<ClientMessage>(text).map_err(|e| match serde_json::from_str::<TagOnly>(text) {
        Ok(TagOnly { kind: Some(kind) }) if !CLIENT_MESSAGE_TYPES.contains(&kind.as_str()) => {
            ProtocolError::UnknownType(kind)
        }
        _ => ProtocolError::Malformed(e),
    })
}

// ── Relay → Client ────────────────────────────────────────────────────────────

/// Messages sent from the relay to a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ServerMessage {
    /// The identifier assigned to this connection. Sent once, first.
    AssignIdentity { data: IdentityData },

    /// Full list of currently connected identifiers.
    RosterUpdate { data: RosterData },

    /// An offer forwarded from another participant.
    Offer {
        from: String,
        to: String,
        #[serde(flatten)]
        payload: Payload,
    },

    /// An answer forwarded from another participant.
    Answer {
        from: String,
        to: String,
        #[serde(flatten)]
        payload: Payload,
    },

    /// An ICE candidate forwarded from another participant.
    IceCandidate {
        from: String,
        to: String,
        #[serde(flatten)]
        payload: Payload,
    },

    /// The other side ended the call.
    Hangup {
        from: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        to: Option<String>,
        #[serde(flatten)]
        payload: Payload,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IdentityData {
    pub client_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RosterData {
    pub user_ids: Vec<String>,
}

impl ServerMessage {
    pub fn assign_identity(id: &str) -> Self {
        ServerMessage::AssignIdentity {
            data: IdentityData {
                client_id: id.to_string(),
            },
        }
    }

    pub fn roster(ids: Vec<String>) -> Self {
        ServerMessage::RosterUpdate {
            data: RosterData { user_ids: ids },
        }
    }
}
