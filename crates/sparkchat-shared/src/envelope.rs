//! Wire envelopes for the five protocol channels.
//!
//! All payloads are UTF-8 JSON with the field names fixed by the protocol
//! (camelCase). Unknown extra fields are ignored; a missing required field
//! makes the envelope invalid, and invalid envelopes are dropped by the
//! dispatcher, never propagated.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::EnvelopeError;
use crate::types::{ReceiptStatus, SerializedKey, TopicKind};

/// A multi-encrypted chat message. `encrypted` maps each recipient's
/// serialized public key to the ciphertext sealed for that recipient.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EncryptedMessage {
    pub id: String,
    pub username: String,
    pub encrypted: HashMap<SerializedKey, String>,
    pub timestamp: i64,
    pub sender_public_key: SerializedKey,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TypingEvent {
    pub username: String,
    pub is_typing: bool,
    pub timestamp: i64,
    pub public_key: SerializedKey,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PublicKeyAnnouncement {
    pub username: String,
    pub public_key: SerializedKey,
    pub timestamp: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PublicKeyRequest {
    pub requester_id: String,
    pub timestamp: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryReceipt {
    pub message_id: String,
    pub username: String,
    pub status: ReceiptStatus,
    pub timestamp: i64,
}

/// A validated inbound payload, tagged by the channel it arrived on.
#[derive(Debug, Clone, PartialEq)]
pub enum Envelope {
    Message(EncryptedMessage),
    Typing(TypingEvent),
    PubKeyAnnounce(PublicKeyAnnouncement),
    PubKeyRequest(PublicKeyRequest),
    Receipt(DeliveryReceipt),
}

impl Envelope {
    /// Validate raw bytes against the schema of the given channel.
    pub fn decode(kind: TopicKind, payload: &[u8]) -> Result<Envelope, EnvelopeError> {
        let envelope = match kind {
            TopicKind::Messages => Envelope::Message(serde_json::from_slice(payload)?),
            TopicKind::Typing => Envelope::Typing(serde_json::from_slice(payload)?),
            TopicKind::PubKeys => Envelope::PubKeyAnnounce(serde_json::from_slice(payload)?),
            TopicKind::PubKeyRequest => {
                Envelope::PubKeyRequest(serde_json::from_slice(payload)?)
            }
            TopicKind::Receipts => Envelope::Receipt(serde_json::from_slice(payload)?),
        };
        Ok(envelope)
    }
}

/// Serialize an outbound wire shape to JSON bytes.
pub fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, EnvelopeError> {
    Ok(serde_json::to_vec(value)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_roundtrip() {
        let mut encrypted = HashMap::new();
        encrypted.insert(SerializedKey::from("peer-key"), "ciphertext".to_string());
        let msg = EncryptedMessage {
            id: "1700000000000-abc1234".to_string(),
            username: "alice".to_string(),
            encrypted,
            timestamp: 1_700_000_000_000,
            sender_public_key: SerializedKey::from("alice-key"),
        };

        let bytes = encode(&msg).unwrap();
        let decoded = Envelope::decode(TopicKind::Messages, &bytes).unwrap();
        assert_eq!(decoded, Envelope::Message(msg));
    }

    #[test]
    fn test_wire_field_names() {
        let event = TypingEvent {
            username: "bob".to_string(),
            is_typing: true,
            timestamp: 1,
            public_key: SerializedKey::from("k"),
        };
        let json = String::from_utf8(encode(&event).unwrap()).unwrap();
        assert!(json.contains("\"isTyping\":true"));
        assert!(json.contains("\"publicKey\""));

        let receipt = DeliveryReceipt {
            message_id: "m1".to_string(),
            username: "bob".to_string(),
            status: ReceiptStatus::Received,
            timestamp: 2,
        };
        let json = String::from_utf8(encode(&receipt).unwrap()).unwrap();
        assert!(json.contains("\"messageId\":\"m1\""));
        assert!(json.contains("\"status\":\"received\""));
    }

    #[test]
    fn test_missing_required_field_rejected() {
        // no senderPublicKey
        let raw = br#"{"id":"m1","username":"alice","encrypted":{},"timestamp":1}"#;
        assert!(Envelope::decode(TopicKind::Messages, raw).is_err());
    }

    #[test]
    fn test_wrong_field_type_rejected() {
        let raw = br#"{"username":"bob","isTyping":"yes","timestamp":1,"publicKey":"k"}"#;
        assert!(Envelope::decode(TopicKind::Typing, raw).is_err());
    }

    #[test]
    fn test_unknown_fields_ignored() {
        let raw = br#"{"requesterId":"c1","timestamp":5,"extra":"ignored"}"#;
        let decoded = Envelope::decode(TopicKind::PubKeyRequest, raw).unwrap();
        assert_eq!(
            decoded,
            Envelope::PubKeyRequest(PublicKeyRequest {
                requester_id: "c1".to_string(),
                timestamp: 5,
            })
        );
    }

    #[test]
    fn test_not_json_rejected() {
        assert!(Envelope::decode(TopicKind::Receipts, b"\xffgarbage").is_err());
    }
}
