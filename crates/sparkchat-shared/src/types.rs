use serde::{Deserialize, Serialize};

use crate::constants::{DEFAULT_BROKER_URL, DEFAULT_PORT, DEFAULT_TOPIC_PREFIX};

/// Exported textual encoding of an X25519 public key (base64).
///
/// Doubles as the stable identifier for a peer's cryptographic identity:
/// it keys the peer-key cache and the per-recipient ciphertext map on the
/// wire.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct SerializedKey(pub String);

impl SerializedKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Abbreviated form for log output. The string comes off the wire, so
    /// the cut must land on a char boundary.
    pub fn short(&self) -> &str {
        let end = self
            .0
            .char_indices()
            .nth(8)
            .map_or(self.0.len(), |(i, _)| i);
        &self.0[..end]
    }
}

impl std::fmt::Display for SerializedKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for SerializedKey {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Connection lifecycle as reported by the transport.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Connected,
    Error,
}

/// Delivery-receipt status ladder. The derived ordering is the monotonic
/// upgrade rule: `Sent < Received < Decrypted`, and a receipt may only move
/// a message's per-peer status forward.
///
/// `Sent` is reserved on the wire; no code path emits it.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum ReceiptStatus {
    Sent,
    Received,
    Decrypted,
}

/// Broker configuration, persisted by the profile store.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ServerConfig {
    pub broker_url: String,
    pub port: u16,
    pub topic_prefix: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            broker_url: DEFAULT_BROKER_URL.to_string(),
            port: DEFAULT_PORT,
            topic_prefix: DEFAULT_TOPIC_PREFIX.to_string(),
        }
    }
}

/// The five protocol channels, parameterized by a topic prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TopicKind {
    Messages,
    Typing,
    PubKeys,
    PubKeyRequest,
    Receipts,
}

impl TopicKind {
    pub const ALL: [TopicKind; 5] = [
        TopicKind::Messages,
        TopicKind::Typing,
        TopicKind::PubKeys,
        TopicKind::PubKeyRequest,
        TopicKind::Receipts,
    ];

    fn suffix(self) -> &'static str {
        match self {
            TopicKind::Messages => "messages",
            TopicKind::Typing => "typing",
            TopicKind::PubKeys => "pubkeys",
            TopicKind::PubKeyRequest => "pubkey-request",
            TopicKind::Receipts => "receipts",
        }
    }

    pub fn to_topic(self, prefix: &str) -> String {
        format!("{}/{}", prefix, self.suffix())
    }

    /// Map an inbound topic string back to its channel, if it belongs to
    /// this prefix.
    pub fn from_topic(prefix: &str, topic: &str) -> Option<TopicKind> {
        let rest = topic.strip_prefix(prefix)?.strip_prefix('/')?;
        TopicKind::ALL.into_iter().find(|k| k.suffix() == rest)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_receipt_status_ladder() {
        assert!(ReceiptStatus::Sent < ReceiptStatus::Received);
        assert!(ReceiptStatus::Received < ReceiptStatus::Decrypted);
    }

    #[test]
    fn test_receipt_status_wire_encoding() {
        assert_eq!(
            serde_json::to_string(&ReceiptStatus::Decrypted).unwrap(),
            "\"decrypted\""
        );
        let parsed: ReceiptStatus = serde_json::from_str("\"received\"").unwrap();
        assert_eq!(parsed, ReceiptStatus::Received);
        assert!(serde_json::from_str::<ReceiptStatus>("\"read\"").is_err());
    }

    #[test]
    fn test_short_respects_char_boundaries() {
        assert_eq!(SerializedKey::from("abcdefghij").short(), "abcdefgh");
        assert_eq!(SerializedKey::from("abc").short(), "abc");
        // Keys are untrusted wire data and may carry multibyte UTF-8.
        assert_eq!(SerializedKey::from("ぁぁぁ").short(), "ぁぁぁ");
        let long = SerializedKey::from("ぁぁぁぁぁぁぁぁぁぁ");
        assert_eq!(long.short().chars().count(), 8);
    }

    #[test]
    fn test_topic_roundtrip() {
        for kind in TopicKind::ALL {
            let topic = kind.to_topic("spark-chat-room");
            assert_eq!(TopicKind::from_topic("spark-chat-room", &topic), Some(kind));
        }
    }

    #[test]
    fn test_topic_foreign_prefix_ignored() {
        assert_eq!(
            TopicKind::from_topic("spark-chat-room", "other-room/messages"),
            None
        );
        assert_eq!(
            TopicKind::from_topic("spark-chat-room", "spark-chat-room/unknown"),
            None
        );
    }

    #[test]
    fn test_server_config_wire_field_names() {
        let json = serde_json::to_string(&ServerConfig::default()).unwrap();
        assert!(json.contains("brokerUrl"));
        assert!(json.contains("topicPrefix"));
    }
}
