//! The protocol engine.
//!
//! A session is a single actor spawned on a tokio task. It owns the local
//! identity, the peer table, the message log, the typing state, and the
//! peer-key directory, and it is the only writer of any of them. External
//! code drives it through a command channel and observes it through an
//! event channel; the transport feeds it connection status and inbound
//! payloads through the [`TransportHandle`].
//!
//! Everything arriving from the network is untrusted: schema violations,
//! malformed keys, and failed decryptions are logged and dropped, never
//! propagated out of the dispatch loop.

use std::collections::HashMap;

use rand::Rng;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{interval, sleep_until, Duration, Instant};
use tracing::{debug, info, warn};
use uuid::Uuid;

use sparkchat_shared::constants::{
    DEFAULT_TOPIC_PREFIX, MESSAGE_ID_RANDOM_LENGTH, TYPING_EXPIRY_MS, TYPING_IDLE_TIMEOUT_MS,
    TYPING_SWEEP_INTERVAL_MS, TYPING_THROTTLE_MS,
};
use sparkchat_shared::crypto::{self, KeyPair};
use sparkchat_shared::envelope::{
    self, DeliveryReceipt, EncryptedMessage, Envelope, PublicKeyAnnouncement, PublicKeyRequest,
    TypingEvent,
};
use sparkchat_shared::error::{CryptoError, SessionError};
use sparkchat_shared::types::{ConnectionStatus, ReceiptStatus, SerializedKey, TopicKind};

use crate::directory::PeerKeyDirectory;
use crate::transport::{TransportCommand, TransportEvent, TransportHandle};
use crate::typing::TypingState;

const CHANNEL_CAPACITY: usize = 256;

const BASE36: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";

fn random_base36(len: usize) -> String {
    let mut rng = rand::thread_rng();
    (0..len)
        .map(|_| BASE36[rng.gen_range(0..BASE36.len())] as char)
        .collect()
}

fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// The local cryptographic identity plus self-asserted display name.
///
/// Created once per session start; the key pair never changes for the
/// session's lifetime and the secret half is never exported.
#[derive(Clone)]
pub struct Identity {
    key_pair: KeyPair,
    public_key: SerializedKey,
    display_name: String,
    client_id: String,
}

impl Identity {
    /// Generate a fresh identity. An empty display name falls back to an
    /// anonymous handle.
    pub fn generate(display_name: &str) -> Result<Self, CryptoError> {
        let key_pair = KeyPair::generate()?;
        let public_key = key_pair.serialized_public();
        let display_name = match display_name.trim() {
            "" => format!("Anonymous-{}", random_base36(5)),
            name => name.to_string(),
        };
        let client_id = format!("spark-chat-{}", Uuid::new_v4().simple());
        Ok(Self {
            key_pair,
            public_key,
            display_name,
            client_id,
        })
    }

    pub fn display_name(&self) -> &str {
        &self.display_name
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn public_key(&self) -> &SerializedKey {
        &self.public_key
    }
}

/// Timing knobs and the topic prefix. Defaults match the protocol
/// constants; tests shrink the windows.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub topic_prefix: String,
    pub typing_throttle: Duration,
    pub typing_idle_timeout: Duration,
    pub typing_expiry_ms: i64,
    pub sweep_interval: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            topic_prefix: DEFAULT_TOPIC_PREFIX.to_string(),
            typing_throttle: Duration::from_millis(TYPING_THROTTLE_MS),
            typing_idle_timeout: Duration::from_millis(TYPING_IDLE_TIMEOUT_MS),
            typing_expiry_ms: TYPING_EXPIRY_MS,
            sweep_interval: Duration::from_millis(TYPING_SWEEP_INTERVAL_MS),
        }
    }
}

/// A decrypted (or locally authored) chat message.
#[derive(Debug, Clone)]
pub struct Message {
    pub id: String,
    pub username: String,
    pub text: String,
    pub timestamp: i64,
    /// Per-peer delivery acknowledgements, keyed by reporting display name.
    pub receipts: HashMap<String, MessageReceipt>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageReceipt {
    pub username: String,
    pub status: ReceiptStatus,
    pub timestamp: i64,
}

/// What we know about a peer, keyed by display name in the peer table.
#[derive(Debug, Clone)]
pub struct PeerStatus {
    pub username: String,
    pub public_key: Option<SerializedKey>,
    pub has_public_key: bool,
    pub last_seen: i64,
}

/// Commands driving the session actor.
#[derive(Debug)]
pub enum SessionCommand {
    /// Encrypt and publish a chat message to all known recipients.
    SendMessage(String),
    /// Local input activity, for the typing indicator.
    InputActivity { has_content: bool },
    /// Re-broadcast a public-key request.
    RequestPublicKeys,
    /// Snapshot the current state.
    Snapshot(oneshot::Sender<SessionSnapshot>),
    /// Tear the session down.
    Shutdown,
}

/// Change notifications emitted after each dispatch.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    StatusChanged(ConnectionStatus),
    MessageAppended(Message),
    ReceiptUpdated {
        message_id: String,
        receipt: MessageReceipt,
    },
    PeerUpdated(PeerStatus),
    TypingChanged(Vec<String>),
}

/// A copy of the session state at one point in its timeline.
#[derive(Debug, Clone)]
pub struct SessionSnapshot {
    pub status: ConnectionStatus,
    pub display_name: String,
    pub public_key: SerializedKey,
    pub messages: Vec<Message>,
    pub peers: Vec<PeerStatus>,
    pub typing: Vec<String>,
}

/// Spawn the session actor.
///
/// Returns the command sender and event receiver; the actor runs until a
/// `Shutdown` command arrives or both the command channel and the transport
/// event channel close.
pub fn spawn_session(
    identity: Identity,
    config: SessionConfig,
    transport: TransportHandle,
) -> (mpsc::Sender<SessionCommand>, mpsc::Receiver<SessionEvent>) {
    let (cmd_tx, mut cmd_rx) = mpsc::channel::<SessionCommand>(CHANNEL_CAPACITY);
    let (event_tx, event_rx) = mpsc::channel::<SessionEvent>(CHANNEL_CAPACITY);

    let TransportHandle {
        commands: transport_tx,
        events: mut transport_rx,
    } = transport;

    tokio::spawn(async move {
        let mut session = Session {
            identity,
            config,
            status: ConnectionStatus::Disconnected,
            directory: PeerKeyDirectory::new(),
            peers: HashMap::new(),
            messages: Vec::new(),
            message_index: HashMap::new(),
            typing: TypingState::new(),
            transport_tx,
            events: event_tx,
            last_typing_emit: None,
            typing_stop_deadline: None,
        };

        let mut sweep = interval(session.config.sweep_interval);

        loop {
            // Dummy deadline when no stop is pending; the branch is disabled.
            let stop_deadline = session.typing_stop_deadline.unwrap_or_else(Instant::now);

            tokio::select! {
                cmd = cmd_rx.recv() => {
                    match cmd {
                        Some(SessionCommand::Shutdown) | None => {
                            info!("Session shutdown requested");
                            break;
                        }
                        Some(cmd) => session.handle_command(cmd).await,
                    }
                }

                event = transport_rx.recv() => {
                    match event {
                        Some(event) => session.handle_transport_event(event).await,
                        None => {
                            info!("Transport event channel closed, shutting down session");
                            break;
                        }
                    }
                }

                _ = sweep.tick() => {
                    session.sweep_typing().await;
                }

                _ = sleep_until(stop_deadline), if session.typing_stop_deadline.is_some() => {
                    session.typing_stop_deadline = None;
                    session.emit_typing_signal(false).await;
                }
            }
        }

        info!("Session event loop terminated");
    });

    (cmd_tx, event_rx)
}

struct Session {
    identity: Identity,
    config: SessionConfig,
    status: ConnectionStatus,
    directory: PeerKeyDirectory,
    peers: HashMap<String, PeerStatus>,
    messages: Vec<Message>,
    message_index: HashMap<String, usize>,
    typing: TypingState,
    transport_tx: mpsc::Sender<TransportCommand>,
    events: mpsc::Sender<SessionEvent>,
    last_typing_emit: Option<Instant>,
    typing_stop_deadline: Option<Instant>,
}

impl Session {
    fn topic(&self, kind: TopicKind) -> String {
        kind.to_topic(&self.config.topic_prefix)
    }

    async fn emit(&self, event: SessionEvent) {
        let _ = self.events.send(event).await;
    }

    async fn set_status(&mut self, status: ConnectionStatus) {
        if self.status != status {
            debug!(status = ?status, "Connection status changed");
            self.status = status;
            self.emit(SessionEvent::StatusChanged(status)).await;
        }
    }

    // -----------------------------------------------------------------
    // Commands
    // -----------------------------------------------------------------

    async fn handle_command(&mut self, cmd: SessionCommand) {
        match cmd {
            SessionCommand::SendMessage(text) => self.send_message(&text).await,
            SessionCommand::InputActivity { has_content } => {
                self.handle_input_activity(has_content).await
            }
            SessionCommand::RequestPublicKeys => {
                if self.status == ConnectionStatus::Connected {
                    self.request_public_keys().await;
                }
            }
            SessionCommand::Snapshot(reply) => {
                let _ = reply.send(self.snapshot());
            }
            // Shutdown breaks the event loop before reaching here.
            SessionCommand::Shutdown => {}
        }
    }

    fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            status: self.status,
            display_name: self.identity.display_name.clone(),
            public_key: self.identity.public_key.clone(),
            messages: self.messages.clone(),
            peers: self.peers.values().cloned().collect(),
            typing: self.typing.snapshot(),
        }
    }

    async fn send_message(&mut self, text: &str) {
        let text = text.trim();
        if text.is_empty() {
            return;
        }
        if self.status != ConnectionStatus::Connected {
            debug!(error = %SessionError::NotConnected, "Dropping send");
            return;
        }

        // Sending implies the user stopped typing.
        self.typing_stop_deadline = None;
        self.emit_typing_signal(false).await;

        // Recipient set: every known peer key plus our own, so the sender's
        // other clients could read the message symmetrically.
        let mut recipients = self.directory.known_keys().await;
        let mut encrypted = HashMap::with_capacity(recipients.len() + 1);

        for recipient in recipients.drain(..) {
            match crypto::encrypt_for(text, self.identity.key_pair.secret(), &recipient.key) {
                Ok(ciphertext) => {
                    encrypted.insert(recipient.serialized, ciphertext);
                }
                Err(e) => {
                    warn!(key = %recipient.serialized.short(), error = %e, "Skipping recipient: encryption failed");
                }
            }
        }
        match crypto::encrypt_for(
            text,
            self.identity.key_pair.secret(),
            self.identity.key_pair.public(),
        ) {
            Ok(ciphertext) => {
                encrypted.insert(self.identity.public_key.clone(), ciphertext);
            }
            Err(e) => {
                warn!(error = %e, "Self-encryption failed, message not sent");
                return;
            }
        }

        let timestamp = now_millis();
        let wire = EncryptedMessage {
            id: format!("{}-{}", timestamp, random_base36(MESSAGE_ID_RANDOM_LENGTH)),
            username: self.identity.display_name.clone(),
            encrypted,
            timestamp,
            sender_public_key: self.identity.public_key.clone(),
        };

        self.publish(TopicKind::Messages, &wire).await;

        // The author's copy comes straight from the plaintext; no publish
        // acknowledgement and no self-decrypt round trip.
        let message = Message {
            id: wire.id,
            username: self.identity.display_name.clone(),
            text: text.to_string(),
            timestamp,
            receipts: HashMap::new(),
        };
        if self.append_message(message.clone()) {
            self.emit(SessionEvent::MessageAppended(message)).await;
        }
    }

    async fn handle_input_activity(&mut self, has_content: bool) {
        if self.status != ConnectionStatus::Connected {
            return;
        }
        if !has_content {
            // Input cleared: stop right away instead of waiting out the
            // idle window.
            if self.typing_stop_deadline.take().is_some() {
                self.emit_typing_signal(false).await;
            }
            return;
        }

        let now = Instant::now();
        let throttled = self
            .last_typing_emit
            .is_some_and(|last| now.duration_since(last) < self.config.typing_throttle);
        if !throttled {
            self.emit_typing_signal(true).await;
            self.last_typing_emit = Some(now);
        }

        // Any activity pushes the deferred stop signal out.
        self.typing_stop_deadline = Some(now + self.config.typing_idle_timeout);
    }

    async fn emit_typing_signal(&self, is_typing: bool) {
        if self.status != ConnectionStatus::Connected {
            return;
        }
        let event = TypingEvent {
            username: self.identity.display_name.clone(),
            is_typing,
            timestamp: now_millis(),
            public_key: self.identity.public_key.clone(),
        };
        self.publish(TopicKind::Typing, &event).await;
    }

    // -----------------------------------------------------------------
    // Transport events
    // -----------------------------------------------------------------

    async fn handle_transport_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Connected => {
                info!("Transport connected");
                self.set_status(ConnectionStatus::Connected).await;
                self.subscribe_all().await;
                self.announce_public_key().await;
                self.request_public_keys().await;
            }
            TransportEvent::Message { topic, payload } => {
                self.dispatch(&topic, &payload).await;
            }
            TransportEvent::Offline => {
                info!("Transport offline");
                self.set_status(ConnectionStatus::Disconnected).await;
            }
            TransportEvent::Reconnecting => {
                info!("Transport reconnecting, resetting session epoch");
                self.set_status(ConnectionStatus::Connecting).await;
                self.reset_epoch().await;
            }
            TransportEvent::Error(e) => {
                warn!(error = %e, "Transport error");
                self.set_status(ConnectionStatus::Error).await;
            }
        }
    }

    /// Clear all per-connection-epoch state. Identity and key pair survive;
    /// a reconnect is a fresh logical session on the same identity.
    async fn reset_epoch(&mut self) {
        self.messages.clear();
        self.message_index.clear();
        self.peers.clear();
        self.typing.clear();
        self.directory.clear().await;
        self.last_typing_emit = None;
        self.typing_stop_deadline = None;
        self.emit(SessionEvent::TypingChanged(Vec::new())).await;
    }

    async fn subscribe_all(&self) {
        let topics = TopicKind::ALL
            .into_iter()
            .map(|k| self.topic(k))
            .collect::<Vec<_>>();
        if self
            .transport_tx
            .send(TransportCommand::Subscribe(topics))
            .await
            .is_err()
        {
            warn!("Subscribe failed: transport handle closed");
        }
    }

    async fn announce_public_key(&self) {
        let announcement = PublicKeyAnnouncement {
            username: self.identity.display_name.clone(),
            public_key: self.identity.public_key.clone(),
            timestamp: now_millis(),
        };
        self.publish(TopicKind::PubKeys, &announcement).await;
    }

    async fn request_public_keys(&self) {
        let request = PublicKeyRequest {
            requester_id: self.identity.client_id.clone(),
            timestamp: now_millis(),
        };
        self.publish(TopicKind::PubKeyRequest, &request).await;
    }

    async fn send_receipt(&self, message_id: &str, status: ReceiptStatus) {
        let receipt = DeliveryReceipt {
            message_id: message_id.to_string(),
            username: self.identity.display_name.clone(),
            status,
            timestamp: now_millis(),
        };
        self.publish(TopicKind::Receipts, &receipt).await;
    }

    /// Serialize and publish on a protocol channel, fire-and-forget.
    ///
    /// The handle liveness is re-checked right before the send: encryption
    /// suspends, and a disconnect may have raced in between.
    async fn publish<T: serde::Serialize>(&self, kind: TopicKind, value: &T) {
        let topic = self.topic(kind);
        let payload = match envelope::encode(value) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(topic = %topic, error = %e, "Failed to encode payload");
                return;
            }
        };
        if self.transport_tx.is_closed() {
            warn!(topic = %topic, error = %SessionError::RaceAbort, "Aborting publish");
            return;
        }
        if self
            .transport_tx
            .send(TransportCommand::Publish { topic: topic.clone(), payload })
            .await
            .is_err()
        {
            warn!(topic = %topic, error = %SessionError::RaceAbort, "Publish dropped");
        }
    }

    // -----------------------------------------------------------------
    // Inbound dispatch
    // -----------------------------------------------------------------

    async fn dispatch(&mut self, topic: &str, payload: &[u8]) {
        let Some(kind) = TopicKind::from_topic(&self.config.topic_prefix, topic) else {
            debug!(topic = %topic, "Ignoring message on foreign topic");
            return;
        };

        let envelope = match Envelope::decode(kind, payload) {
            Ok(envelope) => envelope,
            Err(e) => {
                debug!(topic = %topic, error = %e, "Dropping invalid envelope");
                return;
            }
        };

        match envelope {
            Envelope::Message(msg) => self.on_message(msg).await,
            Envelope::Typing(event) => self.on_typing(event).await,
            Envelope::PubKeyAnnounce(announcement) => self.on_pubkey_announce(announcement).await,
            Envelope::PubKeyRequest(request) => self.on_pubkey_request(request).await,
            Envelope::Receipt(receipt) => self.on_receipt(receipt).await,
        }
    }

    async fn on_message(&mut self, msg: EncryptedMessage) {
        // The broker fans out to all subscribers including us.
        if msg.username == self.identity.display_name {
            return;
        }

        let cached = self.directory.get(&msg.sender_public_key).await;
        self.update_peer(
            &msg.username,
            Some(msg.sender_public_key.clone()),
            cached.is_some(),
        )
        .await;

        let sender_key = match cached {
            Some(imported) => imported.key,
            None => match self.directory.import_or_get(&msg.sender_public_key).await {
                Ok(imported) => {
                    self.update_peer(&msg.username, None, true).await;
                    imported.key
                }
                Err(e) => {
                    warn!(
                        author = %msg.username,
                        key = %msg.sender_public_key.short(),
                        error = %e,
                        "Dropping message: sender key import failed"
                    );
                    return;
                }
            },
        };

        // A missing entry for our key means the message predates our key
        // announcement; acknowledge delivery without decryption.
        let Some(ciphertext) = msg.encrypted.get(&self.identity.public_key) else {
            self.send_receipt(&msg.id, ReceiptStatus::Received).await;
            return;
        };

        let text = match crypto::decrypt_from(
            ciphertext,
            self.identity.key_pair.secret(),
            &sender_key,
        ) {
            Ok(text) => text,
            Err(e) => {
                debug!(author = %msg.username, id = %msg.id, error = %e, "Dropping undecryptable message");
                return;
            }
        };

        self.send_receipt(&msg.id, ReceiptStatus::Decrypted).await;

        let message = Message {
            id: msg.id,
            username: msg.username,
            text,
            timestamp: msg.timestamp,
            receipts: HashMap::new(),
        };
        if self.append_message(message.clone()) {
            self.emit(SessionEvent::MessageAppended(message)).await;
        }
    }

    async fn on_typing(&mut self, event: TypingEvent) {
        if event.username == self.identity.display_name {
            return;
        }

        let has_key = self.directory.contains(&event.public_key).await;
        self.update_peer(&event.username, Some(event.public_key.clone()), has_key)
            .await;

        if event.is_typing && !has_key {
            match self.directory.import_or_get(&event.public_key).await {
                Ok(_) => self.update_peer(&event.username, None, true).await,
                Err(e) => {
                    debug!(peer = %event.username, error = %e, "Typing peer key import failed");
                }
            }
        }

        let changed = if event.is_typing {
            self.typing.set(&event.username, event.timestamp)
        } else {
            self.typing.remove(&event.username)
        };
        if changed {
            self.emit(SessionEvent::TypingChanged(self.typing.snapshot()))
                .await;
        }
    }

    async fn on_pubkey_announce(&mut self, announcement: PublicKeyAnnouncement) {
        if announcement.username == self.identity.display_name {
            return;
        }

        if !self.directory.contains(&announcement.public_key).await {
            if let Err(e) = self.directory.import_or_get(&announcement.public_key).await {
                warn!(
                    peer = %announcement.username,
                    key = %announcement.public_key.short(),
                    error = %e,
                    "Dropping announcement: key import failed"
                );
                return;
            }
        }

        self.update_peer(
            &announcement.username,
            Some(announcement.public_key.clone()),
            true,
        )
        .await;
    }

    async fn on_pubkey_request(&mut self, request: PublicKeyRequest) {
        // A joiner's request makes every other client re-announce, so key
        // knowledge converges without a central directory.
        if request.requester_id != self.identity.client_id {
            debug!(requester = %request.requester_id, "Re-announcing public key");
            self.announce_public_key().await;
        }
    }

    async fn on_receipt(&mut self, receipt: DeliveryReceipt) {
        if receipt.username == self.identity.display_name {
            return;
        }

        // Unknown id: out-of-order arrival or a different session epoch.
        let Some(&index) = self.message_index.get(&receipt.message_id) else {
            debug!(id = %receipt.message_id, "Receipt for unknown message");
            return;
        };

        let message = &mut self.messages[index];
        let upgrade = message
            .receipts
            .get(&receipt.username)
            .map_or(true, |existing| receipt.status > existing.status);
        if !upgrade {
            return;
        }

        let entry = MessageReceipt {
            username: receipt.username.clone(),
            status: receipt.status,
            timestamp: receipt.timestamp,
        };
        message.receipts.insert(receipt.username, entry.clone());

        self.emit(SessionEvent::ReceiptUpdated {
            message_id: receipt.message_id,
            receipt: entry,
        })
        .await;
    }

    // -----------------------------------------------------------------
    // State helpers
    // -----------------------------------------------------------------

    /// Append respecting the id-dedup invariant. Returns false for an id
    /// already in the log.
    fn append_message(&mut self, message: Message) -> bool {
        if self.message_index.contains_key(&message.id) {
            debug!(id = %message.id, "Duplicate message id, not appending");
            return false;
        }
        self.message_index
            .insert(message.id.clone(), self.messages.len());
        self.messages.push(message);
        true
    }

    /// Upsert a peer record. A `None` public key keeps whatever key is
    /// already recorded.
    async fn update_peer(
        &mut self,
        username: &str,
        public_key: Option<SerializedKey>,
        has_public_key: bool,
    ) {
        let now = now_millis();
        let entry = self
            .peers
            .entry(username.to_string())
            .or_insert_with(|| PeerStatus {
                username: username.to_string(),
                public_key: None,
                has_public_key: false,
                last_seen: now,
            });
        if public_key.is_some() {
            entry.public_key = public_key;
        }
        entry.has_public_key = has_public_key;
        entry.last_seen = now;

        let snapshot = entry.clone();
        self.emit(SessionEvent::PeerUpdated(snapshot)).await;
    }

    async fn sweep_typing(&mut self) {
        if self.typing.is_empty() {
            return;
        }
        if self.typing.sweep(now_millis(), self.config.typing_expiry_ms) {
            self.emit(SessionEvent::TypingChanged(self.typing.snapshot()))
                .await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_anonymous_display_name_fallback() {
        let identity = Identity::generate("   ").unwrap();
        assert!(identity.display_name().starts_with("Anonymous-"));
        assert_eq!(identity.display_name().len(), "Anonymous-".len() + 5);
    }

    #[test]
    fn test_explicit_display_name_trimmed() {
        let identity = Identity::generate("  alice  ").unwrap();
        assert_eq!(identity.display_name(), "alice");
    }

    #[test]
    fn test_client_id_unique() {
        let a = Identity::generate("a").unwrap();
        let b = Identity::generate("b").unwrap();
        assert_ne!(a.client_id(), b.client_id());
        assert!(a.client_id().starts_with("spark-chat-"));
    }

    #[test]
    fn test_random_base36_charset() {
        let id = random_base36(32);
        assert_eq!(id.len(), 32);
        assert!(id.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit()));
    }
}
