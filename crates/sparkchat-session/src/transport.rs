//! Channel contract between the session and the pub/sub transport.
//!
//! The session never drives a broker connection itself; it consumes a
//! [`TransportHandle`] whose far side is owned by whatever adapter speaks
//! the actual broker protocol. Commands flow out, events flow in, and all
//! publishes are fire-and-forget (at-most-once delivery).

use std::time::Duration;

use tokio::sync::mpsc;

use sparkchat_shared::constants::RECONNECT_INTERVAL_MS;

/// Options a transport adapter is expected to honor when connecting.
#[derive(Debug, Clone)]
pub struct ConnectOptions {
    pub client_id: String,
    pub clean_session: bool,
    pub reconnect_interval: Duration,
}

impl ConnectOptions {
    pub fn new(client_id: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            clean_session: true,
            reconnect_interval: Duration::from_millis(RECONNECT_INTERVAL_MS),
        }
    }
}

/// Commands sent *into* the transport adapter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportCommand {
    /// Subscribe to a list of topics.
    Subscribe(Vec<String>),
    /// Publish a payload on a topic, at-most-once.
    Publish { topic: String, payload: Vec<u8> },
    /// Tear the connection down.
    Shutdown,
}

/// Events delivered *from* the transport adapter to the session.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// The connection is up; subscriptions may be issued.
    Connected,
    /// An inbound payload on a subscribed topic.
    Message { topic: String, payload: Vec<u8> },
    /// The connection dropped.
    Offline,
    /// The adapter is re-establishing the connection.
    Reconnecting,
    /// A transport-level error; non-fatal, the adapter retries on its own.
    Error(String),
}

/// The session's half of a transport connection.
pub struct TransportHandle {
    pub commands: mpsc::Sender<TransportCommand>,
    pub events: mpsc::Receiver<TransportEvent>,
}

impl TransportHandle {
    /// Build a handle together with the adapter-side endpoints. Used by
    /// adapters and by tests that play the transport role by hand.
    pub fn pair(
        capacity: usize,
    ) -> (
        TransportHandle,
        mpsc::Receiver<TransportCommand>,
        mpsc::Sender<TransportEvent>,
    ) {
        let (cmd_tx, cmd_rx) = mpsc::channel(capacity);
        let (event_tx, event_rx) = mpsc::channel(capacity);
        (
            TransportHandle {
                commands: cmd_tx,
                events: event_rx,
            },
            cmd_rx,
            event_tx,
        )
    }
}
