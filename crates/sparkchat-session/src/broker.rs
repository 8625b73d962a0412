//! In-memory pub/sub broker.
//!
//! A loopback transport adapter for tests and local demos. It mimics the
//! semantics the protocol assumes of a real broker: byte payloads fanned
//! out by topic to every subscriber (including the publisher), no ordering
//! or delivery guarantee across clients, no insight into payload content.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use tracing::debug;

use crate::transport::{ConnectOptions, TransportCommand, TransportEvent, TransportHandle};

const CHANNEL_CAPACITY: usize = 256;

struct ClientEntry {
    subscriptions: HashSet<String>,
    events: mpsc::Sender<TransportEvent>,
}

#[derive(Default)]
struct BrokerState {
    clients: HashMap<u64, ClientEntry>,
}

/// A shared broker instance; clone-cheap via `Arc` inside.
#[derive(Clone, Default)]
pub struct InMemoryBroker {
    state: Arc<Mutex<BrokerState>>,
    next_id: Arc<AtomicU64>,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a new client and return the session-side transport handle.
    ///
    /// The `Connected` event is queued immediately; a per-client task relays
    /// commands into the shared broker state until the handle is dropped.
    /// Of the options only the client id is meaningful here (it tags the
    /// broker's logs); a real adapter honors the clean-session flag and
    /// reconnect interval too.
    pub fn connect(&self, options: &ConnectOptions) -> TransportHandle {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        debug!(client = id, client_id = %options.client_id, "Broker client attached");
        let (cmd_tx, mut cmd_rx) = mpsc::channel::<TransportCommand>(CHANNEL_CAPACITY);
        let (event_tx, event_rx) = mpsc::channel::<TransportEvent>(CHANNEL_CAPACITY);

        {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            state.clients.insert(
                id,
                ClientEntry {
                    subscriptions: HashSet::new(),
                    events: event_tx.clone(),
                },
            );
        }

        // Queue the connect notification before any command is processed.
        let _ = event_tx.try_send(TransportEvent::Connected);

        let state = self.state.clone();
        tokio::spawn(async move {
            while let Some(cmd) = cmd_rx.recv().await {
                match cmd {
                    TransportCommand::Subscribe(topics) => {
                        let mut state = state.lock().unwrap_or_else(|e| e.into_inner());
                        if let Some(entry) = state.clients.get_mut(&id) {
                            for topic in topics {
                                debug!(client = id, topic = %topic, "Broker subscribe");
                                entry.subscriptions.insert(topic);
                            }
                        }
                    }
                    TransportCommand::Publish { topic, payload } => {
                        let targets: Vec<mpsc::Sender<TransportEvent>> = {
                            let state = state.lock().unwrap_or_else(|e| e.into_inner());
                            state
                                .clients
                                .values()
                                .filter(|c| c.subscriptions.contains(&topic))
                                .map(|c| c.events.clone())
                                .collect()
                        };
                        debug!(
                            client = id,
                            topic = %topic,
                            subscribers = targets.len(),
                            "Broker fanout"
                        );
                        for target in targets {
                            // At-most-once: a full or closed subscriber just
                            // misses the payload. Must not block, or one slow
                            // subscriber stalls fanout for everybody.
                            let _ = target.try_send(TransportEvent::Message {
                                topic: topic.clone(),
                                payload: payload.clone(),
                            });
                        }
                    }
                    TransportCommand::Shutdown => break,
                }
            }

            let mut state = state.lock().unwrap_or_else(|e| e.into_inner());
            state.clients.remove(&id);
            debug!(client = id, "Broker client detached");
        });

        TransportHandle {
            commands: cmd_tx,
            events: event_rx,
        }
    }

    /// Number of currently attached clients.
    pub fn client_count(&self) -> usize {
        self.state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clients
            .len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn recv_message(handle: &mut TransportHandle) -> (String, Vec<u8>) {
        loop {
            match handle.events.recv().await.expect("broker event") {
                TransportEvent::Message { topic, payload } => return (topic, payload),
                _ => continue,
            }
        }
    }

    #[tokio::test]
    async fn test_fanout_to_subscribers_including_publisher() {
        let broker = InMemoryBroker::new();
        let mut a = broker.connect(&ConnectOptions::new("client-a"));
        let mut b = broker.connect(&ConnectOptions::new("client-b"));

        a.commands
            .send(TransportCommand::Subscribe(vec!["room/messages".into()]))
            .await
            .unwrap();
        b.commands
            .send(TransportCommand::Subscribe(vec!["room/messages".into()]))
            .await
            .unwrap();

        a.commands
            .send(TransportCommand::Publish {
                topic: "room/messages".into(),
                payload: b"hello".to_vec(),
            })
            .await
            .unwrap();

        let (topic, payload) = recv_message(&mut b).await;
        assert_eq!(topic, "room/messages");
        assert_eq!(payload, b"hello");

        // The broker echoes to the publisher too.
        let (topic, payload) = recv_message(&mut a).await;
        assert_eq!(topic, "room/messages");
        assert_eq!(payload, b"hello");
    }

    #[tokio::test]
    async fn test_non_subscriber_receives_nothing() {
        let broker = InMemoryBroker::new();
        let mut a = broker.connect(&ConnectOptions::new("client-a"));
        let mut b = broker.connect(&ConnectOptions::new("client-b"));

        a.commands
            .send(TransportCommand::Subscribe(vec!["room/typing".into()]))
            .await
            .unwrap();
        b.commands
            .send(TransportCommand::Subscribe(vec!["room/messages".into()]))
            .await
            .unwrap();

        b.commands
            .send(TransportCommand::Publish {
                topic: "room/messages".into(),
                payload: b"x".to_vec(),
            })
            .await
            .unwrap();
        // Marker on a's topic proves the previous publish was fanned out
        // already and a got nothing on room/messages.
        b.commands
            .send(TransportCommand::Publish {
                topic: "room/typing".into(),
                payload: b"marker".to_vec(),
            })
            .await
            .unwrap();

        let (topic, payload) = recv_message(&mut a).await;
        assert_eq!(topic, "room/typing");
        assert_eq!(payload, b"marker");
    }

    #[tokio::test]
    async fn test_full_subscriber_does_not_stall_fanout() {
        let broker = InMemoryBroker::new();
        let mut a = broker.connect(&ConnectOptions::new("client-a"));
        let b = broker.connect(&ConnectOptions::new("client-b"));

        a.commands
            .send(TransportCommand::Subscribe(vec!["room/messages".into()]))
            .await
            .unwrap();
        b.commands
            .send(TransportCommand::Subscribe(vec!["room/messages".into()]))
            .await
            .unwrap();

        // b never drains its events. Flood well past its channel capacity;
        // once b is full the overflow is dropped rather than blocking the
        // relay.
        for _ in 0..(CHANNEL_CAPACITY * 2) {
            a.commands
                .send(TransportCommand::Publish {
                    topic: "room/messages".into(),
                    payload: b"flood".to_vec(),
                })
                .await
                .unwrap();
            // a drains its own echo so only b fills up.
            let _ = recv_message(&mut a).await;
        }

        a.commands
            .send(TransportCommand::Publish {
                topic: "room/messages".into(),
                payload: b"marker".to_vec(),
            })
            .await
            .unwrap();
        let (_, payload) = recv_message(&mut a).await;
        assert_eq!(payload, b"marker");
    }

    #[tokio::test]
    async fn test_shutdown_detaches_client() {
        let broker = InMemoryBroker::new();
        let a = broker.connect(&ConnectOptions::new("client-a"));
        assert_eq!(broker.client_count(), 1);

        a.commands.send(TransportCommand::Shutdown).await.unwrap();
        // Give the relay task a moment to unwind.
        for _ in 0..50 {
            if broker.client_count() == 0 {
                return;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        panic!("client was not detached after shutdown");
    }
}
