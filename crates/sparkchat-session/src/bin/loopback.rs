//! Loopback demo: two sessions exchanging one encrypted message over the
//! in-memory broker. Exercises the whole pipeline (key bootstrap, typing,
//! per-recipient encryption, delivery receipts) and prints what each side
//! observes. `RUST_LOG=debug` shows the protocol traffic.

use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::info;
use tracing_subscriber::EnvFilter;

use sparkchat_session::{
    spawn_session, ConnectOptions, Identity, InMemoryBroker, ProfileStore, SessionCommand,
    SessionConfig, SessionEvent,
};

const WAIT: Duration = Duration::from_secs(10);

async fn wait_for(
    events: &mut mpsc::Receiver<SessionEvent>,
    mut pred: impl FnMut(&SessionEvent) -> bool,
) -> anyhow::Result<SessionEvent> {
    loop {
        let event = timeout(WAIT, events.recv())
            .await
            .map_err(|_| anyhow::anyhow!("timed out waiting for session event"))?
            .ok_or_else(|| anyhow::anyhow!("session terminated"))?;
        if pred(&event) {
            return Ok(event);
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,sparkchat_session=debug")),
        )
        .init();

    info!("Starting sparkchat loopback demo v{}", env!("CARGO_PKG_VERSION"));

    // The saved profile names the local side; the peer is scripted.
    let profile = ProfileStore::open_default()?.load();
    let local = Identity::generate(&profile.display_name)?;
    let peer = Identity::generate("peer")?;
    info!(name = %local.display_name(), key = %local.public_key().short(), "Local identity");

    let broker = InMemoryBroker::new();
    let local_transport = broker.connect(&ConnectOptions::new(local.client_id()));
    let peer_transport = broker.connect(&ConnectOptions::new(peer.client_id()));
    let (local_cmds, mut local_events) =
        spawn_session(local, SessionConfig::default(), local_transport);
    let (peer_cmds, mut peer_events) =
        spawn_session(peer, SessionConfig::default(), peer_transport);

    // Key knowledge converges through announce and request. Sessions that
    // join at the same instant can miss each other's first announcement,
    // so nudge with periodic re-requests until the peer key lands.
    let nudge = {
        let cmds = local_cmds.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(Duration::from_millis(500));
            loop {
                tick.tick().await;
                if cmds.send(SessionCommand::RequestPublicKeys).await.is_err() {
                    break;
                }
            }
        })
    };
    wait_for(&mut local_events, |e| {
        matches!(e, SessionEvent::PeerUpdated(p) if p.username == "peer" && p.has_public_key)
    })
    .await?;
    nudge.abort();
    info!("Peer key exchanged");

    local_cmds
        .send(SessionCommand::InputActivity { has_content: true })
        .await?;
    local_cmds
        .send(SessionCommand::SendMessage("hello over loopback".to_string()))
        .await?;

    let event = wait_for(&mut peer_events, |e| {
        matches!(e, SessionEvent::MessageAppended(_))
    })
    .await?;
    if let SessionEvent::MessageAppended(message) = event {
        info!(author = %message.username, text = %message.text, "Peer decrypted the message");
    }

    let event = wait_for(&mut local_events, |e| {
        matches!(e, SessionEvent::ReceiptUpdated { .. })
    })
    .await?;
    if let SessionEvent::ReceiptUpdated { receipt, .. } = event {
        info!(from = %receipt.username, status = ?receipt.status, "Delivery receipt");
    }

    local_cmds.send(SessionCommand::Shutdown).await?;
    peer_cmds.send(SessionCommand::Shutdown).await?;
    info!("Done");
    Ok(())
}
