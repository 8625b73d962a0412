//! # sparkchat-session
//!
//! The end-to-end encrypted group-messaging engine: key bootstrap and
//! exchange, per-recipient multi-encryption, inbound validation and
//! decryption, delivery-receipt aggregation, and typing presence with
//! expiry, all layered on a best-effort pub/sub transport.
//!
//! The session runs as a single tokio actor; external code drives it
//! through typed command/event channels and supplies the transport as a
//! channel pair (see [`transport`]). An in-memory broker is provided for
//! tests and loopback use.

pub mod broker;
pub mod directory;
pub mod profile;
pub mod session;
pub mod transport;
pub mod typing;

pub use broker::InMemoryBroker;
pub use directory::{ImportedKey, PeerKeyDirectory};
pub use profile::{Profile, ProfileError, ProfileStore};
pub use session::{
    spawn_session, Identity, Message, MessageReceipt, PeerStatus, SessionCommand, SessionConfig,
    SessionEvent, SessionSnapshot,
};
pub use transport::{ConnectOptions, TransportCommand, TransportEvent, TransportHandle};
pub use typing::{typing_summary, TypingState};
