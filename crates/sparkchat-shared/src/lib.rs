//! # sparkchat-shared
//!
//! Wire types, key agreement, and the error taxonomy shared by all
//! sparkchat crates. Everything here is plain data plus pure crypto; the
//! protocol engine lives in `sparkchat-session`.

pub mod constants;
pub mod crypto;
pub mod envelope;
pub mod error;
pub mod types;

pub use crypto::KeyPair;
pub use envelope::Envelope;
pub use error::{CryptoError, EnvelopeError, SessionError, SparkError};
pub use types::{ConnectionStatus, ReceiptStatus, SerializedKey, ServerConfig, TopicKind};
