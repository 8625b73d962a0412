/// XChaCha20-Poly1305 nonce size in bytes
pub const NONCE_SIZE: usize = 24;

/// X25519 public key size in bytes
pub const PUBKEY_SIZE: usize = 32;

/// Symmetric key size in bytes (for XChaCha20-Poly1305)
pub const SYMMETRIC_KEY_SIZE: usize = 32;

/// Key derivation context (BLAKE3) for per-pair message keys
pub const KDF_CONTEXT_MESSAGE_KEY: &str = "sparkchat-message-key-v1";

/// Default broker URL
pub const DEFAULT_BROKER_URL: &str = "wss://test.mosquitto.org";

/// Default broker port
pub const DEFAULT_PORT: u16 = 8081;

/// Default topic prefix for all protocol channels
pub const DEFAULT_TOPIC_PREFIX: &str = "spark-chat-room";

/// Minimum gap between two outbound typing-start signals
pub const TYPING_THROTTLE_MS: u64 = 1000;

/// Idle window after which a deferred typing-stop signal fires
pub const TYPING_IDLE_TIMEOUT_MS: u64 = 3000;

/// Maximum age of a peer's typing indicator absent a refresh
pub const TYPING_EXPIRY_MS: i64 = 3000;

/// Interval of the recurring typing-expiry sweep
pub const TYPING_SWEEP_INTERVAL_MS: u64 = 1000;

/// Number of random base36 characters in a message id suffix
pub const MESSAGE_ID_RANDOM_LENGTH: usize = 7;

/// Broker reconnect interval passed to the transport
pub const RECONNECT_INTERVAL_MS: u64 = 5000;
