use thiserror::Error;

#[derive(Error, Debug)]
pub enum SparkError {
    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),

    #[error("Envelope error: {0}")]
    Envelope(#[from] EnvelopeError),

    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum CryptoError {
    #[error("Platform randomness unavailable")]
    Unavailable,

    #[error("Malformed public key encoding")]
    MalformedKey,

    #[error("Encryption failed")]
    EncryptionFailed,

    #[error("Decryption failed: invalid ciphertext or wrong key")]
    DecryptionFailed,
}

#[derive(Error, Debug)]
pub enum EnvelopeError {
    #[error("Schema violation: {0}")]
    Schema(#[from] serde_json::Error),

    #[error("Unknown topic: {0}")]
    UnknownTopic(String),
}

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("Transport handle closed mid-send")]
    RaceAbort,

    #[error("Session is not connected")]
    NotConnected,
}
