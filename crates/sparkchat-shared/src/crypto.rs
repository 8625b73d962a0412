//! Key agreement and per-recipient message encryption.
//!
//! Each pair of peers shares a symmetric key derived from X25519
//! Diffie-Hellman, domain-separated through BLAKE3. Payloads are sealed
//! with XChaCha20-Poly1305 using a fresh random nonce per call and framed
//! as `nonce || ciphertext`, base64-encoded for the JSON wire.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use chacha20poly1305::{
    aead::{Aead, KeyInit},
    XChaCha20Poly1305, XNonce,
};
use rand::RngCore;
pub use x25519_dalek::{PublicKey, StaticSecret};

use crate::constants::{KDF_CONTEXT_MESSAGE_KEY, NONCE_SIZE, PUBKEY_SIZE};
use crate::error::CryptoError;
use crate::types::SerializedKey;

pub type SymmetricKey = [u8; 32];

/// An X25519 key pair. The secret half never leaves this struct in any
/// serialized form; only the public half is exported.
#[derive(Clone)]
pub struct KeyPair {
    secret: StaticSecret,
    public: PublicKey,
}

impl KeyPair {
    /// Generate a fresh key pair from OS randomness.
    pub fn generate() -> Result<Self, CryptoError> {
        let mut bytes = [0u8; 32];
        rand::rngs::OsRng
            .try_fill_bytes(&mut bytes)
            .map_err(|_| CryptoError::Unavailable)?;
        let secret = StaticSecret::from(bytes);
        let public = PublicKey::from(&secret);
        Ok(Self { secret, public })
    }

    pub fn public(&self) -> &PublicKey {
        &self.public
    }

    pub fn secret(&self) -> &StaticSecret {
        &self.secret
    }

    /// Exported form of the public half, as used on the wire.
    pub fn serialized_public(&self) -> SerializedKey {
        export_public_key(&self.public)
    }
}

/// Deterministic textual encoding of a public key. Round-trips exactly
/// through [`import_public_key`].
pub fn export_public_key(key: &PublicKey) -> SerializedKey {
    SerializedKey(BASE64.encode(key.as_bytes()))
}

/// Parse a serialized public key received from the network.
pub fn import_public_key(serialized: &SerializedKey) -> Result<PublicKey, CryptoError> {
    let bytes = BASE64
        .decode(serialized.as_str())
        .map_err(|_| CryptoError::MalformedKey)?;
    let arr: [u8; PUBKEY_SIZE] = bytes
        .try_into()
        .map_err(|_| CryptoError::MalformedKey)?;
    Ok(PublicKey::from(arr))
}

/// Derive the symmetric message key shared between two peers.
///
/// Symmetric by construction: (A-secret, B-public) and (B-secret, A-public)
/// yield the same key.
pub fn derive_message_key(my_secret: &StaticSecret, their_public: &PublicKey) -> SymmetricKey {
    let shared = my_secret.diffie_hellman(their_public);
    let mut hasher = blake3::Hasher::new_derive_key(KDF_CONTEXT_MESSAGE_KEY);
    hasher.update(shared.as_bytes());
    let hash = hasher.finalize();
    let mut key = [0u8; 32];
    key.copy_from_slice(&hash.as_bytes()[..32]);
    key
}

fn generate_nonce() -> Result<[u8; NONCE_SIZE], CryptoError> {
    let mut nonce = [0u8; NONCE_SIZE];
    rand::rngs::OsRng
        .try_fill_bytes(&mut nonce)
        .map_err(|_| CryptoError::Unavailable)?;
    Ok(nonce)
}

/// Encrypt a plaintext for one recipient. Returns base64(nonce || ciphertext).
///
/// A fresh nonce is drawn on every call; reusing a nonce under the same
/// derived key would break the AEAD.
pub fn encrypt_for(
    plaintext: &str,
    my_secret: &StaticSecret,
    their_public: &PublicKey,
) -> Result<String, CryptoError> {
    let key = derive_message_key(my_secret, their_public);
    let cipher = XChaCha20Poly1305::new(&key.into());
    let nonce_bytes = generate_nonce()?;
    let nonce = XNonce::from_slice(&nonce_bytes);

    let ciphertext = cipher
        .encrypt(nonce, plaintext.as_bytes())
        .map_err(|_| CryptoError::EncryptionFailed)?;

    let mut combined = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
    combined.extend_from_slice(&nonce_bytes);
    combined.extend_from_slice(&ciphertext);
    Ok(BASE64.encode(combined))
}

/// Inverse of [`encrypt_for`]. Fails with `DecryptionFailed` on a wrong
/// key, corrupted payload, or a ciphertext not addressed to this key pair.
pub fn decrypt_from(
    encoded: &str,
    my_secret: &StaticSecret,
    their_public: &PublicKey,
) -> Result<String, CryptoError> {
    let combined = BASE64
        .decode(encoded)
        .map_err(|_| CryptoError::DecryptionFailed)?;
    if combined.len() < NONCE_SIZE {
        return Err(CryptoError::DecryptionFailed);
    }

    let (nonce_bytes, ciphertext) = combined.split_at(NONCE_SIZE);
    let key = derive_message_key(my_secret, their_public);
    let cipher = XChaCha20Poly1305::new(&key.into());
    let nonce = XNonce::from_slice(nonce_bytes);

    let plaintext = cipher
        .decrypt(nonce, ciphertext)
        .map_err(|_| CryptoError::DecryptionFailed)?;

    String::from_utf8(plaintext).map_err(|_| CryptoError::DecryptionFailed)
}
