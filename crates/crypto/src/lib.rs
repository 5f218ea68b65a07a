//! Cryptographic helpers for session tokens and bot API secrets.

use anyhow::Result;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use rand::{rngs::OsRng, RngCore};

pub use ed25519_dalek::{Signature, SigningKey, VerifyingKey};
use ed25519_dalek::Signer;

const SECRET_BYTES: usize = 32;

pub fn generate_signing_key() -> SigningKey {
    SigningKey::generate(&mut OsRng)
}

pub fn verifying_key_from(signing_key: &SigningKey) -> VerifyingKey {
    signing_key.verifying_key()
}

pub fn sign_message(signing_key: &SigningKey, message: &[u8]) -> Signature {
    signing_key.sign(message)
}

pub fn verify_signature(
    verifying_key: &VerifyingKey,
    message: &[u8],
    signature: &Signature,
) -> Result<()> {
    verifying_key
        .verify_strict(message, signature)
        .map_err(|err| anyhow::anyhow!(err))
}

/// URL-safe random secret suitable for bearer tokens.
pub fn generate_secret() -> String {
    let mut bytes = [0u8; SECRET_BYTES];
    OsRng.fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

/// Hex blake3 digest of a token; only digests are persisted.
pub fn hash_secret(secret: &str) -> String {
    blake3::hash(secret.as_bytes()).to_hex().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signatures_round_trip_and_reject_tampering() {
        let key = generate_signing_key();
        let verifying = verifying_key_from(&key);
        let signature = sign_message(&key, b"claims");
        assert!(verify_signature(&verifying, b"claims", &signature).is_ok());
        assert!(verify_signature(&verifying, b"claimz", &signature).is_err());
    }

    #[test]
    fn secrets_are_unique_and_hash_deterministically() {
        let first = generate_secret();
        let second = generate_secret();
        assert_ne!(first, second);
        assert_eq!(hash_secret(&first), hash_secret(&first));
        assert_ne!(hash_secret(&first), hash_secret(&second));
        assert_eq!(hash_secret(&first).len(), 64);
    }
}
