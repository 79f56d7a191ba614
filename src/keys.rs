//! Signing-scheme facade.
//!
//! The rest of the node only consumes `sign`/`verify` and the address
//! derivation below; the curve choice stays contained here.

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use std::path::Path;

use crate::address;

#[derive(thiserror::Error, Debug)]
pub enum KeyError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed key material: {0}")]
    Malformed(String),
}

pub fn generate() -> SigningKey {
    SigningKey::generate(&mut OsRng)
}

/// Load the node key from `path`, creating and persisting a fresh one when
/// the file does not exist. The file holds the hex seed.
pub fn load_or_create(path: &Path) -> Result<SigningKey, KeyError> {
    if path.exists() {
        let hex_seed = std::fs::read_to_string(path)?;
        let bytes = hex::decode(hex_seed.trim())
            .map_err(|e| KeyError::Malformed(format!("key file is not hex: {e}")))?;
        let seed: [u8; 32] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| KeyError::Malformed("key seed must be 32 bytes".into()))?;
        return Ok(SigningKey::from_bytes(&seed));
    }

    let key = generate();
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir)?;
    }
    std::fs::write(path, hex::encode(key.to_bytes()))?;
    tracing::info!(path = %path.display(), "Generated new node key");
    Ok(key)
}

pub fn pub_key_hex(key: &SigningKey) -> String {
    hex::encode(key.verifying_key().to_bytes())
}

/// Detached signature over `msg`, hex-encoded.
pub fn sign(key: &SigningKey, msg: &[u8]) -> String {
    hex::encode(key.sign(msg).to_bytes())
}

/// Verify `sig_hex` over `msg` against a hex public key. Any malformed
/// component counts as a failed verification rather than an error.
pub fn verify(pub_key_hex: &str, msg: &[u8], sig_hex: &str) -> bool {
    let Ok(pk_bytes) = hex::decode(pub_key_hex) else {
        return false;
    };
    let Ok(pk_arr) = <[u8; 32]>::try_from(pk_bytes.as_slice()) else {
        return false;
    };
    let Ok(vk) = VerifyingKey::from_bytes(&pk_arr) else {
        return false;
    };
    let Ok(sig_bytes) = hex::decode(sig_hex) else {
        return false;
    };
    let Ok(sig) = Signature::from_slice(&sig_bytes) else {
        return false;
    };
    vk.verify(msg, &sig).is_ok()
}

pub fn address_from_pubkey(vk: &VerifyingKey) -> String {
    address::from_pubkey_bytes(&vk.to_bytes())
}

/// Address derived from a hex-encoded public key, as carried in tx inputs.
pub fn address_from_pubkey_hex(pub_key_hex: &str) -> Option<String> {
    let bytes = hex::decode(pub_key_hex).ok()?;
    Some(address::from_pubkey_bytes(&bytes))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sign_verify_roundtrip() {
        let key = generate();
        let sig = sign(&key, b"round 42");
        assert!(verify(&pub_key_hex(&key), b"round 42", &sig));
        assert!(!verify(&pub_key_hex(&key), b"round 43", &sig));
        assert!(!verify("zz", b"round 42", &sig));
    }

    #[test]
    fn key_file_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("node.key");
        let first = load_or_create(&path).unwrap();
        let second = load_or_create(&path).unwrap();
        assert_eq!(first.to_bytes(), second.to_bytes());
    }
}
