//! Thin adapters over the cryptographic primitives used by the core:
//! SHA-256 content digests and AES-256-GCM blob encryption.

use std::fmt;

use aes_gcm::aead::{Aead, AeadCore, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Nonce};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{Result, SyncError};

/// AES-GCM nonce length in bytes
const NONCE_LEN: usize = 12;

/// SHA-256 fingerprint of a byte sequence
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContentDigest([u8; 32]);

impl ContentDigest {
    /// Digest of `data`
    pub fn of(data: &[u8]) -> Self {
        Self(Sha256::digest(data).into())
    }

    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for ContentDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for ContentDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContentDigest({})", &self.to_hex()[..12])
    }
}

/// 256-bit symmetric key
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SymmetricKey([u8; 32]);

impl SymmetricKey {
    /// Fresh random key
    pub fn generate() -> Self {
        let key = Aes256Gcm::generate_key(OsRng);
        let mut bytes = [0u8; 32];
        bytes.copy_from_slice(key.as_slice());
        Self(bytes)
    }

    /// Deterministic key derived from length-prefixed parts
    pub fn derive(parts: &[&[u8]]) -> Self {
        Self(hash_parts(parts))
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Debug for SymmetricKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SymmetricKey(..)")
    }
}

/// Encrypt `plaintext`; the nonce is prepended to the ciphertext
pub fn encrypt(key: &SymmetricKey, plaintext: &[u8]) -> Result<Vec<u8>> {
    let cipher = Aes256Gcm::new_from_slice(key.as_bytes()).map_err(SyncError::crypto)?;
    let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
    let ciphertext = cipher
        .encrypt(&nonce, plaintext)
        .map_err(|e| SyncError::Crypto(format!("encryption failed: {}", e)))?;

    let mut blob = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    blob.extend_from_slice(nonce.as_slice());
    blob.extend_from_slice(&ciphertext);
    Ok(blob)
}

/// Decrypt a blob produced by [`encrypt`]
pub fn decrypt(key: &SymmetricKey, blob: &[u8]) -> Result<Vec<u8>> {
    if blob.len() < NONCE_LEN {
        return Err(SyncError::Crypto(format!(
            "encrypted blob too short: {} bytes",
            blob.len()
        )));
    }
    let (nonce, ciphertext) = blob.split_at(NONCE_LEN);
    let cipher = Aes256Gcm::new_from_slice(key.as_bytes()).map_err(SyncError::crypto)?;
    cipher
        .decrypt(Nonce::from_slice(nonce), ciphertext)
        .map_err(|e| SyncError::Crypto(format!("decryption failed: {}", e)))
}

/// Hex SHA-256 over length-prefixed parts, used for storage location keys
pub fn location_key(parts: &[&[u8]]) -> String {
    hex::encode(hash_parts(parts))
}

fn hash_parts(parts: &[&[u8]]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update((part.len() as u64).to_be_bytes());
        hasher.update(part);
    }
    hasher.finalize().into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_digest_stability() {
        let data = b"the same bytes".to_vec();
        assert_eq!(ContentDigest::of(&data), ContentDigest::of(&data));
        assert_ne!(ContentDigest::of(&data), ContentDigest::of(b"other bytes"));
        assert_eq!(ContentDigest::of(&data).to_hex().len(), 64);
    }

    #[test]
    fn test_encrypt_decrypt() {
        let key = SymmetricKey::generate();
        let blob = encrypt(&key, b"secret chunk").unwrap();
        assert_ne!(&blob[NONCE_LEN..], b"secret chunk");
        assert_eq!(decrypt(&key, &blob).unwrap(), b"secret chunk");

        let other = SymmetricKey::generate();
        assert!(decrypt(&other, &blob).is_err());
        assert!(decrypt(&key, &blob[..4]).is_err());
    }

    #[test]
    fn test_derivation_is_length_prefixed() {
        let a = SymmetricKey::derive(&[b"ab", b"c"]);
        let b = SymmetricKey::derive(&[b"a", b"bc"]);
        assert_ne!(a, b);
        assert_eq!(a, SymmetricKey::derive(&[b"ab", b"c"]));
        assert_ne!(location_key(&[b"ab", b"c"]), location_key(&[b"a", b"bc"]));
    }
}
