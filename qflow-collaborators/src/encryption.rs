//! Decrypt & key binding collaborator.

use async_trait::async_trait;
use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Nonce};
use sha2::{Digest, Sha256};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EncryptionError {
    #[error("no key registered for reference {0:?}")]
    UnknownKeyRef(String),
    #[error("payload failed to decrypt under key {0:?}")]
    DecryptionFailed(String),
    #[error("sealed payload is malformed: {0}")]
    Malformed(String),
}

/// A sealed payload is a nonce-prefixed ciphertext produced by `seal`.
#[async_trait]
pub trait EncryptionService: Send + Sync {
    async fn seal(&self, key_ref: &str, plaintext: &[u8]) -> Result<Vec<u8>, EncryptionError>;
    async fn open(&self, key_ref: &str, sealed: &[u8]) -> Result<Vec<u8>, EncryptionError>;
}

const NONCE_LEN: usize = 12;

/// Derives a per-`key_ref` symmetric key by hashing the reference string.
/// A real deployment resolves `key_ref` against a KMS; this reference
/// implementation exists so the pipeline's Decrypt stage has something
/// concrete to call in tests and the single-node engine.
#[derive(Default)]
pub struct HashDerivedEncryptionService;

impl HashDerivedEncryptionService {
    fn key_for(key_ref: &str) -> chacha20poly1305::Key {
        let digest = Sha256::digest(key_ref.as_bytes());
        chacha20poly1305::Key::clone_from_slice(&digest)
    }
}

#[async_trait]
impl EncryptionService for HashDerivedEncryptionService {
    async fn seal(&self, key_ref: &str, plaintext: &[u8]) -> Result<Vec<u8>, EncryptionError> {
        let key = Self::key_for(key_ref);
        let cipher = ChaCha20Poly1305::new(&key);
        let mut nonce_bytes = [0u8; NONCE_LEN];
        rand::Rng::fill(&mut rand::thread_rng(), &mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);
        let ciphertext = cipher
            .encrypt(nonce, plaintext)
            .map_err(|_| EncryptionError::DecryptionFailed(key_ref.to_string()))?;
        let mut out = nonce_bytes.to_vec();
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    async fn open(&self, key_ref: &str, sealed: &[u8]) -> Result<Vec<u8>, EncryptionError> {
        if sealed.len() < NONCE_LEN {
            return Err(EncryptionError::Malformed("sealed payload shorter than nonce".into()));
        }
        let (nonce_bytes, ciphertext) = sealed.split_at(NONCE_LEN);
        let key = Self::key_for(key_ref);
        let cipher = ChaCha20Poly1305::new(&key);
        let nonce = Nonce::from_slice(nonce_bytes);
        cipher
            .decrypt(nonce, ciphertext)
            .map_err(|_| EncryptionError::DecryptionFailed(key_ref.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn seal_then_open_roundtrips() {
        let svc = HashDerivedEncryptionService;
        let sealed = svc.seal("tenant-a/key-1", b"hello qflow").await.unwrap();
        let opened = svc.open("tenant-a/key-1", &sealed).await.unwrap();
        assert_eq!(opened, b"hello qflow");
    }

    #[tokio::test]
    async fn wrong_key_ref_fails_to_open() {
        let svc = HashDerivedEncryptionService;
        let sealed = svc.seal("tenant-a/key-1", b"hello qflow").await.unwrap();
        let err = svc.open("tenant-b/key-1", &sealed).await.unwrap_err();
        assert!(matches!(err, EncryptionError::DecryptionFailed(_)));
    }
}
