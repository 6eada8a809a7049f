//! Signature verification collaborator: verifies any attached signature
//! against the claimed signer.

use async_trait::async_trait;
use dashmap::DashMap;
use sha2::{Digest, Sha256};

#[async_trait]
pub trait SignatureVerifier: Send + Sync {
    /// `true` iff `signature` is a valid signature over `payload` for the
    /// identity named by `signer`.
    async fn verify(&self, signer: &str, payload: &[u8], signature: &[u8]) -> bool;
}

/// Keyed-hash verifier over per-signer shared secrets. A production
/// deployment verifies asymmetric signatures against registered public
/// keys; this reference implementation exists so the Integrity stage has
/// a concrete collaborator for the single-node engine and its tests.
#[derive(Default)]
pub struct SharedSecretSignatureVerifier {
    secrets: DashMap<String, Vec<u8>>,
}

impl SharedSecretSignatureVerifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, signer: impl Into<String>, secret: Vec<u8>) {
        self.secrets.insert(signer.into(), secret);
    }

    fn expected_signature(secret: &[u8], payload: &[u8]) -> Vec<u8> {
        let mut hasher = Sha256::new();
        hasher.update(secret);
        hasher.update(payload);
        hasher.finalize().to_vec()
    }
}

#[async_trait]
impl SignatureVerifier for SharedSecretSignatureVerifier {
    async fn verify(&self, signer: &str, payload: &[u8], signature: &[u8]) -> bool {
        match self.secrets.get(signer) {
            Some(secret) => Self::expected_signature(&secret, payload) == signature,
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn registered_signer_verifies_matching_signature() {
        let verifier = SharedSecretSignatureVerifier::new();
        verifier.register("node-1", b"s3cr3t".to_vec());
        let sig = SharedSecretSignatureVerifier::expected_signature(b"s3cr3t", b"payload");
        assert!(verifier.verify("node-1", b"payload", &sig).await);
    }

    #[tokio::test]
    async fn unregistered_signer_never_verifies() {
        let verifier = SharedSecretSignatureVerifier::new();
        assert!(!verifier.verify("unknown", b"payload", b"anything").await);
    }
}
