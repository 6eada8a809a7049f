//! The fixed, ordered validation chain: Decrypt → Permission → Index →
//! Integrity. A duplicate found at the index stage short-circuits the
//! chain with a cached reference instead of running integrity checks.

use std::num::NonZeroUsize;
use std::sync::Arc;

use qflow_common::wire::hash_bytes;
use qflow_common::{DaoSubnetId, TenantId};
use qflow_collaborators::{
    EncryptionService, IndexOutcome, IndexService, PermissionChecker, PermissionRequest,
    SignatureVerifier,
};

use crate::cache::{CacheKey, ValidationCache};
use crate::error::ValidationError;

/// Everything the pipeline needs to validate one payload crossing a
/// component boundary (flow admission, event ingress, step payload or
/// result).
#[derive(Debug, Clone)]
pub struct PayloadValidationRequest {
    pub identity: String,
    pub tenant_id: TenantId,
    pub dao_subnet_id: DaoSubnetId,
    pub action: String,
    pub resource: String,
    /// Ciphertext if `key_ref` is `Some`, plaintext otherwise.
    pub payload: Vec<u8>,
    pub key_ref: Option<String>,
    pub signer: Option<String>,
    pub signature: Option<Vec<u8>>,
}

#[derive(Debug, Clone)]
pub struct ValidationOutcome {
    pub plaintext: Vec<u8>,
    pub duplicate_of: Option<String>,
}

pub struct ValidationPipeline {
    encryption: Arc<dyn EncryptionService>,
    permission: Arc<dyn PermissionChecker>,
    index: Arc<dyn IndexService>,
    signatures: Arc<dyn SignatureVerifier>,
    execution_cache: ValidationCache,
    process_cache: Option<Arc<ValidationCache>>,
}

const DEFAULT_CACHE_CAPACITY: usize = 512;

impl ValidationPipeline {
    pub fn new(
        encryption: Arc<dyn EncryptionService>,
        permission: Arc<dyn PermissionChecker>,
        index: Arc<dyn IndexService>,
        signatures: Arc<dyn SignatureVerifier>,
        process_cache: Option<Arc<ValidationCache>>,
    ) -> Self {
        Self {
            encryption,
            permission,
            index,
            signatures,
            execution_cache: ValidationCache::new(
                NonZeroUsize::new(DEFAULT_CACHE_CAPACITY).unwrap(),
            ),
            process_cache,
        }
    }

    /// Runs the fixed four-stage chain, short-circuiting on the first
    /// failure or on a cache hit.
    pub async fn validate(
        &self,
        req: &PayloadValidationRequest,
    ) -> Result<ValidationOutcome, ValidationError> {
        let fingerprint = hash_bytes(&req.payload);
        let key: CacheKey = (fingerprint, req.tenant_id.clone(), req.dao_subnet_id.clone());

        if let Some(hit) = self.execution_cache.get(&key).await {
            return Ok(hit);
        }
        if let Some(process_cache) = &self.process_cache {
            if let Some(hit) = process_cache.get(&key).await {
                self.execution_cache.put(key.clone(), hit.clone()).await;
                return Ok(hit);
            }
        }

        let outcome = self.run_stages(req).await?;

        self.execution_cache.put(key.clone(), outcome.clone()).await;
        if let Some(process_cache) = &self.process_cache {
            process_cache.put(key, outcome.clone()).await;
        }
        Ok(outcome)
    }

    async fn run_stages(
        &self,
        req: &PayloadValidationRequest,
    ) -> Result<ValidationOutcome, ValidationError> {
        // Stage 1: Decrypt & key binding.
        let plaintext = match &req.key_ref {
            Some(key_ref) => self
                .encryption
                .open(key_ref, &req.payload)
                .await
                .map_err(|_| ValidationError::DecryptionFailed(key_ref.clone()))?,
            None => req.payload.clone(),
        };

        // Stage 2: Permission.
        let permission_req = PermissionRequest {
            identity: req.identity.clone(),
            tenant_id: req.tenant_id.clone(),
            dao_subnet_id: req.dao_subnet_id.clone(),
            action: req.action.clone(),
            resource: req.resource.clone(),
        };
        if !self.permission.allowed(&permission_req).await {
            return Err(ValidationError::PermissionDenied {
                identity: req.identity.clone(),
                action: req.action.clone(),
                resource: req.resource.clone(),
            });
        }

        // Stage 3: Index & dedup.
        let content_fingerprint = hash_bytes(&plaintext);
        let index_outcome = self
            .index
            .check_and_record(&content_fingerprint, &req.tenant_id, &req.dao_subnet_id)
            .await
            .map_err(|_| ValidationError::IndexingUnavailable)?;
        if let IndexOutcome::Duplicate { cached_ref } = index_outcome {
            // A duplicate short-circuits here with a cached reference; the
            // payload already passed integrity the first time it was seen,
            // so there's no need to re-check it now.
            return Ok(ValidationOutcome {
                plaintext,
                duplicate_of: Some(cached_ref),
            });
        }

        // Stage 4: Integrity.
        if let (Some(signer), Some(signature)) = (&req.signer, &req.signature) {
            if !self.signatures.verify(signer, &plaintext, signature).await {
                return Err(ValidationError::IntegrityViolation(signer.clone()));
            }
        }
        if serde_json::from_slice::<serde_json::Value>(&plaintext).is_err() {
            return Err(ValidationError::SchemaViolation(
                "payload is not well-formed JSON".to_string(),
            ));
        }

        Ok(ValidationOutcome {
            plaintext,
            duplicate_of: None,
        })
    }
}
