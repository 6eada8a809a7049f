//! Stage-result memoization: results are keyed on a content fingerprint
//! plus the active tenant/DAO subnet, so a cache hit is indistinguishable
//! from a fresh pass at the layer's interface.
//!
//! Supports both a per-execution and a process-wide cache: every pipeline
//! owns a private per-execution [`ValidationCache`], and may additionally
//! be handed a shared process-wide one to check/populate across
//! executions.

use std::num::NonZeroUsize;

use lru::LruCache;
use qflow_common::{DaoSubnetId, TenantId};
use tokio::sync::Mutex;

use crate::ValidationOutcome;

pub type CacheKey = ([u8; 32], TenantId, DaoSubnetId);

pub struct ValidationCache {
    inner: Mutex<LruCache<CacheKey, ValidationOutcome>>,
}

impl ValidationCache {
    pub fn new(capacity: NonZeroUsize) -> Self {
        Self {
            inner: Mutex::new(LruCache::new(capacity)),
        }
    }

    pub async fn get(&self, key: &CacheKey) -> Option<ValidationOutcome> {
        self.inner.lock().await.get(key).cloned()
    }

    pub async fn put(&self, key: CacheKey, outcome: ValidationOutcome) {
        self.inner.lock().await.put(key, outcome);
    }
}
