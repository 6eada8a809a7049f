//! Storage abstraction over an embedded KV with atomic batch commit. Any
//! backend with atomic compare-and-swap on a per-execution head suffices;
//! this trait abstracts over a concrete backend (`RocksStorage`/
//! `SledStorage`) so chain logic in `chain.rs` never talks to `sled`
//! directly.

use async_trait::async_trait;
use qflow_common::ExecId;

use crate::error::LedgerError;

/// One physical row: `(exec_id, seq) -> serialized LedgerEntry`.
#[async_trait]
pub trait LedgerStore: Send + Sync {
    /// Returns the highest stored `(seq, hash)` for `exec_id`, if any.
    async fn head(&self, exec_id: &ExecId) -> Result<Option<(u64, [u8; 32])>, LedgerError>;

    /// Atomically writes one new row, but only if the store's current head
    /// for `exec_id` still matches `expected_head`. Returns `false| on a
    /// lost race so the caller can retry against the fresh head.
    async fn append_if_head_matches(
        &self,
        exec_id: &ExecId,
        expected_head: Option<(u64, [u8; 32])>,
        seq: u64,
        hash: [u8; 32],
        bytes: Vec<u8>,
    ) -> Result<bool, LedgerError>;

    /// Reads a contiguous `[from_seq, to_seq)` slice of raw rows.
    async fn read_range(
        &self,
        exec_id: &ExecId,
        from_seq: u64,
        to_seq: u64,
    ) -> Result<Vec<Vec<u8>>, LedgerError>;
}

/// `sled`-backed implementation. `sled::Tree::compare_and_swap` gives us the
/// atomic "append iff head unchanged" primitive directly as a single
/// storage-engine-native batch write.
pub struct SledLedgerStore {
    tree: sled::Tree,
}

impl SledLedgerStore {
    pub fn open(db: &sled::Db, tree_name: &str) -> Result<Self, LedgerError> {
        let tree = db
            .open_tree(tree_name)
            .map_err(|e| LedgerError::StorageIo(e.to_string()))?;
        Ok(Self { tree })
    }

    fn row_key(exec_id: &ExecId, seq: u64) -> Vec<u8> {
        let mut key = exec_id.as_str().as_bytes().to_vec();
        key.push(0);
        key.extend_from_slice(&seq.to_be_bytes());
        key
    }

    fn head_key(exec_id: &ExecId) -> Vec<u8> {
        let mut key = b"__head__".to_vec();
        key.extend_from_slice(exec_id.as_str().as_bytes());
        key
    }

    fn encode_head(seq: u64, hash: [u8; 32]) -> Vec<u8> {
        let mut v = seq.to_be_bytes().to_vec();
        v.extend_from_slice(&hash);
        v
    }

    fn decode_head(bytes: &[u8]) -> Option<(u64, [u8; 32])> {
        if bytes.len() != 40 {
            return None;
        }
        let seq = u64::from_be_bytes(bytes[0..8].try_into().ok()?);
        let mut hash = [0u8; 32];
        hash.copy_from_slice(&bytes[8..40]);
        Some((seq, hash))
    }
}

#[async_trait]
impl LedgerStore for SledLedgerStore {
    async fn head(&self, exec_id: &ExecId) -> Result<Option<(u64, [u8; 32])>, LedgerError> {
        let key = Self::head_key(exec_id);
        let value = self
            .tree
            .get(&key)
            .map_err(|e| LedgerError::StorageIo(e.to_string()))?;
        Ok(value.and_then(|v| Self::decode_head(&v)))
    }

    async fn append_if_head_matches(
        &self,
        exec_id: &ExecId,
        expected_head: Option<(u64, [u8; 32])>,
        seq: u64,
        hash: [u8; 32],
        bytes: Vec<u8>,
    ) -> Result<bool, LedgerError> {
        let head_key = Self::head_key(exec_id);
        let old = expected_head.map(|(s, h)| Self::encode_head(s, h));
        let new = Self::encode_head(seq, hash);

        let cas_result = self
            .tree
            .compare_and_swap(&head_key, old.as_deref(), Some(new.as_slice()))
            .map_err(|e| LedgerError::StorageIo(e.to_string()))?;

        if cas_result.is_err() {
            return Ok(false);
        }

        let row_key = Self::row_key(exec_id, seq);
        self.tree
            .insert(row_key, bytes)
            .map_err(|e| LedgerError::StorageIo(e.to_string()))?;
        self.tree
            .flush_async()
            .await
            .map_err(|e| LedgerError::StorageIo(e.to_string()))?;
        Ok(true)
    }

    async fn read_range(
        &self,
        exec_id: &ExecId,
        from_seq: u64,
        to_seq: u64,
    ) -> Result<Vec<Vec<u8>>, LedgerError> {
        let mut out = Vec::new();
        for seq in from_seq..to_seq {
            let key = Self::row_key(exec_id, seq);
            match self
                .tree
                .get(&key)
                .map_err(|e| LedgerError::StorageIo(e.to_string()))?
            {
                Some(v) => out.push(v.to_vec()),
                None => {
                    return Err(LedgerError::NotContiguous {
                        exec_id: exec_id.clone(),
                        from: from_seq,
                        to: to_seq,
                    })
                }
            }
        }
        Ok(out)
    }
}
