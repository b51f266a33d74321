//! Ordered key-value storage boundary.
//!
//! The only persistence dependency of the core. Any embedded engine that can
//! do ordered prefix scans satisfies [`KvStore`]; [`MemoryKv`] is the
//! reference implementation used by tests and light tooling.

use std::collections::BTreeMap;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum KvError {
    #[error("storage engine failure: {reason}")]
    Engine { reason: String },
}

impl KvError {
    pub fn transience(&self) -> crate::Transience {
        // Engine failures (disk full, handle loss) may clear up; the caller
        // decides when to treat them as fatal.
        crate::Transience::Unknown
    }
}

pub trait KvStore: Send {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, KvError>;
    fn put(&mut self, key: &[u8], value: &[u8]) -> Result<(), KvError>;
    fn delete(&mut self, key: &[u8]) -> Result<(), KvError>;
    /// All entries whose key starts with `prefix`, in ascending key order.
    fn prefix_iter(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>, KvError>;
}

/// In-memory ordered store.
#[derive(Debug, Default, Clone)]
pub struct MemoryKv {
    map: BTreeMap<Vec<u8>, Vec<u8>>,
}

impl MemoryKv {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

impl KvStore for MemoryKv {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, KvError> {
        Ok(self.map.get(key).cloned())
    }

    fn put(&mut self, key: &[u8], value: &[u8]) -> Result<(), KvError> {
        self.map.insert(key.to_vec(), value.to_vec());
        Ok(())
    }

    fn delete(&mut self, key: &[u8]) -> Result<(), KvError> {
        self.map.remove(key);
        Ok(())
    }

    fn prefix_iter(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>, KvError> {
        Ok(self
            .map
            .range(prefix.to_vec()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }
}

/// Persisted key layout. Kept in one place so the on-disk format is auditable.
pub mod keys {
    use crate::core::{Did, EventHash};

    pub const LOG_SEQ_PREFIX: &[u8] = b"log/seq/";
    pub const LOG_HASH_PREFIX: &[u8] = b"log/hash/";
    pub const NONCE_PREFIX: &[u8] = b"nonce/";
    pub const QUARANTINE_PREFIX: &[u8] = b"quarantine/seq/";
    pub const SNAPSHOT_PREFIX: &[u8] = b"snap/by-hash/";
    pub const SNAPSHOT_LATEST: &[u8] = b"snap/latest";

    pub fn log_seq(seq: u64) -> Vec<u8> {
        let mut key = LOG_SEQ_PREFIX.to_vec();
        key.extend_from_slice(&seq.to_be_bytes());
        key
    }

    pub fn parse_log_seq(key: &[u8]) -> Option<u64> {
        let rest = key.strip_prefix(LOG_SEQ_PREFIX)?;
        let bytes: [u8; 8] = rest.try_into().ok()?;
        Some(u64::from_be_bytes(bytes))
    }

    pub fn log_hash(hash: &EventHash) -> Vec<u8> {
        let mut key = LOG_HASH_PREFIX.to_vec();
        key.extend_from_slice(hash.as_bytes());
        key
    }

    pub fn nonce(issuer: &Did) -> Vec<u8> {
        let mut key = NONCE_PREFIX.to_vec();
        key.extend_from_slice(issuer.as_str().as_bytes());
        key
    }

    pub fn quarantine_seq(seq: u64) -> Vec<u8> {
        let mut key = QUARANTINE_PREFIX.to_vec();
        key.extend_from_slice(&seq.to_be_bytes());
        key
    }

    pub fn snapshot(hash: &EventHash) -> Vec<u8> {
        let mut key = SNAPSHOT_PREFIX.to_vec();
        key.extend_from_slice(hash.as_bytes());
        key
    }
}
