//! Content-addressed response cache
//!
//! Every completion the harness observes is stored under the fingerprint of
//! the request that produced it. Entries are written once and never updated,
//! so identical requests always replay identical responses.
//!
//! - `Fingerprint`: 128-bit digest of a canonicalized request
//! - `CacheStore`: async get/put over raw response bytes
//! - `FsCache`: one `<hex>.json` file per fingerprint under a cache root
//! - `InMemoryCache`: map-backed store for tests and ephemeral runs

pub mod fingerprint;
pub mod fs;

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::Mutex;

pub use fingerprint::{canonical_json, Fingerprinter};
pub use fs::FsCache;

/// Width of a fingerprint in bytes.
pub const FINGERPRINT_LEN: usize = 16;

/// Truncated SHA-256 digest identifying one completion request.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Fingerprint([u8; FINGERPRINT_LEN]);

impl Fingerprint {
    pub fn from_bytes(bytes: [u8; FINGERPRINT_LEN]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; FINGERPRINT_LEN] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fingerprint({})", self.to_hex())
    }
}

impl FromStr for Fingerprint {
    type Err = CacheError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let bytes = hex::decode(s).map_err(|_| CacheError::InvalidFingerprint(s.to_string()))?;
        let arr: [u8; FINGERPRINT_LEN] = bytes
            .try_into()
            .map_err(|_| CacheError::InvalidFingerprint(s.to_string()))?;
        Ok(Self(arr))
    }
}

/// Errors from cache operations. A missing entry is not an error.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("invalid fingerprint: {0}")]
    InvalidFingerprint(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("cache task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

/// Durable map from fingerprint to raw response payload.
#[async_trait]
pub trait CacheStore: Send + Sync {
    /// Look up a previously stored payload.
    async fn get(&self, fingerprint: &Fingerprint) -> Result<Option<Vec<u8>>, CacheError>;

    /// Store a payload. Writing a fingerprint that already exists is a no-op.
    async fn put(&self, fingerprint: &Fingerprint, payload: &[u8]) -> Result<(), CacheError>;
}

/// Simple in-memory cache, shared across clones.
#[derive(Clone, Default)]
pub struct InMemoryCache(Arc<Mutex<HashMap<Fingerprint, Vec<u8>>>>);

impl InMemoryCache {
    pub async fn len(&self) -> usize {
        self.0.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.0.lock().await.is_empty()
    }
}

#[async_trait]
impl CacheStore for InMemoryCache {
    async fn get(&self, fingerprint: &Fingerprint) -> Result<Option<Vec<u8>>, CacheError> {
        Ok(self.0.lock().await.get(fingerprint).cloned())
    }

    async fn put(&self, fingerprint: &Fingerprint, payload: &[u8]) -> Result<(), CacheError> {
        self.0
            .lock()
            .await
            .entry(*fingerprint)
            .or_insert_with(|| payload.to_vec());
        Ok(())
    }
}
