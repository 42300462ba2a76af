//! Blob storage boundary
//!
//! Snapshot bodies live in an external blob service addressed by name. The
//! core only ever fetches one blob during load and writes blobs when a host
//! asks it to persist a snapshot; retry and cadence belong to the host.

use crate::error::{Error, Result};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use tokio::sync::RwLock;

/// Fetch and store blobs by name
#[async_trait]
pub trait BlobStorage: Send + Sync {
    /// Read the blob called `name`
    ///
    /// Failures are reported as `Error::Io` and are treated as transient.
    async fn fetch(&self, name: &str) -> Result<Bytes>;

    /// Store `contents` under `name`, replacing any previous blob
    async fn write(&self, name: &str, contents: Bytes) -> Result<()>;
}

/// In-process blob store
#[derive(Debug, Default)]
pub struct MemoryBlobStorage {
    blobs: RwLock<HashMap<String, Bytes>>,
}

impl MemoryBlobStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn contains(&self, name: &str) -> bool {
        self.blobs.read().await.contains_key(name)
    }

    pub async fn len(&self) -> usize {
        self.blobs.read().await.len()
    }
}

#[async_trait]
impl BlobStorage for MemoryBlobStorage {
    async fn fetch(&self, name: &str) -> Result<Bytes> {
        self.blobs
            .read()
            .await
            .get(name)
            .cloned()
            .ok_or_else(|| Error::Io(format!("blob not found: {}", name)))
    }

    async fn write(&self, name: &str, contents: Bytes) -> Result<()> {
        self.blobs.write().await.insert(name.to_string(), contents);
        Ok(())
    }
}
