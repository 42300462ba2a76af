//! Configuration for shared string objects.
//!
//! Every field has a default, so hosts can deserialize a partial document
//! (or nothing at all) and only override what they care about.

use serde::{Deserialize, Serialize};

/// Default size of the eagerly loaded header chunk, in characters.
pub const DEFAULT_HEADER_TARGET_LEN: usize = 10_000;

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub snapshot: SnapshotConfig,
}

/// How snapshots are split and named.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SnapshotConfig {
    /// The header takes whole segments until this many characters are written.
    pub header_target_len: usize,

    /// Entry name of the eagerly loaded chunk.
    pub header_blob_name: String,

    /// Blob name of the lazily fetched chunk.
    pub body_blob_name: String,
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self {
            header_target_len: DEFAULT_HEADER_TARGET_LEN,
            header_blob_name: "header".to_string(),
            body_blob_name: "body".to_string(),
        }
    }
}

impl SnapshotConfig {
    /// Set the header size target.
    pub fn with_header_target_len(mut self, len: usize) -> Self {
        self.header_target_len = len;
        self
    }

    /// Set the body blob name.
    pub fn with_body_blob_name(mut self, name: impl Into<String>) -> Self {
        self.body_blob_name = name.into();
        self
    }
}
