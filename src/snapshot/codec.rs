//! Snapshot extraction and chunk loading
//!
//! Extraction is a synchronous walk over the stored segments (tombstones
//! included) that produces a header chunk and a body chunk. Loading parses
//! the header, seeds the tree with it, and appends the body once fetched.

use super::chunk::{MergeTreeChunk, SegmentSpec};
use super::storage::BlobStorage;
use crate::config::SnapshotConfig;
use crate::crdt::merge_tree::MergeTree;
use crate::error::Result;
use crate::protocol::{decode_message, encode_message};
use bytes::Bytes;
use tracing::debug;

/// Point-in-time copy of a merge tree, split into header and body
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
    header: MergeTreeChunk,
    body: MergeTreeChunk,
}

impl Snapshot {
    /// Capture the sequenced state of `tree`
    ///
    /// Unacknowledged local edits are left out: the snapshot describes the
    /// state at the window's current sequence number.
    pub fn extract(tree: &MergeTree, config: &SnapshotConfig) -> Self {
        let window = tree.window();
        let roster = window.roster();

        let mut specs = Vec::new();
        let mut lengths = Vec::new();
        let mut total_length_chars = 0;
        for segment in tree.segments() {
            let Some(spec) = SegmentSpec::from_segment(segment, roster) else {
                continue;
            };
            if spec.removed_seq.is_none() {
                total_length_chars += segment.len();
            }
            lengths.push(segment.len());
            specs.push(spec);
        }

        let mut header_count = 0;
        let mut header_len = 0;
        for len in &lengths {
            if header_len >= config.header_target_len {
                break;
            }
            header_len += len;
            header_count += 1;
        }

        let total_segment_count = specs.len();
        let body_segments = specs.split_off(header_count);
        let chunk = |chunk_start_segment, segments| MergeTreeChunk {
            chunk_sequence_number: window.current_seq(),
            min_sequence_number: window.min_seq(),
            total_segment_count,
            chunk_start_segment,
            total_length_chars,
            segments,
        };

        debug!(
            seq = window.current_seq(),
            header_segments = header_count,
            body_segments = body_segments.len(),
            "extracted snapshot"
        );
        Self {
            header: chunk(0, specs),
            body: chunk(header_count, body_segments),
        }
    }

    pub fn header(&self) -> &MergeTreeChunk {
        &self.header
    }

    pub fn body(&self) -> &MergeTreeChunk {
        &self.body
    }

    /// Serialize into named entries: the header inline, the body as a blob
    pub fn emit(&self, config: &SnapshotConfig) -> Result<SnapshotTree> {
        Ok(SnapshotTree {
            entries: vec![
                SnapshotEntry::Inline {
                    name: config.header_blob_name.clone(),
                    contents: encode_message(&self.header)?,
                },
                SnapshotEntry::Blob {
                    name: config.body_blob_name.clone(),
                    contents: encode_message(&self.body)?,
                },
            ],
        })
    }

    /// Parse a serialized chunk
    pub fn process_chunk(bytes: &[u8]) -> Result<MergeTreeChunk> {
        decode_message(bytes)
    }

    /// Fetch and parse the chunk stored under `name`
    pub async fn load_chunk<S: BlobStorage + ?Sized>(
        storage: &S,
        name: &str,
    ) -> Result<MergeTreeChunk> {
        let bytes = storage.fetch(name).await?;
        Self::process_chunk(&bytes)
    }
}

/// Replace the contents of `tree` with the header chunk
///
/// The window is reset to the chunk's sequence numbers. Nothing is changed if
/// a segment fails to decode.
pub fn seed_tree(tree: &mut MergeTree, chunk: MergeTreeChunk) -> Result<()> {
    let roster = tree.window_mut().roster_mut();
    let segments = chunk
        .segments
        .into_iter()
        .map(|spec| spec.into_segment(roster))
        .collect::<Result<Vec<_>>>()?;
    tree.reload_from_segments(
        segments,
        chunk.min_sequence_number,
        chunk.chunk_sequence_number,
    );
    Ok(())
}

/// Append the segments of a body chunk after everything in `tree`
pub fn append_chunk(tree: &mut MergeTree, chunk: MergeTreeChunk) -> Result<()> {
    let roster = tree.window_mut().roster_mut();
    let segments = chunk
        .segments
        .into_iter()
        .map(|spec| spec.into_segment(roster))
        .collect::<Result<Vec<_>>>()?;
    for segment in segments {
        tree.append_segment(segment);
    }
    Ok(())
}

/// A named snapshot entry
#[derive(Debug, Clone, PartialEq)]
pub enum SnapshotEntry {
    /// Small entry kept with the object's own metadata
    Inline { name: String, contents: Bytes },
    /// Entry stored in blob storage and fetched on demand
    Blob { name: String, contents: Bytes },
}

impl SnapshotEntry {
    pub fn name(&self) -> &str {
        match self {
            SnapshotEntry::Inline { name, .. } | SnapshotEntry::Blob { name, .. } => name,
        }
    }

    pub fn contents(&self) -> &Bytes {
        match self {
            SnapshotEntry::Inline { contents, .. } | SnapshotEntry::Blob { contents, .. } => {
                contents
            }
        }
    }
}

/// Serialized snapshot ready to persist
#[derive(Debug, Clone, PartialEq)]
pub struct SnapshotTree {
    pub entries: Vec<SnapshotEntry>,
}

impl SnapshotTree {
    pub fn entry(&self, name: &str) -> Option<&SnapshotEntry> {
        self.entries.iter().find(|e| e.name() == name)
    }

    /// Contents of the first inline entry
    pub fn header(&self) -> Option<&Bytes> {
        self.entries.iter().find_map(|e| match e {
            SnapshotEntry::Inline { contents, .. } => Some(contents),
            SnapshotEntry::Blob { .. } => None,
        })
    }

    /// Write every entry to `storage` under its name
    pub async fn write_to<S: BlobStorage + ?Sized>(&self, storage: &S) -> Result<()> {
        for entry in &self.entries {
            storage
                .write(entry.name(), entry.contents().clone())
                .await?;
        }
        Ok(())
    }
}
