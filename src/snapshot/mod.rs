//! Snapshot persistence
//!
//! - `chunk`: the persisted chunk and segment shapes
//! - `codec`: extraction into header/body and loading back into a tree
//! - `storage`: async blob storage boundary

pub mod chunk;
pub mod codec;
pub mod storage;

pub use chunk::{MergeTreeChunk, SegmentSpec};
pub use codec::{append_chunk, seed_tree, Snapshot, SnapshotEntry, SnapshotTree};
pub use storage::{BlobStorage, MemoryBlobStorage};
