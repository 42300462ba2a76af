//! MergeTree Core - Sequencer-ordered collaborative sequences
//!
//! Replicas of a text-and-marker sequence converge by applying every edit in
//! the total order assigned by an external sequencer. Each edit carries the
//! sequence number its author had seen, and is resolved against exactly that
//! view of the tree.
//! It implements:
//! - Segment model with insertion and removal attribution
//! - B-tree indexed merge tree with per-view position resolution
//! - Collaboration window and tombstone collection
//! - Client reconciliation of provisional local edits
//! - Header/body snapshots over an async blob store
//!
//! # Examples
//!
//! ```rust
//! use mergetree_core::{PropertySet, SequencedMessage, SharedString};
//! use tokio::sync::mpsc;
//!
//! let (tx, mut rx) = mpsc::unbounded_channel();
//! let mut doc = SharedString::create("doc-123");
//! doc.attach("client-1", tx).unwrap();
//!
//! doc.insert_text(0, "Hello World", PropertySet::new()).unwrap();
//!
//! // The sequencer stamps the op and broadcasts it back
//! let submitted = rx.try_recv().unwrap();
//! doc.deliver(SequencedMessage::sequenced(submitted, "client-1", 1, 0)).unwrap();
//! assert_eq!(doc.get_text(), "Hello World");
//! ```

pub mod config;
pub mod crdt;
pub mod document;
pub mod error;
pub mod protocol;
pub mod snapshot;
pub mod sync;

// Re-exports for convenience
pub use config::{Config, SnapshotConfig};
pub use crdt::merge_tree::{
    ClientId, Marker, MarkerBehaviors, MergeTree, PropertySet, PropertyValue, Segment, SeqNum,
    Stamp, View,
};
pub use document::{LoadState, Observer, Sequencer, SharedString, SubscriptionId};
pub use error::{Error, ProtocolViolation, Result};
pub use protocol::{MergeTreeOp, ObjectMessage, SequencedMessage};
pub use snapshot::{BlobStorage, MemoryBlobStorage, MergeTreeChunk, Snapshot};
pub use sync::Client;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_basic_import() {
        let doc = SharedString::create("doc");
        assert_eq!(doc.load_state(), LoadState::Loaded);
        assert_eq!(Config::default().snapshot.body_blob_name, "body");
    }
}
