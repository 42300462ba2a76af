//! Merge tree: sequencer-ordered collaborative sequence of text and markers
//!
//! Replicas apply their own edits immediately with provisional `Local`
//! attribution. A central sequencer assigns every edit a global sequence
//! number; replicas then apply foreign edits in that order, resolving each
//! edit's positions in the view its author had when issuing it. Given the same
//! sequenced history, every replica ends up with the same segments.
//!
//! # Layout
//!
//! - `stamp`: attribution (`Stamp`) and perspectives (`View`)
//! - `properties`: property bags merged by annotate
//! - `segment`: text runs and markers with tombstone state
//! - `btree`: order-statistic storage
//! - `window`: collaboration window and client roster
//! - `tree`: the position-addressed `MergeTree`

mod btree;
pub mod properties;
pub mod segment;
pub mod stamp;
pub mod tree;
pub mod window;

pub use properties::{PropertySet, PropertyValue};
pub use segment::{Marker, MarkerBehaviors, Segment, SegmentContent};
pub use stamp::{ClientId, LocalSeq, SeqNum, Stamp, View};
pub use tree::MergeTree;
pub use window::{ClientRoster, CollabWindow};
