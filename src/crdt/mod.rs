//! Replicated sequence data structures
//!
//! The merge tree converges by relying on an external sequencer for a total
//! order of edits, rather than on commutative operations alone.
//!
//! # References
//!
//! - "A comprehensive study of CRDTs" by Marc Shapiro et al.

pub mod merge_tree;

pub use merge_tree::MergeTree;
