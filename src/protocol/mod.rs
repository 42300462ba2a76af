//! Sequencer protocol: op shapes and their encoding

pub mod ops;
pub mod serialize;

pub use ops::{MergeTreeOp, ObjectMessage, SequencedMessage};
pub use serialize::{decode_message, encode_message};
