//! Error types for merge tree and collaboration operations.

use thiserror::Error;

use crate::crdt::merge_tree::SeqNum;
use crate::protocol::MergeTreeOp;

/// Breaches of the sequencing protocol.
///
/// Any of these leaves the replica unable to trust its own state; the host
/// has to resynchronize from a fresh snapshot.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolViolation {
    /// Message sequence number not above the last applied one (covers duplicates).
    #[error("sequence number {received} delivered after {last}")]
    OutOfOrder { last: SeqNum, received: SeqNum },

    /// Reference sequence number at or above the message's own sequence number.
    #[error("message {seq} references future state {reference}")]
    ReferenceAhead { seq: SeqNum, reference: SeqNum },

    /// Reference sequence number below the collaboration window.
    #[error("reference sequence number {reference} is below the window floor {min_seq}")]
    ReferenceBehindWindow { reference: SeqNum, min_seq: SeqNum },

    /// Own message echoed back with no local op waiting for it.
    #[error("acknowledgment {seq} arrived with no pending local op")]
    UnexpectedAck { seq: SeqNum },

    /// Own message echoed back with contents that differ from the oldest pending op.
    #[error("acknowledgment {seq} does not match the oldest pending local op")]
    AckMismatch { seq: SeqNum },

    /// Snapshot taken at a different sequence number than the caller expected.
    #[error("snapshot chunk is at sequence number {found}, expected {expected}")]
    ChunkSequenceMismatch { expected: SeqNum, found: SeqNum },

    /// Remote op cannot be applied in its issuer's view.
    #[error("remote op {seq} is invalid: {reason}")]
    InvalidRemoteOp { seq: SeqNum, reason: String },
}

/// Errors surfaced by the merge tree, the client and the shared string.
#[derive(Error, Debug)]
pub enum Error {
    /// Range with `start > end` or past the end of the sequence.
    #[error("invalid range {start}..{end} for sequence of length {length}")]
    InvalidRange {
        start: usize,
        end: usize,
        length: usize,
    },

    /// Position past the end of the sequence.
    #[error("position {position} out of bounds for sequence of length {length}")]
    PositionOutOfBounds { position: usize, length: usize },

    #[error("protocol violation: {0}")]
    Protocol(#[from] ProtocolViolation),

    /// A previous protocol violation left the replica unusable.
    #[error("replica is desynchronized and must reload from a snapshot")]
    Desynchronized,

    /// Transient blob failure; the caller may retry.
    #[error("blob storage error: {0}")]
    Io(String),

    #[error("codec error: {0}")]
    Codec(#[from] serde_json::Error),

    /// Operation requires a loaded object.
    #[error("object is not loaded")]
    NotLoaded,

    /// Load was aborted or hit a fatal error.
    #[error("object failed to load")]
    LoadFailed,

    /// Load step called in the wrong lifecycle state.
    #[error("cannot {action} while {state}")]
    LoadConflict { action: &'static str, state: &'static str },

    #[error("already attached as {0}")]
    AlreadyAttached(String),

    /// More distinct clients than a short client id can address.
    #[error("client roster is full at {0} clients")]
    TooManyClients(usize),

    /// Edits made while loading that did not fit the loaded content.
    ///
    /// The object finished loading; only these edits were discarded.
    #[error("{} deferred edit(s) rejected after load, first: {}", .rejected.len(), first_reason(.rejected))]
    DeferredEditsRejected { rejected: Vec<(MergeTreeOp, Error)> },
}

fn first_reason(rejected: &[(MergeTreeOp, Error)]) -> String {
    rejected
        .first()
        .map_or_else(String::new, |(_, err)| err.to_string())
}

impl Error {
    /// True for errors after which the replica must not keep applying messages
    ///
    /// Range errors reject a single local call and I/O errors can be retried.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::Protocol(_)
                | Error::Desynchronized
                | Error::LoadFailed
                | Error::TooManyClients(_)
        )
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Io(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_classification() {
        let violation: Error = ProtocolViolation::OutOfOrder { last: 7, received: 6 }.into();
        assert!(violation.is_fatal());
        assert!(Error::Desynchronized.is_fatal());

        let io = Error::Io("connection reset".to_string());
        assert!(!io.is_fatal());
        assert!(io.is_transient());

        let range = Error::InvalidRange {
            start: 4,
            end: 2,
            length: 10,
        };
        assert!(!range.is_fatal());

        assert!(Error::TooManyClients(4).is_fatal());
    }

    #[test]
    fn test_deferred_edits_message() {
        let err = Error::DeferredEditsRejected {
            rejected: vec![(
                MergeTreeOp::remove(3, 5),
                Error::InvalidRange {
                    start: 3,
                    end: 5,
                    length: 0,
                },
            )],
        };
        assert!(!err.is_fatal());
        assert_eq!(
            err.to_string(),
            "1 deferred edit(s) rejected after load, first: invalid range 3..5 for sequence of length 0"
        );
    }

    #[test]
    fn test_messages() {
        let err: Error = ProtocolViolation::ChunkSequenceMismatch {
            expected: 12,
            found: 10,
        }
        .into();
        assert_eq!(
            err.to_string(),
            "protocol violation: snapshot chunk is at sequence number 10, expected 12"
        );
    }
}
