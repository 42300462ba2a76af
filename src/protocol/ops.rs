//! Wire shapes exchanged with the sequencer
//!
//! Field names follow the camelCase JSON convention of the sequencing
//! service (`pos1`, `referenceSequenceNumber`, ...).

use crate::crdt::merge_tree::{Marker, PropertySet, SegmentContent, SeqNum};
use serde::{Deserialize, Serialize};

/// A single merge tree edit
///
/// Positions are expressed in the view of the issuing client at its
/// reference sequence number.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MergeTreeOp {
    /// Insert text or a marker at `pos1`; exactly one of `text` and `marker`
    /// is present
    Insert {
        pos1: usize,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        text: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        marker: Option<Marker>,
        #[serde(default, skip_serializing_if = "PropertySet::is_empty")]
        props: PropertySet,
    },

    /// Remove `[pos1, pos2)`
    Remove { pos1: usize, pos2: usize },

    /// Merge `props` into `[pos1, pos2)`
    Annotate {
        pos1: usize,
        pos2: usize,
        props: PropertySet,
    },
}

impl MergeTreeOp {
    pub fn insert_text(pos: usize, text: impl Into<String>, props: PropertySet) -> Self {
        MergeTreeOp::Insert {
            pos1: pos,
            text: Some(text.into()),
            marker: None,
            props,
        }
    }

    pub fn insert_marker(pos: usize, marker: Marker, props: PropertySet) -> Self {
        MergeTreeOp::Insert {
            pos1: pos,
            text: None,
            marker: Some(marker),
            props,
        }
    }

    pub fn remove(start: usize, end: usize) -> Self {
        MergeTreeOp::Remove {
            pos1: start,
            pos2: end,
        }
    }

    pub fn annotate(start: usize, end: usize, props: PropertySet) -> Self {
        MergeTreeOp::Annotate {
            pos1: start,
            pos2: end,
            props,
        }
    }

    /// Inserted content, or `None` for non-inserts and malformed inserts
    pub fn insert_content(&self) -> Option<SegmentContent> {
        match self {
            MergeTreeOp::Insert {
                text: Some(text),
                marker: None,
                ..
            } => Some(SegmentContent::Text(text.clone())),
            MergeTreeOp::Insert {
                text: None,
                marker: Some(marker),
                ..
            } => Some(SegmentContent::Marker(marker.clone())),
            _ => None,
        }
    }
}

/// Local op handed to the sequencer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectMessage {
    /// Last sequence number the issuing replica had applied
    pub reference_sequence_number: SeqNum,
    pub contents: MergeTreeOp,
}

/// Op after the sequencer assigned it a global position
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SequencedMessage {
    pub sequence_number: SeqNum,
    pub reference_sequence_number: SeqNum,

    /// Long id of the issuing client
    pub client_id: String,

    /// Lowest reference sequence number any connected client may still use
    pub minimum_sequence_number: SeqNum,

    pub contents: MergeTreeOp,
}

impl SequencedMessage {
    /// Stamp `message` from `client_id` with its sequencing metadata
    pub fn sequenced(
        message: ObjectMessage,
        client_id: impl Into<String>,
        sequence_number: SeqNum,
        minimum_sequence_number: SeqNum,
    ) -> Self {
        Self {
            sequence_number,
            reference_sequence_number: message.reference_sequence_number,
            client_id: client_id.into(),
            minimum_sequence_number,
            contents: message.contents,
        }
    }
}
