//! Persisted chunk format
//!
//! A snapshot is written as two chunks of the same shape. The header holds
//! the first segments and is loaded eagerly; the body holds the rest and is
//! fetched from blob storage. Body segments always follow header segments.

use crate::crdt::merge_tree::{
    ClientRoster, Marker, PropertySet, Segment, SegmentContent, SeqNum, Stamp,
};
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};

/// One persisted chunk
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MergeTreeChunk {
    /// Sequence number the snapshot was taken at
    pub chunk_sequence_number: SeqNum,

    /// Collaboration window floor when the snapshot was taken
    #[serde(default)]
    pub min_sequence_number: SeqNum,

    /// Segments across all chunks of the snapshot
    #[serde(default)]
    pub total_segment_count: usize,

    /// Index of this chunk's first segment within the snapshot
    #[serde(default)]
    pub chunk_start_segment: usize,

    /// Visible length of the whole snapshot
    #[serde(default)]
    pub total_length_chars: usize,

    pub segments: Vec<SegmentSpec>,
}

impl MergeTreeChunk {
    /// Chunk describing an empty sequence that predates any sequencing
    pub fn empty() -> Self {
        Self {
            chunk_sequence_number: 0,
            min_sequence_number: 0,
            total_segment_count: 0,
            chunk_start_segment: 0,
            total_length_chars: 0,
            segments: Vec::new(),
        }
    }
}

/// Persisted form of a segment
///
/// Attribution is written with long client ids. Content that predates
/// collaboration carries none.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SegmentSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub marker: Option<Marker>,

    #[serde(default, skip_serializing_if = "PropertySet::is_empty")]
    pub props: PropertySet,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seq: Option<SeqNum>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub removed_seq: Option<SeqNum>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub removed_client: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub removed_client_overlap: Vec<String>,
}

impl SegmentSpec {
    /// Persisted form of `segment` as the sequencer knows it
    ///
    /// Returns `None` for content inserted locally and not yet acknowledged.
    /// A pending local removal is written as live, and pending annotations are
    /// written with the sequenced values they hide.
    pub fn from_segment(segment: &Segment, roster: &ClientRoster) -> Option<Self> {
        let (seq, client) = sequenced_parts(segment.insert_stamp(), roster)?;
        let (removed_seq, removed_client) = segment
            .removal_stamp()
            .and_then(|stamp| sequenced_parts(stamp, roster))
            .unwrap_or((None, None));
        let removed_client_overlap = if removed_seq.is_some() {
            segment
                .removed_client_overlap()
                .iter()
                .filter_map(|id| roster.long_id(*id).map(str::to_string))
                .collect()
        } else {
            Vec::new()
        };

        let (text, marker) = match segment.content() {
            SegmentContent::Text(text) => (Some(text.clone()), None),
            SegmentContent::Marker(marker) => (None, Some(marker.clone())),
        };

        Some(Self {
            text,
            marker,
            props: segment.sequenced_properties(),
            seq,
            client,
            removed_seq,
            removed_client,
            removed_client_overlap,
        })
    }

    /// Rebuild the segment, interning long client ids into `roster`
    pub fn into_segment(self, roster: &mut ClientRoster) -> Result<Segment> {
        let insert = stamp_from_parts(self.seq, self.client.as_deref(), roster)?;
        let removal = match (self.removed_seq, self.removed_client.as_deref()) {
            (None, None) => None,
            (seq, client) => Some(stamp_from_parts(seq, client, roster)?),
        };
        let overlap = self
            .removed_client_overlap
            .iter()
            .map(|id| roster.get_or_add(id))
            .collect::<Result<Vec<_>>>()?;

        let segment = match (self.text, self.marker) {
            (Some(text), None) => Segment::make_text(text, self.props, insert),
            (None, Some(marker)) => Segment::make_marker(marker, self.props, insert),
            _ => return Err(invalid("segment must carry exactly one of text or marker")),
        };
        Ok(segment.with_removal(removal, overlap))
    }
}

/// `(seq, long client id)` of a stamp; `None` for local stamps
fn sequenced_parts(
    stamp: Stamp,
    roster: &ClientRoster,
) -> Option<(Option<SeqNum>, Option<String>)> {
    match stamp {
        Stamp::Universal => Some((None, None)),
        Stamp::Sequenced { seq, client } => {
            Some((Some(seq), roster.long_id(client).map(str::to_string)))
        }
        Stamp::Local { .. } => None,
    }
}

fn stamp_from_parts(
    seq: Option<SeqNum>,
    client: Option<&str>,
    roster: &mut ClientRoster,
) -> Result<Stamp> {
    match (seq, client) {
        (None, None) => Ok(Stamp::Universal),
        (Some(seq), Some(client)) => Ok(Stamp::sequenced(seq, roster.get_or_add(client)?)),
        _ => Err(invalid("sequence number and client must be given together")),
    }
}

fn invalid(reason: &str) -> Error {
    Error::Codec(<serde_json::Error as serde::de::Error>::custom(reason))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crdt::merge_tree::{ClientId, MarkerBehaviors};

    fn roster() -> ClientRoster {
        let mut roster = ClientRoster::new();
        roster.get_or_add("alice").unwrap();
        roster.get_or_add("bob").unwrap();
        roster
    }

    #[test]
    fn test_spec_carries_attribution() {
        let roster = roster();
        let segment = Segment::make_text("gone", PropertySet::new(), Stamp::sequenced(3, ClientId(0)))
            .with_removal(Some(Stamp::sequenced(5, ClientId(1))), vec![ClientId(0)]);

        let spec = SegmentSpec::from_segment(&segment, &roster).unwrap();
        let json = serde_json::to_value(&spec).unwrap();

        assert_eq!(
            json,
            serde_json::json!({
                "text": "gone",
                "seq": 3,
                "client": "alice",
                "removedSeq": 5,
                "removedClient": "bob",
                "removedClientOverlap": ["alice"]
            })
        );
    }

    #[test]
    fn test_local_content_is_not_persisted() {
        let roster = roster();
        let local = Segment::make_text("draft", PropertySet::new(), Stamp::local(1));
        assert!(SegmentSpec::from_segment(&local, &roster).is_none());

        let pending_removal = Segment::make_text("kept", PropertySet::new(), Stamp::Universal)
            .with_removal(Some(Stamp::local(2)), Vec::new());
        let spec = SegmentSpec::from_segment(&pending_removal, &roster).unwrap();
        assert_eq!(spec.removed_seq, None);
        assert_eq!(spec.seq, None);
    }

    #[test]
    fn test_marker_spec_round_trip() {
        let mut roster = roster();
        let props: PropertySet = [("depth", 1i64)].into_iter().collect();
        let marker = Segment::make_marker(
            Marker::new("li", MarkerBehaviors::TILE | MarkerBehaviors::RANGE_BEGIN),
            props,
            Stamp::sequenced(4, ClientId(1)),
        );

        let spec = SegmentSpec::from_segment(&marker, &roster).unwrap();
        let rebuilt = spec.into_segment(&mut roster).unwrap();
        assert_eq!(rebuilt, marker);
    }

    #[test]
    fn test_rejects_malformed_specs() {
        let mut roster = roster();
        let neither: SegmentSpec = serde_json::from_str(r#"{"seq": 1, "client": "alice"}"#).unwrap();
        assert!(matches!(neither.into_segment(&mut roster), Err(Error::Codec(_))));

        let orphan_seq: SegmentSpec = serde_json::from_str(r#"{"text": "a", "seq": 1}"#).unwrap();
        assert!(orphan_seq.into_segment(&mut roster).is_err());
    }

    #[test]
    fn test_empty_chunk() {
        let chunk = MergeTreeChunk::empty();
        let json = serde_json::to_string(&chunk).unwrap();
        let back: MergeTreeChunk = serde_json::from_str(&json).unwrap();

        assert_eq!(back, chunk);
        assert_eq!(back.chunk_sequence_number, 0);
    }
}
