//! Segment: a run of text or a marker with attribution metadata
//!
//! Segments are the atomic units of the merge tree. A segment is created by an
//! insert, split whenever an operation boundary falls inside it, tombstoned by
//! a remove, and physically dropped only once every client has observed the
//! removal.

use super::properties::{PropertySet, PropertyValue};
use super::stamp::{ClientId, LocalSeq, SeqNum, Stamp, View};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Behavior flags carried by a marker
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MarkerBehaviors(u32);

impl MarkerBehaviors {
    pub const NONE: MarkerBehaviors = MarkerBehaviors(0x0);
    /// Marker delimits a tile (paragraph, list item)
    pub const TILE: MarkerBehaviors = MarkerBehaviors(0x1);
    /// Marker opens a range
    pub const RANGE_BEGIN: MarkerBehaviors = MarkerBehaviors(0x2);
    /// Marker closes a range
    pub const RANGE_END: MarkerBehaviors = MarkerBehaviors(0x4);

    pub fn bits(&self) -> u32 {
        self.0
    }

    pub fn contains(&self, other: MarkerBehaviors) -> bool {
        self.0 & other.0 == other.0
    }
}

impl std::ops::BitOr for MarkerBehaviors {
    type Output = MarkerBehaviors;

    fn bitor(self, rhs: Self) -> Self::Output {
        MarkerBehaviors(self.0 | rhs.0)
    }
}

/// Marker descriptor
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Marker {
    #[serde(rename = "type")]
    pub marker_type: String,
    pub behaviors: MarkerBehaviors,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end: Option<usize>,
}

impl Marker {
    pub fn new(marker_type: impl Into<String>, behaviors: MarkerBehaviors) -> Self {
        Self {
            marker_type: marker_type.into(),
            behaviors,
            end: None,
        }
    }
}

/// Content of a segment
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SegmentContent {
    Text(String),
    Marker(Marker),
}

/// Local annotations waiting for acknowledgment on one property key
///
/// `sequenced` holds the latest value the sequencer has confirmed for the key.
/// It is what every other replica currently sees and what a snapshot must
/// record.
#[derive(Debug, Clone, PartialEq)]
struct PendingProperty {
    local_seqs: Vec<LocalSeq>,
    sequenced: Option<PropertyValue>,
}

/// A text run or marker in the merge tree
///
/// # Example
///
/// ```rust
/// use mergetree_core::crdt::merge_tree::{ClientId, PropertySet, Segment, Stamp};
///
/// let mut seg = Segment::make_text("hello world", PropertySet::new(), Stamp::sequenced(1, ClientId(0)));
/// let tail = seg.split(5).unwrap();
///
/// assert_eq!(seg.text(), Some("hello"));
/// assert_eq!(tail.text(), Some(" world"));
/// assert_eq!(tail.insert_stamp(), seg.insert_stamp());
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct Segment {
    content: SegmentContent,

    /// Length in chars (markers count as one)
    len: usize,

    properties: PropertySet,

    insert: Stamp,

    /// First removal; fixed once sequenced
    removal: Option<Stamp>,

    /// Clients that removed this segment concurrently after the first removal
    removed_client_overlap: Vec<ClientId>,

    /// Pending local removal superseded by a sequenced one; joins the overlap
    /// once acknowledged
    replaced_removal: Option<LocalSeq>,

    pending: BTreeMap<String, PendingProperty>,
}

impl Segment {
    pub fn make_text(text: impl Into<String>, properties: PropertySet, insert: Stamp) -> Self {
        let text = text.into();
        let len = text.chars().count();
        Self {
            content: SegmentContent::Text(text),
            len,
            properties,
            insert,
            removal: None,
            removed_client_overlap: Vec::new(),
            replaced_removal: None,
            pending: BTreeMap::new(),
        }
    }

    pub fn make_marker(marker: Marker, properties: PropertySet, insert: Stamp) -> Self {
        Self {
            content: SegmentContent::Marker(marker),
            len: 1,
            properties,
            insert,
            removal: None,
            removed_client_overlap: Vec::new(),
            replaced_removal: None,
            pending: BTreeMap::new(),
        }
    }

    /// Rebuild a segment with full attribution (used when loading snapshots)
    pub fn with_removal(
        mut self,
        removal: Option<Stamp>,
        removed_client_overlap: Vec<ClientId>,
    ) -> Self {
        self.removal = removal;
        self.removed_client_overlap = removed_client_overlap;
        self
    }

    pub fn content(&self) -> &SegmentContent {
        &self.content
    }

    pub fn text(&self) -> Option<&str> {
        match &self.content {
            SegmentContent::Text(text) => Some(text),
            SegmentContent::Marker(_) => None,
        }
    }

    pub fn marker(&self) -> Option<&Marker> {
        match &self.content {
            SegmentContent::Marker(marker) => Some(marker),
            SegmentContent::Text(_) => None,
        }
    }

    pub fn properties(&self) -> &PropertySet {
        &self.properties
    }

    pub fn insert_stamp(&self) -> Stamp {
        self.insert
    }

    pub fn removal_stamp(&self) -> Option<Stamp> {
        self.removal
    }

    pub fn removed_client_overlap(&self) -> &[ClientId] {
        &self.removed_client_overlap
    }

    /// Total length regardless of visibility
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn is_removed(&self) -> bool {
        self.removal.is_some()
    }

    /// Whether the segment has been removed as far as `view` knows
    pub fn removed_in(&self, view: View) -> bool {
        match (self.removal, view) {
            (None, _) => false,
            (Some(stamp), View::Remote { client, .. }) => {
                stamp.observed_by(view) || self.removed_client_overlap.contains(&client)
            }
            (Some(stamp), View::Local) => stamp.observed_by(view),
        }
    }

    /// Length contributed to positions computed in `view`
    pub fn view_len(&self, view: View) -> usize {
        if !self.insert.observed_by(view) || self.removed_in(view) {
            0
        } else {
            self.len
        }
    }

    /// Settled segments look identical from every view at or above `min_seq`
    pub fn is_settled(&self, min_seq: SeqNum) -> bool {
        self.insert.is_settled(min_seq)
            && self.removal.map_or(true, |r| r.is_settled(min_seq))
            && self.replaced_removal.is_none()
            && self.pending.is_empty()
    }

    /// Tombstone that no client can still reference
    pub fn is_collectible(&self, min_seq: SeqNum) -> bool {
        self.removal.is_some() && self.is_settled(min_seq)
    }

    /// Length as cached for settled segments
    pub fn settled_len(&self) -> usize {
        if self.removal.is_some() {
            0
        } else {
            self.len
        }
    }

    pub fn has_pending_annotations(&self) -> bool {
        !self.pending.is_empty()
    }

    /// Split at `offset` chars, keeping the head and returning the tail
    ///
    /// Both halves share attribution and tombstone state. Returns `None` when
    /// the offset does not fall strictly inside the segment.
    pub fn split(&mut self, offset: usize) -> Option<Segment> {
        if offset == 0 || offset >= self.len {
            return None;
        }
        let SegmentContent::Text(text) = &mut self.content else {
            return None;
        };
        let byte_offset = text.char_indices().nth(offset).map(|(i, _)| i)?;
        let tail_text = text.split_off(byte_offset);

        let tail = Segment {
            content: SegmentContent::Text(tail_text),
            len: self.len - offset,
            properties: self.properties.clone(),
            insert: self.insert,
            removal: self.removal,
            removed_client_overlap: self.removed_client_overlap.clone(),
            replaced_removal: self.replaced_removal,
            pending: self.pending.clone(),
        };
        self.len = offset;
        Some(tail)
    }

    /// Check if `next` can be coalesced onto the end of this segment
    ///
    /// Segments coalesce only when both are text with identical properties
    /// and identical attribution, so per-range history is never lost.
    pub fn can_append(&self, next: &Segment) -> bool {
        matches!(
            (&self.content, &next.content),
            (SegmentContent::Text(_), SegmentContent::Text(_))
        ) && self.insert == next.insert
            && self.removal == next.removal
            && self.removed_client_overlap == next.removed_client_overlap
            && self.replaced_removal == next.replaced_removal
            && self.properties == next.properties
            && self.pending.is_empty()
            && next.pending.is_empty()
    }

    /// Coalesce `next` onto this segment
    ///
    /// Assumes `can_append` returned true
    pub fn append(&mut self, next: Segment) {
        if let (SegmentContent::Text(text), SegmentContent::Text(more)) =
            (&mut self.content, next.content)
        {
            text.push_str(&more);
            self.len += next.len;
        }
    }

    /// Tombstone the segment
    ///
    /// The first removal wins. A sequenced removal replaces a pending local
    /// one; the local removal joins the overlap only when it is acknowledged,
    /// since until then no other replica knows about it. Later removers are
    /// added to the overlap. Returns true if anything changed.
    pub(crate) fn mark_removed(&mut self, stamp: Stamp) -> bool {
        match self.removal {
            None => {
                self.removal = Some(stamp);
                true
            }
            Some(Stamp::Local { local_seq }) => {
                let Stamp::Sequenced { .. } = stamp else {
                    return false;
                };
                self.removal = Some(stamp);
                self.replaced_removal = Some(local_seq);
                true
            }
            Some(Stamp::Sequenced { client: first, .. }) => match stamp {
                Stamp::Sequenced { client, .. } if client != first => self.add_overlap(client),
                _ => false,
            },
            Some(Stamp::Universal) => false,
        }
    }

    fn add_overlap(&mut self, client: ClientId) -> bool {
        if self.removed_client_overlap.contains(&client) {
            return false;
        }
        self.removed_client_overlap.push(client);
        true
    }

    /// Merge `props` into the property set
    ///
    /// Local annotations overwrite the visible value and remember the
    /// sequenced value underneath. Sequenced annotations on keys with pending
    /// local values only update that remembered value, since the local edit
    /// will be sequenced later and win everywhere.
    pub(crate) fn annotate(&mut self, props: &PropertySet, stamp: Stamp) {
        for (key, value) in props.iter() {
            match stamp {
                Stamp::Local { local_seq } => {
                    let current = self.properties.get(key).cloned();
                    self.pending
                        .entry(key.clone())
                        .or_insert_with(|| PendingProperty {
                            local_seqs: Vec::new(),
                            sequenced: current,
                        })
                        .local_seqs
                        .push(local_seq);
                    self.properties.set(key.clone(), value.clone());
                }
                Stamp::Sequenced { .. } | Stamp::Universal => match self.pending.get_mut(key) {
                    Some(pending) => pending.sequenced = Some(value.clone()),
                    None => self.properties.set(key.clone(), value.clone()),
                },
            }
        }
    }

    /// Replace provisional attribution for `local_seq` with `sequenced`
    ///
    /// `annotated` carries the properties of the acknowledged op when it was
    /// an annotate. Returns true if anything changed.
    pub(crate) fn ack(
        &mut self,
        local_seq: LocalSeq,
        sequenced: Stamp,
        annotated: Option<&PropertySet>,
    ) -> bool {
        let pending_stamp = Stamp::local(local_seq);
        let mut changed = false;

        if self.insert == pending_stamp {
            self.insert = sequenced;
            changed = true;
        }
        if self.removal == Some(pending_stamp) {
            self.removal = Some(sequenced);
            changed = true;
        }
        if self.replaced_removal == Some(local_seq) {
            self.replaced_removal = None;
            if let Stamp::Sequenced { client, .. } = sequenced {
                self.add_overlap(client);
            }
            changed = true;
        }
        if let Some(props) = annotated {
            for (key, value) in props.iter() {
                let Some(pending) = self.pending.get_mut(key) else {
                    continue;
                };
                let Some(idx) = pending.local_seqs.iter().position(|s| *s == local_seq) else {
                    continue;
                };
                pending.local_seqs.remove(idx);
                pending.sequenced = Some(value.clone());
                if pending.local_seqs.is_empty() {
                    self.pending.remove(key);
                }
                changed = true;
            }
        }
        changed
    }

    /// Properties as confirmed by the sequencer (pending local values hidden)
    pub fn sequenced_properties(&self) -> PropertySet {
        let mut props = self.properties.clone();
        for (key, pending) in &self.pending {
            match &pending.sequenced {
                Some(value) => props.set(key.clone(), value.clone()),
                None => {
                    props.remove(key);
                }
            }
        }
        props
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seq(seq: SeqNum, client: u32) -> Stamp {
        Stamp::sequenced(seq, ClientId(client))
    }

    #[test]
    fn test_new_text_segment() {
        let seg = Segment::make_text("Hello", PropertySet::new(), seq(1, 0));

        assert_eq!(seg.len(), 5);
        assert_eq!(seg.text(), Some("Hello"));
        assert!(seg.marker().is_none());
        assert!(!seg.is_removed());
    }

    #[test]
    fn test_marker_occupies_one_position() {
        let marker = Marker::new("pg", MarkerBehaviors::TILE);
        let seg = Segment::make_marker(marker, PropertySet::new(), seq(1, 0));

        assert_eq!(seg.len(), 1);
        assert!(seg.text().is_none());
        assert!(seg.marker().unwrap().behaviors.contains(MarkerBehaviors::TILE));
    }

    #[test]
    fn test_split_multibyte() {
        let mut seg = Segment::make_text("héllo👋x", PropertySet::new(), seq(1, 0));
        assert_eq!(seg.len(), 7);

        let tail = seg.split(6).unwrap();
        assert_eq!(seg.text(), Some("héllo👋"));
        assert_eq!(tail.text(), Some("x"));
        assert_eq!(seg.len(), 6);
        assert_eq!(tail.len(), 1);
    }

    #[test]
    fn test_split_rejects_edges_and_markers() {
        let mut seg = Segment::make_text("abc", PropertySet::new(), seq(1, 0));
        assert!(seg.split(0).is_none());
        assert!(seg.split(3).is_none());

        let mut marker = Segment::make_marker(
            Marker::new("pg", MarkerBehaviors::NONE),
            PropertySet::new(),
            seq(1, 0),
        );
        assert!(marker.split(1).is_none());
    }

    #[test]
    fn test_split_keeps_tombstone() {
        let mut seg = Segment::make_text("abcd", PropertySet::new(), seq(1, 0));
        seg.mark_removed(seq(2, 1));

        let tail = seg.split(2).unwrap();
        assert_eq!(tail.removal_stamp(), Some(seq(2, 1)));
        assert_eq!(seg.removal_stamp(), Some(seq(2, 1)));
    }

    #[test]
    fn test_append_requires_matching_attribution() {
        let mut a = Segment::make_text("ab", PropertySet::new(), seq(1, 0));
        let b = Segment::make_text("cd", PropertySet::new(), seq(1, 0));
        let c = Segment::make_text("ef", PropertySet::new(), seq(2, 0));

        assert!(a.can_append(&b));
        assert!(!a.can_append(&c));

        a.append(b);
        assert_eq!(a.text(), Some("abcd"));
        assert_eq!(a.len(), 4);
    }

    #[test]
    fn test_view_len() {
        let mut seg = Segment::make_text("abc", PropertySet::new(), seq(5, 1));

        assert_eq!(seg.view_len(View::Local), 3);
        assert_eq!(seg.view_len(View::remote(4, ClientId(2))), 0);
        assert_eq!(seg.view_len(View::remote(5, ClientId(2))), 3);

        seg.mark_removed(seq(7, 2));
        assert_eq!(seg.view_len(View::Local), 0);
        assert_eq!(seg.view_len(View::remote(6, ClientId(3))), 3);
        assert_eq!(seg.view_len(View::remote(6, ClientId(2))), 0);
    }

    #[test]
    fn test_first_removal_wins() {
        let mut seg = Segment::make_text("abc", PropertySet::new(), seq(1, 0));

        assert!(seg.mark_removed(seq(3, 1)));
        assert!(seg.mark_removed(seq(4, 2)));
        assert_eq!(seg.removal_stamp(), Some(seq(3, 1)));
        assert_eq!(seg.removed_client_overlap(), &[ClientId(2)]);

        // Overlapping remover sees its own removal
        assert_eq!(seg.view_len(View::remote(2, ClientId(2))), 0);
        assert_eq!(seg.view_len(View::remote(2, ClientId(5))), 3);
    }

    #[test]
    fn test_sequenced_removal_replaces_local() {
        let mut seg = Segment::make_text("abc", PropertySet::new(), seq(1, 0));
        seg.mark_removed(Stamp::local(1));
        seg.mark_removed(seq(4, 2));

        assert_eq!(seg.removal_stamp(), Some(seq(4, 2)));
        assert_eq!(seg.view_len(View::Local), 0);
        // Nobody else has seen the local removal yet
        assert!(seg.removed_client_overlap().is_empty());
        assert_eq!(seg.view_len(View::remote(3, ClientId(9))), 3);
        assert!(!seg.is_settled(100));

        assert!(seg.ack(1, seq(5, 9), None));
        assert_eq!(seg.removal_stamp(), Some(seq(4, 2)));
        assert_eq!(seg.removed_client_overlap(), &[ClientId(9)]);
        assert!(seg.is_collectible(5));
    }

    #[test]
    fn test_replaced_removal_blocks_coalescing() {
        let mut a = Segment::make_text("ab", PropertySet::new(), seq(1, 0));
        let mut b = Segment::make_text("cd", PropertySet::new(), seq(1, 0));
        a.mark_removed(Stamp::local(1));
        a.mark_removed(seq(2, 1));
        b.mark_removed(seq(2, 1));

        assert!(!a.can_append(&b));
    }

    #[test]
    fn test_pending_annotation_shadows_remote() {
        let mut seg = Segment::make_text("abc", PropertySet::new(), seq(1, 0));
        let local: PropertySet = [("color", "red")].into_iter().collect();
        let remote: PropertySet = [("color", "blue")].into_iter().collect();

        seg.annotate(&local, Stamp::local(1));
        seg.annotate(&remote, seq(2, 3));

        assert_eq!(seg.properties().get("color"), Some(&"red".into()));
        assert_eq!(seg.sequenced_properties().get("color"), Some(&"blue".into()));
        assert!(!seg.is_settled(100));

        assert!(seg.ack(1, seq(3, 1), Some(&local)));
        assert_eq!(seg.properties().get("color"), Some(&"red".into()));
        assert_eq!(seg.sequenced_properties().get("color"), Some(&"red".into()));
        assert!(!seg.has_pending_annotations());
    }

    #[test]
    fn test_ack_retags_insert_and_removal() {
        let mut seg = Segment::make_text("abc", PropertySet::new(), Stamp::local(1));
        seg.mark_removed(Stamp::local(2));

        assert!(seg.ack(1, seq(10, 0), None));
        assert_eq!(seg.insert_stamp(), seq(10, 0));
        assert_eq!(seg.removal_stamp(), Some(Stamp::local(2)));

        assert!(seg.ack(2, seq(11, 0), None));
        assert_eq!(seg.removal_stamp(), Some(seq(11, 0)));
        assert!(seg.is_collectible(11));
        assert!(!seg.is_collectible(10));
    }
}
