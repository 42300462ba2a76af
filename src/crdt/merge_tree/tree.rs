//! MergeTree: position-addressed segment sequence with per-view resolution
//!
//! Every operation names the view it was issued in. Positions are resolved by
//! counting only the segments that view can see, which is how an operation
//! authored against an older state lands in the right place after everything
//! sequenced since then has been applied.
//!
//! # Concurrent inserts
//!
//! A new segment attaches right before the first segment visible in its view
//! at or after the insert position. Zero-length segments at that boundary
//! (tombstones, concurrent inserts the issuer had not seen) therefore end up
//! on its left. It then steps left over zero-length segments stamped higher
//! than itself, which on a replica with unacknowledged edits are exactly the
//! local inserts that will be sequenced later. Concurrent inserts at the same
//! position thus settle in ascending `(seq, client)` order on every replica.

use super::btree::{Location, SegmentTree};
use super::properties::PropertySet;
use super::segment::{Segment, SegmentContent};
use super::stamp::{ClientId, LocalSeq, SeqNum, Stamp, View};
use super::window::CollabWindow;
use crate::error::{Error, Result};
use tracing::trace;

/// Ordered segment container with collaboration window
///
/// # Example
///
/// ```rust
/// use mergetree_core::crdt::merge_tree::{ClientId, MergeTree, PropertySet, Segment, Stamp, View};
///
/// let mut tree = MergeTree::new();
/// let a = Stamp::sequenced(1, ClientId(1));
/// tree.insert_segment(0, Segment::make_text("hello", PropertySet::new(), a), View::remote(0, ClientId(1)))
///     .unwrap();
///
/// // Client 2 had seen seq 1 when it inserted at position 0
/// let b = Stamp::sequenced(2, ClientId(2));
/// tree.insert_segment(0, Segment::make_text("X", PropertySet::new(), b), View::remote(1, ClientId(2)))
///     .unwrap();
///
/// assert_eq!(tree.get_text(), "Xhello");
/// ```
#[derive(Debug, Clone, Default)]
pub struct MergeTree {
    segments: SegmentTree,
    window: CollabWindow,
}

impl MergeTree {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn window(&self) -> &CollabWindow {
        &self.window
    }

    pub(crate) fn window_mut(&mut self) -> &mut CollabWindow {
        &mut self.window
    }

    /// Switch to collaborative mode as `long_id`, with `initial_seq` applied
    pub fn start_collaboration(&mut self, long_id: &str, initial_seq: SeqNum) -> Result<ClientId> {
        self.window.start_collaboration(long_id, initial_seq)
    }

    /// Visible length in the local view
    pub fn len(&self) -> usize {
        self.segments.view_len(View::Local)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn length_in_view(&self, view: View) -> usize {
        self.segments.view_len(view)
    }

    /// Number of stored segments, tombstones included
    pub fn segment_count(&self) -> usize {
        self.segments.count()
    }

    /// Insert `content` at `pos` as seen from `view`
    pub fn insert(
        &mut self,
        pos: usize,
        content: SegmentContent,
        properties: PropertySet,
        stamp: Stamp,
        view: View,
    ) -> Result<()> {
        let segment = match content {
            SegmentContent::Text(text) => Segment::make_text(text, properties, stamp),
            SegmentContent::Marker(marker) => Segment::make_marker(marker, properties, stamp),
        };
        self.insert_segment(pos, segment, view)
    }

    /// Insert a prepared segment at `pos` as seen from `view`
    ///
    /// Empty text segments are accepted and dropped.
    pub fn insert_segment(&mut self, pos: usize, segment: Segment, view: View) -> Result<()> {
        let location = self.locate(pos, view)?;
        if segment.is_empty() {
            return Ok(());
        }

        let min_seq = self.window.min_seq();
        let mut index = self.segments.split_at(location, min_seq);
        let stamp = segment.insert_stamp();
        while index > 0 {
            match self.segments.get(index - 1) {
                Some(prev) if prev.view_len(view) == 0 && prev.insert_stamp() > stamp => {
                    index -= 1;
                }
                _ => break,
            }
        }

        trace!(pos, index, %stamp, len = segment.len(), "insert segment");
        self.segments.insert(index, segment, min_seq);
        Ok(())
    }

    /// Tombstone everything visible to `view` in `[start, end)`
    pub fn remove(&mut self, start: usize, end: usize, stamp: Stamp, view: View) -> Result<()> {
        self.check_range(start, end, view)?;
        if start == end {
            return Ok(());
        }

        let (first, last) = self.split_range(start, end, view)?;
        let min_seq = self.window.min_seq();
        let mut removed = 0;
        for index in first..last {
            let changed = self.segments.update(index, min_seq, |seg| {
                seg.view_len(view) > 0 && seg.mark_removed(stamp)
            });
            if changed == Some(true) {
                removed += 1;
            }
        }

        trace!(start, end, %stamp, removed, "remove range");
        Ok(())
    }

    /// Merge `props` into every segment visible to `view` in `[start, end)`
    pub fn annotate(
        &mut self,
        start: usize,
        end: usize,
        props: &PropertySet,
        stamp: Stamp,
        view: View,
    ) -> Result<()> {
        self.check_range(start, end, view)?;
        if start == end || props.is_empty() {
            return Ok(());
        }

        let (first, last) = self.split_range(start, end, view)?;
        let min_seq = self.window.min_seq();
        for index in first..last {
            self.segments.update(index, min_seq, |seg| {
                if seg.view_len(view) > 0 {
                    seg.annotate(props, stamp);
                }
            });
        }

        trace!(start, end, %stamp, keys = props.len(), "annotate range");
        Ok(())
    }

    /// Visible segments in order, tombstones skipped
    pub fn iter(&self) -> impl Iterator<Item = &Segment> + Clone + '_ {
        self.segments
            .iter()
            .filter(|seg| seg.view_len(View::Local) > 0)
    }

    /// Every stored segment in order, tombstones included
    pub fn segments(&self) -> impl Iterator<Item = &Segment> + Clone + '_ {
        self.segments.iter()
    }

    /// Visible text; markers render nothing
    pub fn get_text(&self) -> String {
        self.iter().filter_map(|seg| seg.text()).collect()
    }

    pub fn get_text_range(&self, start: usize, end: usize) -> Result<String> {
        self.check_range(start, end, View::Local)?;

        let mut text = String::new();
        let mut pos = 0;
        for seg in self.iter() {
            if pos >= end {
                break;
            }
            let seg_end = pos + seg.len();
            if seg_end > start {
                if let Some(run) = seg.text() {
                    let from = start.saturating_sub(pos);
                    let to = (end - pos).min(seg.len());
                    text.extend(run.chars().skip(from).take(to - from));
                }
            }
            pos = seg_end;
        }
        Ok(text)
    }

    /// Visible segment covering `pos` and the offset inside it
    pub fn segment_at(&self, pos: usize) -> Option<(&Segment, usize)> {
        let location = self.segments.locate(pos, View::Local)?;
        let segment = self.segments.get(location.index)?;
        Some((segment, location.offset))
    }

    /// Translate `pos` as seen by `client` at `ref_seq` into the local view
    ///
    /// A position inside content this replica has since removed maps to the
    /// start of the next visible content.
    pub fn rebase_position(&self, pos: usize, ref_seq: SeqNum, client: ClientId) -> Result<usize> {
        let location = self.locate(pos, View::remote(ref_seq, client))?;
        let base = self.segments.prefix_len(location.index, View::Local);
        let inside = match self.segments.get(location.index) {
            Some(seg) if seg.view_len(View::Local) > 0 => location.offset,
            _ => 0,
        };
        Ok(base + inside)
    }

    /// Raise the window floor and collect tombstones nobody can reference
    ///
    /// Returns false, leaving everything untouched, when `new_min` does not
    /// advance the floor.
    pub fn update_min_seq(&mut self, new_min: SeqNum) -> bool {
        if !self.window.advance_min_seq(new_min) {
            return false;
        }
        let before = self.segments.count();
        self.segments.sweep(new_min, &mut |_| {}, true);
        trace!(
            min_seq = new_min,
            collected = before.saturating_sub(self.segments.count()),
            "collected tombstones"
        );
        true
    }

    /// Re-tag provisional attribution of `local_seq` with `sequenced`
    pub(crate) fn ack(&mut self, local_seq: LocalSeq, sequenced: Stamp, annotated: Option<&PropertySet>) {
        let min_seq = self.window.min_seq();
        let mut retagged = 0usize;
        self.segments.sweep(
            min_seq,
            &mut |seg| {
                if seg.ack(local_seq, sequenced, annotated) {
                    retagged += 1;
                }
            },
            false,
        );
        trace!(local_seq, %sequenced, retagged, "acknowledged local op");
    }

    /// Replace all content with `segments` and reset the window bounds
    pub fn reload_from_segments(
        &mut self,
        segments: impl IntoIterator<Item = Segment>,
        min_seq: SeqNum,
        current_seq: SeqNum,
    ) {
        self.window.reset(min_seq, current_seq);
        let mut tree = SegmentTree::new();
        for segment in segments {
            tree.push(segment, min_seq);
        }
        self.segments = tree;
    }

    /// Append a segment after everything stored, bypassing position resolution
    pub fn append_segment(&mut self, segment: Segment) {
        self.segments.push(segment, self.window.min_seq());
    }

    fn locate(&self, pos: usize, view: View) -> Result<Location> {
        self.segments
            .locate(pos, view)
            .ok_or_else(|| Error::PositionOutOfBounds {
                position: pos,
                length: self.segments.view_len(view),
            })
    }

    fn check_range(&self, start: usize, end: usize, view: View) -> Result<()> {
        let length = self.segments.view_len(view);
        if start > end || end > length {
            return Err(Error::InvalidRange { start, end, length });
        }
        Ok(())
    }

    /// Split at both range ends, returning the covered index range
    fn split_range(&mut self, start: usize, end: usize, view: View) -> Result<(usize, usize)> {
        let min_seq = self.window.min_seq();
        let first = self.locate(start, view)?;
        let first = self.segments.split_at(first, min_seq);
        let last = self.locate(end, view)?;
        let last = self.segments.split_at(last, min_seq);
        Ok((first, last))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crdt::merge_tree::{Marker, MarkerBehaviors};

    fn stamp(seq: SeqNum, client: u32) -> Stamp {
        Stamp::sequenced(seq, ClientId(client))
    }

    fn view(ref_seq: SeqNum, client: u32) -> View {
        View::remote(ref_seq, ClientId(client))
    }

    fn text(s: &str) -> SegmentContent {
        SegmentContent::Text(s.to_string())
    }

    /// Apply an insert as if sequenced at `seq` by `client` with `ref_seq`
    fn remote_insert(tree: &mut MergeTree, pos: usize, s: &str, seq: SeqNum, ref_seq: SeqNum, client: u32) {
        tree.insert(pos, text(s), PropertySet::new(), stamp(seq, client), view(ref_seq, client))
            .unwrap();
        tree.window_mut().set_current_seq(seq);
    }

    #[test]
    fn test_insert_relative_to_reference() {
        let mut tree = MergeTree::new();
        remote_insert(&mut tree, 0, "hello", 1, 0, 1);
        remote_insert(&mut tree, 0, "X", 2, 1, 2);

        assert_eq!(tree.get_text(), "Xhello");
        assert_eq!(tree.len(), 6);
    }

    #[test]
    fn test_remove_then_collect() {
        let mut tree = MergeTree::new();
        remote_insert(&mut tree, 0, "hello world", 1, 0, 1);
        tree.remove(0, 5, stamp(3, 2), view(1, 2)).unwrap();
        tree.window_mut().set_current_seq(3);

        assert_eq!(tree.get_text(), " world");
        assert_eq!(tree.segment_count(), 2);

        // A client that has not seen the removal still counts the text
        assert_eq!(tree.length_in_view(view(2, 3)), 11);

        assert!(tree.update_min_seq(3));
        assert_eq!(tree.segment_count(), 1);
        assert_eq!(tree.get_text(), " world");
    }

    #[test]
    fn test_concurrent_inserts_ascending_order() {
        // Arrival order: seq 4 then seq 5, both issued against seq 3
        let mut tree = MergeTree::new();
        remote_insert(&mut tree, 0, "ab", 1, 0, 3);
        remote_insert(&mut tree, 1, "B", 4, 3, 2);
        remote_insert(&mut tree, 1, "A", 5, 3, 1);
        assert_eq!(tree.get_text(), "aBAb");
    }

    #[test]
    fn test_remote_insert_lands_left_of_pending_local() {
        let mut tree = MergeTree::new();
        remote_insert(&mut tree, 0, "ab", 1, 0, 3);
        let me = tree.start_collaboration("me", 3).unwrap();

        // Local insert, to be sequenced later as seq 5
        tree.insert(1, text("A"), PropertySet::new(), Stamp::local(1), View::Local)
            .unwrap();
        assert_eq!(tree.get_text(), "aAb");

        // Concurrent remote insert sequenced first
        remote_insert(&mut tree, 1, "B", 4, 3, 2);
        assert_eq!(tree.get_text(), "aBAb");

        tree.ack(1, Stamp::sequenced(5, me), None);
        assert_eq!(tree.get_text(), "aBAb");
        assert!(tree.segments().all(|s| !s.insert_stamp().is_local()));
    }

    #[test]
    fn test_insert_ignores_tombstones_at_boundary() {
        let mut tree = MergeTree::new();
        remote_insert(&mut tree, 0, "xTy", 1, 0, 1);
        tree.remove(1, 2, stamp(2, 3), view(1, 3)).unwrap();
        tree.window_mut().set_current_seq(2);

        // Issued before the removal, position 1 sits before the tombstone
        remote_insert(&mut tree, 1, "L", 3, 1, 2);
        // Issued after the removal, same visible position
        remote_insert(&mut tree, 1, "R", 4, 2, 4);

        assert_eq!(tree.get_text(), "xLRy");
    }

    #[test]
    fn test_overlapping_removals() {
        let mut tree = MergeTree::new();
        remote_insert(&mut tree, 0, "abcdef", 1, 0, 1);

        tree.remove(1, 4, stamp(2, 2), view(1, 2)).unwrap();
        // Client 3 concurrently removes an overlapping range
        tree.remove(2, 5, stamp(3, 3), view(1, 3)).unwrap();
        tree.window_mut().set_current_seq(3);

        assert_eq!(tree.get_text(), "af");
        // Client 3 still sees its own removal of "cd" after the first remover
        assert_eq!(tree.length_in_view(view(1, 3)), 3);
        // Client 2 sees only its own removal of "bcd"
        assert_eq!(tree.length_in_view(view(1, 2)), 3);
    }

    #[test]
    fn test_annotate_splits_at_boundaries() {
        let mut tree = MergeTree::new();
        remote_insert(&mut tree, 0, "hello world", 1, 0, 1);

        let props: PropertySet = [("bold", true)].into_iter().collect();
        tree.annotate(6, 11, &props, stamp(2, 1), view(1, 1)).unwrap();

        let segments: Vec<_> = tree.iter().collect();
        assert_eq!(segments.len(), 2);
        assert_eq!(segments[0].text(), Some("hello "));
        assert!(segments[0].properties().is_empty());
        assert_eq!(segments[1].text(), Some("world"));
        assert_eq!(segments[1].properties().get("bold"), Some(&true.into()));
    }

    #[test]
    fn test_invalid_ranges_are_rejected_without_mutation() {
        let mut tree = MergeTree::new();
        remote_insert(&mut tree, 0, "abc", 1, 0, 1);

        assert!(matches!(
            tree.remove(2, 1, stamp(2, 1), View::Local),
            Err(Error::InvalidRange { start: 2, end: 1, length: 3 })
        ));
        assert!(matches!(
            tree.remove(1, 4, stamp(2, 1), View::Local),
            Err(Error::InvalidRange { .. })
        ));
        assert!(matches!(
            tree.insert(4, text("x"), PropertySet::new(), stamp(2, 1), View::Local),
            Err(Error::PositionOutOfBounds { position: 4, length: 3 })
        ));
        assert_eq!(tree.get_text(), "abc");
        assert_eq!(tree.segment_count(), 1);
    }

    #[test]
    fn test_markers_occupy_one_position() {
        let mut tree = MergeTree::new();
        remote_insert(&mut tree, 0, "ab", 1, 0, 1);
        tree.insert(
            1,
            SegmentContent::Marker(Marker::new("pg", MarkerBehaviors::TILE)),
            PropertySet::new(),
            stamp(2, 1),
            view(1, 1),
        )
        .unwrap();

        assert_eq!(tree.len(), 3);
        assert_eq!(tree.get_text(), "ab");
        let (segment, offset) = tree.segment_at(1).unwrap();
        assert!(segment.marker().is_some());
        assert_eq!(offset, 0);
        assert_eq!(tree.get_text_range(1, 3).unwrap(), "b");
    }

    #[test]
    fn test_get_text_range() {
        let mut tree = MergeTree::new();
        remote_insert(&mut tree, 0, "hello ", 1, 0, 1);
        remote_insert(&mut tree, 6, "world", 2, 1, 1);

        assert_eq!(tree.get_text_range(3, 8).unwrap(), "lo wo");
        assert_eq!(tree.get_text_range(0, 0).unwrap(), "");
        assert!(tree.get_text_range(5, 20).is_err());
    }

    #[test]
    fn test_rebase_position() {
        let mut tree = MergeTree::new();
        remote_insert(&mut tree, 0, "world", 1, 0, 1);
        remote_insert(&mut tree, 0, "hello ", 2, 1, 1);

        // Client 2 at seq 1 only knows "world"
        assert_eq!(tree.rebase_position(0, 1, ClientId(2)).unwrap(), 6);
        assert_eq!(tree.rebase_position(3, 1, ClientId(2)).unwrap(), 9);
        assert_eq!(tree.rebase_position(5, 1, ClientId(2)).unwrap(), 11);
        assert!(tree.rebase_position(6, 1, ClientId(2)).is_err());
    }

    #[test]
    fn test_update_min_seq_is_monotonic() {
        let mut tree = MergeTree::new();
        tree.start_collaboration("me", 10).unwrap();

        assert!(tree.update_min_seq(5));
        assert!(!tree.update_min_seq(4));
        assert_eq!(tree.window().min_seq(), 5);
    }

    #[test]
    fn test_collect_coalesces_split_segments() {
        let mut tree = MergeTree::new();
        remote_insert(&mut tree, 0, "abcdef", 1, 0, 1);
        let props: PropertySet = [("k", 1i64)].into_iter().collect();
        tree.annotate(2, 4, &props, stamp(2, 1), view(1, 1)).unwrap();
        assert_eq!(tree.segment_count(), 3);

        tree.annotate(0, 6, &props, stamp(3, 1), view(2, 1)).unwrap();
        tree.window_mut().set_current_seq(3);
        tree.update_min_seq(3);

        assert_eq!(tree.segment_count(), 1);
        assert_eq!(tree.get_text(), "abcdef");
    }

    #[test]
    fn test_reload_and_append() {
        let mut tree = MergeTree::new();
        tree.reload_from_segments(
            vec![Segment::make_text("head", PropertySet::new(), Stamp::Universal)],
            4,
            4,
        );
        tree.append_segment(Segment::make_text("body", PropertySet::new(), stamp(3, 1)));

        assert_eq!(tree.get_text(), "headbody");
        assert_eq!(tree.window().min_seq(), 4);
        assert_eq!(tree.window().current_seq(), 4);
    }
}
