//! Order-statistic B-tree holding the segment sequence
//!
//! Segments are addressed by absolute index (tombstones included). Every node
//! caches `Stats` so that index lookups are O(log n) and so that lengths in a
//! view can skip whole subtrees whose segments are settled.
//!
//! # View lengths
//!
//! A settled segment (see `Segment::is_settled`) has the same length in every
//! view the protocol can still produce, so a node caches the summed length of
//! its settled segments. Computing the length of a node in an arbitrary view
//! only descends into children that hold unsettled segments. Those are the
//! segments inside the collaboration window, so position lookups cost
//! O(log n + w) where w is the number of window segments met on the way.

use super::segment::Segment;
use super::stamp::{SeqNum, View};

const MAX_LEAF_SEGMENTS: usize = 32;
const MAX_CHILDREN: usize = 16;

/// Cached per-node aggregates
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct Stats {
    /// Segments in the subtree, tombstones included
    pub count: usize,

    /// Total length of settled, live segments
    pub settled_len: usize,

    /// Segments whose length depends on the view
    pub unsettled: usize,

    /// Settled tombstones awaiting collection
    pub collectible: usize,
}

impl Stats {
    fn of(segment: &Segment, min_seq: SeqNum) -> Self {
        let settled = segment.is_settled(min_seq);
        Self {
            count: 1,
            settled_len: if settled { segment.settled_len() } else { 0 },
            unsettled: usize::from(!settled),
            collectible: usize::from(settled && segment.is_removed()),
        }
    }
}

impl std::ops::Add for Stats {
    type Output = Stats;

    fn add(self, rhs: Self) -> Self::Output {
        Stats {
            count: self.count + rhs.count,
            settled_len: self.settled_len + rhs.settled_len,
            unsettled: self.unsettled + rhs.unsettled,
            collectible: self.collectible + rhs.collectible,
        }
    }
}

#[derive(Debug, Clone)]
enum Node {
    Leaf { stats: Stats, segments: Vec<Segment> },
    Internal { stats: Stats, children: Vec<Node> },
}

impl Node {
    fn empty_leaf() -> Self {
        Node::Leaf {
            stats: Stats::default(),
            segments: Vec::new(),
        }
    }

    fn leaf(segments: Vec<Segment>, min_seq: SeqNum) -> Self {
        let mut node = Node::Leaf {
            stats: Stats::default(),
            segments,
        };
        node.recompute(min_seq);
        node
    }

    fn internal(children: Vec<Node>, min_seq: SeqNum) -> Self {
        let mut node = Node::Internal {
            stats: Stats::default(),
            children,
        };
        node.recompute(min_seq);
        node
    }

    fn stats(&self) -> &Stats {
        match self {
            Node::Leaf { stats, .. } | Node::Internal { stats, .. } => stats,
        }
    }

    fn recompute(&mut self, min_seq: SeqNum) {
        match self {
            Node::Leaf { stats, segments } => {
                *stats = segments
                    .iter()
                    .fold(Stats::default(), |acc, seg| acc + Stats::of(seg, min_seq));
            }
            Node::Internal { stats, children } => {
                *stats = children
                    .iter()
                    .fold(Stats::default(), |acc, child| acc + *child.stats());
            }
        }
    }

    fn view_len(&self, view: View) -> usize {
        let stats = self.stats();
        if stats.unsettled == 0 {
            return stats.settled_len;
        }
        match self {
            Node::Leaf { segments, .. } => segments.iter().map(|s| s.view_len(view)).sum(),
            Node::Internal { children, .. } => children.iter().map(|c| c.view_len(view)).sum(),
        }
    }

    /// Insert at `index` within this subtree, returning a split-off right
    /// sibling when the node overflows
    fn insert(&mut self, index: usize, segment: Segment, min_seq: SeqNum) -> Option<Node> {
        let sibling = match self {
            Node::Leaf { segments, .. } => {
                let index = index.min(segments.len());
                segments.insert(index, segment);
                if segments.len() > MAX_LEAF_SEGMENTS {
                    let right = segments.split_off(segments.len() / 2);
                    Some(Node::leaf(right, min_seq))
                } else {
                    None
                }
            }
            Node::Internal { children, .. } => {
                let mut remaining = index;
                let mut target = children.len().saturating_sub(1);
                for (i, child) in children.iter().enumerate() {
                    let count = child.stats().count;
                    if remaining <= count {
                        target = i;
                        break;
                    }
                    remaining -= count;
                }
                if let Some(split) = children[target].insert(remaining, segment, min_seq) {
                    children.insert(target + 1, split);
                }
                if children.len() > MAX_CHILDREN {
                    let right = children.split_off(children.len() / 2);
                    Some(Node::internal(right, min_seq))
                } else {
                    None
                }
            }
        };
        self.recompute(min_seq);
        sibling
    }

    fn update<R>(
        &mut self,
        index: usize,
        min_seq: SeqNum,
        f: impl FnOnce(&mut Segment) -> R,
    ) -> Option<R> {
        let result = match self {
            Node::Leaf { segments, .. } => segments.get_mut(index).map(f),
            Node::Internal { children, .. } => {
                let mut remaining = index;
                let mut result = None;
                for child in children.iter_mut() {
                    let count = child.stats().count;
                    if remaining < count {
                        result = child.update(remaining, min_seq, f);
                        break;
                    }
                    remaining -= count;
                }
                result
            }
        };
        if result.is_some() {
            self.recompute(min_seq);
        }
        result
    }

    /// Visit window segments, optionally dropping collectible tombstones and
    /// coalescing neighbours
    fn sweep(&mut self, min_seq: SeqNum, visit: &mut dyn FnMut(&mut Segment), collect: bool) {
        let stats = *self.stats();
        if stats.unsettled == 0 && !(collect && stats.collectible > 0) {
            return;
        }
        match self {
            Node::Leaf { segments, .. } => {
                for segment in segments.iter_mut() {
                    if !segment.is_settled(min_seq) {
                        visit(segment);
                    }
                }
                if collect {
                    segments.retain(|s| !s.is_collectible(min_seq));
                    coalesce(segments);
                }
            }
            Node::Internal { children, .. } => {
                for child in children.iter_mut() {
                    child.sweep(min_seq, visit, collect);
                }
                children.retain(|c| c.stats().count > 0);
            }
        }
        self.recompute(min_seq);
    }
}

fn coalesce(segments: &mut Vec<Segment>) {
    let mut merged: Vec<Segment> = Vec::with_capacity(segments.len());
    for segment in segments.drain(..) {
        match merged.last_mut() {
            Some(prev) if prev.can_append(&segment) => prev.append(segment),
            _ => merged.push(segment),
        }
    }
    *segments = merged;
}

/// Where a position falls in the segment sequence
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Location {
    /// Index of the segment holding the position, or the segment count
    pub index: usize,
    /// Offset inside that segment; zero means "right before it"
    pub offset: usize,
}

/// Segment sequence with order statistics
#[derive(Debug, Clone)]
pub(crate) struct SegmentTree {
    root: Node,
}

impl Default for SegmentTree {
    fn default() -> Self {
        Self::new()
    }
}

impl SegmentTree {
    pub fn new() -> Self {
        Self {
            root: Node::empty_leaf(),
        }
    }

    /// Number of segments, tombstones included
    pub fn count(&self) -> usize {
        self.root.stats().count
    }

    pub fn stats(&self) -> Stats {
        *self.root.stats()
    }

    pub fn view_len(&self, view: View) -> usize {
        self.root.view_len(view)
    }

    pub fn get(&self, index: usize) -> Option<&Segment> {
        let mut node = &self.root;
        let mut remaining = index;
        loop {
            match node {
                Node::Leaf { segments, .. } => return segments.get(remaining),
                Node::Internal { children, .. } => {
                    let mut next = None;
                    for child in children {
                        let count = child.stats().count;
                        if remaining < count {
                            next = Some(child);
                            break;
                        }
                        remaining -= count;
                    }
                    node = next?;
                }
            }
        }
    }

    /// Find the first segment with positive length in `view` that covers or
    /// follows `pos`
    ///
    /// Zero-length segments sitting at the position are skipped, so a
    /// returned offset of zero names the segment right after them. Returns
    /// `None` when `pos` exceeds the length of the view.
    pub fn locate(&self, pos: usize, view: View) -> Option<Location> {
        let mut node = &self.root;
        let mut index = 0;
        let mut pos = pos;
        loop {
            match node {
                Node::Leaf { segments, .. } => {
                    for segment in segments {
                        let len = segment.view_len(view);
                        if pos < len {
                            return Some(Location { index, offset: pos });
                        }
                        pos -= len;
                        index += 1;
                    }
                    return (pos == 0).then_some(Location { index, offset: 0 });
                }
                Node::Internal { children, .. } => {
                    let mut next = None;
                    for child in children {
                        let len = child.view_len(view);
                        if pos < len {
                            next = Some(child);
                            break;
                        }
                        pos -= len;
                        index += child.stats().count;
                    }
                    match next {
                        Some(child) => node = child,
                        None => return (pos == 0).then_some(Location { index, offset: 0 }),
                    }
                }
            }
        }
    }

    /// Summed `view` length of the segments before `index`
    pub fn prefix_len(&self, index: usize, view: View) -> usize {
        let mut node = &self.root;
        let mut remaining = index;
        let mut acc = 0;
        loop {
            match node {
                Node::Leaf { segments, .. } => {
                    return acc
                        + segments
                            .iter()
                            .take(remaining)
                            .map(|s| s.view_len(view))
                            .sum::<usize>();
                }
                Node::Internal { children, .. } => {
                    let mut next = None;
                    for child in children {
                        let count = child.stats().count;
                        if remaining < count {
                            next = Some(child);
                            break;
                        }
                        acc += child.view_len(view);
                        remaining -= count;
                    }
                    match next {
                        Some(child) => node = child,
                        None => return acc,
                    }
                }
            }
        }
    }

    pub fn insert(&mut self, index: usize, segment: Segment, min_seq: SeqNum) {
        if let Some(sibling) = self.root.insert(index, segment, min_seq) {
            let left = std::mem::replace(&mut self.root, Node::empty_leaf());
            self.root = Node::internal(vec![left, sibling], min_seq);
        }
    }

    pub fn push(&mut self, segment: Segment, min_seq: SeqNum) {
        self.insert(self.count(), segment, min_seq);
    }

    /// Mutate the segment at `index`, refreshing cached stats on the path
    pub fn update<R>(
        &mut self,
        index: usize,
        min_seq: SeqNum,
        f: impl FnOnce(&mut Segment) -> R,
    ) -> Option<R> {
        self.root.update(index, min_seq, f)
    }

    /// Split the segment at `location` so that a boundary exists there
    ///
    /// Returns the index of the first segment after the boundary.
    pub fn split_at(&mut self, location: Location, min_seq: SeqNum) -> usize {
        if location.offset == 0 {
            return location.index;
        }
        let tail = self
            .update(location.index, min_seq, |seg| seg.split(location.offset))
            .flatten();
        match tail {
            Some(tail) => {
                self.insert(location.index + 1, tail, min_seq);
                location.index + 1
            }
            None => location.index,
        }
    }

    /// Visit every unsettled segment; with `collect`, also drop collectible
    /// tombstones and coalesce matching neighbours
    pub fn sweep(&mut self, min_seq: SeqNum, visit: &mut dyn FnMut(&mut Segment), collect: bool) {
        self.root.sweep(min_seq, visit, collect);
        loop {
            let collapsed = match &mut self.root {
                Node::Internal { children, .. } if children.len() <= 1 => {
                    children.pop().unwrap_or_else(Node::empty_leaf)
                }
                _ => break,
            };
            self.root = collapsed;
        }
    }

    /// In-order iterator over all segments, tombstones included
    pub fn iter(&self) -> Iter<'_> {
        Iter::new(&self.root)
    }

    #[cfg(test)]
    pub fn assert_consistent(&self, min_seq: SeqNum) {
        fn check(node: &Node, min_seq: SeqNum) -> Stats {
            let actual = match node {
                Node::Leaf { segments, .. } => segments
                    .iter()
                    .fold(Stats::default(), |acc, s| acc + Stats::of(s, min_seq)),
                Node::Internal { children, .. } => {
                    assert!(!children.is_empty(), "internal node without children");
                    children
                        .iter()
                        .fold(Stats::default(), |acc, c| acc + check(c, min_seq))
                }
            };
            let cached = node.stats();
            assert_eq!(cached.count, actual.count, "segment count drifted");
            // Cached classification may lag behind a newer min_seq, but
            // never claims more settled content than there is.
            assert!(cached.unsettled >= actual.unsettled);
            actual
        }
        check(&self.root, min_seq);
    }
}

/// Lazy in-order segment iterator
#[derive(Debug, Clone)]
pub(crate) struct Iter<'a> {
    stack: Vec<std::slice::Iter<'a, Node>>,
    leaf: std::slice::Iter<'a, Segment>,
}

impl<'a> Iter<'a> {
    fn new(root: &'a Node) -> Self {
        match root {
            Node::Leaf { segments, .. } => Self {
                stack: Vec::new(),
                leaf: segments.iter(),
            },
            Node::Internal { children, .. } => Self {
                stack: vec![children.iter()],
                leaf: Default::default(),
            },
        }
    }
}

impl<'a> Iterator for Iter<'a> {
    type Item = &'a Segment;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(segment) = self.leaf.next() {
                return Some(segment);
            }
            let top = self.stack.last_mut()?;
            match top.next() {
                Some(Node::Leaf { segments, .. }) => self.leaf = segments.iter(),
                Some(Node::Internal { children, .. }) => self.stack.push(children.iter()),
                None => {
                    self.stack.pop();
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crdt::merge_tree::{ClientId, PropertySet, Stamp};

    fn text(s: &str, seq: SeqNum) -> Segment {
        Segment::make_text(s, PropertySet::new(), Stamp::sequenced(seq, ClientId(0)))
    }

    fn collect_text(tree: &SegmentTree) -> String {
        tree.iter().filter_map(|s| s.text()).collect()
    }

    #[test]
    fn test_push_and_get() {
        let mut tree = SegmentTree::new();
        for i in 0..200 {
            tree.push(text(&format!("{},", i), 1), 0);
        }

        assert_eq!(tree.count(), 200);
        assert_eq!(tree.get(0).and_then(|s| s.text()), Some("0,"));
        assert_eq!(tree.get(199).and_then(|s| s.text()), Some("199,"));
        assert!(tree.get(200).is_none());
        tree.assert_consistent(0);
    }

    #[test]
    fn test_insert_in_middle_many_times() {
        let mut tree = SegmentTree::new();
        tree.push(text("a", 1), 0);
        tree.push(text("z", 1), 0);
        for _ in 0..500 {
            tree.insert(1, text("m", 1), 0);
        }

        let rendered = collect_text(&tree);
        assert_eq!(rendered.len(), 502);
        assert!(rendered.starts_with("am"));
        assert!(rendered.ends_with("mz"));
        tree.assert_consistent(0);
    }

    #[test]
    fn test_view_len_uses_settled_cache() {
        let mut tree = SegmentTree::new();
        tree.push(text("hello", 1), 1);
        tree.push(text("world", 5), 1);

        assert_eq!(tree.stats().unsettled, 1);
        assert_eq!(tree.stats().settled_len, 5);
        assert_eq!(tree.view_len(View::Local), 10);
        assert_eq!(tree.view_len(View::remote(4, ClientId(3))), 5);
    }

    #[test]
    fn test_locate_skips_zero_length() {
        let mut tree = SegmentTree::new();
        tree.push(text("ab", 1), 0);
        let mut removed = text("xx", 1);
        removed.mark_removed(Stamp::sequenced(2, ClientId(1)));
        tree.push(removed, 0);
        tree.push(text("cd", 1), 0);

        assert_eq!(
            tree.locate(2, View::Local),
            Some(Location { index: 2, offset: 0 })
        );
        assert_eq!(
            tree.locate(3, View::Local),
            Some(Location { index: 2, offset: 1 })
        );
        assert_eq!(
            tree.locate(4, View::Local),
            Some(Location { index: 3, offset: 0 })
        );
        assert_eq!(tree.locate(5, View::Local), None);

        // Before the removal the tombstone still counts
        assert_eq!(
            tree.locate(2, View::remote(1, ClientId(2))),
            Some(Location { index: 1, offset: 0 })
        );
    }

    #[test]
    fn test_prefix_len() {
        let mut tree = SegmentTree::new();
        for _ in 0..100 {
            tree.push(text("abc", 1), 0);
        }

        assert_eq!(tree.prefix_len(0, View::Local), 0);
        assert_eq!(tree.prefix_len(50, View::Local), 150);
        assert_eq!(tree.prefix_len(100, View::Local), 300);
    }

    #[test]
    fn test_split_at() {
        let mut tree = SegmentTree::new();
        tree.push(text("hello world", 1), 0);

        let loc = tree.locate(5, View::Local).unwrap();
        let boundary = tree.split_at(loc, 0);

        assert_eq!(boundary, 1);
        assert_eq!(tree.count(), 2);
        assert_eq!(tree.get(0).and_then(|s| s.text()), Some("hello"));
        assert_eq!(tree.get(1).and_then(|s| s.text()), Some(" world"));
    }

    #[test]
    fn test_sweep_collects_and_coalesces() {
        let mut tree = SegmentTree::new();
        for i in 0..100 {
            let mut seg = text("ab", 3);
            if i % 2 == 1 {
                seg.mark_removed(Stamp::sequenced(4, ClientId(1)));
            }
            tree.push(seg, 0);
        }
        assert_eq!(tree.stats().unsettled, 100);

        tree.sweep(3, &mut |_| {}, true);
        assert_eq!(tree.count(), 100, "removals above min_seq must survive");

        tree.sweep(4, &mut |_| {}, true);
        assert_eq!(tree.stats().collectible, 0);
        assert_eq!(tree.stats().unsettled, 0);
        assert_eq!(tree.view_len(View::Local), 100);
        assert!(tree.count() < 50, "identical neighbours should coalesce");
        tree.assert_consistent(4);
    }

    #[test]
    fn test_iter_is_restartable() {
        let mut tree = SegmentTree::new();
        for i in 0..100 {
            tree.push(text(&i.to_string(), 1), 0);
        }

        let first: Vec<_> = tree.iter().collect();
        let second: Vec<_> = tree.iter().collect();
        assert_eq!(first.len(), 100);
        assert_eq!(first, second);
    }
}
