//! Stamp: attribution of an insertion or removal with total ordering
//!
//! Every segment records who inserted it and, once tombstoned, who removed it.
//! Before the sequencer confirms a local edit the attribution is provisional;
//! `Stamp` keeps that state explicit so a local placeholder can never be
//! mistaken for a real sequence number.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// Sequence number assigned by the external sequencer
pub type SeqNum = u64;

/// Per-replica counter for local operations not yet acknowledged
pub type LocalSeq = u32;

/// Short numeric client identifier
///
/// Long client ids (strings handed out by the host) are interned by the
/// collaboration window roster. Short ids are replica-local: two replicas may
/// assign different short ids to the same long id, so they never leave the
/// process. Snapshots and wire messages always carry the long id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ClientId(pub u32);

impl std::fmt::Display for ClientId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Attribution of an insert or a remove
///
/// # Ordering
///
/// Stamps are ordered for insertion tie-breaks:
/// 1. `Universal` (content that predates collaboration) comes first
/// 2. `Sequenced` ordered by sequence number, then client id
/// 3. `Local` last, ordered by local sequence
///
/// Local edits sort after every sequenced edit because once the sequencer
/// orders them they receive a sequence number above everything this replica
/// has seen so far.
///
/// # Example
///
/// ```rust
/// use mergetree_core::crdt::merge_tree::{ClientId, Stamp};
///
/// let early = Stamp::sequenced(4, ClientId(2));
/// let late = Stamp::sequenced(5, ClientId(1));
/// let pending = Stamp::local(1);
///
/// assert!(Stamp::Universal < early);
/// assert!(early < late);
/// assert!(late < pending);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Stamp {
    /// Present before collaboration started, visible to every client
    Universal,

    /// Confirmed by the sequencer
    Sequenced { seq: SeqNum, client: ClientId },

    /// Applied locally, awaiting acknowledgment
    Local { local_seq: LocalSeq },
}

impl Stamp {
    pub fn sequenced(seq: SeqNum, client: ClientId) -> Self {
        Stamp::Sequenced { seq, client }
    }

    pub fn local(local_seq: LocalSeq) -> Self {
        Stamp::Local { local_seq }
    }

    pub fn is_local(&self) -> bool {
        matches!(self, Stamp::Local { .. })
    }

    /// Sequence number, if the sequencer has confirmed this stamp
    pub fn seq(&self) -> Option<SeqNum> {
        match self {
            Stamp::Sequenced { seq, .. } => Some(*seq),
            _ => None,
        }
    }

    pub fn client(&self) -> Option<ClientId> {
        match self {
            Stamp::Sequenced { client, .. } => Some(*client),
            _ => None,
        }
    }

    /// True once every client is known to have observed this stamp
    ///
    /// Settled stamps look the same from every view the protocol can still
    /// produce, which lets the tree cache their lengths and collect
    /// tombstones.
    pub fn is_settled(&self, min_seq: SeqNum) -> bool {
        match self {
            Stamp::Universal => true,
            Stamp::Sequenced { seq, .. } => *seq <= min_seq,
            Stamp::Local { .. } => false,
        }
    }

    /// Whether a client observing `view` has seen the edit carrying this stamp
    pub fn observed_by(&self, view: View) -> bool {
        match (self, view) {
            (Stamp::Universal, _) => true,
            (Stamp::Sequenced { .. }, View::Local) => true,
            (Stamp::Sequenced { seq, client }, View::Remote { ref_seq, client: viewer }) => {
                *seq <= ref_seq || *client == viewer
            }
            (Stamp::Local { .. }, View::Local) => true,
            (Stamp::Local { .. }, View::Remote { .. }) => false,
        }
    }

    fn rank(&self) -> u8 {
        match self {
            Stamp::Universal => 0,
            Stamp::Sequenced { .. } => 1,
            Stamp::Local { .. } => 2,
        }
    }
}

impl Ord for Stamp {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (
                Stamp::Sequenced { seq: a, client: ca },
                Stamp::Sequenced { seq: b, client: cb },
            ) => a.cmp(b).then(ca.cmp(cb)),
            (Stamp::Local { local_seq: a }, Stamp::Local { local_seq: b }) => a.cmp(b),
            _ => self.rank().cmp(&other.rank()),
        }
    }
}

impl PartialOrd for Stamp {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl std::fmt::Display for Stamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Stamp::Universal => write!(f, "universal"),
            Stamp::Sequenced { seq, client } => write!(f, "{}@{}", client, seq),
            Stamp::Local { local_seq } => write!(f, "local:{}", local_seq),
        }
    }
}

/// Perspective from which positions are interpreted
///
/// `Local` is this replica's own state, including unacknowledged edits.
/// `Remote` is the state a client had when it issued an operation: everything
/// sequenced at or below `ref_seq`, plus that client's own edits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum View {
    Local,
    Remote { ref_seq: SeqNum, client: ClientId },
}

impl View {
    pub fn remote(ref_seq: SeqNum, client: ClientId) -> Self {
        View::Remote { ref_seq, client }
    }
}
